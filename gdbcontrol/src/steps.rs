//! The controller's startup steps, in start order.
//!
//! Each init/shutdown pair runs off the executor and uses `call` whenever it
//! needs to touch session state.

use std::sync::Arc;

use crate::commands::MiCommand;
use crate::control::GdbControl;
use crate::launcher;
use crate::monitor::ExitMonitor;
use crate::probe;
use crate::sequence::Step;
use crate::session::SessionKind;
use crate::{ControlError, Result};

pub(crate) fn startup_steps() -> Vec<Step<GdbControl>> {
    vec![
        Step::new("gdb-process", start_process, stop_process),
        Step::new("exit-monitor", start_monitor, stop_monitor),
        Step::new("command-stream", start_command_stream, stop_command_stream),
        Step::initialize_only("console-probe", probe_console),
        Step::new("command-processors", start_processors, stop_processors),
        Step::new("register", register, unregister),
    ]
}

async fn start_process(ctrl: GdbControl) -> Result<()> {
    let launched = launcher::launch(ctrl.shared.spawner.as_ref(), ctrl.shared.session.config()).await?;
    ctrl.executor
        .call(move |state| state.adopt_process(launched))
        .await
}

async fn stop_process(ctrl: GdbControl) -> Result<()> {
    let process = ctrl
        .executor
        .call(|state| {
            state.streams = None;
            state.process.take()
        })
        .await?;
    let Some(process) = process else {
        return Ok(());
    };

    let wait = ctrl.shared.session.config().destroy_wait();
    match process.destroy_and_reap(wait).await {
        Some(code) => {
            if process.record_exit(code) {
                ctrl.executor
                    .call(move |state| state.on_debugger_exited(code))
                    .await?;
            }
            Ok(())
        }
        None => Err(ControlError::InvalidState(format!(
            "GDB process {:?} did not exit after being destroyed",
            process.pid()
        ))),
    }
}

async fn start_monitor(ctrl: GdbControl) -> Result<()> {
    let (process, executor) = ctrl
        .executor
        .call(|state| (state.process.as_ref().map(Arc::downgrade), state.executor.clone()))
        .await?;
    let process = process.ok_or_else(|| ControlError::Wiring("no GDB process to monitor".into()))?;

    let poll = ctrl.shared.session.config().exit_poll();
    let monitor = ExitMonitor::start(process, poll, move |code| {
        if let Some(executor) = executor.upgrade() {
            executor.execute(move |state| state.on_debugger_exited(code));
        }
    })
    .await?;

    ctrl.executor
        .call(move |state| state.monitor = Some(monitor))
        .await
}

async fn stop_monitor(ctrl: GdbControl) -> Result<()> {
    if let Some(monitor) = ctrl.executor.call(|state| state.monitor.take()).await? {
        monitor.stop().await;
    }
    Ok(())
}

async fn start_command_stream(ctrl: GdbControl) -> Result<()> {
    ctrl.executor
        .call(|state| state.start_command_stream())
        .await?
}

async fn stop_command_stream(ctrl: GdbControl) -> Result<()> {
    ctrl.executor
        .call(|state| state.stop_command_stream())
        .await
}

async fn probe_console(ctrl: GdbControl) -> Result<()> {
    let channel = ctrl
        .executor
        .call(|state| state.channel.clone())
        .await?
        .ok_or_else(|| ControlError::Wiring("command stream is not wired".into()))?;

    let enhanced = probe::probe_enhanced_console(channel.as_ref()).await;
    let features = probe::list_features(channel.as_ref()).await;

    ctrl.executor
        .call(move |state| {
            state.enhanced_console = enhanced;
            state.features = features;
        })
        .await
}

async fn start_processors(ctrl: GdbControl) -> Result<()> {
    let config = ctrl.shared.session.config();
    if let (Some(tty), SessionKind::Run | SessionKind::Core) = (&config.inferior_tty, config.kind) {
        match ctrl.queue_command(MiCommand::inferior_tty_set(tty)).await {
            Ok(_) => log::debug!("Inferior terminal set to {}", tty),
            Err(e) => log::debug!("Inferior will share GDB's terminal: {}", e),
        }
    }

    let control = ctrl.downgrade();
    ctrl.executor
        .call(move |state| state.wire_processors(control))
        .await?
}

async fn stop_processors(ctrl: GdbControl) -> Result<()> {
    ctrl.executor
        .call(|state| state.unwire_processors())
        .await
}

async fn register(ctrl: GdbControl) -> Result<()> {
    ctrl.executor.call(|state| state.register()).await?
}

async fn unregister(ctrl: GdbControl) -> Result<()> {
    ctrl.executor.call(|state| state.unregister()).await
}
