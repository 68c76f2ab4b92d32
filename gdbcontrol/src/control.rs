//! The GDB controller
//!
//! [`GdbControl`] is the handle front ends hold. All mutable session state
//! lives in `ControlState`, owned by the session's serialized executor;
//! the handle and its background tasks reach it only by posting jobs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};

use tokio::io::BufReader;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::channel::MiChannel;
use crate::commands::MiCommand;
use crate::completion::Completion;
use crate::dispatch::{CommandDispatch, CommandFuture, DispatchError};
use crate::events::{ControlEvent, EventBus, ListenerId};
use crate::executor::{Executor, ScheduledJob, WeakExecutor};
use crate::inferior::{InferiorProcess, InferiorState};
use crate::launcher::LaunchedProcess;
use crate::monitor::ExitMonitor;
use crate::process::{ProcessHandle, ProcessReader, ProcessSpawner, ProcessWriter, TokioSpawner};
use crate::record::{AsyncClass, AsyncRecord, MiResult};
use crate::sequence::{Sequence, Step, StepFailure};
use crate::session::{DebuggerSession, SessionContext, SessionKind};
use crate::steps;
use crate::{ControlError, Result};

/// Which console adapter the front end should put on top of MI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsoleMode {
    /// CLI commands go through `-interpreter-exec console`
    Enhanced,
    #[default]
    Basic,
}

/// How a `terminate` request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// GDB answered `-gdb-exit`
    QuitAcknowledged,
    /// `-gdb-exit` failed; `destroyed` tells whether GDB was killed instead
    QuitFailed { destroyed: bool },
    /// GDB did not answer in time and was killed
    GraceExpired,
}

/// What the controller currently holds on to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceSnapshot {
    pub process: bool,
    pub monitor: bool,
    pub command_stream: bool,
    pub processors: bool,
    pub registered: bool,
}

impl ResourceSnapshot {
    pub fn is_released(&self) -> bool {
        *self == Self::default()
    }
}

/// State readable from any task without going through the executor.
pub(crate) struct ControlShared {
    pub(crate) session: DebuggerSession,
    pub(crate) context: SessionContext,
    pub(crate) spawner: Arc<dyn ProcessSpawner>,
    pub(crate) events: EventBus,
    pub(crate) exit: Arc<OnceLock<i32>>,
    connected: AtomicBool,
    disconnected: AtomicBool,
    can_interrupt: AtomicBool,
    active: AtomicBool,
    started: AtomicBool,
    inferior: Mutex<Option<Arc<InferiorProcess>>>,
    sequence: tokio::sync::Mutex<Option<Sequence<GdbControl>>>,
}

impl ControlShared {
    pub(crate) fn is_exited(&self) -> bool {
        self.exit.get().is_some()
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn inferior(&self) -> Option<Arc<InferiorProcess>> {
        self.inferior
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn inferior_state(&self) -> Option<InferiorState> {
        self.inferior().map(|inferior| inferior.state())
    }

    pub(crate) fn is_connected(&self) -> bool {
        if self.is_exited() || self.disconnected.load(Ordering::SeqCst) {
            return false;
        }
        let alive = self
            .inferior_state()
            .map_or(false, |state| state != InferiorState::Terminated);
        alive && self.connected.load(Ordering::SeqCst)
    }

    fn set_connected(&self) {
        if !self.disconnected.load(Ordering::SeqCst) {
            self.connected.store(true, Ordering::SeqCst);
        }
    }

    /// Connectivity never comes back once cleared.
    fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }
}

/// Session state owned by the executor.
pub(crate) struct ControlState {
    pub(crate) shared: Arc<ControlShared>,
    pub(crate) executor: WeakExecutor<ControlState>,
    pub(crate) process: Option<Arc<ProcessHandle>>,
    pub(crate) streams: Option<(ProcessWriter, BufReader<ProcessReader>)>,
    pub(crate) monitor: Option<ExitMonitor>,
    pub(crate) channel: Option<Arc<MiChannel>>,
    notifications: Option<mpsc::UnboundedReceiver<AsyncRecord>>,
    processor: Option<JoinHandle<()>>,
    pub(crate) enhanced_console: bool,
    console_mode: ConsoleMode,
    pub(crate) features: Vec<String>,
    listener: Option<ListenerId>,
}

/// A handle that reaches the controller without keeping it alive.
#[derive(Clone)]
pub(crate) struct WeakControl {
    pub(crate) shared: Weak<ControlShared>,
    pub(crate) executor: WeakExecutor<ControlState>,
}

impl WeakControl {
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self {
            shared: Weak::new(),
            executor: WeakExecutor::dangling(),
        }
    }
}

/// Controls one GDB process for one debugging session.
///
/// Cloning is cheap; every clone drives the same session. Must be created
/// inside a tokio runtime.
#[derive(Clone)]
pub struct GdbControl {
    pub(crate) shared: Arc<ControlShared>,
    pub(crate) executor: Executor<ControlState>,
}

impl GdbControl {
    pub fn new(session: DebuggerSession, spawner: Arc<dyn ProcessSpawner>) -> Self {
        let shared = Arc::new(ControlShared {
            context: session.context(),
            session,
            spawner,
            events: EventBus::new(),
            exit: Arc::new(OnceLock::new()),
            connected: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
            can_interrupt: AtomicBool::new(false),
            active: AtomicBool::new(false),
            started: AtomicBool::new(false),
            inferior: Mutex::new(None),
            sequence: tokio::sync::Mutex::new(None),
        });

        let executor = Executor::spawn("gdb-control", {
            let shared = shared.clone();
            move |executor| ControlState {
                shared,
                executor,
                process: None,
                streams: None,
                monitor: None,
                channel: None,
                notifications: None,
                processor: None,
                enhanced_console: false,
                console_mode: ConsoleMode::Basic,
                features: Vec::new(),
                listener: None,
            }
        });

        Self { shared, executor }
    }

    /// A controller that starts real GDB processes.
    pub fn with_tokio_spawner(session: DebuggerSession) -> Self {
        Self::new(session, Arc::new(TokioSpawner))
    }

    pub(crate) fn downgrade(&self) -> WeakControl {
        WeakControl {
            shared: Arc::downgrade(&self.shared),
            executor: self.executor.downgrade(),
        }
    }

    pub fn context(&self) -> &SessionContext {
        &self.shared.context
    }

    pub fn session(&self) -> &DebuggerSession {
        &self.shared.session
    }

    pub fn events(&self) -> &EventBus {
        &self.shared.events
    }

    /// Launch GDB and bring the session up.
    ///
    /// On failure everything that was started is torn down again before
    /// the error is returned. A controller initializes at most once.
    pub async fn initialize(&self) -> Result<()> {
        self.shared.session.config().validate()?;
        let mut slot = self.shared.sequence.lock().await;
        if self.shared.started.swap(true, Ordering::SeqCst) {
            return Err(ControlError::InvalidState(
                "controller was already initialized".into(),
            ));
        }

        log::info!("Initializing {}", self.shared.context.control_id);
        let mut sequence = Sequence::new("gdb-control", steps::startup_steps());
        match sequence.initialize(self.clone()).await {
            Ok(()) => {
                log::info!("{} is ready", self.shared.context.control_id);
                *slot = Some(sequence);
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to initialize {}: {}", self.shared.context.control_id, e);
                Err(e)
            }
        }
    }

    /// Tear the session down in reverse start order.
    ///
    /// Completes immediately when the controller is not initialized. Step
    /// failures are returned but never stop the remaining steps.
    pub async fn shutdown(&self) -> Vec<StepFailure> {
        let mut slot = self.shared.sequence.lock().await;
        let Some(mut sequence) = slot.take() else {
            return Vec::new();
        };
        log::info!("Shutting down {}", self.shared.context.control_id);
        let failures = sequence.shutdown(self.clone()).await;
        log::info!(
            "{} shut down ({} step failure(s))",
            self.shared.context.control_id,
            failures.len()
        );
        failures
    }

    /// Interrupt GDB if the platform allows it. Never fails.
    pub async fn interrupt(&self) {
        if self.executor.call(|state| state.interrupt_process()).await.is_err() {
            log::debug!("Interrupt ignored, controller is gone");
        }
    }

    /// Kill GDB if the platform allows it. Never fails.
    pub async fn destroy(&self) {
        if self.executor.call(|state| state.destroy_process()).await.is_err() {
            log::debug!("Destroy ignored, controller is gone");
        }
    }

    /// Ask GDB to quit, killing it if it does not answer within the grace
    /// period. `done` is called exactly once.
    pub fn terminate_with<F>(&self, done: F)
    where
        F: FnOnce(TerminateOutcome) + Send + 'static,
    {
        let completion = Completion::new(done);
        let fallback = completion.clone();
        if !self
            .executor
            .execute(move |state| state.begin_terminate(completion))
        {
            fallback.complete(TerminateOutcome::QuitFailed { destroyed: false });
        }
    }

    pub async fn terminate(&self) -> TerminateOutcome {
        let (tx, rx) = oneshot::channel();
        self.terminate_with(move |outcome| {
            let _ = tx.send(outcome);
        });
        rx.await
            .unwrap_or(TerminateOutcome::QuitFailed { destroyed: false })
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    pub fn is_exited(&self) -> bool {
        self.shared.is_exited()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.shared.exit.get().copied()
    }

    pub fn can_interrupt(&self) -> bool {
        self.shared.can_interrupt.load(Ordering::SeqCst)
    }

    pub fn can_restart(&self) -> bool {
        self.shared.session.kind() == SessionKind::Run
    }

    pub fn inferior(&self) -> Option<Arc<InferiorProcess>> {
        self.shared.inferior()
    }

    pub async fn console_mode(&self) -> ConsoleMode {
        self.executor
            .call(|state| state.console_mode)
            .await
            .unwrap_or_default()
    }

    /// Features GDB reported at startup.
    pub async fn features(&self) -> Vec<String> {
        self.executor
            .call(|state| state.features.clone())
            .await
            .unwrap_or_default()
    }

    pub async fn resources(&self) -> ResourceSnapshot {
        self.executor
            .call(|state| state.resources())
            .await
            .unwrap_or_default()
    }

    /// Send `command` to GDB and wait for its result.
    pub async fn queue_command(&self, command: MiCommand) -> Result<MiResult> {
        let reply = self
            .executor
            .call(move |state| state.channel.as_ref().map(|c| c.queue_command(command)))
            .await?
            .ok_or(ControlError::NotConnected)?;
        Ok(reply.await?)
    }

    /// Set environment variables for the debuggee, optionally clearing the
    /// inherited environment first.
    pub async fn set_environment<I, K, V>(&self, vars: I, clear: bool) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: Vec<(String, String)> = vars
            .into_iter()
            .map(|(name, value)| (name.into(), value.into()))
            .collect();

        let replies = self
            .executor
            .call(move |state| {
                let channel = state.channel.clone()?;
                let mut replies = Vec::with_capacity(vars.len() + 1);
                if clear {
                    replies.push(channel.queue_command(MiCommand::unset_environment()));
                }
                for (name, value) in &vars {
                    replies.push(channel.queue_command(MiCommand::set_environment(name, value)));
                }
                Some(replies)
            })
            .await?
            .ok_or(ControlError::NotConnected)?;

        let mut first_error: Option<DispatchError> = None;
        for reply in replies {
            if let Err(e) = reply.await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Start the debuggee: stop at `stop_at` if configured, then run it.
    pub async fn start_program(&self) -> Result<()> {
        let config = self.shared.session.config();
        let run = match config.kind {
            SessionKind::Attach => return Ok(()),
            SessionKind::Core => {
                return Err(ControlError::InvalidState(
                    "a core session has no program to start".into(),
                ))
            }
            SessionKind::Remote => MiCommand::exec_continue(),
            SessionKind::Run => MiCommand::exec_run(),
        };

        let mut steps = Vec::new();
        if let Some(location) = config.stop_at.clone() {
            steps.push(Step::initialize_only("stop-at", move |ctrl: GdbControl| {
                let command = MiCommand::break_insert_temporary(&location);
                async move { ctrl.queue_command(command).await.map(drop) }
            }));
        }
        steps.push(Step::initialize_only("run", move |ctrl: GdbControl| {
            let command = run.clone();
            async move { ctrl.queue_command(command).await.map(drop) }
        }));

        Sequence::new("start-program", steps)
            .initialize(self.clone())
            .await
    }
}

impl ControlState {
    pub(crate) fn adopt_process(&mut self, launched: LaunchedProcess) {
        let LaunchedProcess {
            process,
            stdin,
            stdout,
            ..
        } = launched;
        let handle = Arc::new(ProcessHandle::new(process, self.shared.exit.clone()));
        self.shared
            .can_interrupt
            .store(handle.supports_interrupt(), Ordering::SeqCst);
        log::debug!("Adopted GDB process {:?}", handle.pid());
        self.process = Some(handle);
        self.streams = Some((stdin, stdout));
    }

    pub(crate) fn start_command_stream(&mut self) -> Result<()> {
        let (stdin, stdout) = self
            .streams
            .take()
            .ok_or_else(|| ControlError::Wiring("GDB streams are not available".into()))?;
        let (channel, notifications) = MiChannel::start(stdout, stdin);
        self.channel = Some(Arc::new(channel));
        self.notifications = Some(notifications);
        Ok(())
    }

    pub(crate) fn stop_command_stream(&mut self) {
        self.notifications = None;
        if let Some(channel) = self.channel.take() {
            channel.stop();
        }
    }

    pub(crate) fn wire_processors(&mut self, control: WeakControl) -> Result<()> {
        if self.shared.is_exited() {
            return Err(ControlError::ProcessExited);
        }
        let notifications = self
            .notifications
            .take()
            .ok_or_else(|| ControlError::Wiring("async record stream is not available".into()))?;

        let inferior = Arc::new(InferiorProcess::new(self.shared.session.kind(), control));
        self.processor = Some(tokio::spawn(process_notifications(
            notifications,
            self.executor.clone(),
        )));
        self.console_mode = if self.enhanced_console {
            ConsoleMode::Enhanced
        } else {
            ConsoleMode::Basic
        };
        log::debug!("Using {:?} console", self.console_mode);

        *self
            .shared
            .inferior
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(inferior);
        self.shared.set_connected();
        Ok(())
    }

    pub(crate) fn unwire_processors(&mut self) {
        if let Some(processor) = self.processor.take() {
            processor.abort();
        }
        self.shared.disconnect();
        let inferior = self
            .shared
            .inferior
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(inferior) = inferior {
            inferior.dispose();
        }
    }

    pub(crate) fn register(&mut self) -> Result<()> {
        if self.shared.is_exited() {
            return Err(ControlError::ProcessExited);
        }
        let executor = self.executor.clone();
        let listener = self.shared.events.add_listener(move |event| {
            if let ControlEvent::Exited { .. } = event {
                if let Some(executor) = executor.upgrade() {
                    executor.execute(|state| state.stop_command_processing());
                }
            }
        });
        self.listener = Some(listener);
        self.shared.active.store(true, Ordering::SeqCst);

        log::info!("Session {} started", self.shared.context.session_id);
        self.shared
            .events
            .dispatch(&ControlEvent::Started(self.shared.context.clone()));
        Ok(())
    }

    pub(crate) fn unregister(&mut self) {
        if let Some(listener) = self.listener.take() {
            self.shared.events.remove_listener(listener);
        }
        self.shared.active.store(false, Ordering::SeqCst);
    }

    /// The exit has already been recorded on the process handle.
    pub(crate) fn on_debugger_exited(&mut self, exit_code: i32) {
        log::info!(
            "GDB for session {} exited with code {}",
            self.shared.context.session_id,
            exit_code
        );
        self.shared.disconnect();
        if let Some(inferior) = self.shared.inferior() {
            inferior.set_state(InferiorState::Terminated);
        }
        self.shared.events.dispatch(&ControlEvent::Exited {
            context: self.shared.context.clone(),
            exit_code,
        });
    }

    fn stop_command_processing(&mut self) {
        if let Some(channel) = &self.channel {
            log::debug!("Stopping command processing");
            channel.stop();
        }
    }

    fn on_notification(&mut self, record: AsyncRecord) {
        let Some(inferior) = self.shared.inferior() else {
            return;
        };
        match record.class {
            AsyncClass::Running | AsyncClass::ThreadGroupStarted => {
                inferior.set_state(InferiorState::Running);
            }
            AsyncClass::Stopped => {
                inferior.set_state(InferiorState::Stopped);
            }
            AsyncClass::ThreadGroupExited => {
                let code = record
                    .field("exit-code")
                    .and_then(|code| i32::from_str_radix(&code, 8).ok());
                inferior.mark_exited(code);
                self.shared.disconnect();

                let config = self.shared.session.config();
                if config.auto_terminate && config.kind != SessionKind::Remote {
                    log::info!("Debuggee exited, terminating GDB");
                    self.begin_terminate(Completion::new(|outcome| {
                        log::debug!("Automatic terminate finished: {:?}", outcome);
                    }));
                }
            }
            AsyncClass::Other(_) => {}
        }
    }

    pub(crate) fn interrupt_process(&self) {
        let Some(process) = &self.process else {
            return;
        };
        if process.is_exited() {
            return;
        }
        if !process.supports_interrupt() {
            log::debug!("GDB process cannot be interrupted on this platform");
            return;
        }
        if let Err(e) = process.interrupt() {
            log::warn!("Failed to interrupt GDB: {}", e);
        }
    }

    pub(crate) fn destroy_process(&self) {
        if let Some(process) = &self.process {
            if let Err(e) = process.destroy() {
                log::warn!("Failed to destroy GDB process {:?}: {}", process.pid(), e);
            }
        }
    }

    /// Destroy GDB unless it is already gone. Returns whether it was killed.
    fn destroy_if_running(&self) -> bool {
        match &self.process {
            Some(process) if process.poll_exit().is_none() => {
                log::warn!("Destroying GDB process {:?}", process.pid());
                self.destroy_process();
                true
            }
            _ => false,
        }
    }

    fn begin_terminate(&mut self, completion: Completion<TerminateOutcome>) {
        let Some(executor) = self.executor.upgrade() else {
            completion.complete(TerminateOutcome::QuitFailed { destroyed: false });
            return;
        };

        if self.shared.inferior_state() == Some(InferiorState::Running) {
            self.interrupt_process();
        }

        let grace = self.shared.session.config().terminate_grace();
        let timer = {
            let completion = completion.clone();
            executor.schedule(grace, move |state| {
                if completion.is_pending() {
                    log::warn!("GDB did not quit within {:?}", grace);
                    state.destroy_process();
                    completion.complete(TerminateOutcome::GraceExpired);
                }
            })
        };

        let Some(channel) = self.channel.clone() else {
            timer.cancel();
            let destroyed = self.destroy_if_running();
            completion.complete(TerminateOutcome::QuitFailed { destroyed });
            return;
        };

        let reply = channel.queue_command(MiCommand::gdb_exit());
        let weak = self.executor.clone();
        tokio::spawn(async move {
            let result = reply.await;
            let fallback = completion.clone();
            let posted = weak.upgrade().map_or(false, |executor| {
                executor.execute(move |state| state.finish_terminate(result, timer, completion))
            });
            if !posted {
                fallback.complete(TerminateOutcome::QuitFailed { destroyed: false });
            }
        });
    }

    fn finish_terminate(
        &mut self,
        result: std::result::Result<MiResult, DispatchError>,
        timer: ScheduledJob,
        completion: Completion<TerminateOutcome>,
    ) {
        if !completion.is_pending() {
            log::debug!("Ignoring late -gdb-exit reply");
            return;
        }
        timer.cancel();
        let outcome = match result {
            Ok(_) => TerminateOutcome::QuitAcknowledged,
            Err(e) => {
                log::warn!("-gdb-exit failed: {}", e);
                TerminateOutcome::QuitFailed {
                    destroyed: self.destroy_if_running(),
                }
            }
        };
        completion.complete(outcome);
    }

    /// Decide how GDB should get rid of the inferior, and start doing it.
    pub(crate) fn plan_inferior_destroy(&mut self) -> Option<(MiCommand, CommandFuture)> {
        let inferior = self.shared.inferior()?;
        let state = inferior.state();
        let command = match self.shared.session.kind() {
            SessionKind::Attach if self.shared.is_connected() => MiCommand::target_detach(),
            SessionKind::Run if state != InferiorState::Terminated => MiCommand::kill_inferior(),
            kind => {
                log::debug!("Nothing to destroy for {} session in state {:?}", kind, state);
                return None;
            }
        };
        if state == InferiorState::Running {
            self.interrupt_process();
        }
        let channel = self.channel.as_ref()?;
        let reply = channel.queue_command(command.clone());
        Some((command, reply))
    }

    fn resources(&self) -> ResourceSnapshot {
        ResourceSnapshot {
            process: self.process.is_some(),
            monitor: self.monitor.as_ref().map_or(false, ExitMonitor::is_running),
            command_stream: self.channel.as_ref().map_or(false, |c| c.is_running()),
            processors: self.processor.as_ref().map_or(false, |p| !p.is_finished()),
            registered: self.listener.is_some() || self.shared.is_active(),
        }
    }
}

async fn process_notifications(
    mut records: mpsc::UnboundedReceiver<AsyncRecord>,
    executor: WeakExecutor<ControlState>,
) {
    while let Some(record) = records.recv().await {
        let Some(executor) = executor.upgrade() else {
            break;
        };
        executor.execute(move |state| state.on_notification(record));
    }
    log::debug!("Async record processor finished");
}
