//! `gdbctl`: run one GDB session from the command line.

use std::path::PathBuf;

use clap::Parser;
use gdbcontrol::process::install_signal_protection;
use gdbcontrol::{ControlEvent, DebuggerSession, GdbControl, SessionConfig, SessionKind};
use tokio::sync::mpsc;

/// Start GDB, run the debuggee and shut everything down again.
#[derive(Parser, Debug)]
#[command(name = "gdbctl", version, about = "Drive a GDB session over MI", long_about = None)]
struct Args {
    /// JSON session configuration; flags override its fields
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to the GDB executable
    #[arg(long)]
    gdb: Option<PathBuf>,

    /// Session kind: run, attach, core or remote
    #[arg(long)]
    kind: Option<SessionKind>,

    /// Seconds to wait for GDB's prompt
    #[arg(long)]
    timeout: Option<u64>,

    #[arg(long, default_value = "1")]
    session_id: String,

    #[arg(long, default_value = "info")]
    log_level: log::LevelFilter,

    /// Program to debug
    program: Option<PathBuf>,
}

fn build_config(args: &Args) -> gdbcontrol::Result<SessionConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let json = std::fs::read_to_string(path).map_err(|e| {
                gdbcontrol::ControlError::InvalidConfig(format!("{}: {}", path.display(), e))
            })?;
            SessionConfig::from_json_str(&json)?
        }
        None => SessionConfig::default(),
    };

    if let Some(gdb) = &args.gdb {
        config.gdb_path = gdb.clone();
    }
    if let Some(kind) = args.kind {
        config.kind = kind;
    }
    if let Some(secs) = args.timeout {
        config.launch_timeout_ms = secs.saturating_mul(1000);
    }
    if args.program.is_some() {
        config.program = args.program.clone();
    }
    if config.program.is_none() && !config.gdb_args.iter().any(|a| a.starts_with("--interpreter")) {
        config.gdb_args.extend(["--interpreter".to_string(), "mi".to_string()]);
    }

    config.validate()?;
    Ok(config)
}

async fn run(session_id: String, config: SessionConfig) -> i32 {
    let start = match config.kind {
        SessionKind::Run => config.program.is_some(),
        SessionKind::Remote => true,
        SessionKind::Attach | SessionKind::Core => false,
    };
    let control = GdbControl::with_tokio_spawner(DebuggerSession::new(session_id, config));

    let (exit_tx, mut exit_rx) = mpsc::unbounded_channel();
    control.events().add_listener(move |event| {
        if let ControlEvent::Exited { exit_code, .. } = event {
            let _ = exit_tx.send(*exit_code);
        }
    });

    if let Err(e) = control.initialize().await {
        log::error!("{e}");
        return 1;
    }

    if start {
        if let Err(e) = control.start_program().await {
            log::warn!("Failed to start program: {e}");
        }
    }

    tokio::select! {
        code = exit_rx.recv() => {
            log::info!("GDB exited with code {:?}", code);
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("Interrupted, terminating GDB");
            let outcome = control.terminate().await;
            log::info!("Terminate finished: {:?}", outcome);
        }
    }

    for failure in control.shutdown().await {
        log::warn!("Shutdown step '{}' failed: {}", failure.step, failure.error);
    }
    control.exit_code().unwrap_or(0)
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Warn)
        .with_module_level("gdbctl", args.log_level)
        .with_module_level("gdbcontrol", args.log_level)
        .init()
    {
        eprintln!("Failed to initialize logging: {e}");
    }

    log::info!("gdbctl starting...");
    install_signal_protection();

    let config = match build_config(&args) {
        Ok(config) => config,
        Err(e) => {
            log::error!("{e}");
            std::process::exit(1);
        }
    };

    let exit_code = run(args.session_id, config).await;
    log::info!("gdbctl exited with code: {exit_code}");
    std::process::exit(exit_code);
}
