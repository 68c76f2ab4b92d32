//! Starting GDB and waiting for it to become ready.

use std::io;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use crate::completion::Completion;
use crate::process::{DebuggerProcess, ProcessReader, ProcessSpawner, ProcessWriter};
use crate::session::SessionConfig;
use crate::{ControlError, Result};

/// Build the command line GDB is started with.
pub fn command_line(config: &SessionConfig) -> Vec<String> {
    let mut command_line = vec![config.gdb_path.to_string_lossy().into_owned()];
    command_line.extend(config.gdb_args.iter().cloned());
    if let Some(program) = &config.program {
        command_line.push("--interpreter".to_string());
        command_line.push("mi".to_string());
        command_line.push(program.to_string_lossy().into_owned());
    }
    command_line
}

/// Read lines until one ends with `marker`.
///
/// Returns the reader positioned right after the prompt line, or `None` if
/// the stream ended first.
pub async fn wait_for_prompt<R>(mut reader: BufReader<R>, marker: &str) -> io::Result<Option<BufReader<R>>>
where
    R: AsyncRead + Unpin,
{
    let marker = marker.trim_end();
    let mut raw = Vec::new();
    loop {
        raw.clear();
        if reader.read_until(b'\n', &mut raw).await? == 0 {
            return Ok(None);
        }
        let line = String::from_utf8_lossy(&raw);
        let trimmed = line.trim_end();
        log::trace!("GDB banner: {}", trimmed);
        if trimmed.ends_with(marker) {
            return Ok(Some(reader));
        }
    }
}

/// A GDB process that printed its ready prompt.
pub struct LaunchedProcess {
    pub process: Box<dyn DebuggerProcess>,
    pub stdin: ProcessWriter,
    pub stdout: BufReader<ProcessReader>,
    pub command_line: Vec<String>,
}

impl std::fmt::Debug for LaunchedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchedProcess")
            .field("pid", &self.process.id())
            .field("command_line", &self.command_line)
            .finish()
    }
}

enum Readiness {
    Ready(BufReader<ProcessReader>),
    Closed,
    Failed(io::Error),
    TimedOut,
}

/// Spawn GDB and wait for its ready prompt, at most `launch_timeout`.
///
/// A process that never becomes ready is destroyed before the error is
/// returned.
pub async fn launch(spawner: &dyn ProcessSpawner, config: &SessionConfig) -> Result<LaunchedProcess> {
    let command_line = command_line(config);
    let joined = command_line.join(" ");
    log::info!("Launching GDB: {}", joined);

    let mut process = spawner.spawn(&command_line).map_err(|source| ControlError::Launch {
        command_line: joined.clone(),
        source,
    })?;

    let (stdin, stdout) = match (process.take_stdin(), process.take_stdout()) {
        (Some(stdin), Some(stdout)) => (stdin, stdout),
        _ => {
            destroy_unready(process.as_mut());
            return Err(ControlError::Wiring(
                "GDB process has no stdin/stdout pipes".into(),
            ));
        }
    };

    let (ready, outcome) = Completion::channel();
    let marker = config.ready_prompt.clone();

    let reader = {
        let ready = ready.clone();
        tokio::spawn(async move {
            let readiness = match wait_for_prompt(BufReader::new(stdout), &marker).await {
                Ok(Some(reader)) => Readiness::Ready(reader),
                Ok(None) => Readiness::Closed,
                Err(e) => Readiness::Failed(e),
            };
            ready.complete(readiness);
        })
    };
    let timeout = config.launch_timeout();
    let timer = tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        if ready.complete(Readiness::TimedOut) {
            log::debug!("Launch timer fired after {:?}", timeout);
        }
    });

    let readiness = outcome.await.unwrap_or(Readiness::Closed);
    reader.abort();
    timer.abort();

    match readiness {
        Readiness::Ready(stdout) => {
            log::info!("GDB is ready (pid {:?})", process.id());
            Ok(LaunchedProcess {
                process,
                stdin,
                stdout,
                command_line,
            })
        }
        Readiness::TimedOut => {
            log::error!("GDB did not print its prompt within {:?}", timeout);
            destroy_unready(process.as_mut());
            Err(ControlError::LaunchTimeout {
                command_line: joined,
                timeout,
            })
        }
        Readiness::Closed => {
            log::error!("GDB closed its output before printing the prompt");
            destroy_unready(process.as_mut());
            Err(ControlError::LaunchAborted { command_line: joined })
        }
        Readiness::Failed(source) => {
            log::error!("Reading GDB output failed: {}", source);
            destroy_unready(process.as_mut());
            Err(ControlError::Wiring(format!(
                "reading output of '{}' failed: {}",
                joined, source
            )))
        }
    }
}

fn destroy_unready(process: &mut dyn DebuggerProcess) {
    if let Err(e) = process.destroy() {
        log::warn!("Failed to destroy GDB process {:?}: {}", process.id(), e);
    }
}
