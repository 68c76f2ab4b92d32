//! Background watch on the GDB process.
//!
//! The monitor polls the process for an exit status and reports the first
//! exit it sees. It only holds a weak reference, so it never keeps the
//! process alive and never destroys it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;

use crate::process::ProcessHandle;
use crate::{ControlError, Result};

struct MonitorFlags {
    killed: AtomicBool,
    finished: AtomicBool,
    wake: Notify,
}

pub struct ExitMonitor {
    process: Weak<ProcessHandle>,
    flags: Arc<MonitorFlags>,
    task: JoinHandle<()>,
}

impl ExitMonitor {
    /// Start watching `process` and return once the watch loop is running.
    ///
    /// `on_exit` runs at most once, for the caller that recorded the exit.
    pub async fn start<F>(process: Weak<ProcessHandle>, poll: Duration, on_exit: F) -> Result<Self>
    where
        F: FnOnce(i32) + Send + 'static,
    {
        let flags = Arc::new(MonitorFlags {
            killed: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            wake: Notify::new(),
        });
        let (started_tx, started_rx) = oneshot::channel();

        let task = tokio::spawn(Self::run(
            process.clone(),
            flags.clone(),
            poll,
            started_tx,
            on_exit,
        ));

        started_rx
            .await
            .map_err(|_| ControlError::InvalidState("exit monitor failed to start".into()))?;

        Ok(Self {
            process,
            flags,
            task,
        })
    }

    async fn run<F>(
        process: Weak<ProcessHandle>,
        flags: Arc<MonitorFlags>,
        poll: Duration,
        started: oneshot::Sender<()>,
        on_exit: F,
    ) where
        F: FnOnce(i32) + Send + 'static,
    {
        log::debug!("Exit monitor started");
        let _ = started.send(());

        loop {
            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                _ = flags.wake.notified() => {}
            }

            let Some(handle) = process.upgrade() else {
                log::debug!("GDB process handle released, exit monitor stopping");
                break;
            };

            let polled = {
                let mut guard = handle.lock();
                match guard.try_exit_code() {
                    // Recorded while holding the lock so kill() sees it.
                    Ok(Some(code)) => Some((code, handle.record_exit(code))),
                    Ok(None) => None,
                    Err(e) => {
                        log::warn!("Failed to poll GDB process: {}", e);
                        None
                    }
                }
            };

            match polled {
                Some((code, first)) => {
                    log::info!("GDB process exited with code {}", code);
                    if first {
                        on_exit(code);
                    }
                    break;
                }
                None if flags.killed.load(Ordering::SeqCst) => {
                    log::debug!("Exit monitor killed");
                    break;
                }
                None => {}
            }
        }

        flags.finished.store(true, Ordering::SeqCst);
    }

    /// Stop watching. Does nothing once the process has exited.
    pub fn kill(&self) {
        if let Some(handle) = self.process.upgrade() {
            let _guard = handle.lock();
            if handle.is_exited() {
                return;
            }
        }
        if self.flags.finished.load(Ordering::SeqCst) {
            return;
        }
        self.flags.killed.store(true, Ordering::SeqCst);
        self.flags.wake.notify_one();
    }

    pub fn is_running(&self) -> bool {
        !self.flags.finished.load(Ordering::SeqCst) && !self.task.is_finished()
    }

    /// Kill the monitor and wait for its loop to end.
    pub async fn stop(self) {
        self.kill();
        self.flags.killed.store(true, Ordering::SeqCst);
        self.flags.wake.notify_one();
        if let Err(e) = self.task.await {
            log::warn!("Exit monitor task failed: {}", e);
        }
    }
}
