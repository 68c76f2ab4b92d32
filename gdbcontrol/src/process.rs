//! Process management for GDB
//!
//! This module defines the spawn interface the controller launches GDB
//! through, the tokio-backed implementation of it, and the shared handle
//! the controller and the exit monitor both look at.

use std::io;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

pub type ProcessReader = Box<dyn AsyncRead + Send + Unpin>;
pub type ProcessWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// An OS process running the debugger.
pub trait DebuggerProcess: Send {
    fn id(&self) -> Option<u32>;

    /// The stream commands are written to. Can be taken once.
    fn take_stdin(&mut self) -> Option<ProcessWriter>;

    /// The stream GDB writes MI output to. Can be taken once.
    fn take_stdout(&mut self) -> Option<ProcessReader>;

    /// `Ok(None)` while the process is still alive.
    fn try_exit_code(&mut self) -> io::Result<Option<i32>>;

    /// Forcibly kill the process. Does not wait for it to go away.
    fn destroy(&mut self) -> io::Result<()>;

    /// Whether `interrupt` can reach this process on this platform.
    fn supports_interrupt(&self) -> bool;

    fn interrupt(&mut self) -> io::Result<()>;
}

/// Starts debugger processes from a full command line.
pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, command_line: &[String]) -> io::Result<Box<dyn DebuggerProcess>>;
}

/// Spawns real processes through `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSpawner;

impl ProcessSpawner for TokioSpawner {
    fn spawn(&self, command_line: &[String]) -> io::Result<Box<dyn DebuggerProcess>> {
        Ok(Box::new(GdbProcess::start(command_line)?))
    }
}

pub struct GdbProcess {
    child: Child,
    stderr_reader: Option<JoinHandle<()>>,
}

impl GdbProcess {
    /// Start GDB with piped stdin/stdout. Stderr is forwarded to the log.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(command_line: &[String]) -> io::Result<Self> {
        let (program, args) = command_line
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command line"))?;

        log::debug!("Starting GDB process: {}", command_line.join(" "));

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        log::debug!("GDB process started with PID: {:?}", child.id());

        let stderr_reader = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let trimmed = line.trim();
                    if !trimmed.is_empty() {
                        log::debug!("GDB stderr: {}", trimmed);
                    }
                }
            })
        });

        Ok(Self {
            child,
            stderr_reader,
        })
    }

    /// Platform-specific interrupt signal implementation
    #[cfg(windows)]
    fn send_interrupt_signal(pid: u32) -> io::Result<()> {
        use winapi::um::wincon::{GenerateConsoleCtrlEvent, CTRL_C_EVENT};

        // SAFETY: plain FFI call, no pointers involved.
        let result = unsafe { GenerateConsoleCtrlEvent(CTRL_C_EVENT, pid) };
        if result == 0 {
            Err(io::Error::last_os_error())
        } else {
            log::debug!("Sent CTRL_C_EVENT to PID {}", pid);
            Ok(())
        }
    }

    #[cfg(unix)]
    fn send_interrupt_signal(pid: u32) -> io::Result<()> {
        // SAFETY: kill(2) only takes integers.
        let result = unsafe { libc::kill(pid as libc::pid_t, libc::SIGINT) };
        if result != 0 {
            Err(io::Error::last_os_error())
        } else {
            log::debug!("Sent SIGINT to PID {}", pid);
            Ok(())
        }
    }

    #[cfg(not(any(windows, unix)))]
    fn send_interrupt_signal(_pid: u32) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "interrupt not supported on this platform",
        ))
    }
}

impl DebuggerProcess for GdbProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn take_stdin(&mut self) -> Option<ProcessWriter> {
        self.child
            .stdin
            .take()
            .map(|stdin| Box::new(stdin) as ProcessWriter)
    }

    fn take_stdout(&mut self) -> Option<ProcessReader> {
        self.child
            .stdout
            .take()
            .map(|stdout| Box::new(stdout) as ProcessReader)
    }

    fn try_exit_code(&mut self) -> io::Result<Option<i32>> {
        Ok(self.child.try_wait()?.map(exit_code))
    }

    fn destroy(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    fn supports_interrupt(&self) -> bool {
        cfg!(any(unix, windows))
    }

    fn interrupt(&mut self) -> io::Result<()> {
        match self.child.id() {
            Some(pid) => Self::send_interrupt_signal(pid),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                "GDB process already exited",
            )),
        }
    }
}

impl Drop for GdbProcess {
    fn drop(&mut self) {
        if let Some(reader) = self.stderr_reader.take() {
            reader.abort();
        }
    }
}

/// Signal deaths are reported shell-style, as 128 + signal number.
fn exit_code(status: std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    status.code().unwrap_or(-1)
}

/// The spawned debugger as the controller owns it.
///
/// The process sits behind a mutex that the exit monitor's run loop and its
/// `kill()` both take. The exit code can be recorded exactly once.
pub struct ProcessHandle {
    process: Mutex<Box<dyn DebuggerProcess>>,
    exit: Arc<OnceLock<i32>>,
    pid: Option<u32>,
    supports_interrupt: bool,
}

impl ProcessHandle {
    pub fn new(process: Box<dyn DebuggerProcess>, exit: Arc<OnceLock<i32>>) -> Self {
        let pid = process.id();
        let supports_interrupt = process.supports_interrupt();
        Self {
            process: Mutex::new(process),
            exit,
            pid,
            supports_interrupt,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn supports_interrupt(&self) -> bool {
        self.supports_interrupt
    }

    pub fn lock(&self) -> MutexGuard<'_, Box<dyn DebuggerProcess>> {
        self.process.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns true only for the caller that records the first exit.
    pub fn record_exit(&self, code: i32) -> bool {
        self.exit.set(code).is_ok()
    }

    pub fn is_exited(&self) -> bool {
        self.exit.get().is_some()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit.get().copied()
    }

    /// The recorded exit code, or a fresh poll of the process. A freshly
    /// observed exit is not recorded; that stays with the exit monitor.
    pub fn poll_exit(&self) -> Option<i32> {
        if let Some(code) = self.exit_code() {
            return Some(code);
        }
        match self.lock().try_exit_code() {
            Ok(code) => code,
            Err(e) => {
                log::debug!("Failed to poll GDB process {:?}: {}", self.pid, e);
                None
            }
        }
    }

    pub fn interrupt(&self) -> io::Result<()> {
        if !self.supports_interrupt {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "process does not support interrupt",
            ));
        }
        self.lock().interrupt()
    }

    pub fn destroy(&self) -> io::Result<()> {
        if self.is_exited() {
            return Ok(());
        }
        self.lock().destroy()
    }

    /// Kill the process if needed and wait up to `wait` for it to go away.
    ///
    /// Returns the observed exit code without recording it.
    pub async fn destroy_and_reap(&self, wait: Duration) -> Option<i32> {
        if let Some(code) = self.exit_code() {
            return Some(code);
        }
        if let Err(e) = self.destroy() {
            log::warn!("Failed to destroy GDB process {:?}: {}", self.pid, e);
        }

        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let polled = self.lock().try_exit_code();
            match polled {
                Ok(Some(code)) => return Some(code),
                Ok(None) => {}
                Err(e) => {
                    log::warn!("Failed to reap GDB process {:?}: {}", self.pid, e);
                    return None;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                log::warn!("GDB process {:?} did not exit within {:?}", self.pid, wait);
                return None;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("exit_code", &self.exit_code())
            .field("supports_interrupt", &self.supports_interrupt)
            .finish()
    }
}

/// Install custom signal handlers to prevent self-termination when sending signals
#[cfg(windows)]
pub fn install_signal_protection() {
    use winapi::shared::minwindef::{BOOL, DWORD, TRUE};
    use winapi::um::consoleapi::SetConsoleCtrlHandler;

    unsafe extern "system" fn ctrl_handler(ctrl_type: DWORD) -> BOOL {
        use winapi::um::wincon::{CTRL_BREAK_EVENT, CTRL_C_EVENT};

        match ctrl_type {
            CTRL_C_EVENT | CTRL_BREAK_EVENT => {
                log::debug!("Ignoring console control event {} sent to GDB", ctrl_type);
                TRUE
            }
            _ => 0,
        }
    }

    // SAFETY: the handler is a plain function that lives for the whole program.
    let result = unsafe { SetConsoleCtrlHandler(Some(ctrl_handler), TRUE) };
    if result == 0 {
        log::warn!("Failed to install custom Ctrl+C handler");
    }
}

#[cfg(not(windows))]
pub fn install_signal_protection() {
    log::debug!("Signal protection not required on this platform");
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ExitedProcess;

    impl DebuggerProcess for ExitedProcess {
        fn id(&self) -> Option<u32> {
            Some(42)
        }
        fn take_stdin(&mut self) -> Option<ProcessWriter> {
            None
        }
        fn take_stdout(&mut self) -> Option<ProcessReader> {
            None
        }
        fn try_exit_code(&mut self) -> io::Result<Option<i32>> {
            Ok(Some(3))
        }
        fn destroy(&mut self) -> io::Result<()> {
            Ok(())
        }
        fn supports_interrupt(&self) -> bool {
            false
        }
        fn interrupt(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_exit_is_recorded_once() {
        let handle = ProcessHandle::new(Box::new(ExitedProcess), Arc::new(OnceLock::new()));
        assert!(!handle.is_exited());
        assert!(handle.record_exit(3));
        assert!(!handle.record_exit(9));
        assert_eq!(handle.exit_code(), Some(3));
    }

    #[test]
    fn test_poll_exit_sees_unrecorded_exit() {
        let handle = ProcessHandle::new(Box::new(ExitedProcess), Arc::new(OnceLock::new()));
        assert_eq!(handle.poll_exit(), Some(3));
        assert!(!handle.is_exited());
    }

    #[test]
    fn test_interrupt_respects_capability() {
        let handle = ProcessHandle::new(Box::new(ExitedProcess), Arc::new(OnceLock::new()));
        assert!(!handle.supports_interrupt());
        assert_eq!(
            handle.interrupt().unwrap_err().kind(),
            io::ErrorKind::Unsupported
        );
    }

    #[tokio::test]
    async fn test_reap_reports_exit_code() {
        let handle = ProcessHandle::new(Box::new(ExitedProcess), Arc::new(OnceLock::new()));
        assert_eq!(handle.destroy_and_reap(Duration::from_millis(50)).await, Some(3));
        assert_eq!(handle.pid(), Some(42));
    }

    #[test]
    fn test_empty_command_line_is_rejected() {
        let err = GdbProcess::start(&[]).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_missing_executable_fails_to_spawn() {
        let result = TokioSpawner.spawn(&["/nonexistent/gdb-binary".to_string()]);
        assert!(result.is_err());
    }
}
