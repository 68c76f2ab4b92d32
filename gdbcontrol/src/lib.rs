//! GDB process control for debugger front ends.
//!
//! This crate launches GDB, negotiates the MI handshake, tracks the debugger
//! process and the debuggee ("inferior") it controls, and tears everything
//! down again in a fixed, reversible order.

use std::time::Duration;
use thiserror::Error;

pub mod channel;
pub mod commands;
pub mod completion;
pub mod control;
pub mod dispatch;
pub mod events;
pub mod executor;
pub mod inferior;
pub mod launcher;
pub mod monitor;
pub mod probe;
pub mod process;
pub mod record;
pub mod sequence;
pub mod session;
mod steps;

pub use channel::MiChannel;
pub use commands::MiCommand;
pub use control::{ConsoleMode, GdbControl, ResourceSnapshot, TerminateOutcome};
pub use dispatch::{CommandDispatch, CommandFuture, DispatchError};
pub use events::{ControlEvent, EventBus, ListenerId};
pub use inferior::{InferiorProcess, InferiorState};
pub use process::{DebuggerProcess, GdbProcess, ProcessHandle, ProcessSpawner, TokioSpawner};
pub use record::{AsyncClass, AsyncRecord, MiRecord, MiResult, ResultClass};
pub use sequence::{Sequence, SequenceState, Step, StepFailure};
pub use session::{DebuggerSession, SessionConfig, SessionContext, SessionKind};

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Failed to launch debugger `{command_line}`: {source}")]
    Launch {
        command_line: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Debugger `{command_line}` did not become ready within {timeout:?}")]
    LaunchTimeout {
        command_line: String,
        timeout: Duration,
    },
    #[error("Debugger `{command_line}` closed its output before becoming ready")]
    LaunchAborted { command_line: String },
    #[error("Failed to wire command processing: {0}")]
    Wiring(String),
    #[error("Invalid session configuration: {0}")]
    InvalidConfig(String),
    #[error("Invalid controller state: {0}")]
    InvalidState(String),
    #[error("GDB command failed: {0}")]
    Dispatch(#[from] DispatchError),
    #[error("Debugger is not connected")]
    NotConnected,
    #[error("GDB process terminated unexpectedly")]
    ProcessExited,
    #[error("Controller executor has shut down")]
    ExecutorClosed,
    #[error("Inferior destroy request failed: {0}")]
    CrossThreadDestroy(String),
}

pub type Result<T> = std::result::Result<T, ControlError>;
