//! The command dispatch seam: queue a command, get its result later.

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

use crate::commands::MiCommand;
use crate::record::MiResult;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Command channel closed")]
    ChannelClosed,
    #[error("`{command}` failed: {message}")]
    CommandFailed { command: String, message: String },
}

pub type CommandFuture = Pin<Box<dyn Future<Output = Result<MiResult, DispatchError>> + Send>>;

/// Anything that can carry MI commands to GDB.
///
/// The command is written when `queue_command` is called; the returned
/// future only waits for the answer, so several commands can be in flight.
pub trait CommandDispatch: Send + Sync {
    fn queue_command(&self, command: MiCommand) -> CommandFuture;
}
