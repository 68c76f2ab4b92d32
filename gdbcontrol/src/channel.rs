//! Communication layer for GDB/MI protocol
//!
//! This module handles the low-level communication with GDB: writing
//! tokenized commands, routing result records back to the command that is
//! waiting for them, and forwarding unsolicited async records.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::commands::MiCommand;
use crate::dispatch::{CommandDispatch, CommandFuture, DispatchError};
use crate::process::{ProcessReader, ProcessWriter};
use crate::record::{parse_record, AsyncRecord, MiRecord, MiResult, ResultClass, StreamType};

type PendingCommands = Arc<Mutex<HashMap<u32, oneshot::Sender<MiResult>>>>;

/// Manages the MI command stream of one GDB process
pub struct MiChannel {
    lines: mpsc::UnboundedSender<String>,
    token_counter: AtomicU32,
    pending_commands: PendingCommands,
    is_running: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MiChannel {
    /// Start reading from `stdout` and writing to `stdin`.
    ///
    /// Returns the channel and the receiving end of the async record stream.
    pub fn start(
        stdout: BufReader<ProcessReader>,
        stdin: ProcessWriter,
    ) -> (Self, mpsc::UnboundedReceiver<AsyncRecord>) {
        let (lines, line_queue) = mpsc::unbounded_channel();
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let pending_commands: PendingCommands = Arc::new(Mutex::new(HashMap::new()));
        let is_running = Arc::new(AtomicBool::new(true));

        let writer = tokio::spawn(Self::write_loop(stdin, line_queue, is_running.clone()));
        let reader = tokio::spawn(Self::read_loop(
            stdout,
            notify_tx,
            pending_commands.clone(),
            is_running.clone(),
        ));

        let channel = Self {
            lines,
            token_counter: AtomicU32::new(1),
            pending_commands,
            is_running,
            tasks: Mutex::new(vec![writer, reader]),
        };
        (channel, notify_rx)
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Stop both I/O tasks. Commands still waiting fail with
    /// [`DispatchError::ChannelClosed`].
    pub fn stop(&self) {
        self.is_running.store(false, Ordering::SeqCst);
        for task in self.tasks.lock().unwrap_or_else(PoisonError::into_inner).drain(..) {
            task.abort();
        }
        fail_pending(&self.pending_commands);
    }

    async fn write_loop(
        mut stdin: ProcessWriter,
        mut line_queue: mpsc::UnboundedReceiver<String>,
        is_running: Arc<AtomicBool>,
    ) {
        while let Some(line) = line_queue.recv().await {
            let written = async {
                stdin.write_all(line.as_bytes()).await?;
                stdin.flush().await
            }
            .await;
            if let Err(e) = written {
                log::error!("Failed to write command to GDB: {}", e);
                is_running.store(false, Ordering::SeqCst);
                break;
            }
        }
        log::debug!("GDB stdin writer finished");
    }

    async fn read_loop(
        mut stdout: BufReader<ProcessReader>,
        notify_tx: mpsc::UnboundedSender<AsyncRecord>,
        pending_commands: PendingCommands,
        is_running: Arc<AtomicBool>,
    ) {
        log::debug!("GDB stdout reader started");
        let mut raw = Vec::new();

        loop {
            raw.clear();
            match stdout.read_until(b'\n', &mut raw).await {
                Ok(0) => {
                    log::debug!("GDB stdout: EOF reached");
                    break;
                }
                Ok(_) => {
                    let line = String::from_utf8_lossy(&raw);
                    if let Cow::Owned(_) = line {
                        log::debug!("GDB stdout line was not valid UTF-8, decoded lossily");
                    }
                    let trimmed = line.trim();
                    if !trimmed.is_empty() {
                        log::trace!("GDB_OUT: {}", trimmed);
                        Self::process_gdb_output(trimmed, &notify_tx, &pending_commands);
                    }
                }
                Err(e) => {
                    log::error!("GDB stdout read error: {}", e);
                    break;
                }
            }
        }

        is_running.store(false, Ordering::SeqCst);
        fail_pending(&pending_commands);
        log::debug!("GDB stdout reader finished");
    }

    fn process_gdb_output(
        line: &str,
        notify_tx: &mpsc::UnboundedSender<AsyncRecord>,
        pending_commands: &PendingCommands,
    ) {
        match parse_record(line) {
            Ok(MiRecord::Result(result)) => match result.token {
                Some(token) => {
                    let waiting = pending_commands
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(&token);
                    match waiting {
                        Some(sender) => {
                            let _ = sender.send(result);
                        }
                        None => log::warn!("RECV[{}]: No pending command found for token!", token),
                    }
                }
                None => log::debug!("RECV[NO_TOKEN]: class={:?}", result.class),
            },
            Ok(MiRecord::Async(record)) => {
                log::debug!("ASYNC: class={:?}", record.class);
                let _ = notify_tx.send(record);
            }
            Ok(MiRecord::Stream(stream)) => match stream.stream_type {
                StreamType::Console => log::debug!("CONSOLE: {}", stream.content.trim_end()),
                StreamType::Target => log::debug!("TARGET: {}", stream.content.trim_end()),
                StreamType::Log => log::debug!("LOG: {}", stream.content.trim_end()),
            },
            Ok(MiRecord::Prompt) => {}
            Err(e) => log::debug!("GDB_PARSE_ERROR: '{}' -> {}", line, e),
        }
    }
}

fn fail_pending(pending_commands: &PendingCommands) {
    // Dropping the senders wakes every waiter with an error.
    pending_commands
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clear();
}

impl CommandDispatch for MiChannel {
    fn queue_command(&self, command: MiCommand) -> CommandFuture {
        if !self.is_running() {
            return Box::pin(async { Err(DispatchError::ChannelClosed) });
        }

        let token = self.token_counter.fetch_add(1, Ordering::SeqCst);
        let command_line = format!("{}{}\n", token, command);
        let (sender, receiver) = oneshot::channel();
        self.pending_commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token, sender);

        // The reader may have shut down between the check above and the insert.
        if !self.is_running() || self.lines.send(command_line).is_err() {
            self.pending_commands
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&token);
            return Box::pin(async { Err(DispatchError::ChannelClosed) });
        }
        log::debug!("SEND[{}]: {}", token, command);

        let command = command.to_string();
        Box::pin(async move {
            let result = receiver.await.map_err(|_| DispatchError::ChannelClosed)?;
            log::debug!("RECV[{}]: class={:?}", token, result.class);

            if result.class == ResultClass::Error {
                let message = result
                    .message()
                    .unwrap_or_else(|| "Unknown error".to_string());
                return Err(DispatchError::CommandFailed { command, message });
            }
            Ok(result)
        })
    }
}

impl Drop for MiChannel {
    fn drop(&mut self) {
        self.stop();
    }
}
