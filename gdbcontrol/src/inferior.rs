//! The debuggee as seen through GDB.
//!
//! There is no OS handle for the inferior here. Anything destructive is
//! asked of the controller, which decides what GDB should do based on the
//! session kind and the inferior's run state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};

use crate::control::WeakControl;
use crate::session::SessionKind;
use crate::{ControlError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InferiorState {
    Running,
    Stopped,
    /// Final. No transition leaves this state.
    Terminated,
}

pub struct InferiorProcess {
    kind: SessionKind,
    state: Mutex<InferiorState>,
    exit_code: OnceLock<i32>,
    disposed: AtomicBool,
    control: WeakControl,
}

impl InferiorProcess {
    pub(crate) fn new(kind: SessionKind, control: WeakControl) -> Self {
        let initial = match kind {
            SessionKind::Core => InferiorState::Stopped,
            _ => InferiorState::Running,
        };
        Self {
            kind,
            state: Mutex::new(initial),
            exit_code: OnceLock::new(),
            disposed: AtomicBool::new(false),
            control,
        }
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn state(&self) -> InferiorState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns false when the inferior was already terminated.
    pub fn set_state(&self, next: InferiorState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == InferiorState::Terminated {
            return false;
        }
        if *state != next {
            log::debug!("Inferior state {:?} -> {:?}", *state, next);
            *state = next;
        }
        true
    }

    pub(crate) fn mark_exited(&self, code: Option<i32>) {
        if let Some(code) = code {
            let _ = self.exit_code.set(code);
        }
        if self.set_state(InferiorState::Terminated) {
            log::info!("Inferior exited with code {:?}", code);
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code.get().copied()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Release the proxy without asking GDB for anything.
    pub fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            self.set_state(InferiorState::Terminated);
            log::debug!("Inferior proxy disposed");
        }
    }

    /// Kill or detach the inferior through the controller, then dispose.
    ///
    /// Safe to call from any task. Failures to reach the controller are
    /// logged; the proxy is disposed either way.
    pub async fn destroy(&self) {
        if let Err(e) = self.request_destroy().await {
            log::warn!("{}", e);
        }
        self.dispose();
    }

    async fn request_destroy(&self) -> Result<()> {
        if self.is_disposed() {
            return Ok(());
        }
        let Some(shared) = self.control.shared.upgrade() else {
            return Ok(());
        };
        if !shared.is_active() {
            log::debug!("Session is no longer active, not destroying inferior");
            return Ok(());
        }
        let wait = shared.session.config().destroy_wait();
        drop(shared);
        let Some(executor) = self.control.executor.upgrade() else {
            return Ok(());
        };

        let planned = tokio::time::timeout(wait, executor.call(|state| state.plan_inferior_destroy()))
            .await
            .map_err(|_| {
                ControlError::CrossThreadDestroy(format!("controller did not respond within {wait:?}"))
            })?
            .map_err(|e| ControlError::CrossThreadDestroy(e.to_string()))?;
        drop(executor);

        let Some((command, reply)) = planned else {
            return Ok(());
        };
        log::debug!("Waiting for GDB to acknowledge {}", command);
        match tokio::time::timeout(wait, reply).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(ControlError::CrossThreadDestroy(e.to_string())),
            Err(_) => Err(ControlError::CrossThreadDestroy(format!(
                "`{command}` got no answer within {wait:?}"
            ))),
        }
    }
}

impl std::fmt::Debug for InferiorProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferiorProcess")
            .field("kind", &self.kind)
            .field("state", &self.state())
            .field("exit_code", &self.exit_code())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
