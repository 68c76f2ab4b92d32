//! At-most-once completion shared by racing paths.
//!
//! The launch timeout and the terminate grace timer both race an external
//! event against a timer. Each racer holds a clone of the same
//! [`Completion`]; the first `complete` call delivers its value and every
//! later one is a no-op.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::oneshot;

type Callback<T> = Box<dyn FnOnce(T) + Send>;

pub struct Completion<T> {
    slot: Arc<Mutex<Option<Callback<T>>>>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T: Send + 'static> Completion<T> {
    pub fn new<F>(callback: F) -> Self
    where
        F: FnOnce(T) + Send + 'static,
    {
        Self {
            slot: Arc::new(Mutex::new(Some(Box::new(callback)))),
        }
    }

    /// A completion whose value arrives on the returned receiver.
    pub fn channel() -> (Self, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        let completion = Self::new(move |value| {
            let _ = tx.send(value);
        });
        (completion, rx)
    }

    /// Deliver `value` if nothing was delivered yet. Returns whether this
    /// call won.
    pub fn complete(&self, value: T) -> bool {
        let callback = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match callback {
            Some(callback) => {
                callback(value);
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}
