//! Lifecycle events raised by the controller
//!
//! Listeners are plain callbacks registered on an [`EventBus`]. The bus is
//! owned by the controller and only ever carries the two lifecycle events.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::session::SessionContext;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// The controller finished initializing and accepts commands
    Started(SessionContext),
    /// The GDB process went away
    Exited {
        context: SessionContext,
        exit_code: i32,
    },
}

impl ControlEvent {
    pub fn context(&self) -> &SessionContext {
        match self {
            ControlEvent::Started(context) => context,
            ControlEvent::Exited { context, .. } => context,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&ControlEvent) + Send + Sync>;

#[derive(Default)]
pub struct EventBus {
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener callback
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ControlEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.lock().push((id, Arc::new(listener)));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.lock();
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    /// Call every listener with `event`.
    ///
    /// Listeners run outside the lock and may add or remove listeners.
    pub fn dispatch(&self, event: &ControlEvent) {
        let listeners: Vec<Listener> = self.lock().iter().map(|(_, l)| l.clone()).collect();
        log::debug!("Dispatching {:?} to {} listener(s)", event, listeners.len());
        for listener in listeners {
            listener(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(ListenerId, Listener)>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
