//! Serialized executor owning a piece of session state.
//!
//! Jobs run one at a time, in submission order, on a single tokio task that
//! owns the state. Background work never touches the state directly; it
//! posts a job instead.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::{ControlError, Result};

type Job<S> = Box<dyn FnOnce(&mut S) + Send>;

pub struct Executor<S> {
    jobs: mpsc::UnboundedSender<Job<S>>,
}

impl<S> Clone for Executor<S> {
    fn clone(&self) -> Self {
        Self {
            jobs: self.jobs.clone(),
        }
    }
}

/// Does not keep the executor alive.
pub struct WeakExecutor<S> {
    jobs: mpsc::WeakUnboundedSender<Job<S>>,
}

impl<S> Clone for WeakExecutor<S> {
    fn clone(&self) -> Self {
        Self {
            jobs: self.jobs.clone(),
        }
    }
}

impl<S> WeakExecutor<S> {
    /// A handle that never upgrades.
    pub fn dangling() -> Self {
        let (jobs, _queue) = mpsc::unbounded_channel();
        Self {
            jobs: jobs.downgrade(),
        }
    }

    pub fn upgrade(&self) -> Option<Executor<S>> {
        self.jobs.upgrade().map(|jobs| Executor { jobs })
    }
}

impl<S: Send + 'static> Executor<S> {
    /// Start the executor task. `init` receives a weak handle so the state
    /// can post follow-up work to itself without keeping the loop alive.
    ///
    /// The loop ends once every strong handle is dropped.
    pub fn spawn<F>(name: &'static str, init: F) -> Self
    where
        F: FnOnce(WeakExecutor<S>) -> S,
    {
        let (jobs, mut queue) = mpsc::unbounded_channel::<Job<S>>();
        let mut state = init(WeakExecutor {
            jobs: jobs.downgrade(),
        });

        tokio::spawn(async move {
            log::debug!("{} executor started", name);
            while let Some(job) = queue.recv().await {
                job(&mut state);
            }
            log::debug!("{} executor stopped", name);
        });

        Self { jobs }
    }

    /// Queue a job. Returns false if the executor has shut down.
    pub fn execute<F>(&self, job: F) -> bool
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.jobs.send(Box::new(job)).is_ok()
    }

    /// Run `f` on the executor and wait for its result.
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut S) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let queued = self.execute(move |state| {
            let _ = tx.send(f(state));
        });
        if !queued {
            return Err(ControlError::ExecutorClosed);
        }
        rx.await.map_err(|_| ControlError::ExecutorClosed)
    }

    /// Run `job` after `delay`. Cancelling is best effort: a job that is
    /// already queued still runs.
    pub fn schedule<F>(&self, delay: Duration, job: F) -> ScheduledJob
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        let executor = self.downgrade();
        ScheduledJob {
            timer: tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(executor) = executor.upgrade() {
                    executor.execute(job);
                }
            }),
        }
    }

    pub fn downgrade(&self) -> WeakExecutor<S> {
        WeakExecutor {
            jobs: self.jobs.downgrade(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.jobs.is_closed()
    }
}

pub struct ScheduledJob {
    timer: JoinHandle<()>,
}

impl ScheduledJob {
    pub fn cancel(&self) {
        self.timer.abort();
    }
}
