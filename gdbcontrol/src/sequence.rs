//! Ordered, reversible initialization steps.
//!
//! A [`Sequence`] runs its steps front to back on initialize and back to
//! front on shutdown. When a step fails to initialize, the steps that did
//! initialize are shut down again in reverse order before the error is
//! returned.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::{ControlError, Result};

pub type StepFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

type StepFn<C> = Arc<dyn Fn(C) -> StepFuture + Send + Sync>;

pub struct Step<C> {
    name: &'static str,
    initialize: StepFn<C>,
    shutdown: StepFn<C>,
}

impl<C> Clone for Step<C> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            initialize: self.initialize.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<C: 'static> Step<C> {
    pub fn new<I, IF, S, SF>(name: &'static str, initialize: I, shutdown: S) -> Self
    where
        I: Fn(C) -> IF + Send + Sync + 'static,
        IF: Future<Output = Result<()>> + Send + 'static,
        S: Fn(C) -> SF + Send + Sync + 'static,
        SF: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name,
            initialize: Arc::new(move |ctx| Box::pin(initialize(ctx))),
            shutdown: Arc::new(move |ctx| Box::pin(shutdown(ctx))),
        }
    }

    /// A step with nothing to undo.
    pub fn initialize_only<I, IF>(name: &'static str, initialize: I) -> Self
    where
        I: Fn(C) -> IF + Send + Sync + 'static,
        IF: Future<Output = Result<()>> + Send + 'static,
    {
        Self::new(name, initialize, |_| async { Ok(()) })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceState {
    Idle,
    Initializing,
    Ready,
    ShuttingDown,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    NotStarted,
    Initialized,
    ShutDown,
    RolledBack,
}

/// A step whose shutdown reported an error.
#[derive(Debug)]
pub struct StepFailure {
    pub step: &'static str,
    pub error: ControlError,
}

pub struct Sequence<C> {
    name: &'static str,
    steps: Vec<Step<C>>,
    step_states: Vec<StepState>,
    state: SequenceState,
}

impl<C: Clone + Send + 'static> Sequence<C> {
    pub fn new(name: &'static str, steps: Vec<Step<C>>) -> Self {
        let step_states = vec![StepState::NotStarted; steps.len()];
        Self {
            name,
            steps,
            step_states,
            state: SequenceState::Idle,
        }
    }

    pub fn state(&self) -> SequenceState {
        self.state
    }

    pub fn step_states(&self) -> &[StepState] {
        &self.step_states
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every step's initialize in order.
    ///
    /// On failure the completed steps are rolled back and the failing
    /// step's own error is returned.
    pub async fn initialize(&mut self, ctx: C) -> Result<()> {
        if matches!(self.state, SequenceState::Ready | SequenceState::Initializing) {
            return Err(ControlError::InvalidState(format!(
                "{} sequence is already {:?}",
                self.name, self.state
            )));
        }
        self.state = SequenceState::Initializing;
        self.step_states.fill(StepState::NotStarted);

        for index in 0..self.steps.len() {
            let step = self.steps[index].clone();
            log::debug!("{}: initializing step '{}'", self.name, step.name);

            if let Err(error) = (step.initialize)(ctx.clone()).await {
                log::debug!("{}: step '{}' failed: {}", self.name, step.name, error);
                self.rollback(index, ctx).await;
                self.state = SequenceState::Failed;
                return Err(error);
            }
            self.step_states[index] = StepState::Initialized;
        }

        self.state = SequenceState::Ready;
        log::debug!("{}: all {} steps initialized", self.name, self.steps.len());
        Ok(())
    }

    async fn rollback(&mut self, failed: usize, ctx: C) {
        for index in (0..failed).rev() {
            let step = self.steps[index].clone();
            log::debug!("{}: rolling back step '{}'", self.name, step.name);
            if let Err(error) = (step.shutdown)(ctx.clone()).await {
                log::warn!("{}: rollback of '{}' failed: {}", self.name, step.name, error);
            }
            self.step_states[index] = StepState::RolledBack;
        }
    }

    /// Run every step's shutdown in reverse order.
    ///
    /// Does nothing unless the sequence is initialized. Step errors are
    /// collected and never stop the remaining steps.
    pub async fn shutdown(&mut self, ctx: C) -> Vec<StepFailure> {
        if self.state != SequenceState::Ready {
            return Vec::new();
        }
        self.state = SequenceState::ShuttingDown;

        let mut failures = Vec::new();
        for index in (0..self.steps.len()).rev() {
            let step = self.steps[index].clone();
            log::debug!("{}: shutting down step '{}'", self.name, step.name);
            if let Err(error) = (step.shutdown)(ctx.clone()).await {
                log::warn!("{}: shutdown of '{}' failed: {}", self.name, step.name, error);
                failures.push(StepFailure {
                    step: step.name,
                    error,
                });
            }
            self.step_states[index] = StepState::ShutDown;
        }

        self.state = SequenceState::Idle;
        failures
    }
}
