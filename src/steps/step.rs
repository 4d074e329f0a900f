//! Step abstraction — what the worker runs.

use std::future::Future;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::warn;

use crate::context::Context;
use crate::error::{ContextError, ResolveError};
use crate::protocol::ErrorPayload;

/// What a step finishes with.
pub type StepOutcome = Result<Value, ErrorPayload>;

/// Arguments of one step invocation.
#[derive(Debug, Clone)]
pub struct StepCall {
    pub call_id: u64,
    pub input: Value,
    /// The error an error-catching step is asked to handle.
    pub catchable_error: Option<ErrorPayload>,
}

/// Once-only completion handle given to a step.
///
/// Clones share the same slot: whichever clone completes first wins and
/// every later completion is ignored and logged.
#[derive(Clone)]
pub struct Completion {
    call_id: u64,
    slot: Arc<Mutex<Option<oneshot::Sender<StepOutcome>>>>,
}

impl Completion {
    pub fn new(call_id: u64) -> (Self, oneshot::Receiver<StepOutcome>) {
        let (tx, rx) = oneshot::channel();
        let completion = Self {
            call_id,
            slot: Arc::new(Mutex::new(Some(tx))),
        };
        (completion, rx)
    }

    /// Finish the step. Returns false if it was already finished.
    pub fn complete(&self, outcome: StepOutcome) -> bool {
        let sender = self
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match sender {
            Some(tx) => {
                // Receiver gone means the runtime stopped waiting; nothing to report to.
                let _ = tx.send(outcome);
                true
            }
            None => {
                warn!(call_id = self.call_id, "Step completed more than once; ignoring");
                false
            }
        }
    }

    pub fn ok(&self, output: Value) -> bool {
        self.complete(Ok(output))
    }

    pub fn fail(&self, error: ErrorPayload) -> bool {
        self.complete(Err(error))
    }

    /// Finish with a context failure (storage, info lookup, not logged in).
    pub fn fail_context(&self, error: ContextError) -> bool {
        self.complete(Err(error.to_payload()))
    }

    pub fn is_completed(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_none()
    }

    pub fn call_id(&self) -> u64 {
        self.call_id
    }
}

/// A unit of extension logic.
///
/// `run` may return before completing (handing `done` to a spawned task),
/// complete more than once (only the first counts) or never complete at all
/// (the supervisor's timeout then applies).
#[async_trait]
pub trait Step: Send + Sync {
    async fn run(&self, call: StepCall, ctx: Context, done: Completion);
}

/// Adapter turning an async closure into a [`Step`].
pub struct FnStep<F> {
    f: F,
}

pub fn step_fn<F, Fut>(f: F) -> Arc<dyn Step>
where
    F: Fn(StepCall, Context, Completion) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(FnStep { f })
}

#[async_trait]
impl<F, Fut> Step for FnStep<F>
where
    F: Fn(StepCall, Context, Completion) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn run(&self, call: StepCall, ctx: Context, done: Completion) {
        (self.f)(call, ctx, done).await
    }
}

/// A resolved step and whether it handles errors.
#[derive(Clone)]
pub struct ResolvedStep {
    pub step: Arc<dyn Step>,
    pub error_catching: bool,
}

/// Maps `(moduleId, modulePath)` to a step implementation.
pub trait StepResolver: Send + Sync {
    fn resolve(&self, module_id: &str, module_path: &str) -> Result<ResolvedStep, ResolveError>;
}
