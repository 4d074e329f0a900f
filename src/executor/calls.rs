//! Pending step calls, keyed by call id.

use serde_json::Value;
use tokio::sync::oneshot;

use crate::broker::{Correlator, Resolution};
use crate::error::{ExecutionError, ProtocolError};
use crate::protocol::ExecutionResult;

pub type CallOutcome = Result<Value, ExecutionError>;

/// Allocates call ids and matches results to waiting callers.
///
/// Ids increase monotonically for the lifetime of the executor, across worker
/// restarts, so a result from an old generation can never satisfy a new call.
#[derive(Default)]
pub struct CallTable {
    next_id: u64,
    pending: Correlator<u64, CallOutcome>,
}

impl CallTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next call id and wait slot.
    pub fn open(&mut self) -> (u64, oneshot::Receiver<CallOutcome>) {
        self.next_id += 1;
        let id = self.next_id;
        (id, self.pending.register(id))
    }

    /// Deliver a worker result to its caller.
    pub fn complete(&mut self, result: ExecutionResult) -> Result<Resolution, ProtocolError> {
        let outcome = match result.err {
            Some(err) => Err(ExecutionError::Step(err)),
            None => Ok(result.output.unwrap_or(Value::Null)),
        };
        self.pending
            .resolve(&result.call_id, outcome)
            .map_err(|_| ProtocolError::UnknownCall(result.call_id))
    }

    /// The caller gave up; a later result for `id` is discarded as late.
    pub fn expire(&mut self, id: u64) -> bool {
        self.pending.expire(&id)
    }

    /// The request never reached the worker.
    pub fn cancel(&mut self, id: u64) -> bool {
        self.pending.cancel(&id)
    }

    /// Fail every pending call with `error`.
    pub fn fail_all(&mut self, error: &ExecutionError) -> usize {
        self.pending.fail_all(|| Err(error.clone()))
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
