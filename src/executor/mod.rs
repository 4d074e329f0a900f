//! Step executor — supervisor side of the sandbox.
//!
//! - `state` — Worker lifecycle (Stopped → Starting → Running → Crashed/Stopping → Stopped)
//! - `calls` — Pending call table keyed by call id
//! - `supervisor` — Process ownership, call multiplexing, crash recovery

pub mod calls;
pub mod state;
pub mod supervisor;

pub use calls::{CallOutcome, CallTable};
pub use state::{Lifecycle, StateTransition, WorkerState};
pub use supervisor::{ExecutorStatus, StepExecutor};
