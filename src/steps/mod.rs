//! Steps — units of extension logic the worker resolves and runs.
//!
//! - `step` — `Step` trait, once-only `Completion`, `StepResolver`
//! - `registry` — `StepRegistry`, the build-time resolver
//! - `builtin` — steps shipped with the worker binary

pub mod builtin;
pub mod registry;
pub mod step;

pub use builtin::{BUILTIN_MODULE, builtin_registry, register_builtin};
pub use registry::StepRegistry;
pub use step::{Completion, ResolvedStep, Step, StepCall, StepOutcome, StepResolver, step_fn};
