//! Worker side of the sandbox — the code running inside the child process.

pub mod log;
pub mod runtime;

pub use log::ChannelLog;
pub use runtime::WorkerRuntime;
