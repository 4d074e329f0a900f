//! Error types for the step sandbox.

use std::time::Duration;

use crate::protocol::{ErrorKind, ErrorPayload};

/// Top-level error type for the sandbox.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Capability error: {0}")]
    Capability(#[from] CapabilityError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Context error: {0}")]
    Context(#[from] ContextError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Persistent map store errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Store I/O failed: {0}")]
    Io(String),

    #[error("Store document is corrupt: {0}")]
    Corrupt(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Store queue is closed")]
    Closed,

    #[error("Remote store error: {0}")]
    Remote(ErrorPayload),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl StoreError {
    /// Rebuild a store error from a payload received over the channel.
    pub fn from_payload(payload: ErrorPayload) -> Self {
        match payload.kind() {
            Some(ErrorKind::Validation) => StoreError::Validation(payload.message),
            _ => StoreError::Remote(payload),
        }
    }

    pub fn to_payload(&self) -> ErrorPayload {
        match self {
            StoreError::Validation(msg) => ErrorPayload::new(ErrorKind::Validation, msg.clone()),
            StoreError::Remote(payload) => payload.clone(),
            other => ErrorPayload::new(ErrorKind::Store, other.to_string()),
        }
    }
}

/// Step execution errors surfaced to callers of the executor.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecutionError {
    #[error("Worker is not running")]
    NotRunning,

    #[error("Worker is already running")]
    AlreadyRunning,

    #[error("Call {call_id} timed out after {timeout:?}")]
    Timeout { call_id: u64, timeout: Duration },

    #[error("Worker crashed: {reason}")]
    Crashed { reason: String },

    #[error("Executor is shutting down")]
    ShuttingDown,

    #[error("Failed to spawn worker: {0}")]
    Spawn(String),

    #[error("{0}")]
    Step(ErrorPayload),
}

impl ExecutionError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ExecutionError::Step(p) if p.kind() == Some(ErrorKind::NotFound))
    }

    pub fn to_payload(&self) -> ErrorPayload {
        match self {
            ExecutionError::Step(payload) => payload.clone(),
            ExecutionError::Timeout { .. } => {
                ErrorPayload::new(ErrorKind::Timeout, self.to_string())
            }
            ExecutionError::Crashed { .. } => ErrorPayload::new(ErrorKind::Crash, self.to_string()),
            other => ErrorPayload::new(ErrorKind::Step, other.to_string()),
        }
    }
}

/// Failures fetching app/device info through the config service.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CapabilityError {
    #[error("Config service request for {resource} failed: {reason}")]
    Service { resource: String, reason: String },

    #[error("Capability request for {resource} timed out after {timeout:?}")]
    Timeout { resource: String, timeout: Duration },

    #[error("{0}")]
    Remote(ErrorPayload),

    #[error("Capability channel closed")]
    ChannelClosed,
}

impl CapabilityError {
    pub fn to_payload(&self) -> ErrorPayload {
        match self {
            CapabilityError::Remote(payload) => payload.clone(),
            CapabilityError::Timeout { .. } => {
                ErrorPayload::new(ErrorKind::Timeout, self.to_string())
            }
            other => ErrorPayload::new(ErrorKind::Capability, other.to_string()),
        }
    }
}

/// Broken request/response pairing across the process boundary.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("No pending request with id {0}")]
    UnknownRequest(String),

    #[error("No pending call with id {0}")]
    UnknownCall(u64),

    #[error("Malformed envelope: {0}")]
    Malformed(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::Malformed(e.to_string())
    }
}

/// Step lookup failures in the worker.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ResolveError {
    #[error("Step {module_id}/{module_path} not found")]
    NotFound {
        module_id: String,
        module_path: String,
    },

    #[error("Step {module_id}/{module_path} is not an error-catching step")]
    NotErrorCatching {
        module_id: String,
        module_path: String,
    },

    #[error("Step {module_id}/{module_path} only handles errors")]
    ErrorCatchingOnly {
        module_id: String,
        module_path: String,
    },
}

impl ResolveError {
    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload::new(ErrorKind::NotFound, self.to_string())
    }
}

/// Errors raised by the capability object handed to a step.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ContextError {
    #[error("User storage is unavailable: not logged in")]
    NotLoggedIn,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Capability(#[from] CapabilityError),
}

impl ContextError {
    pub fn to_payload(&self) -> ErrorPayload {
        match self {
            ContextError::NotLoggedIn => ErrorPayload::new(ErrorKind::NotLoggedIn, self.to_string()),
            ContextError::Store(e) => e.to_payload(),
            ContextError::Capability(e) => e.to_payload(),
        }
    }
}

/// Result type alias for the sandbox.
pub type Result<T> = std::result::Result<T, Error>;
