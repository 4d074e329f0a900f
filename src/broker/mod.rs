//! Correlation broker — request/response pairing across the process boundary.
//!
//! - `correlator` — pending-request table shared by both halves
//! - `host` — supervisor side, backed by the config service and map store
//! - `remote` — worker side, forwarding over the process channel

pub mod correlator;
pub mod host;
pub mod remote;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::CapabilityError;

pub use correlator::{Correlator, Resolution};
pub use host::HostBroker;
pub use remote::WorkerBroker;

/// Source of app/device info for a Context.
#[async_trait]
pub trait CapabilityClient: Send + Sync {
    async fn request(
        &self,
        resource: &str,
        app_id: &str,
        device_id: &str,
    ) -> Result<Value, CapabilityError>;
}
