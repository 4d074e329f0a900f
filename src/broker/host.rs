//! Supervisor half of the broker: answers worker requests from the config
//! service and the map store.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::CapabilityClient;
use crate::config_service::ConfigService;
use crate::error::{CapabilityError, StoreError};
use crate::protocol::{CapabilityRequest, CapabilityResponse, StorageRequest, StorageResponse};
use crate::store::MapStore;

/// Resolves capability and storage requests on behalf of the worker.
///
/// App/device info is cached per `(resource, deviceId)` for the lifetime of
/// the broker; there is no invalidation.
pub struct HostBroker {
    service: Arc<dyn ConfigService>,
    store: Arc<MapStore>,
    cache: RwLock<HashMap<(String, String), Value>>,
}

impl HostBroker {
    pub fn new(service: Arc<dyn ConfigService>, store: Arc<MapStore>) -> Self {
        Self {
            service,
            store,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<MapStore> {
        &self.store
    }

    /// Answer a worker's capability request. Failures travel back as `err`.
    pub async fn answer_capability(&self, req: CapabilityRequest) -> CapabilityResponse {
        match self
            .request(&req.resource_name, &req.app_id, &req.device_id)
            .await
        {
            Ok(info) => CapabilityResponse {
                request_id: req.request_id,
                err: None,
                info,
            },
            Err(e) => {
                warn!(
                    request_id = %req.request_id,
                    resource = %req.resource_name,
                    error = %e,
                    "Capability request failed"
                );
                CapabilityResponse {
                    request_id: req.request_id,
                    err: Some(e.to_payload()),
                    info: Value::Null,
                }
            }
        }
    }

    /// Answer a worker's storage request.
    ///
    /// The operation joins the store queue before this returns, so calling it
    /// in channel order keeps storage operations in channel order.
    pub fn answer_storage(&self, req: StorageRequest) -> BoxFuture<'static, StorageResponse> {
        let request_id = req.request_id;
        let pending = self.store.submit(req.op);
        async move {
            match pending.await.unwrap_or(Err(StoreError::Closed)) {
                Ok(value) => StorageResponse {
                    request_id,
                    err: None,
                    value,
                },
                Err(e) => StorageResponse {
                    request_id,
                    err: Some(e.to_payload()),
                    value: Value::Null,
                },
            }
        }
        .boxed()
    }

    /// Number of cached info entries.
    pub async fn cached_entries(&self) -> usize {
        self.cache.read().await.len()
    }
}

#[async_trait]
impl CapabilityClient for HostBroker {
    async fn request(
        &self,
        resource: &str,
        app_id: &str,
        device_id: &str,
    ) -> Result<Value, CapabilityError> {
        let key = (resource.to_string(), device_id.to_string());
        if let Some(info) = self.cache.read().await.get(&key) {
            debug!(resource, device_id, "Capability cache hit");
            return Ok(info.clone());
        }

        let info = self.service.get_info(resource, app_id, device_id).await?;
        self.cache.write().await.insert(key, info.clone());
        Ok(info)
    }
}
