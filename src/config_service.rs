//! Config service — where app and device info ultimately comes from.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;

use crate::error::CapabilityError;

/// Resource name for per-app metadata.
pub const APP_INFOS: &str = "appinfos";
/// Resource name for per-device metadata.
pub const DEVICE_INFOS: &str = "deviceinfos";

/// Remote lookup of app/device info by key.
#[async_trait]
pub trait ConfigService: Send + Sync {
    async fn get_info(
        &self,
        resource: &str,
        app_id: &str,
        device_id: &str,
    ) -> Result<Value, CapabilityError>;
}

/// In-memory config service, used by the CLI and tests.
#[derive(Default)]
pub struct StaticConfigService {
    entries: HashMap<(String, String), Value>,
    calls: AtomicUsize,
}

impl StaticConfigService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_app(mut self, app_id: impl Into<String>, info: Value) -> Self {
        self.entries.insert((APP_INFOS.to_string(), app_id.into()), info);
        self
    }

    pub fn with_device(mut self, device_id: impl Into<String>, info: Value) -> Self {
        self.entries
            .insert((DEVICE_INFOS.to_string(), device_id.into()), info);
        self
    }

    /// Number of lookups served so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConfigService for StaticConfigService {
    async fn get_info(
        &self,
        resource: &str,
        app_id: &str,
        device_id: &str,
    ) -> Result<Value, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let key = match resource {
            APP_INFOS => app_id,
            DEVICE_INFOS => device_id,
            other => {
                return Err(CapabilityError::Service {
                    resource: other.to_string(),
                    reason: "unknown resource".to_string(),
                });
            }
        };
        self.entries
            .get(&(resource.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| CapabilityError::Service {
                resource: resource.to_string(),
                reason: format!("no entry for {key}"),
            })
    }
}

/// Config service reached over HTTP: `GET {base}/{resource}/{appId}/{deviceId}`.
pub struct HttpConfigService {
    client: reqwest::Client,
    base_url: String,
    token: Option<SecretString>,
}

impl HttpConfigService {
    pub fn new(base_url: impl Into<String>, token: Option<SecretString>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    fn url(&self, resource: &str, app_id: &str, device_id: &str) -> String {
        format!("{}/{}/{}/{}", self.base_url, resource, app_id, device_id)
    }
}

#[async_trait]
impl ConfigService for HttpConfigService {
    async fn get_info(
        &self,
        resource: &str,
        app_id: &str,
        device_id: &str,
    ) -> Result<Value, CapabilityError> {
        let fail = |reason: String| CapabilityError::Service {
            resource: resource.to_string(),
            reason,
        };

        let mut request = self.client.get(self.url(resource, app_id, device_id));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request
            .send()
            .await
            .map_err(|e| fail(e.to_string()))?
            .error_for_status()
            .map_err(|e| fail(e.to_string()))?;

        response.json::<Value>().await.map_err(|e| fail(e.to_string()))
    }
}
