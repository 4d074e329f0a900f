//! Execution context — the capability object handed to every step.
//!
//! A `Context` is built fresh for each execution and scopes storage,
//! settings and info lookups to one `(app, extension, device, user)`.
//! It never touches the store file or the network itself: storage goes
//! through a [`MapStoreHandle`] and info through a [`CapabilityClient`].

use std::sync::Arc;

use serde_json::Value;

use crate::broker::CapabilityClient;
use crate::config_service::{APP_INFOS, DEVICE_INFOS};
use crate::error::ContextError;
use crate::protocol::{ExecutionMeta, LogLevel};
use crate::store::{MapStoreHandle, StoredMap};

/// Logger handed to steps as `ctx.log`.
pub trait StepLog: Send + Sync {
    fn log(&self, level: LogLevel, message: &str);

    fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }

    fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }
}

/// Step logger that writes straight to `tracing`.
pub struct TracingLog {
    scope: String,
}

impl TracingLog {
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
        }
    }
}

impl StepLog for TracingLog {
    fn log(&self, level: LogLevel, message: &str) {
        let scope = self.scope.as_str();
        match level {
            LogLevel::Debug => tracing::debug!(target: "step", scope, "{message}"),
            LogLevel::Info => tracing::info!(target: "step", scope, "{message}"),
            LogLevel::Warn => tracing::warn!(target: "step", scope, "{message}"),
            LogLevel::Error => tracing::error!(target: "step", scope, "{message}"),
        }
    }
}

/// Storage scope discriminators used in map ids.
const EXTENSION_SCOPE: &str = "extension";
const DEVICE_SCOPE: &str = "device";
const USER_SCOPE: &str = "user";

/// `app/extension/scope[/subject]`
pub fn map_id(app_id: &str, extension_id: &str, scope: &str, subject: Option<&str>) -> String {
    match subject {
        Some(subject) => format!("{app_id}/{extension_id}/{scope}/{subject}"),
        None => format!("{app_id}/{extension_id}/{scope}"),
    }
}

/// Key/value storage bound to one map.
#[derive(Clone)]
pub struct ScopedStorage {
    /// `None` when the scope is unavailable (user storage without a user).
    map_id: Option<String>,
    store: Arc<dyn MapStoreHandle>,
}

impl ScopedStorage {
    fn map_id(&self) -> Result<&str, ContextError> {
        self.map_id.as_deref().ok_or(ContextError::NotLoggedIn)
    }

    pub async fn get(&self, key: &str) -> Result<Option<Value>, ContextError> {
        let map_id = self.map_id()?;
        Ok(self.store.get_item(map_id, key).await?)
    }

    pub async fn set(&self, key: &str, value: Value) -> Result<(), ContextError> {
        let map_id = self.map_id()?;
        Ok(self.store.set_item(map_id, key, value).await?)
    }

    pub async fn del(&self, key: &str) -> Result<(), ContextError> {
        let map_id = self.map_id()?;
        Ok(self.store.del_item(map_id, key).await?)
    }

    /// The whole map for this scope.
    pub async fn entries(&self) -> Result<StoredMap, ContextError> {
        let map_id = self.map_id()?;
        Ok(self.store.get(map_id).await?)
    }

    pub fn is_available(&self) -> bool {
        self.map_id.is_some()
    }
}

/// Read-only view of the extension-scoped map: `get` only.
#[derive(Clone)]
pub struct Settings {
    map_id: String,
    store: Arc<dyn MapStoreHandle>,
}

impl Settings {
    pub async fn get(&self, key: &str) -> Result<Option<Value>, ContextError> {
        Ok(self.store.get_item(&self.map_id, key).await?)
    }
}

#[derive(Clone)]
pub struct Storage {
    pub extension: ScopedStorage,
    pub device: ScopedStorage,
    pub user: ScopedStorage,
}

/// `getInfo` for one resource (`appinfos` or `deviceinfos`).
#[derive(Clone)]
pub struct InfoAccessor {
    resource: &'static str,
    app_id: String,
    device_id: String,
    client: Arc<dyn CapabilityClient>,
}

impl InfoAccessor {
    /// Bounded by the client; the worker's broker applies the capability timeout.
    pub async fn get_info(&self) -> Result<Value, ContextError> {
        Ok(self
            .client
            .request(self.resource, &self.app_id, &self.device_id)
            .await?)
    }
}

/// Capability object for one execution.
#[derive(Clone)]
pub struct Context {
    pub storage: Storage,
    pub settings: Settings,
    pub app: InfoAccessor,
    pub device: InfoAccessor,
    pub log: Arc<dyn StepLog>,
    pub meta: ExecutionMeta,
    pub extension_id: String,
}

/// Build the Context for one execution.
pub fn build_context(
    store: Arc<dyn MapStoreHandle>,
    client: Arc<dyn CapabilityClient>,
    extension_id: &str,
    meta: &ExecutionMeta,
    log: Arc<dyn StepLog>,
) -> Context {
    let app_id = meta.app_id.as_str();
    let extension_map = map_id(app_id, extension_id, EXTENSION_SCOPE, None);

    let scoped = |map_id: Option<String>| ScopedStorage {
        map_id,
        store: Arc::clone(&store),
    };
    let info = |resource: &'static str| InfoAccessor {
        resource,
        app_id: meta.app_id.clone(),
        device_id: meta.device_id.clone(),
        client: Arc::clone(&client),
    };

    Context {
        storage: Storage {
            extension: scoped(Some(extension_map.clone())),
            device: scoped(Some(map_id(
                app_id,
                extension_id,
                DEVICE_SCOPE,
                Some(&meta.device_id),
            ))),
            user: scoped(
                meta.user_id
                    .as_deref()
                    .map(|user| map_id(app_id, extension_id, USER_SCOPE, Some(user))),
            ),
        },
        settings: Settings {
            map_id: extension_map,
            store: Arc::clone(&store),
        },
        app: info(APP_INFOS),
        device: info(DEVICE_INFOS),
        log,
        meta: meta.clone(),
        extension_id: extension_id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::broker::{HostBroker, WorkerBroker};
    use crate::config_service::StaticConfigService;
    use crate::error::{CapabilityError, StoreError};
    use crate::protocol::{CapabilityResponse, Envelope, StorageOp};
    use crate::store::MapStore;

    /// Counts every store access.
    struct CountingStore {
        inner: Arc<MapStore>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MapStoreHandle for CountingStore {
        async fn apply(&self, op: StorageOp) -> Result<Value, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.apply(op).await
        }
    }

    fn context_with(
        store: Arc<dyn MapStoreHandle>,
        client: Arc<dyn CapabilityClient>,
        meta: ExecutionMeta,
    ) -> Context {
        build_context(
            store,
            client,
            "ext",
            &meta,
            Arc::new(TracingLog::new("test")),
        )
    }

    fn host(store: Arc<MapStore>) -> Arc<HostBroker> {
        let service = StaticConfigService::new()
            .with_app("app", json!({"name": "Demo"}))
            .with_device("d1", json!({"model": "X"}));
        Arc::new(HostBroker::new(Arc::new(service), store))
    }

    #[tokio::test]
    async fn scopes_map_to_deterministic_ids() {
        let store = MapStore::in_memory();
        let ctx = context_with(
            store.clone(),
            host(store.clone()),
            ExecutionMeta::new("app", "d1").with_user("u1"),
        );

        ctx.storage.extension.set("a", json!(1)).await.unwrap();
        ctx.storage.device.set("b", json!(2)).await.unwrap();
        ctx.storage.user.set("c", json!(3)).await.unwrap();

        assert_eq!(store.get_item("app/ext/extension", "a").await.unwrap(), Some(json!(1)));
        assert_eq!(store.get_item("app/ext/device/d1", "b").await.unwrap(), Some(json!(2)));
        assert_eq!(store.get_item("app/ext/user/u1", "c").await.unwrap(), Some(json!(3)));

        ctx.storage.device.del("b").await.unwrap();
        assert_eq!(ctx.storage.device.get("b").await.unwrap(), None);
        assert_eq!(ctx.storage.extension.entries().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn user_storage_requires_login_and_skips_store() {
        let counting = Arc::new(CountingStore {
            inner: MapStore::in_memory(),
            calls: AtomicUsize::new(0),
        });
        let ctx = context_with(
            counting.clone(),
            host(MapStore::in_memory()),
            ExecutionMeta::new("app", "d1"),
        );

        assert!(!ctx.storage.user.is_available());
        assert!(matches!(ctx.storage.user.get("k").await, Err(ContextError::NotLoggedIn)));
        assert!(matches!(
            ctx.storage.user.set("k", json!(1)).await,
            Err(ContextError::NotLoggedIn)
        ));
        assert!(matches!(ctx.storage.user.del("k").await, Err(ContextError::NotLoggedIn)));
        assert_eq!(counting.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn settings_read_extension_map() {
        let store = MapStore::in_memory();
        store
            .set("app/ext/extension", json!({"threshold": 5}))
            .await
            .unwrap();
        let ctx = context_with(store.clone(), host(store), ExecutionMeta::new("app", "d1"));

        assert_eq!(ctx.settings.get("threshold").await.unwrap(), Some(json!(5)));
        assert_eq!(ctx.settings.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn info_accessors_use_resource_names() {
        let store = MapStore::in_memory();
        let ctx = context_with(store.clone(), host(store), ExecutionMeta::new("app", "d1"));

        assert_eq!(ctx.app.get_info().await.unwrap()["name"], "Demo");
        assert_eq!(ctx.device.get_info().await.unwrap()["model"], "X");
    }

    #[tokio::test]
    async fn timed_out_info_lookup_is_expired_in_the_broker() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let broker = Arc::new(WorkerBroker::new(tx, Duration::from_millis(50)));
        let ctx = context_with(
            MapStore::in_memory(),
            broker.clone(),
            ExecutionMeta::new("app", "d1"),
        );

        let err = ctx.device.get_info().await.unwrap_err();
        assert!(matches!(
            err,
            ContextError::Capability(CapabilityError::Timeout { .. })
        ));
        assert_eq!(broker.in_flight().await, 0);

        let Some(Envelope::CapabilityRequest(req)) = rx.recv().await else {
            panic!("Expected capability request");
        };
        assert_eq!(req.resource_name, DEVICE_INFOS);
        broker
            .resolve_capability(CapabilityResponse {
                request_id: req.request_id,
                err: None,
                info: json!({}),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn store_errors_reach_the_step() {
        let store = MapStore::in_memory();
        let ctx = context_with(store.clone(), host(store), ExecutionMeta::new("app", "d1"));
        let err = ctx.storage.device.set("k", Value::Null).await.unwrap_err();
        assert!(matches!(err, ContextError::Store(StoreError::Validation(_))));
    }

    #[test]
    fn map_id_layout() {
        assert_eq!(map_id("a", "e", "extension", None), "a/e/extension");
        assert_eq!(map_id("a", "e", "user", Some("u")), "a/e/user/u");
    }
}
