//! Worker half of the broker: forwards capability and storage calls over the
//! process channel and matches the replies by `requestId`.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use tracing::warn;
use uuid::Uuid;

use super::CapabilityClient;
use super::correlator::{Correlator, Resolution};
use crate::error::{CapabilityError, ProtocolError, StoreError};
use crate::protocol::{
    CapabilityRequest, CapabilityResponse, Envelope, ErrorPayload, StorageOp, StorageRequest,
    StorageResponse,
};
use crate::store::MapStoreHandle;

type Reply = Result<Value, ErrorPayload>;

/// Why a forwarded request produced no reply.
enum Unanswered {
    Closed,
    TimedOut,
}

pub struct WorkerBroker {
    outbound: mpsc::UnboundedSender<Envelope>,
    capabilities: Mutex<Correlator<Uuid, Reply>>,
    storage: Mutex<Correlator<Uuid, Reply>>,
    timeout: Duration,
}

impl WorkerBroker {
    /// `timeout` bounds how long a single forwarded request may wait.
    pub fn new(outbound: mpsc::UnboundedSender<Envelope>, timeout: Duration) -> Self {
        Self {
            outbound,
            capabilities: Mutex::new(Correlator::new()),
            storage: Mutex::new(Correlator::new()),
            timeout,
        }
    }

    async fn forward(
        &self,
        table: &Mutex<Correlator<Uuid, Reply>>,
        request_id: Uuid,
        envelope: Envelope,
    ) -> Result<Reply, Unanswered> {
        let rx = table.lock().await.register(request_id);
        if self.outbound.send(envelope).is_err() {
            table.lock().await.cancel(&request_id);
            return Err(Unanswered::Closed);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(Unanswered::Closed),
            Err(_) => {
                table.lock().await.expire(&request_id);
                Err(Unanswered::TimedOut)
            }
        }
    }

    /// Hand a capability response to its waiter.
    pub async fn resolve_capability(&self, resp: CapabilityResponse) -> Result<(), ProtocolError> {
        let reply = match resp.err {
            Some(err) => Err(err),
            None => Ok(resp.info),
        };
        let outcome = self
            .capabilities
            .lock()
            .await
            .resolve(&resp.request_id, reply)?;
        if outcome == Resolution::Late {
            warn!(request_id = %resp.request_id, "Discarding late capability response");
        }
        Ok(())
    }

    /// Hand a storage response to its waiter.
    pub async fn resolve_storage(&self, resp: StorageResponse) -> Result<(), ProtocolError> {
        let reply = match resp.err {
            Some(err) => Err(err),
            None => Ok(resp.value),
        };
        let outcome = self.storage.lock().await.resolve(&resp.request_id, reply)?;
        if outcome == Resolution::Late {
            warn!(request_id = %resp.request_id, "Discarding late storage response");
        }
        Ok(())
    }

    /// Number of forwarded requests still waiting for a reply.
    pub async fn in_flight(&self) -> usize {
        self.capabilities.lock().await.len() + self.storage.lock().await.len()
    }
}

#[async_trait]
impl CapabilityClient for WorkerBroker {
    async fn request(
        &self,
        resource: &str,
        app_id: &str,
        device_id: &str,
    ) -> Result<Value, CapabilityError> {
        let request_id = Uuid::new_v4();
        let envelope = Envelope::CapabilityRequest(CapabilityRequest {
            request_id,
            resource_name: resource.to_string(),
            app_id: app_id.to_string(),
            device_id: device_id.to_string(),
        });

        match self.forward(&self.capabilities, request_id, envelope).await {
            Ok(Ok(info)) => Ok(info),
            Ok(Err(payload)) => Err(CapabilityError::Remote(payload)),
            Err(Unanswered::Closed) => Err(CapabilityError::ChannelClosed),
            Err(Unanswered::TimedOut) => Err(CapabilityError::Timeout {
                resource: resource.to_string(),
                timeout: self.timeout,
            }),
        }
    }
}

#[async_trait]
impl MapStoreHandle for WorkerBroker {
    async fn apply(&self, op: StorageOp) -> Result<Value, StoreError> {
        let request_id = Uuid::new_v4();
        let envelope = Envelope::StorageRequest(StorageRequest { request_id, op });

        match self.forward(&self.storage, request_id, envelope).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(payload)) => Err(StoreError::from_payload(payload)),
            Err(Unanswered::Closed) => Err(StoreError::Closed),
            Err(Unanswered::TimedOut) => Err(StoreError::Io(format!(
                "storage request {request_id} timed out after {:?}",
                self.timeout
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::protocol::ErrorKind;

    fn broker(timeout: Duration) -> (Arc<WorkerBroker>, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(WorkerBroker::new(tx, timeout)), rx)
    }

    #[tokio::test]
    async fn capability_round_trip() {
        let (broker, mut rx) = broker(Duration::from_secs(5));

        let caller = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move { broker.request("deviceinfos", "app", "d1").await })
        };

        let Some(Envelope::CapabilityRequest(req)) = rx.recv().await else {
            panic!("Expected capability request");
        };
        assert_eq!(req.resource_name, "deviceinfos");
        broker
            .resolve_capability(CapabilityResponse {
                request_id: req.request_id,
                err: None,
                info: json!({"model": "X"}),
            })
            .await
            .unwrap();

        assert_eq!(caller.await.unwrap().unwrap(), json!({"model": "X"}));
        assert_eq!(broker.in_flight().await, 0);
    }

    #[tokio::test]
    async fn remote_validation_error_maps_back() {
        let (broker, mut rx) = broker(Duration::from_secs(5));

        let caller = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move { broker.set("a/b", json!([])).await })
        };

        let Some(Envelope::StorageRequest(req)) = rx.recv().await else {
            panic!("Expected storage request");
        };
        broker
            .resolve_storage(StorageResponse {
                request_id: req.request_id,
                err: Some(ErrorPayload::new(ErrorKind::Validation, "not an object")),
                value: Value::Null,
            })
            .await
            .unwrap();

        assert!(matches!(
            caller.await.unwrap(),
            Err(StoreError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn unknown_response_is_protocol_error() {
        let (broker, _rx) = broker(Duration::from_secs(5));
        let err = broker
            .resolve_capability(CapabilityResponse {
                request_id: Uuid::new_v4(),
                err: None,
                info: Value::Null,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownRequest(_)));
    }

    #[tokio::test]
    async fn timeout_then_late_reply_is_discarded() {
        let (broker, mut rx) = broker(Duration::from_millis(50));

        let err = broker.request("appinfos", "app", "d1").await.unwrap_err();
        assert!(matches!(err, CapabilityError::Timeout { .. }));

        let Some(Envelope::CapabilityRequest(req)) = rx.recv().await else {
            panic!("Expected capability request");
        };
        // Late, not unknown.
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
    async fn closed_channel_fails_fast() {
        let (broker, rx) = broker(Duration::from_secs(5));
        drop(rx);
        assert!(matches!(
            broker.get_item("a/b", "k").await,
            Err(StoreError::Closed)
        ));
        assert_eq!(broker.in_flight().await, 0);
    }
}
