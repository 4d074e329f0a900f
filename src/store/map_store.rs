//! JSON-document map store with a single-writer FIFO queue.
//!
//! All operations on one store instance run strictly one at a time, in
//! submission order, on a dedicated task. Mutations re-read the whole
//! document, apply the change and write the whole document back.

use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::traits::{MapStoreHandle, StoredMap};
use crate::error::StoreError;
use crate::protocol::StorageOp;

/// The whole persisted document: `{ mapId: { key: value } }`.
type Document = Map<String, Value>;

type Reply = oneshot::Sender<Result<Value, StoreError>>;

struct StoreTask {
    op: StorageOp,
    reply: Reply,
}

enum Backing {
    File(PathBuf),
    Memory(Document),
}

impl Backing {
    async fn load(&self) -> Result<Document, StoreError> {
        let path = match self {
            Backing::Memory(doc) => return Ok(doc.clone()),
            Backing::File(path) => path,
        };

        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Document::new()),
            Err(e) => return Err(e.into()),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Document::new());
        }

        match serde_json::from_slice::<Value>(&bytes) {
            Ok(Value::Object(doc)) => Ok(doc),
            Ok(other) => Err(StoreError::Corrupt(format!(
                "{} holds {} instead of an object",
                path.display(),
                json_type(&other)
            ))),
            Err(e) => Err(StoreError::Corrupt(format!("{}: {e}", path.display()))),
        }
    }

    async fn save(&mut self, doc: Document) -> Result<(), StoreError> {
        let path = match self {
            Backing::Memory(current) => {
                *current = doc;
                return Ok(());
            }
            Backing::File(path) => path,
        };

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let bytes = serde_json::to_vec_pretty(&Value::Object(doc))?;
        let mut tmp: OsString = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &*path).await?;
        Ok(())
    }

    fn describe(&self) -> String {
        match self {
            Backing::File(path) => path.display().to_string(),
            Backing::Memory(_) => "memory".to_string(),
        }
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Reject bad input before the document is touched.
fn validate(op: &StorageOp) -> Result<(), StoreError> {
    if op.map_id().is_empty() {
        return Err(StoreError::Validation("mapId must not be empty".into()));
    }
    match op {
        StorageOp::Set { value, .. } if !value.is_object() => Err(StoreError::Validation(
            format!("map must be a plain object, got {}", json_type(value)),
        )),
        StorageOp::GetItem { key, .. } | StorageOp::DelItem { key, .. } if key.is_empty() => {
            Err(StoreError::Validation("key must not be empty".into()))
        }
        StorageOp::SetItem { key, value, .. } => {
            if key.is_empty() {
                Err(StoreError::Validation("key must not be empty".into()))
            } else if value.is_null() {
                Err(StoreError::Validation(format!("value for {key} is undefined")))
            } else {
                Ok(())
            }
        }
        _ => Ok(()),
    }
}

/// Apply `op` to an in-memory document and return the operation's result.
fn run_op(doc: &mut Document, op: StorageOp) -> Result<Value, StoreError> {
    match op {
        StorageOp::Get { map_id } => Ok(match doc.get(&map_id) {
            Some(Value::Object(map)) => Value::Object(map.clone()),
            _ => Value::Object(StoredMap::new()),
        }),
        StorageOp::GetItem { map_id, key } => Ok(doc
            .get(&map_id)
            .and_then(|map| map.get(&key))
            .cloned()
            .unwrap_or(Value::Null)),
        StorageOp::Set { map_id, value } => {
            doc.insert(map_id, value);
            Ok(Value::Null)
        }
        StorageOp::Del { map_id } => {
            doc.remove(&map_id);
            Ok(Value::Null)
        }
        StorageOp::SetItem { map_id, key, value } => {
            let entry = doc
                .entry(map_id.clone())
                .or_insert_with(|| Value::Object(StoredMap::new()));
            match entry {
                Value::Object(map) => {
                    map.insert(key, value);
                    Ok(Value::Null)
                }
                other => Err(StoreError::Corrupt(format!(
                    "map {map_id} holds {}",
                    json_type(other)
                ))),
            }
        }
        StorageOp::DelItem { map_id, key } => {
            if let Some(Value::Object(map)) = doc.get_mut(&map_id) {
                map.remove(&key);
            }
            Ok(Value::Null)
        }
    }
}

async fn run_queue(mut backing: Backing, mut rx: mpsc::UnboundedReceiver<StoreTask>) {
    let source = backing.describe();
    while let Some(StoreTask { op, reply }) = rx.recv().await {
        let map_id = op.map_id().to_string();
        let result = process(&mut backing, op).await;
        match &result {
            Ok(_) => debug!(store = %source, map_id = %map_id, "Store operation applied"),
            Err(e) => warn!(store = %source, map_id = %map_id, error = %e, "Store operation failed"),
        }
        // Caller may have gone away; the queue keeps going either way.
        let _ = reply.send(result);
    }
    debug!(store = %source, "Store queue closed");
}

async fn process(backing: &mut Backing, op: StorageOp) -> Result<Value, StoreError> {
    validate(&op)?;
    let mutation = op.is_mutation();
    let mut doc = backing.load().await?;
    let result = run_op(&mut doc, op)?;
    if mutation {
        backing.save(doc).await?;
    }
    Ok(result)
}

/// Key → object store persisted as one JSON document.
pub struct MapStore {
    tx: mpsc::UnboundedSender<StoreTask>,
}

impl MapStore {
    /// Open a store backed by the JSON file at `path`. The file is created on
    /// the first mutation. Must be called inside a Tokio runtime.
    pub fn open(path: impl Into<PathBuf>) -> Arc<Self> {
        Self::spawn(Backing::File(path.into()))
    }

    /// A store that never touches the filesystem.
    pub fn in_memory() -> Arc<Self> {
        Self::spawn(Backing::Memory(Document::new()))
    }

    fn spawn(backing: Backing) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_queue(backing, rx));
        Arc::new(Self { tx })
    }

    /// Enqueue an operation now and return a receiver for its result.
    ///
    /// Enqueueing is synchronous, so operations execute in the order
    /// `submit` is called regardless of when the receivers are awaited.
    pub fn submit(&self, op: StorageOp) -> oneshot::Receiver<Result<Value, StoreError>> {
        let (reply, rx) = oneshot::channel();
        // On a closed queue the reply sender is dropped and the caller sees `Closed`.
        let _ = self.tx.send(StoreTask { op, reply });
        rx
    }
}

#[async_trait]
impl MapStoreHandle for MapStore {
    async fn apply(&self, op: StorageOp) -> Result<Value, StoreError> {
        self.submit(op).await.unwrap_or(Err(StoreError::Closed))
    }
}
