//! Wire protocol between the supervisor and the worker process.
//!
//! Envelopes are JSON objects tagged by `type`, one per line. The worker
//! reads them from stdin and writes its own to stdout:
//!
//! - `ready` — worker → supervisor, once, after startup
//! - `execute` / `result` — one step invocation, correlated by `callId`
//! - `capabilityRequest` / `capabilityResponse` — app/device info, by `requestId`
//! - `storageRequest` / `storageResponse` — map store access, by `requestId`
//! - `log` — worker → supervisor, fire-and-forget

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::ProtocolError;

/// Error taxonomy as it travels over the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Timeout,
    Crash,
    Protocol,
    Capability,
    NotLoggedIn,
    Store,
    Step,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "ValidationError",
            Self::NotFound => "NotFoundError",
            Self::Timeout => "TimeoutError",
            Self::Crash => "CrashError",
            Self::Protocol => "ProtocolError",
            Self::Capability => "CapabilityError",
            Self::NotLoggedIn => "NotLoggedInError",
            Self::Store => "StoreError",
            Self::Step => "StepError",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        let kind = match name {
            "ValidationError" => Self::Validation,
            "NotFoundError" => Self::NotFound,
            "TimeoutError" => Self::Timeout,
            "CrashError" => Self::Crash,
            "ProtocolError" => Self::Protocol,
            "CapabilityError" => Self::Capability,
            "NotLoggedInError" => Self::NotLoggedIn,
            "StoreError" => Self::Store,
            "StepError" => Self::Step,
            _ => return None,
        };
        Some(kind)
    }
}

/// An error value carried inside an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub name: String,
    pub message: String,
}

impl ErrorPayload {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            name: kind.as_str().to_string(),
            message: message.into(),
        }
    }

    /// A step-defined error with an arbitrary name.
    pub fn named(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        ErrorKind::parse(&self.name)
    }
}

impl std::fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

/// Which step implementation to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepReference {
    pub module_id: String,
    pub module_path: String,
    #[serde(default)]
    pub is_error_catching: bool,
    #[serde(default)]
    pub catchable_error: Option<ErrorPayload>,
}

impl StepReference {
    pub fn new(module_id: impl Into<String>, module_path: impl Into<String>) -> Self {
        Self {
            module_id: module_id.into(),
            module_path: module_path.into(),
            is_error_catching: false,
            catchable_error: None,
        }
    }

    /// Reference an error-catching step that receives `error`.
    pub fn catching(
        module_id: impl Into<String>,
        module_path: impl Into<String>,
        error: ErrorPayload,
    ) -> Self {
        Self {
            module_id: module_id.into(),
            module_path: module_path.into(),
            is_error_catching: true,
            catchable_error: Some(error),
        }
    }
}

/// Who a step runs on behalf of.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMeta {
    pub app_id: String,
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl ExecutionMeta {
    pub fn new(app_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            device_id: device_id.into(),
            user_id: None,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub call_id: u64,
    #[serde(default)]
    pub input: Value,
    pub step_reference: StepReference,
    pub execution_meta: ExecutionMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub call_id: u64,
    #[serde(default)]
    pub err: Option<ErrorPayload>,
    #[serde(default)]
    pub output: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityRequest {
    pub request_id: Uuid,
    pub resource_name: String,
    pub app_id: String,
    pub device_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityResponse {
    pub request_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<ErrorPayload>,
    #[serde(default)]
    pub info: Value,
}

/// A single map store operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum StorageOp {
    #[serde(rename_all = "camelCase")]
    Get { map_id: String },
    #[serde(rename_all = "camelCase")]
    Set {
        map_id: String,
        #[serde(default)]
        value: Value,
    },
    #[serde(rename_all = "camelCase")]
    Del { map_id: String },
    #[serde(rename_all = "camelCase")]
    GetItem { map_id: String, key: String },
    #[serde(rename_all = "camelCase")]
    SetItem {
        map_id: String,
        key: String,
        #[serde(default)]
        value: Value,
    },
    #[serde(rename_all = "camelCase")]
    DelItem { map_id: String, key: String },
}

impl StorageOp {
    pub fn map_id(&self) -> &str {
        match self {
            Self::Get { map_id }
            | Self::Set { map_id, .. }
            | Self::Del { map_id }
            | Self::GetItem { map_id, .. }
            | Self::SetItem { map_id, .. }
            | Self::DelItem { map_id, .. } => map_id,
        }
    }

    pub fn is_mutation(&self) -> bool {
        !matches!(self, Self::Get { .. } | Self::GetItem { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageRequest {
    pub request_id: Uuid,
    pub op: StorageOp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageResponse {
    pub request_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<ErrorPayload>,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: LogLevel,
    #[serde(default)]
    pub arguments: Vec<Value>,
}

impl LogRecord {
    /// Join the arguments the way a console would print them.
    pub fn message(&self) -> String {
        self.arguments
            .iter()
            .map(|arg| match arg {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyNotice {
    pub pid: u32,
}

/// Every message that crosses the process boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Envelope {
    Ready(ReadyNotice),
    Execute(ExecutionRequest),
    Result(ExecutionResult),
    CapabilityRequest(CapabilityRequest),
    CapabilityResponse(CapabilityResponse),
    StorageRequest(StorageRequest),
    StorageResponse(StorageResponse),
    Log(LogRecord),
}

impl Envelope {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Ready(_) => "ready",
            Self::Execute(_) => "execute",
            Self::Result(_) => "result",
            Self::CapabilityRequest(_) => "capabilityRequest",
            Self::CapabilityResponse(_) => "capabilityResponse",
            Self::StorageRequest(_) => "storageRequest",
            Self::StorageResponse(_) => "storageResponse",
            Self::Log(_) => "log",
        }
    }
}

/// Serialize an envelope to a single line (without the trailing newline).
pub fn encode(envelope: &Envelope) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(envelope)?)
}

pub fn decode(line: &str) -> Result<Envelope, ProtocolError> {
    Ok(serde_json::from_str(line.trim())?)
}

/// Decode a raw line read off a pipe. Bytes that are not UTF-8 are malformed.
pub fn decode_bytes(line: &[u8]) -> Result<Envelope, ProtocolError> {
    let line = std::str::from_utf8(line).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    decode(line)
}

/// Drain `rx` onto `writer`, one envelope per line, until every sender is
/// dropped or the pipe breaks.
pub async fn write_envelopes<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Envelope>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(envelope) = rx.recv().await {
        let mut line = match encode(&envelope) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(error = %e, kind = envelope.type_name(), "Failed to encode envelope");
                continue;
            }
        };
        line.push('\n');
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            tracing::debug!(error = %e, "Envelope writer closed");
            break;
        }
        if let Err(e) = writer.flush().await {
            tracing::debug!(error = %e, "Envelope writer closed");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn execute_envelope_uses_camel_case_tags() {
        let envelope = Envelope::Execute(ExecutionRequest {
            call_id: 7,
            input: json!({"a": 1}),
            step_reference: StepReference::new("builtin", "echo"),
            execution_meta: ExecutionMeta::new("app", "dev"),
        });

        let value: Value = serde_json::from_str(&encode(&envelope).unwrap()).unwrap();
        assert_eq!(value["type"], "execute");
        assert_eq!(value["callId"], 7);
        assert_eq!(value["stepReference"]["modulePath"], "echo");
        assert_eq!(value["stepReference"]["isErrorCatching"], false);
        assert_eq!(value["executionMeta"]["appId"], "app");
        assert!(value["executionMeta"].get("userId").is_none());
    }

    #[test]
    fn decodes_result_without_output() {
        let line = r#"{"type":"result","callId":3,"err":{"name":"NotFoundError","message":"nope"}}"#;
        match decode(line).unwrap() {
            Envelope::Result(result) => {
                assert_eq!(result.call_id, 3);
                assert_eq!(result.output, None);
                assert_eq!(result.err.unwrap().kind(), Some(ErrorKind::NotFound));
            }
            other => panic!("Expected result, got {other:?}"),
        }
    }

    #[test]
    fn storage_op_missing_value_decodes_as_null() {
        let line = format!(
            r#"{{"type":"storageRequest","requestId":"{}","op":{{"kind":"setItem","mapId":"a/b","key":"k"}}}}"#,
            Uuid::new_v4()
        );
        match decode(&line).unwrap() {
            Envelope::StorageRequest(req) => {
                assert_eq!(
                    req.op,
                    StorageOp::SetItem {
                        map_id: "a/b".into(),
                        key: "k".into(),
                        value: Value::Null,
                    }
                );
                assert!(req.op.is_mutation());
            }
            other => panic!("Expected storage request, got {other:?}"),
        }
    }

    #[test]
    fn log_record_joins_arguments() {
        let record = LogRecord {
            level: LogLevel::Warn,
            arguments: vec![json!("count"), json!(3), json!({"k": true})],
        };
        assert_eq!(record.message(), r#"count 3 {"k":true}"#);
    }

    #[test]
    fn malformed_line_is_protocol_error() {
        assert!(matches!(decode("{not json"), Err(ProtocolError::Malformed(_))));
        assert!(matches!(
            decode_bytes(b"\xff\xfe garbage"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            decode_bytes(br#"{"type":"ready","pid":3}"#).unwrap(),
            Envelope::Ready(ReadyNotice { pid: 3 })
        ));
        assert!(matches!(
            decode(r#"{"type":"bogus"}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn writer_emits_one_line_per_envelope() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut buf = Vec::new();
        tx.send(Envelope::Ready(ReadyNotice { pid: 1 })).unwrap();
        tx.send(Envelope::Log(LogRecord {
            level: LogLevel::Info,
            arguments: vec![json!("hi")],
        }))
        .unwrap();
        drop(tx);

        write_envelopes(&mut buf, rx).await;

        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(matches!(decode(lines[0]).unwrap(), Envelope::Ready(ReadyNotice { pid: 1 })));
    }
}
