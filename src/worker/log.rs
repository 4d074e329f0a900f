//! Step logger that ships records to the supervisor.

use serde_json::Value;
use tokio::sync::mpsc;

use crate::context::StepLog;
use crate::protocol::{Envelope, LogLevel, LogRecord};

pub struct ChannelLog {
    outbound: mpsc::UnboundedSender<Envelope>,
    call_id: u64,
}

impl ChannelLog {
    pub fn new(outbound: mpsc::UnboundedSender<Envelope>, call_id: u64) -> Self {
        Self { outbound, call_id }
    }
}

impl StepLog for ChannelLog {
    fn log(&self, level: LogLevel, message: &str) {
        let record = LogRecord {
            level,
            arguments: vec![Value::String(message.to_string())],
        };
        if self.outbound.send(Envelope::Log(record)).is_err() {
            tracing::debug!(call_id = self.call_id, "Log dropped, supervisor channel closed");
        }
    }
}
