//! Log records and the envelopes they are mapped to on the wire.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::config::PayloadMetadata;

/// Maps a log record to the `event` body sent to the collector.
pub type EventFormatter = Arc<dyn Fn(&LogRecord) -> Value + Send + Sync>;

/// A single record handed to the transport by the host framework.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Level name as the host framework reports it
    pub level: String,

    /// Log message content
    pub message: String,

    /// Additional structured metadata
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub meta: Map<String, Value>,
}

impl LogRecord {
    /// Create a new record with no metadata.
    pub fn new(level: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            message: message.into(),
            meta: Map::new(),
        }
    }

    /// Attach metadata to the record.
    pub fn with_meta(mut self, meta: Map<String, Value>) -> Self {
        self.meta = meta;
        self
    }
}

/// Built-in formatter.
///
/// Produces `{"message": {"msg": ..., "meta": {...}}, "severity": ...}`; `meta`
/// is left out when the record carries none.
pub fn default_formatter(record: &LogRecord) -> Value {
    let mut message = Map::new();
    message.insert("msg".to_string(), Value::String(record.message.clone()));
    if !record.meta.is_empty() {
        message.insert("meta".to_string(), Value::Object(record.meta.clone()));
    }

    json!({
        "message": message,
        "severity": record.level,
    })
}

/// One event as the collector receives it: the formatted body plus the routing
/// metadata (`source`, `sourcetype`, `host`, `index`, `time`) at the top level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event: Value,

    #[serde(flatten)]
    pub metadata: PayloadMetadata,
}

impl EventEnvelope {
    pub fn new(event: Value, metadata: &PayloadMetadata) -> Self {
        Self {
            event,
            metadata: metadata.clone(),
        }
    }

    /// Format `record` and wrap it with `metadata`.
    pub fn from_record(
        record: &LogRecord,
        formatter: &EventFormatter,
        metadata: &PayloadMetadata,
    ) -> Self {
        Self::new(formatter(record), metadata)
    }
}
