//! Wire-level envelopes for the push channel
//!
//! Every message a subscriber receives is one of three envelopes:
//!
//! - `{"type": "log", "ts": …, "level": …, "payload": {"message": …, "plugin"?: …}}`
//! - `{"type": "update", "object": "workflow_run" | "submissions", "payload": …}`
//! - `{"type": "close", "reason": …}`
//!
//! An optional `seq` field is stamped by the indexed bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Topic;

/// Severity of a log envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    /// Wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

/// Payload of a log envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogPayload {
    pub message: String,
    /// Present when the line was emitted through a plugin child logger
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,
}

/// Entity class an update envelope refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateObject {
    WorkflowRun,
    Submissions,
}

/// A wire-level message on the push channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Envelope {
    /// Structured log line
    Log {
        #[serde(skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
        /// Stamped when the entry was enqueued, not when it was delivered
        ts: DateTime<Utc>,
        level: LogLevel,
        payload: LogPayload,
    },
    /// Post-commit entity update; payload items always include `id` plus the
    /// changed fields
    Update {
        #[serde(skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
        object: UpdateObject,
        payload: Value,
    },
    /// Terminal envelope
    Close {
        #[serde(skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
        reason: String,
    },
}

impl Envelope {
    /// Log envelope with an explicit timestamp
    pub fn log(ts: DateTime<Utc>, level: LogLevel, payload: LogPayload) -> Self {
        Self::Log {
            seq: None,
            ts,
            level,
            payload,
        }
    }

    /// Update envelope for the given entity class
    pub fn update(object: UpdateObject, payload: Value) -> Self {
        Self::Update {
            seq: None,
            object,
            payload,
        }
    }

    /// Close envelope with a human-readable reason
    pub fn close(reason: impl Into<String>) -> Self {
        Self::Close {
            seq: None,
            reason: reason.into(),
        }
    }

    /// Topic this envelope is published on
    pub fn topic(&self) -> Topic {
        match self {
            Self::Log { .. } => Topic::Log,
            Self::Update { .. } => Topic::Update,
            Self::Close { .. } => Topic::Close,
        }
    }

    /// Sequence number stamped by the indexed bus, if any
    pub fn seq(&self) -> Option<u64> {
        match self {
            Self::Log { seq, .. } | Self::Update { seq, .. } | Self::Close { seq, .. } => *seq,
        }
    }

    pub(crate) fn set_seq(&mut self, n: u64) {
        match self {
            Self::Log { seq, .. } | Self::Update { seq, .. } | Self::Close { seq, .. } => {
                *seq = Some(n)
            }
        }
    }

    /// Close reason, when this is a close envelope
    pub fn close_reason(&self) -> Option<&str> {
        match self {
            Self::Close { reason, .. } => Some(reason),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_log_envelope_wire_shape() {
        let envelope = Envelope::log(
            Utc::now(),
            LogLevel::Info,
            LogPayload {
                message: "hello".to_string(),
                plugin: None,
            },
        );
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["type"], "log");
        assert_eq!(value["level"], "info");
        assert_eq!(value["payload"]["message"], "hello");
        assert!(value["payload"].get("plugin").is_none());
        assert!(value.get("seq").is_none());
    }

    #[test]
    fn test_plugin_tag_serialized() {
        let envelope = Envelope::log(
            Utc::now(),
            LogLevel::Error,
            LogPayload {
                message: "boom".to_string(),
                plugin: Some("demo.transcriber".to_string()),
            },
        );
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["payload"]["plugin"], "demo.transcriber");
    }

    #[test]
    fn test_update_envelope_wire_shape() {
        let envelope = Envelope::update(UpdateObject::WorkflowRun, json!({"id": "x", "status": "running"}));
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["type"], "update");
        assert_eq!(value["object"], "workflow_run");
        assert_eq!(value["payload"]["status"], "running");
    }

    #[test]
    fn test_close_envelope_round_trip() {
        let envelope = Envelope::close("session completed");
        let text = serde_json::to_string(&envelope).unwrap();
        let back: Envelope = serde_json::from_str(&text).unwrap();
        assert_eq!(back.close_reason(), Some("session completed"));
        assert_eq!(back.topic(), Topic::Close);
    }

    #[test]
    fn test_seq_stamping() {
        let mut envelope = Envelope::close("done");
        assert_eq!(envelope.seq(), None);
        envelope.set_seq(41);
        assert_eq!(envelope.seq(), Some(41));
    }
}
