//! The wire envelope — one server push message.
//!
//! Every message on the evaluation event channel is a single JSON object:
//! `{event: <kind>, data: <object>, timestamp: <epoch-millis | RFC 3339>}`.
//! Fields in `data` beyond the ones we read are preserved verbatim so the
//! debug timeline can show everything the producer sent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::TrackerError;

/// The closed set of event kinds the pipeline emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    WorkflowStart,
    VendorStart,
    AgentStart,
    AgentProgress,
    AgentComplete,
    WorkflowComplete,
    WorkflowError,
}

impl EventKind {
    /// Terminal events end the logical stream for an evaluation.
    pub fn is_terminal(self) -> bool {
        matches!(self, EventKind::WorkflowComplete | EventKind::WorkflowError)
    }
}

/// One event received from the evaluation stream. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamEvent {
    #[serde(rename = "event")]
    pub kind: EventKind,
    pub data: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

/// Raw shape of an envelope before validation.
#[derive(Debug, Deserialize)]
struct WireEnvelope {
    event: EventKind,
    #[serde(default)]
    data: Map<String, Value>,
    #[serde(default)]
    timestamp: Option<Value>,
}

impl StreamEvent {
    /// Parse and validate one envelope from the push channel.
    ///
    /// Unknown kinds, unparseable JSON, bad timestamps, or a missing
    /// per-kind required field all fail here — the reducer never sees a
    /// malformed envelope. A missing timestamp is tolerated (arrival time
    /// is substituted); a present-but-garbled one is not.
    pub fn parse(raw: &str) -> Result<Self, TrackerError> {
        let wire: WireEnvelope = serde_json::from_str(raw)
            .map_err(|e| TrackerError::MalformedEnvelope(e.to_string()))?;

        let timestamp = match wire.timestamp {
            None | Some(Value::Null) => Utc::now(),
            Some(v) => parse_timestamp(&v)?,
        };

        let event = Self {
            kind: wire.event,
            data: wire.data,
            timestamp,
        };
        event.check_required_fields()?;
        Ok(event)
    }

    fn check_required_fields(&self) -> Result<(), TrackerError> {
        let missing = match self.kind {
            EventKind::VendorStart if self.vendor_name().is_none() => Some("vendor_name"),
            EventKind::AgentStart | EventKind::AgentComplete if self.agent_name().is_none() => {
                Some("agent_name")
            }
            EventKind::AgentProgress if self.action().is_none() => Some("action"),
            EventKind::WorkflowError if self.error_message().is_none() => Some("error"),
            _ => None,
        };
        match missing {
            Some(field) => Err(TrackerError::MalformedEnvelope(format!(
                "{:?} event missing required field '{field}'",
                self.kind
            ))),
            None => Ok(()),
        }
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    /// Stage identifier, for `agent_start` / `agent_progress` / `agent_complete`.
    pub fn agent_name(&self) -> Option<&str> {
        self.str_field("agent_name")
    }

    /// Vendor whose sub-run is active, for `vendor_start`.
    pub fn vendor_name(&self) -> Option<&str> {
        self.str_field("vendor_name")
    }

    /// Progress action string, for `agent_progress`.
    pub fn action(&self) -> Option<&str> {
        self.str_field("action")
    }

    /// Failure message, for `workflow_error`.
    pub fn error_message(&self) -> Option<&str> {
        self.str_field("error")
    }

    /// Pipeline variant name, for `workflow_start`.
    pub fn variant_name(&self) -> Option<&str> {
        self.str_field("type")
    }

    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }

    // Producer-side constructors, used by tests and mock backends.

    fn with_data(kind: EventKind, data: Map<String, Value>) -> Self {
        Self {
            kind,
            data,
            timestamp: Utc::now(),
        }
    }

    fn with_str_field(kind: EventKind, key: &str, value: &str) -> Self {
        let mut data = Map::new();
        data.insert(key.to_string(), Value::String(value.to_string()));
        Self::with_data(kind, data)
    }

    pub fn workflow_start(variant: &str) -> Self {
        Self::with_str_field(EventKind::WorkflowStart, "type", variant)
    }

    pub fn vendor_start(vendor: &str) -> Self {
        Self::with_str_field(EventKind::VendorStart, "vendor_name", vendor)
    }

    pub fn agent_start(agent: &str) -> Self {
        Self::with_str_field(EventKind::AgentStart, "agent_name", agent)
    }

    pub fn agent_progress(agent: &str, action: &str) -> Self {
        let mut data = Map::new();
        data.insert("agent_name".into(), Value::String(agent.to_string()));
        data.insert("action".into(), Value::String(action.to_string()));
        Self::with_data(EventKind::AgentProgress, data)
    }

    pub fn agent_complete(agent: &str) -> Self {
        Self::with_str_field(EventKind::AgentComplete, "agent_name", agent)
    }

    pub fn workflow_complete() -> Self {
        Self::with_data(EventKind::WorkflowComplete, Map::new())
    }

    pub fn workflow_error(message: &str) -> Self {
        Self::with_str_field(EventKind::WorkflowError, "error", message)
    }
}

/// Timestamps arrive either as epoch milliseconds or as an RFC 3339 string.
fn parse_timestamp(value: &Value) -> Result<DateTime<Utc>, TrackerError> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| DateTime::from_timestamp_millis(ms))
            .ok_or_else(|| {
                TrackerError::MalformedEnvelope(format!("timestamp out of range: {n}"))
            }),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| TrackerError::MalformedEnvelope(format!("bad timestamp '{s}': {e}"))),
        other => Err(TrackerError::MalformedEnvelope(format!(
            "timestamp must be a number or string, got {other}"
        ))),
    }
}
