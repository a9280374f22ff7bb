//! Event-sourced run state.
//!
//! Every state-relevant action of a run is recorded as an [`Event`] appended
//! to `events.ndjson`. The current state of the run is never stored
//! authoritatively; it is derived by folding the log into a
//! [`Snapshot`](replay::Snapshot).
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  emit   ┌──────────────────┐  read   ┌──────────────────┐
//! │ stage/fixer  │────────>│ EventLog         │────────>│ replay (fold)    │
//! │ patch stage  │         │ events.ndjson    │         │ -> Snapshot      │
//! └──────────────┘         └──────────────────┘         └──────────────────┘
//! ```
//!
//! # Wire format
//!
//! One JSON object per line with a fixed key order:
//! `event_id, run_id, timestamp, type, payload, trace_id, span_id`.
//! Payload keys are sorted and timestamps always carry six fractional
//! digits, so identical events always encode to identical bytes.
//!
//! ```
//! use steward::events::{Event, EventKind};
//! use chrono::{TimeZone, Utc};
//! use uuid::Uuid;
//!
//! let event = Event {
//!     event_id: Uuid::from_u128(1),
//!     run_id: "run-1".into(),
//!     timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
//!     kind: EventKind::RunCompleted {},
//!     trace_id: "t".into(),
//!     span_id: "s".into(),
//! };
//! let line = event.to_line().unwrap();
//! assert!(line.contains(r#""type":"RUN_COMPLETED","payload":{}"#));
//! assert_eq!(Event::from_line(&line).unwrap(), event);
//! ```

pub mod log;
pub mod replay;

pub use log::{EventLog, LogRead};
pub use replay::{replay, RunState, Snapshot};

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::fixer::Severity;

/// Timestamp layout used on the wire (UTC, microseconds).
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

// ============================================================================
// Event Kinds
// ============================================================================

/// Outcome recorded by `WORK_ITEM_FINISHED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    Succeeded,
    Failed,
}

/// The type and typed payload of an event.
///
/// Serialized adjacently tagged as `{"type": "...", "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    /// A worker, or one item within a worker, started.
    WorkItemStarted {
        worker: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        item_id: Option<String>,
    },
    /// A worker, or one item within a worker, finished.
    ///
    /// A successful finish without `item_id` marks the whole worker complete.
    WorkItemFinished {
        worker: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        item_id: Option<String>,
        status: WorkStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// An artifact was written through the artifact store.
    ArtifactWritten {
        name: String,
        path: String,
        content_hash: String,
    },
    IssueOpened {
        issue_id: String,
        gate: String,
        severity: Severity,
        error_code: String,
    },
    IssueResolved {
        issue_id: String,
    },
    /// Terminal failure of the run.
    RunFailed {
        error_kind: String,
        message: String,
    },
    RunStateChanged {
        state: RunState,
    },
    FixerStarted {
        issue_id: String,
    },
    FixerCompleted {
        issue_id: String,
        changed_files: Vec<String>,
    },
    FixerNoIssues {},
    IssueFixFailed {
        issue_id: String,
        error_kind: String,
        reason: String,
    },
    GateRunStarted {
        gate: String,
    },
    GateRunFinished {
        gate: String,
        ok: bool,
        #[serde(default)]
        issue_count: u32,
    },
    PrOpened {
        url: String,
    },
    RunCompleted {},
}

impl EventKind {
    /// Wire name of the event type.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::WorkItemStarted { .. } => "WORK_ITEM_STARTED",
            Self::WorkItemFinished { .. } => "WORK_ITEM_FINISHED",
            Self::ArtifactWritten { .. } => "ARTIFACT_WRITTEN",
            Self::IssueOpened { .. } => "ISSUE_OPENED",
            Self::IssueResolved { .. } => "ISSUE_RESOLVED",
            Self::RunFailed { .. } => "RUN_FAILED",
            Self::RunStateChanged { .. } => "RUN_STATE_CHANGED",
            Self::FixerStarted { .. } => "FIXER_STARTED",
            Self::FixerCompleted { .. } => "FIXER_COMPLETED",
            Self::FixerNoIssues {} => "FIXER_NO_ISSUES",
            Self::IssueFixFailed { .. } => "ISSUE_FIX_FAILED",
            Self::GateRunStarted { .. } => "GATE_RUN_STARTED",
            Self::GateRunFinished { .. } => "GATE_RUN_FINISHED",
            Self::PrOpened { .. } => "PR_OPENED",
            Self::RunCompleted {} => "RUN_COMPLETED",
        }
    }
}

// ============================================================================
// Event
// ============================================================================

/// One immutable record in a run's event log.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub event_id: Uuid,
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub trace_id: String,
    pub span_id: String,
}

impl Event {
    /// Build an event, truncating the timestamp to wire precision.
    #[must_use]
    pub fn new(
        event_id: Uuid,
        run_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        kind: EventKind,
        trace_id: impl Into<String>,
        span_id: impl Into<String>,
    ) -> Self {
        Self {
            event_id,
            run_id: run_id.into(),
            timestamp: timestamp.trunc_subsecs(6),
            kind,
            trace_id: trace_id.into(),
            span_id: span_id.into(),
        }
    }

    /// Canonical single-line encoding (no trailing newline).
    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Decode one line, validating the payload against its type.
    pub fn from_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line)
    }
}

/// Flat wire shape of an event.
#[derive(Serialize, Deserialize)]
struct EventRecord {
    event_id: Uuid,
    run_id: String,
    timestamp: String,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    payload: serde_json::Value,
    trace_id: String,
    span_id: String,
}

impl EventRecord {
    fn from_event(event: &Event) -> serde_json::Result<Self> {
        let tagged = serde_json::to_value(&event.kind)?;
        let (event_type, payload) = match tagged {
            serde_json::Value::Object(mut map) => {
                let event_type = match map.remove("type") {
                    Some(serde_json::Value::String(t)) => t,
                    _ => event.kind.type_name().to_string(),
                };
                let payload = map
                    .remove("payload")
                    .unwrap_or_else(|| serde_json::Value::Object(serde_json::Map::new()));
                (event_type, payload)
            }
            _ => (
                event.kind.type_name().to_string(),
                serde_json::Value::Object(serde_json::Map::new()),
            ),
        };
        Ok(Self {
            event_id: event.event_id,
            run_id: event.run_id.clone(),
            timestamp: event.timestamp.format(TIMESTAMP_FORMAT).to_string(),
            event_type,
            payload,
            trace_id: event.trace_id.clone(),
            span_id: event.span_id.clone(),
        })
    }

    fn into_event(self) -> std::result::Result<Event, String> {
        let timestamp = DateTime::parse_from_rfc3339(&self.timestamp)
            .map_err(|e| format!("invalid timestamp '{}': {}", self.timestamp, e))?
            .with_timezone(&Utc);
        let payload = if self.payload.is_null() {
            serde_json::Value::Object(serde_json::Map::new())
        } else {
            self.payload
        };
        let tagged = serde_json::json!({ "type": self.event_type, "payload": payload });
        let kind: EventKind = serde_json::from_value(tagged)
            .map_err(|e| format!("invalid {} payload: {}", self.event_type, e))?;
        Ok(Event {
            event_id: self.event_id,
            run_id: self.run_id,
            timestamp,
            kind,
            trace_id: self.trace_id,
            span_id: self.span_id,
        })
    }
}

impl Serialize for Event {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        EventRecord::from_event(self)
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Event {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        EventRecord::deserialize(deserializer)?
            .into_event()
            .map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample(kind: EventKind) -> Event {
        Event::new(
            Uuid::from_u128(7),
            "run-1",
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap(),
            kind,
            "trace",
            "span",
        )
    }

    #[test]
    fn test_key_order_is_fixed() {
        let line = sample(EventKind::IssueResolved {
            issue_id: "i-1".into(),
        })
        .to_line()
        .expect("encode");
        let positions: Vec<usize> = [
            "\"event_id\"",
            "\"run_id\"",
            "\"timestamp\"",
            "\"type\"",
            "\"payload\"",
            "\"trace_id\"",
            "\"span_id\"",
        ]
        .iter()
        .map(|k| line.find(k).expect("key present"))
        .collect();
        let mut sorted = positions.clone();
        sorted.sort_unstable();
        assert_eq!(positions, sorted);
        assert!(line.contains("\"timestamp\":\"2024-05-01T12:30:00.000000Z\""));
    }

    #[test]
    fn test_identical_events_encode_identically() {
        let kind = EventKind::FixerCompleted {
            issue_id: "i-1".into(),
            changed_files: vec!["docs/a.md".into()],
        };
        assert_eq!(
            sample(kind.clone()).to_line().expect("encode"),
            sample(kind).to_line().expect("encode")
        );
    }

    #[test]
    fn test_optional_fields_are_omitted() {
        let line = sample(EventKind::WorkItemStarted {
            worker: "draft".into(),
            item_id: None,
        })
        .to_line()
        .expect("encode");
        assert!(line.contains(r#""payload":{"worker":"draft"}"#));
    }

    #[test]
    fn test_decode_rejects_payload_mismatch() {
        let line = sample(EventKind::PrOpened {
            url: "https://example.com/pr/1".into(),
        })
        .to_line()
        .expect("encode")
        .replace("\"url\"", "\"link\"");
        assert!(Event::from_line(&line).is_err());
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let line = sample(EventKind::RunCompleted {})
            .to_line()
            .expect("encode")
            .replace("RUN_COMPLETED", "RUN_EXPLODED");
        assert!(Event::from_line(&line).is_err());
    }

    #[test]
    fn test_timestamp_truncated_to_micros() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
            + chrono::Duration::nanoseconds(1_234_567);
        let event = Event::new(
            Uuid::from_u128(1),
            "r",
            ts,
            EventKind::RunCompleted {},
            "t",
            "s",
        );
        let decoded = Event::from_line(&event.to_line().expect("encode")).expect("decode");
        assert_eq!(decoded, event);
        assert_eq!(decoded.timestamp.timestamp_subsec_micros(), 1_234);
    }
}
