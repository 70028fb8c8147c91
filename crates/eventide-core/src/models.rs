//! Core domain models and strongly-typed identifiers.
//!
//! Defines stored events, processing logs, and the newtype wrappers that keep
//! event ids, log ids and content hashes from being mixed up. Field names on
//! the wire follow the backend's column names; Rust field names follow the
//! domain.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Backend-assigned event identifier.
///
/// Identifiers are monotonic integers allocated by the storage layer on
/// insert. Only positive values refer to stored events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub i64);

impl EventId {
    /// Returns whether this id can refer to a stored event.
    pub const fn is_valid(self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for EventId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Backend-assigned processing log identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogId(pub i64);

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for LogId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Content fingerprint of an event: lowercase hex SHA-256.
///
/// Produced by [`crate::hashing::event_hash`]. Unique across pending and
/// archived events.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventHash(String);

impl EventHash {
    /// Wraps a hex digest, typically one returned by the backend.
    pub fn new(hex_digest: impl Into<String>) -> Self {
        Self(hex_digest.into())
    }

    /// Returns the digest as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which event set a hash lookup targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashTable {
    /// Events awaiting or undergoing processing.
    Pending,
    /// Events that completed processing and were archived.
    Archive,
}

impl fmt::Display for HashTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Archive => write!(f, "archive"),
        }
    }
}

/// Stored event.
///
/// Immutable once created. Removed from the pending set only by an external
/// archival step after successful processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Backend-assigned identifier.
    pub id: EventId,

    /// Caller-supplied event type tag.
    pub event_type: String,

    /// Event payload; always a JSON object.
    pub event_data: Value,

    /// Content fingerprint of type and payload.
    pub event_hash: EventHash,

    /// When the backend recorded the event.
    #[serde(rename = "event_created_at", deserialize_with = "timestamp::deserialize")]
    pub created_at: DateTime<Utc>,
}

/// Event ready for insertion: validated payload plus its fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    /// Event type tag.
    pub event_type: String,

    /// Validated JSON object payload.
    pub event_data: Value,

    /// Fingerprint computed from type and payload.
    pub event_hash: EventHash,
}

/// Result of a multi-row event insert.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BulkInsertResult {
    /// Number of rows the backend reports as inserted.
    pub affected_rows: u64,

    /// Inserted rows, including their assigned identifiers.
    #[serde(default)]
    pub returning: Vec<Event>,
}

/// Outcome recorded for the latest processing attempt of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingStatus {
    /// Downstream call succeeded. Terminal; the event may be archived.
    Success,
    /// Downstream call failed. The event returns to the retry pool.
    Failed,
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "SUCCESS"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// Latest processing outcome for an event.
///
/// At most one row exists per event; later attempts overwrite earlier ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingLog {
    /// Backend-assigned identifier; preserved across updates.
    pub id: LogId,

    /// Event this outcome belongs to.
    pub event_id: EventId,

    /// When the outcome was recorded.
    #[serde(deserialize_with = "timestamp::deserialize")]
    pub processed_at: DateTime<Utc>,

    /// Success or failure of the downstream call.
    #[serde(rename = "processed_status")]
    pub status: ProcessingStatus,

    /// Full downstream call outcome.
    #[serde(rename = "processed_result", default)]
    pub result: Value,

    /// Error message; present iff the status is `FAILED`.
    #[serde(rename = "processed_result_error", default)]
    pub result_error: Option<String>,

    /// URL of the downstream call.
    #[serde(default)]
    pub integration_url: Option<String>,

    /// HTTP method of the downstream call.
    #[serde(rename = "integration_request_method", default)]
    pub integration_method: Option<String>,

    /// Request payload of the downstream call.
    #[serde(default)]
    pub integration_payload: Option<Value>,
}

/// Column values written by a processing log insert or update.
#[derive(Debug, Clone, PartialEq)]
pub struct LogFields {
    /// Event the outcome belongs to.
    pub event_id: EventId,
    /// Time the outcome is recorded at.
    pub processed_at: DateTime<Utc>,
    /// Mapped processing status.
    pub status: ProcessingStatus,
    /// Full serialized outcome.
    pub result: Value,
    /// Error message for failed outcomes.
    pub result_error: Option<String>,
    /// URL of the downstream call.
    pub integration_url: Option<String>,
    /// HTTP method of the downstream call.
    pub integration_method: Option<String>,
    /// Request payload of the downstream call.
    pub integration_payload: Option<Value>,
}

impl LogFields {
    /// Materializes the fields as a log row with the given identity.
    pub fn into_log(self, id: LogId) -> ProcessingLog {
        ProcessingLog {
            id,
            event_id: self.event_id,
            processed_at: self.processed_at,
            status: self.status,
            result: self.result,
            result_error: self.result_error,
            integration_url: self.integration_url,
            integration_method: self.integration_method,
            integration_payload: self.integration_payload,
        }
    }
}

/// Position of an event in the retry state machine.
///
/// ```text
/// Created -> Unprocessed --attempt--> Success (terminal)
///                 ^                -> Failed
///                 |___________________|  (caller re-attempts)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryState {
    /// No processing log exists yet.
    Unprocessed,
    /// The latest processing attempt failed.
    Failed,
    /// The latest processing attempt succeeded.
    Succeeded,
}

/// Event paired with its latest processing log, if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryCandidate {
    /// The stored event.
    pub event: Event,

    /// Most recent processing outcome.
    pub latest_log: Option<ProcessingLog>,
}

impl RetryCandidate {
    /// Returns where the event sits in the retry state machine.
    pub fn state(&self) -> RetryState {
        match self.latest_log.as_ref().map(|log| log.status) {
            None => RetryState::Unprocessed,
            Some(ProcessingStatus::Failed) => RetryState::Failed,
            Some(ProcessingStatus::Success) => RetryState::Succeeded,
        }
    }

    /// Returns whether the event belongs in the retry pool.
    pub fn needs_retry(&self) -> bool {
        !matches!(self.state(), RetryState::Succeeded)
    }
}

pub(crate) mod timestamp {
    //! Lenient timestamp decoding.
    //!
    //! `timestamptz` columns arrive as RFC 3339; plain `timestamp` columns
    //! arrive without an offset and are taken as UTC.

    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{de::Error as _, Deserialize, Deserializer};

    pub(crate) fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| D::Error::custom(format!("invalid timestamp: {raw}")))
    }

    pub(crate) fn parse(raw: &str) -> Option<DateTime<Utc>> {
        if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
            return Some(parsed.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
            .ok()
            .map(|naive| naive.and_utc())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use serde_json::json;

    use super::*;

    #[test]
    fn event_decodes_backend_column_names() {
        let row = json!({
            "id": 42,
            "event_type": "UNIT4_DITIO_EVENT",
            "event_data": {"order": 7},
            "event_hash": "ab12",
            "event_created_at": "2025-03-01T10:00:00.123456+00:00"
        });

        let event: Event = serde_json::from_value(row).unwrap();

        assert_eq!(event.id, EventId(42));
        assert_eq!(event.event_hash.as_str(), "ab12");
        assert_eq!(event.created_at.to_rfc3339(), "2025-03-01T10:00:00.123456+00:00");
    }

    #[test]
    fn naive_timestamps_are_read_as_utc() {
        let parsed = timestamp::parse("2025-03-01T10:00:00.5").unwrap();
        assert_eq!(parsed.to_rfc3339(), "2025-03-01T10:00:00.500+00:00");
        assert!(timestamp::parse("yesterday").is_none());
    }

    #[test]
    fn processing_log_decodes_partial_rows() {
        let row = json!({
            "id": 3,
            "event_id": 42,
            "processed_at": "2025-03-01T10:00:00Z",
            "processed_status": "FAILED",
            "processed_result_error": "timeout"
        });

        let log: ProcessingLog = serde_json::from_value(row).unwrap();

        assert_eq!(log.status, ProcessingStatus::Failed);
        assert_eq!(log.result_error.as_deref(), Some("timeout"));
        assert_eq!(log.result, Value::Null);
        assert!(log.integration_url.is_none());
    }

    #[test]
    fn retry_state_follows_latest_log() {
        let event = Event {
            id: EventId(1),
            event_type: "T".to_string(),
            event_data: json!({}),
            event_hash: EventHash::new("h"),
            created_at: Utc::now(),
        };
        let mut candidate = RetryCandidate { event, latest_log: None };
        assert_eq!(candidate.state(), RetryState::Unprocessed);
        assert!(candidate.needs_retry());

        let fields = LogFields {
            event_id: EventId(1),
            processed_at: Utc::now(),
            status: ProcessingStatus::Success,
            result: json!({"status": "success"}),
            result_error: None,
            integration_url: None,
            integration_method: None,
            integration_payload: None,
        };
        candidate.latest_log = Some(fields.into_log(LogId(9)));
        assert_eq!(candidate.state(), RetryState::Succeeded);
        assert!(!candidate.needs_retry());
    }

    #[test]
    fn event_id_validity() {
        assert!(EventId(1).is_valid());
        assert!(!EventId(0).is_valid());
        assert!(!EventId(-4).is_valid());
    }
}
