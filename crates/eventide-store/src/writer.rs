//! Single-event writer.
//!
//! Validates and fingerprints the payload, skips known fingerprints, and
//! folds the insert-time uniqueness race into a duplicate outcome.

use std::{fmt, sync::Arc};

use eventide_core::{event_hash, to_event_data, Event, EventHash, EventId, NewEvent, Result};
use serde::Serialize;
use serde_json::Value;
use tracing::{info_span, Instrument};

use crate::{dedup::DuplicateChecker, graph::GraphStore};

/// Outcome of writing one event.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// The event was inserted.
    Created {
        /// Stored row with its backend-assigned id.
        event: Event,
    },
    /// An event with the same fingerprint already exists.
    Duplicate {
        /// Fingerprint of the rejected event.
        event_hash: EventHash,
        /// Whether the duplicate was caught by the storage constraint
        /// rather than the pre-insert check.
        detected_on_insert: bool,
    },
    /// The insert failed for a reason other than uniqueness.
    Failed {
        /// Fingerprint of the event that was not stored.
        event_hash: EventHash,
        /// Underlying error message.
        message: String,
    },
}

/// Tag of a [`WriteOutcome`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteStatus {
    /// Inserted.
    Success,
    /// Already known.
    Duplicate,
    /// Not stored.
    Error,
}

impl fmt::Display for WriteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Duplicate => write!(f, "duplicate"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl WriteOutcome {
    /// Returns the outcome tag.
    pub fn status(&self) -> WriteStatus {
        match self {
            Self::Created { .. } => WriteStatus::Success,
            Self::Duplicate { .. } => WriteStatus::Duplicate,
            Self::Failed { .. } => WriteStatus::Error,
        }
    }

    /// Returns the id of the created event.
    pub fn event_id(&self) -> Option<EventId> {
        match self {
            Self::Created { event } => Some(event.id),
            Self::Duplicate { .. } | Self::Failed { .. } => None,
        }
    }

    /// Returns the fingerprint of the written event.
    pub fn event_hash(&self) -> &EventHash {
        match self {
            Self::Created { event } => &event.event_hash,
            Self::Duplicate { event_hash, .. } | Self::Failed { event_hash, .. } => event_hash,
        }
    }
}

/// Inserts single events exactly once.
#[derive(Clone)]
pub struct EventWriter {
    store: Arc<dyn GraphStore>,
    checker: DuplicateChecker,
}

impl EventWriter {
    /// Creates a writer over `store`.
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        let checker = DuplicateChecker::new(store.clone());
        Self { store, checker }
    }

    /// Writes a serializable payload as an event of `event_type`.
    ///
    /// # Errors
    ///
    /// - `Validation` if the payload is not representable as a JSON object
    /// - any backend error raised by the duplicate pre-check
    ///
    /// Insert failures do not error; they are reported as
    /// [`WriteOutcome::Failed`].
    pub async fn write<T>(&self, event_type: &str, data: &T) -> Result<WriteOutcome>
    where
        T: Serialize + ?Sized,
    {
        let event_data = to_event_data(data)?;
        self.write_value(event_type, event_data).await
    }

    /// Writes a JSON object as an event of `event_type`.
    ///
    /// # Errors
    ///
    /// Same as [`EventWriter::write`].
    pub async fn write_value(&self, event_type: &str, event_data: Value) -> Result<WriteOutcome> {
        let event_hash = event_hash(event_type, &event_data)?;
        let span = info_span!("write_event", event_type, event_hash = %event_hash);

        async move {
            if self.checker.is_duplicate(&event_hash).await? {
                tracing::info!("Event already exists, skipping insert");
                return Ok(WriteOutcome::Duplicate { event_hash, detected_on_insert: false });
            }

            let new_event = NewEvent {
                event_type: event_type.to_string(),
                event_data,
                event_hash: event_hash.clone(),
            };

            match self.store.insert_event(new_event).await {
                Ok(event) => {
                    tracing::info!(event_id = %event.id, "Event inserted");
                    Ok(WriteOutcome::Created { event })
                },
                Err(e) if e.is_unique_violation() => {
                    tracing::info!("Event inserted concurrently, treating as duplicate");
                    Ok(WriteOutcome::Duplicate { event_hash, detected_on_insert: true })
                },
                Err(e) => {
                    tracing::error!(error = %e, kind = e.kind(), "Event insert failed");
                    Ok(WriteOutcome::Failed { event_hash, message: e.to_string() })
                },
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::{collections::HashMap, time::Duration};

    use eventide_core::Error;
    use serde_json::json;

    use super::*;
    use crate::memory::{MemoryGraphStore, Operation};

    #[tokio::test]
    async fn second_write_is_duplicate_with_same_hash() {
        let store = Arc::new(MemoryGraphStore::new());
        let writer = EventWriter::new(store.clone());

        let first = writer.write("T", &json!({"a": 1})).await.unwrap();
        let second = writer.write("T", &json!({"a": 1})).await.unwrap();

        assert_eq!(first.status(), WriteStatus::Success);
        assert_eq!(first.event_id(), Some(EventId(1)));
        assert_eq!(second.status(), WriteStatus::Duplicate);
        assert_eq!(first.event_hash(), second.event_hash());
        assert_eq!(store.events().await.len(), 1);
    }

    #[tokio::test]
    async fn insert_race_is_reported_as_duplicate() {
        let store = Arc::new(MemoryGraphStore::new());
        store
            .inject_failure(
                Operation::InsertEvent,
                Error::constraint_violation("duplicate key value violates unique constraint"),
            )
            .await;
        let writer = EventWriter::new(store);

        let outcome = writer.write("T", &json!({"a": 1})).await.unwrap();

        assert!(matches!(outcome, WriteOutcome::Duplicate { detected_on_insert: true, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_writers_store_event_once() {
        let store = Arc::new(MemoryGraphStore::new().with_latency(Duration::from_millis(10)));
        let writer = EventWriter::new(store.clone());
        let data = json!({"order": 42});

        let (first, second) = tokio::join!(writer.write("T", &data), writer.write("T", &data));
        let mut outcomes = [first.unwrap(), second.unwrap()];
        outcomes.sort_by_key(|outcome| outcome.status() != WriteStatus::Success);

        assert_eq!(outcomes[0].status(), WriteStatus::Success);
        assert!(matches!(outcomes[1], WriteOutcome::Duplicate { detected_on_insert: true, .. }));
        assert_eq!(outcomes[0].event_hash(), outcomes[1].event_hash());
        assert_eq!(store.events().await.len(), 1);
        assert_eq!(store.call_count(Operation::InsertEvent).await, 2);
    }

    #[tokio::test]
    async fn other_insert_failures_keep_message() {
        let store = Arc::new(MemoryGraphStore::new());
        store.inject_failure(Operation::InsertEvent, Error::graph("permission denied")).await;
        let writer = EventWriter::new(store);

        let outcome = writer.write("T", &json!({"a": 1})).await.unwrap();

        assert_eq!(outcome.status(), WriteStatus::Error);
        match outcome {
            WriteOutcome::Failed { message, .. } => assert!(message.contains("permission denied")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn pre_check_failure_propagates() {
        let store = Arc::new(MemoryGraphStore::new());
        store
            .inject_failure(Operation::QueryByHashes, Error::transport("connection refused"))
            .await;
        let writer = EventWriter::new(store.clone());

        let err = writer.write("T", &json!({"a": 1})).await.unwrap_err();

        assert!(err.is_transport());
        assert_eq!(store.call_count(Operation::InsertEvent).await, 0);
    }

    #[tokio::test]
    async fn invalid_payload_never_reaches_backend() {
        let store = Arc::new(MemoryGraphStore::new());
        let writer = EventWriter::new(store.clone());

        let mut bad = HashMap::new();
        bad.insert((1, 2), "tuple keys");
        assert!(writer.write("T", &bad).await.unwrap_err().is_validation());
        assert!(writer.write("T", &json!("scalar")).await.unwrap_err().is_validation());

        assert_eq!(store.call_count(Operation::QueryByHashes).await, 0);
    }
}
