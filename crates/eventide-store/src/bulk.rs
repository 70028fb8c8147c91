//! Batched event writer with partial-failure accounting.
//!
//! A call runs in four phases: per-item validation, chunking into groups of
//! at most `batch_size`, sequential per-chunk processing (fingerprint,
//! bulk duplicate check, one bulk insert), and aggregation. An insert that
//! loses a uniqueness race is rechecked and retried once. Every input item
//! ends up counted exactly once as created, duplicate or failed.

use std::{collections::HashSet, fmt, sync::Arc};

use eventide_core::{
    event_hash, hashing::ensure_object, to_event_data, BulkInsertResult, Error, EventHash, EventId,
    NewEvent, Result,
};
use serde::Serialize;
use serde_json::Value;
use tracing::{info_span, Instrument};

use crate::{dedup::DuplicateChecker, graph::GraphStore};

/// One event submitted to [`BulkEventWriter::write_all`].
///
/// Inputs are checked lazily so a malformed item fails on its own instead
/// of rejecting the whole call.
#[derive(Debug, Clone)]
pub struct EventInput {
    event_type: Field<String>,
    event_data: Field<Value>,
    shape_error: Option<String>,
}

#[derive(Debug, Clone)]
enum Field<T> {
    Missing,
    Invalid(String),
    Present(T),
}

impl EventInput {
    /// Builds an input from a type tag and any serializable payload.
    pub fn new<T>(event_type: impl Into<String>, data: &T) -> Self
    where
        T: Serialize + ?Sized,
    {
        let event_data = match to_event_data(data) {
            Ok(value) => Field::Present(value),
            Err(e) => Field::Invalid(validation_message(&e)),
        };
        Self { event_type: Field::Present(event_type.into()), event_data, shape_error: None }
    }

    /// Builds an input from a type tag and a JSON payload.
    pub fn from_value(event_type: impl Into<String>, event_data: Value) -> Self {
        let event_data = match ensure_object(&event_data) {
            Ok(()) => Field::Present(event_data),
            Err(e) => Field::Invalid(validation_message(&e)),
        };
        Self { event_type: Field::Present(event_type.into()), event_data, shape_error: None }
    }

    /// Builds an input from a loosely shaped record with `event_type` and
    /// `event_data` keys.
    pub fn from_record(record: &Value) -> Self {
        let Some(object) = record.as_object() else {
            return Self {
                event_type: Field::Missing,
                event_data: Field::Missing,
                shape_error: Some("Event must be a dictionary".to_string()),
            };
        };

        let event_type = match object.get("event_type") {
            None => Field::Missing,
            Some(Value::String(event_type)) => Field::Present(event_type.clone()),
            Some(_) => Field::Invalid("Invalid event_type: must be a string".to_string()),
        };
        let event_data = match object.get("event_data") {
            None => Field::Missing,
            Some(data) => match ensure_object(data) {
                Ok(()) => Field::Present(data.clone()),
                Err(e) => Field::Invalid(validation_message(&e)),
            },
        };

        Self { event_type, event_data, shape_error: None }
    }

    fn validate(self, index: usize) -> std::result::Result<ValidEvent, BulkError> {
        let item_error = |event_type: Option<String>, message: String| BulkError::Item {
            index,
            event_type,
            message,
        };

        if let Some(message) = self.shape_error {
            return Err(item_error(None, message));
        }
        let event_type = match self.event_type {
            Field::Present(event_type) => event_type,
            Field::Missing => {
                return Err(item_error(None, "Missing required field: event_type".to_string()));
            },
            Field::Invalid(message) => return Err(item_error(None, message)),
        };
        match self.event_data {
            Field::Present(event_data) => Ok(ValidEvent { event_type, event_data }),
            Field::Missing => Err(item_error(
                Some(event_type),
                "Missing required field: event_data".to_string(),
            )),
            Field::Invalid(message) => Err(item_error(Some(event_type), message)),
        }
    }
}

fn validation_message(error: &Error) -> String {
    match error {
        Error::Validation { message } => message.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug)]
struct ValidEvent {
    event_type: String,
    event_data: Value,
}

/// Overall result of a bulk write or of one of its chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BulkStatus {
    /// Nothing failed.
    Success,
    /// Some items failed, others were created or recognised as duplicates.
    Partial,
    /// Nothing was created and nothing was a duplicate.
    Error,
}

impl BulkStatus {
    /// Derives the status from per-outcome counts.
    pub fn from_counts(created: usize, duplicate: usize, failed: usize) -> Self {
        if created == 0 && duplicate == 0 {
            Self::Error
        } else if failed > 0 {
            Self::Partial
        } else {
            Self::Success
        }
    }
}

impl fmt::Display for BulkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Partial => write!(f, "partial"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Error recorded against an input item or a whole chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum BulkError {
    /// An input item failed validation.
    Item {
        /// Position of the item in the submitted list.
        index: usize,
        /// Event type, when it could be read.
        #[serde(skip_serializing_if = "Option::is_none")]
        event_type: Option<String>,
        /// What was wrong with the item.
        #[serde(rename = "error")]
        message: String,
    },
    /// A chunk-level operation failed.
    Batch {
        /// One-based chunk number.
        batch: usize,
        /// Underlying error message.
        #[serde(rename = "error")]
        message: String,
    },
}

/// Outcome of one chunk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchReport {
    /// One-based chunk number.
    pub batch: usize,
    /// Status derived from this chunk's counts.
    pub status: BulkStatus,
    /// Number of items in the chunk.
    pub events_total: usize,
    /// Rows the backend reported as inserted.
    pub events_created: usize,
    /// Items already known or repeated within the chunk.
    pub events_duplicate: usize,
    /// Items that were not stored.
    pub events_failed: usize,
    /// Identifiers returned by the insert.
    pub created_event_ids: Vec<EventId>,
    /// Fingerprints counted as duplicates.
    pub duplicate_hashes: Vec<EventHash>,
    /// Chunk-level errors.
    pub errors: Vec<BulkError>,
}

impl BatchReport {
    fn new(batch: usize, events_total: usize) -> Self {
        Self {
            batch,
            status: BulkStatus::Success,
            events_total,
            events_created: 0,
            events_duplicate: 0,
            events_failed: 0,
            created_event_ids: Vec::new(),
            duplicate_hashes: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn fail_all(mut self, message: String) -> Self {
        self.events_created = 0;
        self.events_duplicate = 0;
        self.events_failed = self.events_total;
        self.created_event_ids.clear();
        self.duplicate_hashes.clear();
        self.errors = vec![BulkError::Batch { batch: self.batch, message }];
        self.finish()
    }

    fn finish(mut self) -> Self {
        self.status =
            BulkStatus::from_counts(self.events_created, self.events_duplicate, self.events_failed);
        self
    }
}

/// Aggregate result of [`BulkEventWriter::write_all`].
///
/// `events_created + events_duplicate + events_failed == total_events`
/// always holds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkWriteReport {
    /// Overall status.
    pub status: BulkStatus,
    /// Number of submitted items.
    pub total_events: usize,
    /// Rows inserted across all chunks.
    pub events_created: usize,
    /// Items already known or repeated.
    pub events_duplicate: usize,
    /// Items rejected by validation or lost to chunk failures.
    pub events_failed: usize,
    /// Identifiers of created events, in insert order.
    pub created_event_ids: Vec<EventId>,
    /// Fingerprints counted as duplicates.
    pub duplicate_hashes: Vec<EventHash>,
    /// Validation errors first, then chunk errors.
    pub errors: Vec<BulkError>,
    /// Number of chunks processed.
    pub batches_processed: usize,
    /// Per-chunk results.
    pub batches: Vec<BatchReport>,
}

/// Writes many events in sequential chunks.
#[derive(Clone)]
pub struct BulkEventWriter {
    store: Arc<dyn GraphStore>,
    checker: DuplicateChecker,
    default_batch_size: usize,
}

impl BulkEventWriter {
    /// Creates a writer over `store` using `default_batch_size` when a call
    /// does not specify one.
    pub fn new(store: Arc<dyn GraphStore>, default_batch_size: usize) -> Self {
        let checker = DuplicateChecker::new(store.clone());
        Self { store, checker, default_batch_size }
    }

    /// Validates, deduplicates and inserts `events`.
    ///
    /// Once the call-level checks pass, a report is always returned, even
    /// if every item failed.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` if `events` is empty or the effective
    /// batch size is zero.
    pub async fn write_all(
        &self,
        events: Vec<EventInput>,
        batch_size: Option<usize>,
    ) -> Result<BulkWriteReport> {
        let batch_size = batch_size.unwrap_or(self.default_batch_size);
        if batch_size == 0 {
            return Err(Error::validation(
                "Invalid batch_size: must be a positive integer, got 0",
            ));
        }
        if events.is_empty() {
            return Err(Error::validation("Invalid events: list cannot be empty"));
        }

        let total_events = events.len();
        let mut errors = Vec::new();
        let mut valid = Vec::with_capacity(total_events);
        for (index, input) in events.into_iter().enumerate() {
            match input.validate(index) {
                Ok(event) => valid.push(event),
                Err(error) => errors.push(error),
            }
        }
        let invalid = errors.len();
        if invalid > 0 {
            tracing::warn!(invalid, total = total_events, "Bulk write inputs failed validation");
        }

        let chunk_count = valid.len().div_ceil(batch_size);
        tracing::info!(
            total = total_events,
            batches = chunk_count,
            batch_size,
            "Processing bulk event write"
        );

        let mut batches = Vec::with_capacity(chunk_count);
        let mut remaining = valid.into_iter().peekable();
        let mut batch = 0;
        while remaining.peek().is_some() {
            batch += 1;
            let chunk: Vec<ValidEvent> = remaining.by_ref().take(batch_size).collect();
            let span = info_span!("bulk_batch", batch, size = chunk.len());
            let report = self.process_chunk(batch, chunk).instrument(span).await;
            batches.push(report);
        }

        let mut report = BulkWriteReport {
            status: BulkStatus::Error,
            total_events,
            events_created: 0,
            events_duplicate: 0,
            events_failed: invalid,
            created_event_ids: Vec::new(),
            duplicate_hashes: Vec::new(),
            errors,
            batches_processed: batches.len(),
            batches: Vec::new(),
        };
        for batch in &batches {
            report.events_created += batch.events_created;
            report.events_duplicate += batch.events_duplicate;
            report.events_failed += batch.events_failed;
            report.created_event_ids.extend_from_slice(&batch.created_event_ids);
            report.duplicate_hashes.extend_from_slice(&batch.duplicate_hashes);
            report.errors.extend_from_slice(&batch.errors);
        }
        report.batches = batches;
        report.status = BulkStatus::from_counts(
            report.events_created,
            report.events_duplicate,
            report.events_failed,
        );

        tracing::info!(
            status = %report.status,
            created = report.events_created,
            duplicate = report.events_duplicate,
            failed = report.events_failed,
            batches = report.batches_processed,
            "Bulk write complete"
        );

        Ok(report)
    }

    async fn process_chunk(&self, batch: usize, chunk: Vec<ValidEvent>) -> BatchReport {
        let report = BatchReport::new(batch, chunk.len());
        match self.try_process_chunk(report.clone(), chunk).await {
            Ok(report) => report.finish(),
            Err(e) => {
                tracing::error!(error = %e, kind = e.kind(), "Batch failed");
                report.fail_all(format!("Error processing batch {batch}: {e}"))
            },
        }
    }

    async fn try_process_chunk(
        &self,
        mut report: BatchReport,
        chunk: Vec<ValidEvent>,
    ) -> Result<BatchReport> {
        let mut seen = HashSet::with_capacity(chunk.len());
        let mut candidates = Vec::with_capacity(chunk.len());
        for event in chunk {
            let hash = event_hash(&event.event_type, &event.event_data)?;
            if seen.insert(hash.clone()) {
                candidates.push(NewEvent {
                    event_type: event.event_type,
                    event_data: event.event_data,
                    event_hash: hash,
                });
            } else {
                report.events_duplicate += 1;
                report.duplicate_hashes.push(hash);
            }
        }

        let hashes: Vec<EventHash> = candidates.iter().map(|e| e.event_hash.clone()).collect();
        let existing = self.checker.existing_hashes(&hashes).await?;

        let (known, to_insert): (Vec<NewEvent>, Vec<NewEvent>) =
            candidates.into_iter().partition(|e| existing.contains(&e.event_hash));
        report.events_duplicate += known.len();
        report.duplicate_hashes.extend(known.into_iter().map(|e| e.event_hash));

        if to_insert.is_empty() {
            tracing::debug!("All events in batch are duplicates");
            return Ok(report);
        }

        match self.store.bulk_insert_events(to_insert.clone()).await {
            Ok(inserted) => record_insert(&mut report, to_insert.len(), &inserted),
            Err(e) if e.is_unique_violation() => {
                tracing::warn!(error = %e, "Batch insert raced with another writer, rechecking");
                self.retry_after_race(&mut report, to_insert).await?;
            },
            Err(e) => return Err(e),
        }

        Ok(report)
    }

    /// Re-runs the duplicate check after a bulk insert lost a uniqueness
    /// race, then inserts whatever is still missing once more.
    ///
    /// The bulk insert is all-or-nothing, so items that did not conflict
    /// were not stored by the first attempt.
    async fn retry_after_race(
        &self,
        report: &mut BatchReport,
        attempted: Vec<NewEvent>,
    ) -> Result<()> {
        let hashes: Vec<EventHash> = attempted.iter().map(|e| e.event_hash.clone()).collect();
        let existing = self.checker.existing_hashes(&hashes).await?;

        let (known, remainder): (Vec<NewEvent>, Vec<NewEvent>) =
            attempted.into_iter().partition(|e| existing.contains(&e.event_hash));
        report.events_duplicate += known.len();
        report.duplicate_hashes.extend(known.into_iter().map(|e| e.event_hash));

        if remainder.is_empty() {
            return Ok(());
        }

        let retried = remainder.len();
        match self.store.bulk_insert_events(remainder).await {
            Ok(inserted) => record_insert(report, retried, &inserted),
            Err(e) => {
                tracing::error!(
                    error = %e,
                    kind = e.kind(),
                    failed = retried,
                    "Batch retry after race failed"
                );
                report.events_failed += retried;
                report.errors.push(BulkError::Batch {
                    batch: report.batch,
                    message: format!("Error processing batch {}: {e}", report.batch),
                });
            },
        }
        Ok(())
    }
}

fn record_insert(report: &mut BatchReport, attempted: usize, inserted: &BulkInsertResult) {
    let affected = usize::try_from(inserted.affected_rows).unwrap_or(usize::MAX);
    let created = affected.min(attempted);
    report.events_created += created;
    report.created_event_ids.extend(inserted.returning.iter().map(|e| e.id));
    if created < attempted {
        report.events_failed += attempted - created;
        report.errors.push(BulkError::Batch {
            batch: report.batch,
            message: format!("backend reported {affected} of {attempted} rows inserted"),
        });
    }
    tracing::info!(created, "Batch inserted");
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::sync::atomic::{AtomicBool, Ordering};

    use eventide_core::{Event, HashTable, LogFields, LogId, ProcessingLog, RetryCandidate};
    use serde_json::json;

    use super::*;
    use crate::{
        graph::GraphFuture,
        memory::{MemoryGraphStore, Operation},
    };

    fn inputs(values: &[i64]) -> Vec<EventInput> {
        values.iter().map(|n| EventInput::from_value("T", json!({ "n": n }))).collect()
    }

    #[test]
    fn status_rule() {
        assert_eq!(BulkStatus::from_counts(3, 0, 0), BulkStatus::Success);
        assert_eq!(BulkStatus::from_counts(0, 3, 0), BulkStatus::Success);
        assert_eq!(BulkStatus::from_counts(1, 0, 2), BulkStatus::Partial);
        assert_eq!(BulkStatus::from_counts(0, 1, 2), BulkStatus::Partial);
        assert_eq!(BulkStatus::from_counts(0, 0, 2), BulkStatus::Error);
        assert_eq!(BulkStatus::from_counts(0, 0, 0), BulkStatus::Error);
    }

    #[test]
    fn record_validation_messages() {
        let cases = [
            (json!([1]), "Event must be a dictionary"),
            (json!({"event_data": {}}), "Missing required field: event_type"),
            (json!({"event_type": "T"}), "Missing required field: event_data"),
            (json!({"event_type": 5, "event_data": {}}), "Invalid event_type: must be a string"),
            (json!({"event_type": "T", "event_data": [1]}), "expected a JSON object"),
        ];

        for (index, (record, expected)) in cases.into_iter().enumerate() {
            let err = EventInput::from_record(&record).validate(index).unwrap_err();
            match err {
                BulkError::Item { index: got, message, .. } => {
                    assert_eq!(got, index);
                    assert!(message.contains(expected), "{message} should contain {expected}");
                },
                BulkError::Batch { .. } => panic!("expected item error"),
            }
        }
    }

    #[tokio::test]
    async fn call_level_validation() {
        let writer = BulkEventWriter::new(Arc::new(MemoryGraphStore::new()), 1000);

        assert!(writer.write_all(Vec::new(), None).await.unwrap_err().is_validation());
        assert!(writer.write_all(inputs(&[1]), Some(0)).await.unwrap_err().is_validation());
    }

    #[tokio::test]
    async fn repeated_items_within_chunk_count_as_duplicates() {
        let store = Arc::new(MemoryGraphStore::new());
        let writer = BulkEventWriter::new(store.clone(), 1000);

        let report = writer.write_all(inputs(&[1, 1, 2]), None).await.unwrap();

        assert_eq!(report.events_created, 2);
        assert_eq!(report.events_duplicate, 1);
        assert_eq!(report.status, BulkStatus::Success);
        assert_eq!(store.events().await.len(), 2);
    }

    /// Hides stored hashes from the first lookup, as if another writer
    /// committed them between the duplicate check and the insert.
    struct StaleFirstLookup {
        inner: MemoryGraphStore,
        stale: AtomicBool,
    }

    impl GraphStore for StaleFirstLookup {
        fn query_by_hashes(
            &self,
            hashes: Vec<EventHash>,
            table: HashTable,
        ) -> GraphFuture<'_, HashSet<EventHash>> {
            if self.stale.swap(false, Ordering::SeqCst) {
                return Box::pin(async { Ok(HashSet::new()) });
            }
            self.inner.query_by_hashes(hashes, table)
        }

        fn insert_event(&self, event: NewEvent) -> GraphFuture<'_, Event> {
            self.inner.insert_event(event)
        }

        fn bulk_insert_events(&self, events: Vec<NewEvent>) -> GraphFuture<'_, BulkInsertResult> {
            self.inner.bulk_insert_events(events)
        }

        fn latest_log_for_event(
            &self,
            event_id: EventId,
        ) -> GraphFuture<'_, Option<ProcessingLog>> {
            self.inner.latest_log_for_event(event_id)
        }

        fn insert_log(&self, fields: LogFields) -> GraphFuture<'_, ProcessingLog> {
            self.inner.insert_log(fields)
        }

        fn update_log(&self, log_id: LogId, fields: LogFields) -> GraphFuture<'_, ProcessingLog> {
            self.inner.update_log(log_id, fields)
        }

        fn unprocessed_or_failed(
            &self,
            event_type: String,
        ) -> GraphFuture<'_, Vec<RetryCandidate>> {
            self.inner.unprocessed_or_failed(event_type)
        }
    }

    #[tokio::test]
    async fn racing_insert_stores_items_that_did_not_conflict() {
        let inner = MemoryGraphStore::new();
        let racer = NewEvent {
            event_type: "T".to_string(),
            event_data: json!({"n": 1}),
            event_hash: event_hash("T", &json!({"n": 1})).unwrap(),
        };
        inner.insert_event(racer).await.unwrap();
        let store = Arc::new(StaleFirstLookup { inner, stale: AtomicBool::new(true) });
        let writer = BulkEventWriter::new(store.clone(), 1000);

        let report = writer.write_all(inputs(&[1, 2]), None).await.unwrap();

        assert_eq!(report.events_created, 1);
        assert_eq!(report.events_duplicate, 1);
        assert_eq!(report.events_failed, 0);
        assert_eq!(report.status, BulkStatus::Success);
        assert_eq!(report.duplicate_hashes, vec![event_hash("T", &json!({"n": 1})).unwrap()]);
        assert_eq!(store.inner.events().await.len(), 2);
        assert_eq!(store.inner.call_count(Operation::BulkInsertEvents).await, 2);
    }

    #[tokio::test]
    async fn failed_insert_after_race_marks_remaining_items_failed() {
        let store = Arc::new(MemoryGraphStore::new());
        store
            .inject_failure(
                Operation::BulkInsertEvents,
                Error::constraint_violation("duplicate key value violates unique constraint"),
            )
            .await;
        store.inject_failure(Operation::BulkInsertEvents, Error::timeout(30)).await;
        let writer = BulkEventWriter::new(store.clone(), 1000);

        let report = writer.write_all(inputs(&[1, 2]), None).await.unwrap();

        assert_eq!(report.events_created, 0);
        assert_eq!(report.events_duplicate, 0);
        assert_eq!(report.events_failed, 2);
        assert_eq!(report.status, BulkStatus::Error);
        assert!(matches!(report.errors[0], BulkError::Batch { batch: 1, .. }));
        assert!(store.events().await.is_empty());
    }

    #[tokio::test]
    async fn chunk_failure_fails_every_item_in_chunk() {
        let store = Arc::new(MemoryGraphStore::new());
        store.inject_failure(Operation::BulkInsertEvents, Error::timeout(30)).await;
        let writer = BulkEventWriter::new(store, 2);

        let report = writer.write_all(inputs(&[1, 2, 3, 4]), None).await.unwrap();

        assert_eq!(report.batches_processed, 2);
        assert_eq!(report.batches[0].events_failed, 2);
        assert_eq!(report.batches[0].status, BulkStatus::Error);
        assert_eq!(report.batches[1].events_created, 2);
        assert_eq!(report.status, BulkStatus::Partial);
        assert_eq!(
            report.events_created + report.events_duplicate + report.events_failed,
            report.total_events
        );
        assert!(matches!(report.errors[0], BulkError::Batch { batch: 1, .. }));
    }

    #[tokio::test]
    async fn all_invalid_inputs_still_produce_report() {
        let writer = BulkEventWriter::new(Arc::new(MemoryGraphStore::new()), 10);
        let events =
            vec![EventInput::from_record(&json!("x")), EventInput::from_record(&json!({}))];

        let report = writer.write_all(events, None).await.unwrap();

        assert_eq!(report.status, BulkStatus::Error);
        assert_eq!(report.events_failed, 2);
        assert_eq!(report.batches_processed, 0);
        assert_eq!(report.errors.len(), 2);
    }

    #[test]
    fn errors_serialize_with_error_key() {
        let item = BulkError::Item { index: 3, event_type: None, message: "bad".to_string() };
        let batch = BulkError::Batch { batch: 2, message: "down".to_string() };

        assert_eq!(serde_json::to_value(item).unwrap(), json!({"index": 3, "error": "bad"}));
        assert_eq!(serde_json::to_value(batch).unwrap(), json!({"batch": 2, "error": "down"}));
    }
}
