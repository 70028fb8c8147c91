//! Processing outcome logger.
//!
//! Keeps at most one log row per event: the first attempt inserts, later
//! attempts overwrite that row in place. Calls for the same event are
//! serialized within the process so two concurrent attempts cannot both
//! observe "no existing log" and insert twice.

use std::{collections::HashMap, fmt, sync::Arc};

use eventide_core::{
    Clock, Error, EventId, LogFields, LogId, ProcessingLog, ProcessingOutcome, ProcessingStatus,
    Provenance, RealClock, Result,
};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info_span, Instrument};

use crate::graph::GraphStore;

/// Whether a log call created or overwrote the event's log row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogAction {
    /// No row existed; one was inserted.
    Inserted,
    /// The existing row was overwritten.
    Updated,
}

impl fmt::Display for LogAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inserted => write!(f, "inserted"),
            Self::Updated => write!(f, "updated"),
        }
    }
}

/// Result of a successful log call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogReport {
    /// The stored row after the call.
    pub log: ProcessingLog,
    /// Insert or update.
    pub action: LogAction,
}

impl LogReport {
    /// Identifier of the log row.
    pub fn log_id(&self) -> LogId {
        self.log.id
    }

    /// Stored processing status.
    pub fn processed_status(&self) -> ProcessingStatus {
        self.log.status
    }
}

type EventLocks = HashMap<EventId, Arc<Mutex<()>>>;

/// Records the latest processing outcome for events.
#[derive(Clone)]
pub struct ProcessingLogger {
    store: Arc<dyn GraphStore>,
    clock: Arc<dyn Clock>,
    locks: Arc<Mutex<EventLocks>>,
}

impl ProcessingLogger {
    /// Creates a logger over `store` stamping rows with the system clock.
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self::with_clock(store, Arc::new(RealClock::new()))
    }

    /// Creates a logger stamping rows with `clock`.
    pub fn with_clock(store: Arc<dyn GraphStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock, locks: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Records `outcome` as the latest processing result of `event_id`.
    ///
    /// # Errors
    ///
    /// - `Validation` if `event_id` is not positive or the outcome cannot
    ///   be serialized; no backend call is made
    /// - any backend error from the lookup, insert or update
    pub async fn log(
        &self,
        event_id: EventId,
        outcome: &ProcessingOutcome,
        provenance: &Provenance,
    ) -> Result<LogReport> {
        if !event_id.is_valid() {
            return Err(Error::validation(format!(
                "Invalid event_id: must be a positive integer, got {event_id}"
            )));
        }

        let fields = LogFields {
            event_id,
            processed_at: self.clock.now_utc(),
            status: outcome.processing_status(),
            result: outcome.to_value()?,
            result_error: outcome.result_error(),
            integration_url: provenance.url.clone(),
            integration_method: provenance.method.clone(),
            integration_payload: provenance.payload.clone(),
        };

        let span = info_span!("log_processing", event_id = %event_id, status = %fields.status);
        async move {
            let lock = self.lock_for(event_id).await;
            let result = {
                let _guard = lock.lock().await;
                self.upsert(event_id, fields).await
            };
            drop(lock);
            self.release(event_id).await;
            result
        }
        .instrument(span)
        .await
    }

    /// Records a raw call result after checking its shape.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` if `event_id` is not positive or `raw`
    /// is missing required keys or carries badly typed values. Otherwise
    /// the same as [`ProcessingLogger::log`].
    pub async fn log_value(
        &self,
        event_id: EventId,
        raw: &Value,
        provenance: &Provenance,
    ) -> Result<LogReport> {
        if !event_id.is_valid() {
            return Err(Error::validation(format!(
                "Invalid event_id: must be a positive integer, got {event_id}"
            )));
        }
        let outcome = ProcessingOutcome::from_value(raw)?;
        self.log(event_id, &outcome, provenance).await
    }

    async fn upsert(&self, event_id: EventId, fields: LogFields) -> Result<LogReport> {
        match self.store.latest_log_for_event(event_id).await? {
            Some(existing) => {
                let log = self.store.update_log(existing.id, fields).await?;
                tracing::info!(log_id = %log.id, "Processing log updated");
                Ok(LogReport { log, action: LogAction::Updated })
            },
            None => {
                let log = self.store.insert_log(fields).await?;
                tracing::info!(log_id = %log.id, "Processing log inserted");
                Ok(LogReport { log, action: LogAction::Inserted })
            },
        }
    }

    async fn lock_for(&self, event_id: EventId) -> Arc<Mutex<()>> {
        self.locks.lock().await.entry(event_id).or_default().clone()
    }

    /// Drops the event's lock once no other call holds or awaits it.
    async fn release(&self, event_id: EventId) {
        let mut locks = self.locks.lock().await;
        if locks.get(&event_id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(&event_id);
        }
    }

    #[cfg(test)]
    async fn tracked_locks(&self) -> usize {
        self.locks.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use eventide_core::{CallStatus, TestClock};
    use serde_json::json;

    use super::*;
    use crate::memory::{MemoryGraphStore, Operation};

    fn failed(message: &str) -> ProcessingOutcome {
        ProcessingOutcome::failure(Some(504), message)
    }

    #[tokio::test]
    async fn second_call_updates_the_same_row() {
        let store = Arc::new(MemoryGraphStore::new());
        let logger = ProcessingLogger::new(store.clone());

        let first = logger.log(EventId(7), &failed("timeout"), &Provenance::default()).await.unwrap();
        let second = logger
            .log(EventId(7), &ProcessingOutcome::success(200, None), &Provenance::default())
            .await
            .unwrap();

        assert_eq!(first.action, LogAction::Inserted);
        assert_eq!(second.action, LogAction::Updated);
        assert_eq!(first.log_id(), second.log_id());

        let rows = store.logs_for_event(EventId(7)).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, ProcessingStatus::Success);
        assert_eq!(rows[0].result_error, None);
    }

    #[tokio::test]
    async fn failure_mapping_and_provenance() {
        let store = Arc::new(MemoryGraphStore::new());
        let start = Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap();
        let clock = Arc::new(TestClock::with_start_time(start));
        let logger = ProcessingLogger::with_clock(store, clock);
        let provenance = Provenance::new("https://erp.example.com/orders", "POST")
            .with_payload(json!({"order": 1}));

        let report =
            logger.log(EventId(3), &failed("HTTP 504: Gateway Timeout"), &provenance).await.unwrap();

        assert_eq!(report.processed_status(), ProcessingStatus::Failed);
        assert_eq!(report.log.result_error.as_deref(), Some("HTTP 504: Gateway Timeout"));
        assert_eq!(report.log.processed_at, start);
        assert_eq!(report.log.integration_method.as_deref(), Some("POST"));
        assert_eq!(report.log.integration_payload, Some(json!({"order": 1})));
        assert_eq!(report.log.result["status_code"], 504);
    }

    #[tokio::test]
    async fn failed_outcome_without_error_gets_placeholder() {
        let logger = ProcessingLogger::new(Arc::new(MemoryGraphStore::new()));
        let outcome = ProcessingOutcome {
            status: CallStatus::Error,
            status_code: None,
            data: None,
            error: None,
            response_headers: None,
        };

        let report = logger.log(EventId(1), &outcome, &Provenance::default()).await.unwrap();
        assert_eq!(report.log.result_error.as_deref(), Some("Unknown error"));
    }

    #[tokio::test]
    async fn invalid_input_makes_no_backend_call() {
        let store = Arc::new(MemoryGraphStore::new());
        let logger = ProcessingLogger::new(store.clone());

        let err = logger.log(EventId(0), &failed("x"), &Provenance::default()).await.unwrap_err();
        assert!(err.is_validation());

        let err = logger
            .log_value(EventId(1), &json!({"status": "success"}), &Provenance::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("missing required keys"));

        assert_eq!(store.call_count(Operation::LatestLogForEvent).await, 0);
    }

    #[tokio::test]
    async fn concurrent_calls_for_one_event_leave_one_row() {
        let store = Arc::new(MemoryGraphStore::new().with_latency(Duration::from_millis(5)));
        let logger = ProcessingLogger::new(store.clone());

        let calls = (0..8).map(|i| {
            let logger = logger.clone();
            tokio::spawn(async move {
                logger
                    .log(EventId(11), &failed(&format!("attempt {i}")), &Provenance::default())
                    .await
            })
        });
        let mut actions = Vec::new();
        for call in calls.collect::<Vec<_>>() {
            actions.push(call.await.unwrap().unwrap().action);
        }

        assert_eq!(store.logs_for_event(EventId(11)).await.len(), 1);
        assert_eq!(actions.iter().filter(|a| **a == LogAction::Inserted).count(), 1);
        assert_eq!(logger.tracked_locks().await, 0);
    }

    #[tokio::test]
    async fn backend_error_propagates_and_releases_lock() {
        let store = Arc::new(MemoryGraphStore::new());
        store.inject_failure(Operation::InsertLog, Error::transport("connection reset")).await;
        let logger = ProcessingLogger::new(store);

        let err = logger.log(EventId(2), &failed("x"), &Provenance::default()).await.unwrap_err();

        assert!(err.is_transport());
        assert_eq!(logger.tracked_locks().await, 0);
    }
}
