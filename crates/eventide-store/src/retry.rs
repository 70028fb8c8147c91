//! Retry candidate queries.

use std::sync::Arc;

use eventide_core::{Error, Result, RetryCandidate};
use tracing::{info_span, Instrument};

use crate::graph::GraphStore;

/// Lists events that still need a processing attempt.
///
/// Read-only. Deciding when to re-attempt is left to the caller.
#[derive(Clone)]
pub struct RetryQueryService {
    store: Arc<dyn GraphStore>,
}

impl RetryQueryService {
    /// Creates a query service over `store`.
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self { store }
    }

    /// Returns events of `event_type` with no processing log or whose
    /// latest log failed, oldest first, each with its latest log.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` for an empty event type; backend errors
    /// propagate unchanged.
    pub async fn retry_candidates(&self, event_type: &str) -> Result<Vec<RetryCandidate>> {
        if event_type.is_empty() {
            return Err(Error::validation("Invalid event_type: must not be empty"));
        }

        let span = info_span!("retry_candidates", event_type);
        async move {
            let mut candidates = self.store.unprocessed_or_failed(event_type.to_string()).await?;

            // The backend filter matches any failed log; only the latest one counts.
            candidates.retain(RetryCandidate::needs_retry);
            candidates.sort_by(|a, b| {
                a.event.created_at.cmp(&b.event.created_at).then(a.event.id.cmp(&b.event.id))
            });

            tracing::info!(count = candidates.len(), "Retrieved retry candidates");
            Ok(candidates)
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::time::Duration;

    use eventide_core::{EventId, ProcessingOutcome, Provenance, RetryState, TestClock};
    use serde_json::json;

    use super::*;
    use crate::{memory::MemoryGraphStore, processing_log::ProcessingLogger, writer::EventWriter};

    #[tokio::test]
    async fn lists_unprocessed_and_failed_oldest_first() {
        let clock = TestClock::new();
        let store = Arc::new(MemoryGraphStore::with_clock(Arc::new(clock.clone())));
        let writer = EventWriter::new(store.clone());
        let logger = ProcessingLogger::new(store.clone());

        let mut ids = Vec::new();
        for n in 1..=4 {
            let outcome = writer.write("ORDER", &json!({ "n": n })).await.unwrap();
            ids.push(outcome.event_id().unwrap());
            clock.advance(Duration::from_secs(1));
        }
        writer.write("INVOICE", &json!({ "n": 1 })).await.unwrap();

        let none = Provenance::default();
        logger.log(ids[0], &ProcessingOutcome::failure(Some(500), "boom"), &none).await.unwrap();
        logger.log(ids[1], &ProcessingOutcome::success(200, None), &none).await.unwrap();
        logger.log(ids[3], &ProcessingOutcome::failure(None, "timeout"), &none).await.unwrap();

        let service = RetryQueryService::new(store);
        let candidates = service.retry_candidates("ORDER").await.unwrap();

        let got: Vec<(EventId, RetryState)> =
            candidates.iter().map(|c| (c.event.id, c.state())).collect();
        assert_eq!(
            got,
            vec![
                (ids[0], RetryState::Failed),
                (ids[2], RetryState::Unprocessed),
                (ids[3], RetryState::Failed),
            ]
        );
        assert_eq!(
            candidates[0].latest_log.as_ref().unwrap().result_error.as_deref(),
            Some("boom")
        );
    }

    #[tokio::test]
    async fn succeeded_after_failure_leaves_the_pool() {
        let store = Arc::new(MemoryGraphStore::new());
        let writer = EventWriter::new(store.clone());
        let logger = ProcessingLogger::new(store.clone());
        let service = RetryQueryService::new(store);

        let id = writer.write("T", &json!({"a": 1})).await.unwrap().event_id().unwrap();
        let none = Provenance::default();
        logger.log(id, &ProcessingOutcome::failure(Some(503), "down"), &none).await.unwrap();
        assert_eq!(service.retry_candidates("T").await.unwrap().len(), 1);

        logger.log(id, &ProcessingOutcome::success(200, None), &none).await.unwrap();
        assert!(service.retry_candidates("T").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_event_type_is_rejected() {
        let service = RetryQueryService::new(Arc::new(MemoryGraphStore::new()));
        assert!(service.retry_candidates("").await.unwrap_err().is_validation());
    }
}
