//! Content-addressed integration event store.
//!
//! Records integration events exactly once despite repeated submission and
//! tracks the outcome of processing each event against a downstream API.
//!
//! # Architecture
//!
//! All persistence goes through the [`GraphStore`] trait. Components build
//! on it leaf-first:
//!
//! 1. **Duplicate Checker** - looks fingerprints up among pending and
//!    archived events
//! 2. **Event Writer** - inserts one event, folding insert races into
//!    duplicates
//! 3. **Bulk Event Writer** - chunked inserts with per-item accounting
//! 4. **Processing Logger** - one outcome row per event, latest wins
//! 5. **Retry Query Service** - events that are unprocessed or failed
//!
//! # Example
//!
//! ```no_run
//! use eventide_store::{telemetry, Config, EventStore};
//! use serde_json::json;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = Config::load()?;
//! telemetry::init_tracing(&config)?;
//! let store = EventStore::from_config(&config)?;
//!
//! let outcome = store.write_event("UNIT4_ORDER", &json!({"order": 42})).await?;
//! println!("{} {}", outcome.status(), outcome.event_hash());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod bulk;
pub mod config;
pub mod dedup;
pub mod graph;
pub mod hasura;
pub mod memory;
pub mod processing_log;
pub mod retry;
pub mod telemetry;
pub mod writer;

use std::sync::Arc;

pub use bulk::{BatchReport, BulkError, BulkEventWriter, BulkStatus, BulkWriteReport, EventInput};
pub use config::Config;
pub use dedup::DuplicateChecker;
use eventide_core::{
    Clock, EventId, ProcessingOutcome, Provenance, RealClock, Result, RetryCandidate,
};
pub use graph::{GraphFuture, GraphStore};
pub use hasura::{HasuraConfig, HasuraGraphStore};
pub use memory::{MemoryGraphStore, Operation};
pub use processing_log::{LogAction, LogReport, ProcessingLogger};
pub use retry::RetryQueryService;
use serde::Serialize;
pub use writer::{EventWriter, WriteOutcome, WriteStatus};

/// Default timeout for backend and downstream requests in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

/// Default chunk size for bulk writes.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// All event store operations over one graph store.
#[derive(Clone)]
pub struct EventStore {
    graph: Arc<dyn GraphStore>,
    writer: EventWriter,
    bulk: BulkEventWriter,
    logger: ProcessingLogger,
    retry: RetryQueryService,
}

impl EventStore {
    /// Creates a store over `graph` with default batch size and the system
    /// clock.
    pub fn new(graph: Arc<dyn GraphStore>) -> Self {
        Self::with_options(graph, DEFAULT_BATCH_SIZE, Arc::new(RealClock::new()))
    }

    /// Creates a store with an explicit default batch size and clock.
    pub fn with_options(
        graph: Arc<dyn GraphStore>,
        batch_size: usize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            writer: EventWriter::new(graph.clone()),
            bulk: BulkEventWriter::new(graph.clone(), batch_size),
            logger: ProcessingLogger::with_clock(graph.clone(), clock),
            retry: RetryQueryService::new(graph.clone()),
            graph,
        }
    }

    /// Creates a store backed by Hasura using `config`.
    ///
    /// # Errors
    ///
    /// Fails if the HTTP client cannot be built.
    pub fn from_config(config: &Config) -> Result<Self> {
        let graph = HasuraGraphStore::new(config.to_hasura_config())?;
        tracing::info!(
            endpoint = graph.endpoint(),
            batch_size = config.bulk_events_batch_size,
            "Event store configured"
        );
        Ok(Self::with_options(
            Arc::new(graph),
            config.bulk_events_batch_size,
            Arc::new(RealClock::new()),
        ))
    }

    /// Writes one event.
    ///
    /// # Errors
    ///
    /// See [`EventWriter::write`].
    pub async fn write_event<T>(&self, event_type: &str, data: &T) -> Result<WriteOutcome>
    where
        T: Serialize + ?Sized,
    {
        self.writer.write(event_type, data).await
    }

    /// Writes many events in chunks.
    ///
    /// # Errors
    ///
    /// See [`BulkEventWriter::write_all`].
    pub async fn bulk_write(
        &self,
        events: Vec<EventInput>,
        batch_size: Option<usize>,
    ) -> Result<BulkWriteReport> {
        self.bulk.write_all(events, batch_size).await
    }

    /// Records the latest processing outcome for an event.
    ///
    /// # Errors
    ///
    /// See [`ProcessingLogger::log`].
    pub async fn log_processing(
        &self,
        event_id: EventId,
        outcome: &ProcessingOutcome,
        provenance: &Provenance,
    ) -> Result<LogReport> {
        self.logger.log(event_id, outcome, provenance).await
    }

    /// Lists events of `event_type` that are unprocessed or failed.
    ///
    /// # Errors
    ///
    /// See [`RetryQueryService::retry_candidates`].
    pub async fn retry_candidates(&self, event_type: &str) -> Result<Vec<RetryCandidate>> {
        self.retry.retry_candidates(event_type).await
    }

    /// The processing logger, for callers that record outcomes themselves.
    pub fn logger(&self) -> &ProcessingLogger {
        &self.logger
    }

    /// The underlying graph store.
    pub fn graph(&self) -> &Arc<dyn GraphStore> {
        &self.graph
    }
}
