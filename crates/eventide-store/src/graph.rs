//! Graph store abstraction.
//!
//! Every backend operation the writers, the logger and the retry query need
//! goes through [`GraphStore`]. Production code talks to Hasura through
//! [`crate::hasura::HasuraGraphStore`]; tests and embedded callers use
//! [`crate::memory::MemoryGraphStore`].

use std::{collections::HashSet, future::Future, pin::Pin};

use eventide_core::{
    BulkInsertResult, Event, EventHash, EventId, HashTable, LogFields, LogId, NewEvent,
    ProcessingLog, Result, RetryCandidate,
};

/// Boxed future returned by [`GraphStore`] operations.
pub type GraphFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Queries and mutations required by the event store.
///
/// Implementations must enforce uniqueness of `event_hash` on insert and
/// report a violation as `Error::ConstraintViolation` so writers can fold
/// insert-time races into duplicate outcomes.
pub trait GraphStore: Send + Sync + 'static {
    /// Returns the subset of `hashes` present in `table`.
    ///
    /// An empty input must return an empty set.
    fn query_by_hashes(
        &self,
        hashes: Vec<EventHash>,
        table: HashTable,
    ) -> GraphFuture<'_, HashSet<EventHash>>;

    /// Inserts one event and returns the stored row.
    ///
    /// Fails with `Error::ConstraintViolation` if the hash already exists.
    fn insert_event(&self, event: NewEvent) -> GraphFuture<'_, Event>;

    /// Inserts many events in a single request.
    ///
    /// All-or-nothing: a uniqueness violation on any row rejects the whole
    /// request.
    fn bulk_insert_events(&self, events: Vec<NewEvent>) -> GraphFuture<'_, BulkInsertResult>;

    /// Returns the most recent processing log for an event, if any.
    fn latest_log_for_event(&self, event_id: EventId) -> GraphFuture<'_, Option<ProcessingLog>>;

    /// Inserts a processing log row.
    fn insert_log(&self, fields: LogFields) -> GraphFuture<'_, ProcessingLog>;

    /// Overwrites the processing log row `log_id`, keeping its identity.
    ///
    /// Fails with `Error::NotFound` if the row does not exist.
    fn update_log(&self, log_id: LogId, fields: LogFields) -> GraphFuture<'_, ProcessingLog>;

    /// Lists pending events of `event_type` that have no processing log or
    /// whose latest log is failed, oldest first, each paired with its
    /// latest log.
    fn unprocessed_or_failed(&self, event_type: String) -> GraphFuture<'_, Vec<RetryCandidate>>;
}
