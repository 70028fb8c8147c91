//! In-memory graph store.
//!
//! Deterministic stand-in for the Hasura backend used by tests and by
//! callers embedding the library without a database. Enforces the same
//! uniqueness rules as the real schema and supports failure injection,
//! per-operation call counting and artificial latency so concurrent callers
//! interleave.

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::Arc,
    time::Duration,
};

use eventide_core::{
    BulkInsertResult, Clock, Error, Event, EventHash, EventId, HashTable, LogFields, LogId,
    NewEvent, ProcessingLog, ProcessingStatus, RealClock, Result, RetryCandidate,
};
use tokio::sync::RwLock;

use crate::graph::{GraphFuture, GraphStore};

const HASH_CONSTRAINT: &str = "event_store_event_hash_key";

/// Graph store operation, used to target failure injection and call counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// [`GraphStore::query_by_hashes`]
    QueryByHashes,
    /// [`GraphStore::insert_event`]
    InsertEvent,
    /// [`GraphStore::bulk_insert_events`]
    BulkInsertEvents,
    /// [`GraphStore::latest_log_for_event`]
    LatestLogForEvent,
    /// [`GraphStore::insert_log`]
    InsertLog,
    /// [`GraphStore::update_log`]
    UpdateLog,
    /// [`GraphStore::unprocessed_or_failed`]
    UnprocessedOrFailed,
}

#[derive(Debug, Default)]
struct State {
    next_event_id: i64,
    next_log_id: i64,
    events: BTreeMap<EventId, Event>,
    pending_hashes: HashMap<EventHash, EventId>,
    archived_hashes: HashSet<EventHash>,
    logs: BTreeMap<LogId, ProcessingLog>,
    queued_failures: HashMap<Operation, VecDeque<Error>>,
    persistent_failures: HashMap<Operation, Error>,
    calls: HashMap<Operation, usize>,
}

impl State {
    /// Records the call and returns an injected failure, if any.
    fn enter(&mut self, op: Operation) -> Result<()> {
        *self.calls.entry(op).or_default() += 1;

        if let Some(error) = self.queued_failures.get_mut(&op).and_then(VecDeque::pop_front) {
            return Err(error);
        }
        if let Some(error) = self.persistent_failures.get(&op) {
            return Err(error.clone());
        }
        Ok(())
    }

    fn hash_exists(&self, hash: &EventHash) -> bool {
        self.pending_hashes.contains_key(hash) || self.archived_hashes.contains(hash)
    }

    fn store_event(&mut self, event: NewEvent, created_at: chrono::DateTime<chrono::Utc>) -> Event {
        self.next_event_id += 1;
        let id = EventId(self.next_event_id);
        let stored = Event {
            id,
            event_type: event.event_type,
            event_data: event.event_data,
            event_hash: event.event_hash,
            created_at,
        };
        self.pending_hashes.insert(stored.event_hash.clone(), id);
        self.events.insert(id, stored.clone());
        stored
    }

    /// Latest log for an event: newest `processed_at`, then highest id.
    fn latest_log(&self, event_id: EventId) -> Option<&ProcessingLog> {
        self.logs
            .values()
            .filter(|log| log.event_id == event_id)
            .max_by(|a, b| a.processed_at.cmp(&b.processed_at).then(a.id.cmp(&b.id)))
    }
}

/// In-memory [`GraphStore`] with failure injection.
#[derive(Debug)]
pub struct MemoryGraphStore {
    state: RwLock<State>,
    clock: Arc<dyn Clock>,
    latency: Option<Duration>,
}

impl MemoryGraphStore {
    /// Creates an empty store using the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(RealClock::new()))
    }

    /// Creates an empty store stamping rows with `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { state: RwLock::new(State::default()), clock, latency: None }
    }

    /// Delays every operation by `latency` before it touches state.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Makes the next call to `op` fail with `error`. Calls queue up.
    pub async fn inject_failure(&self, op: Operation, error: Error) {
        self.state.write().await.queued_failures.entry(op).or_default().push_back(error);
    }

    /// Makes every call to `op` fail with `error` until cleared.
    pub async fn inject_persistent_failure(&self, op: Operation, error: Error) {
        self.state.write().await.persistent_failures.insert(op, error);
    }

    /// Removes all injected failures.
    pub async fn clear_failures(&self) {
        let mut state = self.state.write().await;
        state.queued_failures.clear();
        state.persistent_failures.clear();
    }

    /// Marks a hash as archived, as the external archiver would.
    pub async fn seed_archive(&self, hash: EventHash) {
        self.state.write().await.archived_hashes.insert(hash);
    }

    /// Moves a pending event into the archive together with its logs.
    ///
    /// Returns whether the event existed.
    pub async fn archive_event(&self, event_id: EventId) -> bool {
        let mut state = self.state.write().await;
        let Some(event) = state.events.remove(&event_id) else {
            return false;
        };
        state.pending_hashes.remove(&event.event_hash);
        state.archived_hashes.insert(event.event_hash);
        state.logs.retain(|_, log| log.event_id != event_id);
        true
    }

    /// Returns all pending events in id order.
    pub async fn events(&self) -> Vec<Event> {
        self.state.read().await.events.values().cloned().collect()
    }

    /// Returns every processing log row for an event.
    pub async fn logs_for_event(&self, event_id: EventId) -> Vec<ProcessingLog> {
        self.state
            .read()
            .await
            .logs
            .values()
            .filter(|log| log.event_id == event_id)
            .cloned()
            .collect()
    }

    /// Returns how many times `op` has been called.
    pub async fn call_count(&self, op: Operation) -> usize {
        self.state.read().await.calls.get(&op).copied().unwrap_or(0)
    }

    async fn pause(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

impl Default for MemoryGraphStore {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphStore for MemoryGraphStore {
    fn query_by_hashes(
        &self,
        hashes: Vec<EventHash>,
        table: HashTable,
    ) -> GraphFuture<'_, HashSet<EventHash>> {
        Box::pin(async move {
            self.pause().await;
            let mut state = self.state.write().await;
            state.enter(Operation::QueryByHashes)?;

            let found = hashes
                .into_iter()
                .filter(|hash| match table {
                    HashTable::Pending => state.pending_hashes.contains_key(hash),
                    HashTable::Archive => state.archived_hashes.contains(hash),
                })
                .collect();
            Ok(found)
        })
    }

    fn insert_event(&self, event: NewEvent) -> GraphFuture<'_, Event> {
        Box::pin(async move {
            self.pause().await;
            let mut state = self.state.write().await;
            state.enter(Operation::InsertEvent)?;

            if state.hash_exists(&event.event_hash) {
                return Err(Error::constraint_violation(format!(
                    "Uniqueness violation. duplicate key value violates unique constraint \
                     \"{HASH_CONSTRAINT}\""
                )));
            }
            Ok(state.store_event(event, self.clock.now_utc()))
        })
    }

    fn bulk_insert_events(&self, events: Vec<NewEvent>) -> GraphFuture<'_, BulkInsertResult> {
        Box::pin(async move {
            self.pause().await;
            let mut state = self.state.write().await;
            state.enter(Operation::BulkInsertEvents)?;

            let mut seen = HashSet::with_capacity(events.len());
            for event in &events {
                if state.hash_exists(&event.event_hash) || !seen.insert(&event.event_hash) {
                    return Err(Error::constraint_violation(format!(
                        "Uniqueness violation. duplicate key value violates unique constraint \
                         \"{HASH_CONSTRAINT}\""
                    )));
                }
            }

            let created_at = self.clock.now_utc();
            let returning: Vec<Event> =
                events.into_iter().map(|event| state.store_event(event, created_at)).collect();
            Ok(BulkInsertResult { affected_rows: returning.len() as u64, returning })
        })
    }

    fn latest_log_for_event(&self, event_id: EventId) -> GraphFuture<'_, Option<ProcessingLog>> {
        Box::pin(async move {
            self.pause().await;
            let mut state = self.state.write().await;
            state.enter(Operation::LatestLogForEvent)?;
            Ok(state.latest_log(event_id).cloned())
        })
    }

    fn insert_log(&self, fields: LogFields) -> GraphFuture<'_, ProcessingLog> {
        Box::pin(async move {
            self.pause().await;
            let mut state = self.state.write().await;
            state.enter(Operation::InsertLog)?;

            state.next_log_id += 1;
            let log = fields.into_log(LogId(state.next_log_id));
            state.logs.insert(log.id, log.clone());
            Ok(log)
        })
    }

    fn update_log(&self, log_id: LogId, fields: LogFields) -> GraphFuture<'_, ProcessingLog> {
        Box::pin(async move {
            self.pause().await;
            let mut state = self.state.write().await;
            state.enter(Operation::UpdateLog)?;

            let Some(slot) = state.logs.get_mut(&log_id) else {
                return Err(Error::not_found(format!("processing log {log_id}")));
            };
            let log = fields.into_log(log_id);
            *slot = log.clone();
            Ok(log)
        })
    }

    fn unprocessed_or_failed(&self, event_type: String) -> GraphFuture<'_, Vec<RetryCandidate>> {
        Box::pin(async move {
            self.pause().await;
            let mut state = self.state.write().await;
            state.enter(Operation::UnprocessedOrFailed)?;

            let mut candidates: Vec<RetryCandidate> = state
                .events
                .values()
                .filter(|event| event.event_type == event_type)
                .filter_map(|event| {
                    let latest_log = state.latest_log(event.id).cloned();
                    match latest_log.as_ref().map(|log| log.status) {
                        Some(ProcessingStatus::Success) => None,
                        _ => Some(RetryCandidate { event: event.clone(), latest_log }),
                    }
                })
                .collect();
            candidates.sort_by(|a, b| {
                a.event.created_at.cmp(&b.event.created_at).then(a.event.id.cmp(&b.event.id))
            });
            Ok(candidates)
        })
    }
}
