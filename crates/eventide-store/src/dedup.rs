//! Duplicate detection across pending and archived events.

use std::{collections::HashSet, sync::Arc};

use eventide_core::{EventHash, HashTable, Result};

use crate::graph::GraphStore;

/// Checks whether fingerprints are already known to the store.
///
/// Every check goes to the backend; nothing is cached between calls.
#[derive(Clone)]
pub struct DuplicateChecker {
    store: Arc<dyn GraphStore>,
}

impl DuplicateChecker {
    /// Creates a checker over `store`.
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self { store }
    }

    /// Returns whether `hash` exists among pending or archived events.
    ///
    /// Looks in the pending set first and only consults the archive on a
    /// miss.
    ///
    /// # Errors
    ///
    /// Backend errors propagate unchanged.
    pub async fn is_duplicate(&self, hash: &EventHash) -> Result<bool> {
        let pending = self.store.query_by_hashes(vec![hash.clone()], HashTable::Pending).await?;
        if pending.contains(hash) {
            tracing::debug!(event_hash = %hash, "Duplicate event hash found in pending events");
            return Ok(true);
        }

        let archived = self.store.query_by_hashes(vec![hash.clone()], HashTable::Archive).await?;
        if archived.contains(hash) {
            tracing::debug!(event_hash = %hash, "Duplicate event hash found in archive");
            return Ok(true);
        }

        Ok(false)
    }

    /// Returns the subset of `hashes` present in either table.
    ///
    /// Both tables are always queried. An empty input makes no backend
    /// call.
    ///
    /// # Errors
    ///
    /// Backend errors propagate unchanged.
    pub async fn existing_hashes(&self, hashes: &[EventHash]) -> Result<HashSet<EventHash>> {
        if hashes.is_empty() {
            return Ok(HashSet::new());
        }

        let unique: Vec<EventHash> =
            hashes.iter().cloned().collect::<HashSet<_>>().into_iter().collect();

        let pending = self.store.query_by_hashes(unique.clone(), HashTable::Pending).await?;
        let archived = self.store.query_by_hashes(unique, HashTable::Archive).await?;

        if !archived.is_empty() {
            tracing::info!(
                archived = archived.len(),
                pending = pending.len(),
                "Found duplicate hashes, some already processed"
            );
        } else if !pending.is_empty() {
            tracing::debug!(pending = pending.len(), "Found duplicate hashes in pending events");
        }

        Ok(pending.into_iter().chain(archived).collect())
    }
}
