//! In-memory store
//!
//! Backs tests and the CLI. Conditional writes are atomic per key through the
//! map's entry API; revisions come from one global counter, so they are
//! unique across keys and never reused after a delete.

use super::{CasOutcome, KeyValue, KvStore, Revision};
use crate::error::Result;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, KeyValue>>,
    last_revision: Arc<AtomicU64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys stored
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stored keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    fn next_revision(&self) -> Revision {
        Revision::new(self.last_revision.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("keys", &self.entries.len())
            .finish()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        value: Vec<u8>,
        expected: Option<Revision>,
    ) -> Result<CasOutcome> {
        let outcome = match (self.entries.entry(key.to_string()), expected) {
            (Entry::Occupied(mut occupied), Some(expected))
                if occupied.get().revision == expected =>
            {
                let revision = self.next_revision();
                occupied.insert(KeyValue { value, revision });
                CasOutcome::Swapped(revision)
            }
            (Entry::Vacant(vacant), None) => {
                let revision = self.next_revision();
                vacant.insert(KeyValue { value, revision });
                CasOutcome::Swapped(revision)
            }
            _ => CasOutcome::Conflict,
        };
        trace!(key, ?expected, ?outcome, "compare_and_swap");
        Ok(outcome)
    }

    async fn delete(&self, key: &str, expected: Revision) -> Result<CasOutcome> {
        let removed = self
            .entries
            .remove_if(key, |_, stored| stored.revision == expected);
        let outcome = match removed {
            Some((_, stored)) => CasOutcome::Swapped(stored.revision),
            None => CasOutcome::Conflict,
        };
        trace!(key, %expected, ?outcome, "delete");
        Ok(outcome)
    }
}
