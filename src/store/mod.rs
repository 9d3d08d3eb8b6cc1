//! Key-value store capability
//!
//! # Architecture
//!
//! IPAM state lives in a strongly consistent key-value store. Every record is
//! written with compare-and-swap against the revision it was read at:
//!
//! ```text
//! client ── get(key) ──────────────────────→ (value, rev 41)
//!        ── compare_and_swap(key, v', 41) ─→ Swapped(rev 42) | Conflict
//! ```
//!
//! A conflict is an expected outcome, not an error: the caller re-reads and
//! recomputes. The `KvStore` trait is the only seam between the allocation
//! logic and a concrete store; `MemoryStore` implements it in memory.

pub mod memory;

pub use memory::MemoryStore;

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque version token of a stored value
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Revision(u64);

impl Revision {
    pub fn new(revision: u64) -> Self {
        Self(revision)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rev{}", self.0)
    }
}

/// A stored value with the revision it was read at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub value: Vec<u8>,
    pub revision: Revision,
}

/// Outcome of a conditional write or delete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// The write applied; carries the new revision
    Swapped(Revision),
    /// The stored revision did not match; nothing changed
    Conflict,
}

impl CasOutcome {
    pub fn is_swapped(&self) -> bool {
        matches!(self, CasOutcome::Swapped(_))
    }
}

/// Store capability used by the IPAM client
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Strongly consistent read
    async fn get(&self, key: &str) -> Result<Option<KeyValue>>;

    /// Write `value` if the key is at `expected`
    ///
    /// `expected = None` means create-only: the write conflicts if the key
    /// already exists.
    async fn compare_and_swap(
        &self,
        key: &str,
        value: Vec<u8>,
        expected: Option<Revision>,
    ) -> Result<CasOutcome>;

    /// Delete the key if it is still at `expected`
    async fn delete(&self, key: &str, expected: Revision) -> Result<CasOutcome>;
}
