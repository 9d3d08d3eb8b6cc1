//! Block integrity checks
//!
//! Read-only audits of the invariants tying the allocation array, free-list
//! and attribute table together. A violation always means a bug or a corrupt
//! record; nothing here tries to repair it.

use super::allocation_block::AllocationBlock;
use super::attributes::AttributeIndex;
use super::Ordinal;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// A broken block invariant, naming the offending ordinal or index
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntegrityViolation {
    #[error("ordinal {ordinal} references {index} but the table has {len} records")]
    IndexOutOfRange {
        ordinal: Ordinal,
        index: AttributeIndex,
        len: usize,
    },

    #[error("{index} is not referenced by any allocation")]
    UnreferencedAttribute { index: AttributeIndex },

    #[error("{duplicate} duplicates {first}")]
    DuplicateAttribute {
        first: AttributeIndex,
        duplicate: AttributeIndex,
    },

    #[error("cannot delete {index}: the table has {len} records")]
    DeleteIndexOutOfRange { index: AttributeIndex, len: usize },

    #[error("ordinal {ordinal} would be left pointing at deleted {index}")]
    DanglingReference {
        ordinal: Ordinal,
        index: AttributeIndex,
    },

    #[error("ordinal {ordinal} appears more than once in the free-list")]
    DuplicateFreeOrdinal { ordinal: Ordinal },

    #[error("ordinal {ordinal} is in the free-list but is assigned or out of range")]
    FreeOrdinalNotFree { ordinal: Ordinal },

    #[error("free-list holds {listed} ordinals but {free} allocations are free")]
    FreeCountMismatch { listed: usize, free: usize },
}

impl AllocationBlock {
    /// Verify the allocation array against the attribute table
    ///
    /// Every assigned slot must point inside the table, every record must be
    /// referenced at least once, and no two records may be identical.
    pub fn verify_attributes(&self) -> Result<(), IntegrityViolation> {
        let len = self.attributes().len();
        for (ordinal, slot) in self.allocations().iter() {
            if let Some(index) = slot {
                if index.as_usize() >= len {
                    return Err(IntegrityViolation::IndexOutOfRange { ordinal, index, len });
                }
            }
        }

        let counts = self.attribute_ref_counts();
        let mut seen = HashMap::with_capacity(len);
        for (index, record) in self.attributes().iter() {
            if !counts.contains_key(&index) {
                return Err(IntegrityViolation::UnreferencedAttribute { index });
            }
            if let Some(&first) = seen.get(record) {
                return Err(IntegrityViolation::DuplicateAttribute {
                    first,
                    duplicate: index,
                });
            }
            seen.insert(record, index);
        }

        Ok(())
    }

    /// Verify the free-list is exactly the set of free ordinals
    pub fn verify_unallocated(&self) -> Result<(), IntegrityViolation> {
        let mut listed = HashSet::with_capacity(self.unallocated().len());
        for ordinal in self.unallocated().iter() {
            if !listed.insert(ordinal) {
                return Err(IntegrityViolation::DuplicateFreeOrdinal { ordinal });
            }
            if (ordinal as usize) >= self.allocations().len()
                || self.allocations().is_assigned(ordinal)
            {
                return Err(IntegrityViolation::FreeOrdinalNotFree { ordinal });
            }
        }

        let free = self.allocations().count_free();
        if listed.len() != free {
            return Err(IntegrityViolation::FreeCountMismatch {
                listed: listed.len(),
                free,
            });
        }

        Ok(())
    }

    /// Run both checks
    pub fn verify(&self) -> Result<(), IntegrityViolation> {
        self.verify_attributes()?;
        self.verify_unallocated()
    }

    /// Assert integrity after a mutation in debug builds
    pub(crate) fn debug_verify(&self) {
        if cfg!(debug_assertions) {
            if let Err(violation) = self.verify() {
                panic!("block {} integrity violation: {}", self.cidr(), violation);
            }
        }
    }
}
