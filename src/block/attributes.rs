//! Interned attribute records for allocations

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Free-form metadata stored with an allocation
pub type Tags = BTreeMap<String, String>;

/// Opaque identifier grouping allocations for bulk release
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandleId(String);

impl HandleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HandleId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for HandleId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Position of a record in a block's attribute table
///
/// Only meaningful relative to the block snapshot it was read from: any
/// compaction renumbers the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributeIndex(u32);

impl AttributeIndex {
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for AttributeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "attr#{}", self.0)
    }
}

/// Metadata describing why, and on whose behalf, an address is held
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttributeRecord {
    /// Handle grouping this allocation, if the caller supplied one
    pub handle_id: Option<HandleId>,
    /// Caller tags, not interpreted here
    #[serde(default)]
    pub secondary: Tags,
}

impl AttributeRecord {
    pub fn new(handle_id: Option<HandleId>, secondary: Tags) -> Self {
        Self {
            handle_id,
            secondary,
        }
    }

    fn matches(&self, handle_id: Option<&HandleId>, secondary: &Tags) -> bool {
        self.handle_id.as_ref() == handle_id && &self.secondary == secondary
    }
}

/// Ordered, deduplicated table of attribute records
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeTable {
    records: Vec<AttributeRecord>,
}

impl AttributeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap records decoded from storage. Order is preserved exactly.
    pub fn from_records(records: Vec<AttributeRecord>) -> Self {
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, index: AttributeIndex) -> Option<&AttributeRecord> {
        self.records.get(index.as_usize())
    }

    pub fn records(&self) -> &[AttributeRecord] {
        &self.records
    }

    pub fn iter(&self) -> impl Iterator<Item = (AttributeIndex, &AttributeRecord)> {
        self.records
            .iter()
            .enumerate()
            .map(|(i, record)| (AttributeIndex::new(i as u32), record))
    }

    /// Index of an existing record with exactly this handle and tags
    pub fn find(&self, handle_id: Option<&HandleId>, secondary: &Tags) -> Option<AttributeIndex> {
        self.iter()
            .find(|(_, record)| record.matches(handle_id, secondary))
            .map(|(index, _)| index)
    }

    /// Return the index of a matching record, appending one if none exists
    ///
    /// This is the only way records enter the table.
    pub fn find_or_add(&mut self, handle_id: Option<&HandleId>, secondary: &Tags) -> AttributeIndex {
        if let Some(index) = self.find(handle_id, secondary) {
            return index;
        }

        let index = AttributeIndex::new(self.records.len() as u32);
        self.records
            .push(AttributeRecord::new(handle_id.cloned(), secondary.clone()));
        index
    }

    /// Indexes of every record carrying the given handle, in table order
    pub fn indexes_by_handle(&self, handle_id: &HandleId) -> Vec<AttributeIndex> {
        self.iter()
            .filter(|(_, record)| record.handle_id.as_ref() == Some(handle_id))
            .map(|(index, _)| index)
            .collect()
    }

    /// Old-index → new-index map for removing `to_delete`
    ///
    /// Entry `i` is `None` when record `i` is deleted, otherwise its position
    /// once the survivors are packed.
    pub fn compaction_map(&self, to_delete: &BTreeSet<AttributeIndex>) -> Vec<Option<AttributeIndex>> {
        let mut next = 0u32;
        (0..self.records.len() as u32)
            .map(|i| {
                if to_delete.contains(&AttributeIndex::new(i)) {
                    None
                } else {
                    let new_index = AttributeIndex::new(next);
                    next += 1;
                    Some(new_index)
                }
            })
            .collect()
    }

    /// Drop every record mapped to `None` by a map from [`Self::compaction_map`]
    pub fn apply_compaction(&mut self, map: &[Option<AttributeIndex>]) {
        debug_assert_eq!(map.len(), self.records.len());
        let mut position = 0;
        self.records.retain(|_| {
            let keep = map[position].is_some();
            position += 1;
            keep
        });
    }
}
