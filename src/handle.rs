//! Allocation handles
//!
//! A handle record counts, per block, how many addresses were allocated under
//! one handle ID. It lets a client release everything for a handle by visiting
//! only the blocks listed, instead of scanning every block.

use crate::block::HandleId;
use crate::error::{Error, Result};
use crate::store::Revision;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationHandle {
    handle_id: HandleId,
    /// Allocated address count keyed by block CIDR
    blocks: BTreeMap<IpNet, u64>,
    revision: Option<Revision>,
}

#[derive(Serialize, Deserialize)]
struct HandleRecord {
    id: HandleId,
    #[serde(default)]
    block: BTreeMap<String, u64>,
}

impl AllocationHandle {
    pub fn new(handle_id: HandleId) -> Self {
        Self {
            handle_id,
            blocks: BTreeMap::new(),
            revision: None,
        }
    }

    pub fn handle_id(&self) -> &HandleId {
        &self.handle_id
    }

    pub fn revision(&self) -> Option<Revision> {
        self.revision
    }

    pub fn set_revision(&mut self, revision: Option<Revision>) {
        self.revision = revision;
    }

    /// Blocks holding addresses for this handle
    pub fn blocks(&self) -> impl Iterator<Item = IpNet> + '_ {
        self.blocks.keys().copied()
    }

    pub fn count_for(&self, block: &IpNet) -> u64 {
        self.blocks.get(block).copied().unwrap_or(0)
    }

    /// Add `num` addresses in `block`, returning the new count
    pub fn increment_block(&mut self, block: IpNet, num: u64) -> u64 {
        let count = self.blocks.entry(block).or_insert(0);
        *count += num;
        *count
    }

    /// Remove `num` addresses in `block`, returning the new count
    ///
    /// A block whose count reaches zero is dropped from the handle.
    pub fn decrement_block(&mut self, block: IpNet, num: u64) -> Result<u64> {
        let current = self.count_for(&block);
        if !self.blocks.contains_key(&block) || current < num {
            return Err(Error::AddressCountTooLow {
                handle: self.handle_id.to_string(),
                block: block.to_string(),
                available: current,
                requested: num,
            });
        }

        let remaining = current - num;
        if remaining == 0 {
            self.blocks.remove(&block);
        } else {
            self.blocks.insert(block, remaining);
        }
        Ok(remaining)
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let record = HandleRecord {
            id: self.handle_id.clone(),
            block: self
                .blocks
                .iter()
                .map(|(cidr, count)| (cidr.to_string(), *count))
                .collect(),
        };
        serde_json::to_vec(&record).map_err(|e| {
            Error::Serialization(format!("Failed to serialize handle {}: {}", self.handle_id, e))
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let record: HandleRecord = serde_json::from_slice(bytes)
            .map_err(|e| Error::Serialization(format!("Failed to deserialize handle: {}", e)))?;

        let mut blocks = BTreeMap::new();
        for (cidr, count) in record.block {
            let cidr: IpNet = cidr.parse().map_err(|e| {
                Error::Serialization(format!("Handle {} lists invalid block {:?}: {}", record.id, cidr, e))
            })?;
            blocks.insert(cidr, count);
        }

        Ok(Self {
            handle_id: record.id,
            blocks,
            revision: None,
        })
    }
}
