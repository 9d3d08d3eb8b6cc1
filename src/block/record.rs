//! Stored representation of an allocation block
//!
//! Blocks are written as JSON:
//!
//! ```text
//! {
//!   "cidr": "10.0.0.0/26",
//!   "affinity": "host:node-a",          "" when unclaimed
//!   "strict_affinity": false,
//!   "allocations": [0, 0, null, 1, ...],  one entry per ordinal
//!   "attributes": [{"handle_id": "h1", "secondary": {...}}, ...],
//!   "unallocated": [2, 4, 5, ...]
//! }
//! ```
//!
//! Attribute order is preserved exactly since allocation entries index into
//! it. A missing `unallocated` list is rebuilt from the allocations.

use super::allocation_block::AllocationBlock;
use super::allocations::AllocationArray;
use super::attributes::{AttributeIndex, AttributeRecord, AttributeTable};
use super::free_list::FreeList;
use super::Ordinal;
use crate::cidr;
use crate::error::{Error, Result};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

const HOST_AFFINITY_PREFIX: &str = "host:";

#[derive(Debug, Serialize, Deserialize)]
struct BlockRecord {
    cidr: IpNet,
    #[serde(default)]
    affinity: String,
    #[serde(default)]
    strict_affinity: bool,
    allocations: Vec<Option<AttributeIndex>>,
    attributes: Vec<AttributeRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    unallocated: Option<Vec<Ordinal>>,
}

impl AllocationBlock {
    /// Serialize to the stored JSON form
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let record = BlockRecord {
            cidr: self.cidr(),
            affinity: self
                .host_affinity()
                .map(|host| format!("{}{}", HOST_AFFINITY_PREFIX, host))
                .unwrap_or_default(),
            strict_affinity: self.strict_affinity(),
            allocations: self.allocations().slots().to_vec(),
            attributes: self.attributes().records().to_vec(),
            unallocated: Some(self.unallocated().to_vec()),
        };

        serde_json::to_vec(&record)
            .map_err(|e| Error::Serialization(format!("Failed to serialize block {}: {}", self.cidr(), e)))
    }

    /// Decode a stored block and verify its integrity
    ///
    /// The returned block carries no revision; callers reading from a store
    /// attach the revision they read at.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let record: BlockRecord = serde_json::from_slice(bytes)
            .map_err(|e| Error::Serialization(format!("Failed to deserialize block: {}", e)))?;

        if record.cidr != record.cidr.trunc() {
            return Err(Error::Block(format!("{} is not a network prefix", record.cidr)));
        }
        let size = cidr::block_size(&record.cidr)?;
        if record.allocations.len() != size {
            return Err(Error::Block(format!(
                "block {} has {} allocation entries, expected {}",
                record.cidr,
                record.allocations.len(),
                size
            )));
        }

        let host_affinity = if record.affinity.is_empty() {
            None
        } else {
            let host = record
                .affinity
                .strip_prefix(HOST_AFFINITY_PREFIX)
                .ok_or_else(|| {
                    Error::Block(format!(
                        "block {} has malformed affinity {:?}",
                        record.cidr, record.affinity
                    ))
                })?;
            Some(host.to_string())
        };

        let allocations = AllocationArray::from_slots(record.allocations);
        let unallocated = match record.unallocated {
            Some(ordinals) => FreeList::from_ordinals(ordinals),
            None => FreeList::from_ordinals(allocations.free_ordinals().collect()),
        };

        let block = Self::from_parts(
            record.cidr,
            host_affinity,
            record.strict_affinity,
            allocations,
            unallocated,
            AttributeTable::from_records(record.attributes),
        );
        block.verify()?;
        Ok(block)
    }
}
