//! Allocation block: the per-CIDR assignment record

use super::allocations::AllocationArray;
use super::attributes::{AttributeIndex, AttributeRecord, AttributeTable, HandleId, Tags};
use super::free_list::FreeList;
use super::integrity::IntegrityViolation;
use super::Ordinal;
use crate::cidr;
use crate::error::{Error, Result};
use crate::store::Revision;
use ipnet::IpNet;
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use tracing::{debug, warn};

/// A block of addresses from which IPAM clients allocate
///
/// Each block is one keyed record in the store, and the record value encodes
/// every allocation inside the prefix. If another process updates the record
/// first, the compare-and-swap write of this instance fails and the caller
/// must drop it, re-read, recompute and try again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationBlock {
    cidr: IpNet,
    /// Host with affinity to this block, if any
    host_affinity: Option<String>,
    /// When set, only the affine host may assign from this block
    strict_affinity: bool,
    allocations: AllocationArray,
    unallocated: FreeList,
    attributes: AttributeTable,
    /// Store revision this instance was read at; `None` for a block not yet written
    revision: Option<Revision>,
}

/// Result of releasing a set of addresses
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseOutcome {
    /// Requested addresses that were not assigned
    pub unallocated: BTreeSet<IpAddr>,
    /// Released address count per handle (`None` for handle-less allocations)
    pub handles: BTreeMap<Option<HandleId>, u64>,
}

impl AllocationBlock {
    /// Create an empty block with every address free
    pub fn new(cidr: IpNet, host_affinity: Option<String>, strict_affinity: bool) -> Result<Self> {
        if cidr != cidr.trunc() {
            return Err(Error::Block(format!(
                "{} is not a network prefix (expected {})",
                cidr,
                cidr.trunc()
            )));
        }
        let size = cidr::block_size(&cidr)?;

        Ok(Self::from_parts(
            cidr,
            host_affinity,
            strict_affinity,
            AllocationArray::free(size),
            FreeList::full(size),
            AttributeTable::new(),
        ))
    }

    /// Assemble a block from already-decoded parts without checking them
    pub(crate) fn from_parts(
        cidr: IpNet,
        host_affinity: Option<String>,
        strict_affinity: bool,
        allocations: AllocationArray,
        unallocated: FreeList,
        attributes: AttributeTable,
    ) -> Self {
        Self {
            cidr,
            host_affinity,
            strict_affinity,
            allocations,
            unallocated,
            attributes,
            revision: None,
        }
    }

    pub fn cidr(&self) -> IpNet {
        self.cidr
    }

    pub fn host_affinity(&self) -> Option<&str> {
        self.host_affinity.as_deref()
    }

    pub fn set_host_affinity(&mut self, host: Option<String>) {
        self.host_affinity = host;
    }

    pub fn strict_affinity(&self) -> bool {
        self.strict_affinity
    }

    pub fn allocations(&self) -> &AllocationArray {
        &self.allocations
    }

    pub fn unallocated(&self) -> &FreeList {
        &self.unallocated
    }

    pub fn attributes(&self) -> &AttributeTable {
        &self.attributes
    }

    pub fn revision(&self) -> Option<Revision> {
        self.revision
    }

    pub fn set_revision(&mut self, revision: Option<Revision>) {
        self.revision = revision;
    }

    /// Number of addresses in the block
    pub fn size(&self) -> usize {
        self.allocations.len()
    }

    pub fn count_free_addresses(&self) -> usize {
        self.unallocated.len()
    }

    /// True when nothing in the block is assigned
    pub fn is_empty(&self) -> bool {
        self.count_free_addresses() == self.size()
    }

    pub fn is_full(&self) -> bool {
        self.unallocated.is_empty()
    }

    /// Ordinal of `address`, failing if it lies outside the block
    pub fn ordinal_of(&self, address: IpAddr) -> Result<Ordinal> {
        cidr::ordinal_of(&self.cidr, address)
            .ok_or_else(|| Error::Block(format!("{} is not in block {}", address, self.cidr)))
    }

    /// Address at `ordinal`, failing if it is out of range
    pub fn address_of(&self, ordinal: Ordinal) -> Result<IpAddr> {
        cidr::address_at(&self.cidr, ordinal)
            .ok_or_else(|| Error::Block(format!("ordinal {} is outside block {}", ordinal, self.cidr)))
    }

    /// Fail unless `host` holds affinity to this block
    pub fn check_affinity(&self, host: &str) -> Result<()> {
        if self.host_affinity.as_deref() != Some(host) {
            return Err(Error::NoHostAffinity {
                cidr: self.cidr,
                affinity: self.host_affinity.clone(),
                host: host.to_string(),
            });
        }
        Ok(())
    }

    /// Pick and assign up to `num` free addresses
    ///
    /// Addresses come from the front of the free-list. A full or nearly full
    /// block returns fewer than requested. Affinity is checked when the block
    /// is strict or `affinity_check` is set.
    pub fn auto_assign(
        &mut self,
        num: usize,
        handle_id: Option<&HandleId>,
        tags: &Tags,
        host: &str,
        affinity_check: bool,
    ) -> Result<Vec<IpAddr>> {
        if self.strict_affinity || affinity_check {
            self.check_affinity(host)?;
        }

        let ordinals: Vec<Ordinal> = self.unallocated.iter().take(num).collect();
        if ordinals.is_empty() {
            debug!(cidr = %self.cidr, "Block is full");
            return Ok(Vec::new());
        }
        let addresses = ordinals
            .iter()
            .map(|&ordinal| self.address_of(ordinal))
            .collect::<Result<Vec<_>>>()?;

        self.unallocated.take(ordinals.len());
        let index = self.attributes.find_or_add(handle_id, tags);
        for &ordinal in &ordinals {
            self.allocations.set(ordinal, index);
        }
        let index = self.drop_unreferenced(index);

        debug!(cidr = %self.cidr, count = addresses.len(), %index, "Auto-assigned addresses");
        self.debug_verify();
        Ok(addresses)
    }

    /// Assign one specific address
    ///
    /// Fails with `AlreadyAssigned` if taken, and with `NoHostAffinity` if the
    /// block is strict and `host` does not hold it.
    pub fn assign(
        &mut self,
        address: IpAddr,
        handle_id: Option<&HandleId>,
        tags: &Tags,
        host: &str,
    ) -> Result<()> {
        if self.strict_affinity {
            self.check_affinity(host)?;
        }
        let ordinal = self.ordinal_of(address)?;
        self.assign_ordinals(&[ordinal], handle_id, tags)?;
        Ok(())
    }

    /// Assign every ordinal in `ordinals` to one attribute record
    ///
    /// All-or-nothing: if any ordinal is out of range or already assigned the
    /// block is left untouched.
    pub fn assign_ordinals(
        &mut self,
        ordinals: &[Ordinal],
        handle_id: Option<&HandleId>,
        tags: &Tags,
    ) -> Result<AttributeIndex> {
        let requested: BTreeSet<Ordinal> = ordinals.iter().copied().collect();
        if requested.is_empty() {
            return Err(Error::Block(format!("no ordinals requested in block {}", self.cidr)));
        }
        for &ordinal in &requested {
            let address = self.address_of(ordinal)?;
            if self.allocations.is_assigned(ordinal) {
                return Err(Error::AlreadyAssigned {
                    address,
                    cidr: self.cidr,
                });
            }
        }

        let index = self.attributes.find_or_add(handle_id, tags);
        for &ordinal in &requested {
            self.allocations.set(ordinal, index);
            self.unallocated.remove(ordinal);
        }
        let index = self.drop_unreferenced(index);

        self.debug_verify();
        Ok(index)
    }

    /// Drop records no ordinal references, returning the new position of `keep`
    ///
    /// Clears out records left behind by `find_or_add_attrs` when they were
    /// never used. `keep` must be referenced.
    fn drop_unreferenced(&mut self, keep: AttributeIndex) -> AttributeIndex {
        let ref_counts = self.allocations.ref_counts();
        let unreferenced: BTreeSet<AttributeIndex> = self
            .attributes
            .iter()
            .map(|(index, _)| index)
            .filter(|index| !ref_counts.contains_key(index))
            .collect();
        if unreferenced.is_empty() {
            return keep;
        }

        debug!(cidr = %self.cidr, dropped = unreferenced.len(), "Dropping unused attribute records");
        let map = self.attributes.compaction_map(&unreferenced);
        self.allocations.remap(&map);
        self.attributes.apply_compaction(&map);
        map[keep.as_usize()].unwrap_or(keep)
    }

    /// Attribute indexes belonging to `handle_id`
    pub fn addr_indexes_by_handle(&self, handle_id: &HandleId) -> Vec<AttributeIndex> {
        self.attributes.indexes_by_handle(handle_id)
    }

    /// Index of the record for `(handle_id, tags)`, adding it if new
    ///
    /// A record added here is unreferenced until an ordinal points at it, and
    /// the block fails `verify_attributes` until then. The next assignment or
    /// release drops it if it is still unused, so the returned index is only
    /// good until the block is mutated.
    pub fn find_or_add_attrs(&mut self, handle_id: Option<&HandleId>, tags: &Tags) -> AttributeIndex {
        self.attributes.find_or_add(handle_id, tags)
    }

    /// Reference count of every attribute index in use
    pub fn attribute_ref_counts(&self) -> BTreeMap<AttributeIndex, usize> {
        self.allocations.ref_counts()
    }

    /// Free `ordinals` and drop the records in `to_delete`, renumbering the rest
    ///
    /// The old → new index map is computed once and applied to the whole
    /// allocation array, so the result never mixes index spaces. Records that
    /// nothing references once the ordinals are freed are deleted as well.
    /// Every check runs before anything changes.
    pub fn delete_attributes(
        &mut self,
        to_delete: &BTreeSet<AttributeIndex>,
        ordinals: &[Ordinal],
    ) -> Result<()> {
        let released: BTreeSet<Ordinal> = ordinals.iter().copied().collect();
        for &ordinal in &released {
            let address = self.address_of(ordinal)?;
            if !self.allocations.is_assigned(ordinal) {
                return Err(Error::AddressNotAssigned {
                    address,
                    cidr: self.cidr,
                });
            }
        }

        let len = self.attributes.len();
        if let Some(index) = to_delete.iter().find(|index| index.as_usize() >= len) {
            return Err(IntegrityViolation::DeleteIndexOutOfRange { index: *index, len }.into());
        }

        let mut surviving_refs: BTreeMap<AttributeIndex, usize> = BTreeMap::new();
        for (ordinal, slot) in self.allocations.iter() {
            let Some(index) = slot else { continue };
            if index.as_usize() >= len {
                return Err(IntegrityViolation::IndexOutOfRange { ordinal, index, len }.into());
            }
            if released.contains(&ordinal) {
                continue;
            }
            if to_delete.contains(&index) {
                return Err(IntegrityViolation::DanglingReference { ordinal, index }.into());
            }
            *surviving_refs.entry(index).or_insert(0) += 1;
        }
        let deleting: BTreeSet<AttributeIndex> = self
            .attributes
            .iter()
            .map(|(index, _)| index)
            .filter(|index| !surviving_refs.contains_key(index))
            .collect();
        let map = self.attributes.compaction_map(&deleting);

        debug!(
            cidr = %self.cidr,
            deleted = deleting.len(),
            ordinals = ?released,
            "Releasing ordinals and compacting attributes"
        );

        for &ordinal in &released {
            self.allocations.clear(ordinal);
            self.unallocated.push_back(ordinal);
        }
        self.allocations.remap(&map);
        self.attributes.apply_compaction(&map);

        self.debug_verify();
        Ok(())
    }

    /// Release the given addresses
    ///
    /// Addresses that are not assigned are reported back rather than treated
    /// as errors. Records whose every reference is released are deleted.
    pub fn release(&mut self, addresses: &BTreeSet<IpAddr>) -> Result<ReleaseOutcome> {
        let mut outcome = ReleaseOutcome::default();
        let mut ordinals = Vec::new();
        let mut releasing: BTreeMap<AttributeIndex, usize> = BTreeMap::new();

        for &address in addresses {
            let ordinal = self.ordinal_of(address)?;
            match self.allocations.get(ordinal) {
                None => {
                    warn!(
                        %address,
                        cidr = %self.cidr,
                        "Asked to release an address that was not allocated"
                    );
                    outcome.unallocated.insert(address);
                }
                Some(index) => {
                    ordinals.push(ordinal);
                    *releasing.entry(index).or_insert(0) += 1;
                    let handle_id = self
                        .attributes
                        .get(index)
                        .and_then(|record| record.handle_id.clone());
                    *outcome.handles.entry(handle_id).or_insert(0) += 1;
                }
            }
        }

        if ordinals.is_empty() {
            return Ok(outcome);
        }

        let ref_counts = self.attribute_ref_counts();
        let to_delete: BTreeSet<AttributeIndex> = releasing
            .iter()
            .filter(|(index, count)| ref_counts.get(index) == Some(count))
            .map(|(index, _)| *index)
            .collect();

        self.delete_attributes(&to_delete, &ordinals)?;
        Ok(outcome)
    }

    /// Release every address held by `handle_id`, returning how many
    pub fn release_by_handle(&mut self, handle_id: &HandleId) -> Result<usize> {
        let indexes: BTreeSet<AttributeIndex> =
            self.addr_indexes_by_handle(handle_id).into_iter().collect();
        if indexes.is_empty() {
            return Ok(0);
        }

        let ordinals = self.allocations.ordinals_referencing(&indexes);
        self.delete_attributes(&indexes, &ordinals)?;
        Ok(ordinals.len())
    }

    /// Addresses held by `handle_id`, ascending
    pub fn ip_assignments_by_handle(&self, handle_id: &HandleId) -> Vec<IpAddr> {
        let indexes: BTreeSet<AttributeIndex> =
            self.addr_indexes_by_handle(handle_id).into_iter().collect();
        self.allocations
            .ordinals_referencing(&indexes)
            .into_iter()
            .filter_map(|ordinal| cidr::address_at(&self.cidr, ordinal))
            .collect()
    }

    /// Handle and tags of an assigned address
    pub fn attributes_for_ip(&self, address: IpAddr) -> Result<&AttributeRecord> {
        let ordinal = self.ordinal_of(address)?;
        let index = self
            .allocations
            .get(ordinal)
            .ok_or(Error::AddressNotAssigned {
                address,
                cidr: self.cidr,
            })?;
        self.attributes.get(index).ok_or_else(|| {
            IntegrityViolation::IndexOutOfRange {
                ordinal,
                index,
                len: self.attributes.len(),
            }
            .into()
        })
    }
}
