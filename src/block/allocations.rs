//! Per-ordinal allocation array

use super::attributes::AttributeIndex;
use super::Ordinal;
use std::collections::{BTreeMap, BTreeSet};

/// One slot per address in a block
///
/// `None` means the address is free; `Some(index)` points into the block's
/// attribute table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationArray {
    slots: Vec<Option<AttributeIndex>>,
}

impl AllocationArray {
    /// Create an array with every ordinal free
    pub fn free(size: usize) -> Self {
        Self {
            slots: vec![None; size],
        }
    }

    pub fn from_slots(slots: Vec<Option<AttributeIndex>>) -> Self {
        Self { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slots(&self) -> &[Option<AttributeIndex>] {
        &self.slots
    }

    /// Attribute index held by `ordinal`, or `None` if free or out of range
    pub fn get(&self, ordinal: Ordinal) -> Option<AttributeIndex> {
        self.slots.get(ordinal as usize).copied().flatten()
    }

    pub fn is_assigned(&self, ordinal: Ordinal) -> bool {
        self.get(ordinal).is_some()
    }

    pub fn set(&mut self, ordinal: Ordinal, index: AttributeIndex) {
        self.slots[ordinal as usize] = Some(index);
    }

    pub fn clear(&mut self, ordinal: Ordinal) {
        self.slots[ordinal as usize] = None;
    }

    pub fn iter(&self) -> impl Iterator<Item = (Ordinal, Option<AttributeIndex>)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .map(|(ordinal, slot)| (ordinal as Ordinal, *slot))
    }

    /// Ordinals whose slot is free, ascending
    pub fn free_ordinals(&self) -> impl Iterator<Item = Ordinal> + '_ {
        self.iter()
            .filter(|(_, slot)| slot.is_none())
            .map(|(ordinal, _)| ordinal)
    }

    pub fn count_free(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_none()).count()
    }

    /// Ordinals pointing at any of `indexes`, ascending
    pub fn ordinals_referencing(&self, indexes: &BTreeSet<AttributeIndex>) -> Vec<Ordinal> {
        self.iter()
            .filter(|(_, slot)| slot.is_some_and(|index| indexes.contains(&index)))
            .map(|(ordinal, _)| ordinal)
            .collect()
    }

    /// Number of ordinals referencing each attribute index
    ///
    /// Unreferenced indexes are absent rather than reported as zero.
    pub fn ref_counts(&self) -> BTreeMap<AttributeIndex, usize> {
        let mut counts = BTreeMap::new();
        for index in self.slots.iter().flatten() {
            *counts.entry(*index).or_insert(0) += 1;
        }
        counts
    }

    /// Rewrite every assigned slot through an old → new index map
    ///
    /// Slots whose index maps to `None` become free. Callers must have checked
    /// that only released ordinals hit that case.
    pub fn remap(&mut self, map: &[Option<AttributeIndex>]) {
        for slot in self.slots.iter_mut() {
            if let Some(index) = *slot {
                *slot = map[index.as_usize()];
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ref_counts_skip_free_and_unreferenced() {
        let mut array = AllocationArray::free(4);
        array.set(0, AttributeIndex::new(2));
        array.set(1, AttributeIndex::new(2));
        array.set(3, AttributeIndex::new(0));

        let counts = array.ref_counts();
        assert_eq!(counts.len(), 2);
        assert_eq!(counts[&AttributeIndex::new(2)], 2);
        assert_eq!(counts[&AttributeIndex::new(0)], 1);
        assert!(!counts.contains_key(&AttributeIndex::new(1)));
    }

    #[test]
    fn test_remap_and_free_ordinals() {
        let mut array = AllocationArray::free(3);
        array.set(0, AttributeIndex::new(0));
        array.set(2, AttributeIndex::new(2));

        array.remap(&[Some(AttributeIndex::new(0)), None, Some(AttributeIndex::new(1))]);

        assert_eq!(array.get(0), Some(AttributeIndex::new(0)));
        assert_eq!(array.get(2), Some(AttributeIndex::new(1)));
        assert_eq!(array.free_ordinals().collect::<Vec<_>>(), vec![1]);
        assert_eq!(array.count_free(), 1);
    }

    #[test]
    fn test_get_out_of_range_is_none() {
        let array = AllocationArray::free(2);
        assert_eq!(array.get(7), None);
        assert!(!array.is_assigned(7));
    }
}
