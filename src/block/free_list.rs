//! Free-list of unassigned ordinals

use super::Ordinal;
use std::collections::VecDeque;

/// Unassigned ordinals in reuse order
///
/// Auto-assignment takes from the front and releases append to the back, so
/// a freshly released address is the last one handed out again.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FreeList {
    ordinals: VecDeque<Ordinal>,
}

impl FreeList {
    /// Free-list for a brand new block: every ordinal, ascending
    pub fn full(size: usize) -> Self {
        Self {
            ordinals: (0..size as Ordinal).collect(),
        }
    }

    pub fn from_ordinals(ordinals: Vec<Ordinal>) -> Self {
        Self {
            ordinals: ordinals.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.ordinals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordinals.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Ordinal> + '_ {
        self.ordinals.iter().copied()
    }

    pub fn contains(&self, ordinal: Ordinal) -> bool {
        self.ordinals.contains(&ordinal)
    }

    /// Take up to `count` ordinals from the front
    pub fn take(&mut self, count: usize) -> Vec<Ordinal> {
        let count = count.min(self.ordinals.len());
        self.ordinals.drain(..count).collect()
    }

    pub fn push_back(&mut self, ordinal: Ordinal) {
        self.ordinals.push_back(ordinal);
    }

    /// Remove a specific ordinal, returning whether it was present
    pub fn remove(&mut self, ordinal: Ordinal) -> bool {
        match self.ordinals.iter().position(|&o| o == ordinal) {
            Some(position) => {
                self.ordinals.remove(position);
                true
            }
            None => false,
        }
    }

    pub fn to_vec(&self) -> Vec<Ordinal> {
        self.ordinals.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_from_front_release_to_back() {
        let mut list = FreeList::full(4);

        assert_eq!(list.take(2), vec![0, 1]);
        list.push_back(0);
        assert_eq!(list.to_vec(), vec![2, 3, 0]);

        // Asking for more than is left returns what there is
        assert_eq!(list.take(10), vec![2, 3, 0]);
        assert!(list.is_empty());
    }

    #[test]
    fn test_remove_specific_ordinal() {
        let mut list = FreeList::full(3);
        assert!(list.remove(1));
        assert!(!list.remove(1));
        assert!(!list.contains(1));
        assert_eq!(list.len(), 2);
    }
}
