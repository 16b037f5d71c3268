use std::cmp::Ordering;

use crate::btree::serializer::Serializer;

use super::UNSET_ID;

/// A B+tree leaf: sorted keys with their values.
///
/// Operations never mutate in place. They return fresh pages carrying
/// the mutating transaction's revision; the caller stages the copies
/// and retires the original.
#[derive(Debug, Clone)]
pub struct LeafPage {
    pub id: i64,
    pub revision: u64,
    keys: Vec<Vec<u8>>,
    values: Vec<Vec<u8>>,
}

/// Outcome of a copy-on-write leaf insertion.
pub enum LeafInsert {
    /// Key was present; the copy holds the new value.
    Replaced { page: LeafPage, old: Vec<u8> },
    /// Key was absent and the leaf had room.
    Inserted { page: LeafPage },
    /// Leaf was full. `pivot` is the first key of the right page.
    Split {
        left: LeafPage,
        right: LeafPage,
        pivot: Vec<u8>,
    },
}

impl LeafPage {
    pub fn empty(revision: u64) -> Self {
        Self::from_parts(UNSET_ID, revision, Vec::new(), Vec::new())
    }

    pub fn from_parts(
        id: i64,
        revision: u64,
        keys: Vec<Vec<u8>>,
        values: Vec<Vec<u8>>,
    ) -> Self {
        assert_eq!(keys.len(), values.len());
        Self {
            id,
            revision,
            keys,
            values,
        }
    }

    pub fn count(&self) -> usize {
        self.keys.len()
    }

    pub fn key_at(&self, i: usize) -> &[u8] {
        &self.keys[i]
    }

    pub fn value_at(&self, i: usize) -> &[u8] {
        &self.values[i]
    }

    /// Binary search under the tree comparator. `Ok(i)` means the key
    /// sits at `i`; `Err(i)` is the position it would be inserted at.
    pub fn search(&self, cmp: &dyn Serializer, key: &[u8]) -> Result<usize, usize> {
        self.keys.binary_search_by(|probe| cmp.compare(probe, key))
    }

    pub fn get(&self, cmp: &dyn Serializer, key: &[u8]) -> Option<&[u8]> {
        match self.search(cmp, key) {
            Ok(i) => Some(&self.values[i]),
            Err(_) => None,
        }
    }

    pub fn insert(
        &self,
        cmp: &dyn Serializer,
        fanout: u32,
        revision: u64,
        key: &[u8],
        value: &[u8],
    ) -> LeafInsert {
        match self.search(cmp, key) {
            Ok(i) => {
                let mut copy = self.copy(revision);
                let old = std::mem::replace(&mut copy.values[i], value.to_vec());
                LeafInsert::Replaced { page: copy, old }
            }
            Err(i) => {
                if self.count() < fanout as usize {
                    let mut copy = self.copy(revision);
                    copy.keys.insert(i, key.to_vec());
                    copy.values.insert(i, value.to_vec());
                    LeafInsert::Inserted { page: copy }
                } else {
                    self.split_insert(revision, i, key, value)
                }
            }
        }
    }

    fn split_insert(
        &self,
        revision: u64,
        at: usize,
        key: &[u8],
        value: &[u8],
    ) -> LeafInsert {
        let mut keys = self.keys.clone();
        let mut values = self.values.clone();
        keys.insert(at, key.to_vec());
        values.insert(at, value.to_vec());

        // F + 1 elements; the left page takes the larger half
        let mid = (keys.len() + 1) / 2;
        let right_keys = keys.split_off(mid);
        let right_values = values.split_off(mid);

        let pivot = right_keys[0].clone();
        let left = LeafPage::from_parts(UNSET_ID, revision, keys, values);
        let right = LeafPage::from_parts(UNSET_ID, revision, right_keys, right_values);
        LeafInsert::Split { left, right, pivot }
    }

    /// Copy with `key` removed, plus the removed value. `None` if the
    /// key is absent. Underflow is the parent's concern: only the
    /// parent knows the siblings.
    pub fn delete(
        &self,
        cmp: &dyn Serializer,
        revision: u64,
        key: &[u8],
    ) -> Option<(LeafPage, Vec<u8>)> {
        match self.search(cmp, key) {
            Ok(i) => {
                let mut copy = self.copy(revision);
                copy.keys.remove(i);
                let old = copy.values.remove(i);
                Some((copy, old))
            }
            Err(_) => None,
        }
    }

    /// Verify internal key order; used by the integrity checker.
    pub fn is_sorted(&self, cmp: &dyn Serializer) -> bool {
        self.keys
            .windows(2)
            .all(|w| cmp.compare(&w[0], &w[1]) == Ordering::Less)
    }

    pub fn keys(&self) -> &[Vec<u8>] {
        &self.keys
    }

    pub fn values(&self) -> &[Vec<u8>] {
        &self.values
    }

    fn copy(&self, revision: u64) -> LeafPage {
        LeafPage {
            id: UNSET_ID,
            revision,
            keys: self.keys.clone(),
            values: self.values.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::serializer::{LongSerializer, Serializer};

    fn leaf(keys: &[u64]) -> LeafPage {
        LeafPage::from_parts(
            1,
            1,
            keys.iter().map(|&k| LongSerializer::encode(k)).collect(),
            keys.iter().map(|&k| format!("v{}", k).into_bytes()).collect(),
        )
    }

    fn cmp() -> &'static dyn Serializer {
        &LongSerializer
    }

    #[test]
    fn insert_keeps_order() {
        let l = leaf(&[2, 4, 8]);
        match l.insert(cmp(), 4, 2, &LongSerializer::encode(6), b"v6") {
            LeafInsert::Inserted { page } => {
                assert_eq!(page.count(), 4);
                assert!(page.is_sorted(cmp()));
                assert_eq!(page.get(cmp(), &LongSerializer::encode(6)).unwrap(), b"v6");
                // original untouched
                assert_eq!(l.count(), 3);
            }
            _ => panic!("expected plain insert"),
        }
    }

    #[test]
    fn full_leaf_splits_with_first_right_key_as_pivot() {
        let l = leaf(&[1, 2, 3, 4]);
        match l.insert(cmp(), 4, 2, &LongSerializer::encode(5), b"v5") {
            LeafInsert::Split { left, right, pivot } => {
                assert_eq!(left.count(), 3);
                assert_eq!(right.count(), 2);
                assert_eq!(pivot, right.key_at(0));
                assert!(left.is_sorted(cmp()) && right.is_sorted(cmp()));
            }
            _ => panic!("expected split"),
        }
    }

    #[test]
    fn replace_returns_previous_value() {
        let l = leaf(&[1, 2]);
        match l.insert(cmp(), 4, 2, &LongSerializer::encode(2), b"new") {
            LeafInsert::Replaced { page, old } => {
                assert_eq!(old, b"v2");
                assert_eq!(page.get(cmp(), &LongSerializer::encode(2)).unwrap(), b"new");
                assert_eq!(page.count(), 2);
            }
            _ => panic!("expected replace"),
        }
    }

    #[test]
    fn delete_missing_key_is_none() {
        let l = leaf(&[1, 3]);
        assert!(l.delete(cmp(), 2, &LongSerializer::encode(2)).is_none());
        let (page, old) = l.delete(cmp(), 2, &LongSerializer::encode(3)).unwrap();
        assert_eq!(old, b"v3");
        assert_eq!(page.count(), 1);
    }
}
