use std::cmp::Ordering;

use crate::btree::serializer::Serializer;

use super::UNSET_ID;

/// An internal B+tree page: `n` separator keys and `n + 1` child
/// references. A child reference is a file offset, or a negative
/// pending id while the child only exists inside a write transaction.
#[derive(Debug, Clone)]
pub struct NodePage {
    pub id: i64,
    pub revision: u64,
    keys: Vec<Vec<u8>>,
    children: Vec<i64>,
}

/// Outcome of folding a child split into its parent.
pub enum NodeInsert {
    Modified { page: NodePage },
    /// The parent was full too. `promoted` moves up one level and is
    /// not duplicated in either half.
    Split {
        left: NodePage,
        right: NodePage,
        promoted: Vec<u8>,
    },
}

impl NodePage {
    pub fn from_parts(
        id: i64,
        revision: u64,
        keys: Vec<Vec<u8>>,
        children: Vec<i64>,
    ) -> Self {
        assert_eq!(keys.len() + 1, children.len());
        Self {
            id,
            revision,
            keys,
            children,
        }
    }

    /// Fresh root above a split.
    pub fn new_root(revision: u64, pivot: Vec<u8>, left: i64, right: i64) -> Self {
        Self::from_parts(UNSET_ID, revision, vec![pivot], vec![left, right])
    }

    pub fn count(&self) -> usize {
        self.keys.len()
    }

    pub fn key_at(&self, i: usize) -> &[u8] {
        &self.keys[i]
    }

    pub fn child_at(&self, i: usize) -> i64 {
        self.children[i]
    }

    pub fn keys(&self) -> &[Vec<u8>] {
        &self.keys
    }

    pub fn children(&self) -> &[i64] {
        &self.children
    }

    /// Index of the child covering `key`: a key equal to a separator
    /// belongs to the child on the separator's right.
    pub fn search_child(&self, cmp: &dyn Serializer, key: &[u8]) -> usize {
        match self.keys.binary_search_by(|probe| cmp.compare(probe, key)) {
            Ok(i) => i + 1,
            Err(i) => i,
        }
    }

    /// Copy with child `i` swapped for a new version.
    pub fn with_child(&self, revision: u64, i: usize, child: i64) -> NodePage {
        let mut copy = self.copy(revision);
        copy.children[i] = child;
        copy
    }

    /// Copy with separator `i` replaced, used when a borrow shifts the
    /// boundary between two children.
    pub fn with_key(&self, revision: u64, i: usize, key: Vec<u8>) -> NodePage {
        let mut copy = self.copy(revision);
        copy.keys[i] = key;
        copy
    }

    /// Copy with separator `key_idx` and child `child_idx` removed,
    /// used when two children merge.
    pub fn remove_entry(&self, revision: u64, key_idx: usize, child_idx: usize) -> NodePage {
        let mut copy = self.copy(revision);
        copy.keys.remove(key_idx);
        copy.children.remove(child_idx);
        copy
    }

    /// Fold a split of child `child_idx` into this node: the child slot
    /// is replaced by `left`, and `pivot`/`right` are inserted after
    /// it. Splits this node in turn when it is already at `fanout`.
    pub fn apply_split(
        &self,
        revision: u64,
        fanout: u32,
        child_idx: usize,
        pivot: Vec<u8>,
        left: i64,
        right: i64,
    ) -> NodeInsert {
        let mut keys = self.keys.clone();
        let mut children = self.children.clone();
        children[child_idx] = left;
        keys.insert(child_idx, pivot);
        children.insert(child_idx + 1, right);

        if keys.len() <= fanout as usize {
            return NodeInsert::Modified {
                page: NodePage::from_parts(UNSET_ID, revision, keys, children),
            };
        }

        // F + 1 keys: promote the middle one
        let mid = keys.len() / 2;
        let right_keys = keys.split_off(mid + 1);
        let promoted = keys.pop().unwrap();
        let right_children = children.split_off(mid + 1);

        let left_page = NodePage::from_parts(UNSET_ID, revision, keys, children);
        let right_page =
            NodePage::from_parts(UNSET_ID, revision, right_keys, right_children);
        NodeInsert::Split {
            left: left_page,
            right: right_page,
            promoted,
        }
    }

    pub fn is_sorted(&self, cmp: &dyn Serializer) -> bool {
        self.keys
            .windows(2)
            .all(|w| cmp.compare(&w[0], &w[1]) == Ordering::Less)
    }

    fn copy(&self, revision: u64) -> NodePage {
        NodePage {
            id: UNSET_ID,
            revision,
            keys: self.keys.clone(),
            children: self.children.clone(),
        }
    }
}
