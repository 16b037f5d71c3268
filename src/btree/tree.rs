use log::debug;

use crate::{
    btree::{
        cursor::Cursor,
        page::{
            min_occupancy, BTreeHeader, BTreeInfo, BTreePage, LeafInsert, LeafPage,
            NodeInsert, NodePage, UNSET_ID,
        },
        serializer::{self, Serializer},
    },
    error::MaviError,
    transaction::{Snapshot, WriteTransaction},
    types::MaviResult,
};

/// An ordered map bound to a name, a pair of serializers and a fanout.
///
/// The handle itself is a snapshot artifact: it captures the header the
/// opening transaction resolved. All operations re-resolve the current
/// header through the transaction, so a handle opened early in a write
/// transaction observes that transaction's own mutations.
pub struct BTree {
    info: BTreeInfo,
    header: BTreeHeader,
    key_ser: &'static dyn Serializer,
    val_ser: &'static dyn Serializer,
}

enum InsertOutcome {
    Replaced { page: i64, old: Vec<u8> },
    Added { page: i64 },
    Split { left: i64, right: i64, pivot: Vec<u8> },
}

enum DeleteOutcome {
    NotPresent,
    Removed { page: i64, old: Vec<u8> },
}

impl BTree {
    pub(crate) fn from_parts(info: BTreeInfo, header: BTreeHeader) -> MaviResult<BTree> {
        let key_ser = serializer::by_id(info.key_serializer)?;
        let val_ser = serializer::by_id(info.value_serializer)?;
        Ok(BTree {
            info,
            header,
            key_ser,
            val_ser,
        })
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn fanout(&self) -> u32 {
        self.info.fanout
    }

    pub fn info(&self) -> &BTreeInfo {
        &self.info
    }

    /// Header as the given snapshot currently sees this tree.
    pub(crate) fn current_header(&self, txn: &dyn Snapshot) -> MaviResult<BTreeHeader> {
        Ok(txn.header_of(&self.info.name)?.unwrap_or_else(|| self.header.clone()))
    }

    pub fn element_count(&self, txn: &dyn Snapshot) -> MaviResult<u64> {
        Ok(self.current_header(txn)?.element_count)
    }

    /// Insert `key` → `value`. Returns the replaced value when the key
    /// was already present.
    pub fn insert(
        &self,
        txn: &mut WriteTransaction,
        key: &[u8],
        value: &[u8],
    ) -> MaviResult<Option<Vec<u8>>> {
        self.key_ser.validate(key)?;
        self.val_ser.validate(value)?;

        let header = self.current_header(txn)?;
        let outcome = self.insert_into(txn, header.root, key, value)?;

        let (new_root, delta, old) = match outcome {
            InsertOutcome::Replaced { page, old } => (page, 0, Some(old)),
            InsertOutcome::Added { page } => (page, 1, None),
            InsertOutcome::Split { left, right, pivot } => {
                let root = NodePage::new_root(txn.revision, pivot, left, right);
                (txn.stage(BTreePage::Node(root)), 1, None)
            }
        };

        self.stage_header(txn, header, new_root, delta);
        Ok(old)
    }

    /// Remove `key`, returning its value, or `None` when absent.
    pub fn delete(
        &self,
        txn: &mut WriteTransaction,
        key: &[u8],
    ) -> MaviResult<Option<Vec<u8>>> {
        self.key_ser.validate(key)?;

        let header = self.current_header(txn)?;
        match self.delete_from(txn, header.root, key)? {
            DeleteOutcome::NotPresent => Ok(None),
            DeleteOutcome::Removed { page, old } => {
                let mut new_root = page;
                // a root node that lost its last separator collapses
                // onto its single child, shrinking the tree
                let root_page = txn.page(new_root)?;
                if let BTreePage::Node(n) = &*root_page {
                    if n.count() == 0 {
                        let child = n.child_at(0);
                        txn.supersede(new_root);
                        new_root = child;
                    }
                }
                self.stage_header(txn, header, new_root, -1);
                Ok(Some(old))
            }
        }
    }

    /// Snapshot lookup. Never touches pages outside the transaction's
    /// view.
    pub fn get(&self, txn: &dyn Snapshot, key: &[u8]) -> MaviResult<Vec<u8>> {
        self.key_ser.validate(key)?;

        let header = self.current_header(txn)?;
        let mut page_ref = header.root;
        loop {
            let page = txn.page(page_ref)?;
            match &*page {
                BTreePage::Node(n) => {
                    page_ref = n.child_at(n.search_child(self.key_ser, key));
                }
                BTreePage::Leaf(l) => {
                    return l
                        .get(self.key_ser, key)
                        .map(|v| v.to_vec())
                        .ok_or(MaviError::NotFound);
                }
            }
        }
    }

    pub fn contains(&self, txn: &dyn Snapshot, key: &[u8]) -> MaviResult<bool> {
        match self.get(txn, key) {
            Ok(_) => Ok(true),
            Err(MaviError::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Cursor positioned before the smallest key.
    pub fn browse<'t>(&self, txn: &'t dyn Snapshot) -> MaviResult<Cursor<'t>> {
        let header = self.current_header(txn)?;
        Cursor::at_start(txn, self.key_ser, header.root)
    }

    /// Cursor positioned at the smallest key ≥ `key`.
    pub fn browse_from<'t>(
        &self,
        txn: &'t dyn Snapshot,
        key: &[u8],
    ) -> MaviResult<Cursor<'t>> {
        self.key_ser.validate(key)?;
        let header = self.current_header(txn)?;
        Cursor::at_key(txn, self.key_ser, header.root, key)
    }

    fn stage_header(
        &self,
        txn: &mut WriteTransaction,
        old: BTreeHeader,
        new_root: i64,
        delta: i64,
    ) {
        if old.page_id > 0 {
            txn.supersede(old.page_id);
        }
        let header = BTreeHeader {
            page_id: 0,
            revision: txn.revision,
            element_count: (old.element_count as i64 + delta) as u64,
            root: new_root,
            info: old.info,
        };
        txn.set_tree_header(&self.info.name, header);
    }

    fn insert_into(
        &self,
        txn: &mut WriteTransaction,
        page_ref: i64,
        key: &[u8],
        value: &[u8],
    ) -> MaviResult<InsertOutcome> {
        let page = txn.page(page_ref)?;
        let rev = txn.revision;

        match &*page {
            BTreePage::Leaf(leaf) => {
                match leaf.insert(self.key_ser, self.info.fanout, rev, key, value) {
                    LeafInsert::Replaced { page: copy, old } => {
                        txn.supersede(page_ref);
                        let id = txn.stage(BTreePage::Leaf(copy));
                        Ok(InsertOutcome::Replaced { page: id, old })
                    }
                    LeafInsert::Inserted { page: copy } => {
                        txn.supersede(page_ref);
                        let id = txn.stage(BTreePage::Leaf(copy));
                        Ok(InsertOutcome::Added { page: id })
                    }
                    LeafInsert::Split { left, right, pivot } => {
                        txn.supersede(page_ref);
                        let left = txn.stage(BTreePage::Leaf(left));
                        let right = txn.stage(BTreePage::Leaf(right));
                        Ok(InsertOutcome::Split { left, right, pivot })
                    }
                }
            }
            BTreePage::Node(node) => {
                let ci = node.search_child(self.key_ser, key);
                match self.insert_into(txn, node.child_at(ci), key, value)? {
                    InsertOutcome::Replaced { page: child, old } => {
                        txn.supersede(page_ref);
                        let id = txn.stage(BTreePage::Node(node.with_child(rev, ci, child)));
                        Ok(InsertOutcome::Replaced { page: id, old })
                    }
                    InsertOutcome::Added { page: child } => {
                        txn.supersede(page_ref);
                        let id = txn.stage(BTreePage::Node(node.with_child(rev, ci, child)));
                        Ok(InsertOutcome::Added { page: id })
                    }
                    InsertOutcome::Split { left, right, pivot } => {
                        txn.supersede(page_ref);
                        match node.apply_split(rev, self.info.fanout, ci, pivot, left, right) {
                            NodeInsert::Modified { page } => {
                                let id = txn.stage(BTreePage::Node(page));
                                Ok(InsertOutcome::Added { page: id })
                            }
                            NodeInsert::Split {
                                left,
                                right,
                                promoted,
                            } => {
                                let left = txn.stage(BTreePage::Node(left));
                                let right = txn.stage(BTreePage::Node(right));
                                Ok(InsertOutcome::Split {
                                    left,
                                    right,
                                    pivot: promoted,
                                })
                            }
                        }
                    }
                }
            }
        }
    }

    fn delete_from(
        &self,
        txn: &mut WriteTransaction,
        page_ref: i64,
        key: &[u8],
    ) -> MaviResult<DeleteOutcome> {
        let page = txn.page(page_ref)?;
        let rev = txn.revision;

        match &*page {
            BTreePage::Leaf(leaf) => match leaf.delete(self.key_ser, rev, key) {
                None => Ok(DeleteOutcome::NotPresent),
                Some((copy, old)) => {
                    txn.supersede(page_ref);
                    let id = txn.stage(BTreePage::Leaf(copy));
                    Ok(DeleteOutcome::Removed { page: id, old })
                }
            },
            BTreePage::Node(node) => {
                let ci = node.search_child(self.key_ser, key);
                match self.delete_from(txn, node.child_at(ci), key)? {
                    DeleteOutcome::NotPresent => Ok(DeleteOutcome::NotPresent),
                    DeleteOutcome::Removed { page: child, old } => {
                        let parent = self.fold_child(txn, node, ci, child)?;
                        txn.supersede(page_ref);
                        let id = txn.stage(BTreePage::Node(parent));
                        Ok(DeleteOutcome::Removed { page: id, old })
                    }
                }
            }
        }
    }

    /// Fold a freshly deleted-from child back into its parent,
    /// rebalancing when the child fell below minimum occupancy.
    fn fold_child(
        &self,
        txn: &mut WriteTransaction,
        node: &NodePage,
        ci: usize,
        new_child: i64,
    ) -> MaviResult<NodePage> {
        let rev = txn.revision;
        let min = min_occupancy(self.info.fanout);
        let child = txn.page(new_child)?;

        if child.count() >= min {
            return Ok(node.with_child(rev, ci, new_child));
        }

        let left = if ci > 0 {
            let r = node.child_at(ci - 1);
            Some((r, txn.page(r)?))
        } else {
            None
        };
        let right = if ci < node.count() {
            let r = node.child_at(ci + 1);
            Some((r, txn.page(r)?))
        } else {
            None
        };

        // prefer the larger sibling, the left one on ties
        let use_left = match (&left, &right) {
            (Some((_, l)), Some((_, r))) => l.count() >= r.count(),
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => return Ok(node.with_child(rev, ci, new_child)),
        };
        let (sib_ref, sib_page) = if use_left {
            left.unwrap()
        } else {
            right.unwrap()
        };

        if sib_page.count() > min {
            self.borrow_from(txn, node, ci, new_child, sib_ref, &sib_page, use_left)
        } else {
            self.merge_with(txn, node, ci, new_child, sib_ref, &sib_page, use_left)
        }
    }

    fn borrow_from(
        &self,
        txn: &mut WriteTransaction,
        node: &NodePage,
        ci: usize,
        child_ref: i64,
        sib_ref: i64,
        sib_page: &BTreePage,
        from_left: bool,
    ) -> MaviResult<NodePage> {
        let rev = txn.revision;
        let child = txn.page(child_ref)?;

        let (new_sib, new_child, separator) = match (&*child, sib_page) {
            (BTreePage::Leaf(child), BTreePage::Leaf(sib)) => {
                let mut sk = sib.keys().to_vec();
                let mut sv = sib.values().to_vec();
                let mut ck = child.keys().to_vec();
                let mut cv = child.values().to_vec();

                let separator;
                if from_left {
                    let k = sk.pop().unwrap();
                    let v = sv.pop().unwrap();
                    separator = k.clone();
                    ck.insert(0, k);
                    cv.insert(0, v);
                } else {
                    let k = sk.remove(0);
                    let v = sv.remove(0);
                    ck.push(k);
                    cv.push(v);
                    separator = sk[0].clone();
                }
                (
                    BTreePage::Leaf(LeafPage::from_parts(UNSET_ID, rev, sk, sv)),
                    BTreePage::Leaf(LeafPage::from_parts(UNSET_ID, rev, ck, cv)),
                    separator,
                )
            }
            (BTreePage::Node(child), BTreePage::Node(sib)) => {
                let mut sk = sib.keys().to_vec();
                let mut sc = sib.children().to_vec();
                let mut ck = child.keys().to_vec();
                let mut cc = child.children().to_vec();

                let separator;
                if from_left {
                    // rotate through the parent separator
                    let old_sep = node.key_at(ci - 1).to_vec();
                    separator = sk.pop().unwrap();
                    ck.insert(0, old_sep);
                    cc.insert(0, sc.pop().unwrap());
                } else {
                    let old_sep = node.key_at(ci).to_vec();
                    separator = sk.remove(0);
                    ck.push(old_sep);
                    cc.push(sc.remove(0));
                }
                (
                    BTreePage::Node(NodePage::from_parts(UNSET_ID, rev, sk, sc)),
                    BTreePage::Node(NodePage::from_parts(UNSET_ID, rev, ck, cc)),
                    separator,
                )
            }
            _ => {
                return Err(MaviError::corrupt(
                    node.id.max(0) as u64,
                    "sibling pages of different kinds",
                ))
            }
        };

        txn.supersede(sib_ref);
        txn.supersede(child_ref);
        let sid = txn.stage(new_sib);
        let cid = txn.stage(new_child);

        let parent = if from_left {
            node.with_key(rev, ci - 1, separator)
                .with_child(rev, ci - 1, sid)
                .with_child(rev, ci, cid)
        } else {
            node.with_key(rev, ci, separator)
                .with_child(rev, ci, cid)
                .with_child(rev, ci + 1, sid)
        };
        Ok(parent)
    }

    fn merge_with(
        &self,
        txn: &mut WriteTransaction,
        node: &NodePage,
        ci: usize,
        child_ref: i64,
        sib_ref: i64,
        sib_page: &BTreePage,
        with_left: bool,
    ) -> MaviResult<NodePage> {
        let rev = txn.revision;
        let child = txn.page(child_ref)?;

        let merged = match (&*child, sib_page) {
            (BTreePage::Leaf(child), BTreePage::Leaf(sib)) => {
                let (first, second) = if with_left { (sib, child) } else { (child, sib) };
                let mut keys = first.keys().to_vec();
                keys.extend_from_slice(second.keys());
                let mut values = first.values().to_vec();
                values.extend_from_slice(second.values());
                BTreePage::Leaf(LeafPage::from_parts(UNSET_ID, rev, keys, values))
            }
            (BTreePage::Node(child), BTreePage::Node(sib)) => {
                // the parent separator drops down between the halves
                let sep = if with_left {
                    node.key_at(ci - 1).to_vec()
                } else {
                    node.key_at(ci).to_vec()
                };
                let (first, second) = if with_left { (sib, child) } else { (child, sib) };
                let mut keys = first.keys().to_vec();
                keys.push(sep);
                keys.extend_from_slice(second.keys());
                let mut children = first.children().to_vec();
                children.extend_from_slice(second.children());
                BTreePage::Node(NodePage::from_parts(UNSET_ID, rev, keys, children))
            }
            _ => {
                return Err(MaviError::corrupt(
                    node.id.max(0) as u64,
                    "sibling pages of different kinds",
                ))
            }
        };

        txn.supersede(sib_ref);
        txn.supersede(child_ref);
        let mid = txn.stage(merged);

        let parent = if with_left {
            node.with_child(rev, ci - 1, mid).remove_entry(rev, ci - 1, ci)
        } else {
            node.with_child(rev, ci, mid).remove_entry(rev, ci, ci + 1)
        };
        debug!(
            "merged pages under `{}`, parent now holds {} keys",
            self.info.name,
            parent.count()
        );
        Ok(parent)
    }

    /// Verify the structural invariants of the whole tree: key order,
    /// occupancy bounds, branch coverage, uniform leaf depth, element
    /// count.
    pub fn check_integrity(&self, txn: &dyn Snapshot) -> MaviResult<()> {
        let header = self.current_header(txn)?;
        let mut leaf_depths = Vec::new();
        let total =
            self.check_page(txn, header.root, true, None, None, 0, &mut leaf_depths)?;

        if total != header.element_count {
            return Err(MaviError::corrupt(
                header.page_id.max(0) as u64,
                &format!(
                    "element count mismatch: header says {}, leaves hold {}",
                    header.element_count, total
                ),
            ));
        }
        if leaf_depths.windows(2).any(|w| w[0] != w[1]) {
            return Err(MaviError::corrupt(
                header.page_id.max(0) as u64,
                "leaves at different depths",
            ));
        }
        Ok(())
    }

    fn check_page(
        &self,
        txn: &dyn Snapshot,
        page_ref: i64,
        is_root: bool,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
        depth: usize,
        leaf_depths: &mut Vec<usize>,
    ) -> MaviResult<u64> {
        let page = txn.page(page_ref)?;
        let origin = page_ref.max(0) as u64;
        let n = page.count();
        let fanout = self.info.fanout as usize;

        if n > fanout {
            return Err(MaviError::corrupt(origin, "page above fanout"));
        }
        if !is_root && n < min_occupancy(self.info.fanout) {
            return Err(MaviError::corrupt(origin, "page below minimum occupancy"));
        }

        for i in 0..n {
            let k = page.key_at(i);
            if let Some(lo) = lower {
                if self.key_ser.compare(k, lo) == std::cmp::Ordering::Less {
                    return Err(MaviError::corrupt(origin, "key below subtree bound"));
                }
            }
            if let Some(hi) = upper {
                if self.key_ser.compare(k, hi) != std::cmp::Ordering::Less {
                    return Err(MaviError::corrupt(origin, "key above subtree bound"));
                }
            }
        }

        match &*page {
            BTreePage::Leaf(l) => {
                if !l.is_sorted(self.key_ser) {
                    return Err(MaviError::corrupt(origin, "leaf keys out of order"));
                }
                leaf_depths.push(depth);
                Ok(n as u64)
            }
            BTreePage::Node(node) => {
                if !node.is_sorted(self.key_ser) {
                    return Err(MaviError::corrupt(origin, "node keys out of order"));
                }
                if is_root && n == 0 {
                    return Err(MaviError::corrupt(origin, "empty root node"));
                }
                let mut total = 0;
                for i in 0..=n {
                    let lo = if i == 0 { lower } else { Some(node.key_at(i - 1)) };
                    let hi = if i == n { upper } else { Some(node.key_at(i)) };
                    total += self.check_page(
                        txn,
                        node.child_at(i),
                        false,
                        lo,
                        hi,
                        depth + 1,
                        leaf_depths,
                    )?;
                }
                Ok(total)
            }
        }
    }

    /// Render the tree shape for debugging, one page per line.
    pub fn draw_tree(&self, txn: &dyn Snapshot) -> MaviResult<String> {
        let header = self.current_header(txn)?;
        let mut out = format!(
            "tree `{}` rev {} count {}\n",
            self.info.name, header.revision, header.element_count
        );
        self.draw_page(txn, header.root, 0, &mut out)?;
        Ok(out)
    }

    fn draw_page(
        &self,
        txn: &dyn Snapshot,
        page_ref: i64,
        depth: usize,
        out: &mut String,
    ) -> MaviResult<()> {
        let page = txn.page(page_ref)?;
        let indent = "  ".repeat(depth);
        match &*page {
            BTreePage::Leaf(l) => {
                out.push_str(&format!(
                    "{}leaf[{}] n={} keys={:?}\n",
                    indent,
                    page_ref,
                    l.count(),
                    l.keys().iter().map(|k| preview(k)).collect::<Vec<_>>()
                ));
            }
            BTreePage::Node(node) => {
                out.push_str(&format!(
                    "{}node[{}] n={} keys={:?}\n",
                    indent,
                    page_ref,
                    node.count(),
                    node.keys().iter().map(|k| preview(k)).collect::<Vec<_>>()
                ));
                for i in 0..=node.count() {
                    self.draw_page(txn, node.child_at(i), depth + 1, out)?;
                }
            }
        }
        Ok(())
    }
}

fn preview(key: &[u8]) -> String {
    if key.len() == 8 {
        // most test trees use long keys
        let mut a = [0u8; 8];
        a.copy_from_slice(key);
        format!("{}", u64::from_be_bytes(a))
    } else {
        format!("{:02x?}", &key[..key.len().min(8)])
    }
}
