use std::sync::Arc;

use crate::{
    btree::{page::BTreePage, serializer::Serializer},
    error::MaviError,
    transaction::Snapshot,
    types::MaviResult,
};

/// Bidirectional cursor over one tree in one snapshot.
///
/// The cursor keeps a parent-pos stack: one `(page, index)` frame per
/// level. The bottom frame is a leaf whose index marks a gap between
/// elements; `next` yields the element at the gap moving right, `prev`
/// the element before it moving left, so the two can be mixed freely.
/// Every page it holds belongs to the pinned revision, concurrent
/// commits never move it.
pub struct Cursor<'t> {
    snapshot: &'t dyn Snapshot,
    cmp: &'static dyn Serializer,
    root: i64,
    stack: Vec<(Arc<BTreePage>, usize)>,
}

impl<'t> Cursor<'t> {
    pub(crate) fn at_start(
        snapshot: &'t dyn Snapshot,
        cmp: &'static dyn Serializer,
        root: i64,
    ) -> MaviResult<Self> {
        let mut cursor = Self {
            snapshot,
            cmp,
            root,
            stack: Vec::new(),
        };
        cursor.before_first()?;
        Ok(cursor)
    }

    pub(crate) fn at_key(
        snapshot: &'t dyn Snapshot,
        cmp: &'static dyn Serializer,
        root: i64,
        key: &[u8],
    ) -> MaviResult<Self> {
        let mut cursor = Self {
            snapshot,
            cmp,
            root,
            stack: Vec::new(),
        };
        cursor.seek(key)?;
        Ok(cursor)
    }

    /// Position before the smallest key.
    pub fn before_first(&mut self) -> MaviResult<()> {
        self.stack.clear();
        self.descend_min(self.root)
    }

    /// Position after the largest key.
    pub fn after_last(&mut self) -> MaviResult<()> {
        self.stack.clear();
        self.descend_max(self.root)
    }

    /// Position at the gap before the smallest key ≥ `key`.
    pub fn seek(&mut self, key: &[u8]) -> MaviResult<()> {
        self.stack.clear();
        let mut page_ref = self.root;
        loop {
            let page = self.snapshot.page(page_ref)?;
            match &*page {
                BTreePage::Node(n) => {
                    let ci = n.search_child(self.cmp, key);
                    let child = n.child_at(ci);
                    self.stack.push((page.clone(), ci));
                    page_ref = child;
                }
                BTreePage::Leaf(l) => {
                    let pos = match l.search(self.cmp, key) {
                        Ok(i) => i,
                        Err(i) => i,
                    };
                    self.stack.push((page.clone(), pos));
                    return Ok(());
                }
            }
        }
    }

    /// Advance and return the next entry in key order.
    pub fn next(&mut self) -> MaviResult<Option<(Vec<u8>, Vec<u8>)>> {
        loop {
            let (page, pos) = match self.stack.last() {
                None => return Ok(None),
                Some((p, i)) => (p.clone(), *i),
            };

            match &*page {
                BTreePage::Leaf(l) => {
                    if pos < l.count() {
                        self.stack.last_mut().unwrap().1 = pos + 1;
                        return Ok(Some((
                            l.key_at(pos).to_vec(),
                            l.value_at(pos).to_vec(),
                        )));
                    }
                    // leaf exhausted: climb until a right sibling exists
                    self.stack.pop();
                    while let Some((p, i)) = self.stack.last().map(|(p, i)| (p.clone(), *i)) {
                        match &*p {
                            BTreePage::Node(n) if i < n.count() => {
                                self.stack.last_mut().unwrap().1 = i + 1;
                                let child = n.child_at(i + 1);
                                self.descend_min(child)?;
                                break;
                            }
                            _ => {
                                self.stack.pop();
                            }
                        }
                    }
                    if self.stack.is_empty() {
                        return Ok(None);
                    }
                }
                BTreePage::Node(_) => {
                    return Err(MaviError::corrupt(0, "cursor stack top is not a leaf"));
                }
            }
        }
    }

    /// Step back and return the previous entry in key order.
    pub fn prev(&mut self) -> MaviResult<Option<(Vec<u8>, Vec<u8>)>> {
        loop {
            let (page, pos) = match self.stack.last() {
                None => return Ok(None),
                Some((p, i)) => (p.clone(), *i),
            };

            match &*page {
                BTreePage::Leaf(l) => {
                    if pos > 0 {
                        self.stack.last_mut().unwrap().1 = pos - 1;
                        return Ok(Some((
                            l.key_at(pos - 1).to_vec(),
                            l.value_at(pos - 1).to_vec(),
                        )));
                    }
                    self.stack.pop();
                    while let Some((p, i)) = self.stack.last().map(|(p, i)| (p.clone(), *i)) {
                        match &*p {
                            BTreePage::Node(n) if i > 0 => {
                                self.stack.last_mut().unwrap().1 = i - 1;
                                let child = n.child_at(i - 1);
                                self.descend_max(child)?;
                                break;
                            }
                            _ => {
                                self.stack.pop();
                            }
                        }
                    }
                    if self.stack.is_empty() {
                        return Ok(None);
                    }
                }
                BTreePage::Node(_) => {
                    return Err(MaviError::corrupt(0, "cursor stack top is not a leaf"));
                }
            }
        }
    }

    fn descend_min(&mut self, mut page_ref: i64) -> MaviResult<()> {
        loop {
            let page = self.snapshot.page(page_ref)?;
            match &*page {
                BTreePage::Node(n) => {
                    let child = n.child_at(0);
                    self.stack.push((page.clone(), 0));
                    page_ref = child;
                }
                BTreePage::Leaf(_) => {
                    self.stack.push((page, 0));
                    return Ok(());
                }
            }
        }
    }

    fn descend_max(&mut self, mut page_ref: i64) -> MaviResult<()> {
        loop {
            let page = self.snapshot.page(page_ref)?;
            match &*page {
                BTreePage::Node(n) => {
                    let i = n.count();
                    let child = n.child_at(i);
                    self.stack.push((page.clone(), i));
                    page_ref = child;
                }
                BTreePage::Leaf(l) => {
                    let i = l.count();
                    self.stack.push((page, i));
                    return Ok(());
                }
            }
        }
    }
}
