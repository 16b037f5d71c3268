use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    sync::{Arc, MutexGuard},
};

use log::debug;

use crate::{
    btree::{
        page::{BTreeHeader, BTreeInfo, BTreePage},
        serializer,
        tree::BTree,
    },
    error::MaviError,
    record_manager::{RecordManager, WriterState},
    types::MaviResult,
};

/// Reserved name of the tree-of-trees.
pub const BOB_TREE: &str = "#bob";
/// Reserved name of the copied-pages tree.
pub const CPB_TREE: &str = "#cpb";

/// A revision-pinned view of the store. Both transaction kinds
/// implement it; tree reads and cursors are written against it.
pub trait Snapshot {
    fn revision(&self) -> u64;

    /// Resolve a page reference: a file offset, or for write
    /// transactions a pending id living in the WAL map.
    fn page(&self, page_ref: i64) -> MaviResult<Arc<BTreePage>>;

    /// Current header of the named tree in this snapshot.
    fn header_of(&self, name: &str) -> MaviResult<Option<BTreeHeader>>;
}

/// Scratchpad of the single writer.
///
/// Everything a write touches lives here until commit: pages created by
/// the copy-on-write paths (keyed by negative pending ids), the offsets
/// of the pages those copies supersede, staged per-tree headers and
/// infos, and the tentative end-of-file. Dropping the transaction
/// without committing discards all of it; nothing on disk changed.
pub struct WriteTransaction<'db> {
    pub(crate) rm: &'db RecordManager,
    pub(crate) state: MutexGuard<'db, WriterState>,

    pub(crate) revision: u64,
    pub(crate) wal: HashMap<i64, Arc<BTreePage>>,
    pub(crate) copied: BTreeSet<u64>,
    /// Superseded pages of the meta-trees; never recorded in the
    /// copied-pages tree (that would recurse), freed by later commits.
    pub(crate) meta_copied: Vec<u64>,
    pub(crate) tree_headers: HashMap<String, BTreeHeader>,
    pub(crate) new_infos: HashMap<i64, BTreeInfo>,
    pub(crate) next_id: i64,
    pub(crate) tentative_eof: u64,
    pub(crate) meta_mode: bool,
    pub(crate) mutated: bool,
    committed: bool,
}

impl<'db> WriteTransaction<'db> {
    pub(crate) fn new(
        rm: &'db RecordManager,
        state: MutexGuard<'db, WriterState>,
        bob_header: BTreeHeader,
        cpb_header: BTreeHeader,
    ) -> Self {
        let revision = state.header.revision + 1;
        let tentative_eof = state.header.eof;

        let mut tree_headers = HashMap::new();
        tree_headers.insert(BOB_TREE.to_string(), bob_header);
        tree_headers.insert(CPB_TREE.to_string(), cpb_header);

        Self {
            rm,
            state,
            revision,
            wal: HashMap::new(),
            copied: BTreeSet::new(),
            meta_copied: Vec::new(),
            tree_headers,
            new_infos: HashMap::new(),
            next_id: -1,
            tentative_eof,
            meta_mode: false,
            mutated: false,
            committed: false,
        }
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub(crate) fn alloc_page_id(&mut self) -> i64 {
        let id = self.next_id;
        self.next_id -= 1;
        id
    }

    /// Put a freshly copied page into the WAL map under a new pending
    /// id and return that id.
    pub(crate) fn stage(&mut self, mut page: BTreePage) -> i64 {
        let id = self.alloc_page_id();
        page.set_id(id);
        self.wal.insert(id, Arc::new(page));
        self.mutated = true;
        id
    }

    /// Retire the page a copy replaces. Pending pages simply leave the
    /// WAL map; persisted pages are queued for reclamation, except
    /// meta-tree pages which must not record themselves.
    pub(crate) fn supersede(&mut self, page_ref: i64) {
        if page_ref < 0 {
            self.wal.remove(&page_ref);
        } else if self.meta_mode {
            self.meta_copied.push(page_ref as u64);
        } else {
            self.copied.insert(page_ref as u64);
        }
    }

    pub(crate) fn tree_header(&self, name: &str) -> Option<BTreeHeader> {
        self.tree_headers.get(name).cloned()
    }

    pub(crate) fn set_tree_header(&mut self, name: &str, header: BTreeHeader) {
        self.tree_headers.insert(name.to_string(), header);
        self.mutated = true;
    }

    pub(crate) fn stage_info(&mut self, info: BTreeInfo) -> i64 {
        let id = self.alloc_page_id();
        self.new_infos.insert(id, info);
        id
    }

    /// Reserve a chain of physical pages above the tentative eof. Used
    /// by the bulk loader, which persists pages before commit; a
    /// rollback leaves them as dead tail bytes for recovery to trim.
    pub(crate) fn alloc_eof_chain(&mut self, payload_len: usize) -> Vec<u64> {
        let page_io = self.rm.page_io();
        let n = page_io.chain_len(payload_len);
        let mut offsets = Vec::with_capacity(n);
        for _ in 0..n {
            offsets.push(self.tentative_eof);
            self.tentative_eof += page_io.page_size() as u64;
        }
        // an earlier aborted transaction may have cached pages it wrote
        // at these offsets
        for &offset in &offsets {
            self.rm.invalidate_cached(offset);
        }
        offsets
    }

    /// Create a new named tree in this transaction.
    pub fn create_tree(
        &mut self,
        name: &str,
        key_serializer: u32,
        value_serializer: u32,
        fanout: u32,
    ) -> MaviResult<BTree> {
        if name.is_empty() || name.starts_with('#') {
            return Err(MaviError::invalid("tree names must not be empty or start with '#'"));
        }
        if fanout < 4 {
            return Err(MaviError::invalid("fanout must be at least 4"));
        }
        if self.header_of(name)?.is_some() {
            return Err(MaviError::AlreadyExists(name.to_string()));
        }
        // make sure the ids resolve
        serializer::by_id(key_serializer)?;
        serializer::by_id(value_serializer)?;

        let info = BTreeInfo {
            fanout: (fanout as usize).next_power_of_two() as u32,
            name: name.to_string(),
            key_serializer,
            value_serializer,
        };
        let info_ref = self.stage_info(info.clone());

        let root = self.stage(BTreePage::Leaf(
            crate::btree::page::LeafPage::empty(self.revision),
        ));
        let header = BTreeHeader {
            page_id: 0,
            revision: self.revision,
            element_count: 0,
            root,
            info: info_ref,
        };
        self.set_tree_header(name, header.clone());

        debug!("created tree `{}` at revision {}", name, self.revision);
        BTree::from_parts(info, header)
    }

    /// Open a named tree as this transaction sees it.
    pub fn open_tree(&self, name: &str) -> MaviResult<BTree> {
        let header = self
            .header_of(name)?
            .ok_or(MaviError::NotFound)?;
        let info = self.resolve_info(header.info)?;
        BTree::from_parts(info, header)
    }

    pub(crate) fn resolve_info(&self, info_ref: i64) -> MaviResult<BTreeInfo> {
        if info_ref < 0 {
            self.new_infos
                .get(&info_ref)
                .cloned()
                .ok_or_else(|| MaviError::corrupt(0, "dangling pending info reference"))
        } else {
            self.rm.read_info(info_ref as u64)
        }
    }

    /// Make every change durable and visible. The new revision exists
    /// for other transactions once this returns.
    pub fn commit(mut self) -> MaviResult<()> {
        let rm = self.rm;
        rm.commit_write(&mut self)?;
        self.committed = true;
        Ok(())
    }

    /// Discard the transaction. Equivalent to dropping it.
    pub fn abort(self) -> MaviResult<()> {
        Ok(())
    }
}

impl<'db> Snapshot for WriteTransaction<'db> {
    fn revision(&self) -> u64 {
        self.revision
    }

    fn page(&self, page_ref: i64) -> MaviResult<Arc<BTreePage>> {
        if page_ref < 0 {
            self.wal.get(&page_ref).cloned().ok_or_else(|| {
                MaviError::corrupt(0, &format!("dangling pending page id {}", page_ref))
            })
        } else {
            self.rm.read_page(page_ref as u64)
        }
    }

    fn header_of(&self, name: &str) -> MaviResult<Option<BTreeHeader>> {
        if let Some(h) = self.tree_headers.get(name) {
            return Ok(Some(h.clone()));
        }
        self.rm
            .find_header(self.state.header.bob_header, name, self.revision)
    }
}

impl<'db> Drop for WriteTransaction<'db> {
    fn drop(&mut self) {
        if !self.committed && self.mutated {
            debug!(
                "write transaction at revision {} rolled back, {} pending pages discarded",
                self.revision,
                self.wal.len()
            );
        }
    }
}

impl<'db> fmt::Display for WriteTransaction<'db> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "wtx_{}", self.revision)
    }
}

/// A snapshot reader. Pins its revision in the reader table so
/// reclamation cannot free pages the snapshot can still reach; the pin
/// is dropped with the transaction.
pub struct ReadTransaction {
    pub(crate) rm: Arc<RecordManager>,
    pub(crate) revision: u64,
    pub(crate) bob_header: u64,
    released: bool,
}

impl ReadTransaction {
    pub(crate) fn new(rm: Arc<RecordManager>, revision: u64, bob_header: u64) -> Self {
        Self {
            rm,
            revision,
            bob_header,
            released: false,
        }
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Open a named tree at this snapshot's revision.
    pub fn open_tree(&self, name: &str) -> MaviResult<BTree> {
        self.open_tree_at(name, self.revision)
    }

    /// Open a named tree as of an earlier revision, if that revision's
    /// header is still reachable through the tree-of-trees.
    pub fn open_tree_at(&self, name: &str, revision: u64) -> MaviResult<BTree> {
        if revision > self.revision {
            return Err(MaviError::invalid(
                "cannot read above the snapshot revision",
            ));
        }
        let header = self
            .rm
            .find_header(self.bob_header, name, revision)?
            .ok_or(MaviError::NotFound)?;
        let info = self.rm.read_info(header.info as u64)?;
        BTree::from_parts(info, header)
    }

    /// Release the revision pin early.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.rm.release_reader(self.revision);
        }
    }
}

impl Snapshot for ReadTransaction {
    fn revision(&self) -> u64 {
        self.revision
    }

    fn page(&self, page_ref: i64) -> MaviResult<Arc<BTreePage>> {
        if page_ref < 0 {
            return Err(MaviError::corrupt(
                0,
                "read snapshot cannot resolve a pending page id",
            ));
        }
        self.rm.read_page(page_ref as u64)
    }

    fn header_of(&self, name: &str) -> MaviResult<Option<BTreeHeader>> {
        self.rm.find_header(self.bob_header, name, self.revision)
    }
}

impl Drop for ReadTransaction {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Display for ReadTransaction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "rtx_{}", self.revision)
    }
}
