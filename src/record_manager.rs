use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    path::Path,
    sync::{Arc, Mutex, RwLock},
};

use log::{debug, info, warn};

use crate::{
    btree::{
        page::{BTreeHeader, BTreeInfo, BTreePage, LeafPage, HEADER_SERIALIZED_SIZE},
        serializer::{
            self, BobKeySerializer, LongSerializer, OffsetListSerializer, Serializer,
            BOB_KEY_SERIALIZER, LONG_SERIALIZER, OFFSET_LIST_SERIALIZER,
        },
        tree::BTree,
    },
    error::MaviError,
    io::{MaviFile, MaviReader, MaviWriter},
    storage::{PageCache, PageIo, NO_PAGE},
    transaction::{ReadTransaction, Snapshot, WriteTransaction, BOB_TREE, CPB_TREE},
    types::MaviResult,
    utils::HandyRwLock,
};

const MAGIC: u32 = 0x4D41_5649; // "MAVI"
const FORMAT_VERSION: u32 = 1;
/// Serialized file-header size: magic, version, page size, generation,
/// revision, two meta-tree header offsets, free head, eof, crc.
pub const FILE_HEADER_SIZE: usize = 4 + 4 + 4 + 8 * 6 + 4;

/// Fanout of the two meta-trees.
const META_FANOUT: u32 = 16;

/// File-wide metadata. Two copies live at offsets 0 and `page_size`;
/// the one with the higher generation and a valid checksum is
/// authoritative. Writing the inactive slot and syncing is the commit
/// point.
#[derive(Debug, Clone)]
pub struct FileHeader {
    pub page_size: u32,
    pub generation: u64,
    pub revision: u64,
    pub bob_header: u64,
    pub cpb_header: u64,
    pub first_free: u64,
    pub eof: u64,
}

impl FileHeader {
    pub fn serialize(&self) -> Vec<u8> {
        let mut w = MaviWriter::with_capacity(FILE_HEADER_SIZE);
        w.write_u32(MAGIC);
        w.write_u32(FORMAT_VERSION);
        w.write_u32(self.page_size);
        w.write_u64(self.generation);
        w.write_u64(self.revision);
        w.write_u64(self.bob_header);
        w.write_u64(self.cpb_header);
        w.write_u64(self.first_free);
        w.write_u64(self.eof);
        let mut bytes = w.into_bytes();
        let crc = crc32c::crc32c(&bytes);
        bytes.extend_from_slice(&crc.to_be_bytes());
        bytes
    }

    pub fn deserialize(bytes: &[u8], slot_offset: u64) -> MaviResult<FileHeader> {
        if bytes.len() < FILE_HEADER_SIZE {
            return Err(MaviError::corrupt(slot_offset, "short file header"));
        }
        let body = &bytes[..FILE_HEADER_SIZE - 4];
        let mut r = MaviReader::new(bytes, slot_offset);

        let magic = r.read_u32()?;
        if magic != MAGIC {
            return Err(MaviError::corrupt(slot_offset, "bad magic"));
        }
        let version = r.read_u32()?;
        if version != FORMAT_VERSION {
            return Err(MaviError::corrupt(
                slot_offset,
                &format!("unsupported format version {}", version),
            ));
        }
        let page_size = r.read_u32()?;
        let generation = r.read_u64()?;
        let revision = r.read_u64()?;
        let bob_header = r.read_u64()?;
        let cpb_header = r.read_u64()?;
        let first_free = r.read_u64()?;
        let eof = r.read_u64()?;
        let crc = r.read_u32()?;

        if crc != crc32c::crc32c(body) {
            return Err(MaviError::corrupt(slot_offset, "header checksum mismatch"));
        }

        Ok(FileHeader {
            page_size,
            generation,
            revision,
            bob_header,
            cpb_header,
            first_free,
            eof,
        })
    }
}

/// State owned by whoever holds the writer lock: the writer's view of
/// the authoritative header and the in-memory mirror of the free list.
pub struct WriterState {
    pub header: FileHeader,
    pub free_list: VecDeque<u64>,
}

/// Owner of the backing file. Orchestrates transactions: assigns
/// revisions, serializes and writes pending pages, swaps the visible
/// header, maintains the tree-of-trees and the copied-pages tree, and
/// reclaims pages once no reader can reach them.
pub struct RecordManager {
    page_io: PageIo,
    page_size: usize,
    cache: PageCache,
    writer: Mutex<WriterState>,
    current: RwLock<FileHeader>,
    /// revision → number of read transactions pinned to it
    readers: Mutex<BTreeMap<u64, usize>>,
    /// Superseded meta-tree pages: (revision they died at, offset).
    /// Kept out of the copied-pages tree to avoid self-recursion.
    deferred_meta: Mutex<Vec<(u64, u64)>>,
}

impl RecordManager {
    pub fn open<P: AsRef<Path>>(
        path: P,
        page_size: usize,
        cache_capacity: usize,
    ) -> MaviResult<RecordManager> {
        if !page_size.is_power_of_two() || page_size < 512 || page_size > 65_536 {
            return Err(MaviError::invalid(
                "page size must be a power of two in 512..=65536",
            ));
        }

        let file = MaviFile::open(path)?;
        if file.len()? == 0 {
            Self::bootstrap(file, page_size, cache_capacity)
        } else {
            Self::recover(file, page_size, cache_capacity)
        }
    }

    /// Lay out a fresh store: empty tree-of-trees and copied-pages
    /// trees, then both header slots.
    fn bootstrap(
        file: MaviFile,
        page_size: usize,
        cache_capacity: usize,
    ) -> MaviResult<RecordManager> {
        let page_io = PageIo::new(file, page_size);
        let ps = page_size as u64;
        let resolve = |r: i64| -> MaviResult<u64> { Ok(r as u64) };

        let mut next = 2 * ps;
        let mut alloc = || {
            let o = next;
            next += ps;
            o
        };

        let mut meta_header = |name: &str, key_ser: u32, val_ser: u32| -> MaviResult<u64> {
            let info_off = alloc();
            let root_off = alloc();
            let header_off = alloc();

            let info = BTreeInfo {
                fanout: META_FANOUT,
                name: name.to_string(),
                key_serializer: key_ser,
                value_serializer: val_ser,
            };
            page_io.write_chain(&[info_off], &info.serialize())?;

            let root = BTreePage::Leaf(LeafPage::empty(0));
            page_io.write_chain(&[root_off], &root.serialize(root_off, &resolve)?)?;

            let header = BTreeHeader {
                page_id: header_off as i64,
                revision: 0,
                element_count: 0,
                root: root_off as i64,
                info: info_off as i64,
            };
            page_io.write_chain(&[header_off], &header.serialize(header_off, &resolve)?)?;
            Ok(header_off)
        };

        let bob_header = meta_header(BOB_TREE, BOB_KEY_SERIALIZER, LONG_SERIALIZER)?;
        let cpb_header = meta_header(CPB_TREE, LONG_SERIALIZER, OFFSET_LIST_SERIALIZER)?;
        page_io.file().sync()?;

        let mut header = FileHeader {
            page_size: page_size as u32,
            generation: 0,
            revision: 0,
            bob_header,
            cpb_header,
            first_free: NO_PAGE,
            eof: next,
        };
        // backup copy in slot 0, authoritative generation 1 in slot 1
        page_io.file().write_all_at(&header.serialize(), 0)?;
        header.generation = 1;
        page_io.file().write_all_at(&header.serialize(), ps)?;
        page_io.file().sync()?;

        info!("initialized new store, page size {}", page_size);
        Ok(Self::build(page_io, header, VecDeque::new(), cache_capacity))
    }

    /// Open an existing store: pick the valid header slot with the
    /// larger generation, drop anything written past its eof, and walk
    /// the free chain defensively.
    fn recover(
        file: MaviFile,
        config_page_size: usize,
        cache_capacity: usize,
    ) -> MaviResult<RecordManager> {
        let len = file.len()?;

        let read_slot = |offset: u64| -> Option<FileHeader> {
            if offset + FILE_HEADER_SIZE as u64 > len {
                return None;
            }
            let mut buf = vec![0u8; FILE_HEADER_SIZE];
            if file.read_exact_at(&mut buf, offset).is_err() {
                return None;
            }
            FileHeader::deserialize(&buf, offset).ok()
        };

        let slot0 = read_slot(0);
        // slot 1 sits at one page size; trust slot 0 for its position,
        // fall back to the configured size when slot 0 is torn
        let ps_guess = slot0
            .as_ref()
            .map(|h| h.page_size as u64)
            .unwrap_or(config_page_size as u64);
        let slot1 = read_slot(ps_guess);

        let header = match (slot0, slot1) {
            (Some(a), Some(b)) => {
                if a.generation >= b.generation {
                    a
                } else {
                    b
                }
            }
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => {
                return Err(MaviError::corrupt(0, "both header slots unreadable"))
            }
        };

        let page_size = header.page_size as usize;
        if page_size != config_page_size {
            debug!(
                "file page size {} overrides configured {}",
                page_size, config_page_size
            );
        }

        if len < header.eof {
            return Err(MaviError::corrupt(
                0,
                &format!("file truncated below eof: {} < {}", len, header.eof),
            ));
        }
        if len > header.eof {
            info!(
                "recovery: dropping {} tail bytes from an unfinished transaction",
                len - header.eof
            );
            file.set_len(header.eof)?;
        }

        let page_io = PageIo::new(file, page_size);
        let free_list = if header.first_free == NO_PAGE {
            VecDeque::new()
        } else {
            page_io
                .walk_free_chain(header.first_free, header.eof)?
                .into()
        };

        info!(
            "opened store at revision {}, generation {}",
            header.revision, header.generation
        );
        Ok(Self::build(page_io, header, free_list, cache_capacity))
    }

    fn build(
        page_io: PageIo,
        header: FileHeader,
        free_list: VecDeque<u64>,
        cache_capacity: usize,
    ) -> RecordManager {
        let page_size = header.page_size as usize;
        RecordManager {
            page_io,
            page_size,
            cache: PageCache::new(cache_capacity),
            writer: Mutex::new(WriterState {
                header: header.clone(),
                free_list,
            }),
            current: RwLock::new(header),
            readers: Mutex::new(BTreeMap::new()),
            deferred_meta: Mutex::new(Vec::new()),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub(crate) fn page_io(&self) -> &PageIo {
        &self.page_io
    }

    pub(crate) fn invalidate_cached(&self, offset: u64) {
        self.cache.invalidate(offset);
    }

    /// Current committed revision.
    pub fn revision(&self) -> u64 {
        self.current.rl().revision
    }

    /// Deserialize the logical page at `offset`, through the cache.
    pub fn read_page(&self, offset: u64) -> MaviResult<Arc<BTreePage>> {
        if let Some(page) = self.cache.get(offset) {
            return Ok(page);
        }
        let eof = self.page_io.file().len()?;
        let bytes = self.page_io.read_chain(offset, eof)?;
        let page = Arc::new(BTreePage::deserialize(&bytes, offset)?);
        self.cache.put(offset, Arc::clone(&page));
        Ok(page)
    }

    pub fn read_header_page(&self, offset: u64) -> MaviResult<BTreeHeader> {
        let eof = self.page_io.file().len()?;
        let bytes = self.page_io.read_chain(offset, eof)?;
        let header = BTreeHeader::deserialize(&bytes, offset)?;
        if header.page_id != offset as i64 {
            return Err(MaviError::corrupt(offset, "tree header id mismatch"));
        }
        Ok(header)
    }

    pub fn read_info(&self, offset: u64) -> MaviResult<BTreeInfo> {
        let eof = self.page_io.file().len()?;
        let bytes = self.page_io.read_chain(offset, eof)?;
        BTreeInfo::deserialize(&bytes, offset)
    }

    /// Resolve the header of `name` at the largest revision ≤
    /// `revision` through the tree-of-trees rooted at `bob_header`.
    pub fn find_header(
        &self,
        bob_header: u64,
        name: &str,
        revision: u64,
    ) -> MaviResult<Option<BTreeHeader>> {
        let bob = self.read_header_page(bob_header)?;
        let cmp = serializer::by_id(BOB_KEY_SERIALIZER)?;
        let key = BobKeySerializer::encode(name, revision);

        match self.find_le(bob.root, cmp, &key)? {
            Some((found_key, value)) => {
                let (found_name, _) = BobKeySerializer::decode(&found_key)?;
                if found_name != name {
                    return Ok(None);
                }
                let header_offset = LongSerializer::decode(&value)?;
                Ok(Some(self.read_header_page(header_offset)?))
            }
            None => Ok(None),
        }
    }

    /// Largest entry ≤ `key` in the committed tree rooted at
    /// `page_ref`.
    fn find_le(
        &self,
        page_ref: i64,
        cmp: &dyn Serializer,
        key: &[u8],
    ) -> MaviResult<Option<(Vec<u8>, Vec<u8>)>> {
        let page = self.read_page(page_ref as u64)?;
        match &*page {
            BTreePage::Leaf(l) => Ok(match l.search(cmp, key) {
                Ok(i) => Some((l.key_at(i).to_vec(), l.value_at(i).to_vec())),
                Err(0) => None,
                Err(i) => Some((l.key_at(i - 1).to_vec(), l.value_at(i - 1).to_vec())),
            }),
            BTreePage::Node(n) => {
                let ci = n.search_child(cmp, key);
                if let Some(entry) = self.find_le(n.child_at(ci), cmp, key)? {
                    Ok(Some(entry))
                } else if ci > 0 {
                    self.rightmost(n.child_at(ci - 1))
                } else {
                    Ok(None)
                }
            }
        }
    }

    fn rightmost(&self, mut page_ref: i64) -> MaviResult<Option<(Vec<u8>, Vec<u8>)>> {
        loop {
            let page = self.read_page(page_ref as u64)?;
            match &*page {
                BTreePage::Node(n) => page_ref = n.child_at(n.count()),
                BTreePage::Leaf(l) => {
                    return Ok(if l.count() == 0 {
                        None
                    } else {
                        let i = l.count() - 1;
                        Some((l.key_at(i).to_vec(), l.value_at(i).to_vec()))
                    });
                }
            }
        }
    }

    /// Pin the current revision and hand out a snapshot.
    pub fn begin_read(self: &Arc<Self>) -> ReadTransaction {
        let mut readers = self.readers.lock().unwrap();
        let current = self.current.rl();
        *readers.entry(current.revision).or_insert(0) += 1;
        ReadTransaction::new(Arc::clone(self), current.revision, current.bob_header)
    }

    pub(crate) fn release_reader(&self, revision: u64) {
        let mut readers = self.readers.lock().unwrap();
        if let Some(count) = readers.get_mut(&revision) {
            *count -= 1;
            if *count == 0 {
                readers.remove(&revision);
            }
        }
    }

    /// Number of currently pinned read transactions.
    pub fn reader_count(&self) -> usize {
        self.readers.lock().unwrap().values().sum()
    }

    /// Acquire the writer lock, blocking until it is free.
    pub fn begin_write(&self) -> MaviResult<WriteTransaction<'_>> {
        let state = self.writer.lock().unwrap();
        let bob = self.read_header_page(state.header.bob_header)?;
        let cpb = self.read_header_page(state.header.cpb_header)?;
        Ok(WriteTransaction::new(self, state, bob, cpb))
    }

    /// Acquire the writer lock without blocking; `None` when another
    /// write transaction is running.
    pub fn try_begin_write(&self) -> MaviResult<Option<WriteTransaction<'_>>> {
        match self.writer.try_lock() {
            Ok(state) => {
                let bob = self.read_header_page(state.header.bob_header)?;
                let cpb = self.read_header_page(state.header.cpb_header)?;
                Ok(Some(WriteTransaction::new(self, state, bob, cpb)))
            }
            Err(std::sync::TryLockError::WouldBlock) => Ok(None),
            Err(std::sync::TryLockError::Poisoned(_)) => {
                Err(MaviError::TransactionAborted)
            }
        }
    }

    /// Commit protocol. Everything before the header-slot write is
    /// invisible; a failure anywhere leaves the writer state untouched
    /// and the store semantically unchanged.
    pub(crate) fn commit_write(&self, txn: &mut WriteTransaction) -> MaviResult<()> {
        if !txn.mutated {
            debug!("transaction {} touched nothing, commit is a no-op", txn);
            return Ok(());
        }

        let revision = txn.revision;

        // opportunistic reclamation: pages superseded at revisions no
        // pinned reader can reach go back to the free list now
        let bar = {
            let readers = self.readers.lock().unwrap();
            readers.keys().next().copied().unwrap_or(u64::MAX)
        };
        let mut reclaimed: Vec<u64> = Vec::new();
        self.reclaim(txn, bar, &mut reclaimed)?;

        let (meta_eligible, meta_kept): (Vec<(u64, u64)>, Vec<(u64, u64)>) = {
            let dm = self.deferred_meta.lock().unwrap();
            dm.iter().copied().partition(|(rev, _)| *rev <= bar)
        };

        // transaction-local allocator: reclaimed pages first, then the
        // older free list, then fresh pages past the tentative eof
        let mut new_free: VecDeque<u64> = reclaimed.iter().copied().collect();
        let mut old_free: VecDeque<u64> = txn.state.free_list.clone();
        let mut eof = txn.tentative_eof;
        let ps = self.page_size as u64;
        let mut chains: Vec<Vec<u64>> = Vec::new();

        macro_rules! alloc_chain {
            ($payload_len:expr) => {{
                let n = self.page_io.chain_len($payload_len);
                let mut offsets = Vec::with_capacity(n);
                for _ in 0..n {
                    let o = new_free
                        .pop_front()
                        .or_else(|| old_free.pop_front())
                        .unwrap_or_else(|| {
                            let o = eof;
                            eof += ps;
                            o
                        });
                    offsets.push(o);
                }
                chains.push(offsets.clone());
                offsets
            }};
        }

        // header pages of every user tree touched this transaction;
        // their offsets feed the tree-of-trees entries below
        let mut user_names: Vec<String> = txn
            .tree_headers
            .keys()
            .filter(|n| !n.starts_with('#'))
            .cloned()
            .collect();
        user_names.sort();

        let mut header_offsets: HashMap<String, u64> = HashMap::new();
        for name in &user_names {
            let chain = alloc_chain!(HEADER_SERIALIZED_SIZE);
            header_offsets.insert(name.clone(), chain[0]);
        }

        // meta-tree updates run inside the same transaction; their own
        // superseded pages bypass the copied-pages tree
        txn.meta_mode = true;
        let meta_result = (|| -> MaviResult<()> {
            let bob_header = txn.tree_header(BOB_TREE).unwrap();
            let bob = BTree::from_parts(self.read_info(bob_header.info as u64)?, bob_header)?;
            for name in &user_names {
                bob.insert(
                    txn,
                    &BobKeySerializer::encode(name, revision),
                    &LongSerializer::encode(header_offsets[name]),
                )?;
            }

            let copied: Vec<u64> = txn.copied.iter().copied().collect();
            if !copied.is_empty() {
                let cpb_header = txn.tree_header(CPB_TREE).unwrap();
                let cpb =
                    BTree::from_parts(self.read_info(cpb_header.info as u64)?, cpb_header)?;
                cpb.insert(
                    txn,
                    &LongSerializer::encode(revision),
                    &OffsetListSerializer::encode(&copied),
                )?;
            }
            Ok(())
        })();
        txn.meta_mode = false;
        meta_result?;

        // place every pending page and info
        let mut offsets_of: HashMap<i64, u64> = HashMap::new();
        let mut page_chains: Vec<(i64, Vec<u64>)> = Vec::new();
        let wal_ids: Vec<i64> = txn.wal.keys().copied().collect();
        for id in wal_ids {
            let size = txn.wal[&id].serialized_size();
            let chain = alloc_chain!(size);
            offsets_of.insert(id, chain[0]);
            page_chains.push((id, chain));
        }
        let info_ids: Vec<i64> = txn.new_infos.keys().copied().collect();
        let mut info_chains: Vec<(i64, Vec<u64>)> = Vec::new();
        for id in info_ids {
            let size = txn.new_infos[&id].serialized_size();
            let chain = alloc_chain!(size);
            offsets_of.insert(id, chain[0]);
            info_chains.push((id, chain));
        }
        let bob_header_chain = alloc_chain!(HEADER_SERIALIZED_SIZE);
        let cpb_header_chain = alloc_chain!(HEADER_SERIALIZED_SIZE);

        let resolve = |r: i64| -> MaviResult<u64> {
            if r > 0 {
                Ok(r as u64)
            } else {
                offsets_of.get(&r).copied().ok_or_else(|| {
                    MaviError::corrupt(0, &format!("unresolved page reference {}", r))
                })
            }
        };

        // write pages leaves-first is unnecessary: every child
        // reference resolves through the map, so order is free
        for (id, chain) in &page_chains {
            let page = &txn.wal[id];
            let bytes = page.serialize(chain[0], &resolve)?;
            self.page_io.write_chain(chain, &bytes)?;
        }
        for (id, chain) in &info_chains {
            let bytes = txn.new_infos[id].serialize();
            self.page_io.write_chain(chain, &bytes)?;
        }
        for name in &user_names {
            let header = txn.tree_header(name).unwrap();
            let offset = header_offsets[name];
            let bytes = header.serialize(offset, &resolve)?;
            self.page_io.write_chain(&[offset], &bytes)?;
        }
        let bob_header_offset = bob_header_chain[0];
        let cpb_header_offset = cpb_header_chain[0];
        {
            let header = txn.tree_header(BOB_TREE).unwrap();
            let bytes = header.serialize(bob_header_offset, &resolve)?;
            self.page_io.write_chain(&bob_header_chain, &bytes)?;
            let header = txn.tree_header(CPB_TREE).unwrap();
            let bytes = header.serialize(cpb_header_offset, &resolve)?;
            self.page_io.write_chain(&cpb_header_chain, &bytes)?;
        }

        // free-list surgery: pages freed now that were not immediately
        // reused get linked in front of the surviving old chain, whose
        // own links are still intact on disk
        let mut fresh_free: Vec<u64> = meta_eligible.iter().map(|(_, o)| *o).collect();
        fresh_free.extend(new_free.iter().copied());
        let tail = old_free.front().copied().unwrap_or(NO_PAGE);
        self.page_io.write_free_links(&fresh_free, tail)?;
        let first_free = fresh_free.first().copied().unwrap_or(tail);

        self.page_io.file().sync()?;

        // the swap: new header into the inactive slot, then sync
        let old_header = &txn.state.header;
        let new_header = FileHeader {
            page_size: old_header.page_size,
            generation: old_header.generation + 1,
            revision,
            bob_header: bob_header_offset,
            cpb_header: cpb_header_offset,
            first_free,
            eof,
        };
        let slot = (new_header.generation % 2) * ps;
        self.page_io
            .file()
            .write_all_at(&new_header.serialize(), slot)?;
        self.page_io.file().sync()?;

        // visible from here on; nothing below can fail
        for chain in &chains {
            for &offset in chain {
                self.cache.invalidate(offset);
            }
        }
        for &offset in reclaimed.iter().chain(fresh_free.iter()) {
            self.cache.invalidate(offset);
        }

        let mut free_list: VecDeque<u64> = fresh_free.into();
        free_list.append(&mut old_free);
        txn.state.free_list = free_list;
        txn.state.header = new_header.clone();
        *self.current.wl() = new_header;

        {
            let mut dm = self.deferred_meta.lock().unwrap();
            *dm = meta_kept;
            dm.extend(txn.meta_copied.iter().map(|&o| (revision, o)));
        }

        info!(
            "committed revision {}: {} pages written, {} copied, {} reclaimed",
            revision,
            chains.len(),
            txn.copied.len(),
            reclaimed.len()
        );
        Ok(())
    }

    /// Drop copied-pages entries below the reclamation bar and stale
    /// tree-of-trees entries shadowed by a newer one below the bar.
    fn reclaim(
        &self,
        txn: &mut WriteTransaction,
        bar: u64,
        freed: &mut Vec<u64>,
    ) -> MaviResult<()> {
        let cpb_header = txn.tree_header(CPB_TREE).unwrap();
        let cpb = BTree::from_parts(self.read_info(cpb_header.info as u64)?, cpb_header)?;

        let mut eligible: Vec<(u64, Vec<u64>)> = Vec::new();
        {
            let snapshot: &dyn Snapshot = txn;
            let mut cursor = cpb.browse(snapshot)?;
            while let Some((key, value)) = cursor.next()? {
                let rev = LongSerializer::decode(&key)?;
                if rev > bar {
                    break;
                }
                eligible.push((rev, OffsetListSerializer::decode(&value)?));
            }
        }

        let bob_header = txn.tree_header(BOB_TREE).unwrap();
        let bob = BTree::from_parts(self.read_info(bob_header.info as u64)?, bob_header)?;
        let mut stale: Vec<(String, u64)> = Vec::new();
        {
            let snapshot: &dyn Snapshot = txn;
            let mut cursor = bob.browse(snapshot)?;
            let mut last_eligible: Option<(String, u64)> = None;
            while let Some((key, _)) = cursor.next()? {
                let (name, rev) = BobKeySerializer::decode(&key)?;
                if last_eligible.as_ref().map(|(n, _)| n != &name).unwrap_or(false) {
                    last_eligible = None;
                }
                if rev <= bar {
                    if let Some(prev) = last_eligible.take() {
                        stale.push(prev);
                    }
                    last_eligible = Some((name, rev));
                }
            }
        }

        if eligible.is_empty() && stale.is_empty() {
            return Ok(());
        }

        txn.meta_mode = true;
        let result = (|| -> MaviResult<()> {
            for (rev, offsets) in &eligible {
                cpb.delete(txn, &LongSerializer::encode(*rev))?;
                freed.extend(offsets.iter().copied());
            }
            for (name, rev) in &stale {
                bob.delete(txn, &BobKeySerializer::encode(name, *rev))?;
            }
            Ok(())
        })();
        txn.meta_mode = false;
        result?;

        if !freed.is_empty() {
            debug!(
                "reclaimed {} pages from {} revisions below bar {}",
                freed.len(),
                eligible.len(),
                bar
            );
        }
        Ok(())
    }

    /// Flush nothing, verify nothing: every committed revision is
    /// already durable. Exists so callers can make the end of the
    /// store's life explicit.
    pub fn close(&self) -> MaviResult<()> {
        self.page_io.file().sync()
    }
}

impl Drop for RecordManager {
    fn drop(&mut self) {
        if let Ok(readers) = self.readers.lock() {
            if !readers.is_empty() {
                warn!("store dropped with {} reader pins alive", readers.len());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> FileHeader {
        FileHeader {
            page_size: 4096,
            generation: 7,
            revision: 5,
            bob_header: 4096 * 9,
            cpb_header: 4096 * 12,
            first_free: NO_PAGE,
            eof: 4096 * 20,
        }
    }

    #[test]
    fn file_header_round_trip() {
        let bytes = header().serialize();
        assert_eq!(bytes.len(), FILE_HEADER_SIZE);

        let parsed = FileHeader::deserialize(&bytes, 0).unwrap();
        assert_eq!(parsed.generation, 7);
        assert_eq!(parsed.revision, 5);
        assert_eq!(parsed.eof, 4096 * 20);
        assert_eq!(parsed.first_free, NO_PAGE);
    }

    #[test]
    fn file_header_rejects_bit_flips() {
        let good = header().serialize();
        for i in 0..FILE_HEADER_SIZE {
            let mut bytes = good.clone();
            bytes[i] ^= 0x40;
            assert!(
                FileHeader::deserialize(&bytes, 0).is_err(),
                "flip at byte {} went unnoticed",
                i
            );
        }
    }

    #[test]
    fn file_header_rejects_short_buffer() {
        let bytes = header().serialize();
        assert!(FileHeader::deserialize(&bytes[..20], 0).is_err());
    }
}
