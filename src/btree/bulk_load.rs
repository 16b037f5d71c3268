use std::{
    cell::RefCell,
    fs::File,
    io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write},
    rc::Rc,
};

use itertools::Itertools;
use log::debug;

use crate::{
    btree::{
        page::{BTreeHeader, BTreeInfo, BTreePage, LeafPage, NodePage, UNSET_ID},
        serializer::{self, Serializer},
        tree::BTree,
    },
    error::MaviError,
    transaction::{Snapshot, WriteTransaction},
    types::MaviResult,
    utils::ceil_div,
};

/// Build a dense B+tree bottom-up from a sorted, deduplicated stream
/// of `count` entries.
///
/// Pages are written depth-first post-order above the transaction's
/// tentative eof, so every parent references already-persisted
/// children by final offset and the write path never touches the WAL
/// map. The staged header goes through the normal commit protocol; a
/// rollback leaves only dead tail bytes.
pub fn load_sorted<I>(
    txn: &mut WriteTransaction,
    name: &str,
    key_serializer: u32,
    value_serializer: u32,
    fanout: u32,
    count: usize,
    entries: I,
) -> MaviResult<BTree>
where
    I: IntoIterator<Item = (Vec<u8>, Vec<u8>)>,
{
    if count == 0 {
        return txn.create_tree(name, key_serializer, value_serializer, fanout);
    }

    // same admission rules as create_tree, without staging a root
    if name.is_empty() || name.starts_with('#') {
        return Err(MaviError::invalid(
            "tree names must not be empty or start with '#'",
        ));
    }
    if fanout < 4 {
        return Err(MaviError::invalid("fanout must be at least 4"));
    }
    if txn.header_of(name)?.is_some() {
        return Err(MaviError::AlreadyExists(name.to_string()));
    }
    let cmp = serializer::by_id(key_serializer)?;
    serializer::by_id(value_serializer)?;
    let fanout = (fanout as usize).next_power_of_two() as u32;

    let layout = level_layout(count, fanout);
    let top = layout.len() - 1;
    let revision = txn.revision;

    // per node level: separators, children, and the min key of the
    // first child's subtree (which travels up, not into this page)
    struct LevelBuilder {
        counts: Vec<usize>,
        page_idx: usize,
        keys: Vec<Vec<u8>>,
        children: Vec<i64>,
        subtree_min: Option<Vec<u8>>,
    }
    let mut builders: Vec<LevelBuilder> = layout[1..]
        .iter()
        .map(|counts| LevelBuilder {
            counts: counts.clone(),
            page_idx: 0,
            keys: Vec::new(),
            children: Vec::new(),
            subtree_min: None,
        })
        .collect();

    let mut root_offset: Option<u64> = None;

    // writes a finished page and feeds its (min key, offset) upward
    fn emit(
        txn: &mut WriteTransaction,
        builders: &mut [LevelBuilder],
        root_offset: &mut Option<u64>,
        top: usize,
        level: usize,
        min_key: Vec<u8>,
        page: BTreePage,
    ) -> MaviResult<()> {
        let chain = txn.alloc_eof_chain(page.serialized_size());
        let resolve = |r: i64| -> MaviResult<u64> { Ok(r as u64) };
        let bytes = page.serialize(chain[0], &resolve)?;
        txn.rm.page_io().write_chain(&chain, &bytes)?;
        let offset = chain[0];

        if level == top {
            *root_offset = Some(offset);
            return Ok(());
        }

        let builder = &mut builders[level];
        if builder.children.is_empty() {
            builder.subtree_min = Some(min_key);
        } else {
            builder.keys.push(min_key);
        }
        builder.children.push(offset as i64);

        if builder.children.len() == builder.counts[builder.page_idx] {
            builder.page_idx += 1;
            let keys = std::mem::replace(&mut builder.keys, Vec::new());
            let children = std::mem::replace(&mut builder.children, Vec::new());
            let subtree_min = builder.subtree_min.take().unwrap();
            let revision = txn.revision;
            let node = BTreePage::Node(NodePage::from_parts(UNSET_ID, revision, keys, children));
            emit(txn, builders, root_offset, top, level + 1, subtree_min, node)?;
        }
        Ok(())
    }

    let mut leaf_keys: Vec<Vec<u8>> = Vec::new();
    let mut leaf_values: Vec<Vec<u8>> = Vec::new();
    let mut leaf_idx = 0usize;
    let mut seen = 0usize;
    let mut prev_key: Option<Vec<u8>> = None;

    for (key, value) in entries {
        cmp.validate(&key)?;
        if let Some(prev) = &prev_key {
            if cmp.compare(prev, &key) != std::cmp::Ordering::Less {
                return Err(MaviError::invalid(
                    "bulk input must be sorted and deduplicated",
                ));
            }
        }
        prev_key = Some(key.clone());
        seen += 1;
        if seen > count {
            return Err(MaviError::invalid("bulk input longer than announced"));
        }

        leaf_keys.push(key);
        leaf_values.push(value);

        if leaf_keys.len() == layout[0][leaf_idx] {
            leaf_idx += 1;
            let keys = std::mem::replace(&mut leaf_keys, Vec::new());
            let values = std::mem::replace(&mut leaf_values, Vec::new());
            let min_key = keys[0].clone();
            let leaf = BTreePage::Leaf(LeafPage::from_parts(UNSET_ID, revision, keys, values));
            emit(txn, &mut builders, &mut root_offset, top, 0, min_key, leaf)?;
        }
    }

    if seen != count {
        return Err(MaviError::invalid(&format!(
            "bulk input shorter than announced: {} of {}",
            seen, count
        )));
    }
    let root_offset = root_offset.expect("layout consumed exactly count entries");

    let info = BTreeInfo {
        fanout,
        name: name.to_string(),
        key_serializer,
        value_serializer,
    };
    let info_ref = txn.stage_info(info.clone());
    let header = BTreeHeader {
        page_id: 0,
        revision,
        element_count: count as u64,
        root: root_offset as i64,
        info: info_ref,
    };
    txn.set_tree_header(name, header.clone());

    debug!(
        "bulk loaded `{}`: {} entries, {} levels",
        name,
        count,
        layout.len()
    );
    BTree::from_parts(info, header)
}

/// Bulk load from an unsorted stream of unknown size: sort chunks of
/// `chunk_size` in memory, spill them to temp files, k-way merge, and
/// feed the result through `load_sorted`. Repeated keys collapse to
/// their last value.
pub fn load_unsorted<I>(
    txn: &mut WriteTransaction,
    name: &str,
    key_serializer: u32,
    value_serializer: u32,
    fanout: u32,
    chunk_size: usize,
    entries: I,
) -> MaviResult<BTree>
where
    I: IntoIterator<Item = (Vec<u8>, Vec<u8>)>,
{
    if chunk_size == 0 {
        return Err(MaviError::invalid("chunk size must be positive"));
    }
    let cmp = serializer::by_id(key_serializer)?;

    let mut runs: Vec<File> = Vec::new();
    let mut chunk: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();

    for entry in entries {
        chunk.push(entry);
        if chunk.len() == chunk_size {
            runs.push(spill_run(&mut chunk, cmp)?);
        }
    }

    if runs.is_empty() {
        // everything fits in memory, skip the merge entirely
        sort_dedup(&mut chunk, cmp);
        let count = chunk.len();
        return load_sorted(
            txn,
            name,
            key_serializer,
            value_serializer,
            fanout,
            count,
            chunk,
        );
    }
    if !chunk.is_empty() {
        runs.push(spill_run(&mut chunk, cmp)?);
    }
    debug!("external sort: merging {} runs", runs.len());

    // run readers park read failures here and end their iteration;
    // nothing merged after a failure is trusted
    let failed: Rc<RefCell<Option<MaviError>>> = Rc::new(RefCell::new(None));

    // merge ordered by key, then by run index so the latest run wins
    // when the dedup pass keeps the last of an equal-key group
    let merged = runs
        .into_iter()
        .enumerate()
        .map(|(idx, file)| {
            RunReader::new(file, Rc::clone(&failed)).map(move |(k, v)| (idx, k, v))
        })
        .kmerge_by(|a, b| match cmp.compare(&a.1, &b.1) {
            std::cmp::Ordering::Less => true,
            std::cmp::Ordering::Greater => false,
            std::cmp::Ordering::Equal => a.0 <= b.0,
        });

    let mut final_run = BufWriter::new(tempfile::tempfile()?);
    let mut count = 0usize;
    let mut pending: Option<(Vec<u8>, Vec<u8>)> = None;
    for (_, key, value) in merged {
        match &pending {
            Some((pk, _)) if cmp.compare(pk, &key) == std::cmp::Ordering::Equal => {
                pending = Some((key, value));
            }
            _ => {
                if let Some((pk, pv)) = pending.take() {
                    write_record(&mut final_run, &pk, &pv)?;
                    count += 1;
                }
                pending = Some((key, value));
            }
        }
    }
    if let Some(e) = failed.borrow_mut().take() {
        return Err(e);
    }
    if let Some((pk, pv)) = pending.take() {
        write_record(&mut final_run, &pk, &pv)?;
        count += 1;
    }

    let mut file = final_run
        .into_inner()
        .map_err(|e| MaviError::Io(e.into_error()))?;
    file.seek(SeekFrom::Start(0))?;

    let result = load_sorted(
        txn,
        name,
        key_serializer,
        value_serializer,
        fanout,
        count,
        RunReader::new(file, Rc::clone(&failed)),
    );
    // a read failure in the final pass shows up to load_sorted as a
    // short stream; report the underlying error instead
    if let Some(e) = failed.borrow_mut().take() {
        return Err(e);
    }
    result
}

/// Per-level page occupancies for a dense tree of `count` entries.
/// `result[0]` sizes the leaves; the last level holds a single root.
fn level_layout(count: usize, fanout: u32) -> Vec<Vec<usize>> {
    let f = fanout as usize;
    let mut layout = vec![distribute(count, f, f / 2)];
    while layout.last().unwrap().len() > 1 {
        let pages = layout.last().unwrap().len();
        // a node with n children carries n - 1 keys
        layout.push(distribute(pages, f + 1, f / 2 + 1));
    }
    layout
}

/// Split `total` items into pages of at most `cap`. A short remainder
/// below `min` is balanced across the last two pages so every page
/// except a lone root meets minimum occupancy.
fn distribute(total: usize, cap: usize, min: usize) -> Vec<usize> {
    if total <= cap {
        return vec![total];
    }
    let pages = ceil_div(total, cap);
    let remainder = total % cap;
    if remainder == 0 {
        vec![cap; pages]
    } else if remainder >= min {
        let mut v = vec![cap; pages - 1];
        v.push(remainder);
        v
    } else {
        let shared = cap + remainder;
        let mut v = vec![cap; pages - 2];
        v.push(ceil_div(shared, 2));
        v.push(shared / 2);
        v
    }
}

fn sort_dedup(chunk: &mut Vec<(Vec<u8>, Vec<u8>)>, cmp: &dyn Serializer) {
    // stable sort: equal keys keep arrival order, so the last one of
    // each group is the latest value
    chunk.sort_by(|a, b| cmp.compare(&a.0, &b.0));
    let mut deduped: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(chunk.len());
    for entry in chunk.drain(..) {
        match deduped.last() {
            Some((k, _)) if cmp.compare(k, &entry.0) == std::cmp::Ordering::Equal => {
                *deduped.last_mut().unwrap() = entry;
            }
            _ => deduped.push(entry),
        }
    }
    *chunk = deduped;
}

fn spill_run(chunk: &mut Vec<(Vec<u8>, Vec<u8>)>, cmp: &dyn Serializer) -> MaviResult<File> {
    sort_dedup(chunk, cmp);
    let mut w = BufWriter::new(tempfile::tempfile()?);
    for (key, value) in chunk.drain(..) {
        write_record(&mut w, &key, &value)?;
    }
    let mut file = w.into_inner().map_err(|e| MaviError::Io(e.into_error()))?;
    file.seek(SeekFrom::Start(0))?;
    Ok(file)
}

fn write_record<W: Write>(w: &mut W, key: &[u8], value: &[u8]) -> MaviResult<()> {
    w.write_all(&(key.len() as u32).to_be_bytes())?;
    w.write_all(key)?;
    w.write_all(&(value.len() as u32).to_be_bytes())?;
    w.write_all(value)?;
    Ok(())
}

/// Streams `(key, value)` records back out of a spilled run.
///
/// `Iterator::next` cannot carry a `Result`, so a read failure is
/// parked in the shared `failed` slot and the stream ends; the caller
/// checks the slot before trusting anything downstream of the merge.
struct RunReader {
    reader: BufReader<File>,
    failed: Rc<RefCell<Option<MaviError>>>,
}

impl RunReader {
    fn new(file: File, failed: Rc<RefCell<Option<MaviError>>>) -> Self {
        Self {
            reader: BufReader::new(file),
            failed,
        }
    }

    fn read_record(&mut self) -> MaviResult<Option<(Vec<u8>, Vec<u8>)>> {
        let mut len = [0u8; 4];
        match self.reader.read_exact(&mut len) {
            Ok(()) => {}
            // a clean end of the run falls between records
            Err(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(None)
            }
            Err(e) => return Err(e.into()),
        }
        let mut key = vec![0u8; u32::from_be_bytes(len) as usize];
        self.reader.read_exact(&mut key)?;

        self.reader.read_exact(&mut len)?;
        let mut value = vec![0u8; u32::from_be_bytes(len) as usize];
        self.reader.read_exact(&mut value)?;

        Ok(Some((key, value)))
    }
}

impl Iterator for RunReader {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed.borrow().is_some() {
            return None;
        }
        match self.read_record() {
            Ok(entry) => entry,
            Err(e) => {
                *self.failed.borrow_mut() = Some(e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distribute_balances_short_tail() {
        // remainder 1 < min 2: last two pages share 4 + 1
        assert_eq!(distribute(9, 4, 2), vec![4, 3, 2]);
        // remainder meets min: keep it
        assert_eq!(distribute(10, 4, 2), vec![4, 4, 2]);
        assert_eq!(distribute(8, 4, 2), vec![4, 4]);
        // a lone root may be arbitrarily small
        assert_eq!(distribute(1, 4, 2), vec![1]);
    }

    #[test]
    fn layout_reaches_a_single_root() {
        let layout = level_layout(10_000, 32);
        assert_eq!(layout.last().unwrap().len(), 1);
        for level in &layout {
            for &n in level.iter() {
                assert!(n <= 33);
            }
        }
        let leaves: usize = layout[0].iter().sum();
        assert_eq!(leaves, 10_000);
    }
}
