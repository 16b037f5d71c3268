mod header;
mod info;
mod leaf;
mod node;

pub use header::{BTreeHeader, HEADER_SERIALIZED_SIZE};
pub use info::BTreeInfo;
pub use leaf::{LeafInsert, LeafPage};
pub use node::{NodeInsert, NodePage};

use crate::{
    error::MaviError,
    io::{MaviReader, MaviWriter},
    types::MaviResult,
};

/// Id of a page that has not been staged in a transaction yet.
pub const UNSET_ID: i64 = 0;

/// Minimum element count of a non-root page.
pub fn min_occupancy(fanout: u32) -> usize {
    // fanout is normalized to a power of two, so ceil(F/2) == F/2
    (fanout / 2) as usize
}

/// A logical B+tree page.
///
/// Pages are immutable: every modification produces a fresh copy with a
/// new id. While a page lives only inside a write transaction its id is
/// negative; once serialized the id is the file offset of its first
/// physical page. Node child references follow the same convention.
#[derive(Debug, Clone)]
pub enum BTreePage {
    Leaf(LeafPage),
    Node(NodePage),
}

impl BTreePage {
    pub fn id(&self) -> i64 {
        match self {
            BTreePage::Leaf(l) => l.id,
            BTreePage::Node(n) => n.id,
        }
    }

    pub fn set_id(&mut self, id: i64) {
        match self {
            BTreePage::Leaf(l) => l.id = id,
            BTreePage::Node(n) => n.id = id,
        }
    }

    pub fn revision(&self) -> u64 {
        match self {
            BTreePage::Leaf(l) => l.revision,
            BTreePage::Node(n) => n.revision,
        }
    }

    /// Number of keys held by the page.
    pub fn count(&self) -> usize {
        match self {
            BTreePage::Leaf(l) => l.count(),
            BTreePage::Node(n) => n.count(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, BTreePage::Leaf(_))
    }

    pub fn key_at(&self, i: usize) -> &[u8] {
        match self {
            BTreePage::Leaf(l) => l.key_at(i),
            BTreePage::Node(n) => n.key_at(i),
        }
    }

    pub fn min_key(&self) -> Option<&[u8]> {
        if self.count() == 0 {
            None
        } else {
            Some(self.key_at(0))
        }
    }

    pub fn max_key(&self) -> Option<&[u8]> {
        let n = self.count();
        if n == 0 {
            None
        } else {
            Some(self.key_at(n - 1))
        }
    }

    /// Byte length of the serialized form. Child references serialize
    /// at a fixed width, so the size is known before they resolve.
    pub fn serialized_size(&self) -> usize {
        match self {
            BTreePage::Leaf(l) => {
                let mut size = 8 + 8 + 4;
                for i in 0..l.count() {
                    size += 4 + l.key_at(i).len() + 4 + l.value_at(i).len();
                }
                size
            }
            BTreePage::Node(n) => {
                let mut size = 8 + 8 + 4 + 8;
                for i in 0..n.count() {
                    size += 8 + 4 + n.key_at(i).len();
                }
                size
            }
        }
    }

    /// Serialize for writing at `offset`. `resolve` maps pending child
    /// ids (negative) to their final file offsets.
    pub fn serialize(
        &self,
        offset: u64,
        resolve: &dyn Fn(i64) -> MaviResult<u64>,
    ) -> MaviResult<Vec<u8>> {
        let mut w = MaviWriter::with_capacity(self.serialized_size());
        w.write_u64(offset);
        w.write_u64(self.revision());

        match self {
            BTreePage::Leaf(l) => {
                w.write_i32(l.count() as i32);
                for i in 0..l.count() {
                    w.write_sized(l.key_at(i));
                    w.write_sized(l.value_at(i));
                }
            }
            BTreePage::Node(n) => {
                w.write_i32(-(n.count() as i32));
                for i in 0..n.count() {
                    w.write_u64(resolve(n.child_at(i))?);
                    w.write_sized(n.key_at(i));
                }
                w.write_u64(resolve(n.child_at(n.count()))?);
            }
        }
        Ok(w.into_bytes())
    }

    /// Deserialize the logical page read from `offset`.
    pub fn deserialize(bytes: &[u8], offset: u64) -> MaviResult<BTreePage> {
        let mut r = MaviReader::new(bytes, offset);
        let stored_id = r.read_u64()?;
        if stored_id != offset {
            return Err(MaviError::corrupt(
                offset,
                &format!("page id {} does not match its offset", stored_id),
            ));
        }
        let revision = r.read_u64()?;
        let tagged_count = r.read_i32()?;

        if tagged_count >= 0 {
            let n = tagged_count as usize;
            let mut keys = Vec::with_capacity(n);
            let mut values = Vec::with_capacity(n);
            for _ in 0..n {
                keys.push(r.read_sized()?);
                values.push(r.read_sized()?);
            }
            Ok(BTreePage::Leaf(LeafPage::from_parts(
                offset as i64,
                revision,
                keys,
                values,
            )))
        } else {
            let n = (-tagged_count) as usize;
            let mut keys = Vec::with_capacity(n);
            let mut children = Vec::with_capacity(n + 1);
            for _ in 0..n {
                children.push(r.read_u64()? as i64);
                keys.push(r.read_sized()?);
            }
            children.push(r.read_u64()? as i64);
            Ok(BTreePage::Node(NodePage::from_parts(
                offset as i64,
                revision,
                keys,
                children,
            )))
        }
    }
}
