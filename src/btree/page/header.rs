use crate::{
    io::{MaviReader, MaviWriter},
    types::MaviResult,
};

/// Per-revision metadata of one B+tree. A commit that touches the tree
/// writes a fresh header page and schedules the old one for
/// reclamation; snapshot readers resolve headers through the
/// tree-of-trees.
#[derive(Debug, Clone)]
pub struct BTreeHeader {
    /// File offset once persisted, 0 while staged in a write
    /// transaction.
    pub page_id: i64,
    pub revision: u64,
    pub element_count: u64,
    /// Root page reference: offset, or pending id before commit.
    pub root: i64,
    /// Info page reference: offset, or pending id for a tree created
    /// in the current transaction.
    pub info: i64,
}

pub const HEADER_SERIALIZED_SIZE: usize = 5 * 8;

impl BTreeHeader {
    pub fn serialized_size(&self) -> usize {
        HEADER_SERIALIZED_SIZE
    }

    pub fn serialize(
        &self,
        offset: u64,
        resolve: &dyn Fn(i64) -> MaviResult<u64>,
    ) -> MaviResult<Vec<u8>> {
        let mut w = MaviWriter::with_capacity(HEADER_SERIALIZED_SIZE);
        w.write_u64(offset);
        w.write_u64(self.revision);
        w.write_u64(self.element_count);
        w.write_u64(resolve(self.root)?);
        w.write_u64(resolve(self.info)?);
        Ok(w.into_bytes())
    }

    pub fn deserialize(bytes: &[u8], offset: u64) -> MaviResult<BTreeHeader> {
        let mut r = MaviReader::new(bytes, offset);
        let page_id = r.read_u64()? as i64;
        let revision = r.read_u64()?;
        let element_count = r.read_u64()?;
        let root = r.read_u64()? as i64;
        let info = r.read_u64()? as i64;
        Ok(BTreeHeader {
            page_id,
            revision,
            element_count,
            root,
            info,
        })
    }
}
