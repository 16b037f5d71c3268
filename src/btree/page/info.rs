use crate::{
    io::{MaviReader, MaviWriter},
    types::MaviResult,
};

/// Immutable per-tree data, shared by every revision of the tree.
#[derive(Debug, Clone)]
pub struct BTreeInfo {
    pub fanout: u32,
    pub name: String,
    pub key_serializer: u32,
    pub value_serializer: u32,
}

impl BTreeInfo {
    pub fn serialized_size(&self) -> usize {
        4 + 4 + self.name.len() + 4 + 4
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut w = MaviWriter::with_capacity(self.serialized_size());
        w.write_u32(self.fanout);
        w.write_sized(self.name.as_bytes());
        w.write_u32(self.key_serializer);
        w.write_u32(self.value_serializer);
        w.into_bytes()
    }

    pub fn deserialize(bytes: &[u8], offset: u64) -> MaviResult<BTreeInfo> {
        let mut r = MaviReader::new(bytes, offset);
        let fanout = r.read_u32()?;
        let name = String::from_utf8_lossy(&r.read_sized()?).into_owned();
        let key_serializer = r.read_u32()?;
        let value_serializer = r.read_u32()?;
        Ok(BTreeInfo {
            fanout,
            name,
            key_serializer,
            value_serializer,
        })
    }
}
