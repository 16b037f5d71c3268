use std::{cmp::Ordering, collections::HashMap};

use once_cell::sync::Lazy;

use crate::{
    error::MaviError,
    io::{MaviReader, MaviWriter},
    types::MaviResult,
};

/// Serializer id for unsigned 64-bit integer keys/values.
pub const LONG_SERIALIZER: u32 = 1;
/// Serializer id for UTF-8 string keys/values.
pub const STRING_SERIALIZER: u32 = 2;
/// Serializer id for opaque byte keys/values, ordered lexicographically.
pub const BYTES_SERIALIZER: u32 = 3;
/// Internal: composite (tree-name, revision) key of the tree-of-trees.
pub const BOB_KEY_SERIALIZER: u32 = 100;
/// Internal: page-offset list values of the copied-pages tree.
pub const OFFSET_LIST_SERIALIZER: u32 = 101;

/// Total order over encoded keys plus shape validation.
///
/// The engine stores keys and values as opaque bytes; the serializer id
/// recorded in each tree's info page decides how those bytes compare.
pub trait Serializer: Send + Sync {
    fn id(&self) -> u32;
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
    fn validate(&self, bytes: &[u8]) -> MaviResult<()>;
}

pub struct LongSerializer;
pub struct StringSerializer;
pub struct BytesSerializer;
pub struct BobKeySerializer;
pub struct OffsetListSerializer;

impl LongSerializer {
    pub fn encode(v: u64) -> Vec<u8> {
        v.to_be_bytes().to_vec()
    }

    pub fn decode(bytes: &[u8]) -> MaviResult<u64> {
        if bytes.len() != 8 {
            return Err(MaviError::Serializer(format!(
                "long value must be 8 bytes, got {}",
                bytes.len()
            )));
        }
        let mut a = [0u8; 8];
        a.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(a))
    }
}

impl Serializer for LongSerializer {
    fn id(&self) -> u32 {
        LONG_SERIALIZER
    }

    // big-endian, so byte order is numeric order
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn validate(&self, bytes: &[u8]) -> MaviResult<()> {
        Self::decode(bytes).map(|_| ())
    }
}

impl StringSerializer {
    pub fn encode(v: &str) -> Vec<u8> {
        v.as_bytes().to_vec()
    }

    pub fn decode(bytes: &[u8]) -> MaviResult<String> {
        String::from_utf8(bytes.to_vec())
            .map_err(|e| MaviError::Serializer(e.to_string()))
    }
}

impl Serializer for StringSerializer {
    fn id(&self) -> u32 {
        STRING_SERIALIZER
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn validate(&self, bytes: &[u8]) -> MaviResult<()> {
        Self::decode(bytes).map(|_| ())
    }
}

impl Serializer for BytesSerializer {
    fn id(&self) -> u32 {
        BYTES_SERIALIZER
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn validate(&self, _bytes: &[u8]) -> MaviResult<()> {
        Ok(())
    }
}

impl BobKeySerializer {
    pub fn encode(name: &str, revision: u64) -> Vec<u8> {
        let mut w = MaviWriter::new();
        w.write_sized(name.as_bytes());
        w.write_u64(revision);
        w.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> MaviResult<(String, u64)> {
        let mut r = MaviReader::new(bytes, 0);
        let name = r
            .read_sized()
            .and_then(|b| StringSerializer::decode(&b))
            .map_err(|e| MaviError::Serializer(e.to_string()))?;
        let revision = r
            .read_u64()
            .map_err(|e| MaviError::Serializer(e.to_string()))?;
        Ok((name, revision))
    }
}

impl Serializer for BobKeySerializer {
    fn id(&self) -> u32 {
        BOB_KEY_SERIALIZER
    }

    // name first, then revision; both components decoded because the
    // length prefix breaks plain lexicographic comparison
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match (Self::decode(a), Self::decode(b)) {
            (Ok((na, ra)), Ok((nb, rb))) => {
                na.cmp(&nb).then(ra.cmp(&rb))
            }
            _ => a.cmp(b),
        }
    }

    fn validate(&self, bytes: &[u8]) -> MaviResult<()> {
        Self::decode(bytes).map(|_| ())
    }
}

impl OffsetListSerializer {
    pub fn encode(offsets: &[u64]) -> Vec<u8> {
        let mut w = MaviWriter::with_capacity(4 + offsets.len() * 8);
        w.write_u32(offsets.len() as u32);
        for &o in offsets {
            w.write_u64(o);
        }
        w.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> MaviResult<Vec<u64>> {
        let mut r = MaviReader::new(bytes, 0);
        let count = r
            .read_u32()
            .map_err(|e| MaviError::Serializer(e.to_string()))?;
        let mut offsets = Vec::with_capacity(count as usize);
        for _ in 0..count {
            offsets.push(
                r.read_u64()
                    .map_err(|e| MaviError::Serializer(e.to_string()))?,
            );
        }
        Ok(offsets)
    }
}

impl Serializer for OffsetListSerializer {
    fn id(&self) -> u32 {
        OFFSET_LIST_SERIALIZER
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn validate(&self, bytes: &[u8]) -> MaviResult<()> {
        Self::decode(bytes).map(|_| ())
    }
}

static REGISTRY: Lazy<HashMap<u32, &'static dyn Serializer>> = Lazy::new(|| {
    let mut m: HashMap<u32, &'static dyn Serializer> = HashMap::new();
    m.insert(LONG_SERIALIZER, &LongSerializer);
    m.insert(STRING_SERIALIZER, &StringSerializer);
    m.insert(BYTES_SERIALIZER, &BytesSerializer);
    m.insert(BOB_KEY_SERIALIZER, &BobKeySerializer);
    m.insert(OFFSET_LIST_SERIALIZER, &OffsetListSerializer);
    m
});

/// Look up the serializer recorded in a tree's info page.
pub fn by_id(id: u32) -> MaviResult<&'static dyn Serializer> {
    REGISTRY.get(&id).copied().ok_or_else(|| {
        MaviError::Serializer(format!("unknown serializer id {}", id))
    })
}
