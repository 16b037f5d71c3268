use log::{debug, warn};

use crate::{
    error::MaviError,
    io::{MaviFile, MaviReader, MaviWriter},
    types::MaviResult,
    utils::ceil_div,
};

/// Sentinel offset: "no page".
pub const NO_PAGE: u64 = u64::MAX;

/// Marker word stored after the link of every page sitting in the free
/// list. The open-time chain walk refuses to follow a link into a page
/// that does not carry it, so a torn commit can leak the tail of the
/// chain but can never put a live page back into circulation.
pub const FREE_MARKER: u32 = 0x4652_4545; // "FREE"

/// Size of the per-page link word.
const LINK_SIZE: usize = 8;
/// Payload-length field, present on the first page of a logical page.
const LEN_SIZE: usize = 4;

/// Translates logical pages (byte sequences of arbitrary length) to and
/// from chains of fixed-size physical pages.
///
/// A logical page's identity is the file offset of its first physical
/// page. Every physical page starts with an 8-byte next-offset
/// (`NO_PAGE` if terminal); the first page of a chain additionally
/// stores the logical payload length.
pub struct PageIo {
    file: MaviFile,
    page_size: usize,
}

impl PageIo {
    pub fn new(file: MaviFile, page_size: usize) -> Self {
        Self { file, page_size }
    }

    pub fn file(&self) -> &MaviFile {
        &self.file
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Payload capacity of the first physical page of a chain.
    pub fn first_capacity(&self) -> usize {
        self.page_size - LINK_SIZE - LEN_SIZE
    }

    /// Payload capacity of every following physical page.
    pub fn rest_capacity(&self) -> usize {
        self.page_size - LINK_SIZE
    }

    /// Number of physical pages needed for a payload of `len` bytes.
    pub fn chain_len(&self, len: usize) -> usize {
        if len <= self.first_capacity() {
            1
        } else {
            1 + ceil_div(len - self.first_capacity(), self.rest_capacity())
        }
    }

    /// Write `payload` across the given chain of page offsets, linking
    /// each page to the next. `offsets.len()` must equal
    /// `chain_len(payload.len())`.
    pub fn write_chain(&self, offsets: &[u64], payload: &[u8]) -> MaviResult<()> {
        assert_eq!(offsets.len(), self.chain_len(payload.len()));

        let mut cursor = 0usize;
        for (i, &offset) in offsets.iter().enumerate() {
            let next = offsets.get(i + 1).copied().unwrap_or(NO_PAGE);
            let cap = if i == 0 {
                self.first_capacity()
            } else {
                self.rest_capacity()
            };
            let end = (cursor + cap).min(payload.len());

            let mut w = MaviWriter::with_capacity(self.page_size);
            w.write_u64(next);
            if i == 0 {
                w.write_u32(payload.len() as u32);
            }
            w.write_bytes(&payload[cursor..end]);

            let mut buf = w.into_bytes();
            buf.resize(self.page_size, 0);
            self.file.write_all_at(&buf, offset)?;

            cursor = end;
        }
        Ok(())
    }

    /// Read the logical page starting at `first`, following the chain.
    /// `eof` bounds link validation.
    pub fn read_chain(&self, first: u64, eof: u64) -> MaviResult<Vec<u8>> {
        let mut page = vec![0u8; self.page_size];
        self.file.read_exact_at(&mut page, first)?;

        let mut r = MaviReader::new(&page, first);
        let mut next = r.read_u64()?;
        let len = r.read_u32()? as usize;
        if len > (1 << 31) {
            return Err(MaviError::corrupt(first, "absurd payload length"));
        }

        let mut payload = Vec::with_capacity(len);
        let take = len.min(self.first_capacity());
        payload.extend_from_slice(r.read_bytes(take)?.as_slice());

        let max_pages = self.chain_len(len);
        let mut pages_read = 1;
        while payload.len() < len {
            if next == NO_PAGE || pages_read >= max_pages {
                return Err(MaviError::corrupt(first, "chain shorter than payload"));
            }
            self.validate_offset(next, eof).map_err(|_| {
                MaviError::corrupt(first, &format!("bad chain link {:#x}", next))
            })?;

            self.file.read_exact_at(&mut page, next)?;
            let mut r = MaviReader::new(&page, next);
            let follow = r.read_u64()?;
            let take = (len - payload.len()).min(self.rest_capacity());
            payload.extend_from_slice(r.read_bytes(take)?.as_slice());

            next = follow;
            pages_read += 1;
        }

        Ok(payload)
    }

    /// Stamp free-list links into `pages`, chaining them in order and
    /// pointing the last one at `tail`. The pages must already be dead
    /// in every pinnable revision.
    pub fn write_free_links(&self, pages: &[u64], tail: u64) -> MaviResult<()> {
        for (i, &offset) in pages.iter().enumerate() {
            let next = pages.get(i + 1).copied().unwrap_or(tail);
            let mut w = MaviWriter::with_capacity(LINK_SIZE + 4);
            w.write_u64(next);
            w.write_u32(FREE_MARKER);
            self.file.write_all_at(&w.into_bytes(), offset)?;
        }
        Ok(())
    }

    /// Walk the on-disk free chain from `head`, collecting offsets.
    ///
    /// The walk is defensive: it stops at the first link that is out of
    /// bounds, misaligned, or missing the free marker. After a crash
    /// this turns a scribbled chain into a leak instead of a
    /// double-allocation.
    pub fn walk_free_chain(&self, head: u64, eof: u64) -> MaviResult<Vec<u64>> {
        let mut chain = Vec::new();
        let mut cursor = head;
        let cap = (eof / self.page_size as u64) as usize + 1;

        while cursor != NO_PAGE {
            if self.validate_offset(cursor, eof).is_err() || chain.len() > cap {
                warn!("free chain broken at {:#x}, remainder leaked", cursor);
                break;
            }

            let mut buf = vec![0u8; LINK_SIZE + 4];
            self.file.read_exact_at(&mut buf, cursor)?;
            let mut r = MaviReader::new(&buf, cursor);
            let next = r.read_u64()?;
            let marker = r.read_u32()?;
            if marker != FREE_MARKER {
                warn!("page {:#x} in free chain lacks marker, stopping walk", cursor);
                break;
            }

            chain.push(cursor);
            cursor = next;
        }

        debug!("free chain: {} pages", chain.len());
        Ok(chain)
    }

    fn validate_offset(&self, offset: u64, eof: u64) -> MaviResult<()> {
        let ps = self.page_size as u64;
        // offsets 0 and page_size are the two header slots
        if offset < 2 * ps || offset >= eof || offset % ps != 0 {
            return Err(MaviError::corrupt(offset, "offset out of bounds"));
        }
        Ok(())
    }
}
