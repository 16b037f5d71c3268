use std::sync::{Arc, Mutex};

use lru::LruCache;

use crate::btree::page::BTreePage;

/// Bounded recently-used cache of deserialized logical pages, keyed by
/// the offset of their first physical page.
///
/// Entries are immutable once inserted (pages are never mutated at an
/// offset), so eviction is pure memory reclamation and a hit can be
/// shared freely across transactions. The commit path invalidates every
/// offset it writes or frees before the new revision becomes visible.
pub struct PageCache {
    inner: Mutex<LruCache<u64, Arc<BTreePage>>>,
}

impl PageCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, offset: u64) -> Option<Arc<BTreePage>> {
        self.inner.lock().unwrap().get(&offset).cloned()
    }

    pub fn put(&self, offset: u64, page: Arc<BTreePage>) {
        self.inner.lock().unwrap().put(offset, page);
    }

    pub fn invalidate(&self, offset: u64) {
        let _ = self.inner.lock().unwrap().pop(&offset);
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}
