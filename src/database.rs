use std::{path::Path, sync::Arc};

use crate::{
    record_manager::RecordManager,
    transaction::{ReadTransaction, WriteTransaction},
    types::MaviResult,
};

/// Store configuration. The page size is fixed at creation and
/// recorded in the file header; reopening an existing store uses the
/// recorded value.
#[derive(Debug, Clone, Copy)]
pub struct DbConfig {
    /// Physical page size in bytes: a power of two in `512..=65536`.
    pub page_size: usize,
    /// Page-cache capacity in logical pages.
    pub cache_capacity: usize,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            page_size: 4096,
            cache_capacity: 1024,
        }
    }
}

/// An opened store: one data file, one lock file, snapshot-isolated
/// readers and a single serialized writer.
pub struct Database {
    rm: Arc<RecordManager>,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P, config: DbConfig) -> MaviResult<Database> {
        let rm = RecordManager::open(path, config.page_size, config.cache_capacity)?;
        Ok(Database { rm: Arc::new(rm) })
    }

    /// Pin the current revision for snapshot reads. Readers never
    /// block writers and writers never block readers.
    pub fn begin_read(&self) -> ReadTransaction {
        self.rm.begin_read()
    }

    /// Start the single write transaction, blocking while another one
    /// is running. Dropping the transaction without committing rolls
    /// it back.
    pub fn begin_write(&self) -> MaviResult<WriteTransaction<'_>> {
        self.rm.begin_write()
    }

    /// Non-blocking variant: `None` when a writer is already active.
    pub fn try_begin_write(&self) -> MaviResult<Option<WriteTransaction<'_>>> {
        self.rm.try_begin_write()
    }

    /// Latest committed revision.
    pub fn revision(&self) -> u64 {
        self.rm.revision()
    }

    /// Number of pinned read transactions, exposed for diagnostics.
    pub fn reader_count(&self) -> usize {
        self.rm.reader_count()
    }

    pub fn close(self) -> MaviResult<()> {
        self.rm.close()
    }
}
