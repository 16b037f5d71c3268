use std::{
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
};

use fs2::FileExt as LockExt;
use log::debug;

use crate::{error::MaviError, types::MaviResult};

/// Handle on the backing data file.
///
/// All reads and writes are positional (pread/pwrite), so concurrent
/// readers never contend on a shared cursor. A `<path>.lock` sibling is
/// held exclusively for the lifetime of the handle to fence out writers
/// from other processes.
pub struct MaviFile {
    file: File,
    lock_file: File,
    lock_path: PathBuf,
}

impl MaviFile {
    pub fn open<P: AsRef<Path>>(path: P) -> MaviResult<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        let mut lock_path = path.as_os_str().to_owned();
        lock_path.push(".lock");
        let lock_path = PathBuf::from(lock_path);

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&lock_path)?;
        lock_file.try_lock_exclusive().map_err(|_| {
            MaviError::invalid(&format!(
                "database is locked by another process: {}",
                lock_path.display()
            ))
        })?;

        debug!("opened data file {}", path.display());

        Ok(Self {
            file,
            lock_file,
            lock_path,
        })
    }

    pub fn len(&self) -> MaviResult<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> MaviResult<()> {
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    pub fn write_all_at(&self, buf: &[u8], offset: u64) -> MaviResult<()> {
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    pub fn set_len(&self, len: u64) -> MaviResult<()> {
        self.file.set_len(len)?;
        Ok(())
    }

    /// Durability barrier. Everything written before this call is on
    /// stable storage when it returns.
    pub fn sync(&self) -> MaviResult<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

impl Drop for MaviFile {
    fn drop(&mut self) {
        let _ = self.lock_file.unlock();
        let _ = std::fs::remove_file(&self.lock_path);
    }
}
