//! Environment: the single entry point to a store
//!
//! An environment owns the mapped data file, the writer locks, the reader
//! table, and the meta-record selection logic. Opening an empty file
//! bootstraps the double meta pair plus the two initial root leaves; opening
//! an existing file picks the newest intact meta record, which is the whole
//! of crash recovery.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use crate::checksum;
use crate::error::{Error, Result};
use crate::io::MmapBackend;
use crate::meta::{
    DbStat, EnvInfo, MetaRecord, FREE_ROOT_PAGE, MAIN_ROOT_PAGE, META_PAGE_A, META_PAGE_B,
};
use crate::page::{PageBuf, PageFlags, PAGE_SIZE};
use crate::reader::{ReaderTable, DEFAULT_MAX_READERS};
use crate::txn::{Read, Transaction, Write};

/// Default map size: 1 GiB
pub const DEFAULT_MAP_SIZE: u64 = 1 << 30;

/// Default maximum number of named databases
pub const DEFAULT_MAX_DBS: u32 = 128;

/// Durability of committed transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurabilityMode {
    /// Sync data pages and the meta record before commit returns
    FullSync,
    /// Sync data pages; let the meta record reach disk asynchronously
    SyncData,
    /// Schedule an asynchronous flush of everything
    AsyncFlush,
    /// Leave flushing entirely to the OS write-back of the mapping
    WriteBack,
}

pub(crate) struct EnvInner {
    #[allow(dead_code)]
    pub(crate) path: PathBuf,
    pub(crate) io: MmapBackend,
    pub(crate) lock_file: File,
    /// Last committed transaction id, published at commit
    pub(crate) txn_id: AtomicU64,
    /// In-process writer exclusivity
    pub(crate) write_lock: Mutex<()>,
    pub(crate) readers: ReaderTable,
    pub(crate) durability: DurabilityMode,
    pub(crate) max_dbs: u32,
    pub(crate) max_readers: u32,
    pub(crate) writer_nonblocking: bool,
}

/// The newest valid meta record in a store
pub(crate) fn read_current_meta(io: &MmapBackend) -> Result<MetaRecord> {
    let page_a = io.read_page(META_PAGE_A)?;
    let page_b = io.read_page(META_PAGE_B)?;
    let meta_a = MetaRecord::decode(&page_a);
    let meta_b = MetaRecord::decode(&page_b);
    match (meta_a, meta_b) {
        (Ok(a), Ok(b)) => Ok(if a.last_txnid.0 >= b.last_txnid.0 { a } else { b }),
        (Ok(a), Err(_)) => Ok(a),
        (Err(_), Ok(b)) => Ok(b),
        (Err(_), Err(_)) => {
            Err(Error::CorruptPage { details: "no valid meta record".into(), page: None })
        }
    }
}

impl EnvInner {
    /// The newest valid meta record
    pub(crate) fn current_meta(&self) -> Result<MetaRecord> {
        read_current_meta(&self.io)
    }
}

/// A database environment
pub struct Environment {
    inner: Arc<EnvInner>,
}

/// Builder for opening environments
pub struct EnvBuilder {
    map_size: u64,
    max_dbs: u32,
    max_readers: u32,
    durability: DurabilityMode,
    create: bool,
    writer_nonblocking: bool,
}

impl Default for EnvBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvBuilder {
    /// Builder with default configuration
    pub fn new() -> Self {
        Self {
            map_size: DEFAULT_MAP_SIZE,
            max_dbs: DEFAULT_MAX_DBS,
            max_readers: DEFAULT_MAX_READERS,
            durability: DurabilityMode::FullSync,
            create: true,
            writer_nonblocking: false,
        }
    }

    /// Upper bound on file growth, in bytes
    pub fn map_size(mut self, size: u64) -> Self {
        self.map_size = size;
        self
    }

    /// Maximum number of named databases
    pub fn max_dbs(mut self, dbs: u32) -> Self {
        self.max_dbs = dbs;
        self
    }

    /// Maximum number of concurrent readers
    pub fn max_readers(mut self, readers: u32) -> Self {
        self.max_readers = readers;
        self
    }

    /// Durability mode for commits
    pub fn durability(mut self, mode: DurabilityMode) -> Self {
        self.durability = mode;
        self
    }

    /// Whether to create the store when absent (default true)
    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    /// Fail write-transaction begin with `TxnConflict` instead of blocking
    pub fn writer_nonblocking(mut self, nonblocking: bool) -> Self {
        self.writer_nonblocking = nonblocking;
        self
    }

    /// Open the environment at `path` (a directory)
    pub fn open(self, path: impl AsRef<Path>) -> Result<Environment> {
        let path = path.as_ref();
        if self.create {
            std::fs::create_dir_all(path)?;
        }
        let data_path = path.join("data.vdb");
        let lock_path = path.join("lock.vdb");

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&lock_path)
            .map_err(|e| Error::Io(format!("{}: {e}", lock_path.display())))?;

        let io = MmapBackend::open(&data_path, self.map_size, self.create)?;

        if page_size::get() > PAGE_SIZE {
            tracing::warn!(
                os_page_size = page_size::get(),
                "OS page size exceeds the store page size; partial-page writes \
                 are not torn-write safe on this system"
            );
        }

        let meta = if io.size_in_pages() < 2 {
            if !self.create {
                return Err(Error::Io(format!("{}: not a store", data_path.display())));
            }
            bootstrap_store(&io, self.max_readers, self.max_dbs)?
        } else {
            read_current_meta(&io)?
        };

        let inner = Arc::new(EnvInner {
            path: path.to_path_buf(),
            io,
            lock_file,
            txn_id: AtomicU64::new(meta.last_txnid.0),
            write_lock: Mutex::new(()),
            readers: ReaderTable::new(self.max_readers as usize),
            durability: self.durability,
            max_dbs: self.max_dbs,
            max_readers: self.max_readers,
            writer_nonblocking: self.writer_nonblocking,
        });
        tracing::debug!(path = %path.display(), txn = meta.last_txnid.0, "opened environment");
        Ok(Environment { inner })
    }
}

/// Lay out a fresh store: double meta pair plus the two initial root leaves
fn bootstrap_store(io: &MmapBackend, max_readers: u32, max_dbs: u32) -> Result<MetaRecord> {
    io.grow(4)?;

    let mut free_root = PageBuf::new(FREE_ROOT_PAGE, PageFlags::LEAF);
    checksum::stamp(&mut free_root);
    io.write_page(&free_root)?;

    let mut main_root = PageBuf::new(MAIN_ROOT_PAGE, PageFlags::LEAF);
    checksum::stamp(&mut main_root);
    io.write_page(&main_root)?;

    // Both slots describe the same empty state; the B slot's higher id makes
    // it current and keeps the commit alternation in step.
    let mut meta = MetaRecord::bootstrap(io.map_size(), max_readers, max_dbs);
    let mut page_a = meta.encode(META_PAGE_A);
    checksum::stamp(&mut page_a);
    io.write_page(&page_a)?;

    meta.last_txnid = crate::error::TxnId(1);
    let mut page_b = meta.encode(META_PAGE_B);
    checksum::stamp(&mut page_b);
    io.write_page(&page_b)?;

    io.sync()?;
    tracing::debug!("bootstrapped new store");
    Ok(meta)
}

impl Environment {
    pub(crate) fn inner(&self) -> &EnvInner {
        &self.inner
    }

    /// Begin a read-only transaction
    pub fn begin_txn(&self) -> Result<Transaction<'_, Read>> {
        Transaction::new_read(self)
    }

    /// Begin the read-write transaction
    pub fn begin_write_txn(&self) -> Result<Transaction<'_, Write>> {
        Transaction::new_write(self)
    }

    /// Force a synchronous flush regardless of the durability mode
    pub fn sync(&self) -> Result<()> {
        self.inner.io.sync()
    }

    /// Shape statistics of the main database
    pub fn stat(&self) -> Result<DbStat> {
        let meta = self.inner.current_meta()?;
        Ok(DbStat::from_info(&meta.main_db))
    }

    /// Whole-environment information
    pub fn info(&self) -> Result<EnvInfo> {
        let meta = self.inner.current_meta()?;
        Ok(EnvInfo {
            map_size: self.inner.io.map_size(),
            last_pgno: meta.last_pgno.0,
            last_txnid: meta.last_txnid.0,
            max_readers: self.inner.max_readers,
            num_readers: self.inner.readers.count() as u32,
        })
    }

    /// Copy the environment to `path` as a single-instant snapshot
    pub fn copy_to_path(&self, path: impl AsRef<Path>) -> Result<()> {
        crate::copy::copy_to_path(self, path.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn open_and_stat() {
        let dir = TempDir::new().unwrap();
        let env = EnvBuilder::new().map_size(1 << 24).open(dir.path()).unwrap();
        let stat = env.stat().unwrap();
        assert_eq!(stat.page_size as usize, PAGE_SIZE);
        assert_eq!(stat.entries, 0);
        assert_eq!(stat.depth, 1);
    }

    #[test]
    fn reopen_preserves_meta() {
        let dir = TempDir::new().unwrap();
        {
            let env = EnvBuilder::new().open(dir.path()).unwrap();
            let info = env.info().unwrap();
            assert_eq!(info.last_txnid, 1);
        }
        {
            let env = EnvBuilder::new().open(dir.path()).unwrap();
            assert_eq!(env.info().unwrap().last_txnid, 1);
        }
    }

    #[test]
    fn missing_store_without_create_fails() {
        let dir = TempDir::new().unwrap();
        let result = EnvBuilder::new().create(false).open(dir.path().join("absent"));
        assert!(result.is_err());
    }

    #[test]
    fn nonblocking_writer_conflict() {
        let dir = TempDir::new().unwrap();
        let env = EnvBuilder::new().writer_nonblocking(true).open(dir.path()).unwrap();

        let first = env.begin_write_txn().unwrap();
        let second = env.begin_write_txn();
        assert!(matches!(second, Err(Error::TxnConflict)));
        drop(first);
        assert!(env.begin_write_txn().is_ok());
    }
}
