//! MVCC transactions
//!
//! Read transactions pin a snapshot in the reader table and see a frozen
//! meta record. The single write transaction owns the writer locks, a stack
//! of write frames (one per nesting level) holding dirty pages, freed pages
//! and database records, and the loaded free list. Commit publishes a new
//! meta record as its only atomic step; everything before it is invisible,
//! so abort is simply dropping the working state.

use parking_lot::MutexGuard;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::Ordering;

use crate::checksum;
use crate::comparator::KeyOrdering;
use crate::env::{DurabilityMode, Environment};
use crate::error::{Error, PageId, Result, TxnId};
use crate::freelist::{self, FreeList};
use crate::io;
use crate::meta::{DbInfo, MetaRecord};
use crate::page::{PageBuf, PageFlags, PageRef, PageView};

/// Bound on the freelist-save fixed point; the freed set stops growing long
/// before this in practice because same-transaction pages recycle in memory.
const MAX_FREELIST_PASSES: usize = 16;

/// Transaction mode marker traits
pub mod mode {
    /// Sealed trait for transaction modes
    pub(crate) mod sealed {
        pub trait Sealed {}
    }

    /// Transaction mode trait
    pub trait Mode: sealed::Sealed {
        /// Whether this is a write transaction
        const IS_WRITE: bool;
    }
}

/// Read-only transaction mode
#[derive(Debug)]
pub struct Read;

impl mode::sealed::Sealed for Read {}
impl mode::Mode for Read {
    const IS_WRITE: bool = false;
}

/// Read-write transaction mode
#[derive(Debug)]
pub struct Write;

impl mode::sealed::Sealed for Write {}
impl mode::Mode for Write {
    const IS_WRITE: bool = true;
}

/// Working state of one write nesting level
pub(crate) struct WriteFrame {
    /// Pages modified at this level, keyed by their (new) page number
    pub(crate) dirty: HashMap<PageId, PageBuf>,
    /// Committed pages retired at this level
    pub(crate) freed: BTreeSet<PageId>,
    /// Pages allocated at this level
    pub(crate) allocated: BTreeSet<PageId>,
    /// Database records changed at this level
    databases: HashMap<Option<String>, DbInfo>,
    /// Which of those need catalog write-back
    dirty_dbs: HashSet<Option<String>>,
    /// Databases dropped at this level
    removed_dbs: HashSet<String>,
    /// File-end allocation high-water mark
    next_pgno: u64,
}

impl WriteFrame {
    fn new(next_pgno: u64) -> Self {
        Self {
            dirty: HashMap::new(),
            freed: BTreeSet::new(),
            allocated: BTreeSet::new(),
            databases: HashMap::new(),
            dirty_dbs: HashSet::new(),
            removed_dbs: HashSet::new(),
            next_pgno,
        }
    }
}

/// Mode-specific transaction state
pub(crate) enum ModeData<'env> {
    /// Read transaction: its reader-table slot (`None` after `reset`)
    Read {
        slot: Option<usize>,
    },
    Write(WriteData<'env>),
}

/// Write transaction state
pub(crate) struct WriteData<'env> {
    /// In-process writer exclusivity
    _guard: MutexGuard<'env, ()>,
    /// Write frames, bottom = the transaction itself, above = nested levels
    frames: Vec<WriteFrame>,
    /// Free-page state loaded at begin
    pub(crate) freelist: FreeList,
    /// Free database record (not part of the named-database map)
    free_db: DbInfo,
}

/// A database transaction
pub struct Transaction<'env, M: mode::Mode> {
    pub(crate) env: &'env Environment,
    id: TxnId,
    pub(crate) meta: MetaRecord,
    pub(crate) mode_data: ModeData<'env>,
    _mode: PhantomData<M>,
}

/// Type alias for a read-only transaction
pub type ReadTransaction<'env> = Transaction<'env, Read>;

/// Type alias for a read-write transaction
pub type WriteTransaction<'env> = Transaction<'env, Write>;

impl<'env> Transaction<'env, Read> {
    pub(crate) fn new_read(env: &'env Environment) -> Result<Self> {
        let inner = env.inner();
        let slot = inner.readers.acquire(TxnId(inner.txn_id.load(Ordering::Acquire)))?;

        let meta = match settle_snapshot(env, slot) {
            Ok(meta) => meta,
            Err(e) => {
                inner.readers.release(slot);
                return Err(e);
            }
        };

        Ok(Self {
            env,
            id: meta.last_txnid,
            meta,
            mode_data: ModeData::Read { slot: Some(slot) },
            _mode: PhantomData,
        })
    }

    /// Release the reader slot but keep the transaction for `renew`
    pub fn reset(&mut self) {
        if let ModeData::Read { slot } = &mut self.mode_data {
            if let Some(index) = slot.take() {
                self.env.inner().readers.release(index);
            }
        }
    }

    /// Re-register a reset transaction against the current snapshot
    pub fn renew(&mut self) -> Result<()> {
        if let ModeData::Read { slot } = &self.mode_data {
            if slot.is_some() {
                return Err(Error::InvalidHandle("renew on an active read transaction"));
            }
        }
        let inner = self.env.inner();
        let index = inner.readers.acquire(TxnId(inner.txn_id.load(Ordering::Acquire)))?;
        let meta = match settle_snapshot(self.env, index) {
            Ok(meta) => meta,
            Err(e) => {
                inner.readers.release(index);
                return Err(e);
            }
        };
        self.id = meta.last_txnid;
        self.meta = meta;
        self.mode_data = ModeData::Read { slot: Some(index) };
        Ok(())
    }

    /// Commit the transaction
    pub fn commit(self) -> Result<()> {
        Ok(())
    }
}

/// Pin the current snapshot in a reader slot.
///
/// Registration and the meta read race against a committing writer; loop
/// until the pinned id and the newest meta agree.
fn settle_snapshot(env: &Environment, slot: usize) -> Result<MetaRecord> {
    let inner = env.inner();
    loop {
        let meta = inner.current_meta()?;
        inner.readers.update(slot, meta.last_txnid);
        if inner.txn_id.load(Ordering::Acquire) == meta.last_txnid.0 {
            return Ok(meta);
        }
    }
}

impl<'env> Transaction<'env, Write> {
    pub(crate) fn new_write(env: &'env Environment) -> Result<Self> {
        let inner = env.inner();

        let guard = if inner.writer_nonblocking {
            inner.write_lock.try_lock().ok_or(Error::TxnConflict)?
        } else {
            inner.write_lock.lock()
        };
        io::lock_exclusive(&inner.lock_file, !inner.writer_nonblocking)?;

        let meta = inner.current_meta()?;
        let id = TxnId(meta.last_txnid.0 + 1);
        let mut frame = WriteFrame::new(meta.last_pgno.0 + 1);
        frame.databases.insert(None, meta.main_db);

        let mut txn = Self {
            env,
            id,
            meta,
            mode_data: ModeData::Write(WriteData {
                _guard: guard,
                frames: vec![frame],
                freelist: FreeList::new(),
                free_db: meta.free_db,
            }),
            _mode: PhantomData,
        };
        txn.load_freelist()?;
        tracing::trace!(txn = id.0, "write transaction begun");
        Ok(txn)
    }

    fn write_data(&mut self) -> &mut WriteData<'env> {
        match &mut self.mode_data {
            ModeData::Write(wd) => wd,
            ModeData::Read { .. } => unreachable!("write transaction carries write data"),
        }
    }

    fn write_data_ref(&self) -> &WriteData<'env> {
        match &self.mode_data {
            ModeData::Write(wd) => wd,
            ModeData::Read { .. } => unreachable!("write transaction carries write data"),
        }
    }

    fn top_frame(&mut self) -> &mut WriteFrame {
        self.write_data().frames.last_mut().expect("write transaction has a frame")
    }

    fn top_frame_ref(&self) -> &WriteFrame {
        self.write_data_ref().frames.last().expect("write transaction has a frame")
    }

    /// Current free database record
    pub(crate) fn free_db(&self) -> DbInfo {
        self.write_data_ref().free_db
    }

    pub(crate) fn set_free_db(&mut self, info: DbInfo) {
        self.write_data().free_db = info;
    }

    /// Hand out a page number: reclaimed pages first, then the file end
    pub(crate) fn alloc_pgno(&mut self) -> Result<PageId> {
        if let Some(page) = self.write_data().freelist.alloc() {
            self.top_frame().allocated.insert(page);
            return Ok(page);
        }
        let next = self.top_frame().next_pgno;
        self.env.inner().io.grow(next + 1)?;
        let top = self.top_frame();
        top.next_pgno = next + 1;
        top.allocated.insert(PageId(next));
        Ok(PageId(next))
    }

    /// Allocate a fresh dirty page
    pub(crate) fn alloc_page(&mut self, flags: PageFlags) -> Result<PageId> {
        let pgno = self.alloc_pgno()?;
        let buf = PageBuf::new(pgno, flags | PageFlags::DIRTY);
        self.top_frame().dirty.insert(pgno, buf);
        Ok(pgno)
    }

    /// Allocate `count` consecutive dirty pages, returning the first
    pub(crate) fn alloc_run(&mut self, count: u64, flags: PageFlags) -> Result<PageId> {
        if count == 0 {
            return Err(Error::InvalidParameter("cannot allocate an empty page run"));
        }
        let first = if let Some(first) = self.write_data().freelist.alloc_run(count) {
            for offset in 0..count {
                self.top_frame().allocated.insert(PageId(first.0 + offset));
            }
            first
        } else {
            let next = self.top_frame().next_pgno;
            self.env.inner().io.grow(next + count)?;
            let top = self.top_frame();
            top.next_pgno = next + count;
            for offset in 0..count {
                top.allocated.insert(PageId(next + offset));
            }
            PageId(next)
        };
        for offset in 0..count {
            let pgno = PageId(first.0 + offset);
            let buf = PageBuf::new(pgno, flags | PageFlags::DIRTY);
            self.top_frame().dirty.insert(pgno, buf);
        }
        Ok(first)
    }

    /// Mutable access to a page dirtied in this transaction.
    ///
    /// Inside a nested level, a page dirtied by an outer level is shadowed
    /// into the top frame first so an abort cannot damage the parent.
    pub(crate) fn page_mut(&mut self, id: PageId) -> Result<&mut PageBuf> {
        let wd = self.write_data();
        let top = wd.frames.len() - 1;
        if !wd.frames[top].dirty.contains_key(&id) {
            let mut shadow = None;
            for frame in wd.frames[..top].iter().rev() {
                if let Some(buf) = frame.dirty.get(&id) {
                    shadow = Some(buf.clone());
                    break;
                }
            }
            let buf =
                shadow.ok_or(Error::InvalidHandle("page is not writable in this transaction"))?;
            wd.frames[top].dirty.insert(id, buf);
        }
        Ok(wd.frames[top].dirty.get_mut(&id).expect("page shadowed into top frame"))
    }

    /// Make a page writable under copy-on-write, returning its page number.
    ///
    /// A committed page is copied to a freshly allocated number and the old
    /// number retired; a page already dirty in this transaction keeps its
    /// number. The caller repoints the parent when the number changes.
    pub(crate) fn touch_page(&mut self, id: PageId) -> Result<PageId> {
        let already_dirty =
            self.write_data_ref().frames.iter().any(|f| f.dirty.contains_key(&id));
        if already_dirty {
            self.page_mut(id)?;
            return Ok(id);
        }

        let buf = self.env.inner().io.read_page(id)?;
        checksum::verify(&buf)?;
        let new_id = self.alloc_pgno()?;
        let mut buf = buf;
        buf.set_pgno(new_id);
        buf.insert_flags(PageFlags::DIRTY);
        let top = self.top_frame();
        top.dirty.insert(new_id, buf);
        top.freed.insert(id);
        Ok(new_id)
    }

    /// Retire a page.
    ///
    /// A page allocated at the current level was never visible to anyone and
    /// recycles immediately; anything else waits in the freed set until the
    /// watermark passes it.
    pub(crate) fn free_page(&mut self, id: PageId) {
        let wd = self.write_data();
        let top = wd.frames.len() - 1;
        if wd.frames[top].dirty.remove(&id).is_some() && wd.frames[top].allocated.remove(&id) {
            wd.freelist.push_available(id);
            return;
        }
        wd.frames[top].freed.insert(id);
    }

    /// Begin a nested write transaction
    pub fn begin_nested(&mut self) -> NestedTransaction<'_, 'env> {
        let next_pgno = self.top_frame().next_pgno;
        self.write_data().frames.push(WriteFrame::new(next_pgno));
        NestedTransaction { txn: self, done: false }
    }

    fn merge_nested(&mut self) {
        let wd = self.write_data();
        let child = wd.frames.pop().expect("nested frame present");
        let parent = wd.frames.last_mut().expect("parent frame present");

        parent.dirty.extend(child.dirty);
        for id in child.freed {
            if parent.dirty.remove(&id).is_some() && parent.allocated.remove(&id) {
                wd.freelist.push_available(id);
            } else {
                parent.freed.insert(id);
            }
        }
        parent.allocated.extend(child.allocated);
        parent.databases.extend(child.databases);
        parent.dirty_dbs.extend(child.dirty_dbs);
        parent.removed_dbs.extend(child.removed_dbs);
        parent.next_pgno = child.next_pgno;
    }

    fn discard_nested(&mut self) {
        let wd = self.write_data();
        let child = wd.frames.pop().expect("nested frame present");
        let parent_next = wd.frames.last().expect("parent frame present").next_pgno;
        for id in child.allocated {
            // File-end pages above the parent's high-water mark will simply be
            // handed out again; reclaimed ones go back to the available set.
            if id.0 < parent_next {
                wd.freelist.push_available(id);
            }
        }
    }

    /// Load the free database, reclaim what the watermark allows, and delete
    /// the consumed entries.
    fn load_freelist(&mut self) -> Result<()> {
        let root = self.free_db().root;
        let mut stack = vec![root];
        while let Some(pgno) = stack.pop() {
            let (is_leaf, children, items) = {
                let page = self.get_page(pgno)?;
                let is_leaf = page.flags().contains(PageFlags::LEAF);
                let mut children = Vec::new();
                let mut items = Vec::new();
                for i in 0..page.num_keys() {
                    let node = page.node(i)?;
                    if is_leaf {
                        items.push((node.key().to_vec(), node.stored().to_vec(), node.flags()));
                    } else {
                        children.push(node.child());
                    }
                }
                (is_leaf, children, items)
            };
            if is_leaf {
                for (key, stored, nflags) in items {
                    let value = if nflags.contains(crate::page::NodeFlags::BIGDATA) {
                        crate::overflow::read_run(self, PageId(u64::from_le_bytes(
                            stored.as_slice().try_into().map_err(|_| {
                                Error::corrupt("bad overflow reference in free database", pgno)
                            })?,
                        )))?
                    } else {
                        stored
                    };
                    if let Some((txn, pages)) = freelist::decode_entry(&key, &value) {
                        self.write_data().freelist.load_entry(txn, pages);
                    }
                }
            } else {
                stack.extend(children);
            }
        }

        let watermark = self.env.inner().readers.oldest().unwrap_or(self.id);
        let consumed = self.write_data().freelist.reclaim(watermark);
        for txn in consumed {
            let mut fdb = self.free_db();
            let removed = crate::btree::del_entry(
                self,
                &mut fdb,
                &txn.0.to_be_bytes(),
                KeyOrdering::Lexicographic,
            )?;
            if let Some(old) = removed {
                if old.flags.contains(crate::page::NodeFlags::BIGDATA) {
                    let freed = crate::overflow::free_run(self, old.overflow_root()?)?;
                    fdb.overflow_pages = fdb.overflow_pages.saturating_sub(freed);
                }
            }
            self.set_free_db(fdb);
        }
        Ok(())
    }

    fn commit_write(&mut self) -> Result<()> {
        debug_assert_eq!(
            self.write_data_ref().frames.len(),
            1,
            "nested transactions resolved before commit"
        );

        {
            let top = self.top_frame_ref();
            if top.dirty.is_empty() && top.freed.is_empty() && top.dirty_dbs.is_empty() {
                return Ok(());
            }
        }

        // Write changed named-database records back into the catalog
        let mut names: Vec<String> = self
            .top_frame_ref()
            .dirty_dbs
            .iter()
            .filter_map(|n| n.clone())
            .collect();
        names.sort();
        for name in names {
            if self.top_frame_ref().removed_dbs.contains(&name) {
                continue;
            }
            let info = self.db_info(Some(&name))?;
            let mut main = self.db_info(None)?;
            crate::btree::put_value(
                self,
                &mut main,
                name.as_bytes(),
                &info.to_bytes(),
                KeyOrdering::Lexicographic,
                crate::btree::PutMode::Upsert,
            )?;
            self.top_frame().databases.insert(None, main);
        }

        // Reclaimed pages this transaction never used would be orphaned (their
        // free-database entries were deleted at begin); record them as freed
        // under this transaction's id instead.
        let leftovers = self.write_data().freelist.drain_available();
        self.top_frame().freed.extend(leftovers);

        // Fold this transaction's freed pages into the free database. Saving
        // can itself retire free-database pages, so iterate to a fixed point;
        // each pass removes the previous entry first so an overflow-spilled
        // payload is never double-freed.
        let key = self.id.0.to_be_bytes();
        let mut wrote_entry = false;
        let mut passes = 0;
        loop {
            let snapshot = self.top_frame_ref().freed.clone();
            if snapshot.is_empty() && !wrote_entry {
                break;
            }
            passes += 1;
            if passes > MAX_FREELIST_PASSES {
                return Err(Error::CorruptPage {
                    details: "free-list save did not converge".into(),
                    page: None,
                });
            }
            let payload = freelist::encode_pages(&snapshot);
            let mut fdb = self.free_db();
            if let Some(old) =
                crate::btree::del_entry(self, &mut fdb, &key, KeyOrdering::Lexicographic)?
            {
                if old.flags.contains(crate::page::NodeFlags::BIGDATA) {
                    let freed = crate::overflow::free_run(self, old.overflow_root()?)?;
                    fdb.overflow_pages = fdb.overflow_pages.saturating_sub(freed);
                }
            }
            crate::btree::put_value(
                self,
                &mut fdb,
                &key,
                &payload,
                KeyOrdering::Lexicographic,
                crate::btree::PutMode::Upsert,
            )?;
            self.set_free_db(fdb);
            wrote_entry = true;
            if self.top_frame_ref().freed == snapshot {
                break;
            }
        }

        // Flush dirty pages, checksummed, before the meta switch
        let env = self.env;
        let mut ids: Vec<PageId> = self.top_frame_ref().dirty.keys().copied().collect();
        ids.sort();
        let dirty_count = ids.len();
        for id in ids {
            let buf = self
                .top_frame()
                .dirty
                .get_mut(&id)
                .expect("dirty page present");
            checksum::stamp(buf);
            env.inner().io.write_page(buf)?;
        }

        match env.inner().durability {
            DurabilityMode::FullSync | DurabilityMode::SyncData => env.inner().io.sync()?,
            DurabilityMode::AsyncFlush => env.inner().io.sync_async()?,
            DurabilityMode::WriteBack => {}
        }

        // The one atomic step: publish the new meta record
        let mut meta = self.meta;
        meta.last_txnid = self.id;
        meta.last_pgno = PageId((self.top_frame_ref().next_pgno - 1).max(self.meta.last_pgno.0));
        meta.main_db = self.db_info(None)?;
        meta.free_db = self.free_db();
        let mut meta_page = meta.encode(MetaRecord::slot_for(self.id));
        checksum::stamp(&mut meta_page);
        env.inner().io.write_page(&meta_page)?;

        if env.inner().durability == DurabilityMode::FullSync {
            env.inner().io.sync_meta()?;
        }

        env.inner().txn_id.store(self.id.0, Ordering::Release);
        tracing::debug!(txn = self.id.0, pages = dirty_count, "commit published");
        Ok(())
    }

    /// Drop a named database from the transaction's view
    pub(crate) fn remove_db_info(&mut self, name: &str) {
        let top = self.top_frame();
        top.databases.remove(&Some(name.to_string()));
        top.dirty_dbs.remove(&Some(name.to_string()));
        top.removed_dbs.insert(name.to_string());
    }

    /// Commit the transaction
    pub fn commit(mut self) -> Result<()> {
        self.commit_write()
    }
}

impl<'env, M: mode::Mode> Transaction<'env, M> {
    /// The transaction's snapshot id (readers) or own id (writers)
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Read a page visible to this transaction
    pub(crate) fn get_page(&self, id: PageId) -> Result<PageRef<'_>> {
        if let ModeData::Write(wd) = &self.mode_data {
            for frame in wd.frames.iter().rev() {
                if let Some(buf) = frame.dirty.get(&id) {
                    return PageRef::new(buf.bytes());
                }
            }
        }
        if let ModeData::Read { slot: None } = &self.mode_data {
            return Err(Error::InvalidHandle("transaction was reset"));
        }
        let bytes = unsafe { self.env.inner().io.page_ref(id)? };
        PageRef::new(bytes)
    }

    /// Resolve a database record by name.
    ///
    /// Consults the write frames first, then the main database's catalog
    /// under this transaction's snapshot.
    pub(crate) fn db_info(&self, name: Option<&str>) -> Result<DbInfo> {
        if let ModeData::Write(wd) = &self.mode_data {
            let key = name.map(String::from);
            for frame in wd.frames.iter().rev() {
                if let Some(n) = name {
                    if frame.removed_dbs.contains(n) {
                        return Err(Error::NotFound);
                    }
                }
                if let Some(info) = frame.databases.get(&key) {
                    return Ok(*info);
                }
            }
        }
        match name {
            None => Ok(self.meta.main_db),
            Some(n) => {
                let main = self.db_info(None)?;
                let entry = crate::btree::lookup(
                    self,
                    main.root,
                    n.as_bytes(),
                    KeyOrdering::Lexicographic,
                )?
                .ok_or(Error::NotFound)?;
                if !entry.flags.is_empty() || entry.stored.len() != DbInfo::SIZE {
                    return Err(Error::IncompatibleOptions("entry is not a named database"));
                }
                DbInfo::read_from(&entry.stored)
            }
        }
    }

    /// Record a database's current state in the transaction (write only)
    pub(crate) fn update_db_info(&mut self, name: Option<&str>, info: DbInfo) -> Result<()> {
        match &mut self.mode_data {
            ModeData::Write(wd) => {
                let top = wd.frames.last_mut().expect("write transaction has a frame");
                let key = name.map(String::from);
                if let Some(n) = name {
                    top.removed_dbs.remove(n);
                }
                top.databases.insert(key.clone(), info);
                top.dirty_dbs.insert(key);
                Ok(())
            }
            ModeData::Read { .. } => {
                Err(Error::InvalidHandle("cannot update a database in a read transaction"))
            }
        }
    }

    /// Abort the transaction, discarding all work
    pub fn abort(self) {
        // All working state unwinds on drop
    }
}

impl<'env, M: mode::Mode> Drop for Transaction<'env, M> {
    fn drop(&mut self) {
        let inner = self.env.inner();
        match &mut self.mode_data {
            ModeData::Read { slot } => {
                if let Some(index) = slot.take() {
                    inner.readers.release(index);
                }
            }
            ModeData::Write(_) => {
                io::unlock(&inner.lock_file);
            }
        }
    }
}

/// A nested write transaction.
///
/// Dereferences to the parent transaction, so every read and write operation
/// works unchanged; the borrow keeps the parent untouchable until the child
/// commits or aborts.
pub struct NestedTransaction<'parent, 'env> {
    txn: &'parent mut Transaction<'env, Write>,
    done: bool,
}

impl<'parent, 'env> Deref for NestedTransaction<'parent, 'env> {
    type Target = Transaction<'env, Write>;

    fn deref(&self) -> &Self::Target {
        self.txn
    }
}

impl<'parent, 'env> DerefMut for NestedTransaction<'parent, 'env> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.txn
    }
}

impl<'parent, 'env> NestedTransaction<'parent, 'env> {
    /// Merge this level's changes into the parent
    pub fn commit(mut self) {
        self.done = true;
        self.txn.merge_nested();
    }

    /// Discard this level's changes
    pub fn abort(mut self) {
        self.done = true;
        self.txn.discard_nested();
    }
}

impl<'parent, 'env> Drop for NestedTransaction<'parent, 'env> {
    fn drop(&mut self) {
        if !self.done {
            self.txn.discard_nested();
        }
    }
}
