//! Database handles and the named-database catalog
//!
//! A database is a named B+tree root recorded in the meta page (main and
//! free databases) or as a 48-byte record in the main database's catalog
//! (named databases). Flags are fixed at creation; reopening with
//! contradicting flags fails. Key and value types are opaque byte sequences;
//! the `Key`/`Value` traits provide the documented conveniences (UTF-8
//! strings, little-endian fixed-width integers).

use crate::btree::{self, PutMode, PutOutcome};
use crate::comparator::KeyOrdering;
use crate::cursor::{Cursor, RangeIter, WriteCursor};
use crate::dupsort;
use crate::env::Environment;
use crate::error::{Error, Result};
use crate::meta::{DbInfo, DbStat};
use crate::page::{NodeFlags, PageFlags, MAX_INLINE_VALUE};
use crate::txn::{mode::Mode, Transaction, Write};
use bitflags::bitflags;
use std::marker::PhantomData;
use std::ops::Bound;

bitflags! {
    /// Database configuration flags, fixed at creation time
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DatabaseFlags: u32 {
        /// Keys compare byte-reversed (descending)
        const REVERSE_KEY = 0x02;
        /// Multiple sorted values per key
        const DUP_SORT = 0x04;
        /// Keys are fixed-width little-endian integers
        const INTEGER_KEY = 0x08;
        /// With `DUP_SORT`, all values of a key have one fixed size
        const DUP_FIXED = 0x10;
        /// Create the database if it does not exist
        const CREATE = 0x40000;
    }
}

bitflags! {
    /// Per-write operation flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WriteFlags: u32 {
        /// Fail with `KeyExists` instead of replacing; for duplicate stores
        /// the check is against the exact (key, value) pair
        const NO_OVERWRITE = 0x10;
        /// Replace the entry at the cursor position (cursor put only)
        const CURRENT = 0x40;
        /// Reserve space and let the caller fill the value in place
        const RESERVE = 0x10000;
        /// Keys arrive in ascending order; fail with `OutOfOrder` otherwise
        const APPEND = 0x20000;
        /// Bulk put of fixed-size duplicate values
        const MULTIPLE = 0x80000;
    }
}

/// Flag bits that describe the tree shape and must match on reopen
fn shape_bits(flags: DatabaseFlags) -> u32 {
    (flags & (DatabaseFlags::REVERSE_KEY
        | DatabaseFlags::DUP_SORT
        | DatabaseFlags::INTEGER_KEY
        | DatabaseFlags::DUP_FIXED))
        .bits()
}

/// Key encoding
pub trait Key: Send + Sync {
    /// Encode the key to bytes
    fn encode(&self) -> Result<Vec<u8>>;
}

/// Value encoding and decoding
pub trait Value: Send + Sync {
    /// Encode the value to bytes
    fn encode(&self) -> Result<Vec<u8>>;
    /// Decode the value from bytes
    fn decode(bytes: &[u8]) -> Result<Self>
    where
        Self: Sized;
}

impl Key for &[u8] {
    fn encode(&self) -> Result<Vec<u8>> {
        Ok(self.to_vec())
    }
}

impl Key for Vec<u8> {
    fn encode(&self) -> Result<Vec<u8>> {
        Ok(self.clone())
    }
}

impl Key for &str {
    fn encode(&self) -> Result<Vec<u8>> {
        Ok(self.as_bytes().to_vec())
    }
}

impl Key for String {
    fn encode(&self) -> Result<Vec<u8>> {
        Ok(self.as_bytes().to_vec())
    }
}

impl Key for u32 {
    fn encode(&self) -> Result<Vec<u8>> {
        Ok(self.to_le_bytes().to_vec())
    }
}

impl Key for u64 {
    fn encode(&self) -> Result<Vec<u8>> {
        Ok(self.to_le_bytes().to_vec())
    }
}

impl Value for Vec<u8> {
    fn encode(&self) -> Result<Vec<u8>> {
        Ok(self.clone())
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bytes.to_vec())
    }
}

impl Value for String {
    fn encode(&self) -> Result<Vec<u8>> {
        Ok(self.as_bytes().to_vec())
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::InvalidParameter("value is not valid UTF-8"))
    }
}

impl Value for u32 {
    fn encode(&self) -> Result<Vec<u8>> {
        Ok(self.to_le_bytes().to_vec())
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; 4] =
            bytes.try_into().map_err(|_| Error::InvalidParameter("expected 4 value bytes"))?;
        Ok(u32::from_le_bytes(bytes))
    }
}

impl Value for u64 {
    fn encode(&self) -> Result<Vec<u8>> {
        Ok(self.to_le_bytes().to_vec())
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; 8] =
            bytes.try_into().map_err(|_| Error::InvalidParameter("expected 8 value bytes"))?;
        Ok(u64::from_le_bytes(bytes))
    }
}

/// Handle to one database (the unnamed main database or a named one)
pub struct Database<K = Vec<u8>, V = Vec<u8>> {
    name: Option<String>,
    flags: DatabaseFlags,
    _marker: PhantomData<(K, V)>,
}

impl<K, V> Clone for Database<K, V> {
    fn clone(&self) -> Self {
        Self { name: self.name.clone(), flags: self.flags, _marker: PhantomData }
    }
}

/// Write a raw pair into a database, honoring the write flags.
///
/// Shared by the typed handle and the write cursor.
pub(crate) fn put_raw(
    txn: &mut Transaction<'_, Write>,
    name: Option<&str>,
    key: &[u8],
    value: &[u8],
    flags: WriteFlags,
) -> Result<()> {
    if flags.contains(WriteFlags::RESERVE) {
        return Err(Error::InvalidParameter("use reserve() for in-place values"));
    }
    if flags.contains(WriteFlags::CURRENT) {
        return Err(Error::InvalidParameter("use a cursor for positional replace"));
    }
    if flags.contains(WriteFlags::MULTIPLE) {
        return Err(Error::InvalidParameter("use put_multiple() for bulk values"));
    }

    let mut info = txn.db_info(name)?;
    let db_flags = DatabaseFlags::from_bits_truncate(info.flags);
    let ord = KeyOrdering::from_flags(db_flags);
    let dup = db_flags.contains(DatabaseFlags::DUP_SORT);

    if flags.contains(WriteFlags::APPEND) {
        // Duplicate stores keep values nestable as keys
        if dup && value.len() > dupsort::MAX_DUP_VALUE {
            return Err(Error::InvalidParameter("duplicate value exceeds maximum size"));
        }
        if value.len() <= MAX_INLINE_VALUE {
            btree::append_entry(
                txn,
                &mut info,
                key,
                NodeFlags::empty(),
                value,
                value.len() as u32,
                ord,
            )?;
        } else {
            let first = crate::overflow::write_run(txn, value)?;
            let run = crate::overflow::run_pages(value.len());
            match btree::append_entry(
                txn,
                &mut info,
                key,
                NodeFlags::BIGDATA,
                &first.0.to_le_bytes(),
                value.len() as u32,
                ord,
            ) {
                Ok(()) => info.overflow_pages += run,
                Err(e) => {
                    for offset in 0..run {
                        txn.free_page(crate::error::PageId(first.0 + offset));
                    }
                    return Err(e);
                }
            }
        }
        info.entries += 1;
        return txn.update_db_info(name, info);
    }

    if dup {
        let inserted = dupsort::insert(
            txn,
            &mut info,
            key,
            value,
            ord,
            flags.contains(WriteFlags::NO_OVERWRITE),
            db_flags.contains(DatabaseFlags::DUP_FIXED),
        )?;
        if inserted {
            info.entries += 1;
        }
    } else {
        let mode = if flags.contains(WriteFlags::NO_OVERWRITE) {
            PutMode::NoOverwrite
        } else {
            PutMode::Upsert
        };
        if let PutOutcome::Inserted = btree::put_value(txn, &mut info, key, value, ord, mode)? {
            info.entries += 1;
        }
    }
    txn.update_db_info(name, info)
}

/// Delete a key (value `None`) or one exact (key, value) pair from a
/// database. Returns whether anything was removed.
pub(crate) fn del_raw(
    txn: &mut Transaction<'_, Write>,
    name: Option<&str>,
    key: &[u8],
    value: Option<&[u8]>,
) -> Result<bool> {
    let mut info = txn.db_info(name)?;
    let db_flags = DatabaseFlags::from_bits_truncate(info.flags);
    let ord = KeyOrdering::from_flags(db_flags);
    let dup = db_flags.contains(DatabaseFlags::DUP_SORT);

    let removed = match value {
        Some(v) if dup => {
            let removed = dupsort::delete(txn, &mut info, key, v, ord)?;
            if removed {
                info.entries = info.entries.saturating_sub(1);
            }
            removed
        }
        Some(v) => match btree::lookup(txn, info.root, key, ord)? {
            Some(entry) => {
                if btree::resolve_value(txn, &entry)? == v {
                    remove_whole_key(txn, &mut info, key, ord)?
                } else {
                    false
                }
            }
            None => false,
        },
        None => remove_whole_key(txn, &mut info, key, ord)?,
    };

    txn.update_db_info(name, info)?;
    Ok(removed)
}

/// Delete a key and everything it holds (duplicates, overflow runs)
fn remove_whole_key(
    txn: &mut Transaction<'_, Write>,
    info: &mut DbInfo,
    key: &[u8],
    ord: KeyOrdering,
) -> Result<bool> {
    let Some(old) = btree::del_entry(txn, info, key, ord)? else {
        return Ok(false);
    };
    if old.flags.contains(NodeFlags::BIGDATA) {
        let freed = crate::overflow::free_run(txn, old.overflow_root()?)?;
        info.overflow_pages = info.overflow_pages.saturating_sub(freed);
        info.entries = info.entries.saturating_sub(1);
    } else if old.flags.contains(NodeFlags::DUPTREE) {
        let sub = old.dup_info()?;
        btree::free_tree(txn, sub.root)?;
        info.leaf_pages = info.leaf_pages.saturating_sub(sub.leaf_pages);
        info.branch_pages = info.branch_pages.saturating_sub(sub.branch_pages);
        info.overflow_pages = info.overflow_pages.saturating_sub(sub.overflow_pages);
        info.entries = info.entries.saturating_sub(sub.entries);
    } else {
        info.entries = info.entries.saturating_sub(1);
    }
    Ok(true)
}

impl<K: Key, V: Value> Database<K, V> {
    pub(crate) fn new(name: Option<&str>, flags: DatabaseFlags) -> Self {
        Self { name: name.map(String::from), flags, _marker: PhantomData }
    }

    /// The database name (`None` for the main database)
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The database's creation flags
    pub fn flags(&self) -> DatabaseFlags {
        self.flags
    }

    fn dup_enabled(&self) -> bool {
        self.flags.contains(DatabaseFlags::DUP_SORT)
    }

    fn ord(&self) -> KeyOrdering {
        KeyOrdering::from_flags(self.flags)
    }

    /// Get the value of a key (the first value under duplicate mode)
    pub fn get<M: Mode>(&self, txn: &Transaction<'_, M>, key: &K) -> Result<Option<V>> {
        let key_bytes = key.encode()?;
        let info = txn.db_info(self.name.as_deref())?;
        match btree::lookup(txn, info.root, &key_bytes, self.ord())? {
            Some(entry) => {
                let bytes = if self.dup_enabled() {
                    dupsort::first_value(txn, &entry)?
                } else {
                    btree::resolve_value(txn, &entry)?
                };
                Ok(Some(V::decode(&bytes)?))
            }
            None => Ok(None),
        }
    }

    /// All values of a key, in duplicate order
    pub fn get_values<M: Mode>(&self, txn: &Transaction<'_, M>, key: &K) -> Result<Vec<V>> {
        let key_bytes = key.encode()?;
        let info = txn.db_info(self.name.as_deref())?;
        match btree::lookup(txn, info.root, &key_bytes, self.ord())? {
            Some(entry) => {
                let raw = if self.dup_enabled() {
                    dupsort::all_values(txn, &entry)?
                } else {
                    vec![btree::resolve_value(txn, &entry)?]
                };
                raw.iter().map(|bytes| V::decode(bytes)).collect()
            }
            None => Ok(Vec::new()),
        }
    }

    /// Insert or replace a pair
    pub fn put(&self, txn: &mut Transaction<'_, Write>, key: &K, value: &V) -> Result<()> {
        self.put_with_flags(txn, key, value, WriteFlags::empty())
    }

    /// Insert a pair under explicit write flags
    pub fn put_with_flags(
        &self,
        txn: &mut Transaction<'_, Write>,
        key: &K,
        value: &V,
        flags: WriteFlags,
    ) -> Result<()> {
        let key_bytes = key.encode()?;
        let value_bytes = value.encode()?;
        put_raw(txn, self.name.as_deref(), &key_bytes, &value_bytes, flags)
    }

    /// Reserve `len` bytes under `key` and return the slice to fill.
    ///
    /// Limited to inline-sized values; not available under duplicate mode.
    pub fn reserve<'t>(
        &self,
        txn: &'t mut Transaction<'_, Write>,
        key: &K,
        len: usize,
    ) -> Result<&'t mut [u8]> {
        if self.dup_enabled() {
            return Err(Error::IncompatibleOptions("reserve with duplicate values"));
        }
        if len > MAX_INLINE_VALUE {
            return Err(Error::InvalidParameter("reserve is limited to inline-sized values"));
        }
        let key_bytes = key.encode()?;
        let mut info = txn.db_info(self.name.as_deref())?;
        let zeros = vec![0u8; len];
        if let PutOutcome::Inserted =
            btree::put_value(txn, &mut info, &key_bytes, &zeros, self.ord(), PutMode::Upsert)?
        {
            info.entries += 1;
        }
        txn.update_db_info(self.name.as_deref(), info)?;

        let (leaf, index) = btree::locate_leaf(txn, info.root, &key_bytes, self.ord())?;
        txn.page_mut(leaf)?.value_mut(index)
    }

    /// Bulk insert of fixed-size duplicate values; returns how many landed
    pub fn put_multiple(
        &self,
        txn: &mut Transaction<'_, Write>,
        key: &K,
        values: &[&[u8]],
    ) -> Result<usize> {
        if !self.flags.contains(DatabaseFlags::DUP_SORT)
            || !self.flags.contains(DatabaseFlags::DUP_FIXED)
        {
            return Err(Error::IncompatibleOptions(
                "bulk put needs fixed-size duplicate mode",
            ));
        }
        let key_bytes = key.encode()?;
        let mut landed = 0;
        for value in values {
            let mut info = txn.db_info(self.name.as_deref())?;
            if dupsort::insert(txn, &mut info, &key_bytes, value, self.ord(), false, true)? {
                info.entries += 1;
                landed += 1;
            }
            txn.update_db_info(self.name.as_deref(), info)?;
        }
        Ok(landed)
    }

    /// Delete a key and all its values. Returns whether the key existed.
    pub fn delete(&self, txn: &mut Transaction<'_, Write>, key: &K) -> Result<bool> {
        let key_bytes = key.encode()?;
        del_raw(txn, self.name.as_deref(), &key_bytes, None)
    }

    /// Delete one exact (key, value) pair. Returns whether it existed.
    pub fn delete_value(
        &self,
        txn: &mut Transaction<'_, Write>,
        key: &K,
        value: &V,
    ) -> Result<bool> {
        let key_bytes = key.encode()?;
        let value_bytes = value.encode()?;
        del_raw(txn, self.name.as_deref(), &key_bytes, Some(&value_bytes))
    }

    /// Drop every entry, keeping the database itself
    pub fn clear(&self, txn: &mut Transaction<'_, Write>) -> Result<()> {
        let info = txn.db_info(self.name.as_deref())?;
        btree::free_tree(txn, info.root)?;
        let root = txn.alloc_page(PageFlags::LEAF)?;
        let fresh = DbInfo::new_leaf(info.flags, root);
        txn.update_db_info(self.name.as_deref(), fresh)
    }

    /// Shape statistics
    pub fn stat<M: Mode>(&self, txn: &Transaction<'_, M>) -> Result<DbStat> {
        Ok(DbStat::from_info(&txn.db_info(self.name.as_deref())?))
    }

    /// Number of entries (duplicate values counted individually)
    pub fn len<M: Mode>(&self, txn: &Transaction<'_, M>) -> Result<u64> {
        Ok(txn.db_info(self.name.as_deref())?.entries)
    }

    /// Whether the database holds no entries
    pub fn is_empty<M: Mode>(&self, txn: &Transaction<'_, M>) -> Result<bool> {
        Ok(self.len(txn)? == 0)
    }

    /// Open a read cursor
    pub fn cursor<'txn, 'env, M: Mode>(
        &self,
        txn: &'txn Transaction<'env, M>,
    ) -> Result<Cursor<'txn, 'env, M>> {
        let info = txn.db_info(self.name.as_deref())?;
        Ok(Cursor::new(txn, self.name.as_deref(), info, self.flags))
    }

    /// Open a write cursor
    pub fn cursor_mut<'txn, 'env>(
        &self,
        txn: &'txn mut Transaction<'env, Write>,
    ) -> Result<WriteCursor<'txn, 'env>> {
        let info = txn.db_info(self.name.as_deref())?;
        Ok(WriteCursor::new(txn, self.name.as_deref(), info, self.flags))
    }

    /// Lazy ordered range scan between two key bounds
    pub fn range<'txn, 'env, M: Mode>(
        &self,
        txn: &'txn Transaction<'env, M>,
        start: Bound<Vec<u8>>,
        end: Bound<Vec<u8>>,
        reverse: bool,
    ) -> Result<RangeIter<'txn, 'env, M>> {
        Ok(RangeIter::new(self.cursor(txn)?, start, end, reverse))
    }
}

impl Environment {
    /// Open a database, creating it when `CREATE` is set
    pub fn create_database<K: Key, V: Value>(
        &self,
        txn: &mut Transaction<'_, Write>,
        name: Option<&str>,
        flags: DatabaseFlags,
    ) -> Result<Database<K, V>> {
        let requested = flags & !DatabaseFlags::CREATE;

        let Some(db_name) = name else {
            let mut info = txn.db_info(None)?;
            if !requested.is_empty() && shape_bits(requested) != info.flags {
                if info.entries == 0 && info.flags == 0 {
                    // The main database adopts its shape on first use
                    info.flags = shape_bits(requested);
                    txn.update_db_info(None, info)?;
                } else {
                    return Err(Error::IncompatibleOptions(
                        "main database has different flags",
                    ));
                }
            }
            return Ok(Database::new(None, DatabaseFlags::from_bits_truncate(info.flags)));
        };

        match txn.db_info(Some(db_name)) {
            Ok(info) => {
                if !requested.is_empty() && shape_bits(requested) != info.flags {
                    return Err(Error::IncompatibleOptions(
                        "database exists with different flags",
                    ));
                }
                Ok(Database::new(Some(db_name), DatabaseFlags::from_bits_truncate(info.flags)))
            }
            Err(Error::NotFound) => {
                if !flags.contains(DatabaseFlags::CREATE) {
                    return Err(Error::NotFound);
                }
                if self.list_databases(txn)?.len() as u32 >= self.inner().max_dbs {
                    return Err(Error::DbsFull);
                }
                let root = txn.alloc_page(PageFlags::LEAF)?;
                let info = DbInfo::new_leaf(shape_bits(requested), root);

                let mut main = txn.db_info(None)?;
                btree::put_entry(
                    txn,
                    &mut main,
                    db_name.as_bytes(),
                    NodeFlags::empty(),
                    &info.to_bytes(),
                    DbInfo::SIZE as u32,
                    KeyOrdering::Lexicographic,
                    PutMode::NoOverwrite,
                )?;
                main.entries += 1;
                txn.update_db_info(None, main)?;
                txn.update_db_info(Some(db_name), info)?;
                tracing::debug!(name = db_name, "created database");
                Ok(Database::new(Some(db_name), DatabaseFlags::from_bits_truncate(info.flags)))
            }
            Err(e) => Err(e),
        }
    }

    /// Open an existing database
    pub fn open_database<K: Key, V: Value, M: Mode>(
        &self,
        txn: &Transaction<'_, M>,
        name: Option<&str>,
        flags: DatabaseFlags,
    ) -> Result<Database<K, V>> {
        let requested = flags & !DatabaseFlags::CREATE;
        let info = txn.db_info(name)?;
        if !requested.is_empty() && shape_bits(requested) != info.flags {
            return Err(Error::IncompatibleOptions("database exists with different flags"));
        }
        Ok(Database::new(name, DatabaseFlags::from_bits_truncate(info.flags)))
    }

    /// Names of all databases in the catalog
    pub fn list_databases<M: Mode>(&self, txn: &Transaction<'_, M>) -> Result<Vec<String>> {
        let main = txn.db_info(None)?;
        let db: Database = Database::new(None, DatabaseFlags::from_bits_truncate(main.flags));
        let mut cursor = db.cursor(txn)?;
        let mut names = Vec::new();
        while let Some((key, value)) = cursor.next()? {
            if value.len() == DbInfo::SIZE && DbInfo::read_from(&value).is_ok() {
                if let Ok(name) = String::from_utf8(key) {
                    names.push(name);
                }
            }
        }
        Ok(names)
    }

    /// Delete a named database and everything in it
    pub fn drop_database(&self, txn: &mut Transaction<'_, Write>, name: &str) -> Result<()> {
        let info = txn.db_info(Some(name))?;
        btree::free_tree(txn, info.root)?;

        let mut main = txn.db_info(None)?;
        if btree::del_entry(txn, &mut main, name.as_bytes(), KeyOrdering::Lexicographic)?
            .is_some()
        {
            main.entries = main.entries.saturating_sub(1);
        }
        txn.update_db_info(None, main)?;
        txn.remove_db_info(name);
        tracing::debug!(name, "dropped database");
        Ok(())
    }
}
