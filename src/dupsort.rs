//! Sorted duplicate values (DUPSORT)
//!
//! A duplicate-enabled database stores the first value of a key inline.
//! The second value promotes the slot into a nested duplicate tree: a B+tree
//! whose keys are the values (empty payloads), with its own 48-byte root
//! record written into the leaf node under the `DUPTREE` flag. Values sort
//! byte-lexicographically. Because values become nested keys, a duplicate
//! value is limited to the maximum key size.

use crate::btree::{self, PutMode, RawEntry};
use crate::comparator::KeyOrdering;
use crate::error::{Error, PageId, Result};
use crate::meta::DbInfo;
use crate::page::{NodeFlags, PageFlags, PageView, MAX_KEY_SIZE};
use crate::txn::{mode, Transaction, Write};

/// Largest duplicate value: duplicates are keys of the nested tree
pub const MAX_DUP_VALUE: usize = MAX_KEY_SIZE;

/// Duplicate values always sort byte-lexicographically
const DUP_ORD: KeyOrdering = KeyOrdering::Lexicographic;

fn check_dup_value(value: &[u8]) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidParameter("duplicate values must not be empty"));
    }
    if value.len() > MAX_DUP_VALUE {
        return Err(Error::InvalidParameter("duplicate value exceeds maximum size"));
    }
    Ok(())
}

/// Fold nested-tree page-count changes into the owning database's record
fn apply_sub_delta(info: &mut DbInfo, before: &DbInfo, after: &DbInfo) {
    info.leaf_pages = info.leaf_pages + after.leaf_pages - before.leaf_pages;
    info.branch_pages = info.branch_pages + after.branch_pages - before.branch_pages;
    info.overflow_pages = info.overflow_pages + after.overflow_pages - before.overflow_pages;
}

/// First or last value under a nested duplicate tree
fn edge_value<M: mode::Mode>(
    txn: &Transaction<'_, M>,
    sub: &DbInfo,
    last: bool,
) -> Result<Option<Vec<u8>>> {
    let mut cur = sub.root;
    loop {
        let next = {
            let page = txn.get_page(cur)?;
            let n = page.num_keys();
            if page.flags().contains(PageFlags::LEAF) {
                if n == 0 {
                    return Ok(None);
                }
                let index = if last { n - 1 } else { 0 };
                return Ok(Some(page.node(index)?.key().to_vec()));
            }
            let index = if last { n - 1 } else { 0 };
            page.child_at(index)?
        };
        cur = next;
    }
}

/// Insert a duplicate value under `key`.
///
/// `exact_unique` is the no-overwrite contract for duplicate stores: the
/// insert fails with `KeyExists` only when the exact (key, value) pair is
/// already present. Returns whether a new value landed (`false` means the
/// pair already existed and `exact_unique` was off).
pub(crate) fn insert(
    txn: &mut Transaction<'_, Write>,
    info: &mut DbInfo,
    key: &[u8],
    value: &[u8],
    ord: KeyOrdering,
    exact_unique: bool,
    fixed_size: bool,
) -> Result<bool> {
    check_dup_value(value)?;

    let existing = btree::lookup(txn, info.root, key, ord)?;
    match existing {
        None => {
            btree::put_entry(
                txn,
                info,
                key,
                NodeFlags::empty(),
                value,
                value.len() as u32,
                ord,
                PutMode::Upsert,
            )?;
            Ok(true)
        }
        Some(entry) if entry.flags.contains(NodeFlags::DUPTREE) => {
            let mut sub = entry.dup_info()?;
            if fixed_size {
                if let Some(first) = edge_value(txn, &sub, false)? {
                    if first.len() != value.len() {
                        return Err(Error::InvalidParameter(
                            "fixed-size duplicate has the wrong length",
                        ));
                    }
                }
            }
            let before = sub;
            match btree::put_entry(
                txn,
                &mut sub,
                value,
                NodeFlags::empty(),
                b"",
                0,
                DUP_ORD,
                PutMode::NoOverwrite,
            ) {
                Ok(_) => {
                    sub.entries += 1;
                    apply_sub_delta(info, &before, &sub);
                    btree::update_in_place(txn, info, key, &sub.to_bytes(), ord)?;
                    Ok(true)
                }
                Err(Error::KeyExists) => {
                    // The nested descent may have re-rooted the tree through
                    // copy-on-write even though nothing was inserted.
                    apply_sub_delta(info, &before, &sub);
                    btree::update_in_place(txn, info, key, &sub.to_bytes(), ord)?;
                    if exact_unique {
                        Err(Error::KeyExists)
                    } else {
                        Ok(false)
                    }
                }
                Err(e) => Err(e),
            }
        }
        Some(entry) => {
            // Single inline value so far
            let current = entry.stored;
            if current == value {
                if exact_unique {
                    return Err(Error::KeyExists);
                }
                return Ok(false);
            }
            if fixed_size && current.len() != value.len() {
                return Err(Error::InvalidParameter(
                    "fixed-size duplicate has the wrong length",
                ));
            }

            // Promote to a nested duplicate tree
            let root = txn.alloc_page(PageFlags::LEAF)?;
            let mut sub = DbInfo::new_leaf(0, root);
            btree::put_entry(
                txn,
                &mut sub,
                &current,
                NodeFlags::empty(),
                b"",
                0,
                DUP_ORD,
                PutMode::NoOverwrite,
            )?;
            btree::put_entry(
                txn,
                &mut sub,
                value,
                NodeFlags::empty(),
                b"",
                0,
                DUP_ORD,
                PutMode::NoOverwrite,
            )?;
            sub.entries = 2;
            info.leaf_pages += sub.leaf_pages;
            info.branch_pages += sub.branch_pages;
            btree::put_entry(
                txn,
                info,
                key,
                NodeFlags::DUPTREE,
                &sub.to_bytes(),
                DbInfo::SIZE as u32,
                ord,
                PutMode::Upsert,
            )?;
            Ok(true)
        }
    }
}

/// Delete one exact (key, value) pair. Returns whether it existed.
pub(crate) fn delete(
    txn: &mut Transaction<'_, Write>,
    info: &mut DbInfo,
    key: &[u8],
    value: &[u8],
    ord: KeyOrdering,
) -> Result<bool> {
    check_dup_value(value)?;

    let existing = btree::lookup(txn, info.root, key, ord)?;
    match existing {
        None => Ok(false),
        Some(entry) if entry.flags.contains(NodeFlags::DUPTREE) => {
            let mut sub = entry.dup_info()?;
            let before = sub;
            if btree::del_entry(txn, &mut sub, value, DUP_ORD)?.is_none() {
                return Ok(false);
            }
            sub.entries -= 1;
            apply_sub_delta(info, &before, &sub);

            if sub.entries == 1 {
                // Demote: a collapsed single-entry tree is one leaf page
                let remaining = edge_value(txn, &sub, false)?
                    .ok_or_else(|| Error::corrupt("duplicate tree lost its last value", sub.root))?;
                txn.free_page(sub.root);
                info.leaf_pages = info.leaf_pages.saturating_sub(1);
                btree::put_entry(
                    txn,
                    info,
                    key,
                    NodeFlags::empty(),
                    &remaining,
                    remaining.len() as u32,
                    ord,
                    PutMode::Upsert,
                )?;
            } else {
                btree::update_in_place(txn, info, key, &sub.to_bytes(), ord)?;
            }
            Ok(true)
        }
        Some(entry) => {
            if entry.stored == value {
                btree::del_entry(txn, info, key, ord)?;
                Ok(true)
            } else {
                Ok(false)
            }
        }
    }
}

/// All values under a leaf entry, in duplicate order
pub(crate) fn all_values<M: mode::Mode>(
    txn: &Transaction<'_, M>,
    entry: &RawEntry,
) -> Result<Vec<Vec<u8>>> {
    if !entry.flags.contains(NodeFlags::DUPTREE) {
        return Ok(vec![entry.stored.clone()]);
    }
    let sub = entry.dup_info()?;
    let mut out = Vec::with_capacity(sub.entries as usize);
    collect_values(txn, sub.root, &mut out)?;
    Ok(out)
}

fn collect_values<M: mode::Mode>(
    txn: &Transaction<'_, M>,
    pgno: PageId,
    out: &mut Vec<Vec<u8>>,
) -> Result<()> {
    let (is_leaf, children, keys) = {
        let page = txn.get_page(pgno)?;
        let is_leaf = page.flags().contains(PageFlags::LEAF);
        let mut children = Vec::new();
        let mut keys = Vec::new();
        for i in 0..page.num_keys() {
            let node = page.node(i)?;
            if is_leaf {
                keys.push(node.key().to_vec());
            } else {
                children.push(node.child());
            }
        }
        (is_leaf, children, keys)
    };
    if is_leaf {
        out.extend(keys);
    } else {
        for child in children {
            collect_values(txn, child, out)?;
        }
    }
    Ok(())
}

/// Number of values under a leaf entry
pub(crate) fn value_count(entry: &RawEntry) -> Result<u64> {
    if entry.flags.contains(NodeFlags::DUPTREE) {
        Ok(entry.dup_info()?.entries)
    } else {
        Ok(1)
    }
}

/// First value under a leaf entry
pub(crate) fn first_value<M: mode::Mode>(
    txn: &Transaction<'_, M>,
    entry: &RawEntry,
) -> Result<Vec<u8>> {
    if entry.flags.contains(NodeFlags::DUPTREE) {
        let sub = entry.dup_info()?;
        edge_value(txn, &sub, false)?
            .ok_or_else(|| Error::corrupt("empty duplicate tree", sub.root))
    } else {
        Ok(entry.stored.clone())
    }
}
