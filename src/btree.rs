//! B+tree operations
//!
//! All mutations run under copy-on-write: the descent touches every page on
//! the path (copying committed pages to fresh page numbers and repointing
//! the parent), so the committed tree stays intact for concurrent readers
//! until the meta switch. Splits pick a byte-balanced median and promote the
//! separator; deletion unlinks emptied nodes and collapses single-child
//! roots, so no empty non-root node ever persists.
//!
//! This module moves structure only. Entry counts and the inline/overflow
//! decision belong to the callers (`db`, `dupsort`, freelist save), which
//! also own the cleanup of replaced values.

use crate::comparator::KeyOrdering;
use crate::error::{Error, PageId, Result};
use crate::meta::DbInfo;
use crate::overflow;
use crate::page::{
    entry_cost, split_index, NodeEntry, NodeFlags, PageFlags, PageView, HEADER_SIZE,
    MAX_INLINE_VALUE, MAX_KEY_SIZE, PAGE_SIZE,
};
use crate::txn::{mode, Transaction, Write};

/// Depth guard against cyclic page graphs
pub(crate) const MAX_DEPTH: usize = 64;

/// An entry as it sits on a leaf: node flags, declared value size, stored bytes
#[derive(Debug, Clone)]
pub(crate) struct RawEntry {
    pub flags: NodeFlags,
    pub vsize: u32,
    pub stored: Vec<u8>,
}

impl RawEntry {
    /// First page of the overflow run this entry points at
    pub fn overflow_root(&self) -> Result<PageId> {
        let bytes: [u8; 8] = self
            .stored
            .as_slice()
            .try_into()
            .map_err(|_| Error::InvalidParameter("overflow reference must be 8 bytes"))?;
        Ok(PageId(u64::from_le_bytes(bytes)))
    }

    /// Root record of the nested duplicate tree this entry holds
    pub fn dup_info(&self) -> Result<DbInfo> {
        DbInfo::read_from(&self.stored)
    }
}

/// How a put treats an existing key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PutMode {
    /// Fail with `KeyExists` when the key is present
    NoOverwrite,
    /// Replace the existing entry
    Upsert,
}

/// What a put did
#[derive(Debug)]
pub(crate) enum PutOutcome {
    /// A new entry was added
    Inserted,
    /// An existing entry was replaced; the old entry is returned for cleanup
    Replaced(RawEntry),
}

fn check_key(key: &[u8], ord: KeyOrdering) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidParameter("keys must not be empty"));
    }
    if key.len() > MAX_KEY_SIZE {
        return Err(Error::InvalidParameter("key exceeds maximum key size"));
    }
    if !ord.valid_key(key) {
        return Err(Error::InvalidParameter("integer keys must be 4 or 8 bytes"));
    }
    Ok(())
}

fn read_entry<M: mode::Mode>(
    txn: &Transaction<'_, M>,
    page_id: PageId,
    index: usize,
) -> Result<RawEntry> {
    let page = txn.get_page(page_id)?;
    let node = page.node(index)?;
    Ok(RawEntry { flags: node.flags(), vsize: node.vsize(), stored: node.stored().to_vec() })
}

fn must_insert(
    txn: &mut Transaction<'_, Write>,
    page_id: PageId,
    index: usize,
    entry: &NodeEntry,
) -> Result<()> {
    if txn.page_mut(page_id)?.try_insert_entry(index, entry)? {
        Ok(())
    } else {
        Err(Error::corrupt("entry does not fit after split", page_id))
    }
}

/// Point lookup under the transaction's snapshot
pub(crate) fn lookup<M: mode::Mode>(
    txn: &Transaction<'_, M>,
    root: PageId,
    key: &[u8],
    ord: KeyOrdering,
) -> Result<Option<RawEntry>> {
    let mut cur = root;
    for _ in 0..MAX_DEPTH {
        let next = {
            let page = txn.get_page(cur)?;
            if page.flags().contains(PageFlags::LEAF) {
                return match page.search(key, ord)? {
                    crate::page::SearchResult::Found { index } => {
                        let node = page.node(index)?;
                        Ok(Some(RawEntry {
                            flags: node.flags(),
                            vsize: node.vsize(),
                            stored: node.stored().to_vec(),
                        }))
                    }
                    crate::page::SearchResult::NotFound { .. } => Ok(None),
                };
            }
            page.branch_child(key, ord)?.1
        };
        cur = next;
    }
    Err(Error::corrupt("tree deeper than the depth bound", cur))
}

/// Resolve an entry's bytes, following an overflow reference if needed
pub(crate) fn resolve_value<M: mode::Mode>(
    txn: &Transaction<'_, M>,
    entry: &RawEntry,
) -> Result<Vec<u8>> {
    if entry.flags.contains(NodeFlags::DUPTREE) {
        return Err(Error::IncompatibleOptions("entry holds a duplicate tree"));
    }
    if entry.flags.contains(NodeFlags::BIGDATA) {
        overflow::read_run(txn, entry.overflow_root()?)
    } else {
        Ok(entry.stored.clone())
    }
}

/// A copy-on-write descent: the branch path (page, taken index) and the leaf
struct Descent {
    path: Vec<(PageId, usize)>,
    leaf: PageId,
}

fn descend_mut(
    txn: &mut Transaction<'_, Write>,
    info: &mut DbInfo,
    key: &[u8],
    ord: KeyOrdering,
) -> Result<Descent> {
    let mut cur = txn.touch_page(info.root)?;
    info.root = cur;
    let mut path = Vec::new();
    for _ in 0..MAX_DEPTH {
        let step = {
            let page = txn.get_page(cur)?;
            if page.flags().contains(PageFlags::LEAF) {
                None
            } else {
                Some(page.branch_child(key, ord)?)
            }
        };
        let (idx, child) = match step {
            None => return Ok(Descent { path, leaf: cur }),
            Some(found) => found,
        };
        let new_child = txn.touch_page(child)?;
        if new_child != child {
            txn.page_mut(cur)?.patch_value(idx, &new_child.0.to_le_bytes())?;
        }
        path.push((cur, idx));
        cur = new_child;
    }
    Err(Error::corrupt("tree deeper than the depth bound", cur))
}

fn descend_rightmost_mut(
    txn: &mut Transaction<'_, Write>,
    info: &mut DbInfo,
) -> Result<Descent> {
    let mut cur = txn.touch_page(info.root)?;
    info.root = cur;
    let mut path = Vec::new();
    for _ in 0..MAX_DEPTH {
        let step = {
            let page = txn.get_page(cur)?;
            if page.flags().contains(PageFlags::LEAF) {
                None
            } else {
                let idx = page.num_keys() - 1;
                Some((idx, page.child_at(idx)?))
            }
        };
        let (idx, child) = match step {
            None => return Ok(Descent { path, leaf: cur }),
            Some(found) => found,
        };
        let new_child = txn.touch_page(child)?;
        if new_child != child {
            txn.page_mut(cur)?.patch_value(idx, &new_child.0.to_le_bytes())?;
        }
        path.push((cur, idx));
        cur = new_child;
    }
    Err(Error::corrupt("tree deeper than the depth bound", cur))
}

/// Propagate a split upward: hang `(sep, right)` off the parent chain,
/// splitting branches as needed and growing a new root at the top.
fn add_to_parents(
    txn: &mut Transaction<'_, Write>,
    info: &mut DbInfo,
    path: &mut Vec<(PageId, usize)>,
    mut sep: Vec<u8>,
    mut right: PageId,
) -> Result<()> {
    loop {
        let (parent, idx) = match path.pop() {
            None => {
                let root_id = txn.alloc_page(PageFlags::BRANCH)?;
                let left = info.root;
                {
                    let page = txn.page_mut(root_id)?;
                    page.try_insert_node(0, NodeFlags::empty(), b"", &left.0.to_le_bytes(), 8)?;
                    page.try_insert_node(1, NodeFlags::empty(), &sep, &right.0.to_le_bytes(), 8)?;
                }
                info.root = root_id;
                info.branch_pages += 1;
                info.depth += 1;
                return Ok(());
            }
            Some(frame) => frame,
        };

        let pointer = NodeEntry {
            flags: NodeFlags::empty(),
            key: sep.clone(),
            stored: right.0.to_le_bytes().to_vec(),
            vsize: 8,
        };
        if txn.page_mut(parent)?.try_insert_entry(idx + 1, &pointer)? {
            return Ok(());
        }

        // Reclaim dead space before splitting
        let (fits_compacted, entries) = {
            let page = txn.get_page(parent)?;
            let fits = page.live_bytes()? + pointer.cost() <= PAGE_SIZE - HEADER_SIZE;
            (fits, page.entries()?)
        };
        if fits_compacted {
            txn.page_mut(parent)?.rebuild(&entries)?;
            must_insert(txn, parent, idx + 1, &pointer)?;
            return Ok(());
        }

        // Split the branch; the entry at the split point promotes upward
        let mut combined = entries;
        combined.insert(idx + 1, pointer);
        let at = split_index(&combined);
        let promoted = combined[at].key.clone();
        let right_id = txn.alloc_page(PageFlags::BRANCH)?;
        {
            let mut lower_bound = combined[at].clone();
            lower_bound.key = Vec::new();
            must_insert(txn, right_id, 0, &lower_bound)?;
            for (i, entry) in combined[at + 1..].iter().enumerate() {
                must_insert(txn, right_id, i + 1, entry)?;
            }
        }
        txn.page_mut(parent)?.rebuild(&combined[..at])?;
        info.branch_pages += 1;

        sep = promoted;
        right = right_id;
    }
}

fn insert_in_leaf(
    txn: &mut Transaction<'_, Write>,
    info: &mut DbInfo,
    descent: &mut Descent,
    key: &[u8],
    flags: NodeFlags,
    stored: &[u8],
    vsize: u32,
    ord: KeyOrdering,
) -> Result<()> {
    let pos = match txn.get_page(descent.leaf)?.search(key, ord)? {
        crate::page::SearchResult::NotFound { insert_at } => insert_at,
        crate::page::SearchResult::Found { .. } => {
            return Err(Error::corrupt("insert position already occupied", descent.leaf))
        }
    };
    if txn.page_mut(descent.leaf)?.try_insert_node(pos, flags, key, stored, vsize)? {
        return Ok(());
    }

    let (fits_compacted, entries) = {
        let page = txn.get_page(descent.leaf)?;
        let fits =
            page.live_bytes()? + entry_cost(key.len(), stored.len()) <= PAGE_SIZE - HEADER_SIZE;
        (fits, page.entries()?)
    };
    if fits_compacted {
        txn.page_mut(descent.leaf)?.rebuild(&entries)?;
        let entry = NodeEntry { flags, key: key.to_vec(), stored: stored.to_vec(), vsize };
        must_insert(txn, descent.leaf, pos, &entry)?;
        return Ok(());
    }

    let mut combined = entries;
    combined.insert(pos, NodeEntry { flags, key: key.to_vec(), stored: stored.to_vec(), vsize });
    let at = split_index(&combined);
    let right_id = txn.alloc_page(PageFlags::LEAF)?;
    for (i, entry) in combined[at..].iter().enumerate() {
        must_insert(txn, right_id, i, entry)?;
    }
    txn.page_mut(descent.leaf)?.rebuild(&combined[..at])?;
    info.leaf_pages += 1;

    let sep = combined[at].key.clone();
    add_to_parents(txn, info, &mut descent.path, sep, right_id)
}

/// Insert or replace one leaf entry with explicit node flags.
///
/// Does not adjust the entry count or clean up a replaced value; the caller
/// owns both.
pub(crate) fn put_entry(
    txn: &mut Transaction<'_, Write>,
    info: &mut DbInfo,
    key: &[u8],
    flags: NodeFlags,
    stored: &[u8],
    vsize: u32,
    ord: KeyOrdering,
    mode: PutMode,
) -> Result<PutOutcome> {
    check_key(key, ord)?;
    let mut descent = descend_mut(txn, info, key, ord)?;
    let found = match txn.get_page(descent.leaf)?.search(key, ord)? {
        crate::page::SearchResult::Found { index } => Some(index),
        crate::page::SearchResult::NotFound { .. } => None,
    };
    match found {
        Some(index) => {
            if mode == PutMode::NoOverwrite {
                return Err(Error::KeyExists);
            }
            let old = read_entry(txn, descent.leaf, index)?;
            txn.page_mut(descent.leaf)?.remove_node(index)?;
            insert_in_leaf(txn, info, &mut descent, key, flags, stored, vsize, ord)?;
            Ok(PutOutcome::Replaced(old))
        }
        None => {
            insert_in_leaf(txn, info, &mut descent, key, flags, stored, vsize, ord)?;
            Ok(PutOutcome::Inserted)
        }
    }
}

/// Insert or replace a plain value, spilling large ones into an overflow run
/// and releasing the run a replaced entry pointed at.
pub(crate) fn put_value(
    txn: &mut Transaction<'_, Write>,
    info: &mut DbInfo,
    key: &[u8],
    value: &[u8],
    ord: KeyOrdering,
    mode: PutMode,
) -> Result<PutOutcome> {
    check_key(key, ord)?;
    let outcome = if value.len() <= MAX_INLINE_VALUE {
        put_entry(txn, info, key, NodeFlags::empty(), value, value.len() as u32, ord, mode)?
    } else {
        let first = overflow::write_run(txn, value)?;
        let run = overflow::run_pages(value.len());
        match put_entry(
            txn,
            info,
            key,
            NodeFlags::BIGDATA,
            &first.0.to_le_bytes(),
            value.len() as u32,
            ord,
            mode,
        ) {
            Ok(outcome) => {
                info.overflow_pages += run;
                outcome
            }
            Err(e) => {
                // The run was never linked; its pages recycle immediately
                for offset in 0..run {
                    txn.free_page(PageId(first.0 + offset));
                }
                return Err(e);
            }
        }
    };
    if let PutOutcome::Replaced(ref old) = outcome {
        if old.flags.contains(NodeFlags::BIGDATA) {
            let freed = overflow::free_run(txn, old.overflow_root()?)?;
            info.overflow_pages = info.overflow_pages.saturating_sub(freed);
        } else if old.flags.contains(NodeFlags::DUPTREE) {
            let sub = old.dup_info()?;
            free_tree(txn, sub.root)?;
        }
    }
    Ok(outcome)
}

/// Append-optimized insert: descend the rightmost edge without searching and
/// fail with `OutOfOrder` unless the key exceeds the current maximum.
pub(crate) fn append_entry(
    txn: &mut Transaction<'_, Write>,
    info: &mut DbInfo,
    key: &[u8],
    flags: NodeFlags,
    stored: &[u8],
    vsize: u32,
    ord: KeyOrdering,
) -> Result<()> {
    check_key(key, ord)?;
    let mut descent = descend_rightmost_mut(txn, info)?;
    let end = {
        let page = txn.get_page(descent.leaf)?;
        let n = page.num_keys();
        if n > 0 {
            let last = page.node(n - 1)?.key();
            if ord.compare(key, last) != std::cmp::Ordering::Greater {
                return Err(Error::OutOfOrder);
            }
        }
        n
    };
    if txn.page_mut(descent.leaf)?.try_insert_node(end, flags, key, stored, vsize)? {
        return Ok(());
    }

    // The new key is the maximum: a fresh right leaf takes just the new
    // entry, keeping the existing page packed.
    let right_id = txn.alloc_page(PageFlags::LEAF)?;
    let entry = NodeEntry { flags, key: key.to_vec(), stored: stored.to_vec(), vsize };
    must_insert(txn, right_id, 0, &entry)?;
    info.leaf_pages += 1;
    add_to_parents(txn, info, &mut descent.path, key.to_vec(), right_id)
}

/// Delete one leaf entry, unlinking emptied pages up the path.
///
/// Returns the removed entry for value cleanup; the caller adjusts the entry
/// count.
pub(crate) fn del_entry(
    txn: &mut Transaction<'_, Write>,
    info: &mut DbInfo,
    key: &[u8],
    ord: KeyOrdering,
) -> Result<Option<RawEntry>> {
    check_key(key, ord)?;
    let mut descent = descend_mut(txn, info, key, ord)?;
    let index = match txn.get_page(descent.leaf)?.search(key, ord)? {
        crate::page::SearchResult::Found { index } => index,
        crate::page::SearchResult::NotFound { .. } => return Ok(None),
    };
    let old = read_entry(txn, descent.leaf, index)?;
    txn.page_mut(descent.leaf)?.remove_node(index)?;

    // Unlink emptied pages; only the root may stay empty
    let mut child = descent.leaf;
    loop {
        let (empty, is_leaf) = {
            let page = txn.get_page(child)?;
            (page.num_keys() == 0, page.flags().contains(PageFlags::LEAF))
        };
        if !empty {
            break;
        }
        let (parent, idx) = match descent.path.pop() {
            None => break,
            Some(frame) => frame,
        };
        txn.free_page(child);
        if is_leaf {
            info.leaf_pages = info.leaf_pages.saturating_sub(1);
        } else {
            info.branch_pages = info.branch_pages.saturating_sub(1);
        }
        txn.page_mut(parent)?.remove_node(idx)?;
        normalize_lower_bound(txn, parent, idx)?;
        child = parent;
    }

    // Shrink a root branch that is down to a single child
    loop {
        let single_child = {
            let page = txn.get_page(info.root)?;
            if page.flags().contains(PageFlags::BRANCH) && page.num_keys() == 1 {
                Some(page.child_at(0)?)
            } else {
                None
            }
        };
        let Some(next_root) = single_child else { break };
        txn.free_page(info.root);
        info.branch_pages = info.branch_pages.saturating_sub(1);
        info.depth = info.depth.saturating_sub(1);
        info.root = next_root;
    }

    // Deleting the last entry can drain a branch root entirely; the tree
    // restarts from a fresh empty leaf.
    let drained = {
        let page = txn.get_page(info.root)?;
        page.flags().contains(PageFlags::BRANCH) && page.num_keys() == 0
    };
    if drained {
        txn.free_page(info.root);
        info.branch_pages = info.branch_pages.saturating_sub(1);
        info.root = txn.alloc_page(PageFlags::LEAF)?;
        info.leaf_pages += 1;
        info.depth = 1;
    }

    Ok(Some(old))
}

/// After removing branch entry `idx`, restore the empty-key lower bound if
/// the first remaining entry moved into position 0.
fn normalize_lower_bound(
    txn: &mut Transaction<'_, Write>,
    branch: PageId,
    removed_idx: usize,
) -> Result<()> {
    if removed_idx != 0 {
        return Ok(());
    }
    let first = {
        let page = txn.get_page(branch)?;
        if page.num_keys() == 0 {
            return Ok(());
        }
        let node = page.node(0)?;
        if node.key().is_empty() {
            return Ok(());
        }
        NodeEntry {
            flags: node.flags(),
            key: Vec::new(),
            stored: node.stored().to_vec(),
            vsize: node.vsize(),
        }
    };
    let page = txn.page_mut(branch)?;
    page.remove_node(0)?;
    if !page.try_insert_entry(0, &first)? {
        return Err(Error::corrupt("lower-bound rewrite does not fit", branch));
    }
    Ok(())
}

/// Patch the stored bytes of an existing entry in place (same size)
pub(crate) fn update_in_place(
    txn: &mut Transaction<'_, Write>,
    info: &mut DbInfo,
    key: &[u8],
    stored: &[u8],
    ord: KeyOrdering,
) -> Result<()> {
    let descent = descend_mut(txn, info, key, ord)?;
    match txn.get_page(descent.leaf)?.search(key, ord)? {
        crate::page::SearchResult::Found { index } => {
            txn.page_mut(descent.leaf)?.patch_value(index, stored)
        }
        crate::page::SearchResult::NotFound { .. } => Err(Error::NotFound),
    }
}

/// Find the dirty leaf and index that hold `key` (reserve-style access)
pub(crate) fn locate_leaf(
    txn: &Transaction<'_, Write>,
    root: PageId,
    key: &[u8],
    ord: KeyOrdering,
) -> Result<(PageId, usize)> {
    let mut cur = root;
    for _ in 0..MAX_DEPTH {
        let next = {
            let page = txn.get_page(cur)?;
            if page.flags().contains(PageFlags::LEAF) {
                return match page.search(key, ord)? {
                    crate::page::SearchResult::Found { index } => Ok((cur, index)),
                    crate::page::SearchResult::NotFound { .. } => Err(Error::NotFound),
                };
            }
            page.branch_child(key, ord)?.1
        };
        cur = next;
    }
    Err(Error::corrupt("tree deeper than the depth bound", cur))
}

/// Collect every page reachable from `root`: tree pages, overflow runs, and
/// nested duplicate trees.
pub(crate) fn tree_pages<M: mode::Mode>(
    txn: &Transaction<'_, M>,
    root: PageId,
) -> Result<Vec<PageId>> {
    let mut pages = Vec::new();
    let mut stack = vec![root];
    while let Some(pgno) = stack.pop() {
        pages.push(pgno);
        let (children, dup_roots, runs) = {
            let page = txn.get_page(pgno)?;
            let mut children = Vec::new();
            let mut dup_roots = Vec::new();
            let mut runs = Vec::new();
            if page.flags().contains(PageFlags::BRANCH) {
                for i in 0..page.num_keys() {
                    children.push(page.node(i)?.child());
                }
            } else if page.flags().contains(PageFlags::LEAF) {
                for i in 0..page.num_keys() {
                    let node = page.node(i)?;
                    if node.flags().contains(NodeFlags::BIGDATA) {
                        runs.push(node.child());
                    } else if node.flags().contains(NodeFlags::DUPTREE) {
                        dup_roots.push(DbInfo::read_from(node.stored())?.root);
                    }
                }
            }
            (children, dup_roots, runs)
        };
        stack.extend(children);
        stack.extend(dup_roots);
        for run in runs {
            pages.extend(overflow::run_page_ids(txn, run)?);
        }
    }
    Ok(pages)
}

/// Free every page reachable from `root`
pub(crate) fn free_tree(txn: &mut Transaction<'_, Write>, root: PageId) -> Result<()> {
    let pages = tree_pages(txn, root)?;
    for page in pages {
        txn.free_page(page);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::EnvBuilder;
    use tempfile::TempDir;

    fn put(
        txn: &mut Transaction<'_, Write>,
        info: &mut DbInfo,
        key: &[u8],
        value: &[u8],
    ) -> PutOutcome {
        put_value(txn, info, key, value, KeyOrdering::Lexicographic, PutMode::Upsert).unwrap()
    }

    fn get(txn: &Transaction<'_, Write>, info: &DbInfo, key: &[u8]) -> Option<Vec<u8>> {
        lookup(txn, info.root, key, KeyOrdering::Lexicographic)
            .unwrap()
            .map(|e| resolve_value(txn, &e).unwrap())
    }

    #[test]
    fn insert_search_delete() {
        let dir = TempDir::new().unwrap();
        let env = EnvBuilder::new().open(dir.path()).unwrap();
        let mut txn = env.begin_write_txn().unwrap();
        let mut info = txn.db_info(None).unwrap();

        put(&mut txn, &mut info, b"banana", b"yellow");
        put(&mut txn, &mut info, b"apple", b"red");
        put(&mut txn, &mut info, b"cherry", b"dark");

        assert_eq!(get(&txn, &info, b"apple"), Some(b"red".to_vec()));
        assert_eq!(get(&txn, &info, b"banana"), Some(b"yellow".to_vec()));
        assert_eq!(get(&txn, &info, b"durian"), None);

        let removed =
            del_entry(&mut txn, &mut info, b"banana", KeyOrdering::Lexicographic).unwrap();
        assert!(removed.is_some());
        assert_eq!(get(&txn, &info, b"banana"), None);

        let removed =
            del_entry(&mut txn, &mut info, b"banana", KeyOrdering::Lexicographic).unwrap();
        assert!(removed.is_none());
    }

    #[test]
    fn splits_build_a_multi_level_tree() {
        let dir = TempDir::new().unwrap();
        let env = EnvBuilder::new().open(dir.path()).unwrap();
        let mut txn = env.begin_write_txn().unwrap();
        let mut info = txn.db_info(None).unwrap();

        for i in 0..500u32 {
            let key = format!("key_{i:05}");
            let value = format!("value_{i:05}");
            put(&mut txn, &mut info, key.as_bytes(), value.as_bytes());
        }
        assert!(info.depth > 1);
        assert!(info.leaf_pages > 1);

        for i in (0..500u32).step_by(7) {
            let key = format!("key_{i:05}");
            let value = format!("value_{i:05}");
            assert_eq!(get(&txn, &info, key.as_bytes()), Some(value.into_bytes()));
        }
    }

    #[test]
    fn delete_collapses_the_tree() {
        let dir = TempDir::new().unwrap();
        let env = EnvBuilder::new().open(dir.path()).unwrap();
        let mut txn = env.begin_write_txn().unwrap();
        let mut info = txn.db_info(None).unwrap();

        for i in 0..500u32 {
            let key = format!("key_{i:05}");
            put(&mut txn, &mut info, key.as_bytes(), b"v");
        }
        for i in 0..500u32 {
            let key = format!("key_{i:05}");
            del_entry(&mut txn, &mut info, key.as_bytes(), KeyOrdering::Lexicographic)
                .unwrap()
                .unwrap();
        }
        assert_eq!(info.depth, 1);
        assert_eq!(get(&txn, &info, b"key_00000"), None);
    }

    #[test]
    fn no_overwrite_rejects_duplicates() {
        let dir = TempDir::new().unwrap();
        let env = EnvBuilder::new().open(dir.path()).unwrap();
        let mut txn = env.begin_write_txn().unwrap();
        let mut info = txn.db_info(None).unwrap();

        put(&mut txn, &mut info, b"k", b"v1");
        let err = put_value(
            &mut txn,
            &mut info,
            b"k",
            b"v2",
            KeyOrdering::Lexicographic,
            PutMode::NoOverwrite,
        )
        .unwrap_err();
        assert!(matches!(err, Error::KeyExists));
        assert_eq!(get(&txn, &info, b"k"), Some(b"v1".to_vec()));
    }

    #[test]
    fn append_enforces_order() {
        let dir = TempDir::new().unwrap();
        let env = EnvBuilder::new().open(dir.path()).unwrap();
        let mut txn = env.begin_write_txn().unwrap();
        let mut info = txn.db_info(None).unwrap();

        for i in 0..100u32 {
            let key = format!("key_{i:05}");
            append_entry(
                &mut txn,
                &mut info,
                key.as_bytes(),
                NodeFlags::empty(),
                b"v",
                1,
                KeyOrdering::Lexicographic,
            )
            .unwrap();
        }
        let err = append_entry(
            &mut txn,
            &mut info,
            b"key_00050",
            NodeFlags::empty(),
            b"v",
            1,
            KeyOrdering::Lexicographic,
        )
        .unwrap_err();
        assert!(matches!(err, Error::OutOfOrder));
        assert_eq!(get(&txn, &info, b"key_00099"), Some(b"v".to_vec()));
    }

    #[test]
    fn large_values_round_trip_through_overflow() {
        let dir = TempDir::new().unwrap();
        let env = EnvBuilder::new().open(dir.path()).unwrap();
        let mut txn = env.begin_write_txn().unwrap();
        let mut info = txn.db_info(None).unwrap();

        let value: Vec<u8> = (0..50_000u32).map(|i| (i % 241) as u8).collect();
        put(&mut txn, &mut info, b"big", &value);
        assert!(info.overflow_pages > 0);
        assert_eq!(get(&txn, &info, b"big"), Some(value.clone()));

        // Replacing releases the old run
        let before = info.overflow_pages;
        put(&mut txn, &mut info, b"big", b"small now");
        assert!(info.overflow_pages < before);
        assert_eq!(get(&txn, &info, b"big"), Some(b"small now".to_vec()));
    }
}
