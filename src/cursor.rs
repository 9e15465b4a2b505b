//! Cursors
//!
//! A cursor is a descent stack of (page, index) frames from the root to the
//! current entry, plus a nested position when the entry is a duplicate tree.
//! Navigation walks the stack instead of sibling links, which keeps cursors
//! valid under copy-on-write. Seek failures leave the cursor unpositioned;
//! exhausting the duplicates of a key with `next_dup`/`prev_dup` keeps the
//! main position so `next_nodup` still works. A mutation through a write
//! cursor re-seeks the descent stack before returning, so the stack is never
//! stale after a split or merge.

use crate::btree::{self, RawEntry, MAX_DEPTH};
use crate::comparator::KeyOrdering;
use crate::db::{self, DatabaseFlags, WriteFlags};
use crate::error::{Error, PageId, Result};
use crate::meta::DbInfo;
use crate::page::{NodeFlags, PageFlags, PageView, SearchResult};
use crate::txn::{mode, Transaction, Write};
use std::ops::Bound;

/// Duplicate values sort byte-lexicographically
const DUP_ORD: KeyOrdering = KeyOrdering::Lexicographic;

type Frame = (PageId, usize);

/// Position inside the duplicates of the current key
enum DupPos {
    /// The key holds one inline value
    Single,
    /// The key holds a nested duplicate tree
    Tree { stack: Vec<Frame> },
}

/// Mode-independent cursor state
pub(crate) struct CursorState {
    name: Option<String>,
    info: DbInfo,
    ord: KeyOrdering,
    dup_enabled: bool,
    stack: Vec<Frame>,
    dup: Option<DupPos>,
}

/// Build the descent stack to the first or last entry under `root`
fn stack_descend_edge<M: mode::Mode>(
    txn: &Transaction<'_, M>,
    root: PageId,
    first: bool,
) -> Result<Option<Vec<Frame>>> {
    let mut stack = Vec::new();
    descend_push_edge(txn, &mut stack, root, first)?;
    if stack.is_empty() {
        Ok(None)
    } else {
        Ok(Some(stack))
    }
}

/// Extend a stack downward from `from` to the first/last leaf entry
fn descend_push_edge<M: mode::Mode>(
    txn: &Transaction<'_, M>,
    stack: &mut Vec<Frame>,
    from: PageId,
    first: bool,
) -> Result<()> {
    let mut cur = from;
    for _ in 0..MAX_DEPTH {
        let (is_leaf, n) = {
            let page = txn.get_page(cur)?;
            (page.flags().contains(PageFlags::LEAF), page.num_keys())
        };
        if is_leaf {
            // Only the root leaf of an empty tree has no entries
            if n > 0 {
                stack.push((cur, if first { 0 } else { n - 1 }));
            }
            return Ok(());
        }
        let idx = if first { 0 } else { n - 1 };
        let child = txn.get_page(cur)?.child_at(idx)?;
        stack.push((cur, idx));
        cur = child;
    }
    Err(Error::corrupt("tree deeper than the depth bound", cur))
}

/// Result of a key seek: the branch frames, the leaf, and where the key sits
struct SeekPos {
    stack: Vec<Frame>,
    leaf: PageId,
    result: SearchResult,
    leaf_len: usize,
}

fn stack_seek<M: mode::Mode>(
    txn: &Transaction<'_, M>,
    root: PageId,
    key: &[u8],
    ord: KeyOrdering,
) -> Result<SeekPos> {
    let mut stack = Vec::new();
    let mut cur = root;
    for _ in 0..MAX_DEPTH {
        let step = {
            let page = txn.get_page(cur)?;
            if page.flags().contains(PageFlags::LEAF) {
                return Ok(SeekPos {
                    stack,
                    leaf: cur,
                    result: page.search(key, ord)?,
                    leaf_len: page.num_keys(),
                });
            }
            page.branch_child(key, ord)?
        };
        stack.push((cur, step.0));
        cur = step.1;
    }
    Err(Error::corrupt("tree deeper than the depth bound", cur))
}

/// Move a stack to the next leaf entry. Restores the stack and returns
/// `false` when the tree is exhausted.
fn stack_advance<M: mode::Mode>(txn: &Transaction<'_, M>, stack: &mut Vec<Frame>) -> Result<bool> {
    let Some(&(leaf, idx)) = stack.last() else { return Ok(false) };
    let n = txn.get_page(leaf)?.num_keys();
    if idx + 1 < n {
        if let Some(top) = stack.last_mut() {
            top.1 = idx + 1;
        }
        return Ok(true);
    }

    let mut popped = Vec::new();
    loop {
        let Some(frame) = stack.pop() else {
            while let Some(frame) = popped.pop() {
                stack.push(frame);
            }
            return Ok(false);
        };
        popped.push(frame);
        let Some(&(branch, bidx)) = stack.last() else { continue };
        let n = txn.get_page(branch)?.num_keys();
        if bidx + 1 < n {
            if let Some(top) = stack.last_mut() {
                top.1 = bidx + 1;
            }
            let child = txn.get_page(branch)?.child_at(bidx + 1)?;
            descend_push_edge(txn, stack, child, true)?;
            return Ok(true);
        }
    }
}

/// Move a stack to the previous leaf entry
fn stack_retreat<M: mode::Mode>(txn: &Transaction<'_, M>, stack: &mut Vec<Frame>) -> Result<bool> {
    let Some(&(_, idx)) = stack.last() else { return Ok(false) };
    if idx > 0 {
        if let Some(top) = stack.last_mut() {
            top.1 = idx - 1;
        }
        return Ok(true);
    }

    let mut popped = Vec::new();
    loop {
        let Some(frame) = stack.pop() else {
            while let Some(frame) = popped.pop() {
                stack.push(frame);
            }
            return Ok(false);
        };
        popped.push(frame);
        let Some(&(branch, bidx)) = stack.last() else { continue };
        if bidx > 0 {
            if let Some(top) = stack.last_mut() {
                top.1 = bidx - 1;
            }
            let child = txn.get_page(branch)?.child_at(bidx - 1)?;
            descend_push_edge(txn, stack, child, false)?;
            return Ok(true);
        }
    }
}

/// Key and entry at a stack's leaf position
fn leaf_at<M: mode::Mode>(
    txn: &Transaction<'_, M>,
    stack: &[Frame],
) -> Result<(Vec<u8>, RawEntry)> {
    let &(leaf, idx) = stack.last().ok_or(Error::InvalidHandle("cursor is not positioned"))?;
    let page = txn.get_page(leaf)?;
    let node = page.node(idx)?;
    Ok((
        node.key().to_vec(),
        RawEntry { flags: node.flags(), vsize: node.vsize(), stored: node.stored().to_vec() },
    ))
}

impl CursorState {
    pub(crate) fn new(name: Option<&str>, info: DbInfo, flags: DatabaseFlags) -> Self {
        Self {
            name: name.map(String::from),
            info,
            ord: KeyOrdering::from_flags(flags),
            dup_enabled: flags.contains(DatabaseFlags::DUP_SORT),
            stack: Vec::new(),
            dup: None,
        }
    }

    fn clear(&mut self) {
        self.stack.clear();
        self.dup = None;
    }

    fn refresh_info<M: mode::Mode>(&mut self, txn: &Transaction<'_, M>) -> Result<()> {
        self.info = txn.db_info(self.name.as_deref())?;
        Ok(())
    }

    fn enter_dup<M: mode::Mode>(&mut self, txn: &Transaction<'_, M>, last: bool) -> Result<()> {
        self.dup = None;
        if !self.dup_enabled || self.stack.is_empty() {
            return Ok(());
        }
        let (_, entry) = leaf_at(txn, &self.stack)?;
        if entry.flags.contains(NodeFlags::DUPTREE) {
            let sub = entry.dup_info()?;
            let stack = stack_descend_edge(txn, sub.root, !last)?
                .ok_or_else(|| Error::corrupt("empty duplicate tree", sub.root))?;
            self.dup = Some(DupPos::Tree { stack });
        } else {
            self.dup = Some(DupPos::Single);
        }
        Ok(())
    }

    fn current_pair<M: mode::Mode>(
        &self,
        txn: &Transaction<'_, M>,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if self.stack.is_empty() {
            return Ok(None);
        }
        let (key, entry) = leaf_at(txn, &self.stack)?;
        let value = match &self.dup {
            Some(DupPos::Tree { stack }) => leaf_at(txn, stack)?.0,
            Some(DupPos::Single) => entry.stored.clone(),
            None => btree::resolve_value(txn, &entry)?,
        };
        Ok(Some((key, value)))
    }

    pub(crate) fn op_first<M: mode::Mode>(
        &mut self,
        txn: &Transaction<'_, M>,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        match stack_descend_edge(txn, self.info.root, true)? {
            Some(stack) => {
                self.stack = stack;
                self.enter_dup(txn, false)?;
                self.current_pair(txn)
            }
            None => {
                self.clear();
                Ok(None)
            }
        }
    }

    pub(crate) fn op_last<M: mode::Mode>(
        &mut self,
        txn: &Transaction<'_, M>,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        match stack_descend_edge(txn, self.info.root, false)? {
            Some(stack) => {
                self.stack = stack;
                self.enter_dup(txn, true)?;
                self.current_pair(txn)
            }
            None => {
                self.clear();
                Ok(None)
            }
        }
    }

    pub(crate) fn op_next<M: mode::Mode>(
        &mut self,
        txn: &Transaction<'_, M>,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if self.stack.is_empty() {
            return self.op_first(txn);
        }
        let advanced_dup = match &mut self.dup {
            Some(DupPos::Tree { stack }) => stack_advance(txn, stack)?,
            _ => false,
        };
        if advanced_dup {
            return self.current_pair(txn);
        }
        if stack_advance(txn, &mut self.stack)? {
            self.enter_dup(txn, false)?;
            self.current_pair(txn)
        } else {
            self.clear();
            Ok(None)
        }
    }

    pub(crate) fn op_prev<M: mode::Mode>(
        &mut self,
        txn: &Transaction<'_, M>,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if self.stack.is_empty() {
            return self.op_last(txn);
        }
        let retreated_dup = match &mut self.dup {
            Some(DupPos::Tree { stack }) => stack_retreat(txn, stack)?,
            _ => false,
        };
        if retreated_dup {
            return self.current_pair(txn);
        }
        if stack_retreat(txn, &mut self.stack)? {
            self.enter_dup(txn, true)?;
            self.current_pair(txn)
        } else {
            self.clear();
            Ok(None)
        }
    }

    pub(crate) fn op_seek<M: mode::Mode>(
        &mut self,
        txn: &Transaction<'_, M>,
        key: &[u8],
        exact: bool,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let seek = stack_seek(txn, self.info.root, key, self.ord)?;
        match seek.result {
            SearchResult::Found { index } => {
                self.stack = seek.stack;
                self.stack.push((seek.leaf, index));
            }
            SearchResult::NotFound { insert_at } => {
                if exact || seek.leaf_len == 0 {
                    self.clear();
                    return Ok(None);
                }
                self.stack = seek.stack;
                if insert_at < seek.leaf_len {
                    self.stack.push((seek.leaf, insert_at));
                } else {
                    // Past the end of this leaf: step to the next one
                    self.stack.push((seek.leaf, seek.leaf_len - 1));
                    if !stack_advance(txn, &mut self.stack)? {
                        self.clear();
                        return Ok(None);
                    }
                }
            }
        }
        self.enter_dup(txn, false)?;
        self.current_pair(txn)
    }

    pub(crate) fn op_get_both<M: mode::Mode>(
        &mut self,
        txn: &Transaction<'_, M>,
        key: &[u8],
        value: &[u8],
        range: bool,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if self.op_seek(txn, key, true)?.is_none() {
            return Ok(None);
        }
        let (_, entry) = leaf_at(txn, &self.stack)?;
        if entry.flags.contains(NodeFlags::DUPTREE) {
            let sub = entry.dup_info()?;
            let seek = stack_seek(txn, sub.root, value, DUP_ORD)?;
            let mut stack = seek.stack;
            match seek.result {
                SearchResult::Found { index } => stack.push((seek.leaf, index)),
                SearchResult::NotFound { insert_at } if range && insert_at < seek.leaf_len => {
                    stack.push((seek.leaf, insert_at));
                }
                SearchResult::NotFound { .. } if range && seek.leaf_len > 0 => {
                    // The next value may live in a following leaf
                    stack.push((seek.leaf, seek.leaf_len - 1));
                    if !stack_advance(txn, &mut stack)? {
                        self.clear();
                        return Ok(None);
                    }
                }
                SearchResult::NotFound { .. } => {
                    self.clear();
                    return Ok(None);
                }
            }
            self.dup = Some(DupPos::Tree { stack });
        } else {
            let current = btree::resolve_value(txn, &entry)?;
            let matched = if range {
                DUP_ORD.compare(&current, value) != std::cmp::Ordering::Less
            } else {
                current == value
            };
            if !matched {
                self.clear();
                return Ok(None);
            }
            self.dup = if self.dup_enabled { Some(DupPos::Single) } else { None };
        }
        self.current_pair(txn)
    }

    pub(crate) fn op_first_dup<M: mode::Mode>(
        &mut self,
        txn: &Transaction<'_, M>,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if self.stack.is_empty() {
            return Ok(None);
        }
        self.enter_dup(txn, false)?;
        self.current_pair(txn)
    }

    pub(crate) fn op_last_dup<M: mode::Mode>(
        &mut self,
        txn: &Transaction<'_, M>,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if self.stack.is_empty() {
            return Ok(None);
        }
        self.enter_dup(txn, true)?;
        self.current_pair(txn)
    }

    pub(crate) fn op_next_dup<M: mode::Mode>(
        &mut self,
        txn: &Transaction<'_, M>,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if self.stack.is_empty() {
            return Ok(None);
        }
        match &mut self.dup {
            Some(DupPos::Tree { stack }) => {
                if stack_advance(txn, stack)? {
                    self.current_pair(txn)
                } else {
                    Ok(None)
                }
            }
            _ => Ok(None),
        }
    }

    pub(crate) fn op_prev_dup<M: mode::Mode>(
        &mut self,
        txn: &Transaction<'_, M>,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if self.stack.is_empty() {
            return Ok(None);
        }
        match &mut self.dup {
            Some(DupPos::Tree { stack }) => {
                if stack_retreat(txn, stack)? {
                    self.current_pair(txn)
                } else {
                    Ok(None)
                }
            }
            _ => Ok(None),
        }
    }

    pub(crate) fn op_next_nodup<M: mode::Mode>(
        &mut self,
        txn: &Transaction<'_, M>,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if self.stack.is_empty() {
            return self.op_first(txn);
        }
        if stack_advance(txn, &mut self.stack)? {
            self.enter_dup(txn, false)?;
            self.current_pair(txn)
        } else {
            self.clear();
            Ok(None)
        }
    }

    pub(crate) fn op_prev_nodup<M: mode::Mode>(
        &mut self,
        txn: &Transaction<'_, M>,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if self.stack.is_empty() {
            return self.op_last(txn);
        }
        if stack_retreat(txn, &mut self.stack)? {
            self.enter_dup(txn, true)?;
            self.current_pair(txn)
        } else {
            self.clear();
            Ok(None)
        }
    }

    pub(crate) fn op_count<M: mode::Mode>(&self, txn: &Transaction<'_, M>) -> Result<u64> {
        if self.stack.is_empty() {
            return Err(Error::InvalidHandle("cursor is not positioned"));
        }
        let (_, entry) = leaf_at(txn, &self.stack)?;
        crate::dupsort::value_count(&entry)
    }

    fn current_key<M: mode::Mode>(&self, txn: &Transaction<'_, M>) -> Result<Vec<u8>> {
        Ok(leaf_at(txn, &self.stack)?.0)
    }
}

/// A read cursor over one database, scoped to a transaction
pub struct Cursor<'txn, 'env, M: mode::Mode> {
    txn: &'txn Transaction<'env, M>,
    state: CursorState,
}

impl<'txn, 'env, M: mode::Mode> Cursor<'txn, 'env, M> {
    pub(crate) fn new(
        txn: &'txn Transaction<'env, M>,
        name: Option<&str>,
        info: DbInfo,
        flags: DatabaseFlags,
    ) -> Self {
        Self { txn, state: CursorState::new(name, info, flags) }
    }

    /// Position at the first entry
    pub fn first(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.state.op_first(self.txn)
    }

    /// Position at the last entry
    pub fn last(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.state.op_last(self.txn)
    }

    /// Step to the next entry (each duplicate value is one entry)
    pub fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.state.op_next(self.txn)
    }

    /// Step to the previous entry
    pub fn prev(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.state.op_prev(self.txn)
    }

    /// Position at `key` exactly
    pub fn set(&mut self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.state.op_seek(self.txn, key, true)
    }

    /// Position at the least key that is `>= key` under the database ordering
    pub fn set_range(&mut self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.state.op_seek(self.txn, key, false)
    }

    /// First duplicate of the current key
    pub fn first_dup(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.state.op_first_dup(self.txn)
    }

    /// Last duplicate of the current key
    pub fn last_dup(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.state.op_last_dup(self.txn)
    }

    /// Next duplicate of the current key; keeps the position when exhausted
    pub fn next_dup(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.state.op_next_dup(self.txn)
    }

    /// Previous duplicate of the current key; keeps the position when exhausted
    pub fn prev_dup(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.state.op_prev_dup(self.txn)
    }

    /// First duplicate of the next key
    pub fn next_nodup(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.state.op_next_nodup(self.txn)
    }

    /// Last duplicate of the previous key
    pub fn prev_nodup(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.state.op_prev_nodup(self.txn)
    }

    /// Position at the exact (key, value) pair
    pub fn get_both(&mut self, key: &[u8], value: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.state.op_get_both(self.txn, key, value, false)
    }

    /// Position at `key` and its least duplicate `>= value`
    pub fn get_both_range(
        &mut self,
        key: &[u8],
        value: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.state.op_get_both(self.txn, key, value, true)
    }

    /// Number of values under the current key (1 unless duplicates)
    pub fn count(&self) -> Result<u64> {
        self.state.op_count(self.txn)
    }
}

/// A write cursor: all read operations plus mutation at the current position
pub struct WriteCursor<'txn, 'env> {
    txn: &'txn mut Transaction<'env, Write>,
    state: CursorState,
}

impl<'txn, 'env> WriteCursor<'txn, 'env> {
    pub(crate) fn new(
        txn: &'txn mut Transaction<'env, Write>,
        name: Option<&str>,
        info: DbInfo,
        flags: DatabaseFlags,
    ) -> Self {
        Self { txn, state: CursorState::new(name, info, flags) }
    }

    /// Position at the first entry
    pub fn first(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.state.op_first(&*self.txn)
    }

    /// Position at the last entry
    pub fn last(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.state.op_last(&*self.txn)
    }

    /// Step to the next entry
    pub fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.state.op_next(&*self.txn)
    }

    /// Step to the previous entry
    pub fn prev(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.state.op_prev(&*self.txn)
    }

    /// Position at `key` exactly
    pub fn set(&mut self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.state.op_seek(&*self.txn, key, true)
    }

    /// Position at the least key that is `>= key`
    pub fn set_range(&mut self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.state.op_seek(&*self.txn, key, false)
    }

    /// Position at the exact (key, value) pair
    pub fn get_both(&mut self, key: &[u8], value: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.state.op_get_both(&*self.txn, key, value, false)
    }

    /// Position at `key` and its least duplicate `>= value`
    pub fn get_both_range(
        &mut self,
        key: &[u8],
        value: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.state.op_get_both(&*self.txn, key, value, true)
    }

    /// Number of values under the current key
    pub fn count(&self) -> Result<u64> {
        self.state.op_count(&*self.txn)
    }

    /// Write a pair through the cursor, leaving it positioned on the new entry
    pub fn put(&mut self, key: &[u8], value: &[u8], flags: WriteFlags) -> Result<()> {
        db::put_raw(self.txn, self.state.name.as_deref(), key, value, flags)?;
        self.state.refresh_info(&*self.txn)?;
        let positioned = if self.state.dup_enabled {
            self.state.op_get_both(&*self.txn, key, value, false)?
        } else {
            self.state.op_seek(&*self.txn, key, true)?
        };
        if positioned.is_none() {
            return Err(Error::corrupt(
                "cursor lost the entry it just wrote",
                self.state.info.root,
            ));
        }
        Ok(())
    }

    /// Replace the value at the current position
    pub fn put_current(&mut self, value: &[u8]) -> Result<()> {
        let key = self.state.current_key(&*self.txn)?;
        if self.state.dup_enabled {
            let (_, old_value) = self
                .state
                .current_pair(&*self.txn)?
                .ok_or(Error::InvalidHandle("cursor is not positioned"))?;
            db::del_raw(self.txn, self.state.name.as_deref(), &key, Some(&old_value))?;
            db::put_raw(self.txn, self.state.name.as_deref(), &key, value, WriteFlags::empty())?;
            self.state.refresh_info(&*self.txn)?;
            self.state.op_get_both(&*self.txn, &key, value, false)?;
        } else {
            db::put_raw(self.txn, self.state.name.as_deref(), &key, value, WriteFlags::empty())?;
            self.state.refresh_info(&*self.txn)?;
            self.state.op_seek(&*self.txn, &key, true)?;
        }
        Ok(())
    }

    /// Delete the entry at the current position, leaving the cursor on the
    /// following entry (unpositioned at the end of the database)
    pub fn del(&mut self) -> Result<()> {
        let (key, old_value) = self
            .state
            .current_pair(&*self.txn)?
            .ok_or(Error::InvalidHandle("cursor is not positioned"))?;
        let dup_value = if self.state.dup_enabled { Some(old_value.as_slice()) } else { None };
        db::del_raw(self.txn, self.state.name.as_deref(), &key, dup_value)?;
        self.state.refresh_info(&*self.txn)?;

        if self.state.dup_enabled {
            // Next duplicate of the same key, if any
            if self.state.op_get_both(&*self.txn, &key, &old_value, true)?.is_some() {
                return Ok(());
            }
            // Same key with remaining duplicates was handled above; move on
            if self.state.op_seek(&*self.txn, &key, true)?.is_some() {
                self.state.op_next_nodup(&*self.txn)?;
                return Ok(());
            }
        }
        self.state.op_seek(&*self.txn, &key, false)?;
        Ok(())
    }
}

/// Lazy ordered range scan over one database
pub struct RangeIter<'txn, 'env, M: mode::Mode> {
    cursor: Cursor<'txn, 'env, M>,
    start: Bound<Vec<u8>>,
    end: Bound<Vec<u8>>,
    reverse: bool,
    ord: KeyOrdering,
    started: bool,
    done: bool,
}

impl<'txn, 'env, M: mode::Mode> RangeIter<'txn, 'env, M> {
    pub(crate) fn new(
        cursor: Cursor<'txn, 'env, M>,
        start: Bound<Vec<u8>>,
        end: Bound<Vec<u8>>,
        reverse: bool,
    ) -> Self {
        let ord = cursor.state.ord;
        Self { cursor, start, end, reverse, ord, started: false, done: false }
    }

    fn seek_start(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if !self.reverse {
            match std::mem::replace(&mut self.start, Bound::Unbounded) {
                Bound::Unbounded => self.cursor.first(),
                Bound::Included(key) => self.cursor.set_range(&key),
                Bound::Excluded(key) => {
                    let mut at = self.cursor.set_range(&key)?;
                    while let Some((ref k, _)) = at {
                        if k != &key {
                            break;
                        }
                        at = self.cursor.next()?;
                    }
                    Ok(at)
                }
            }
        } else {
            match std::mem::replace(&mut self.end, Bound::Unbounded) {
                Bound::Unbounded => self.cursor.last(),
                Bound::Included(key) => match self.cursor.set_range(&key)? {
                    Some((k, v)) if k == key => {
                        // Land on the key's last duplicate
                        let last = self.cursor.last_dup()?;
                        Ok(last.or(Some((k, v))))
                    }
                    Some(_) => self.cursor.prev_nodup(),
                    None => self.cursor.last(),
                },
                Bound::Excluded(key) => match self.cursor.set_range(&key)? {
                    Some(_) => self.cursor.prev_nodup(),
                    None => self.cursor.last(),
                },
            }
        }
    }

    fn within_bounds(&self, key: &[u8]) -> bool {
        if !self.reverse {
            match &self.end {
                Bound::Unbounded => true,
                Bound::Included(end) => self.ord.compare(key, end) != std::cmp::Ordering::Greater,
                Bound::Excluded(end) => self.ord.compare(key, end) == std::cmp::Ordering::Less,
            }
        } else {
            match &self.start {
                Bound::Unbounded => true,
                Bound::Included(start) => {
                    self.ord.compare(key, start) != std::cmp::Ordering::Less
                }
                Bound::Excluded(start) => {
                    self.ord.compare(key, start) == std::cmp::Ordering::Greater
                }
            }
        }
    }
}

impl<'txn, 'env, M: mode::Mode> Iterator for RangeIter<'txn, 'env, M> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let step = if !self.started {
            self.started = true;
            self.seek_start()
        } else if self.reverse {
            self.cursor.prev()
        } else {
            self.cursor.next()
        };
        match step {
            Ok(Some((key, value))) => {
                if self.within_bounds(&key) {
                    Some(Ok((key, value)))
                } else {
                    self.done = true;
                    None
                }
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
