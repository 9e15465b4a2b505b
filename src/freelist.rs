//! Free page tracking and recycling
//!
//! Retired pages live in the free database as one entry per freeing
//! transaction: key = transaction id (8-byte big-endian so entries sort by
//! id), value = the page numbers it retired (concatenated 8-byte
//! little-endian). A write transaction loads this map at
//! begin, moves every entry older than the reclamation watermark into its
//! in-memory available set, and records its own frees as a new entry at
//! commit. Allocation hands out the smallest available page number first.

use crate::error::{PageId, TxnId};
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use std::collections::{BTreeMap, BTreeSet};

/// In-memory free-page state of the active write transaction
#[derive(Debug, Default)]
pub struct FreeList {
    /// Pages safe to hand out in this transaction
    available: BTreeSet<PageId>,
    /// Entries still gated by the watermark, keyed by freeing transaction
    retired: BTreeMap<TxnId, Vec<PageId>>,
}

impl FreeList {
    /// Empty free list
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one loaded free-database entry
    pub fn load_entry(&mut self, txn: TxnId, pages: Vec<PageId>) {
        self.retired.insert(txn, pages);
    }

    /// Move entries older than `watermark` into the available set.
    ///
    /// Returns the transaction ids whose entries were consumed so the caller
    /// can delete them from the free database.
    pub fn reclaim(&mut self, watermark: TxnId) -> Vec<TxnId> {
        let ready: Vec<TxnId> =
            self.retired.range(..watermark).map(|(txn, _)| *txn).collect();
        for txn in &ready {
            if let Some(pages) = self.retired.remove(txn) {
                tracing::trace!(txn = txn.0, pages = pages.len(), "reclaiming freed pages");
                self.available.extend(pages);
            }
        }
        ready
    }

    /// Take the smallest available page, if any
    pub fn alloc(&mut self) -> Option<PageId> {
        let page = *self.available.iter().next()?;
        self.available.remove(&page);
        Some(page)
    }

    /// Take `count` consecutive pages, if such a run exists
    pub fn alloc_run(&mut self, count: u64) -> Option<PageId> {
        let mut start = None;
        let mut run = 0u64;
        for &page in self.available.iter() {
            match start {
                Some(s) if page.0 == s + run => {
                    run += 1;
                }
                _ => {
                    start = Some(page.0);
                    run = 1;
                }
            }
            if run == count {
                let first = start.expect("run start exists");
                for offset in 0..count {
                    self.available.remove(&PageId(first + offset));
                }
                return Some(PageId(first));
            }
        }
        None
    }

    /// Return a page to the available set (same-transaction alloc/free churn)
    pub fn push_available(&mut self, page: PageId) {
        self.available.insert(page);
    }

    /// Take every available page; the commit path folds unused reclaimed
    /// pages back into the transaction's freed set so they are not lost.
    pub fn drain_available(&mut self) -> Vec<PageId> {
        let pages: Vec<PageId> = self.available.iter().copied().collect();
        self.available.clear();
        pages
    }

    /// Number of immediately available pages
    pub fn available_len(&self) -> usize {
        self.available.len()
    }

    /// Whether entries are still gated by the watermark
    pub fn has_retired(&self) -> bool {
        !self.retired.is_empty()
    }
}

/// Decode a free-database entry
pub fn decode_entry(key: &[u8], value: &[u8]) -> Option<(TxnId, Vec<PageId>)> {
    if key.len() != 8 {
        return None;
    }
    let txn = TxnId(BigEndian::read_u64(key));
    let mut pages = Vec::with_capacity(value.len() / 8);
    for chunk in value.chunks_exact(8) {
        pages.push(PageId(LittleEndian::read_u64(chunk)));
    }
    Some((txn, pages))
}

/// Encode the page list of a free-database entry
pub fn encode_pages(pages: &BTreeSet<PageId>) -> Vec<u8> {
    let mut out = Vec::with_capacity(pages.len() * 8);
    for page in pages {
        out.extend_from_slice(&page.0.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watermark_gates_reclamation() {
        let mut list = FreeList::new();
        list.load_entry(TxnId(3), vec![PageId(10), PageId(11)]);
        list.load_entry(TxnId(5), vec![PageId(20)]);
        list.load_entry(TxnId(9), vec![PageId(30)]);

        let ready = list.reclaim(TxnId(6));
        assert_eq!(ready, vec![TxnId(3), TxnId(5)]);
        assert_eq!(list.available_len(), 3);
        assert!(list.has_retired());

        assert_eq!(list.alloc(), Some(PageId(10)));
        assert_eq!(list.alloc(), Some(PageId(11)));
        assert_eq!(list.alloc(), Some(PageId(20)));
        assert_eq!(list.alloc(), None);
    }

    #[test]
    fn run_allocation_needs_consecutive_pages() {
        let mut list = FreeList::new();
        for id in [4u64, 5, 6, 9, 10, 11, 12] {
            list.push_available(PageId(id));
        }
        // First consecutive run of 4 starts at 9
        assert_eq!(list.alloc_run(4), Some(PageId(9)));
        assert_eq!(list.available_len(), 3);
        assert_eq!(list.alloc_run(4), None);
        assert_eq!(list.alloc_run(3), Some(PageId(4)));
    }

    #[test]
    fn entry_round_trip() {
        let mut pages = BTreeSet::new();
        pages.insert(PageId(7));
        pages.insert(PageId(42));
        let value = encode_pages(&pages);
        let key = 12u64.to_be_bytes();
        let (txn, decoded) = decode_entry(&key, &value).unwrap();
        assert_eq!(txn, TxnId(12));
        assert_eq!(decoded, vec![PageId(7), PageId(42)]);
    }
}
