//! Reader registry
//!
//! Read transactions register their snapshot id in a fixed table of atomic
//! slots. The minimum registered id is the reclamation watermark: pages freed
//! by transactions at or after it must not be reused. Readers never block
//! each other or the writer; a slot acquire is one CAS.

use crate::error::{Error, Result, TxnId};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Default number of reader slots
pub const DEFAULT_MAX_READERS: u32 = 126;

/// One reader slot
#[derive(Debug)]
pub struct ReaderSlot {
    /// Owning process id (0 = free)
    pid: AtomicU32,
    /// Registered snapshot transaction id
    txn_id: AtomicU64,
}

impl ReaderSlot {
    fn new() -> Self {
        Self { pid: AtomicU32::new(0), txn_id: AtomicU64::new(0) }
    }

    fn try_acquire(&self, txn_id: TxnId) -> bool {
        let pid = std::process::id();
        if self.pid.compare_exchange(0, pid, Ordering::AcqRel, Ordering::Acquire).is_ok() {
            self.txn_id.store(txn_id.0, Ordering::Release);
            true
        } else {
            false
        }
    }

    fn release(&self) {
        self.txn_id.store(0, Ordering::Release);
        self.pid.store(0, Ordering::Release);
    }

    fn is_free(&self) -> bool {
        self.pid.load(Ordering::Acquire) == 0
    }

    /// A slot is stale when its owning process no longer exists
    fn is_stale(&self) -> bool {
        let pid = self.pid.load(Ordering::Acquire);
        if pid == 0 {
            return false;
        }
        #[cfg(unix)]
        {
            unsafe { libc::kill(pid as i32, 0) != 0 }
        }
        #[cfg(not(unix))]
        {
            false
        }
    }
}

/// Table of reader slots
pub struct ReaderTable {
    slots: Vec<ReaderSlot>,
}

impl ReaderTable {
    /// Create a table with `max_readers` slots
    pub fn new(max_readers: usize) -> Self {
        let mut slots = Vec::with_capacity(max_readers);
        for _ in 0..max_readers {
            slots.push(ReaderSlot::new());
        }
        Self { slots }
    }

    /// Register a reader at `txn_id`, returning its slot index
    pub fn acquire(&self, txn_id: TxnId) -> Result<usize> {
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.try_acquire(txn_id) {
                return Ok(i);
            }
        }
        // Reclaim slots left behind by dead processes, then retry once
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.is_stale() {
                tracing::warn!(slot = i, "reclaiming stale reader slot");
                slot.release();
                if slot.try_acquire(txn_id) {
                    return Ok(i);
                }
            }
        }
        Err(Error::ReadersFull)
    }

    /// Re-point an owned slot at a newer snapshot
    pub fn update(&self, index: usize, txn_id: TxnId) {
        if let Some(slot) = self.slots.get(index) {
            slot.txn_id.store(txn_id.0, Ordering::Release);
        }
    }

    /// Release a slot
    pub fn release(&self, index: usize) {
        if let Some(slot) = self.slots.get(index) {
            slot.release();
        }
    }

    /// Oldest registered snapshot id, if any reader is active
    pub fn oldest(&self) -> Option<TxnId> {
        let mut oldest = None;
        for slot in &self.slots {
            let id = slot.txn_id.load(Ordering::Acquire);
            if id > 0 {
                match oldest {
                    None => oldest = Some(TxnId(id)),
                    Some(TxnId(o)) if id < o => oldest = Some(TxnId(id)),
                    _ => {}
                }
            }
        }
        oldest
    }

    /// Number of registered readers
    pub fn count(&self) -> usize {
        self.slots.iter().filter(|s| !s.is_free()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_release() {
        let table = ReaderTable::new(4);
        let a = table.acquire(TxnId(10)).unwrap();
        let b = table.acquire(TxnId(7)).unwrap();
        let c = table.acquire(TxnId(12)).unwrap();
        assert_eq!(table.count(), 3);
        assert_eq!(table.oldest(), Some(TxnId(7)));

        table.release(b);
        assert_eq!(table.count(), 2);
        assert_eq!(table.oldest(), Some(TxnId(10)));

        table.release(a);
        table.release(c);
        assert_eq!(table.count(), 0);
        assert_eq!(table.oldest(), None);
    }

    #[test]
    fn table_full() {
        let table = ReaderTable::new(2);
        let _a = table.acquire(TxnId(1)).unwrap();
        let _b = table.acquire(TxnId(2)).unwrap();
        assert!(matches!(table.acquire(TxnId(3)), Err(Error::ReadersFull)));
    }

    #[test]
    fn update_moves_watermark() {
        let table = ReaderTable::new(2);
        let a = table.acquire(TxnId(5)).unwrap();
        assert_eq!(table.oldest(), Some(TxnId(5)));
        table.update(a, TxnId(9));
        assert_eq!(table.oldest(), Some(TxnId(9)));
    }
}
