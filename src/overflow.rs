//! Overflow page runs
//!
//! Values larger than `MAX_INLINE_VALUE` move out of the leaf into a run of
//! consecutive overflow pages. The leaf node keeps the run's first page
//! number; the first page records the run length in pages and the value
//! length in bytes. Value bytes fill each page's data area in order.

use crate::error::{Error, PageId, Result};
use crate::page::{PageFlags, PageView, HEADER_SIZE, PAGE_SIZE};
use crate::txn::{mode, Transaction, Write};

/// Value bytes that fit in one overflow page
const BYTES_PER_PAGE: usize = PAGE_SIZE - HEADER_SIZE;

/// Number of pages a value of `len` bytes needs
pub fn run_pages(len: usize) -> u64 {
    (len.max(1)).div_ceil(BYTES_PER_PAGE) as u64
}

/// Write a value into a fresh overflow run, returning its first page number
pub fn write_run(txn: &mut Transaction<'_, Write>, value: &[u8]) -> Result<PageId> {
    let count = run_pages(value.len());
    let first = txn.alloc_run(count, PageFlags::OVERFLOW)?;

    for (index, chunk) in value.chunks(BYTES_PER_PAGE).enumerate() {
        let page = txn.page_mut(PageId(first.0 + index as u64))?;
        page.bytes_mut()[HEADER_SIZE..HEADER_SIZE + chunk.len()].copy_from_slice(chunk);
    }
    let head = txn.page_mut(first)?;
    head.set_overflow_len(count as u32);
    head.set_overflow_bytes(value.len() as u64);
    Ok(first)
}

/// Read a whole overflow run back into an owned value
pub fn read_run<M: mode::Mode>(txn: &Transaction<'_, M>, first: PageId) -> Result<Vec<u8>> {
    let (count, len) = {
        let head = txn.get_page(first)?;
        if !head.flags().contains(PageFlags::OVERFLOW) {
            return Err(Error::corrupt("expected an overflow page", first));
        }
        (head.overflow_len() as u64, head.overflow_bytes() as usize)
    };
    if count == 0 || count != run_pages(len) {
        return Err(Error::corrupt("overflow run length mismatch", first));
    }

    let mut value = Vec::with_capacity(len);
    let mut remaining = len;
    for index in 0..count {
        let page = txn.get_page(PageId(first.0 + index))?;
        if !page.flags().contains(PageFlags::OVERFLOW) {
            return Err(Error::corrupt("overflow run interrupted", PageId(first.0 + index)));
        }
        let take = remaining.min(BYTES_PER_PAGE);
        value.extend_from_slice(&page.bytes()[HEADER_SIZE..HEADER_SIZE + take]);
        remaining -= take;
    }
    Ok(value)
}

/// Retire a whole overflow run, returning the number of pages freed
pub fn free_run(txn: &mut Transaction<'_, Write>, first: PageId) -> Result<u64> {
    let count = {
        let head = txn.get_page(first)?;
        if !head.flags().contains(PageFlags::OVERFLOW) {
            return Err(Error::corrupt("expected an overflow page", first));
        }
        head.overflow_len() as u64
    };
    for index in 0..count {
        txn.free_page(PageId(first.0 + index));
    }
    Ok(count)
}

/// Collect the page numbers of a run without freeing it
pub fn run_page_ids<M: mode::Mode>(
    txn: &Transaction<'_, M>,
    first: PageId,
) -> Result<Vec<PageId>> {
    let count = {
        let head = txn.get_page(first)?;
        head.overflow_len() as u64
    };
    Ok((0..count).map(|i| PageId(first.0 + i)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_sizing() {
        assert_eq!(run_pages(1), 1);
        assert_eq!(run_pages(BYTES_PER_PAGE), 1);
        assert_eq!(run_pages(BYTES_PER_PAGE + 1), 2);
        assert_eq!(run_pages(10 * BYTES_PER_PAGE), 10);
    }

    #[test]
    fn write_read_round_trip() {
        use crate::env::EnvBuilder;
        use tempfile::TempDir;

        let dir = TempDir::new().unwrap();
        let env = EnvBuilder::new().open(dir.path()).unwrap();
        let mut txn = env.begin_write_txn().unwrap();

        let value: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let first = write_run(&mut txn, &value).unwrap();
        let back = read_run(&txn, first).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn free_returns_page_count() {
        use crate::env::EnvBuilder;
        use tempfile::TempDir;

        let dir = TempDir::new().unwrap();
        let env = EnvBuilder::new().open(dir.path()).unwrap();
        let mut txn = env.begin_write_txn().unwrap();

        let value = vec![0xCDu8; 3 * BYTES_PER_PAGE + 10];
        let first = write_run(&mut txn, &value).unwrap();
        assert_eq!(free_run(&mut txn, first).unwrap(), 4);
    }
}
