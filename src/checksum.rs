//! Page checksums
//!
//! Every page written at commit carries a CRC32 over its contents (excluding
//! the checksum field itself). Meta records are additionally checksummed on
//! their own so the opener can pick the newest intact one after a crash.

use crate::error::{Error, Result};
use crate::page::{PageBuf, PageView};
use crc32fast::Hasher;

// Byte range of the checksum field inside the page header
const SUM_START: usize = 20;
const SUM_END: usize = 24;

/// CRC32 over a page image, skipping the checksum field
pub fn page_checksum(bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&bytes[..SUM_START]);
    hasher.update(&bytes[SUM_END..]);
    hasher.finalize()
}

/// Stamp a page with its current checksum
pub fn stamp(page: &mut PageBuf) {
    let sum = page_checksum(page.bytes());
    page.set_checksum(sum);
}

/// Validate a page image against its stored checksum.
///
/// A zero checksum means the page was never stamped (pre-allocated root
/// pages); that is accepted.
pub fn verify(view: &impl PageView) -> Result<()> {
    let stored = view.checksum();
    if stored == 0 {
        return Ok(());
    }
    let computed = page_checksum(view.bytes());
    if computed != stored {
        return Err(Error::Checksum { page: view.pgno() });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PageId;
    use crate::page::{NodeFlags, PageFlags};

    #[test]
    fn stamp_and_verify() {
        let mut page = PageBuf::new(PageId(5), PageFlags::LEAF);
        page.try_insert_node(0, NodeFlags::empty(), b"key", b"value", 5).unwrap();
        stamp(&mut page);
        assert_ne!(page.checksum(), 0);
        verify(&page).unwrap();
    }

    #[test]
    fn detects_corruption() {
        let mut page = PageBuf::new(PageId(5), PageFlags::LEAF);
        page.try_insert_node(0, NodeFlags::empty(), b"key", b"value", 5).unwrap();
        stamp(&mut page);

        page.bytes_mut()[100] ^= 0xFF;
        assert!(matches!(verify(&page), Err(Error::Checksum { page: PageId(5) })));
    }

    #[test]
    fn unstamped_page_passes() {
        let page = PageBuf::new(PageId(5), PageFlags::LEAF);
        assert_eq!(page.checksum(), 0);
        verify(&page).unwrap();
    }
}
