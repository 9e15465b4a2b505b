//! Memory-mapped page store backend
//!
//! One mapping covers the whole configured map size; the file underneath is
//! extended lazily as pages are allocated. Because the mapping never moves
//! after open, page references handed to readers stay valid for as long as
//! the environment lives, and growing the file never invalidates them.

use crate::error::{Error, PageId, Result};
use crate::page::{PageBuf, PAGE_SIZE};
use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

/// File growth step: 256 pages (1 MiB) per extension
const GROWTH_CHUNK_PAGES: u64 = 256;

/// Memory-mapped I/O backend
pub struct MmapBackend {
    file: File,
    /// Owner of the mapping; locked for flushes
    map: Mutex<MmapMut>,
    /// Cached mapping base. The mapping is created once and never remapped,
    /// so the base stays stable for the backend's lifetime.
    base: *mut u8,
    /// Mapping length in bytes (= configured map size)
    map_len: usize,
    /// Current file length in bytes (page-aligned)
    file_size: AtomicU64,
}

// The raw base pointer aliases the mapping owned behind the mutex. Concurrent
// access is disciplined by COW: no two parties ever touch the same page, and
// the mapping itself never moves.
unsafe impl Send for MmapBackend {}
unsafe impl Sync for MmapBackend {}

impl MmapBackend {
    /// Open or create the backing file and map `map_size` bytes of it
    pub fn open(path: &Path, map_size: u64, create: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(path)
            .map_err(|e| Error::Io(format!("{}: {e}", path.display())))?;

        let existing = file.metadata().map_err(|e| Error::Io(e.to_string()))?.len();
        let file_size = existing - existing % PAGE_SIZE as u64;

        // Never map less than what is already on disk
        let mut map_len = map_size.max(file_size);
        map_len += (PAGE_SIZE as u64 - map_len % PAGE_SIZE as u64) % PAGE_SIZE as u64;

        let mut map = unsafe {
            MmapOptions::new()
                .len(map_len as usize)
                .map_mut(&file)
                .map_err(|e| Error::Io(e.to_string()))?
        };
        let base = map.as_mut_ptr();

        Ok(Self {
            file,
            map: Mutex::new(map),
            base,
            map_len: map_len as usize,
            file_size: AtomicU64::new(file_size),
        })
    }

    /// Mapping size in bytes
    pub fn map_size(&self) -> u64 {
        self.map_len as u64
    }

    /// Current file size in pages
    pub fn size_in_pages(&self) -> u64 {
        self.file_size.load(Ordering::Acquire) / PAGE_SIZE as u64
    }

    /// Extend the file so that pages `0..pages` are addressable.
    ///
    /// Grows in 1 MiB steps to keep `set_len` calls off the per-page path.
    /// Page numbers are never invalidated; the mapping is untouched.
    pub fn grow(&self, pages: u64) -> Result<()> {
        let needed = pages * PAGE_SIZE as u64;
        if needed > self.map_len as u64 {
            return Err(Error::MapFull { map_size: self.map_len as u64 });
        }
        let current = self.file_size.load(Ordering::Acquire);
        if needed <= current {
            return Ok(());
        }
        let chunk = GROWTH_CHUNK_PAGES * PAGE_SIZE as u64;
        let target = needed.div_ceil(chunk).saturating_mul(chunk).min(self.map_len as u64);
        tracing::debug!(from = current, to = target, "growing store file");
        self.file.set_len(target).map_err(|e| Error::Io(e.to_string()))?;
        self.file_size.store(target, Ordering::Release);
        Ok(())
    }

    fn check_bounds(&self, page: PageId) -> Result<usize> {
        let offset = page.to_offset(PAGE_SIZE);
        if offset + PAGE_SIZE as u64 > self.file_size.load(Ordering::Acquire) {
            return Err(Error::corrupt("page beyond end of store", page));
        }
        Ok(offset as usize)
    }

    /// Read a page into an owned buffer
    pub fn read_page(&self, page: PageId) -> Result<PageBuf> {
        let offset = self.check_bounds(page)?;
        let bytes = unsafe { std::slice::from_raw_parts(self.base.add(offset), PAGE_SIZE) };
        PageBuf::from_bytes(bytes)
    }

    /// Zero-copy page reference.
    ///
    /// # Safety
    /// The caller must not outlive the environment with the reference, and
    /// must only request pages that are frozen under the COW discipline
    /// (committed pages visible to its snapshot).
    pub unsafe fn page_ref<'a>(&self, page: PageId) -> Result<&'a [u8]> {
        let offset = self.check_bounds(page)?;
        Ok(unsafe { std::slice::from_raw_parts(self.base.add(offset), PAGE_SIZE) })
    }

    /// Write a page image at its recorded page number
    pub fn write_page(&self, page: &PageBuf) -> Result<()> {
        use crate::page::PageView;
        let offset = self.check_bounds(page.pgno())?;
        unsafe {
            std::ptr::copy_nonoverlapping(page.bytes().as_ptr(), self.base.add(offset), PAGE_SIZE);
        }
        Ok(())
    }

    /// Synchronously flush the whole mapping
    pub fn sync(&self) -> Result<()> {
        self.map.lock().flush().map_err(|e| Error::Io(e.to_string()))
    }

    /// Schedule an asynchronous flush of the whole mapping
    pub fn sync_async(&self) -> Result<()> {
        self.map.lock().flush_async().map_err(|e| Error::Io(e.to_string()))
    }

    /// Synchronously flush the two meta pages only
    pub fn sync_meta(&self) -> Result<()> {
        self.map.lock().flush_range(0, 2 * PAGE_SIZE).map_err(|e| Error::Io(e.to_string()))
    }
}

/// Acquire an exclusive advisory lock on the writer lock file.
///
/// Blocking or immediate per the environment's writer policy; an immediate
/// failure surfaces as `TxnConflict`.
#[cfg(unix)]
pub fn lock_exclusive(file: &File, block: bool) -> Result<()> {
    use std::os::unix::io::AsRawFd;

    let mut op = libc::LOCK_EX;
    if !block {
        op |= libc::LOCK_NB;
    }
    let rc = unsafe { libc::flock(file.as_raw_fd(), op) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::WouldBlock {
            return Err(Error::TxnConflict);
        }
        return Err(Error::Io(err.to_string()));
    }
    Ok(())
}

/// Release the advisory writer lock
#[cfg(unix)]
pub fn unlock(file: &File) {
    use std::os::unix::io::AsRawFd;
    unsafe {
        libc::flock(file.as_raw_fd(), libc::LOCK_UN);
    }
}

#[cfg(not(unix))]
pub fn lock_exclusive(_file: &File, _block: bool) -> Result<()> {
    Ok(())
}

#[cfg(not(unix))]
pub fn unlock(_file: &File) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PageId;
    use crate::page::{PageFlags, PageView};
    use tempfile::TempDir;

    #[test]
    fn page_round_trip() {
        let dir = TempDir::new().unwrap();
        let io = MmapBackend::open(&dir.path().join("data.vdb"), 1 << 22, true).unwrap();
        io.grow(8).unwrap();

        let mut page = PageBuf::new(PageId(5), PageFlags::LEAF);
        page.bytes_mut()[64] = 0xAB;
        io.write_page(&page).unwrap();

        let back = io.read_page(PageId(5)).unwrap();
        assert_eq!(back.pgno(), PageId(5));
        assert_eq!(back.bytes()[64], 0xAB);
    }

    #[test]
    fn grow_is_bounded_by_map_size() {
        let dir = TempDir::new().unwrap();
        let io = MmapBackend::open(&dir.path().join("data.vdb"), 1 << 20, true).unwrap();
        // 1 MiB map = 256 pages
        io.grow(256).unwrap();
        assert!(matches!(io.grow(257), Err(Error::MapFull { .. })));
    }

    #[test]
    fn out_of_bounds_read_fails() {
        let dir = TempDir::new().unwrap();
        let io = MmapBackend::open(&dir.path().join("data.vdb"), 1 << 20, true).unwrap();
        io.grow(4).unwrap();
        assert!(io.read_page(PageId(1000)).is_err());
    }
}
