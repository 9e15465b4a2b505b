//! Environment copying
//!
//! Copies run under a read transaction, so they see one committed snapshot
//! no matter how many commits land while the copy is in flight: the pinned
//! snapshot keeps every page it references from being reclaimed. The copy
//! gets a fresh meta pair describing that snapshot and opens like any other
//! store.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use crate::checksum;
use crate::env::Environment;
use crate::error::{Error, PageId, Result};
use crate::meta::{META_PAGE_A, META_PAGE_B};
use crate::page::PageView;

/// Copy the environment into `path` (a directory, created if needed)
pub fn copy_to_path(env: &Environment, path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)?;
    let data_path = path.join("data.vdb");
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&data_path)
        .map_err(|e| Error::Io(format!("{}: {e}", data_path.display())))?;

    let txn = env.begin_txn()?;
    let meta = txn.meta;
    tracing::debug!(
        txn = meta.last_txnid.0,
        pages = meta.last_pgno.0 + 1,
        "copying environment snapshot"
    );

    // Both slots carry the snapshot record; commit alternation re-diverges
    // them on the first write to the copy.
    for slot in [META_PAGE_A, META_PAGE_B] {
        let mut page = meta.encode(slot);
        checksum::stamp(&mut page);
        file.write_all(page.bytes())?;
    }

    for pgno in 2..=meta.last_pgno.0 {
        let page = txn.get_page(PageId(pgno))?;
        file.write_all(page.bytes())?;
    }

    file.flush()?;
    file.sync_all()?;
    Ok(())
}
