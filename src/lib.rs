//! Embedded memory-mapped B+tree key-value store with MVCC transactions
//!
//! A single data file holds fixed-size pages organized into copy-on-write
//! B+trees. One write transaction runs at a time against unlimited
//! concurrent readers, each pinned to a consistent snapshot through a
//! double-buffered meta page. Commit publishes a new meta record as its only
//! atomic step; a crash before that step recovers to the previous committed
//! state on the next open.

#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod btree;
pub mod checksum;
pub mod comparator;
pub mod copy;
pub mod cursor;
pub mod db;
pub mod dupsort;
pub mod env;
pub mod error;
pub mod freelist;
pub mod io;
pub mod meta;
pub mod overflow;
pub mod page;
pub mod reader;
pub mod txn;

// Re-exports
pub use comparator::KeyOrdering;
pub use cursor::{Cursor, RangeIter, WriteCursor};
pub use db::{Database, DatabaseFlags, Key, Value, WriteFlags};
pub use env::{DurabilityMode, EnvBuilder, Environment};
pub use error::{Error, PageId, Result, TxnId};
pub use meta::{DbStat, EnvInfo};
pub use txn::{NestedTransaction, ReadTransaction, Transaction, WriteTransaction};

/// A read-only transaction
pub type RoTxn<'env> = Transaction<'env, txn::Read>;

/// A read-write transaction
pub type RwTxn<'env> = Transaction<'env, txn::Write>;

/// The page size (4 KiB)
pub const PAGE_SIZE: usize = page::PAGE_SIZE;

/// Maximum key size in bytes
pub const MAX_KEY_SIZE: usize = page::MAX_KEY_SIZE;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
