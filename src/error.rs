//! Error types for vellumdb

use std::fmt;
use std::io;
use thiserror::Error;

/// The main error type for vellumdb operations
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// I/O error occurred
    #[error("I/O error: {0}")]
    Io(String),

    /// Key (or key/value pair) not present
    #[error("key not found")]
    NotFound,

    /// Write rejected because the key (or exact duplicate) already exists
    #[error("key already exists")]
    KeyExists,

    /// Append-mode write with a key that is not greater than the current maximum
    #[error("append key out of order")]
    OutOfOrder,

    /// Another write transaction is active
    #[error("write transaction conflict")]
    TxnConflict,

    /// The configured map size is exhausted
    #[error("map full: cannot grow beyond {map_size} bytes")]
    MapFull {
        /// Configured maximum map size
        map_size: u64,
    },

    /// Too many named databases
    #[error("maximum database count reached")]
    DbsFull,

    /// Reader table full
    #[error("reader table full")]
    ReadersFull,

    /// A page failed a structural sanity check
    #[error("corrupt page: {details}")]
    CorruptPage {
        /// Description of the corruption
        details: String,
        /// Page where corruption was detected
        page: Option<PageId>,
    },

    /// A page checksum did not match its contents
    #[error("checksum mismatch on page {page}")]
    Checksum {
        /// Page that failed validation
        page: PageId,
    },

    /// Operation on a closed or consumed transaction, cursor, or database
    #[error("invalid handle: {0}")]
    InvalidHandle(&'static str),

    /// Database opened with flags that contradict its persisted configuration
    #[error("incompatible options: {0}")]
    IncompatibleOptions(&'static str),

    /// On-disk format version mismatch
    #[error("version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected format version
        expected: u32,
        /// Found format version
        found: u32,
    },

    /// Invalid parameter
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
}

/// Result type alias for vellumdb operations
pub type Result<T> = std::result::Result<T, Error>;

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl Error {
    /// Shorthand for a corruption error on a specific page
    pub(crate) fn corrupt(details: impl Into<String>, page: PageId) -> Self {
        Error::CorruptPage { details: details.into(), page: Some(page) }
    }
}

/// Page identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageId(pub u64);

impl PageId {
    /// Convert to byte offset in the backing file
    pub fn to_offset(self, page_size: usize) -> u64 {
        self.0 * page_size as u64
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxnId(pub u64);

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Page type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    /// Branch page (internal B+tree node)
    Branch,
    /// Leaf page (contains entries)
    Leaf,
    /// Overflow page (large values)
    Overflow,
    /// Meta page (store metadata)
    Meta,
    /// Unused page
    Free,
}
