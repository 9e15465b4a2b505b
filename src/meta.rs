//! Meta records and database metadata
//!
//! Pages 0 and 1 hold two alternating meta records. A commit writes the slot
//! the new transaction id selects (`txnid % 2`); the opener takes the record
//! with the highest transaction id among those whose checksum validates. The
//! losing slot is the previous stable state, which is what makes crash
//! recovery a read-time decision instead of a replay.

use crate::error::{Error, PageId, PageType, Result, TxnId};
use crate::page::{PageBuf, PageView, HEADER_SIZE, PAGE_SIZE};
use byteorder::{ByteOrder, LittleEndian};
use crc32fast::Hasher;
use static_assertions::const_assert;

/// Page id of the first meta slot
pub const META_PAGE_A: PageId = PageId(0);

/// Page id of the second meta slot
pub const META_PAGE_B: PageId = PageId(1);

/// Initial root page of the free database
pub const FREE_ROOT_PAGE: PageId = PageId(2);

/// Initial root page of the main database
pub const MAIN_ROOT_PAGE: PageId = PageId(3);

/// Magic number identifying a vellumdb store
pub const MAGIC: u32 = 0x564C_4D44;

/// On-disk format version
pub const FORMAT_VERSION: u32 = 1;

/// Per-database record: flags, shape statistics, root page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbInfo {
    /// Database flags (see `DatabaseFlags`)
    pub flags: u32,
    /// Tree depth (1 = a single leaf)
    pub depth: u16,
    /// Number of branch pages
    pub branch_pages: u64,
    /// Number of leaf pages
    pub leaf_pages: u64,
    /// Number of overflow pages
    pub overflow_pages: u64,
    /// Number of entries (duplicate values counted individually)
    pub entries: u64,
    /// Root page number
    pub root: PageId,
}

impl DbInfo {
    /// Serialized size in bytes
    pub const SIZE: usize = 48;

    /// A fresh single-leaf database rooted at `root`
    pub fn new_leaf(flags: u32, root: PageId) -> Self {
        Self {
            flags,
            depth: 1,
            branch_pages: 0,
            leaf_pages: 1,
            overflow_pages: 0,
            entries: 0,
            root,
        }
    }

    /// Serialize into a 48-byte buffer
    pub fn write_to(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(&mut buf[0..], self.flags);
        LittleEndian::write_u16(&mut buf[4..], self.depth);
        LittleEndian::write_u16(&mut buf[6..], 0);
        LittleEndian::write_u64(&mut buf[8..], self.branch_pages);
        LittleEndian::write_u64(&mut buf[16..], self.leaf_pages);
        LittleEndian::write_u64(&mut buf[24..], self.overflow_pages);
        LittleEndian::write_u64(&mut buf[32..], self.entries);
        LittleEndian::write_u64(&mut buf[40..], self.root.0);
    }

    /// Serialize to an owned buffer
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        self.write_to(&mut buf);
        buf
    }

    /// Deserialize from a 48-byte buffer
    pub fn read_from(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(Error::InvalidParameter("database record too short"));
        }
        Ok(Self {
            flags: LittleEndian::read_u32(&buf[0..]),
            depth: LittleEndian::read_u16(&buf[4..]),
            branch_pages: LittleEndian::read_u64(&buf[8..]),
            leaf_pages: LittleEndian::read_u64(&buf[16..]),
            overflow_pages: LittleEndian::read_u64(&buf[24..]),
            entries: LittleEndian::read_u64(&buf[32..]),
            root: PageId(LittleEndian::read_u64(&buf[40..])),
        })
    }
}

// Meta record field offsets, relative to the page data area
const M_MAGIC: usize = 0;
const M_VERSION: usize = 4;
const M_PAGE_SIZE: usize = 8;
const M_MAX_READERS: usize = 12;
const M_MAX_DBS: usize = 16;
const M_LAST_PGNO: usize = 24;
const M_LAST_TXNID: usize = 32;
const M_MAP_SIZE: usize = 40;
const M_MAIN_DB: usize = 48;
const M_FREE_DB: usize = 96;
const M_CHECKSUM: usize = 144;

/// Serialized meta record size
pub const META_RECORD_SIZE: usize = 148;

const_assert!(HEADER_SIZE + META_RECORD_SIZE <= PAGE_SIZE);

/// A meta record: the root-of-roots for one committed state
#[derive(Debug, Clone, Copy)]
pub struct MetaRecord {
    /// Store page size
    pub page_size: u32,
    /// Maximum reader slots
    pub max_readers: u32,
    /// Maximum named databases
    pub max_dbs: u32,
    /// Highest allocated page number
    pub last_pgno: PageId,
    /// Transaction id that committed this record
    pub last_txnid: TxnId,
    /// Configured map size in bytes
    pub map_size: u64,
    /// Main database record
    pub main_db: DbInfo,
    /// Free database record
    pub free_db: DbInfo,
}

impl MetaRecord {
    /// The meta record of a freshly initialized store
    pub fn bootstrap(map_size: u64, max_readers: u32, max_dbs: u32) -> Self {
        Self {
            page_size: PAGE_SIZE as u32,
            max_readers,
            max_dbs,
            last_pgno: MAIN_ROOT_PAGE,
            last_txnid: TxnId(0),
            map_size,
            main_db: DbInfo::new_leaf(0, MAIN_ROOT_PAGE),
            free_db: DbInfo::new_leaf(0, FREE_ROOT_PAGE),
        }
    }

    /// Which meta slot this record's transaction id selects
    pub fn slot_for(txnid: TxnId) -> PageId {
        if txnid.0 % 2 == 0 {
            META_PAGE_A
        } else {
            META_PAGE_B
        }
    }

    /// Serialize this record into a meta page
    pub fn encode(&self, slot: PageId) -> PageBuf {
        let mut page = PageBuf::new(slot, crate::page::PageFlags::META);
        let data = &mut page.bytes_mut()[HEADER_SIZE..];
        LittleEndian::write_u32(&mut data[M_MAGIC..], MAGIC);
        LittleEndian::write_u32(&mut data[M_VERSION..], FORMAT_VERSION);
        LittleEndian::write_u32(&mut data[M_PAGE_SIZE..], self.page_size);
        LittleEndian::write_u32(&mut data[M_MAX_READERS..], self.max_readers);
        LittleEndian::write_u32(&mut data[M_MAX_DBS..], self.max_dbs);
        LittleEndian::write_u64(&mut data[M_LAST_PGNO..], self.last_pgno.0);
        LittleEndian::write_u64(&mut data[M_LAST_TXNID..], self.last_txnid.0);
        LittleEndian::write_u64(&mut data[M_MAP_SIZE..], self.map_size);
        self.main_db.write_to(&mut data[M_MAIN_DB..]);
        self.free_db.write_to(&mut data[M_FREE_DB..]);

        let mut hasher = Hasher::new();
        hasher.update(&data[..M_CHECKSUM]);
        let sum = hasher.finalize();
        LittleEndian::write_u32(&mut data[M_CHECKSUM..], sum);
        page
    }

    /// Decode and validate a meta record from a page image
    pub fn decode(view: &impl PageView) -> Result<Self> {
        if view.page_type() != PageType::Meta {
            return Err(Error::corrupt("expected a meta page", view.pgno()));
        }
        let data = &view.bytes()[HEADER_SIZE..];

        let mut hasher = Hasher::new();
        hasher.update(&data[..M_CHECKSUM]);
        if hasher.finalize() != LittleEndian::read_u32(&data[M_CHECKSUM..]) {
            return Err(Error::Checksum { page: view.pgno() });
        }

        let magic = LittleEndian::read_u32(&data[M_MAGIC..]);
        if magic != MAGIC {
            return Err(Error::corrupt(
                format!("bad magic number 0x{magic:08x}"),
                view.pgno(),
            ));
        }
        let version = LittleEndian::read_u32(&data[M_VERSION..]);
        if version != FORMAT_VERSION {
            return Err(Error::VersionMismatch { expected: FORMAT_VERSION, found: version });
        }
        let page_size = LittleEndian::read_u32(&data[M_PAGE_SIZE..]);
        if page_size as usize != PAGE_SIZE {
            return Err(Error::corrupt(
                format!("unsupported page size {page_size}"),
                view.pgno(),
            ));
        }

        Ok(Self {
            page_size,
            max_readers: LittleEndian::read_u32(&data[M_MAX_READERS..]),
            max_dbs: LittleEndian::read_u32(&data[M_MAX_DBS..]),
            last_pgno: PageId(LittleEndian::read_u64(&data[M_LAST_PGNO..])),
            last_txnid: TxnId(LittleEndian::read_u64(&data[M_LAST_TXNID..])),
            map_size: LittleEndian::read_u64(&data[M_MAP_SIZE..]),
            main_db: DbInfo::read_from(&data[M_MAIN_DB..])?,
            free_db: DbInfo::read_from(&data[M_FREE_DB..])?,
        })
    }
}

/// Shape statistics for one database
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DbStat {
    /// Page size in bytes
    pub page_size: u32,
    /// Tree depth
    pub depth: u32,
    /// Number of branch pages
    pub branch_pages: u64,
    /// Number of leaf pages
    pub leaf_pages: u64,
    /// Number of overflow pages
    pub overflow_pages: u64,
    /// Number of entries
    pub entries: u64,
}

impl DbStat {
    pub(crate) fn from_info(info: &DbInfo) -> Self {
        Self {
            page_size: PAGE_SIZE as u32,
            depth: info.depth as u32,
            branch_pages: info.branch_pages,
            leaf_pages: info.leaf_pages,
            overflow_pages: info.overflow_pages,
            entries: info.entries,
        }
    }
}

/// Whole-environment information
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvInfo {
    /// Configured map size in bytes
    pub map_size: u64,
    /// Highest allocated page number
    pub last_pgno: u64,
    /// Last committed transaction id
    pub last_txnid: u64,
    /// Maximum reader slots
    pub max_readers: u32,
    /// Currently registered readers
    pub num_readers: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_info_round_trip() {
        let info = DbInfo {
            flags: 0x14,
            depth: 3,
            branch_pages: 7,
            leaf_pages: 120,
            overflow_pages: 2,
            entries: 4096,
            root: PageId(42),
        };
        let bytes = info.to_bytes();
        assert_eq!(DbInfo::read_from(&bytes).unwrap(), info);
    }

    #[test]
    fn meta_record_round_trip() {
        let meta = MetaRecord::bootstrap(1 << 24, 126, 32);
        let page = meta.encode(META_PAGE_A);
        let decoded = MetaRecord::decode(&page).unwrap();
        assert_eq!(decoded.last_txnid, TxnId(0));
        assert_eq!(decoded.main_db.root, MAIN_ROOT_PAGE);
        assert_eq!(decoded.free_db.root, FREE_ROOT_PAGE);
        assert_eq!(decoded.map_size, 1 << 24);
    }

    #[test]
    fn meta_record_rejects_corruption() {
        let meta = MetaRecord::bootstrap(1 << 24, 126, 32);
        let mut page = meta.encode(META_PAGE_B);
        page.bytes_mut()[HEADER_SIZE + M_LAST_TXNID] ^= 1;
        assert!(matches!(MetaRecord::decode(&page), Err(Error::Checksum { .. })));
    }

    #[test]
    fn slot_alternates_with_txnid() {
        assert_eq!(MetaRecord::slot_for(TxnId(0)), META_PAGE_A);
        assert_eq!(MetaRecord::slot_for(TxnId(1)), META_PAGE_B);
        assert_eq!(MetaRecord::slot_for(TxnId(2)), META_PAGE_A);
    }
}
