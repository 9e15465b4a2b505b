//! Slotted page layout
//!
//! Pages are the fundamental unit of storage. Every page is `PAGE_SIZE` bytes:
//! a fixed header, a slot array of node offsets growing up from the header,
//! and node bodies growing down from the end of the page. All on-page
//! integers are little-endian so a page image is address-independent.
//!
//! Two flavors share one accessor surface: [`PageRef`] borrows bytes straight
//! out of the map (read path), [`PageBuf`] owns a copy (dirty/write path).

use crate::comparator::KeyOrdering;
use crate::error::{Error, PageId, PageType, Result};
use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};
use static_assertions::const_assert;

/// Page size in bytes
pub const PAGE_SIZE: usize = 4096;

/// Size of the page header
pub const HEADER_SIZE: usize = 32;

/// Size of a node header
pub const NODE_HEADER_SIZE: usize = 8;

/// Maximum key size in bytes
pub const MAX_KEY_SIZE: usize = 511;

/// Largest value stored inline in a leaf; anything bigger moves to overflow pages
pub const MAX_INLINE_VALUE: usize = PAGE_SIZE / 4;

const_assert!(PAGE_SIZE.is_power_of_two());
const_assert!(HEADER_SIZE + NODE_HEADER_SIZE + MAX_KEY_SIZE + MAX_INLINE_VALUE < PAGE_SIZE / 2);

// Header field offsets
const OFF_PGNO: usize = 0;
const OFF_FLAGS: usize = 8;
const OFF_NUM_KEYS: usize = 10;
const OFF_LOWER: usize = 12;
const OFF_UPPER: usize = 14;
const OFF_OVERFLOW: usize = 16;
const OFF_CHECKSUM: usize = 20;
const OFF_OVERFLOW_BYTES: usize = 24;

bitflags! {
    /// Flags for page types and states
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u16 {
        /// Branch page (internal B+tree node)
        const BRANCH = 0x01;
        /// Leaf page (contains entries)
        const LEAF = 0x02;
        /// Overflow page (large values)
        const OVERFLOW = 0x04;
        /// Meta page (store metadata)
        const META = 0x08;
        /// Page is dirty in the current write transaction
        const DIRTY = 0x10;
    }
}

bitflags! {
    /// Node flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NodeFlags: u16 {
        /// Value lives in an overflow page run; the stored bytes are the run's
        /// first page number
        const BIGDATA = 0x01;
        /// Value is the serialized root record of a nested duplicate tree
        const DUPTREE = 0x02;
    }
}

/// Result of searching for a key in a page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchResult {
    /// Key was found at index
    Found {
        /// Index of the found key
        index: usize,
    },
    /// Key was not found, would be inserted at position
    NotFound {
        /// Position where the key would be inserted
        insert_at: usize,
    },
}

/// Number of bytes a node physically occupies for its value
#[inline]
fn stored_len(flags: NodeFlags, vsize: u32) -> usize {
    if flags.contains(NodeFlags::BIGDATA) {
        8
    } else {
        vsize as usize
    }
}

/// Cost of an entry on a page: node header, key, stored value, slot
#[inline]
pub(crate) fn entry_cost(key_len: usize, stored: usize) -> usize {
    NODE_HEADER_SIZE + key_len + stored + 2
}

/// An owned copy of a node, used when rebuilding or splitting pages
#[derive(Debug, Clone)]
pub struct NodeEntry {
    /// Node flags
    pub flags: NodeFlags,
    /// Key bytes
    pub key: Vec<u8>,
    /// Physically stored value bytes
    pub stored: Vec<u8>,
    /// Declared value size
    pub vsize: u32,
}

impl NodeEntry {
    /// On-page cost of this entry, slot included
    pub fn cost(&self) -> usize {
        entry_cost(self.key.len(), self.stored.len())
    }
}

/// Read access to a page image
pub trait PageView {
    /// The raw page bytes (`PAGE_SIZE` long)
    fn bytes(&self) -> &[u8];

    /// Page number recorded in the header
    fn pgno(&self) -> PageId {
        PageId(LittleEndian::read_u64(&self.bytes()[OFF_PGNO..]))
    }

    /// Page flags
    fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(LittleEndian::read_u16(&self.bytes()[OFF_FLAGS..]))
    }

    /// Number of nodes on the page
    fn num_keys(&self) -> usize {
        LittleEndian::read_u16(&self.bytes()[OFF_NUM_KEYS..]) as usize
    }

    /// Lower free-space bound (end of the slot array)
    fn lower(&self) -> usize {
        LittleEndian::read_u16(&self.bytes()[OFF_LOWER..]) as usize
    }

    /// Upper free-space bound (start of node bodies)
    fn upper(&self) -> usize {
        LittleEndian::read_u16(&self.bytes()[OFF_UPPER..]) as usize
    }

    /// Overflow run length (overflow pages only)
    fn overflow_len(&self) -> u32 {
        LittleEndian::read_u32(&self.bytes()[OFF_OVERFLOW..])
    }

    /// Stored checksum (0 = none)
    fn checksum(&self) -> u32 {
        LittleEndian::read_u32(&self.bytes()[OFF_CHECKSUM..])
    }

    /// Total value length of an overflow run (first run page only)
    fn overflow_bytes(&self) -> u64 {
        LittleEndian::read_u64(&self.bytes()[OFF_OVERFLOW_BYTES..])
    }

    /// The page type according to the flags
    fn page_type(&self) -> PageType {
        let flags = self.flags();
        if flags.contains(PageFlags::BRANCH) {
            PageType::Branch
        } else if flags.contains(PageFlags::LEAF) {
            PageType::Leaf
        } else if flags.contains(PageFlags::OVERFLOW) {
            PageType::Overflow
        } else if flags.contains(PageFlags::META) {
            PageType::Meta
        } else {
            PageType::Free
        }
    }

    /// Bytes free between the slot array and the node bodies
    fn free_space(&self) -> usize {
        self.upper().saturating_sub(self.lower())
    }

    /// Slot value (absolute node offset) at index
    fn slot(&self, index: usize) -> usize {
        LittleEndian::read_u16(&self.bytes()[HEADER_SIZE + 2 * index..]) as usize
    }

    /// Node accessor at index
    fn node(&self, index: usize) -> Result<NodeRef<'_>> {
        if index >= self.num_keys() {
            return Err(Error::InvalidParameter("node index out of bounds"));
        }
        let offset = self.slot(index);
        if offset < self.upper() || offset + NODE_HEADER_SIZE > PAGE_SIZE {
            return Err(Error::corrupt("node offset out of bounds", self.pgno()));
        }
        let node = NodeRef { page: self.bytes(), offset };
        if offset + NODE_HEADER_SIZE + node.key_len() + node.stored_len() > PAGE_SIZE {
            return Err(Error::corrupt("node extends beyond page", self.pgno()));
        }
        Ok(node)
    }

    /// Binary search for a key among the page's nodes
    fn search(&self, key: &[u8], ord: KeyOrdering) -> Result<SearchResult> {
        let mut left = 0;
        let mut right = self.num_keys();
        while left < right {
            let mid = left + (right - left) / 2;
            let node_key = self.node(mid)?.key();
            match ord.compare(key, node_key) {
                std::cmp::Ordering::Less => right = mid,
                std::cmp::Ordering::Greater => left = mid + 1,
                std::cmp::Ordering::Equal => return Ok(SearchResult::Found { index: mid }),
            }
        }
        Ok(SearchResult::NotFound { insert_at: left })
    }

    /// Locate the child of a branch page that covers `key`.
    ///
    /// The first entry of a branch page carries an empty key and acts as the
    /// lower-bound child; its key is never compared.
    fn branch_child(&self, key: &[u8], ord: KeyOrdering) -> Result<(usize, PageId)> {
        let n = self.num_keys();
        if n == 0 {
            return Err(Error::corrupt("branch page with no children", self.pgno()));
        }
        let mut left = 1;
        let mut right = n;
        while left < right {
            let mid = left + (right - left) / 2;
            let node_key = self.node(mid)?.key();
            if ord.compare(node_key, key) == std::cmp::Ordering::Greater {
                right = mid;
            } else {
                left = mid + 1;
            }
        }
        let index = left - 1;
        let child = self.node(index)?.child();
        Ok((index, child))
    }

    /// Child page number at a branch index
    fn child_at(&self, index: usize) -> Result<PageId> {
        Ok(self.node(index)?.child())
    }

    /// Copy out all entries in slot order
    fn entries(&self) -> Result<Vec<NodeEntry>> {
        let mut out = Vec::with_capacity(self.num_keys());
        for i in 0..self.num_keys() {
            let node = self.node(i)?;
            out.push(NodeEntry {
                flags: node.flags(),
                key: node.key().to_vec(),
                stored: node.stored().to_vec(),
                vsize: node.vsize(),
            });
        }
        Ok(out)
    }

    /// Bytes the live entries would occupy on a freshly packed page
    fn live_bytes(&self) -> Result<usize> {
        let mut total = 0;
        for i in 0..self.num_keys() {
            let node = self.node(i)?;
            total += entry_cost(node.key_len(), node.stored_len());
        }
        Ok(total)
    }
}

/// A node within a page
#[derive(Clone, Copy)]
pub struct NodeRef<'a> {
    page: &'a [u8],
    offset: usize,
}

impl<'a> NodeRef<'a> {
    /// Node flags
    pub fn flags(&self) -> NodeFlags {
        NodeFlags::from_bits_truncate(LittleEndian::read_u16(&self.page[self.offset..]))
    }

    /// Key length in bytes
    pub fn key_len(&self) -> usize {
        LittleEndian::read_u16(&self.page[self.offset + 2..]) as usize
    }

    /// Declared value size. For `BIGDATA` nodes this is the true value length
    /// even though only the overflow page number is stored here.
    pub fn vsize(&self) -> u32 {
        LittleEndian::read_u32(&self.page[self.offset + 4..])
    }

    fn stored_len(&self) -> usize {
        stored_len(self.flags(), self.vsize())
    }

    /// The key bytes
    pub fn key(&self) -> &'a [u8] {
        let start = self.offset + NODE_HEADER_SIZE;
        &self.page[start..start + self.key_len()]
    }

    /// The physically stored value bytes
    pub fn stored(&self) -> &'a [u8] {
        let start = self.offset + NODE_HEADER_SIZE + self.key_len();
        &self.page[start..start + self.stored_len()]
    }

    /// Child page number (branch nodes and `BIGDATA` leaf nodes)
    pub fn child(&self) -> PageId {
        PageId(LittleEndian::read_u64(self.stored()))
    }
}

/// A borrowed page image (zero-copy read path)
#[derive(Clone, Copy)]
pub struct PageRef<'a> {
    bytes: &'a [u8],
}

impl<'a> PageRef<'a> {
    /// Wrap a `PAGE_SIZE` byte slice
    pub fn new(bytes: &'a [u8]) -> Result<Self> {
        if bytes.len() != PAGE_SIZE {
            return Err(Error::InvalidParameter("page slice must be PAGE_SIZE bytes"));
        }
        Ok(Self { bytes })
    }
}

impl PageView for PageRef<'_> {
    fn bytes(&self) -> &[u8] {
        self.bytes
    }
}

/// An owned page image (dirty/write path)
pub struct PageBuf {
    buf: Box<[u8; PAGE_SIZE]>,
}

impl PageView for PageBuf {
    fn bytes(&self) -> &[u8] {
        &self.buf[..]
    }
}

impl Clone for PageBuf {
    fn clone(&self) -> Self {
        Self { buf: Box::new(*self.buf) }
    }
}

impl PageBuf {
    /// Create a new empty page
    pub fn new(pgno: PageId, flags: PageFlags) -> Self {
        let mut page = Self { buf: Box::new([0u8; PAGE_SIZE]) };
        page.set_pgno(pgno);
        page.set_flags(flags);
        page.set_lower(HEADER_SIZE);
        page.set_upper(PAGE_SIZE);
        page
    }

    /// Copy a page image
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != PAGE_SIZE {
            return Err(Error::InvalidParameter("page slice must be PAGE_SIZE bytes"));
        }
        let mut page = Self { buf: Box::new([0u8; PAGE_SIZE]) };
        page.buf.copy_from_slice(bytes);
        Ok(page)
    }

    /// Mutable raw bytes
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..]
    }

    /// Set the page number
    pub fn set_pgno(&mut self, pgno: PageId) {
        LittleEndian::write_u64(&mut self.buf[OFF_PGNO..], pgno.0);
    }

    /// Replace the page flags
    pub fn set_flags(&mut self, flags: PageFlags) {
        LittleEndian::write_u16(&mut self.buf[OFF_FLAGS..], flags.bits());
    }

    /// Add flags to the page
    pub fn insert_flags(&mut self, flags: PageFlags) {
        let merged = self.flags() | flags;
        self.set_flags(merged);
    }

    fn set_num_keys(&mut self, n: usize) {
        LittleEndian::write_u16(&mut self.buf[OFF_NUM_KEYS..], n as u16);
    }

    fn set_lower(&mut self, v: usize) {
        LittleEndian::write_u16(&mut self.buf[OFF_LOWER..], v as u16);
    }

    fn set_upper(&mut self, v: usize) {
        LittleEndian::write_u16(&mut self.buf[OFF_UPPER..], v as u16);
    }

    /// Set the overflow run length
    pub fn set_overflow_len(&mut self, n: u32) {
        LittleEndian::write_u32(&mut self.buf[OFF_OVERFLOW..], n);
    }

    /// Set the stored checksum
    pub fn set_checksum(&mut self, sum: u32) {
        LittleEndian::write_u32(&mut self.buf[OFF_CHECKSUM..], sum);
    }

    /// Set the total value length of an overflow run
    pub fn set_overflow_bytes(&mut self, n: u64) {
        LittleEndian::write_u64(&mut self.buf[OFF_OVERFLOW_BYTES..], n);
    }

    fn set_slot(&mut self, index: usize, offset: usize) {
        LittleEndian::write_u16(&mut self.buf[HEADER_SIZE + 2 * index..], offset as u16);
    }

    /// Insert a node at `index`, keeping slot order.
    ///
    /// Returns `Ok(false)` if the page has no room; the caller compacts or
    /// splits. `vsize` is the declared value size, `stored` the bytes that
    /// physically land on the page (they differ for `BIGDATA`).
    pub fn try_insert_node(
        &mut self,
        index: usize,
        flags: NodeFlags,
        key: &[u8],
        stored: &[u8],
        vsize: u32,
    ) -> Result<bool> {
        let n = self.num_keys();
        if index > n {
            return Err(Error::InvalidParameter("node insert index out of bounds"));
        }
        let body = NODE_HEADER_SIZE + key.len() + stored.len();
        if self.free_space() < body + 2 {
            return Ok(false);
        }

        let offset = self.upper() - body;
        {
            let buf = &mut self.buf[offset..offset + body];
            LittleEndian::write_u16(&mut buf[0..], flags.bits());
            LittleEndian::write_u16(&mut buf[2..], key.len() as u16);
            LittleEndian::write_u32(&mut buf[4..], vsize);
            buf[NODE_HEADER_SIZE..NODE_HEADER_SIZE + key.len()].copy_from_slice(key);
            buf[NODE_HEADER_SIZE + key.len()..].copy_from_slice(stored);
        }

        // Shift slots at and after `index` one position right
        let slot_start = HEADER_SIZE + 2 * index;
        let slot_end = HEADER_SIZE + 2 * n;
        self.buf.copy_within(slot_start..slot_end, slot_start + 2);
        self.set_slot(index, offset);

        self.set_upper(offset);
        self.set_lower(HEADER_SIZE + 2 * (n + 1));
        self.set_num_keys(n + 1);
        Ok(true)
    }

    /// Insert an owned entry at `index`
    pub(crate) fn try_insert_entry(&mut self, index: usize, entry: &NodeEntry) -> Result<bool> {
        self.try_insert_node(index, entry.flags, &entry.key, &entry.stored, entry.vsize)
    }

    /// Remove the node at `index`.
    ///
    /// The node body is left in place and reclaimed on the next rebuild.
    pub fn remove_node(&mut self, index: usize) -> Result<()> {
        let n = self.num_keys();
        if index >= n {
            return Err(Error::InvalidParameter("node index out of bounds"));
        }
        let slot_start = HEADER_SIZE + 2 * (index + 1);
        let slot_end = HEADER_SIZE + 2 * n;
        self.buf.copy_within(slot_start..slot_end, slot_start - 2);
        self.set_num_keys(n - 1);
        self.set_lower(HEADER_SIZE + 2 * (n - 1));
        Ok(())
    }

    /// Overwrite the stored value of a node in place (same physical size only)
    pub fn patch_value(&mut self, index: usize, stored: &[u8]) -> Result<()> {
        let (start, len) = {
            let node = self.node(index)?;
            (node.offset + NODE_HEADER_SIZE + node.key_len(), node.stored_len())
        };
        if stored.len() != len {
            return Err(Error::InvalidParameter("patched value must keep its size"));
        }
        self.buf[start..start + len].copy_from_slice(stored);
        Ok(())
    }

    /// Mutable view of a node's stored value (for reserve-style writes)
    pub fn value_mut(&mut self, index: usize) -> Result<&mut [u8]> {
        let (start, len) = {
            let node = self.node(index)?;
            (node.offset + NODE_HEADER_SIZE + node.key_len(), node.stored_len())
        };
        Ok(&mut self.buf[start..start + len])
    }

    /// Drop all nodes, keeping page identity and flags
    pub fn clear_nodes(&mut self) {
        self.set_num_keys(0);
        self.set_lower(HEADER_SIZE);
        self.set_upper(PAGE_SIZE);
    }

    /// Repack the page from an entry list, reclaiming dead node bodies
    pub(crate) fn rebuild(&mut self, entries: &[NodeEntry]) -> Result<()> {
        self.clear_nodes();
        for (i, entry) in entries.iter().enumerate() {
            if !self.try_insert_entry(i, entry)? {
                return Err(Error::corrupt("rebuild overflowed page", self.pgno()));
            }
        }
        Ok(())
    }
}

/// Pick a split index for `entries` so both halves fit in a page.
///
/// Prefers a byte-balanced split, then nudges the boundary until each half
/// fits. Both halves are guaranteed to fit whenever the combined payload is
/// at most one page plus one maximum-size entry.
pub(crate) fn split_index(entries: &[NodeEntry]) -> usize {
    debug_assert!(entries.len() >= 2);
    let capacity = PAGE_SIZE - HEADER_SIZE;
    let costs: Vec<usize> = entries.iter().map(|e| e.cost()).collect();
    let total: usize = costs.iter().sum();

    let mut prefix = 0;
    let mut index = entries.len() - 1;
    for (i, cost) in costs.iter().enumerate() {
        prefix += cost;
        if prefix * 2 >= total && i + 1 < entries.len() {
            index = i + 1;
            break;
        }
    }
    index = index.clamp(1, entries.len() - 1);

    let left_bytes = |i: usize| -> usize { costs[..i].iter().sum() };
    while index > 1 && left_bytes(index) > capacity {
        index -= 1;
    }
    while index + 1 < entries.len() && total - left_bytes(index) > capacity {
        index += 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf() -> PageBuf {
        PageBuf::new(PageId(7), PageFlags::LEAF)
    }

    #[test]
    fn page_creation() {
        let page = leaf();
        assert_eq!(page.pgno(), PageId(7));
        assert_eq!(page.flags(), PageFlags::LEAF);
        assert_eq!(page.num_keys(), 0);
        assert_eq!(page.free_space(), PAGE_SIZE - HEADER_SIZE);
    }

    #[test]
    fn insert_and_read_nodes() {
        let mut page = leaf();
        assert!(page.try_insert_node(0, NodeFlags::empty(), b"bbb", b"2", 1).unwrap());
        assert!(page.try_insert_node(0, NodeFlags::empty(), b"aaa", b"1", 1).unwrap());
        assert!(page.try_insert_node(2, NodeFlags::empty(), b"ccc", b"3", 1).unwrap());

        assert_eq!(page.num_keys(), 3);
        assert_eq!(page.node(0).unwrap().key(), b"aaa");
        assert_eq!(page.node(1).unwrap().key(), b"bbb");
        assert_eq!(page.node(2).unwrap().key(), b"ccc");
        assert_eq!(page.node(1).unwrap().stored(), b"2");
    }

    #[test]
    fn search_nodes() {
        let mut page = leaf();
        for (i, key) in [b"aaa", b"ccc", b"eee"].iter().enumerate() {
            page.try_insert_node(i, NodeFlags::empty(), *key, b"x", 1).unwrap();
        }

        match page.search(b"ccc", KeyOrdering::Lexicographic).unwrap() {
            SearchResult::Found { index } => assert_eq!(index, 1),
            other => panic!("expected Found, got {other:?}"),
        }
        match page.search(b"bbb", KeyOrdering::Lexicographic).unwrap() {
            SearchResult::NotFound { insert_at } => assert_eq!(insert_at, 1),
            other => panic!("expected NotFound, got {other:?}"),
        }
        match page.search(b"zzz", KeyOrdering::Lexicographic).unwrap() {
            SearchResult::NotFound { insert_at } => assert_eq!(insert_at, 3),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn remove_and_rebuild() {
        let mut page = leaf();
        for i in 0..10u8 {
            let key = [b'k', b'0' + i];
            page.try_insert_node(i as usize, NodeFlags::empty(), &key, &[i], 1).unwrap();
        }
        page.remove_node(4).unwrap();
        assert_eq!(page.num_keys(), 9);
        assert_eq!(page.node(4).unwrap().key(), b"k5");

        let entries = page.entries().unwrap();
        page.rebuild(&entries).unwrap();
        assert_eq!(page.num_keys(), 9);
        assert_eq!(page.free_space(), PAGE_SIZE - HEADER_SIZE - page.live_bytes().unwrap());
    }

    #[test]
    fn branch_child_lookup() {
        let mut page = PageBuf::new(PageId(9), PageFlags::BRANCH);
        let children = [(b"".as_ref(), 10u64), (b"f".as_ref(), 11), (b"m".as_ref(), 12)];
        for (i, (key, child)) in children.iter().enumerate() {
            page.try_insert_node(i, NodeFlags::empty(), key, &child.to_le_bytes(), 8).unwrap();
        }

        let ord = KeyOrdering::Lexicographic;
        assert_eq!(page.branch_child(b"a", ord).unwrap(), (0, PageId(10)));
        assert_eq!(page.branch_child(b"f", ord).unwrap(), (1, PageId(11)));
        assert_eq!(page.branch_child(b"k", ord).unwrap(), (1, PageId(11)));
        assert_eq!(page.branch_child(b"z", ord).unwrap(), (2, PageId(12)));
    }

    #[test]
    fn split_index_halves_fit() {
        let giant = NodeEntry {
            flags: NodeFlags::empty(),
            key: vec![0u8; MAX_KEY_SIZE],
            stored: vec![0u8; MAX_INLINE_VALUE],
            vsize: MAX_INLINE_VALUE as u32,
        };
        let entries = vec![giant.clone(), giant.clone(), giant];
        let idx = split_index(&entries);
        let capacity = PAGE_SIZE - HEADER_SIZE;
        let left: usize = entries[..idx].iter().map(|e| e.cost()).sum();
        let right: usize = entries[idx..].iter().map(|e| e.cost()).sum();
        assert!(left <= capacity);
        assert!(right <= capacity);
    }
}
