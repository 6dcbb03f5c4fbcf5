//! # Bucket Tree
//!
//! A persistent, read-mostly index mapping an ascending virtual-offset space
//! to fixed-size entries.
//!
//! ## Storage layout
//!
//! A tree lives in three storages: a 16-byte header, a node storage and an
//! entry storage. Every node and every entry set is exactly `node_size` bytes
//! and starts with a 16-byte node header.
//!
//! ```text
//! header storage:  [magic "BKTR" u32][version u32][entry_count i32][reserved i32]
//!
//! node storage:    L1 node  [hdr {0, count, end_offset}][i64 offsets ...]
//!                  L2 node k at (k + 1) * node_size, same shape
//!
//! entry storage:   entry set i at i * node_size
//!                  [hdr {i, count, end}][entry 0][entry 1] ...
//! ```
//!
//! Each entry begins with its little-endian `i64` virtual offset; an entry's
//! validity range ends where the next entry begins, or at the tree's
//! `end_offset` for the last one.
//!
//! The L1 node is resident in memory. With few entry sets its offsets point
//! straight at them. With more sets than an L1 node can address, L2 nodes
//! are added and the unused tail of the L1 node holds the first entry sets
//! directly:
//!
//! ```text
//! L1: [L2 node 0 start][L2 node 1 start] .. | [set 0 start][set 1 start] ..
//!      <----------- count ------------->      <--- offset_count - count --->
//! ```
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use bucket_tree::{BucketTree, BucketTreeBuilder};
//! use storage::{MemoryStorage, Storage, SubStorage};
//!
//! let node_size = 1024;
//! let (header, node, entry) = (
//!     Arc::new(MemoryStorage::new(16)) as Arc<dyn Storage>,
//!     Arc::new(MemoryStorage::new(node_size)) as Arc<dyn Storage>,
//!     Arc::new(MemoryStorage::new(node_size)) as Arc<dyn Storage>,
//! );
//! let (node, entry) = (SubStorage::new(node, 0, 1024), SubStorage::new(entry, 0, 1024));
//!
//! let mut builder = BucketTreeBuilder::new(
//!     SubStorage::new(header, 0, 16), node.clone(), entry.clone(), node_size, 8, 2,
//! ).unwrap();
//! builder.add(&0i64.to_le_bytes()).unwrap();
//! builder.add(&0x100i64.to_le_bytes()).unwrap();
//! builder.finalize(0x200).unwrap();
//!
//! let tree = BucketTree::new(node, entry, node_size, 8, 2).unwrap();
//! let visitor = tree.find(0x180).unwrap();
//! assert_eq!(visitor.entry(), &0x100i64.to_le_bytes());
//! ```

mod builder;
mod continuous;
mod visitor;

pub use builder::BucketTreeBuilder;
pub use continuous::{ContinuousReadingEntry, ContinuousReadingInfo};
pub use visitor::Visitor;

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use buffers::AlignedBuffer;
use byteorder::{ByteOrder, LittleEndian};
use storage::{FsError, OperationId, Result, Storage, SubStorage};

/// `"BKTR"` read as a little-endian `u32`.
pub const MAGIC: u32 = u32::from_le_bytes(*b"BKTR");
pub const VERSION: u32 = 1;

pub const NODE_SIZE_MIN: usize = 1024;
pub const NODE_SIZE_MAX: usize = 512 * 1024;

pub const HEADER_SIZE: usize = 16;
pub const NODE_HEADER_SIZE: usize = 16;

const OFFSET_SIZE: usize = std::mem::size_of::<i64>();

pub(crate) type NodeBuffer = AlignedBuffer<8>;

/// A fixed-size record stored in a bucket tree.
///
/// The first eight bytes of the encoded form must be the entry's virtual
/// offset, little-endian.
pub trait BucketTreeEntry: Copy {
    const SIZE: usize;

    fn virtual_offset(&self) -> i64;

    /// Decodes from exactly `SIZE` bytes.
    fn decode(buf: &[u8]) -> Self;

    /// Encodes into exactly `SIZE` bytes.
    fn encode(&self, buf: &mut [u8]);
}

// ---- On-storage headers ----

/// The 16-byte header stored ahead of a tree's nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub magic: u32,
    pub version: u32,
    pub entry_count: i32,
    pub reserved: i32,
}

impl Header {
    /// A freshly formatted header for `entry_count` entries.
    ///
    /// # Panics
    ///
    /// Panics if `entry_count` is negative.
    #[must_use]
    pub fn new(entry_count: i32) -> Self {
        assert!(entry_count >= 0, "entry_count must be >= 0");
        Self {
            magic: MAGIC,
            version: VERSION,
            entry_count,
            reserved: 0,
        }
    }

    pub fn verify(&self) -> Result<()> {
        if self.magic != MAGIC {
            return Err(FsError::InvalidBucketTreeSignature);
        }
        if self.entry_count < 0 {
            return Err(FsError::InvalidBucketTreeEntryCount);
        }
        if self.version > VERSION {
            return Err(FsError::UnsupportedVersion);
        }
        Ok(())
    }

    #[must_use]
    pub fn decode(buf: &[u8]) -> Self {
        Self {
            magic: LittleEndian::read_u32(&buf[0..4]),
            version: LittleEndian::read_u32(&buf[4..8]),
            entry_count: LittleEndian::read_i32(&buf[8..12]),
            reserved: LittleEndian::read_i32(&buf[12..16]),
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        LittleEndian::write_u32(&mut buf[0..4], self.magic);
        LittleEndian::write_u32(&mut buf[4..8], self.version);
        LittleEndian::write_i32(&mut buf[8..12], self.entry_count);
        LittleEndian::write_i32(&mut buf[12..16], self.reserved);
        buf
    }

    /// Reads and verifies the header at offset 0 of `storage`.
    pub fn read_from(storage: &dyn Storage) -> Result<Self> {
        let mut buf = [0u8; HEADER_SIZE];
        storage.read(0, &mut buf)?;
        let header = Self::decode(&buf);
        header.verify()?;
        Ok(header)
    }
}

/// The 16-byte header opening every node and entry set.
///
/// `offset` is the end of the virtual range the node covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeHeader {
    pub index: i32,
    pub count: i32,
    pub offset: i64,
}

impl NodeHeader {
    /// Checks the header against the node's expected position and capacity.
    pub fn verify(&self, node_index: i32, node_size: usize, entry_size: usize) -> Result<()> {
        if self.index != node_index {
            return Err(FsError::InvalidBucketTreeNodeIndex);
        }
        if entry_size == 0 || node_size < entry_size + NODE_HEADER_SIZE {
            return Err(FsError::InvalidSize);
        }

        let max_entry_count = (node_size - NODE_HEADER_SIZE) / entry_size;
        if self.count <= 0 || self.count as usize > max_entry_count {
            return Err(FsError::InvalidBucketTreeNodeEntryCount);
        }
        if self.offset < 0 {
            return Err(FsError::InvalidBucketTreeNodeOffset);
        }
        Ok(())
    }

    #[must_use]
    pub fn decode(buf: &[u8]) -> Self {
        Self {
            index: LittleEndian::read_i32(&buf[0..4]),
            count: LittleEndian::read_i32(&buf[4..8]),
            offset: LittleEndian::read_i64(&buf[8..16]),
        }
    }

    pub fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_i32(&mut buf[0..4], self.index);
        LittleEndian::write_i32(&mut buf[4..8], self.count);
        LittleEndian::write_i64(&mut buf[8..16], self.offset);
    }
}

// ---- Size arithmetic ----

pub(crate) fn entry_count_per_node(node_size: usize, entry_size: usize) -> i32 {
    ((node_size - NODE_HEADER_SIZE) / entry_size) as i32
}

pub(crate) fn offset_count_per_node(node_size: usize) -> i32 {
    ((node_size - NODE_HEADER_SIZE) / OFFSET_SIZE) as i32
}

pub(crate) fn entry_set_count(node_size: usize, entry_size: usize, entry_count: i32) -> i32 {
    let per_node = i64::from(entry_count_per_node(node_size, entry_size));
    ((i64::from(entry_count) + per_node - 1) / per_node) as i32
}

/// Whether `entry_count` entries fit in a tree with at most one L2 level.
pub(crate) fn fits_single_l2(node_size: usize, entry_size: usize, entry_count: i32) -> bool {
    let offset_count = i64::from(offset_count_per_node(node_size));
    i64::from(entry_set_count(node_size, entry_size, entry_count)) <= offset_count * offset_count
}

pub(crate) fn node_l2_count(node_size: usize, entry_size: usize, entry_count: i32) -> i32 {
    let offset_count = offset_count_per_node(node_size);
    let set_count = entry_set_count(node_size, entry_size, entry_count);
    if set_count <= offset_count {
        return 0;
    }
    assert!(
        fits_single_l2(node_size, entry_size, entry_count),
        "bucket tree too large for a single L2 level"
    );

    let l2_count = (set_count + offset_count - 1) / offset_count;
    let remaining = set_count - (offset_count - (l2_count - 1));
    (remaining + offset_count - 1) / offset_count
}

/// Byte offset of entry `index` of entry set `set_index` within entry storage.
pub(crate) fn entry_offset(set_index: i32, node_size: usize, entry_size: usize, index: i32) -> i64 {
    set_index as i64 * node_size as i64 + NODE_HEADER_SIZE as i64 + index as i64 * entry_size as i64
}

fn check_geometry(node_size: usize, entry_size: usize) {
    assert!(entry_size >= OFFSET_SIZE, "entry_size must be >= 8");
    assert!(
        node_size >= entry_size + NODE_HEADER_SIZE,
        "node_size must hold at least one entry"
    );
    assert!(
        (NODE_SIZE_MIN..=NODE_SIZE_MAX).contains(&node_size) && node_size.is_power_of_two(),
        "node_size must be a power of two in NODE_SIZE_MIN..=NODE_SIZE_MAX"
    );
}

/// Bytes of header storage a tree needs.
#[must_use]
pub fn query_header_storage_size() -> i64 {
    HEADER_SIZE as i64
}

/// Bytes of node storage a tree of `entry_count` entries needs.
///
/// # Panics
///
/// Panics if the geometry is invalid or `entry_count` is negative.
#[must_use]
pub fn query_node_storage_size(node_size: usize, entry_size: usize, entry_count: i32) -> i64 {
    check_geometry(node_size, entry_size);
    assert!(entry_count >= 0, "entry_count must be >= 0");
    if entry_count == 0 {
        return 0;
    }
    (1 + node_l2_count(node_size, entry_size, entry_count) as i64) * node_size as i64
}

/// Bytes of entry storage a tree of `entry_count` entries needs.
///
/// # Panics
///
/// Panics if the geometry is invalid or `entry_count` is negative.
#[must_use]
pub fn query_entry_storage_size(node_size: usize, entry_size: usize, entry_count: i32) -> i64 {
    check_geometry(node_size, entry_size);
    assert!(entry_count >= 0, "entry_count must be >= 0");
    if entry_count == 0 {
        return 0;
    }
    entry_set_count(node_size, entry_size, entry_count) as i64 * node_size as i64
}

// ---- Tree ----

pub(crate) struct Storages {
    pub(crate) node: SubStorage,
    pub(crate) entry: SubStorage,
}

/// The resident L1 node and the range it spans.
pub(crate) struct Root {
    pub(crate) node: NodeBuffer,
    pub(crate) start_offset: i64,
    pub(crate) end_offset: i64,
}

impl Root {
    pub(crate) fn header(&self) -> NodeHeader {
        NodeHeader::decode(&self.node[..NODE_HEADER_SIZE])
    }

    pub(crate) fn offset(&self, index: i32) -> i64 {
        let at = NODE_HEADER_SIZE + index as usize * OFFSET_SIZE;
        LittleEndian::read_i64(&self.node[at..at + OFFSET_SIZE])
    }
}

/// An opened bucket tree.
///
/// Lookups take `&self` and may run concurrently. The L1 node is only
/// replaced by [`BucketTree::invalidate_cache`].
pub struct BucketTree {
    storages: Option<Storages>,
    root: RwLock<Root>,
    node_size: usize,
    entry_size: usize,
    entry_count: i32,
    offset_count: i32,
    entry_set_count: i32,
}

impl BucketTree {
    /// Opens a tree of `entry_count` entries over formatted node and entry
    /// storages, loading and validating the L1 node.
    ///
    /// # Panics
    ///
    /// Panics if `entry_size < 8`, or if `node_size` is not a power of two in
    /// `NODE_SIZE_MIN..=NODE_SIZE_MAX` large enough for one entry.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if `entry_count` is not positive or needs more than
    /// one L2 level.
    pub fn new(
        node_storage: SubStorage,
        entry_storage: SubStorage,
        node_size: usize,
        entry_size: usize,
        entry_count: i32,
    ) -> Result<Self> {
        check_geometry(node_size, entry_size);
        if entry_count <= 0 || !fits_single_l2(node_size, entry_size, entry_count) {
            return Err(FsError::InvalidArgument);
        }

        let offset_count = offset_count_per_node(node_size);
        let entry_set_count = entry_set_count(node_size, entry_size, entry_count);
        let root = load_root(&node_storage, node_size, offset_count, entry_set_count)?;

        tracing::debug!(
            node_size,
            entry_size,
            entry_count,
            entry_set_count,
            start_offset = root.start_offset,
            end_offset = root.end_offset,
            "bucket tree opened"
        );

        Ok(Self {
            storages: Some(Storages {
                node: node_storage,
                entry: entry_storage,
            }),
            root: RwLock::new(root),
            node_size,
            entry_size,
            entry_count,
            offset_count,
            entry_set_count,
        })
    }

    /// A tree with no entries spanning `[0, end_offset)`. Every lookup fails
    /// with `OutOfRange`.
    ///
    /// # Panics
    ///
    /// Panics if `node_size` is invalid or `end_offset <= 0`.
    #[must_use]
    pub fn empty(node_size: usize, end_offset: i64) -> Self {
        assert!(
            (NODE_SIZE_MIN..=NODE_SIZE_MAX).contains(&node_size) && node_size.is_power_of_two(),
            "node_size must be a power of two in NODE_SIZE_MIN..=NODE_SIZE_MAX"
        );
        assert!(end_offset > 0, "end_offset must be > 0");
        Self {
            storages: None,
            root: RwLock::new(Root {
                node: NodeBuffer::zeroed(0),
                start_offset: 0,
                end_offset,
            }),
            node_size,
            entry_size: 0,
            entry_count: 0,
            offset_count: 0,
            entry_set_count: 0,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.storages.is_none()
    }

    /// Positions a visitor on the entry covering `virtual_address`.
    ///
    /// Fails with `InvalidOffset` for a negative address, and with
    /// `OutOfRange` if the tree is empty or the address lies before the first
    /// entry or at/after the end offset.
    pub fn find(&self, virtual_address: i64) -> Result<Visitor<'_>> {
        if virtual_address < 0 {
            return Err(FsError::InvalidOffset);
        }
        if self.is_empty() {
            return Err(FsError::OutOfRange);
        }
        Visitor::find(self, virtual_address)
    }

    /// Drops cached copies of the tree's storages and reloads the L1 node.
    pub fn invalidate_cache(&self) -> Result<()> {
        let Some(storages) = &self.storages else {
            return Ok(());
        };

        let node_size = storages.node.size()?;
        storages.node.operate_range(OperationId::Invalidate, 0, node_size)?;

        let root = load_root(
            &storages.node,
            self.node_size,
            self.offset_count,
            self.entry_set_count,
        )?;
        *self.root_mut() = root;

        let entry_size = storages.entry.size()?;
        storages.entry.operate_range(OperationId::Invalidate, 0, entry_size)?;
        Ok(())
    }

    #[must_use]
    pub fn entry_count(&self) -> i32 {
        self.entry_count
    }

    #[must_use]
    pub fn node_size(&self) -> usize {
        self.node_size
    }

    #[must_use]
    pub fn entry_size(&self) -> usize {
        self.entry_size
    }

    #[must_use]
    pub fn start(&self) -> i64 {
        self.root().start_offset
    }

    #[must_use]
    pub fn end(&self) -> i64 {
        self.root().end_offset
    }

    #[must_use]
    pub fn size(&self) -> i64 {
        let root = self.root();
        root.end_offset - root.start_offset
    }

    /// True if `offset` lies in `[start, end)`.
    #[must_use]
    pub fn includes(&self, offset: i64) -> bool {
        let root = self.root();
        root.start_offset <= offset && offset < root.end_offset
    }

    /// True if `[offset, offset + size)` is non-empty and lies in `[start, end)`.
    #[must_use]
    pub fn includes_range(&self, offset: i64, size: i64) -> bool {
        let root = self.root();
        size > 0 && root.start_offset <= offset && size <= root.end_offset - offset
    }

    // ---- Internal helpers ----

    pub(crate) fn storages(&self) -> Result<&Storages> {
        self.storages.as_ref().ok_or(FsError::OutOfRange)
    }

    pub(crate) fn root(&self) -> RwLockReadGuard<'_, Root> {
        // The root is swapped whole, so a poisoned lock still holds a valid node.
        self.root.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn root_mut(&self) -> RwLockWriteGuard<'_, Root> {
        self.root.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn offset_count(&self) -> i32 {
        self.offset_count
    }

    pub(crate) fn entry_set_count(&self) -> i32 {
        self.entry_set_count
    }

    pub(crate) fn is_exist_l2(&self) -> bool {
        self.offset_count < self.entry_set_count
    }

    pub(crate) fn is_exist_offset_l2_on_l1(&self, l1_count: i32) -> bool {
        self.is_exist_l2() && l1_count < self.offset_count
    }

    /// Entry-set index for slot `offset_index` of L2 node `node_index`.
    pub(crate) fn entry_set_index(&self, l1_count: i32, node_index: i32, offset_index: i32) -> i32 {
        (self.offset_count - l1_count) + self.offset_count * node_index + offset_index
    }
}

impl std::fmt::Debug for BucketTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let root = self.root();
        f.debug_struct("BucketTree")
            .field("node_size", &self.node_size)
            .field("entry_size", &self.entry_size)
            .field("entry_count", &self.entry_count)
            .field("entry_set_count", &self.entry_set_count)
            .field("start_offset", &root.start_offset)
            .field("end_offset", &root.end_offset)
            .finish()
    }
}

fn load_root(node_storage: &SubStorage, node_size: usize, offset_count: i32, entry_set_count: i32) -> Result<Root> {
    let mut node = NodeBuffer::zeroed(node_size);
    node_storage.read(0, &mut node)?;

    let header = NodeHeader::decode(&node[..NODE_HEADER_SIZE]);
    header.verify(0, node_size, OFFSET_SIZE)?;

    let mut root = Root {
        node,
        start_offset: 0,
        end_offset: header.offset,
    };

    let begin_offset = root.offset(0);
    root.start_offset = if offset_count < entry_set_count && header.count < offset_count {
        root.offset(header.count)
    } else {
        begin_offset
    };

    if !(0 <= root.start_offset && root.start_offset <= begin_offset) {
        return Err(FsError::InvalidBucketTreeEntryOffset);
    }
    if root.start_offset >= root.end_offset {
        return Err(FsError::InvalidBucketTreeEntryOffset);
    }
    Ok(root)
}

/// Index of the last of `count` `stride`-spaced offsets starting at byte
/// `first` of `node` that is `<= virtual_address`, or -1 if none is.
pub(crate) fn upper_bound_index(node: &[u8], first: usize, stride: usize, count: i32, virtual_address: i64) -> i32 {
    let (mut lo, mut hi) = (0usize, count.max(0) as usize);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let at = first + mid * stride;
        if LittleEndian::read_i64(&node[at..at + OFFSET_SIZE]) <= virtual_address {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo as i32 - 1
}

#[cfg(test)]
mod tests;
