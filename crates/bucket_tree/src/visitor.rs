use byteorder::{ByteOrder, LittleEndian};
use storage::{FsError, Result, Storage};

use crate::{
    entry_offset, upper_bound_index, BucketTree, BucketTreeEntry, NodeBuffer, NodeHeader, NODE_HEADER_SIZE,
    OFFSET_SIZE,
};

/// The node header of an entry set, plus the offset of its first entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct EntrySetHeader {
    pub(crate) index: i32,
    pub(crate) count: i32,
    pub(crate) end: i64,
    pub(crate) start: i64,
}

impl EntrySetHeader {
    pub(crate) const SIZE: usize = NODE_HEADER_SIZE + OFFSET_SIZE;

    pub(crate) fn decode(buf: &[u8]) -> Self {
        let header = NodeHeader::decode(buf);
        Self {
            index: header.index,
            count: header.count,
            end: header.offset,
            start: LittleEndian::read_i64(&buf[NODE_HEADER_SIZE..Self::SIZE]),
        }
    }

    pub(crate) fn node_header(&self) -> NodeHeader {
        NodeHeader {
            index: self.index,
            count: self.count,
            offset: self.end,
        }
    }
}

/// A cursor over the entries of a [`BucketTree`].
///
/// Obtained from [`BucketTree::find`]; holds a copy of the current entry.
pub struct Visitor<'a> {
    tree: &'a BucketTree,
    entry: Vec<u8>,
    entry_index: i32,
    entry_set_count: i32,
    entry_set: EntrySetHeader,
}

impl<'a> Visitor<'a> {
    pub(crate) fn find(tree: &'a BucketTree, virtual_address: i64) -> Result<Self> {
        let mut visitor = Self {
            tree,
            entry: vec![0u8; tree.entry_size()],
            entry_index: -1,
            entry_set_count: 0,
            entry_set: EntrySetHeader::default(),
        };

        let entry_set_index = visitor.find_entry_set_index(virtual_address)?;
        if !(0..tree.entry_set_count()).contains(&entry_set_index) {
            return Err(FsError::InvalidBucketTreeNodeOffset);
        }

        visitor.find_entry(virtual_address, entry_set_index)?;
        visitor.entry_set_count = tree.entry_set_count();
        Ok(visitor)
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.entry_index >= 0
    }

    /// True if [`Visitor::move_next`] would land on another entry.
    #[must_use]
    pub fn can_move_next(&self) -> bool {
        self.is_valid()
            && (self.entry_index + 1 < self.entry_set.count || self.entry_set.index + 1 < self.entry_set_count)
    }

    /// True if [`Visitor::move_previous`] would land on another entry.
    #[must_use]
    pub fn can_move_previous(&self) -> bool {
        self.is_valid() && (self.entry_index > 0 || self.entry_set.index > 0)
    }

    /// Advances to the next entry, loading the following entry set when the
    /// current one is exhausted.
    ///
    /// The visitor is left invalid if the move fails.
    pub fn move_next(&mut self) -> Result<()> {
        if !self.is_valid() {
            return Err(FsError::OutOfRange);
        }

        let mut entry_index = self.entry_index + 1;
        if entry_index == self.entry_set.count {
            let entry_set_index = self.entry_set.index + 1;
            if entry_set_index >= self.entry_set_count {
                return Err(FsError::OutOfRange);
            }

            self.entry_index = -1;
            let end = self.entry_set.end;
            self.entry_set = self.read_entry_set_header(entry_set_index)?;

            if !(self.entry_set.start == end && self.entry_set.start < self.entry_set.end) {
                return Err(FsError::InvalidBucketTreeEntrySetOffset);
            }
            entry_index = 0;
        } else {
            self.entry_index = -1;
        }

        self.read_entry(entry_index)?;
        self.entry_index = entry_index;
        Ok(())
    }

    /// Steps back to the previous entry, loading the preceding entry set when
    /// at the start of the current one.
    ///
    /// The visitor is left invalid if the move fails.
    pub fn move_previous(&mut self) -> Result<()> {
        if !self.is_valid() {
            return Err(FsError::OutOfRange);
        }

        let mut entry_index = self.entry_index;
        if entry_index == 0 {
            if self.entry_set.index <= 0 {
                return Err(FsError::OutOfRange);
            }

            self.entry_index = -1;
            let start = self.entry_set.start;
            self.entry_set = self.read_entry_set_header(self.entry_set.index - 1)?;

            if !(self.entry_set.end == start && self.entry_set.start < self.entry_set.end) {
                return Err(FsError::InvalidBucketTreeEntrySetOffset);
            }
            entry_index = self.entry_set.count;
        } else {
            self.entry_index = -1;
        }

        entry_index -= 1;
        self.read_entry(entry_index)?;
        self.entry_index = entry_index;
        Ok(())
    }

    /// Raw bytes of the current entry.
    ///
    /// # Panics
    ///
    /// Panics if the visitor is not valid.
    #[must_use]
    pub fn entry(&self) -> &[u8] {
        assert!(self.is_valid(), "visitor is not positioned on an entry");
        &self.entry
    }

    /// The current entry decoded as `E`.
    ///
    /// # Panics
    ///
    /// Panics if the visitor is not valid or `E::SIZE` differs from the
    /// tree's entry size.
    #[must_use]
    pub fn get<E: BucketTreeEntry>(&self) -> E {
        assert_eq!(E::SIZE, self.entry.len(), "entry type size does not match the tree");
        E::decode(self.entry())
    }

    #[must_use]
    pub fn tree(&self) -> &'a BucketTree {
        self.tree
    }

    pub(crate) fn entry_index(&self) -> i32 {
        self.entry_index
    }

    pub(crate) fn entry_set(&self) -> EntrySetHeader {
        self.entry_set
    }

    // ---- Internal helpers ----

    fn find_entry_set_index(&self, virtual_address: i64) -> Result<i32> {
        let tree = self.tree;
        let root = tree.root();
        if virtual_address >= root.end_offset {
            return Err(FsError::OutOfRange);
        }

        let l1 = root.header();
        let offsets_start = NODE_HEADER_SIZE;

        if tree.is_exist_offset_l2_on_l1(l1.count) && virtual_address < root.offset(0) {
            // Entry sets addressed directly from the L1 tail.
            let tail_start = offsets_start + l1.count as usize * OFFSET_SIZE;
            let tail_count = tree.offset_count() - l1.count;
            let index = upper_bound_index(&root.node, tail_start, OFFSET_SIZE, tail_count, virtual_address);
            if index < 0 {
                return Err(FsError::OutOfRange);
            }
            return Ok(index);
        }

        let index = upper_bound_index(&root.node, offsets_start, OFFSET_SIZE, l1.count, virtual_address);
        if index < 0 {
            return Err(FsError::OutOfRange);
        }
        if !tree.is_exist_l2() {
            return Ok(index);
        }
        if index >= tree.offset_count() {
            return Err(FsError::InvalidBucketTreeNodeOffset);
        }

        let l1_count = l1.count;
        drop(root);
        self.find_entry_set_in_l2(virtual_address, index, l1_count)
    }

    fn find_entry_set_in_l2(&self, virtual_address: i64, node_index: i32, l1_count: i32) -> Result<i32> {
        let tree = self.tree;
        let node_size = tree.node_size();
        let storages = tree.storages()?;

        let mut node = NodeBuffer::zeroed(node_size);
        storages.node.read((node_index as i64 + 1) * node_size as i64, &mut node)?;

        let header = NodeHeader::decode(&node[..NODE_HEADER_SIZE]);
        header.verify(node_index, node_size, OFFSET_SIZE)?;

        let index = upper_bound_index(&node, NODE_HEADER_SIZE, OFFSET_SIZE, header.count, virtual_address);
        if index < 0 {
            return Err(FsError::InvalidBucketTreeVirtualOffset);
        }
        Ok(tree.entry_set_index(l1_count, header.index, index))
    }

    fn find_entry(&mut self, virtual_address: i64, entry_set_index: i32) -> Result<()> {
        let tree = self.tree;
        let node_size = tree.node_size();
        let entry_size = tree.entry_size();
        let storages = tree.storages()?;

        let mut node = NodeBuffer::zeroed(node_size);
        storages.entry.read(entry_set_index as i64 * node_size as i64, &mut node)?;

        let entry_set = EntrySetHeader::decode(&node);
        entry_set
            .node_header()
            .verify(entry_set_index, node_size, entry_size)?;

        let index = upper_bound_index(&node, NODE_HEADER_SIZE, entry_size, entry_set.count, virtual_address);
        if index < 0 {
            return Err(FsError::OutOfRange);
        }

        let at = NODE_HEADER_SIZE + index as usize * entry_size;
        self.entry.copy_from_slice(&node[at..at + entry_size]);
        self.entry_set = entry_set;
        self.entry_index = index;
        Ok(())
    }

    fn read_entry_set_header(&self, entry_set_index: i32) -> Result<EntrySetHeader> {
        let tree = self.tree;
        let node_size = tree.node_size();

        let mut buf = [0u8; EntrySetHeader::SIZE];
        tree.storages()?
            .entry
            .read(entry_set_index as i64 * node_size as i64, &mut buf)?;

        let entry_set = EntrySetHeader::decode(&buf);
        entry_set
            .node_header()
            .verify(entry_set_index, node_size, tree.entry_size())?;
        Ok(entry_set)
    }

    fn read_entry(&mut self, entry_index: i32) -> Result<()> {
        let tree = self.tree;
        let offset = entry_offset(self.entry_set.index, tree.node_size(), tree.entry_size(), entry_index);
        tree.storages()?.entry.read(offset, &mut self.entry)
    }
}

impl std::fmt::Debug for Visitor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Visitor")
            .field("entry_set", &self.entry_set.index)
            .field("entry_index", &self.entry_index)
            .field("entry_set_count", &self.entry_set_count)
            .finish()
    }
}
