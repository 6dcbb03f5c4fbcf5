use byteorder::{ByteOrder, LittleEndian};
use storage::{FsError, Result, Storage, SubStorage};

use crate::{
    check_geometry, entry_count_per_node, entry_set_count, fits_single_l2, node_l2_count, offset_count_per_node, Header,
    NodeBuffer, NodeHeader, NODE_HEADER_SIZE, OFFSET_SIZE,
};

/// Writes a bucket tree from entries supplied in ascending order.
///
/// Entry sets are written as they fill; the L1 and L2 nodes are written by
/// [`BucketTreeBuilder::finalize`], which must be called once all
/// `entry_count` entries have been added.
pub struct BucketTreeBuilder {
    node_storage: SubStorage,
    entry_storage: SubStorage,
    node_size: usize,
    entry_size: usize,
    entry_count: i32,
    entries_per_set: i32,
    /// Start offset of every completed entry set.
    set_starts: Vec<i64>,
    current_set: NodeBuffer,
    current_count: i32,
    added: i32,
    last_offset: i64,
}

impl BucketTreeBuilder {
    /// Writes a header for `entry_count` entries and prepares to accept them.
    ///
    /// # Panics
    ///
    /// Panics on an invalid geometry (see [`crate::BucketTree::new`]) or a
    /// non-positive `entry_count`. An `entry_count` needing more than one L2
    /// level fails with `InvalidArgument` before the header is written.
    pub fn new(
        header_storage: SubStorage,
        node_storage: SubStorage,
        entry_storage: SubStorage,
        node_size: usize,
        entry_size: usize,
        entry_count: i32,
    ) -> Result<Self> {
        check_geometry(node_size, entry_size);
        assert!(entry_count > 0, "entry_count must be > 0");
        if !fits_single_l2(node_size, entry_size, entry_count) {
            return Err(FsError::InvalidArgument);
        }

        header_storage.write(0, &Header::new(entry_count).to_bytes())?;

        Ok(Self {
            node_storage,
            entry_storage,
            node_size,
            entry_size,
            entry_count,
            entries_per_set: entry_count_per_node(node_size, entry_size),
            set_starts: Vec::with_capacity(entry_set_count(node_size, entry_size, entry_count) as usize),
            current_set: NodeBuffer::zeroed(node_size),
            current_count: 0,
            added: 0,
            last_offset: -1,
        })
    }

    /// Appends one encoded entry.
    ///
    /// Fails with `InvalidArgument` if the entry has the wrong size, more
    /// than `entry_count` entries are added, or its offset does not strictly
    /// exceed the previous entry's.
    pub fn add(&mut self, entry: &[u8]) -> Result<()> {
        if entry.len() != self.entry_size || self.added >= self.entry_count {
            return Err(FsError::InvalidArgument);
        }
        let offset = LittleEndian::read_i64(&entry[..OFFSET_SIZE]);
        if offset < 0 || offset <= self.last_offset {
            return Err(FsError::InvalidArgument);
        }

        if self.current_count == self.entries_per_set {
            self.flush_entry_set(offset)?;
        }

        let at = NODE_HEADER_SIZE + self.current_count as usize * self.entry_size;
        self.current_set[at..at + self.entry_size].copy_from_slice(entry);
        if self.current_count == 0 {
            self.set_starts.push(offset);
        }

        self.current_count += 1;
        self.added += 1;
        self.last_offset = offset;
        Ok(())
    }

    /// Writes the last entry set and the index nodes.
    ///
    /// `end_offset` closes the last entry's range and must exceed its offset.
    pub fn finalize(mut self, end_offset: i64) -> Result<()> {
        if self.added != self.entry_count || end_offset <= self.last_offset {
            return Err(FsError::InvalidArgument);
        }
        self.flush_entry_set(end_offset)?;

        let node_size = self.node_size;
        let offset_count = offset_count_per_node(node_size);
        let l2_count = node_l2_count(node_size, self.entry_size, self.entry_count);
        let set_count = self.set_starts.len() as i32;
        debug_assert_eq!(set_count, entry_set_count(node_size, self.entry_size, self.entry_count));

        let mut l1 = NodeBuffer::zeroed(node_size);
        let write_offset = |node: &mut NodeBuffer, slot: i32, value: i64| {
            let at = NODE_HEADER_SIZE + slot as usize * OFFSET_SIZE;
            LittleEndian::write_i64(&mut node[at..at + OFFSET_SIZE], value);
        };

        if l2_count == 0 {
            for (slot, &start) in self.set_starts.iter().enumerate() {
                write_offset(&mut l1, slot as i32, start);
            }
            NodeHeader {
                index: 0,
                count: set_count,
                offset: end_offset,
            }
            .encode(&mut l1);
        } else {
            // The first `offset_count - l2_count` sets sit in the L1 tail.
            let direct = (offset_count - l2_count) as usize;
            for (i, &start) in self.set_starts.iter().take(direct).enumerate() {
                write_offset(&mut l1, l2_count + i as i32, start);
            }

            let l2_sets = &self.set_starts[direct.min(self.set_starts.len())..];
            for (k, chunk) in l2_sets.chunks(offset_count as usize).enumerate() {
                let k = k as i32;
                let mut l2 = NodeBuffer::zeroed(node_size);
                for (j, &start) in chunk.iter().enumerate() {
                    write_offset(&mut l2, j as i32, start);
                }

                let next_index = direct + (k as usize + 1) * offset_count as usize;
                let end = self.set_starts.get(next_index).copied().unwrap_or(end_offset);
                NodeHeader {
                    index: k,
                    count: chunk.len() as i32,
                    offset: end,
                }
                .encode(&mut l2);

                write_offset(&mut l1, k, chunk[0]);
                self.node_storage.write((k as i64 + 1) * node_size as i64, &l2)?;
            }

            NodeHeader {
                index: 0,
                count: l2_count,
                offset: end_offset,
            }
            .encode(&mut l1);
        }

        self.node_storage.write(0, &l1)?;

        tracing::debug!(
            entry_count = self.entry_count,
            entry_set_count = set_count,
            l2_count,
            end_offset,
            "bucket tree written"
        );
        Ok(())
    }

    /// Writes the in-progress entry set, closing its range at `end`.
    fn flush_entry_set(&mut self, end: i64) -> Result<()> {
        if self.current_count == 0 {
            return Ok(());
        }

        let index = self.set_starts.len() as i32 - 1;
        NodeHeader {
            index,
            count: self.current_count,
            offset: end,
        }
        .encode(&mut self.current_set);

        self.entry_storage
            .write(index as i64 * self.node_size as i64, &self.current_set)?;

        self.current_set.fill(0);
        self.current_count = 0;
        Ok(())
    }
}

impl std::fmt::Debug for BucketTreeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketTreeBuilder")
            .field("node_size", &self.node_size)
            .field("entry_size", &self.entry_size)
            .field("entry_count", &self.entry_count)
            .field("added", &self.added)
            .finish()
    }
}
