//! Detection of reads that span several entries but map to one contiguous
//! physical range.
//!
//! A caller walking a read entry by entry asks the visitor whether the rest
//! of the read can be issued as one I/O. The answer carries a skip count so
//! the caller does not re-scan entries that were already classified:
//!
//! ```text
//! loop per entry:
//!     if info.check_need_scan() { visitor.scan_continuous_reading(&mut info, ..) }
//!     if info.can_do()          { one merged read of info.read_size(); info.done() }
//! ```

use storage::{FsError, Result, Storage};

use crate::visitor::Visitor;
use crate::{BucketTreeEntry, NodeBuffer, NODE_HEADER_SIZE};

/// An entry that maps its virtual range onto a physical one.
pub trait ContinuousReadingEntry: BucketTreeEntry {
    /// Fragments at least this large are never merged.
    const FRAGMENT_SIZE_MAX: usize;

    fn physical_offset(&self) -> i64;

    /// True for entries that do not read from the primary physical storage.
    fn is_fragment(&self) -> bool;
}

/// Outcome of a continuous-reading scan, reused across a read's entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContinuousReadingInfo {
    read_size: usize,
    skip_count: i32,
    done: bool,
}

impl ContinuousReadingInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// # Panics
    ///
    /// Panics if `count` is negative.
    pub fn set_skip_count(&mut self, count: i32) {
        assert!(count >= 0, "skip count must be >= 0");
        self.skip_count = count;
    }

    #[must_use]
    pub fn skip_count(&self) -> i32 {
        self.skip_count
    }

    /// Consumes one unit of skip count; true once a new scan is due.
    pub fn check_need_scan(&mut self) -> bool {
        self.skip_count -= 1;
        self.skip_count <= 0
    }

    /// Marks the merged read as issued.
    pub fn done(&mut self) {
        self.read_size = 0;
        self.done = true;
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn set_read_size(&mut self, size: usize) {
        self.read_size = size;
    }

    #[must_use]
    pub fn read_size(&self) -> usize {
        self.read_size
    }

    /// True if the last scan found a mergeable run.
    #[must_use]
    pub fn can_do(&self) -> bool {
        self.read_size > 0
    }
}

impl Visitor<'_> {
    /// Scans forward from the current entry over `[offset, offset + size)`.
    ///
    /// Resets `info`, then sets its skip count to the number of entries the
    /// scan classified. If two or more entries were found to be physically
    /// contiguous, `info.read_size()` is the number of bytes that can be read
    /// in one I/O starting at `offset`. The scan never leaves the current
    /// entry set.
    ///
    /// # Panics
    ///
    /// Panics if the visitor is not valid, `offset` is negative, or `size` is
    /// zero.
    pub fn scan_continuous_reading<E: ContinuousReadingEntry>(
        &self,
        info: &mut ContinuousReadingInfo,
        offset: i64,
        size: usize,
    ) -> Result<()> {
        assert!(self.is_valid(), "visitor is not positioned on an entry");
        assert!(offset >= 0, "offset must be >= 0");
        assert!(size > 0, "size must be > 0");

        info.reset();

        let tree = self.tree();
        let node_size = tree.node_size();
        let entry_size = tree.entry_size();
        let entry_set = self.entry_set();
        let first_index = self.entry_index();

        let mut node = NodeBuffer::zeroed(node_size);
        tree.storages()?
            .entry
            .read(entry_set.index as i64 * node_size as i64, &mut node)?;
        let entry_at = |index: i32| {
            let at = NODE_HEADER_SIZE + index as usize * entry_size;
            E::decode(&node[at..at + entry_size])
        };

        let end_offset = offset + size as i64;
        let mut cur_offset = offset;
        let mut entry: E = self.get();
        let mut phys_offset = entry.physical_offset();

        let mut merge_size = 0usize;
        let mut readable_size = 0usize;
        let mut merged = false;

        let mut entry_index = first_index;
        while entry_index < entry_set.count {
            if end_offset <= cur_offset {
                break;
            }

            let entry_offset = entry.virtual_offset();
            if entry_offset > cur_offset {
                return Err(FsError::InvalidIndirectEntryOffset);
            }

            let (next_entry, next_entry_offset) = if entry_index + 1 < entry_set.count {
                let next = entry_at(entry_index + 1);
                let next_offset = next.virtual_offset();
                if !tree.includes(next_offset) {
                    return Err(FsError::InvalidIndirectEntryOffset);
                }
                (Some(next), next_offset)
            } else {
                (None, entry_set.end)
            };

            if cur_offset >= next_entry_offset {
                return Err(FsError::InvalidIndirectEntryOffset);
            }

            let data_size = next_entry_offset - cur_offset;
            let remaining_size = end_offset - cur_offset;
            let read_size = data_size.min(remaining_size) as usize;
            debug_assert!(read_size <= size);

            if entry.is_fragment() {
                // A fragment can only be bridged if it is small and the read
                // continues past it.
                if E::FRAGMENT_SIZE_MAX <= read_size || remaining_size <= data_size {
                    break;
                }
                merge_size += read_size;
            } else {
                if phys_offset != entry.physical_offset() {
                    break;
                }
                readable_size += merge_size + read_size;
                debug_assert!(readable_size <= size);
                merged |= merge_size > 0 || entry_index != first_index;
                merge_size = 0;
            }

            cur_offset += read_size as i64;
            phys_offset += next_entry_offset - entry_offset;
            entry_index += 1;

            match next_entry {
                Some(next) => entry = next,
                None => break,
            }
        }

        if merged {
            info.set_read_size(readable_size);
        }
        info.set_skip_count(entry_index - first_index);

        tracing::trace!(
            offset,
            size,
            skip_count = info.skip_count(),
            read_size = info.read_size(),
            "continuous reading scan"
        );
        Ok(())
    }
}
