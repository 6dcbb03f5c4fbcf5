use config::CacheFloorConfig;

/// Opaque ticket for a buffer parked in a [`CacheHandleTable`].
///
/// Handles are issued from a monotonically increasing counter and never
/// reused, so a stale handle can never alias a newer entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheHandle(u64);

impl CacheHandle {
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

/// Eviction class of a cached buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BufferAttribute {
    level: i32,
}

impl BufferAttribute {
    #[must_use]
    pub const fn new(level: i32) -> Self {
        Self { level }
    }

    #[must_use]
    pub const fn level(&self) -> i32 {
        self.level
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    handle: CacheHandle,
    address: usize,
    size: usize,
    attr: BufferAttribute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AttrInfo {
    level: i32,
    cache_count: usize,
    cache_size: usize,
}

/// A capacity-bounded registry of parked memory ranges.
///
/// Entries are kept in handle order, which is also age order, so lookups are
/// binary searches and the oldest entry is always first.
#[derive(Debug)]
pub struct CacheHandleTable {
    entries: Vec<Entry>,
    entry_count_max: usize,
    attr_infos: Vec<AttrInfo>,
    current_handle: u64,
    total_cache_size: usize,
    cache_count_min: usize,
    cache_size_min: usize,
}

impl CacheHandleTable {
    /// Creates a table holding at most `max_cache_count` entries, with the
    /// per-level floor derived from `floor`.
    pub fn new(max_cache_count: usize, floor: &CacheFloorConfig) -> Self {
        Self {
            entries: Vec::with_capacity(max_cache_count),
            entry_count_max: max_cache_count,
            attr_infos: Vec::new(),
            current_handle: 0,
            total_cache_size: 0,
            cache_count_min: floor.count_min(max_cache_count),
            cache_size_min: floor.size_min(max_cache_count),
        }
    }

    /// Parks `[address, address + size)` under `attr`.
    ///
    /// Returns `None` only when the table is at capacity.
    pub fn register(&mut self, address: usize, size: usize, attr: BufferAttribute) -> Option<CacheHandle> {
        if self.entries.len() >= self.entry_count_max {
            return None;
        }

        let handle = self.publish_cache_handle();
        debug_assert!(self.entries.last().map_or(true, |e| e.handle < handle));
        self.entries.push(Entry {
            handle,
            address,
            size,
            attr,
        });

        match self.attr_infos.iter_mut().find(|i| i.level == attr.level()) {
            Some(info) => {
                info.cache_count += 1;
                info.cache_size += size;
            }
            None => self.attr_infos.push(AttrInfo {
                level: attr.level(),
                cache_count: 1,
                cache_size: size,
            }),
        }

        self.total_cache_size += size;
        Some(handle)
    }

    /// Removes the entry for `handle` and returns its range, or `None` if it
    /// was already evicted.
    pub fn unregister(&mut self, handle: CacheHandle) -> Option<(usize, usize)> {
        let pos = self.entries.binary_search_by(|e| e.handle.cmp(&handle)).ok()?;
        Some(self.unregister_at(pos))
    }

    /// Evicts one entry and returns its range.
    ///
    /// Prefers the oldest entry whose level stays at or above its floor after
    /// the eviction. If every level is at its floor, the globally oldest entry
    /// goes regardless, so this succeeds whenever the table is non-empty.
    pub fn unregister_oldest(&mut self, _attr: BufferAttribute, _required_size: usize) -> Option<(usize, usize)> {
        if self.entries.is_empty() {
            return None;
        }

        let pos = self
            .entries
            .iter()
            .position(|e| self.can_unregister(e))
            .unwrap_or(0);
        Some(self.unregister_at(pos))
    }

    /// Issues a fresh handle without registering anything.
    pub fn publish_cache_handle(&mut self) -> CacheHandle {
        self.current_handle += 1;
        CacheHandle(self.current_handle)
    }

    #[must_use]
    pub fn total_cache_size(&self) -> usize {
        self.total_cache_size
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.entry_count_max
    }

    #[must_use]
    pub fn cache_count_min(&self) -> usize {
        self.cache_count_min
    }

    #[must_use]
    pub fn cache_size_min(&self) -> usize {
        self.cache_size_min
    }

    /// `(count, bytes)` currently cached under `level`.
    #[must_use]
    pub fn level_usage(&self, level: i32) -> (usize, usize) {
        self.attr_infos
            .iter()
            .find(|i| i.level == level)
            .map_or((0, 0), |i| (i.cache_count, i.cache_size))
    }

    fn can_unregister(&self, entry: &Entry) -> bool {
        let Some(info) = self.attr_infos.iter().find(|i| i.level == entry.attr.level()) else {
            return false;
        };
        self.cache_count_min < info.cache_count
            && self.cache_size_min + entry.size <= info.cache_size
    }

    fn unregister_at(&mut self, pos: usize) -> (usize, usize) {
        let entry = self.entries.remove(pos);

        if let Some(info) = self
            .attr_infos
            .iter_mut()
            .find(|i| i.level == entry.attr.level())
        {
            debug_assert!(info.cache_count > 0 && info.cache_size >= entry.size);
            info.cache_count -= 1;
            info.cache_size -= entry.size;
        }

        debug_assert!(self.total_cache_size >= entry.size);
        self.total_cache_size -= entry.size;
        (entry.address, entry.size)
    }
}
