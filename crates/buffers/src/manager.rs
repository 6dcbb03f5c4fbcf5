use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use buddy::BuddyHeap;
use config::{CacheFloorConfig, Config};

use crate::{AlignedBuffer, BufferAttribute, CacheHandle, CacheHandleTable};

/// Alignment of the pool region itself.
pub const POOL_ALIGNMENT: usize = 0x1000;

struct ManagerState {
    heap: BuddyHeap,
    table: CacheHandleTable,
    peak_free_size: usize,
    peak_total_allocatable_size: usize,
    retried_count: usize,
}

impl ManagerState {
    fn total_allocatable_size(&self) -> usize {
        self.heap.total_free_size() + self.table.total_cache_size()
    }

    fn free_range(&mut self, address: usize, size: usize) {
        debug_assert!(size.is_power_of_two());
        let order = self
            .heap
            .order_from_bytes(size)
            .unwrap_or_else(|| panic!("range of {size} bytes did not come from this heap"));
        self.heap.free(address, order);
    }
}

struct Shared {
    // Only ever accessed through raw pointers derived from `as_ptr`; the
    // heap guarantees handed-out ranges are disjoint.
    region: AlignedBuffer<POOL_ALIGNMENT>,
    total_size: usize,
    state: Mutex<ManagerState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        // Every critical section leaves the state consistent before any
        // assertion can fire, so a poisoned lock is still usable.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deallocate(&self, address: usize, size: usize) {
        self.lock().free_range(address, size);
    }
}

/// A fixed memory pool handing out power-of-two buffers, with a cache of
/// parked buffers that allocation may reclaim.
///
/// The buddy heap and the cache-handle table sit behind one mutex, so an
/// allocation and the evictions it triggers are atomic. No I/O happens while
/// the lock is held.
pub struct BufferManager {
    shared: Arc<Shared>,
}

impl BufferManager {
    /// Creates a pool of `pool_size` bytes split into `block_size` units, with a
    /// cache table of `max_cache_count` entries.
    ///
    /// # Panics
    ///
    /// Panics on the same preconditions as [`BuddyHeap::new`].
    pub fn new(pool_size: usize, block_size: usize, max_cache_count: usize, floor: &CacheFloorConfig) -> Self {
        let region = AlignedBuffer::<POOL_ALIGNMENT>::zeroed(pool_size);
        let heap = BuddyHeap::with_default_order(region.as_ptr() as usize, pool_size, block_size);
        let free = heap.total_free_size();

        tracing::debug!(
            pool_size,
            block_size,
            max_cache_count,
            order_max = heap.order_max(),
            "buffer manager created"
        );

        Self {
            shared: Arc::new(Shared {
                total_size: free,
                state: Mutex::new(ManagerState {
                    heap,
                    table: CacheHandleTable::new(max_cache_count, floor),
                    peak_free_size: free,
                    peak_total_allocatable_size: free,
                    retried_count: 0,
                }),
                region,
            }),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.pool.pool_size,
            config.pool.block_size,
            config.pool.max_cache_count,
            &config.cache_floor,
        )
    }

    /// Allocates a buffer of at least `size` bytes.
    ///
    /// When the heap is exhausted, cached buffers are evicted oldest-first
    /// (respecting per-level floors where possible) until the request fits.
    /// Returns `None` once there is nothing left to evict, or if `size`
    /// exceeds the largest block the pool can produce.
    pub fn allocate_buffer(&self, size: usize, attr: BufferAttribute) -> Option<Buffer> {
        let mut state = self.shared.lock();
        let Some(order) = state.heap.order_from_bytes(size) else {
            tracing::debug!(size, "allocation larger than the pool's largest block");
            return None;
        };

        loop {
            if let Some(address) = state.heap.allocate_by_order(order) {
                let allocated = state.heap.bytes_from_order(order);
                debug_assert!(size <= allocated);

                let free = state.heap.total_free_size();
                state.peak_free_size = state.peak_free_size.min(free);
                let allocatable = state.total_allocatable_size();
                state.peak_total_allocatable_size = state.peak_total_allocatable_size.min(allocatable);

                return Some(Buffer {
                    shared: self.shared.clone(),
                    address,
                    size: allocated,
                });
            }

            state.retried_count += 1;
            match state.table.unregister_oldest(attr, size) {
                Some((address, size)) => state.free_range(address, size),
                None => {
                    tracing::trace!(size, "buffer pool exhausted");
                    return None;
                }
            }
        }
    }

    /// Returns `buffer` to the pool. Equivalent to dropping it.
    pub fn deallocate_buffer(&self, buffer: Buffer) {
        debug_assert!(Arc::ptr_eq(&buffer.shared, &self.shared));
        drop(buffer);
    }

    /// Parks `buffer` for possible reuse and returns a handle to reclaim it.
    ///
    /// A full table first evicts its oldest entry. If the table is empty and
    /// still cannot take the entry, `buffer` is freed outright and a fresh,
    /// never-registered handle is returned; [`BufferManager::acquire_cache`]
    /// on it yields `None`.
    ///
    /// # Panics
    ///
    /// Panics if `buffer` belongs to a different manager.
    pub fn register_cache(&self, buffer: Buffer, attr: BufferAttribute) -> CacheHandle {
        assert!(
            Arc::ptr_eq(&buffer.shared, &self.shared),
            "buffer registered with a foreign buffer manager"
        );
        let (address, size) = buffer.into_range();

        let mut state = self.shared.lock();
        loop {
            if let Some(handle) = state.table.register(address, size, attr) {
                return handle;
            }

            state.retried_count += 1;
            match state.table.unregister_oldest(attr, 0) {
                Some((old_address, old_size)) => state.free_range(old_address, old_size),
                None => {
                    state.free_range(address, size);
                    return state.table.publish_cache_handle();
                }
            }
        }
    }

    /// Reclaims the buffer parked under `handle`, or `None` if it was evicted.
    pub fn acquire_cache(&self, handle: CacheHandle) -> Option<Buffer> {
        let mut state = self.shared.lock();
        let (address, size) = state.table.unregister(handle)?;

        let allocatable = state.total_allocatable_size();
        state.peak_total_allocatable_size = state.peak_total_allocatable_size.min(allocatable);

        Some(Buffer {
            shared: self.shared.clone(),
            address,
            size,
        })
    }

    /// Usable size of the pool.
    #[must_use]
    pub fn total_size(&self) -> usize {
        self.shared.total_size
    }

    /// Bytes currently free in the heap.
    #[must_use]
    pub fn free_size(&self) -> usize {
        self.shared.lock().heap.total_free_size()
    }

    /// Free bytes plus bytes held by evictable cache entries.
    #[must_use]
    pub fn total_allocatable_size(&self) -> usize {
        self.shared.lock().total_allocatable_size()
    }

    #[must_use]
    pub fn peak_free_size(&self) -> usize {
        self.shared.lock().peak_free_size
    }

    #[must_use]
    pub fn peak_total_allocatable_size(&self) -> usize {
        self.shared.lock().peak_total_allocatable_size
    }

    /// Number of evictions performed to satisfy allocations or registrations.
    #[must_use]
    pub fn retried_count(&self) -> usize {
        self.shared.lock().retried_count
    }

    /// Resets the peak and retry statistics to the current values.
    pub fn clear_peak(&self) {
        let mut state = self.shared.lock();
        state.peak_free_size = state.heap.total_free_size();
        state.peak_total_allocatable_size = state.total_allocatable_size();
        state.retried_count = 0;
    }

    /// Number of buffers currently parked in the cache table.
    #[must_use]
    pub fn cached_count(&self) -> usize {
        self.shared.lock().table.len()
    }

    /// `(count, bytes)` currently cached for the attribute `level`.
    #[must_use]
    pub fn cached_usage(&self, level: i32) -> (usize, usize) {
        self.shared.lock().table.level_usage(level)
    }

    /// Logs pool statistics and the heap's free lists.
    pub fn dump(&self) {
        let state = self.shared.lock();
        tracing::debug!(
            total_size = self.shared.total_size,
            free_size = state.heap.total_free_size(),
            cached = state.table.len(),
            cached_size = state.table.total_cache_size(),
            peak_free_size = state.peak_free_size,
            peak_total_allocatable_size = state.peak_total_allocatable_size,
            retried_count = state.retried_count,
            "buffer manager"
        );
        state.heap.dump();
    }
}

impl std::fmt::Debug for BufferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("BufferManager")
            .field("total_size", &self.shared.total_size)
            .field("free_size", &state.heap.total_free_size())
            .field("cached", &state.table.len())
            .field("retried_count", &state.retried_count)
            .finish()
    }
}

/// A buffer carved out of a [`BufferManager`] pool.
///
/// The buffer owns its range exclusively; dropping it returns the range to
/// the pool.
pub struct Buffer {
    shared: Arc<Shared>,
    address: usize,
    size: usize,
}

impl Buffer {
    /// Address of the first byte (stable for the buffer's lifetime).
    #[must_use]
    pub fn address(&self) -> usize {
        self.address
    }

    /// Size of the buffer, which is the allocation rounded up to its order.
    #[must_use]
    pub fn len(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    fn ptr(&self) -> *mut u8 {
        let offset = self.address - self.shared.region.as_ptr() as usize;
        debug_assert!(offset + self.size <= self.shared.region.len());
        // SAFETY: the heap only hands out ranges inside `region`, so
        // `offset + size <= region.len()` and the offset stays in bounds.
        unsafe { self.shared.region.as_ptr().add(offset) }
    }

    /// Gives up ownership of the range without freeing it.
    fn into_range(self) -> (usize, usize) {
        let this = ManuallyDrop::new(self);
        // SAFETY: `this` is never dropped, so `shared` is moved out exactly once.
        // The range stays allocated in the heap, so no other buffer can be
        // handed an overlapping range while the caller holds it.
        let shared = unsafe { std::ptr::read(&this.shared) };
        drop(shared);
        (this.address, this.size)
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: the heap never hands out overlapping ranges, and a range
        // parked in the cache table is unreachable until it comes back as a
        // new `Buffer`. This buffer is therefore the only handle to
        // `[address, address + size)` and nothing writes it concurrently.
        unsafe { std::slice::from_raw_parts(self.ptr(), self.size) }
    }
}

impl DerefMut for Buffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: no other `Buffer` covers any byte of this range (see
        // `deref`), and `&mut self` excludes every other borrow of this one.
        unsafe { std::slice::from_raw_parts_mut(self.ptr(), self.size) }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.shared.deallocate(self.address, self.size);
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("address", &format_args!("{:#x}", self.address))
            .field("size", &self.size)
            .finish()
    }
}
