//! # Buddy Heap
//!
//! A power-of-two block allocator over one contiguous address range.
//!
//! The heap never touches the memory it manages. Free blocks are tracked in
//! an arena of descriptors, one per `block_size` unit of the region, and the
//! per-order free lists are doubly linked through arena indices. This keeps
//! bookkeeping out of the bytes handed to callers and lets `free` find a
//! block's buddy in constant time.
//!
//! ## Layout
//!
//! ```text
//! order k block  = block_size << k bytes, aligned to (block_size << k)
//!                  relative to the heap start
//! buddy(i, k)    = i ^ (1 << k)   (block indices)
//! ```
//!
//! The heap performs no locking. `BufferManager` in the `buffers` crate
//! serializes access behind its own mutex.
//!
//! ## Example
//!
//! ```rust,no_run
//! use buddy::BuddyHeap;
//!
//! let mut heap = BuddyHeap::new(0x10_0000, 0x1_0000, 0x1000, 4);
//! let addr = heap.allocate_by_order(1).unwrap();
//! heap.free(addr, 1);
//! assert_eq!(heap.total_free_size(), 0x1_0000);
//! ```

/// Required alignment of the heap's start address.
pub const BUFFER_ALIGNMENT: usize = 0x10;

/// Smallest permitted block size.
pub const BLOCK_SIZE_MIN: usize = 2 * std::mem::size_of::<usize>();

/// Exclusive upper bound on `order_max`.
pub const ORDER_UPPER_LIMIT: u32 = 8 * std::mem::size_of::<i32>() as u32;

const NIL: u32 = u32::MAX;

/// Descriptor for one `block_size` unit of the region.
///
/// Only the first unit of a free block is linked; `free_order` marks it as
/// the head of a free block of that order.
#[derive(Debug, Clone, Copy)]
struct PageEntry {
    prev: u32,
    next: u32,
    free_order: Option<u32>,
}

impl PageEntry {
    const UNLINKED: Self = Self {
        prev: NIL,
        next: NIL,
        free_order: None,
    };
}

#[derive(Debug, Clone, Copy)]
struct PageList {
    head: u32,
    tail: u32,
    count: usize,
}

impl PageList {
    const EMPTY: Self = Self {
        head: NIL,
        tail: NIL,
        count: 0,
    };

    fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Buddy allocator over `[heap_start, heap_start + heap_size)`.
pub struct BuddyHeap {
    heap_start: usize,
    heap_size: usize,
    block_size: usize,
    order_max: u32,
    total_free_size: usize,
    pages: Vec<PageEntry>,
    free_lists: Vec<PageList>,
}

impl BuddyHeap {
    /// Builds a heap over `size` bytes at `address`, split into blocks of
    /// `block_size` bytes, with the largest block being `block_size << order_max`.
    ///
    /// All full maximal-order blocks go to the top free list. The tail that is
    /// smaller than one maximal block is packed greedily into the largest
    /// blocks that fit, so the whole region (rounded down to `block_size`) is
    /// allocatable.
    ///
    /// # Panics
    ///
    /// Panics if `address` is zero or not aligned to [`BUFFER_ALIGNMENT`], if
    /// `block_size` is not a power of two of at least [`BLOCK_SIZE_MIN`], if
    /// `size < block_size`, or if `order_max` is not in `1..ORDER_UPPER_LIMIT`.
    pub fn new(address: usize, size: usize, block_size: usize, order_max: u32) -> Self {
        assert!(address != 0, "heap address must be non-null");
        assert!(
            address % BUFFER_ALIGNMENT == 0,
            "heap address must be aligned to BUFFER_ALIGNMENT"
        );
        assert!(
            block_size >= BLOCK_SIZE_MIN && block_size.is_power_of_two(),
            "block_size must be a power of two >= BLOCK_SIZE_MIN"
        );
        assert!(size >= block_size, "size must be >= block_size");
        assert!(
            order_max > 0 && order_max < ORDER_UPPER_LIMIT,
            "order_max must be in 1..ORDER_UPPER_LIMIT"
        );

        let heap_size = (size / block_size) * block_size;
        let block_count = heap_size / block_size;
        assert!(
            block_count < NIL as usize,
            "heap has too many blocks to index"
        );

        let mut heap = Self {
            heap_start: address,
            heap_size,
            block_size,
            order_max,
            total_free_size: 0,
            pages: vec![PageEntry::UNLINKED; block_count],
            free_lists: vec![PageList::EMPTY; order_max as usize + 1],
        };

        let max_page_size = heap.bytes_from_order(order_max);
        let max_page_count = heap_size.div_ceil(max_page_size);
        debug_assert!(max_page_count > 0);

        // All but the last maximal region go to the top order.
        for i in 0..max_page_count - 1 {
            let index = heap.index_from_address(address + i * max_page_size);
            heap.push_back(order_max, index);
            heap.total_free_size += max_page_size;
        }

        // Pack the remainder into the largest blocks that fit.
        let mut remaining = heap_size - (max_page_count - 1) * max_page_size;
        let mut cur_address = address + (max_page_count - 1) * max_page_size;
        debug_assert!(remaining % block_size == 0);
        while remaining >= block_size {
            let order = match heap.order_from_bytes(remaining + 1) {
                Some(order) => order,
                None => order_max + 1,
            };
            debug_assert!(order > 0 && order <= order_max + 1);

            let page_size = heap.bytes_from_order(order - 1);
            let index = heap.index_from_address(cur_address);
            heap.push_back(order - 1, index);
            heap.total_free_size += page_size;

            cur_address += page_size;
            remaining -= page_size;
        }

        tracing::debug!(
            heap_start = address,
            heap_size,
            block_size,
            order_max,
            "buddy heap initialized"
        );
        heap
    }

    /// Builds a heap whose `order_max` is the smallest order covering the
    /// whole region in one block (see [`BuddyHeap::query_order_max`]).
    pub fn with_default_order(address: usize, size: usize, block_size: usize) -> Self {
        Self::new(
            address,
            size,
            block_size,
            Self::query_order_max(size, block_size),
        )
    }

    /// Smallest order whose block spans `size` bytes, clamped to
    /// `1..ORDER_UPPER_LIMIT`.
    #[must_use]
    pub fn query_order_max(size: usize, block_size: usize) -> u32 {
        let block_count = size.div_ceil(block_size);
        (1..ORDER_UPPER_LIMIT)
            .find(|&order| block_count <= 1usize << order)
            .unwrap_or(ORDER_UPPER_LIMIT - 1)
    }

    /// Allocates one block of `block_size << order` bytes.
    ///
    /// Takes the first free block at `order` or above; a larger block is split
    /// and the unused halves go back on the lower free lists. Returns `None`
    /// when nothing of sufficient size is free.
    ///
    /// # Panics
    ///
    /// Panics if `order > order_max`.
    pub fn allocate_by_order(&mut self, order: u32) -> Option<usize> {
        assert!(order <= self.order_max, "order must be <= order_max");

        for cur_order in order..=self.order_max {
            if let Some(index) = self.pop_front(cur_order) {
                self.total_free_size -= self.bytes_from_order(cur_order);
                self.divide_buddies(index, order, cur_order);
                return Some(self.address_from_index(index));
            }
        }
        None
    }

    /// Returns a block of `block_size << order` bytes to the heap, merging it
    /// with its buddy for as long as the buddy is free.
    ///
    /// # Panics
    ///
    /// Panics if `address` lies outside the heap, is not aligned to its order
    /// relative to the heap start, or is already free at this order.
    pub fn free(&mut self, address: usize, order: u32) {
        assert!(order <= self.order_max, "order must be <= order_max");
        assert!(
            address >= self.heap_start && address < self.heap_start + self.heap_size,
            "address outside of heap"
        );
        assert!(
            (address - self.heap_start) % self.block_size == 0,
            "address must be block aligned"
        );

        let index = self.index_from_address(address);
        assert!(
            self.is_aligned_to_order(index, order),
            "address must be aligned to its order"
        );
        assert!(
            self.pages[index as usize].free_order.is_none(),
            "double free of buddy block"
        );

        self.join_buddies(index, order);
    }

    /// Sum of the sizes of all free blocks.
    #[must_use]
    pub fn total_free_size(&self) -> usize {
        self.total_free_size
    }

    /// Size of the largest block that can currently be allocated, or 0.
    #[must_use]
    pub fn allocatable_size_max(&self) -> usize {
        (0..=self.order_max)
            .rev()
            .find(|&order| !self.free_lists[order as usize].is_empty())
            .map_or(0, |order| self.bytes_from_order(order))
    }

    /// Number of free blocks currently on the list for `order`.
    #[must_use]
    pub fn free_block_count(&self, order: u32) -> usize {
        self.free_lists[order as usize].count
    }

    /// Smallest order whose block holds `size` bytes, or `None` if even an
    /// `order_max` block is too small.
    #[must_use]
    pub fn order_from_bytes(&self, size: usize) -> Option<u32> {
        let block_count = size.div_ceil(self.block_size).max(1);
        let order = block_count.next_power_of_two().trailing_zeros();
        (order <= self.order_max).then_some(order)
    }

    /// Size in bytes of a block of `order`.
    #[must_use]
    pub fn bytes_from_order(&self, order: u32) -> usize {
        debug_assert!(order <= self.order_max + 1);
        self.block_size << order
    }

    #[must_use]
    pub fn order_max(&self) -> u32 {
        self.order_max
    }

    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    #[must_use]
    pub fn heap_start(&self) -> usize {
        self.heap_start
    }

    /// Usable size of the heap (the requested size rounded down to `block_size`).
    #[must_use]
    pub fn heap_size(&self) -> usize {
        self.heap_size
    }

    /// Logs the occupancy of every free list.
    pub fn dump(&self) {
        for (order, list) in self.free_lists.iter().enumerate() {
            if !list.is_empty() {
                tracing::debug!(order, count = list.count, "buddy free list");
            }
        }
        tracing::debug!(
            total_free_size = self.total_free_size,
            allocatable_size_max = self.allocatable_size_max(),
            "buddy heap"
        );
    }

    // ---- Internal helpers ----

    fn index_from_address(&self, address: usize) -> u32 {
        ((address - self.heap_start) / self.block_size) as u32
    }

    fn address_from_index(&self, index: u32) -> usize {
        self.heap_start + index as usize * self.block_size
    }

    fn block_count(&self) -> usize {
        self.pages.len()
    }

    fn is_aligned_to_order(&self, index: u32, order: u32) -> bool {
        index as usize % (1usize << order) == 0
    }

    /// Splits a block of `chosen_order` at `index` down to `required_order`,
    /// returning the upper halves to their free lists.
    fn divide_buddies(&mut self, index: u32, required_order: u32, chosen_order: u32) {
        let mut end = index as usize + (1usize << chosen_order);
        for order in (required_order + 1..=chosen_order).rev() {
            end -= 1usize << (order - 1);
            self.push_back(order - 1, end as u32);
            self.total_free_size += self.bytes_from_order(order - 1);
        }
    }

    fn join_buddies(&mut self, index: u32, order: u32) {
        let mut cur = index;
        let mut cur_order = order;

        while cur_order < self.order_max {
            let Some(buddy) = self.buddy_of(cur, cur_order) else {
                break;
            };
            if self.pages[buddy as usize].free_order != Some(cur_order) {
                break;
            }

            self.remove(cur_order, buddy);
            self.total_free_size -= self.bytes_from_order(cur_order);

            // The merged block starts at whichever half is aligned to the next order.
            if !self.is_aligned_to_order(cur, cur_order + 1) {
                cur = buddy;
            }
            cur_order += 1;
        }

        self.push_back(cur_order, cur);
        self.total_free_size += self.bytes_from_order(cur_order);
    }

    fn buddy_of(&self, index: u32, order: u32) -> Option<u32> {
        let span = 1usize << order;
        let index = index as usize;
        if self.is_aligned_to_order(index as u32, order + 1) {
            (index + span < self.block_count()).then(|| (index + span) as u32)
        } else {
            index.checked_sub(span).map(|i| i as u32)
        }
    }

    fn push_back(&mut self, order: u32, index: u32) {
        let list = self.free_lists[order as usize];
        {
            let page = &mut self.pages[index as usize];
            debug_assert!(page.free_order.is_none());
            page.prev = list.tail;
            page.next = NIL;
            page.free_order = Some(order);
        }
        if list.tail != NIL {
            self.pages[list.tail as usize].next = index;
        }

        let list = &mut self.free_lists[order as usize];
        if list.head == NIL {
            list.head = index;
        }
        list.tail = index;
        list.count += 1;
    }

    fn pop_front(&mut self, order: u32) -> Option<u32> {
        let head = self.free_lists[order as usize].head;
        if head == NIL {
            return None;
        }
        self.remove(order, head);
        Some(head)
    }

    fn remove(&mut self, order: u32, index: u32) {
        let PageEntry { prev, next, .. } = self.pages[index as usize];

        if prev != NIL {
            self.pages[prev as usize].next = next;
        } else {
            self.free_lists[order as usize].head = next;
        }
        if next != NIL {
            self.pages[next as usize].prev = prev;
        } else {
            self.free_lists[order as usize].tail = prev;
        }

        self.pages[index as usize] = PageEntry::UNLINKED;
        self.free_lists[order as usize].count -= 1;
    }
}

impl std::fmt::Debug for BuddyHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuddyHeap")
            .field("heap_start", &format_args!("{:#x}", self.heap_start))
            .field("heap_size", &self.heap_size)
            .field("block_size", &self.block_size)
            .field("order_max", &self.order_max)
            .field("total_free_size", &self.total_free_size)
            .finish()
    }
}

#[cfg(test)]
mod tests;
