use super::*;
use proptest::prelude::*;

const BASE: usize = 0x1000_0000;
const BLOCK: usize = 0x100;

// -------------------- Construction --------------------

#[test]
fn new_exact_max_block_is_fully_free() {
    let heap = BuddyHeap::new(BASE, BLOCK << 4, BLOCK, 4);
    assert_eq!(heap.heap_size(), BLOCK << 4);
    assert_eq!(heap.total_free_size(), BLOCK << 4);
    assert_eq!(heap.free_block_count(4), 1);
    assert_eq!(heap.allocatable_size_max(), BLOCK << 4);
}

#[test]
fn new_rounds_size_down_to_block_size() {
    let heap = BuddyHeap::new(BASE, BLOCK * 3 + 17, BLOCK, 4);
    assert_eq!(heap.heap_size(), BLOCK * 3);
    assert_eq!(heap.total_free_size(), BLOCK * 3);
}

#[test]
fn new_packs_remainder_greedily() {
    // 2 maximal blocks (order 2 = 4 blocks each) + 3 blocks of remainder.
    let heap = BuddyHeap::new(BASE, BLOCK * 11, BLOCK, 2);
    assert_eq!(heap.free_block_count(2), 2);
    assert_eq!(heap.free_block_count(1), 1);
    assert_eq!(heap.free_block_count(0), 1);
    assert_eq!(heap.total_free_size(), BLOCK * 11);
}

#[test]
fn new_multiple_of_max_block_uses_top_order_only() {
    let heap = BuddyHeap::new(BASE, BLOCK * 12, BLOCK, 2);
    assert_eq!(heap.free_block_count(2), 3);
    assert_eq!(heap.free_block_count(1), 0);
    assert_eq!(heap.free_block_count(0), 0);
}

#[test]
fn with_default_order_covers_region() {
    let heap = BuddyHeap::with_default_order(BASE, BLOCK * 16, BLOCK);
    assert_eq!(heap.order_max(), 4);
    assert_eq!(heap.free_block_count(4), 1);
}

#[test]
#[should_panic(expected = "heap address must be aligned to BUFFER_ALIGNMENT")]
fn new_panics_on_misaligned_address() {
    BuddyHeap::new(BASE + 1, BLOCK * 4, BLOCK, 2);
}

#[test]
#[should_panic(expected = "block_size must be a power of two >= BLOCK_SIZE_MIN")]
fn new_panics_on_non_power_of_two_block() {
    BuddyHeap::new(BASE, 0x3000, 0x300, 2);
}

#[test]
#[should_panic(expected = "size must be >= block_size")]
fn new_panics_on_tiny_size() {
    BuddyHeap::new(BASE, BLOCK - 1, BLOCK, 2);
}

#[test]
#[should_panic(expected = "order_max must be in 1..ORDER_UPPER_LIMIT")]
fn new_panics_on_zero_order_max() {
    BuddyHeap::new(BASE, BLOCK * 4, BLOCK, 0);
}

// -------------------- Order math --------------------

#[test]
fn order_from_bytes_rounds_up() {
    let heap = BuddyHeap::new(BASE, BLOCK << 4, BLOCK, 4);
    assert_eq!(heap.order_from_bytes(1), Some(0));
    assert_eq!(heap.order_from_bytes(BLOCK), Some(0));
    assert_eq!(heap.order_from_bytes(BLOCK + 1), Some(1));
    assert_eq!(heap.order_from_bytes(BLOCK * 3), Some(2));
    assert_eq!(heap.order_from_bytes(BLOCK << 4), Some(4));
    assert_eq!(heap.order_from_bytes((BLOCK << 4) + 1), None);
}

#[test]
fn query_order_max_matches_block_count() {
    assert_eq!(BuddyHeap::query_order_max(BLOCK, BLOCK), 1);
    assert_eq!(BuddyHeap::query_order_max(BLOCK * 8, BLOCK), 3);
    assert_eq!(BuddyHeap::query_order_max(BLOCK * 9, BLOCK), 4);
}

// -------------------- Allocate / Free --------------------

#[test]
fn allocate_splits_larger_block() {
    let mut heap = BuddyHeap::new(BASE, BLOCK << 3, BLOCK, 3);
    let addr = heap.allocate_by_order(0).unwrap();
    assert_eq!(addr, BASE);
    // The split leaves one free block at each of orders 0, 1 and 2.
    assert_eq!(heap.free_block_count(0), 1);
    assert_eq!(heap.free_block_count(1), 1);
    assert_eq!(heap.free_block_count(2), 1);
    assert_eq!(heap.total_free_size(), (BLOCK << 3) - BLOCK);
}

#[test]
fn allocations_are_aligned_to_their_order() {
    let mut heap = BuddyHeap::new(BASE, BLOCK << 5, BLOCK, 5);
    for order in [0, 2, 1, 3, 0] {
        let addr = heap.allocate_by_order(order).unwrap();
        assert_eq!((addr - BASE) % heap.bytes_from_order(order), 0);
    }
}

#[test]
fn allocate_returns_none_when_exhausted() {
    let mut heap = BuddyHeap::new(BASE, BLOCK * 4, BLOCK, 2);
    assert!(heap.allocate_by_order(2).is_some());
    assert!(heap.allocate_by_order(0).is_none());
    assert_eq!(heap.total_free_size(), 0);
    assert_eq!(heap.allocatable_size_max(), 0);
}

#[test]
fn single_max_block_coalesces_after_free() {
    let mut heap = BuddyHeap::new(BASE, BLOCK << 4, BLOCK, 4);
    let addr = heap.allocate_by_order(4).unwrap();
    heap.free(addr, 4);
    let again = heap.allocate_by_order(4);
    assert_eq!(again, Some(addr));
}

#[test]
fn freeing_split_blocks_coalesces_back() {
    let mut heap = BuddyHeap::new(BASE, BLOCK << 4, BLOCK, 4);
    let a = heap.allocate_by_order(0).unwrap();
    let b = heap.allocate_by_order(0).unwrap();
    let c = heap.allocate_by_order(1).unwrap();

    heap.free(b, 0);
    heap.free(a, 0);
    heap.free(c, 1);

    assert_eq!(heap.total_free_size(), BLOCK << 4);
    assert_eq!(heap.free_block_count(4), 1);
    assert_eq!(heap.allocate_by_order(4), Some(BASE));
}

#[test]
fn free_in_reverse_order_merges_left_buddy() {
    let mut heap = BuddyHeap::new(BASE, BLOCK * 2, BLOCK, 1);
    let left = heap.allocate_by_order(0).unwrap();
    let right = heap.allocate_by_order(0).unwrap();
    assert_eq!(right, left + BLOCK);

    heap.free(right, 0);
    heap.free(left, 0);
    assert_eq!(heap.free_block_count(1), 1);
    assert_eq!(heap.allocate_by_order(1), Some(left));
}

#[test]
fn remainder_blocks_do_not_merge_past_heap_end() {
    // 6 blocks: one order-2 block plus one order-1 tail block.
    let mut heap = BuddyHeap::new(BASE, BLOCK * 6, BLOCK, 2);
    let tail = heap.allocate_by_order(1).unwrap();
    assert_eq!(tail, BASE + BLOCK * 4);
    heap.free(tail, 1);
    assert_eq!(heap.free_block_count(1), 1);
    assert_eq!(heap.free_block_count(2), 1);
    assert_eq!(heap.total_free_size(), BLOCK * 6);
}

#[test]
#[should_panic(expected = "double free of buddy block")]
fn double_free_panics() {
    let mut heap = BuddyHeap::new(BASE, BLOCK * 4, BLOCK, 2);
    let a = heap.allocate_by_order(0).unwrap();
    let _b = heap.allocate_by_order(0).unwrap();
    heap.free(a, 0);
    heap.free(a, 0);
}

#[test]
#[should_panic(expected = "address must be aligned to its order")]
fn free_misaligned_order_panics() {
    let mut heap = BuddyHeap::new(BASE, BLOCK * 4, BLOCK, 2);
    heap.free(BASE + BLOCK, 1);
}

// -------------------- Conservation --------------------

#[derive(Debug, Clone)]
enum Op {
    Alloc(u32),
    Free(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u32..=4).prop_map(Op::Alloc),
        any::<usize>().prop_map(Op::Free),
    ]
}

proptest! {
    #[test]
    fn free_size_plus_outstanding_is_conserved(
        blocks in 1usize..64,
        ops in prop::collection::vec(op_strategy(), 0..200),
    ) {
        let mut heap = BuddyHeap::new(BASE, BLOCK * blocks, BLOCK, 4);
        let usable = heap.heap_size();
        let mut outstanding: Vec<(usize, u32)> = Vec::new();

        for op in ops {
            match op {
                Op::Alloc(order) => {
                    if let Some(addr) = heap.allocate_by_order(order) {
                        prop_assert!(outstanding.iter().all(|&(a, _)| a != addr));
                        outstanding.push((addr, order));
                    }
                }
                Op::Free(pick) => {
                    if !outstanding.is_empty() {
                        let (addr, order) = outstanding.swap_remove(pick % outstanding.len());
                        heap.free(addr, order);
                    }
                }
            }

            let in_use: usize = outstanding
                .iter()
                .map(|&(_, order)| heap.bytes_from_order(order))
                .sum();
            prop_assert_eq!(heap.total_free_size() + in_use, usable);
        }

        for (addr, order) in outstanding.drain(..) {
            heap.free(addr, order);
        }
        prop_assert_eq!(heap.total_free_size(), usable);
    }
}
