//! # Buffers
//!
//! The shared buffer pool used by the cached storage layers.
//!
//! A [`BufferManager`] owns one aligned memory region, carves it with a
//! [`buddy::BuddyHeap`], and keeps a [`CacheHandleTable`] of buffers that
//! callers have parked for reuse. Parked buffers are still "allocatable":
//! when the heap runs dry, allocation evicts the oldest parked buffer and
//! retries.
//!
//! ## Ownership
//!
//! ```text
//! allocate_buffer ──▶ Buffer (owns range) ──drop──▶ heap
//!                        │
//!                  register_cache
//!                        ▼
//!                 CacheHandle ──acquire_cache──▶ Some(Buffer) | None (evicted)
//! ```
//!
//! A [`Buffer`] is an RAII guard: the range returns to the heap when it is
//! dropped, so a failing read path cannot leak pool memory.
//!
//! ## Eviction floor
//!
//! Each [`BufferAttribute`] level keeps a protected minimum of entries and
//! bytes (see `config::CacheFloorConfig`). Eviction prefers the oldest entry
//! whose level stays above the floor, and falls back to the globally oldest
//! entry when every level is at its minimum.

mod aligned;
mod cache_table;
mod manager;

pub use aligned::AlignedBuffer;
pub use cache_table::{BufferAttribute, CacheHandle, CacheHandleTable};
pub use manager::{Buffer, BufferManager, POOL_ALIGNMENT};
