//! # Integrity
//!
//! Hash-tree verified storage.
//!
//! A [`HierarchicalIntegrityVerificationStorage`] stacks one
//! [`IntegrityVerificationStorage`] per level, each fronted by a
//! [`BlockCacheBufferedStorage`] drawing buffers from a shared
//! `BufferManager`:
//!
//! ```text
//!            master hash
//!                 |
//!   L1  [verify] -> [cache 0x10]
//!                       |  hashes of L2 blocks
//!   L2  [verify] -> [cache 0x11]
//!                       |
//!  data [verify] -> [cache 0x12, burst]  <- read / write
//! ```
//!
//! Reading a data block faults in the L2 block holding its hash, which
//! faults in the L1 block holding that block's hash, up to the master hash.
//! Writes are cached as dirty blocks; `commit` writes them back data level
//! first so each level's hashes are final before its parent is written.
//!
//! The tree's shape is persisted in a 192-byte `IVFC` control block handled
//! by [`HierarchicalIntegrityVerificationStorageControlArea`].

mod block_cache;
mod control_area;
mod hierarchical;
mod semaphore;
mod verification;

pub use block_cache::BlockCacheBufferedStorage;
pub use control_area::{
    HierarchicalInformation, HierarchicalIntegrityVerificationStorageControlArea,
    HierarchicalStorageInformation, InputParam, LevelInformation, MetaInformation, SizeSet,
    INTEGRITY_LAYER_COUNT_SAVE, INTEGRITY_MAX_LAYER_COUNT, INTEGRITY_MIN_LAYER_COUNT, META_MAGIC,
    META_VERSION,
};
pub use hierarchical::HierarchicalIntegrityVerificationStorage;
pub use semaphore::{ConcurrencyLimiter, Semaphore, SemaphorePermit};
pub use verification::{HashSalt, IntegrityVerificationStorage, StorageType, HASH_SIZE};

#[cfg(test)]
mod tests;
