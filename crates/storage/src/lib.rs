//! # Storage
//!
//! The block-storage abstraction every layer of the stack reads and writes
//! through, plus the shared error taxonomy.
//!
//! A [`Storage`] is a flat, byte-addressed region with positional `read` and
//! `write`. Methods take `&self` so one storage can be shared between layers
//! (an integrity level reads its parent's cached storage while the parent is
//! also used directly); implementations guard their own state.
//!
//! Three implementations live here:
//!
//! - [`MemoryStorage`]: a growable in-memory byte vector.
//! - [`FileStorage`]: a regular file.
//! - [`SubStorage`]: a bounds-checked window into another storage.

mod error;
mod file;
mod memory;
mod sub;

use std::sync::Arc;

pub use error::{FsError, Result, VerificationFailure};
pub use file::FileStorage;
pub use memory::MemoryStorage;
pub use sub::SubStorage;

/// Range operations a storage may support besides plain I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationId {
    /// Zero the range (for integrity layers: clear the block hashes).
    FillZero,
    /// Invalidate the hashes covering the range without touching data.
    DestroySignature,
    /// Drop any cached copy of the range.
    Invalidate,
    /// Report how the range is stored (see [`QueryRangeInfo`]).
    QueryRange,
    /// Report the first offset that is not yet populated.
    QueryUnpreparedRange,
}

/// Key-type flags reported through [`QueryRangeInfo::aes_ctr_key_type`].
pub mod aes_ctr_key_type {
    pub const INTERNAL_KEY_FOR_SOFTWARE_AES: i32 = 1 << 0;
    pub const INTERNAL_KEY_FOR_HARDWARE_AES: i32 = 1 << 1;
    pub const EXTERNAL_KEY_FOR_HARDWARE_AES: i32 = 1 << 2;
}

/// Result of [`OperationId::QueryRange`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryRangeInfo {
    pub aes_ctr_key_type: i32,
    pub speed_emulation_type: i32,
}

impl QueryRangeInfo {
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Folds `other` into `self` (flags are OR-ed).
    pub fn merge(&mut self, other: &QueryRangeInfo) {
        self.aes_ctr_key_type |= other.aes_ctr_key_type;
        self.speed_emulation_type |= other.speed_emulation_type;
    }
}

/// A positional, byte-addressed storage.
pub trait Storage: Send + Sync {
    /// Fills `buf` with the bytes at `offset`.
    fn read(&self, offset: i64, buf: &mut [u8]) -> Result<()>;

    /// Writes `buf` at `offset`.
    fn write(&self, offset: i64, buf: &[u8]) -> Result<()>;

    /// Makes previous writes durable.
    fn flush(&self) -> Result<()>;

    /// Current logical size in bytes.
    fn size(&self) -> Result<i64>;

    fn set_size(&self, _size: i64) -> Result<()> {
        Err(FsError::Unsupported("set_size"))
    }

    /// Performs `op` over `[offset, offset + size)`.
    ///
    /// Operations other than [`OperationId::QueryRange`] return a cleared
    /// [`QueryRangeInfo`].
    fn operate_range(&self, _op: OperationId, _offset: i64, _size: i64) -> Result<QueryRangeInfo> {
        Err(FsError::Unsupported("operate_range"))
    }
}

impl<S: Storage + ?Sized> Storage for Arc<S> {
    fn read(&self, offset: i64, buf: &mut [u8]) -> Result<()> {
        (**self).read(offset, buf)
    }

    fn write(&self, offset: i64, buf: &[u8]) -> Result<()> {
        (**self).write(offset, buf)
    }

    fn flush(&self) -> Result<()> {
        (**self).flush()
    }

    fn size(&self) -> Result<i64> {
        (**self).size()
    }

    fn set_size(&self, size: i64) -> Result<()> {
        (**self).set_size(size)
    }

    fn operate_range(&self, op: OperationId, offset: i64, size: i64) -> Result<QueryRangeInfo> {
        (**self).operate_range(op, offset, size)
    }
}

// ---- Range helpers ----

/// True if `offset` and `size` are non-negative and do not overflow.
#[must_use]
pub fn check_offset_and_size(offset: i64, size: i64) -> bool {
    offset >= 0 && size >= 0 && offset.checked_add(size).is_some()
}

/// Fails with `OutOfRange` unless `[offset, offset + size)` lies in `[0, total)`.
pub fn check_access_range(offset: i64, size: i64, total: i64) -> Result<()> {
    if !check_offset_and_size(offset, size) {
        return Err(FsError::OutOfRange);
    }
    if offset + size > total {
        return Err(FsError::OutOfRange);
    }
    Ok(())
}

/// Rounds `value` up to a multiple of `align` (a power of two).
#[must_use]
pub fn align_up(value: i64, align: i64) -> i64 {
    debug_assert!(align > 0 && (align & (align - 1)) == 0);
    (value + align - 1) & !(align - 1)
}

/// Rounds `value` down to a multiple of `align` (a power of two).
#[must_use]
pub fn align_down(value: i64, align: i64) -> i64 {
    debug_assert!(align > 0 && (align & (align - 1)) == 0);
    value & !(align - 1)
}

#[must_use]
pub fn is_aligned(value: i64, align: i64) -> bool {
    debug_assert!(align > 0 && (align & (align - 1)) == 0);
    value & (align - 1) == 0
}
