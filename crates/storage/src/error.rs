use std::io;

use thiserror::Error;

/// Which kind of block failed hash verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationFailure {
    /// A data block whose stored hash was cleared (all zero).
    ClearedRealData,
    /// A data block whose stored hash does not match its contents.
    UnclearedRealData,
    /// A hash-level block whose stored hash does not match its contents.
    NonRealData,
}

/// Errors surfaced by storages, the bucket tree and the integrity layers.
#[derive(Debug, Error)]
pub enum FsError {
    /// An underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// A mutex guarding storage state was poisoned by a panicking thread.
    #[error("lock poisoned: {0}")]
    LockPoisoned(String),

    // ---- Allocation ----
    /// The buffer manager could not supply a buffer, even after eviction.
    #[error("buffer allocation failed")]
    BufferAllocationFailed,

    #[error("allocation failure in {0}")]
    AllocationFailure(&'static str),

    // ---- Range ----
    #[error("out of range")]
    OutOfRange,

    #[error("invalid offset")]
    InvalidOffset,

    #[error("invalid size")]
    InvalidSize,

    #[error("invalid argument")]
    InvalidArgument,

    // ---- Data corruption ----
    #[error("invalid bucket tree signature")]
    InvalidBucketTreeSignature,

    #[error("invalid bucket tree entry count")]
    InvalidBucketTreeEntryCount,

    #[error("invalid bucket tree node index")]
    InvalidBucketTreeNodeIndex,

    #[error("invalid bucket tree node entry count")]
    InvalidBucketTreeNodeEntryCount,

    #[error("invalid bucket tree node offset")]
    InvalidBucketTreeNodeOffset,

    #[error("invalid bucket tree entry offset")]
    InvalidBucketTreeEntryOffset,

    #[error("invalid bucket tree entry set offset")]
    InvalidBucketTreeEntrySetOffset,

    #[error("invalid bucket tree virtual offset")]
    InvalidBucketTreeVirtualOffset,

    #[error("invalid indirect entry offset")]
    InvalidIndirectEntryOffset,

    #[error("invalid aes-ctr counter extended entry offset")]
    InvalidAesCtrCounterExtendedEntryOffset,

    #[error("incorrect integrity verification magic")]
    IncorrectIntegrityVerificationMagic,

    #[error("unsupported version")]
    UnsupportedVersion,

    /// A hash without the validation bit that is not all zero.
    #[error("invalid zero hash")]
    InvalidZeroHash,

    #[error("integrity verification failed: {0:?}")]
    VerificationFailed(VerificationFailure),

    // ---- Unsupported ----
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
}

impl FsError {
    /// True for errors that mean persisted data or metadata is inconsistent.
    ///
    /// These are never retried.
    #[must_use]
    pub fn is_data_corrupted(&self) -> bool {
        matches!(
            self,
            FsError::InvalidBucketTreeSignature
                | FsError::InvalidBucketTreeEntryCount
                | FsError::InvalidBucketTreeNodeIndex
                | FsError::InvalidBucketTreeNodeEntryCount
                | FsError::InvalidBucketTreeNodeOffset
                | FsError::InvalidBucketTreeEntryOffset
                | FsError::InvalidBucketTreeEntrySetOffset
                | FsError::InvalidBucketTreeVirtualOffset
                | FsError::InvalidIndirectEntryOffset
                | FsError::InvalidAesCtrCounterExtendedEntryOffset
                | FsError::IncorrectIntegrityVerificationMagic
                | FsError::UnsupportedVersion
                | FsError::InvalidZeroHash
                | FsError::VerificationFailed(_)
        )
    }

    /// True if the block failed hash verification.
    #[must_use]
    pub fn is_verification_failure(&self) -> bool {
        matches!(
            self,
            FsError::VerificationFailed(_) | FsError::InvalidZeroHash
        )
    }

    #[must_use]
    pub fn is_allocation_failure(&self) -> bool {
        matches!(
            self,
            FsError::BufferAllocationFailed | FsError::AllocationFailure(_)
        )
    }

    #[must_use]
    pub fn is_out_of_range(&self) -> bool {
        matches!(
            self,
            FsError::OutOfRange | FsError::InvalidOffset | FsError::InvalidSize
        )
    }
}

/// Convenience alias used throughout the storage stack.
pub type Result<T> = std::result::Result<T, FsError>;
