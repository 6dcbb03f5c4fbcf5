use std::sync::Arc;

use buffers::AlignedBuffer;
use crypto::{Sha256Generator, Sha256Hash, SHA256_HASH_SIZE};
use storage::{
    check_access_range, check_offset_and_size, align_up, is_aligned, FsError, OperationId,
    QueryRangeInfo, Result, Storage, VerificationFailure,
};

/// Size of one stored block hash.
pub const HASH_SIZE: i64 = SHA256_HASH_SIZE as i64;

/// Salt mixed into every block hash of a save-data level.
pub type HashSalt = [u8; SHA256_HASH_SIZE];

/// What kind of image a hash tree protects. Controls salting, the
/// validation bit and how failures are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    /// Writable data: hashes carry a validation bit; cleared blocks are
    /// legal and read back as zeros.
    SaveData,
    /// Read-only content: plain SHA-256 block hashes.
    RomFs,
    /// Like `RomFs`, but hash mismatches are zeroed without failing the read.
    Authoring,
}

impl StorageType {
    /// Whether a hash tree of this type derives per-level hash salts.
    #[must_use]
    pub fn uses_hash_salt(self) -> bool {
        self == StorageType::SaveData
    }
}

const VALIDATION_BIT: u8 = 0x80;

fn has_validation_bit(hash: &[u8]) -> bool {
    hash[SHA256_HASH_SIZE - 1] & VALIDATION_BIT != 0
}

/// One level of a hash tree: verifies every block of a data storage
/// against the SHA-256 hashes packed in a hash storage.
///
/// Reads and writes must cover whole blocks. The last block may extend
/// past the data storage's size; its tail is treated as zero padding.
pub struct IntegrityVerificationStorage {
    hash_storage: Arc<dyn Storage>,
    data_storage: Arc<dyn Storage>,
    block_order: u32,
    upper_block_order: u32,
    salt: Option<HashSalt>,
    is_real_data: bool,
    storage_type: StorageType,
}

impl IntegrityVerificationStorage {
    /// `block_size` is the block size of this level's data; `upper_block_size`
    /// is the block size of the level holding the hashes (clamped up to
    /// [`HASH_SIZE`]). With a `salt`, every block hash is taken over the
    /// salt followed by the block.
    ///
    /// # Panics
    ///
    /// Panics if either block size is not a power of two, or if `block_size`
    /// is smaller than a hash.
    pub fn new(
        hash_storage: Arc<dyn Storage>,
        data_storage: Arc<dyn Storage>,
        block_size: i64,
        upper_block_size: i64,
        salt: Option<HashSalt>,
        is_real_data: bool,
        storage_type: StorageType,
    ) -> Self {
        assert!(block_size >= HASH_SIZE, "block size must hold at least one hash");
        assert!(
            (block_size as u64).is_power_of_two(),
            "block size must be a power of two"
        );
        let upper_block_size = upper_block_size.max(HASH_SIZE);
        assert!(
            (upper_block_size as u64).is_power_of_two(),
            "upper block size must be a power of two"
        );
        Self {
            hash_storage,
            data_storage,
            block_order: block_size.trailing_zeros(),
            upper_block_order: upper_block_size.trailing_zeros(),
            salt,
            is_real_data,
            storage_type,
        }
    }

    #[must_use]
    pub fn block_size(&self) -> i64 {
        1 << self.block_order
    }

    #[must_use]
    pub fn storage_type(&self) -> StorageType {
        self.storage_type
    }

    #[must_use]
    pub fn is_salted(&self) -> bool {
        self.salt.is_some()
    }

    #[must_use]
    pub fn is_real_data(&self) -> bool {
        self.is_real_data
    }

    /// Hash of one block as it would be stored.
    #[must_use]
    pub fn calc_block_hash(&self, block: &[u8]) -> Sha256Hash {
        let mut sha = Sha256Generator::new();
        if let Some(salt) = &self.salt {
            sha.update(salt);
        }
        sha.update(block);
        let mut hash = sha.finalize();
        if self.storage_type == StorageType::SaveData {
            hash[SHA256_HASH_SIZE - 1] |= VALIDATION_BIT;
        }
        hash
    }

    fn sign_range(&self, offset: i64, size: i64) -> (i64, usize) {
        let sign_offset = (offset >> self.block_order) * HASH_SIZE;
        let sign_size = (size >> self.block_order) * HASH_SIZE;
        (sign_offset, sign_size as usize)
    }

    fn check_block_aligned(&self, offset: i64, size: i64) -> Result<()> {
        if !is_aligned(offset, self.block_size()) {
            return Err(FsError::InvalidOffset);
        }
        if !is_aligned(size, self.block_size()) {
            return Err(FsError::InvalidSize);
        }
        Ok(())
    }

    fn read_block_signature(&self, offset: i64, size: i64, dst: &mut [u8]) -> Result<()> {
        let (sign_offset, sign_size) = self.sign_range(offset, size);
        debug_assert!(dst.len() >= sign_size);
        let hash_size = self.hash_storage.size()?;
        if sign_offset + sign_size as i64 > hash_size {
            return Err(FsError::OutOfRange);
        }
        let result = self.hash_storage.read(sign_offset, &mut dst[..sign_size]);
        if result.is_err() {
            dst[..sign_size].fill(0);
        }
        result
    }

    fn verify_hash(&self, block: &[u8], stored: &[u8]) -> Result<()> {
        if self.storage_type == StorageType::SaveData && !has_validation_bit(stored) {
            if stored.iter().any(|&b| b != 0) {
                return Err(FsError::InvalidZeroHash);
            }
            return Err(FsError::VerificationFailed(VerificationFailure::ClearedRealData));
        }

        if self.calc_block_hash(block)[..] != stored[..] {
            let kind = if self.is_real_data {
                VerificationFailure::UnclearedRealData
            } else {
                VerificationFailure::NonRealData
            };
            return Err(FsError::VerificationFailed(kind));
        }
        Ok(())
    }

    fn data_range_check(&self, offset: i64) -> Result<i64> {
        let data_size = self.data_storage.size()?;
        if offset < 0 || offset > data_size {
            return Err(FsError::InvalidOffset);
        }
        Ok(data_size)
    }
}

impl Storage for IntegrityVerificationStorage {
    fn read(&self, offset: i64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let size = buf.len() as i64;
        self.check_block_aligned(offset, size)?;

        let data_size = self.data_storage.size()?;
        if offset > data_size {
            return Err(FsError::InvalidOffset);
        }
        check_access_range(offset, size, align_up(data_size, self.block_size()))?;

        let mut read_size = buf.len();
        if offset + size > data_size {
            let padding_offset = (data_size - offset) as usize;
            buf[padding_offset..].fill(0);
            read_size = padding_offset;
        }

        if let Err(e) = self.data_storage.read(offset, &mut buf[..read_size]) {
            buf.fill(0);
            return Err(e);
        }

        let block_size = self.block_size() as usize;
        let mut hashes = AlignedBuffer::<8>::zeroed(self.sign_range(0, size).1);
        if let Err(e) = self.read_block_signature(offset, size, &mut hashes) {
            buf.fill(0);
            return Err(e);
        }

        let mut result = Ok(());
        for (i, (block, stored)) in buf
            .chunks_mut(block_size)
            .zip(hashes.chunks(SHA256_HASH_SIZE))
            .enumerate()
        {
            match self.verify_hash(block, stored) {
                Ok(()) => {}
                Err(FsError::VerificationFailed(kind)) => {
                    block.fill(0);
                    if kind == VerificationFailure::ClearedRealData
                        || self.storage_type == StorageType::Authoring
                    {
                        continue;
                    }
                    tracing::warn!(
                        offset = offset + (i * block_size) as i64,
                        ?kind,
                        "block hash mismatch"
                    );
                    if result.is_ok() {
                        result = Err(FsError::VerificationFailed(kind));
                    }
                }
                Err(e) => {
                    buf.fill(0);
                    return Err(e);
                }
            }
        }
        result
    }

    fn write(&self, offset: i64, buf: &[u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let size = buf.len() as i64;
        if !check_offset_and_size(offset, size) {
            return Err(FsError::InvalidOffset);
        }
        let data_size = self.data_storage.size()?;
        if offset >= data_size {
            return Err(FsError::InvalidOffset);
        }
        check_access_range(offset, size, align_up(data_size, self.block_size()))?;
        self.check_block_aligned(offset, size)?;

        let write_size = size.min(data_size - offset) as usize;
        debug_assert!(
            buf[write_size..].iter().all(|&b| b == 0),
            "padding past the end of the data must be zero"
        );

        let block_size = self.block_size() as usize;
        let aligned_write_size = align_up(write_size as i64, block_size as i64);
        let (_, sign_size) = self.sign_range(0, aligned_write_size);
        let mut hashes = AlignedBuffer::<8>::zeroed(sign_size);
        for (block, dst) in buf[..aligned_write_size as usize]
            .chunks(block_size)
            .zip(hashes.chunks_mut(SHA256_HASH_SIZE))
        {
            dst.copy_from_slice(&self.calc_block_hash(block));
        }

        let (sign_offset, _) = self.sign_range(offset, 0);
        self.hash_storage.write(sign_offset, &hashes)?;
        self.data_storage.write(offset, &buf[..write_size])
    }

    fn flush(&self) -> Result<()> {
        self.hash_storage.flush()?;
        self.data_storage.flush()
    }

    fn size(&self) -> Result<i64> {
        self.data_storage.size()
    }

    fn operate_range(&self, op: OperationId, offset: i64, size: i64) -> Result<QueryRangeInfo> {
        match op {
            OperationId::FillZero => {
                if self.storage_type != StorageType::SaveData {
                    return Err(FsError::Unsupported("fill zero on read-only hash tree"));
                }
                let data_size = self.data_range_check(offset)?;
                let (sign_offset, sign_size) = self.sign_range(offset, size.min(data_size - offset));
                if sign_size == 0 {
                    return Ok(QueryRangeInfo::default());
                }

                let chunk = sign_size.min(1 << (self.upper_block_order + 2));
                let zeros = AlignedBuffer::<8>::zeroed(chunk);
                let mut done = 0;
                while done < sign_size {
                    let cur = chunk.min(sign_size - done);
                    self.hash_storage
                        .write(sign_offset + done as i64, &zeros[..cur])?;
                    done += cur;
                }
                Ok(QueryRangeInfo::default())
            }
            OperationId::DestroySignature => {
                if self.storage_type != StorageType::SaveData {
                    return Err(FsError::Unsupported("destroy signature on read-only hash tree"));
                }
                let data_size = self.data_range_check(offset)?;
                let (sign_offset, sign_size) = self.sign_range(offset, size.min(data_size - offset));
                if sign_size == 0 {
                    return Ok(QueryRangeInfo::default());
                }

                let mut hashes = AlignedBuffer::<8>::zeroed(sign_size);
                self.hash_storage.read(sign_offset, &mut hashes)?;
                // Invert every byte but leave the validation bit clear.
                for (i, b) in hashes.iter_mut().enumerate() {
                    *b ^= if (i + 1) % SHA256_HASH_SIZE == 0 { 0x7F } else { 0xFF };
                }
                self.hash_storage.write(sign_offset, &hashes)?;
                Ok(QueryRangeInfo::default())
            }
            OperationId::Invalidate => {
                if self.storage_type == StorageType::SaveData {
                    return Err(FsError::Unsupported("invalidate on save data hash tree"));
                }
                let data_size = self.data_range_check(offset)?;
                let actual_size = size.min(data_size - offset);
                let (sign_offset, sign_size) = self.sign_range(offset, actual_size);
                self.hash_storage
                    .operate_range(op, sign_offset, sign_size as i64)?;
                self.data_storage.operate_range(op, offset, actual_size)?;
                Ok(QueryRangeInfo::default())
            }
            OperationId::QueryRange => {
                let data_size = self.data_range_check(offset)?;
                self.data_storage
                    .operate_range(op, offset, size.min(data_size - offset))
            }
            OperationId::QueryUnpreparedRange => {
                Err(FsError::Unsupported("integrity verification operate_range"))
            }
        }
    }
}

impl std::fmt::Debug for IntegrityVerificationStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegrityVerificationStorage")
            .field("block_size", &self.block_size())
            .field("is_real_data", &self.is_real_data)
            .field("is_salted", &self.salt.is_some())
            .field("storage_type", &self.storage_type)
            .finish()
    }
}
