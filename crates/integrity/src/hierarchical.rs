use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use buffers::BufferManager;
use config::IntegrityConfig;
use crypto::hmac_sha256;
use storage::{FsError, OperationId, QueryRangeInfo, Result, Storage, SubStorage};

use crate::block_cache::BlockCacheBufferedStorage;
use crate::control_area::{
    HierarchicalInformation, HierarchicalStorageInformation, INTEGRITY_MAX_LAYER_COUNT,
    INTEGRITY_MIN_LAYER_COUNT,
};
use crate::semaphore::{ConcurrencyLimiter, Semaphore, SemaphorePermit};
use crate::verification::{IntegrityVerificationStorage, StorageType, HASH_SIZE};

/// Salt derivation keys, one per level. The trailing NUL is part of the key.
const LEVEL_KEYS: [&[u8]; INTEGRITY_MAX_LAYER_COUNT - 1] = [
    b"HierarchicalIntegrityVerificationStorage::Master\0",
    b"HierarchicalIntegrityVerificationStorage::L1\0",
    b"HierarchicalIntegrityVerificationStorage::L2\0",
    b"HierarchicalIntegrityVerificationStorage::L3\0",
    b"HierarchicalIntegrityVerificationStorage::L4\0",
    b"HierarchicalIntegrityVerificationStorage::L5\0",
];

/// Buffer attribute level of the top hash level; lower levels count up.
const TOP_BUFFER_LEVEL: i32 = 0x10;

/// A cascading hash tree over a data storage.
///
/// Level 0 is verified against the master hash; every following level is
/// verified against the cached storage of the level above it, and the last
/// level holds the data. All levels share one [`BufferManager`].
///
/// Reads and writes go through the data level's cache and are bounded by the
/// [`ConcurrencyLimiter`] given at construction (plus an optional
/// per-instance semaphore). If no permit frees up within the limiter's
/// timeout, every level's cache is flushed before waiting without a bound.
pub struct HierarchicalIntegrityVerificationStorage {
    verify_storages: Vec<Arc<IntegrityVerificationStorage>>,
    buffer_storages: Vec<Arc<BlockCacheBufferedStorage>>,
    limiter: ConcurrencyLimiter,
    instance_semaphore: Option<Arc<Semaphore>>,
    data_size: i64,
    is_written_for_rollback: AtomicBool,
}

impl HierarchicalIntegrityVerificationStorage {
    /// Builds every level top-down. On failure the levels already built are
    /// torn down in reverse before the error is returned.
    pub fn new(
        info: &HierarchicalInformation,
        storages: HierarchicalStorageInformation,
        storage_type: StorageType,
        manager: Arc<BufferManager>,
        limiter: ConcurrencyLimiter,
        config: &IntegrityConfig,
    ) -> Result<Self> {
        let max_layers = info.max_layers as usize;
        if !(INTEGRITY_MIN_LAYER_COUNT..=INTEGRITY_MAX_LAYER_COUNT).contains(&max_layers) {
            return Err(FsError::InvalidArgument);
        }
        let levels = info.levels();
        if storages.levels.len() != levels.len() {
            return Err(FsError::InvalidArgument);
        }

        let cache = match storage_type {
            StorageType::SaveData => config.save_data_cache,
            StorageType::RomFs | StorageType::Authoring => config.rom_cache,
        };

        let mut verify_storages: Vec<Arc<IntegrityVerificationStorage>> = Vec::with_capacity(levels.len());
        let mut buffer_storages: Vec<Arc<BlockCacheBufferedStorage>> = Vec::with_capacity(levels.len());

        for (level, level_info) in levels.iter().enumerate() {
            let is_data = level + 1 == levels.len();
            let built = Self::build_level(
                info,
                level,
                is_data,
                &storages,
                buffer_storages.last(),
                storage_type,
                &manager,
                if is_data { cache.data } else { cache.hash },
            );
            match built {
                Ok((verify, buffer)) => {
                    tracing::debug!(
                        level,
                        size = level_info.size,
                        block_size = level_info.block_size(),
                        is_data,
                        "integrity level built"
                    );
                    verify_storages.push(verify);
                    buffer_storages.push(buffer);
                }
                Err(e) => {
                    tracing::debug!(level, error = %e, "integrity level failed, unwinding");
                    while let Some(buffer) = buffer_storages.pop() {
                        drop(buffer);
                        drop(verify_storages.pop());
                    }
                    return Err(e);
                }
            }
        }

        Ok(Self {
            verify_storages,
            buffer_storages,
            limiter,
            instance_semaphore: None,
            data_size: levels[levels.len() - 1].size,
            is_written_for_rollback: AtomicBool::new(false),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn build_level(
        info: &HierarchicalInformation,
        level: usize,
        is_data: bool,
        storages: &HierarchicalStorageInformation,
        parent: Option<&Arc<BlockCacheBufferedStorage>>,
        storage_type: StorageType,
        manager: &Arc<BufferManager>,
        cache_entries: usize,
    ) -> Result<(Arc<IntegrityVerificationStorage>, Arc<BlockCacheBufferedStorage>)> {
        let level_info = &info.info[level];
        if !(5..=30).contains(&level_info.block_order) || level_info.size < 0 {
            return Err(FsError::InvalidArgument);
        }

        let (hash_storage, upper_block_size): (Arc<dyn Storage>, i64) = match parent {
            None => (storages.master.clone(), HASH_SIZE),
            Some(parent) => {
                let upper = &info.info[level - 1];
                let parent: Arc<dyn Storage> = parent.clone();
                (
                    Arc::new(SubStorage::new(parent, 0, upper.size)),
                    upper.block_size(),
                )
            }
        };

        let salt = storage_type
            .uses_hash_salt()
            .then(|| hmac_sha256(LEVEL_KEYS[level], &info.seed));
        let verify = Arc::new(IntegrityVerificationStorage::new(
            hash_storage,
            storages.levels[level].clone(),
            level_info.block_size(),
            upper_block_size,
            salt,
            is_data,
            storage_type,
        ));

        let buffer = Arc::new(BlockCacheBufferedStorage::new(
            manager.clone(),
            verify.clone(),
            level_info.size,
            level_info.block_size() as usize,
            cache_entries,
            TOP_BUFFER_LEVEL + level as i32,
            is_data,
            storage_type,
        ));
        Ok((verify, buffer))
    }

    /// Additionally bounds this instance's concurrent reads and writes.
    #[must_use]
    pub fn with_instance_semaphore(mut self, semaphore: Arc<Semaphore>) -> Self {
        self.instance_semaphore = Some(semaphore);
        self
    }

    /// Number of verification levels (the master hash not included).
    #[must_use]
    pub fn level_count(&self) -> usize {
        self.buffer_storages.len()
    }

    #[must_use]
    pub fn level_storage(&self, level: usize) -> &Arc<BlockCacheBufferedStorage> {
        &self.buffer_storages[level]
    }

    #[must_use]
    pub fn verification_storage(&self, level: usize) -> &Arc<IntegrityVerificationStorage> {
        &self.verify_storages[level]
    }

    #[must_use]
    pub fn is_written_for_rollback(&self) -> bool {
        self.is_written_for_rollback.load(Ordering::Acquire)
    }

    /// Writes every level's dirty blocks back, data level first, so each
    /// level's hashes are final before the level above commits them.
    pub fn commit(&self) -> Result<()> {
        for (level, buffer) in self.buffer_storages.iter().enumerate().rev() {
            buffer.commit()?;
            tracing::debug!(level, "integrity level committed");
        }
        Ok(())
    }

    /// Discards every level's unflushed writes, data level first.
    pub fn on_rollback(&self) -> Result<()> {
        for buffer in self.buffer_storages.iter().rev() {
            buffer.on_rollback()?;
        }
        self.is_written_for_rollback.store(false, Ordering::Release);
        tracing::debug!("integrity storage rolled back");
        Ok(())
    }

    fn data_storage(&self) -> &BlockCacheBufferedStorage {
        &self.buffer_storages[self.buffer_storages.len() - 1]
    }

    fn flush_levels(&self) -> Result<()> {
        for buffer in self.buffer_storages.iter().rev() {
            buffer.flush()?;
        }
        Ok(())
    }

    /// Takes the instance permit (if any) and then one permit from
    /// `semaphore`, flushing all levels if the timed attempt expires.
    fn acquire<'a>(
        &'a self,
        semaphore: &'a Semaphore,
    ) -> Result<(Option<SemaphorePermit<'a>>, SemaphorePermit<'a>)> {
        let instance = self.instance_semaphore.as_deref().map(Semaphore::acquire);
        if let Some(permit) = semaphore.try_acquire_for(self.limiter.timeout()) {
            return Ok((instance, permit));
        }
        tracing::warn!(
            timeout_ms = self.limiter.timeout().as_millis() as u64,
            "integrity access timed out, flushing levels"
        );
        self.flush_levels()?;
        Ok((instance, semaphore.acquire()))
    }
}

impl Storage for HierarchicalIntegrityVerificationStorage {
    fn read(&self, offset: i64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let _permits = self.acquire(self.limiter.read_semaphore())?;
        self.data_storage().read(offset, buf)
    }

    fn write(&self, offset: i64, buf: &[u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let _permits = self.acquire(self.limiter.write_semaphore())?;
        self.data_storage().write(offset, buf)?;
        self.is_written_for_rollback.store(true, Ordering::Release);
        Ok(())
    }

    /// Durability comes from [`commit`](Self::commit).
    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn size(&self) -> Result<i64> {
        Ok(self.data_size)
    }

    fn operate_range(&self, op: OperationId, offset: i64, size: i64) -> Result<QueryRangeInfo> {
        match op {
            OperationId::FillZero | OperationId::DestroySignature => {
                let info = self.data_storage().operate_range(op, offset, size)?;
                self.is_written_for_rollback.store(true, Ordering::Release);
                Ok(info)
            }
            OperationId::Invalidate | OperationId::QueryRange => {
                self.data_storage().operate_range(op, offset, size)
            }
            OperationId::QueryUnpreparedRange => {
                Err(FsError::Unsupported("hierarchical integrity operate_range"))
            }
        }
    }
}

impl Drop for HierarchicalIntegrityVerificationStorage {
    fn drop(&mut self) {
        while let Some(buffer) = self.buffer_storages.pop() {
            drop(buffer);
            drop(self.verify_storages.pop());
        }
    }
}

impl std::fmt::Debug for HierarchicalIntegrityVerificationStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HierarchicalIntegrityVerificationStorage")
            .field("levels", &self.buffer_storages.len())
            .field("data_size", &self.data_size)
            .field("is_written_for_rollback", &self.is_written_for_rollback())
            .finish()
    }
}
