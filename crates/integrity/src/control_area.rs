use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use storage::{align_up, FsError, Result, Storage, SubStorage};

use crate::verification::{HashSalt, HASH_SIZE};

pub const INTEGRITY_MIN_LAYER_COUNT: usize = 2;
pub const INTEGRITY_MAX_LAYER_COUNT: usize = 7;
/// Layer count used by save data images (master plus four levels).
pub const INTEGRITY_LAYER_COUNT_SAVE: usize = 5;

pub const META_MAGIC: u32 = u32::from_le_bytes(*b"IVFC");
pub const META_VERSION: u32 = 0x0002_0000;
const META_VERSION_MASK: u32 = 0xFFFF_0000;

const LEVEL_INFO_SIZE: usize = 24;
const MAX_LEVELS: usize = INTEGRITY_MAX_LAYER_COUNT - 1;

/// Placement of one level inside the body storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LevelInformation {
    pub offset: i64,
    pub size: i64,
    pub block_order: i32,
}

impl LevelInformation {
    #[must_use]
    pub fn block_size(&self) -> i64 {
        1 << self.block_order
    }
}

/// Shape of a hash tree: how many layers, where each level lives and the
/// seed its salts are derived from.
///
/// `max_layers` counts the master hash, so `info[..max_layers - 1]` are the
/// levels, hash levels first and the data level last.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HierarchicalInformation {
    pub max_layers: u32,
    pub info: [LevelInformation; MAX_LEVELS],
    pub seed: HashSalt,
}

impl HierarchicalInformation {
    /// The levels actually in use.
    #[must_use]
    pub fn levels(&self) -> &[LevelInformation] {
        let count = (self.max_layers as usize).saturating_sub(1).min(MAX_LEVELS);
        &self.info[..count]
    }

    /// Size of the body storage all levels are laid out in.
    #[must_use]
    pub fn body_size(&self) -> i64 {
        self.levels()
            .iter()
            .map(|l| l.offset + l.size)
            .max()
            .unwrap_or(0)
    }
}

/// The persisted control block of a hash tree.
///
/// ```text
/// 0x00  magic "IVFC"          u32
/// 0x04  version               u32
/// 0x08  master hash size      u32
/// 0x0C  max layers            u32
/// 0x10  levels[6]             { offset i64, size i64, block_order i32, reserved u32 }
/// 0xA0  seed                  [u8; 32]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaInformation {
    pub magic: u32,
    pub version: u32,
    pub master_hash_size: u32,
    pub level_hash_info: HierarchicalInformation,
}

impl MetaInformation {
    pub const SIZE: usize = 16 + LEVEL_INFO_SIZE * MAX_LEVELS + HASH_SIZE as usize;

    pub fn new(master_hash_size: u32, level_hash_info: HierarchicalInformation) -> Self {
        Self {
            magic: META_MAGIC,
            version: META_VERSION,
            master_hash_size,
            level_hash_info,
        }
    }

    /// Lays a fresh tree out for `data_size` bytes of data.
    ///
    /// Levels are packed into one body storage in order, each starting on a
    /// multiple of its own block size.
    pub fn for_data_size(
        param: &InputParam,
        layer_count: usize,
        data_size: i64,
        seed: HashSalt,
    ) -> Self {
        let sizes = HierarchicalIntegrityVerificationStorageControlArea::query_size(param, layer_count, data_size);

        let mut info = HierarchicalInformation {
            max_layers: layer_count as u32,
            seed,
            ..HierarchicalInformation::default()
        };
        let mut offset = 0i64;
        for level in 0..layer_count - 1 {
            let block_size = param.level_block_size[level] as i64;
            let size = if level == layer_count - 2 {
                data_size
            } else {
                sizes.layered_hash_sizes[level]
            };
            offset = align_up(offset, block_size);
            info.info[level] = LevelInformation {
                offset,
                size,
                block_order: block_size.trailing_zeros() as i32,
            };
            offset += size;
        }
        Self::new(sizes.master_hash_size as u32, info)
    }

    pub fn decode(buf: &[u8]) -> Self {
        let mut info = HierarchicalInformation {
            max_layers: LittleEndian::read_u32(&buf[12..16]),
            ..HierarchicalInformation::default()
        };
        for (i, level) in info.info.iter_mut().enumerate() {
            let at = 16 + i * LEVEL_INFO_SIZE;
            *level = LevelInformation {
                offset: LittleEndian::read_i64(&buf[at..at + 8]),
                size: LittleEndian::read_i64(&buf[at + 8..at + 16]),
                block_order: LittleEndian::read_i32(&buf[at + 16..at + 20]),
            };
        }
        let seed_at = 16 + LEVEL_INFO_SIZE * MAX_LEVELS;
        info.seed.copy_from_slice(&buf[seed_at..seed_at + HASH_SIZE as usize]);

        Self {
            magic: LittleEndian::read_u32(&buf[0..4]),
            version: LittleEndian::read_u32(&buf[4..8]),
            master_hash_size: LittleEndian::read_u32(&buf[8..12]),
            level_hash_info: info,
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        LittleEndian::write_u32(&mut buf[0..4], self.magic);
        LittleEndian::write_u32(&mut buf[4..8], self.version);
        LittleEndian::write_u32(&mut buf[8..12], self.master_hash_size);
        LittleEndian::write_u32(&mut buf[12..16], self.level_hash_info.max_layers);
        for (i, level) in self.level_hash_info.info.iter().enumerate() {
            let at = 16 + i * LEVEL_INFO_SIZE;
            LittleEndian::write_i64(&mut buf[at..at + 8], level.offset);
            LittleEndian::write_i64(&mut buf[at + 8..at + 16], level.size);
            LittleEndian::write_i32(&mut buf[at + 16..at + 20], level.block_order);
        }
        let seed_at = 16 + LEVEL_INFO_SIZE * MAX_LEVELS;
        buf[seed_at..].copy_from_slice(&self.level_hash_info.seed);
        buf
    }

    fn verify_magic_and_version(&self) -> Result<()> {
        if self.magic != META_MAGIC {
            return Err(FsError::IncorrectIntegrityVerificationMagic);
        }
        if self.version & META_VERSION_MASK != META_VERSION & META_VERSION_MASK {
            return Err(FsError::UnsupportedVersion);
        }
        Ok(())
    }
}

/// Block size of each level, hash levels first, data level last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputParam {
    pub level_block_size: [usize; MAX_LEVELS],
}

impl InputParam {
    /// Every level uses `block_size`.
    pub fn uniform(block_size: usize) -> Self {
        Self {
            level_block_size: [block_size; MAX_LEVELS],
        }
    }
}

/// Storage footprint of a tree, as computed by
/// [`HierarchicalIntegrityVerificationStorageControlArea::query_size`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SizeSet {
    pub control_size: i64,
    pub master_hash_size: i64,
    /// Sizes of the hash levels between the master hash and the data.
    pub layered_hash_sizes: [i64; MAX_LEVELS - 1],
}

/// Reads, writes and validates a tree's [`MetaInformation`].
#[derive(Debug)]
pub struct HierarchicalIntegrityVerificationStorageControlArea {
    storage: SubStorage,
    meta: MetaInformation,
}

impl HierarchicalIntegrityVerificationStorageControlArea {
    /// Computes every level's size bottom-up from the data size.
    ///
    /// # Panics
    ///
    /// Panics if `layer_count` is outside
    /// `INTEGRITY_MIN_LAYER_COUNT..=INTEGRITY_MAX_LAYER_COUNT`, if a used
    /// block size is not a power of two, or if `data_size` is negative.
    #[must_use]
    pub fn query_size(param: &InputParam, layer_count: usize, data_size: i64) -> SizeSet {
        assert!(
            (INTEGRITY_MIN_LAYER_COUNT..=INTEGRITY_MAX_LAYER_COUNT).contains(&layer_count),
            "layer count out of range"
        );
        assert!(data_size >= 0, "data size must be >= 0");
        let bs = &param.level_block_size;
        for &block_size in &bs[..layer_count - 1] {
            assert!(block_size.is_power_of_two(), "level block size must be a power of two");
        }

        let mut level_size = [0i64; INTEGRITY_MAX_LAYER_COUNT];
        let last = layer_count - 1;
        level_size[last] = align_up(data_size, bs[last - 1] as i64);
        for level in (1..last).rev() {
            level_size[level] = align_up(
                level_size[level + 1] / bs[level] as i64 * HASH_SIZE,
                bs[level - 1] as i64,
            );
        }

        let mut out = SizeSet {
            control_size: MetaInformation::SIZE as i64,
            master_hash_size: level_size[1] / bs[0] as i64 * HASH_SIZE,
            ..SizeSet::default()
        };
        for level in 1..last {
            out.layered_hash_sizes[level - 1] = level_size[level];
        }
        out
    }

    /// Writes `meta` as a new control block.
    pub fn format(meta_storage: &SubStorage, meta: &MetaInformation) -> Result<()> {
        if meta_storage.size()? < MetaInformation::SIZE as i64 {
            return Err(FsError::InvalidSize);
        }
        meta.verify_magic_and_version()?;
        meta_storage.write(0, &meta.to_bytes())?;
        meta_storage.flush()
    }

    /// Replaces an existing control block after checking that both the old
    /// and the new one carry exactly the current magic and version.
    pub fn expand(meta_storage: &SubStorage, meta: &MetaInformation) -> Result<()> {
        if meta_storage.size()? < MetaInformation::SIZE as i64 {
            return Err(FsError::InvalidSize);
        }

        let mut buf = [0u8; MetaInformation::SIZE];
        meta_storage.read(0, &mut buf)?;
        let prev = MetaInformation::decode(&buf);
        if prev.magic != META_MAGIC || prev.magic != meta.magic {
            return Err(FsError::IncorrectIntegrityVerificationMagic);
        }
        if prev.version != META_VERSION || prev.version != meta.version {
            return Err(FsError::UnsupportedVersion);
        }

        meta_storage.write(0, &meta.to_bytes())?;
        meta_storage.flush()?;
        tracing::debug!(layers = meta.level_hash_info.max_layers, "integrity meta expanded");
        Ok(())
    }

    /// Loads and validates the control block stored in `meta_storage`.
    pub fn new(meta_storage: SubStorage) -> Result<Self> {
        if meta_storage.size()? < MetaInformation::SIZE as i64 {
            return Err(FsError::InvalidSize);
        }
        let mut buf = [0u8; MetaInformation::SIZE];
        meta_storage.read(0, &mut buf)?;
        let meta = MetaInformation::decode(&buf);
        meta.verify_magic_and_version()?;
        Ok(Self {
            storage: meta_storage,
            meta,
        })
    }

    #[must_use]
    pub fn meta(&self) -> &MetaInformation {
        &self.meta
    }

    #[must_use]
    pub fn master_hash_size(&self) -> i64 {
        i64::from(self.meta.master_hash_size)
    }

    #[must_use]
    pub fn level_hash_info(&self) -> &HierarchicalInformation {
        &self.meta.level_hash_info
    }

    #[must_use]
    pub fn storage(&self) -> &SubStorage {
        &self.storage
    }
}

/// The storages a hierarchical tree is built over.
#[derive(Clone)]
pub struct HierarchicalStorageInformation {
    pub master: Arc<dyn Storage>,
    /// Hash levels L1.. followed by the data level.
    pub levels: Vec<Arc<dyn Storage>>,
}

impl HierarchicalStorageInformation {
    /// Carves every level out of one body storage using the offsets in `info`.
    pub fn from_body(
        master: Arc<dyn Storage>,
        body: &Arc<dyn Storage>,
        info: &HierarchicalInformation,
    ) -> Self {
        let levels = info
            .levels()
            .iter()
            .map(|l| Arc::new(SubStorage::new(body.clone(), l.offset, l.size)) as Arc<dyn Storage>)
            .collect();
        Self { master, levels }
    }
}

impl std::fmt::Debug for HierarchicalStorageInformation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HierarchicalStorageInformation")
            .field("levels", &self.levels.len())
            .finish()
    }
}
