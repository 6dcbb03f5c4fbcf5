use anyhow::{bail, Context, Result};
use buffers::BufferManager;
use config::Config;
use integrity::{
    ConcurrencyLimiter, HierarchicalIntegrityVerificationStorage,
    HierarchicalIntegrityVerificationStorageControlArea, HierarchicalStorageInformation, InputParam,
    MetaInformation, StorageType, INTEGRITY_MAX_LAYER_COUNT, INTEGRITY_MIN_LAYER_COUNT,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use storage::{align_up, FileStorage, Storage, SubStorage};

/// Alignment of the master hash and body regions inside the image file.
const REGION_ALIGNMENT: i64 = 0x200;

/// Where each region of an image file starts.
///
/// ```text
/// 0x000          IVFC meta information
/// 0x200          master hash
/// body_offset    hash levels, then the data level
/// ```
#[derive(Debug, Clone, Copy)]
struct Layout {
    master_offset: i64,
    master_size: i64,
    body_offset: i64,
    body_size: i64,
}

impl Layout {
    fn of(meta: &MetaInformation) -> Self {
        let master_offset = align_up(MetaInformation::SIZE as i64, REGION_ALIGNMENT);
        let master_size = i64::from(meta.master_hash_size);
        let body_offset = align_up(master_offset + master_size, REGION_ALIGNMENT);
        Self {
            master_offset,
            master_size,
            body_offset,
            body_size: meta.level_hash_info.body_size(),
        }
    }

    fn file_size(&self) -> i64 {
        self.body_offset + self.body_size
    }
}

/// A save-data style verified image stored in a single file.
pub struct Image {
    path: PathBuf,
    file: Arc<dyn Storage>,
    meta: MetaInformation,
    layout: Layout,
    manager: Arc<BufferManager>,
    config: Config,
    tree: HierarchicalIntegrityVerificationStorage,
}

impl Image {
    /// Creates a zeroed image holding `data_size` bytes behind `layers` layers.
    pub fn format<P: AsRef<Path>>(
        path: P,
        data_size: i64,
        layers: usize,
        block_size: usize,
        config: &Config,
    ) -> Result<Self> {
        if !(INTEGRITY_MIN_LAYER_COUNT..=INTEGRITY_MAX_LAYER_COUNT).contains(&layers) {
            bail!("layer count must be in {INTEGRITY_MIN_LAYER_COUNT}..={INTEGRITY_MAX_LAYER_COUNT}");
        }
        if !block_size.is_power_of_two() || block_size < 32 {
            bail!("block size must be a power of two >= 32");
        }
        if data_size <= 0 {
            bail!("data size must be > 0");
        }

        let seed = crypto::sha256(path.as_ref().to_string_lossy().as_bytes());
        let meta = MetaInformation::for_data_size(&InputParam::uniform(block_size), layers, data_size, seed);
        let layout = Layout::of(&meta);

        let file: Arc<dyn Storage> = Arc::new(
            FileStorage::create(path.as_ref(), layout.file_size() as u64)
                .with_context(|| format!("creating {}", path.as_ref().display()))?,
        );
        HierarchicalIntegrityVerificationStorageControlArea::format(
            &SubStorage::new(file.clone(), 0, MetaInformation::SIZE as i64),
            &meta,
        )?;
        tracing::debug!(path = %path.as_ref().display(), data_size, layers, block_size, "image formatted");

        Self::assemble(path.as_ref().to_path_buf(), file, meta, config)
    }

    /// Opens an existing image, validating its meta information.
    pub fn open<P: AsRef<Path>>(path: P, config: &Config) -> Result<Self> {
        let file: Arc<dyn Storage> = Arc::new(
            FileStorage::open(path.as_ref()).with_context(|| format!("opening {}", path.as_ref().display()))?,
        );
        let control = HierarchicalIntegrityVerificationStorageControlArea::new(SubStorage::new(
            file.clone(),
            0,
            MetaInformation::SIZE as i64,
        ))?;
        let meta = *control.meta();

        let layout = Layout::of(&meta);
        if file.size()? < layout.file_size() {
            bail!("image is truncated: {} < {} bytes", file.size()?, layout.file_size());
        }
        Self::assemble(path.as_ref().to_path_buf(), file, meta, config)
    }

    fn assemble(path: PathBuf, file: Arc<dyn Storage>, meta: MetaInformation, config: &Config) -> Result<Self> {
        let layout = Layout::of(&meta);
        let manager = Arc::new(BufferManager::from_config(config));
        let tree = Self::build_tree(&file, &meta, &layout, &manager, config)?;
        Ok(Self {
            path,
            file,
            meta,
            layout,
            manager,
            config: *config,
            tree,
        })
    }

    fn build_tree(
        file: &Arc<dyn Storage>,
        meta: &MetaInformation,
        layout: &Layout,
        manager: &Arc<BufferManager>,
        config: &Config,
    ) -> Result<HierarchicalIntegrityVerificationStorage> {
        let master: Arc<dyn Storage> = Arc::new(SubStorage::new(
            file.clone(),
            layout.master_offset,
            layout.master_size,
        ));
        let body: Arc<dyn Storage> = Arc::new(SubStorage::new(
            file.clone(),
            layout.body_offset,
            layout.body_size,
        ));
        let storages = HierarchicalStorageInformation::from_body(master, &body, &meta.level_hash_info);

        Ok(HierarchicalIntegrityVerificationStorage::new(
            &meta.level_hash_info,
            storages,
            StorageType::SaveData,
            manager.clone(),
            ConcurrencyLimiter::from_config(&config.integrity),
            &config.integrity,
        )?)
    }

    pub fn tree(&self) -> &HierarchicalIntegrityVerificationStorage {
        &self.tree
    }

    pub fn manager(&self) -> &BufferManager {
        &self.manager
    }

    pub fn meta(&self) -> &MetaInformation {
        &self.meta
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn data_size(&self) -> i64 {
        self.meta.level_hash_info.levels().last().map_or(0, |l| l.size)
    }

    /// Flips every bit of the data byte at `offset` directly in the file,
    /// then rebuilds the tree so the change is seen. Uncommitted writes are
    /// lost.
    pub fn corrupt(&mut self, offset: i64) -> Result<()> {
        if offset < 0 || offset >= self.data_size() {
            bail!("offset {offset} is outside the data level");
        }
        let levels = self.meta.level_hash_info.levels();
        let at = self.layout.body_offset + levels[levels.len() - 1].offset + offset;

        let mut byte = [0u8; 1];
        self.file.read(at, &mut byte)?;
        byte[0] ^= 0xFF;
        self.file.write(at, &byte)?;
        self.file.flush()?;

        self.tree = Self::build_tree(&self.file, &self.meta, &self.layout, &self.manager, &self.config)?;
        tracing::debug!(offset, file_offset = at, "data byte corrupted");
        Ok(())
    }

    /// Commits the tree and flushes the file.
    pub fn commit(&self) -> Result<()> {
        self.tree.commit()?;
        self.file.flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("path", &self.path)
            .field("layout", &self.layout)
            .field("tree", &self.tree)
            .finish()
    }
}
