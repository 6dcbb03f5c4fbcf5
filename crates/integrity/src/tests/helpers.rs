use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use buffers::BufferManager;
use config::{CacheFloorConfig, IntegrityConfig};
use storage::{FsError, MemoryStorage, OperationId, QueryRangeInfo, Result, Storage, SubStorage, VerificationFailure};

use crate::*;

pub const BLOCK: usize = 512;
pub const SEED: HashSalt = [7u8; 32];

pub fn manager() -> Arc<BufferManager> {
    Arc::new(BufferManager::new(
        512 * 1024,
        BLOCK,
        256,
        &CacheFloorConfig::default(),
    ))
}

pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

pub fn mem(size: usize) -> Arc<MemoryStorage> {
    Arc::new(MemoryStorage::new(size))
}

// -------------------- Image --------------------

/// A zero-filled save-data image: valid as-is, since cleared hashes read
/// back as zero blocks.
pub struct Image {
    pub master: Arc<MemoryStorage>,
    pub body: Arc<MemoryStorage>,
    pub meta: MetaInformation,
}

impl Image {
    pub fn new(layer_count: usize, data_size: i64) -> Self {
        let meta = MetaInformation::for_data_size(&InputParam::uniform(BLOCK), layer_count, data_size, SEED);
        Self {
            master: mem(meta.master_hash_size as usize),
            body: mem(meta.level_hash_info.body_size() as usize),
            meta,
        }
    }

    pub fn info(&self) -> &HierarchicalInformation {
        &self.meta.level_hash_info
    }

    pub fn level(&self, level: usize) -> LevelInformation {
        self.info().levels()[level]
    }

    pub fn data_offset(&self) -> i64 {
        let levels = self.info().levels();
        levels[levels.len() - 1].offset
    }

    pub fn storages(&self) -> HierarchicalStorageInformation {
        let body: Arc<dyn Storage> = self.body.clone();
        HierarchicalStorageInformation::from_body(self.master.clone(), &body, self.info())
    }

    pub fn open(&self) -> HierarchicalIntegrityVerificationStorage {
        self.open_with(self.storages(), ConcurrencyLimiter::default())
    }

    pub fn open_with(
        &self,
        storages: HierarchicalStorageInformation,
        limiter: ConcurrencyLimiter,
    ) -> HierarchicalIntegrityVerificationStorage {
        HierarchicalIntegrityVerificationStorage::new(
            self.info(),
            storages,
            StorageType::SaveData,
            manager(),
            limiter,
            &IntegrityConfig::default(),
        )
        .unwrap()
    }

    /// Flips every bit of one byte of the raw body storage.
    pub fn corrupt(&self, body_offset: i64) {
        let mut b = [0u8; 1];
        self.body.read(body_offset, &mut b).unwrap();
        b[0] ^= 0xFF;
        self.body.write(body_offset, &b).unwrap();
    }
}

pub fn data_level(sub: &HierarchicalStorageInformation) -> Arc<dyn Storage> {
    sub.levels[sub.levels.len() - 1].clone()
}

pub fn window(base: Arc<dyn Storage>, offset: i64, size: i64) -> Arc<dyn Storage> {
    Arc::new(SubStorage::new(base, offset, size))
}

// -------------------- Instrumented storages --------------------

/// Tracks how many reads are in flight at once across every storage
/// sharing it.
#[derive(Debug, Default)]
pub struct Gauge {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    total: AtomicUsize,
}

impl Gauge {
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

/// Counts reads and writes, and optionally sleeps inside each read.
pub struct CountingStorage {
    inner: Arc<dyn Storage>,
    gauge: Arc<Gauge>,
    delay: Duration,
    pub reads: AtomicUsize,
    pub writes: AtomicUsize,
}

impl CountingStorage {
    pub fn new(inner: Arc<dyn Storage>) -> Self {
        Self::with_gauge(inner, Arc::new(Gauge::default()), Duration::ZERO)
    }

    pub fn with_gauge(inner: Arc<dyn Storage>, gauge: Arc<Gauge>, delay: Duration) -> Self {
        Self {
            inner,
            gauge,
            delay,
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl Storage for CountingStorage {
    fn read(&self, offset: i64, buf: &mut [u8]) -> Result<()> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.gauge.total.fetch_add(1, Ordering::SeqCst);
        let now = self.gauge.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.gauge.peak.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let result = self.inner.read(offset, buf);
        self.gauge.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn write(&self, offset: i64, buf: &[u8]) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.write(offset, buf)
    }

    fn flush(&self) -> Result<()> {
        self.inner.flush()
    }

    fn size(&self) -> Result<i64> {
        self.inner.size()
    }

    fn operate_range(&self, op: OperationId, offset: i64, size: i64) -> Result<QueryRangeInfo> {
        self.inner.operate_range(op, offset, size)
    }
}

/// Appends its name to a shared log on every write.
pub struct LoggingStorage {
    inner: Arc<dyn Storage>,
    name: &'static str,
    log: Arc<Mutex<Vec<&'static str>>>,
}

impl LoggingStorage {
    pub fn new(inner: Arc<dyn Storage>, name: &'static str, log: Arc<Mutex<Vec<&'static str>>>) -> Self {
        Self { inner, name, log }
    }
}

impl Storage for LoggingStorage {
    fn read(&self, offset: i64, buf: &mut [u8]) -> Result<()> {
        self.inner.read(offset, buf)
    }

    fn write(&self, offset: i64, buf: &[u8]) -> Result<()> {
        self.log.lock().unwrap().push(self.name);
        self.inner.write(offset, buf)
    }

    fn flush(&self) -> Result<()> {
        self.inner.flush()
    }

    fn size(&self) -> Result<i64> {
        self.inner.size()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Io,
    Corrupt,
    /// Fails the next read as corrupt, then disarms.
    CorruptOnce,
}

/// Fails reads with the armed fault.
pub struct FaultyStorage {
    inner: Arc<dyn Storage>,
    fault: Mutex<Option<Fault>>,
}

impl FaultyStorage {
    pub fn new(inner: Arc<dyn Storage>) -> Self {
        Self {
            inner,
            fault: Mutex::new(None),
        }
    }

    pub fn arm(&self, fault: Option<Fault>) {
        *self.fault.lock().unwrap() = fault;
    }
}

impl Storage for FaultyStorage {
    fn read(&self, offset: i64, buf: &mut [u8]) -> Result<()> {
        let mut fault = self.fault.lock().unwrap();
        match *fault {
            Some(Fault::Io) => Err(FsError::Io(io::Error::new(io::ErrorKind::Other, "injected"))),
            Some(Fault::Corrupt) => Err(FsError::VerificationFailed(
                VerificationFailure::UnclearedRealData,
            )),
            Some(Fault::CorruptOnce) => {
                *fault = None;
                Err(FsError::VerificationFailed(VerificationFailure::UnclearedRealData))
            }
            None => self.inner.read(offset, buf),
        }
    }

    fn write(&self, offset: i64, buf: &[u8]) -> Result<()> {
        self.inner.write(offset, buf)
    }

    fn flush(&self) -> Result<()> {
        self.inner.flush()
    }

    fn size(&self) -> Result<i64> {
        self.inner.size()
    }

    fn operate_range(&self, op: OperationId, offset: i64, size: i64) -> Result<QueryRangeInfo> {
        self.inner.operate_range(op, offset, size)
    }
}
