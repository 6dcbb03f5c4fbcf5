use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use buffers::{AlignedBuffer, Buffer, BufferAttribute, BufferManager, CacheHandle};
use storage::{align_down, align_up, is_aligned, FsError, OperationId, QueryRangeInfo, Result, Storage};

use crate::StorageType;

/// Dirty entries past this count are flushed when the pool runs low.
const DIRTY_FLUSH_THRESHOLD: usize = 2;

#[derive(Default)]
enum Slot {
    #[default]
    Empty,
    /// Parked in the buffer manager; may be evicted behind our back.
    Clean { offset: i64, handle: CacheHandle },
    /// Owned until written back.
    Dirty { offset: i64, buffer: Buffer },
}

impl Slot {
    fn offset(&self) -> Option<i64> {
        match self {
            Slot::Empty => None,
            Slot::Clean { offset, .. } | Slot::Dirty { offset, .. } => Some(*offset),
        }
    }

    fn is_dirty(&self) -> bool {
        matches!(self, Slot::Dirty { .. })
    }
}

struct CacheState {
    slots: Vec<Slot>,
    invalidate_index: usize,
    /// Bumped whenever cached or stored block contents change, so fills
    /// that raced a modification are not cached.
    epoch: u64,
    last_error: Option<(io::ErrorKind, String)>,
}

/// A write-back cache of fixed-size blocks in front of one integrity level.
///
/// Each cache slot holds one verification block. Clean blocks are parked in
/// the shared [`BufferManager`] and can be evicted by it at any time; dirty
/// blocks are owned by the slot until flushed. Misses are filled from the
/// underlying storage without holding the slot lock. Writes are serialized
/// per instance.
///
/// In burst mode (used for the data level) block-aligned reads and writes of
/// two blocks or more bypass the cache.
///
/// An I/O error from the underlying storage is sticky: every later call
/// fails with it until an `Invalidate` range operation succeeds.
/// Verification failures are reported but never sticky.
pub struct BlockCacheBufferedStorage {
    manager: Arc<BufferManager>,
    data: Arc<dyn Storage>,
    data_size: i64,
    block_size: usize,
    attr: BufferAttribute,
    burst_mode: bool,
    storage_type: StorageType,
    state: Mutex<CacheState>,
    write_gate: Mutex<()>,
}

impl BlockCacheBufferedStorage {
    /// # Panics
    ///
    /// Panics if `block_size` is not a power of two or `max_cache_entries`
    /// is zero.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        manager: Arc<BufferManager>,
        data: Arc<dyn Storage>,
        data_size: i64,
        block_size: usize,
        max_cache_entries: usize,
        buffer_level: i32,
        burst_mode: bool,
        storage_type: StorageType,
    ) -> Self {
        assert!(block_size.is_power_of_two(), "block size must be a power of two");
        assert!(max_cache_entries > 0, "a block cache needs at least one entry");
        let slots = std::iter::repeat_with(Slot::default)
            .take(max_cache_entries)
            .collect();
        Self {
            manager,
            data,
            data_size,
            block_size,
            attr: BufferAttribute::new(buffer_level),
            burst_mode,
            storage_type,
            state: Mutex::new(CacheState {
                slots,
                invalidate_index: 0,
                epoch: 0,
                last_error: None,
            }),
            write_gate: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Slots currently holding a block (clean or dirty).
    #[must_use]
    pub fn cached_entry_count(&self) -> usize {
        self.lock().slots.iter().filter(|s| s.offset().is_some()).count()
    }

    #[must_use]
    pub fn dirty_entry_count(&self) -> usize {
        self.lock().slots.iter().filter(|s| s.is_dirty()).count()
    }

    /// Writes back every dirty block.
    pub fn commit(&self) -> Result<()> {
        self.check_last_error()?;
        let mut state = self.lock();
        self.flush_all(&mut state)
    }

    /// Drops every cached block, discarding unflushed writes.
    pub fn on_rollback(&self) -> Result<()> {
        self.check_last_error()?;
        let mut state = self.lock();
        let mut discarded = 0usize;
        for slot in &mut state.slots {
            match std::mem::take(slot) {
                Slot::Empty => {}
                Slot::Clean { handle, .. } => drop(self.manager.acquire_cache(handle)),
                Slot::Dirty { .. } => discarded += 1,
            }
        }
        state.epoch += 1;
        tracing::debug!(level = self.attr.level(), discarded, "block cache rolled back");
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ---- Sticky failure state ----

    fn check_last_error(&self) -> Result<()> {
        match &self.lock().last_error {
            Some((kind, message)) => Err(FsError::Io(io::Error::new(*kind, message.clone()))),
            None => Ok(()),
        }
    }

    fn record_locked<T>(state: &mut CacheState, result: Result<T>) -> Result<T> {
        if let Err(FsError::Io(e)) = &result {
            if state.last_error.is_none() {
                tracing::warn!(error = %e, "block cache entering failed state");
                state.last_error = Some((e.kind(), e.to_string()));
            }
        }
        result
    }

    fn record<T>(&self, result: Result<T>) -> Result<T> {
        if matches!(result, Err(FsError::Io(_))) {
            let mut state = self.lock();
            return Self::record_locked(&mut state, result);
        }
        result
    }

    // ---- Slot management (state lock held) ----

    fn find(state: &CacheState, offset: i64) -> Option<usize> {
        state.slots.iter().position(|s| s.offset() == Some(offset))
    }

    fn overlaps(&self, slot_offset: i64, offset: i64, size: i64) -> bool {
        slot_offset < offset + size && offset < slot_offset + self.block_size as i64
    }

    /// Copies part of a cached block out. Returns false if the manager had
    /// already evicted it.
    fn copy_out(&self, state: &mut CacheState, index: usize, at: usize, dst: &mut [u8]) -> bool {
        match std::mem::take(&mut state.slots[index]) {
            Slot::Empty => false,
            Slot::Dirty { offset, buffer } => {
                dst.copy_from_slice(&buffer[at..at + dst.len()]);
                state.slots[index] = Slot::Dirty { offset, buffer };
                true
            }
            Slot::Clean { offset, handle } => match self.manager.acquire_cache(handle) {
                Some(buffer) => {
                    dst.copy_from_slice(&buffer[at..at + dst.len()]);
                    let handle = self.manager.register_cache(buffer, self.attr);
                    state.slots[index] = Slot::Clean { offset, handle };
                    true
                }
                None => false,
            },
        }
    }

    /// Writes into a cached block, turning it dirty. Returns false if the
    /// manager had already evicted it.
    fn copy_in(&self, state: &mut CacheState, index: usize, at: usize, src: &[u8]) -> bool {
        let (offset, mut buffer) = match std::mem::take(&mut state.slots[index]) {
            Slot::Empty => return false,
            Slot::Dirty { offset, buffer } => (offset, buffer),
            Slot::Clean { offset, handle } => match self.manager.acquire_cache(handle) {
                Some(buffer) => (offset, buffer),
                None => return false,
            },
        };
        buffer[at..at + src.len()].copy_from_slice(src);
        state.slots[index] = Slot::Dirty { offset, buffer };
        state.epoch += 1;
        true
    }

    /// Writes a dirty slot back. With `invalidate` the slot is emptied,
    /// otherwise it becomes clean.
    fn flush_slot(&self, state: &mut CacheState, index: usize, invalidate: bool) -> Result<()> {
        match std::mem::take(&mut state.slots[index]) {
            Slot::Empty => Ok(()),
            Slot::Clean { offset, handle } => {
                if invalidate {
                    drop(self.manager.acquire_cache(handle));
                } else {
                    state.slots[index] = Slot::Clean { offset, handle };
                }
                Ok(())
            }
            Slot::Dirty { offset, buffer } => {
                let result = self.data.write(offset, &buffer[..self.block_size]);
                if result.is_err() {
                    state.slots[index] = Slot::Dirty { offset, buffer };
                    return Self::record_locked(state, result);
                }
                tracing::trace!(level = self.attr.level(), offset, "block written back");
                if !invalidate {
                    let handle = self.manager.register_cache(buffer, self.attr);
                    state.slots[index] = Slot::Clean { offset, handle };
                }
                Ok(())
            }
        }
    }

    fn flush_range(&self, state: &mut CacheState, offset: i64, size: i64, invalidate: bool) -> Result<()> {
        for index in 0..state.slots.len() {
            if let Some(slot_offset) = state.slots[index].offset() {
                if self.overlaps(slot_offset, offset, size) {
                    self.flush_slot(state, index, invalidate)?;
                }
            }
        }
        Ok(())
    }

    fn flush_all(&self, state: &mut CacheState) -> Result<()> {
        for index in 0..state.slots.len() {
            self.flush_slot(state, index, false)?;
        }
        Ok(())
    }

    /// Drops cached copies overlapping the range. Dirty blocks are discarded.
    fn invalidate_range(&self, state: &mut CacheState, offset: i64, size: i64) {
        for slot in &mut state.slots {
            let Some(slot_offset) = slot.offset() else { continue };
            if !self.overlaps(slot_offset, offset, size) {
                continue;
            }
            match std::mem::take(slot) {
                Slot::Clean { handle, .. } => drop(self.manager.acquire_cache(handle)),
                Slot::Dirty { offset, .. } => {
                    tracing::warn!(level = self.attr.level(), offset, "discarding dirty block on invalidate");
                }
                Slot::Empty => {}
            }
        }
        state.epoch += 1;
    }

    /// Finds a slot to reuse, evicting the next one in rotation if needed.
    fn free_slot(&self, state: &mut CacheState) -> Result<usize> {
        if let Some(index) = state.slots.iter().position(|s| s.offset().is_none()) {
            return Ok(index);
        }
        let count = state.slots.len();
        let victim = (0..count)
            .map(|i| (state.invalidate_index + 1 + i) % count)
            .find(|&i| !state.slots[i].is_dirty())
            .unwrap_or((state.invalidate_index + 1) % count);
        self.flush_slot(state, victim, true)?;
        state.invalidate_index = victim;
        Ok(victim)
    }

    fn store(&self, state: &mut CacheState, offset: i64, buffer: Buffer, dirty: bool) -> Result<()> {
        let index = self.free_slot(state)?;
        state.slots[index] = if dirty {
            Slot::Dirty { offset, buffer }
        } else {
            let handle = self.manager.register_cache(buffer, self.attr);
            Slot::Clean { offset, handle }
        };
        Ok(())
    }

    fn allocate(&self) -> Result<Buffer> {
        if self.block_size > self.manager.total_size() {
            return Err(FsError::AllocationFailure("block cache: block larger than the buffer pool"));
        }
        if let Some(buffer) = self.manager.allocate_buffer(self.block_size, self.attr) {
            return Ok(buffer);
        }
        // Give back everything this cache holds and try once more.
        {
            let mut state = self.lock();
            for index in 0..state.slots.len() {
                self.flush_slot(&mut state, index, true)?;
            }
        }
        self.manager
            .allocate_buffer(self.block_size, self.attr)
            .ok_or(FsError::BufferAllocationFailed)
    }

    /// Flushes older dirty blocks when the pool is under pressure.
    fn control_dirtiness(&self) -> Result<()> {
        if self.manager.total_allocatable_size() >= self.manager.total_size() / 4 {
            return Ok(());
        }
        let mut state = self.lock();
        let count = state.slots.len();
        let mut dirty = 0;
        let mut flushed = state.invalidate_index;
        for i in 0..count {
            let index = (state.invalidate_index + 1 + i) % count;
            if state.slots[index].is_dirty() {
                dirty += 1;
                if dirty >= DIRTY_FLUSH_THRESHOLD {
                    self.flush_slot(&mut state, index, false)?;
                    flushed = index;
                }
            }
        }
        state.invalidate_index = flushed;
        Ok(())
    }

    // ---- Per-block I/O ----

    /// A miss fills outside the lock, so it can land between a concurrent
    /// write-back's hash write and its data write. A fill that fails
    /// verification is therefore read once more before the error is kept.
    fn read_block(&self, block_offset: i64, at: usize, dst: &mut [u8]) -> Result<()> {
        let epoch = {
            let mut state = self.lock();
            if let Some(index) = Self::find(&state, block_offset) {
                if self.copy_out(&mut state, index, at, dst) {
                    return Ok(());
                }
            }
            state.epoch
        };

        let mut buffer = self.allocate()?;
        let mut filled = self.data.read(block_offset, &mut buffer[..self.block_size]);
        if matches!(filled, Err(FsError::VerificationFailed(_))) {
            tracing::debug!(level = self.attr.level(), offset = block_offset, "fill failed verification, rereading");
            filled = self.data.read(block_offset, &mut buffer[..self.block_size]);
        }
        self.record(filled)?;
        dst.copy_from_slice(&buffer[at..at + dst.len()]);
        tracing::trace!(level = self.attr.level(), offset = block_offset, "block filled");

        let mut state = self.lock();
        if state.epoch != epoch || Self::find(&state, block_offset).is_some() {
            // Redundant or stale fill.
            return Ok(());
        }
        self.store(&mut state, block_offset, buffer, false)
    }

    /// Caller holds the write gate.
    fn write_block(&self, block_offset: i64, at: usize, src: &[u8]) -> Result<()> {
        {
            let mut state = self.lock();
            if let Some(index) = Self::find(&state, block_offset) {
                if self.copy_in(&mut state, index, at, src) {
                    return Ok(());
                }
            }
        }

        let mut buffer = self.allocate()?;
        if at != 0 || src.len() < self.block_size {
            self.record(self.data.read(block_offset, &mut buffer[..self.block_size]))?;
        }

        let mut state = self.lock();
        if let Some(index) = Self::find(&state, block_offset) {
            // A reader cached the same contents meanwhile.
            if self.copy_in(&mut state, index, at, src) {
                return Ok(());
            }
        }
        buffer[at..at + src.len()].copy_from_slice(src);
        state.epoch += 1;
        self.store(&mut state, block_offset, buffer, true)
    }

    fn check_offset(&self, offset: i64) -> Result<()> {
        if offset < 0 || offset >= self.data_size {
            return Err(FsError::InvalidOffset);
        }
        Ok(())
    }

    fn aligned_extent(&self, offset: i64, size: i64) -> (i64, i64) {
        let block = self.block_size as i64;
        let actual = size.min(self.data_size - offset);
        let start = align_down(offset, block);
        (start, align_up(offset + actual, block) - start)
    }

    fn clear(&self, offset: i64, size: i64) -> Result<()> {
        let _gate = self.write_gate.lock().unwrap_or_else(PoisonError::into_inner);
        self.check_last_error()?;
        self.check_offset(offset)?;

        let block = self.block_size as i64;
        let limit = (offset + size).min(self.data_size);
        let mut start = align_down(offset, block);
        let mut end = align_up(limit, block);
        {
            let mut state = self.lock();
            self.flush_range(&mut state, offset, size, true)?;
            state.epoch += 1;
        }

        if start < offset || limit < end {
            let mut work = AlignedBuffer::<8>::zeroed(self.block_size);
            if start < offset {
                self.record(self.data.read(start, &mut work))?;
                let at = (offset - start) as usize;
                let len = ((block - at as i64).min(size)) as usize;
                work[at..at + len].fill(0);
                self.record(self.data.write(start, &work))?;
                start += block;
            }
            if start < limit && limit < end {
                let last = end - block;
                self.record(self.data.read(last, &mut work))?;
                work[..(limit - last) as usize].fill(0);
                self.record(self.data.write(last, &work))?;
                end -= block;
            }
        }

        if start < end {
            self.record(self.data.operate_range(OperationId::FillZero, start, end - start))?;
        }
        self.lock().epoch += 1;
        Ok(())
    }

    fn clear_signature(&self, offset: i64, size: i64) -> Result<()> {
        let _gate = self.write_gate.lock().unwrap_or_else(PoisonError::into_inner);
        self.check_last_error()?;
        self.check_offset(offset)?;

        let block = self.block_size as i64;
        let start = align_up(offset, block);
        let end = align_down((offset + size).min(self.data_size), block);
        {
            let mut state = self.lock();
            self.flush_range(&mut state, offset, size, true)?;
            state.epoch += 1;
        }
        if start < end {
            self.record(self.data.operate_range(OperationId::DestroySignature, start, end - start))?;
        }
        Ok(())
    }
}

impl Storage for BlockCacheBufferedStorage {
    fn read(&self, offset: i64, buf: &mut [u8]) -> Result<()> {
        self.check_last_error()?;
        if buf.is_empty() {
            return Ok(());
        }
        self.check_offset(offset)?;

        let block = self.block_size as i64;
        let read_size = (buf.len() as i64).min(self.data_size - offset) as usize;
        let mut cur = offset;
        let mut done = 0usize;
        while done < read_size {
            let remaining = (read_size - done) as i64;
            if self.burst_mode && is_aligned(cur, block) && remaining >= block * 2 {
                let len = align_down(remaining, block) as usize;
                {
                    let mut state = self.lock();
                    self.flush_range(&mut state, cur, len as i64, false)?;
                }
                self.record(self.data.read(cur, &mut buf[done..done + len]))?;
                cur += len as i64;
                done += len;
                continue;
            }

            let block_offset = align_down(cur, block);
            let at = (cur - block_offset) as usize;
            let len = (remaining as usize).min(self.block_size - at);
            self.read_block(block_offset, at, &mut buf[done..done + len])?;
            cur += len as i64;
            done += len;
        }
        Ok(())
    }

    fn write(&self, offset: i64, buf: &[u8]) -> Result<()> {
        let _gate = self.write_gate.lock().unwrap_or_else(PoisonError::into_inner);
        self.check_last_error()?;
        if buf.is_empty() {
            return Ok(());
        }
        self.check_offset(offset)?;

        let block = self.block_size as i64;
        let write_size = (buf.len() as i64).min(self.data_size - offset) as usize;
        let mut cur = offset;
        let mut done = 0usize;
        while done < write_size {
            let remaining = (write_size - done) as i64;
            if self.burst_mode && is_aligned(cur, block) && remaining >= block * 2 {
                let len = align_down(remaining, block);
                {
                    let mut state = self.lock();
                    self.flush_range(&mut state, cur, len, true)?;
                }
                self.record(self.data.write(cur, &buf[done..done + len as usize]))?;
                {
                    let mut state = self.lock();
                    self.invalidate_range(&mut state, cur, len);
                }
                cur += len;
                done += len as usize;
                continue;
            }

            let block_offset = align_down(cur, block);
            let at = (cur - block_offset) as usize;
            let len = (remaining as usize).min(self.block_size - at);
            self.write_block(block_offset, at, &buf[done..done + len])?;
            cur += len as i64;
            done += len;
        }

        self.control_dirtiness()?;
        self.check_last_error()
    }

    fn flush(&self) -> Result<()> {
        self.check_last_error()?;
        {
            let mut state = self.lock();
            self.flush_all(&mut state)?;
        }
        self.record(self.data.flush())
    }

    fn size(&self) -> Result<i64> {
        Ok(self.data_size)
    }

    fn operate_range(&self, op: OperationId, offset: i64, size: i64) -> Result<QueryRangeInfo> {
        match op {
            OperationId::FillZero => {
                self.clear(offset, size)?;
                Ok(QueryRangeInfo::default())
            }
            OperationId::DestroySignature => {
                self.clear_signature(offset, size)?;
                Ok(QueryRangeInfo::default())
            }
            OperationId::Invalidate => {
                if self.storage_type == StorageType::SaveData {
                    return Err(FsError::Unsupported("invalidate on save data block cache"));
                }
                self.check_offset(offset)?;
                let (start, len) = self.aligned_extent(offset, size);
                {
                    let mut state = self.lock();
                    self.invalidate_range(&mut state, offset, size);
                }
                self.data.operate_range(op, start, len)?;
                self.lock().last_error = None;
                Ok(QueryRangeInfo::default())
            }
            OperationId::QueryRange => {
                self.check_offset(offset)?;
                let (start, len) = self.aligned_extent(offset, size);
                self.record(self.data.operate_range(op, start, len))
            }
            OperationId::QueryUnpreparedRange => {
                Err(FsError::Unsupported("block cache operate_range"))
            }
        }
    }
}

impl Drop for BlockCacheBufferedStorage {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for slot in &mut state.slots {
            if let Slot::Clean { handle, .. } = std::mem::take(slot) {
                drop(self.manager.acquire_cache(handle));
            }
        }
    }
}

impl std::fmt::Debug for BlockCacheBufferedStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCacheBufferedStorage")
            .field("data_size", &self.data_size)
            .field("block_size", &self.block_size)
            .field("level", &self.attr.level())
            .field("burst_mode", &self.burst_mode)
            .finish()
    }
}
