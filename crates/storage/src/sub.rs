use std::sync::Arc;

use crate::{check_access_range, check_offset_and_size, FsError, OperationId, QueryRangeInfo, Result, Storage};

/// A fixed window `[offset, offset + size)` into another storage.
#[derive(Clone)]
pub struct SubStorage {
    base: Arc<dyn Storage>,
    offset: i64,
    size: i64,
}

impl SubStorage {
    /// # Panics
    ///
    /// Panics if `offset` or `size` is negative.
    pub fn new(base: Arc<dyn Storage>, offset: i64, size: i64) -> Self {
        assert!(offset >= 0, "sub storage offset must be >= 0");
        assert!(size >= 0, "sub storage size must be >= 0");
        Self { base, offset, size }
    }

    #[must_use]
    pub fn offset(&self) -> i64 {
        self.offset
    }
}

impl Storage for SubStorage {
    fn read(&self, offset: i64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        check_access_range(offset, buf.len() as i64, self.size)?;
        self.base.read(self.offset + offset, buf)
    }

    fn write(&self, offset: i64, buf: &[u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        check_access_range(offset, buf.len() as i64, self.size)?;
        self.base.write(self.offset + offset, buf)
    }

    fn flush(&self) -> Result<()> {
        self.base.flush()
    }

    fn size(&self) -> Result<i64> {
        Ok(self.size)
    }

    fn operate_range(&self, op: OperationId, offset: i64, size: i64) -> Result<QueryRangeInfo> {
        if !check_offset_and_size(offset, size) {
            return Err(FsError::InvalidOffset);
        }
        if size == 0 {
            return Ok(QueryRangeInfo::default());
        }
        let size = size.min(self.size - offset);
        if size <= 0 {
            return Err(FsError::InvalidOffset);
        }
        self.base.operate_range(op, self.offset + offset, size)
    }
}

impl std::fmt::Debug for SubStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubStorage")
            .field("offset", &self.offset)
            .field("size", &self.size)
            .finish()
    }
}
