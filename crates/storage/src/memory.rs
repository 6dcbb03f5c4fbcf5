use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{check_access_range, FsError, OperationId, QueryRangeInfo, Result, Storage};

/// A storage backed by a `Vec<u8>`.
///
/// Reads take a shared lock, so concurrent readers never block each other.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    data: RwLock<Vec<u8>>,
}

impl MemoryStorage {
    /// Creates a zero-filled storage of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self::from_vec(vec![0u8; size])
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(data),
        }
    }

    /// Copies the current contents out.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(self.read_guard()?.clone())
    }

    fn read_guard(&self) -> Result<RwLockReadGuard<'_, Vec<u8>>> {
        self.data
            .read()
            .map_err(|e| FsError::LockPoisoned(e.to_string()))
    }

    fn write_guard(&self) -> Result<RwLockWriteGuard<'_, Vec<u8>>> {
        self.data
            .write()
            .map_err(|e| FsError::LockPoisoned(e.to_string()))
    }
}

impl Storage for MemoryStorage {
    fn read(&self, offset: i64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let data = self.read_guard()?;
        check_access_range(offset, buf.len() as i64, data.len() as i64)?;
        let start = offset as usize;
        buf.copy_from_slice(&data[start..start + buf.len()]);
        Ok(())
    }

    fn write(&self, offset: i64, buf: &[u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let mut data = self.write_guard()?;
        check_access_range(offset, buf.len() as i64, data.len() as i64)?;
        let start = offset as usize;
        data[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn size(&self) -> Result<i64> {
        Ok(self.read_guard()?.len() as i64)
    }

    fn set_size(&self, size: i64) -> Result<()> {
        if size < 0 {
            return Err(FsError::InvalidSize);
        }
        self.write_guard()?.resize(size as usize, 0);
        Ok(())
    }

    fn operate_range(&self, op: OperationId, offset: i64, size: i64) -> Result<QueryRangeInfo> {
        match op {
            OperationId::FillZero => {
                let mut data = self.write_guard()?;
                check_access_range(offset, size, data.len() as i64)?;
                let start = offset as usize;
                data[start..start + size as usize].fill(0);
                Ok(QueryRangeInfo::default())
            }
            OperationId::Invalidate | OperationId::QueryRange => Ok(QueryRangeInfo::default()),
            OperationId::DestroySignature | OperationId::QueryUnpreparedRange => {
                Err(FsError::Unsupported("memory storage operate_range"))
            }
        }
    }
}
