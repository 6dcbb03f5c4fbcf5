use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::{check_access_range, FsError, OperationId, QueryRangeInfo, Result, Storage};

/// A storage backed by a regular file.
///
/// The file handle sits behind a mutex since every access seeks first.
#[derive(Debug)]
pub struct FileStorage {
    file: Mutex<File>,
}

impl FileStorage {
    /// Opens an existing file for reading and writing.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// Creates (or truncates) a file and sizes it to `size` zero bytes.
    pub fn create<P: AsRef<Path>>(path: P, size: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(size)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, File>> {
        self.file
            .lock()
            .map_err(|e| FsError::LockPoisoned(e.to_string()))
    }
}

impl Storage for FileStorage {
    fn read(&self, offset: i64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let mut f = self.lock()?;
        let len = f.metadata()?.len() as i64;
        check_access_range(offset, buf.len() as i64, len)?;
        f.seek(SeekFrom::Start(offset as u64))?;
        f.read_exact(buf)?;
        Ok(())
    }

    fn write(&self, offset: i64, buf: &[u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let mut f = self.lock()?;
        let len = f.metadata()?.len() as i64;
        check_access_range(offset, buf.len() as i64, len)?;
        f.seek(SeekFrom::Start(offset as u64))?;
        f.write_all(buf)?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let mut f = self.lock()?;
        f.flush()?;
        f.sync_data()?;
        Ok(())
    }

    fn size(&self) -> Result<i64> {
        Ok(self.lock()?.metadata()?.len() as i64)
    }

    fn set_size(&self, size: i64) -> Result<()> {
        if size < 0 {
            return Err(FsError::InvalidSize);
        }
        self.lock()?.set_len(size as u64)?;
        Ok(())
    }

    fn operate_range(&self, op: OperationId, offset: i64, size: i64) -> Result<QueryRangeInfo> {
        match op {
            OperationId::FillZero => {
                let mut f = self.lock()?;
                let len = f.metadata()?.len() as i64;
                check_access_range(offset, size, len)?;
                f.seek(SeekFrom::Start(offset as u64))?;
                let zeros = [0u8; 4096];
                let mut remaining = size as usize;
                while remaining > 0 {
                    let n = remaining.min(zeros.len());
                    f.write_all(&zeros[..n])?;
                    remaining -= n;
                }
                Ok(QueryRangeInfo::default())
            }
            OperationId::Invalidate | OperationId::QueryRange => Ok(QueryRangeInfo::default()),
            OperationId::DestroySignature | OperationId::QueryUnpreparedRange => {
                Err(FsError::Unsupported("file storage operate_range"))
            }
        }
    }
}
