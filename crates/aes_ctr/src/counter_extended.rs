use std::sync::Arc;

use bucket_tree::{
    query_entry_storage_size, query_header_storage_size, query_node_storage_size, BucketTree, BucketTreeBuilder,
    BucketTreeEntry, Header,
};
use byteorder::{BigEndian, ByteOrder};
use crypto::{Aes128Key, AesIv, AES_BLOCK_SIZE};
use storage::{
    is_aligned, FsError, OperationId, QueryRangeInfo, Result, Storage, SubStorage,
};

use crate::decryptor::{Decryptor, SoftwareDecryptor};
use crate::entry::AesCtrCounterExtendedEntry;

pub const BLOCK_SIZE: i64 = AES_BLOCK_SIZE as i64;
pub const NODE_SIZE: usize = 16 * 1024;

const ENTRY_SIZE: usize = AesCtrCounterExtendedEntry::SIZE;

/// Builds the counter for the block at byte `offset`: the secure value and
/// generation big-endian in the upper half, `offset / 16` big-endian in the
/// lower half.
#[must_use]
pub fn make_iv(secure_value: u32, generation: u32, offset: i64) -> AesIv {
    let mut iv = [0u8; AES_BLOCK_SIZE];
    BigEndian::write_u32(&mut iv[0..4], secure_value);
    BigEndian::write_u32(&mut iv[4..8], generation);
    BigEndian::write_u64(&mut iv[8..16], (offset / BLOCK_SIZE) as u64);
    iv
}

/// A read-only view that decrypts a data storage extent by extent.
///
/// Each extent of the table carries its own generation, so regions written
/// at different times decrypt with different counters under one key. An
/// extent runs from its entry's offset to the next entry's offset, or to the
/// table's end for the last one.
pub struct AesCtrCounterExtendedStorage {
    table: BucketTree,
    data: Arc<dyn Storage>,
    key: Aes128Key,
    secure_value: u32,
    counter_offset: i64,
    decryptor: Box<dyn Decryptor>,
}

impl AesCtrCounterExtendedStorage {
    /// Bytes of table storage a table of `entry_count` entries needs
    /// (header, then nodes, then entry sets).
    #[must_use]
    pub fn query_table_size(entry_count: i32) -> i64 {
        query_header_storage_size()
            + query_node_storage_size(NODE_SIZE, ENTRY_SIZE, entry_count)
            + query_entry_storage_size(NODE_SIZE, ENTRY_SIZE, entry_count)
    }

    /// Writes `entries` (ascending by offset) as a table ending at
    /// `end_offset`, in the layout [`from_table_storage`](Self::from_table_storage)
    /// reads.
    pub fn write_table(table: SubStorage, entries: &[AesCtrCounterExtendedEntry], end_offset: i64) -> Result<()> {
        let count = i32::try_from(entries.len()).map_err(|_| FsError::InvalidArgument)?;
        if count == 0 {
            return Err(FsError::InvalidArgument);
        }
        let (header, node, entry) = Self::split_table(table, count);

        let mut builder = BucketTreeBuilder::new(header, node, entry, NODE_SIZE, ENTRY_SIZE, count)?;
        let mut buf = [0u8; ENTRY_SIZE];
        for e in entries {
            e.encode(&mut buf);
            builder.add(&buf)?;
        }
        builder.finalize(end_offset)
    }

    /// Opens a table laid out as header, nodes and entry sets in one
    /// storage, decrypting in software with no counter offset.
    pub fn from_table_storage(
        key: Aes128Key,
        secure_value: u32,
        data: Arc<dyn Storage>,
        table: SubStorage,
    ) -> Result<Self> {
        Self::with_table_storage(key, secure_value, 0, data, table, Box::new(SoftwareDecryptor))
    }

    /// Like [`from_table_storage`](Self::from_table_storage) with an explicit
    /// counter offset and decryptor.
    pub fn with_table_storage(
        key: Aes128Key,
        secure_value: u32,
        counter_offset: i64,
        data: Arc<dyn Storage>,
        table: SubStorage,
        decryptor: Box<dyn Decryptor>,
    ) -> Result<Self> {
        let header = Header::read_from(&table)?;
        let (_, node, entry) = Self::split_table(table, header.entry_count);
        Self::new(
            key,
            secure_value,
            counter_offset,
            data,
            node,
            entry,
            header.entry_count,
            decryptor,
        )
    }

    /// # Panics
    ///
    /// Panics if `counter_offset` is negative.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        key: Aes128Key,
        secure_value: u32,
        counter_offset: i64,
        data: Arc<dyn Storage>,
        node_storage: SubStorage,
        entry_storage: SubStorage,
        entry_count: i32,
        decryptor: Box<dyn Decryptor>,
    ) -> Result<Self> {
        assert!(counter_offset >= 0, "counter offset must be >= 0");
        let table = BucketTree::new(node_storage, entry_storage, NODE_SIZE, ENTRY_SIZE, entry_count)?;
        tracing::debug!(
            entry_count,
            end = table.end(),
            counter_offset,
            external_key = decryptor.has_external_decryption_key(),
            "aes-ctr counter extended storage opened"
        );
        Ok(Self {
            table,
            data,
            key,
            secure_value,
            counter_offset,
            decryptor,
        })
    }

    #[must_use]
    pub fn table(&self) -> &BucketTree {
        &self.table
    }

    #[must_use]
    pub fn counter_offset(&self) -> i64 {
        self.counter_offset
    }

    fn split_table(table: SubStorage, entry_count: i32) -> (SubStorage, SubStorage, SubStorage) {
        let header_size = query_header_storage_size();
        let node_size = query_node_storage_size(NODE_SIZE, ENTRY_SIZE, entry_count);
        let entry_size = query_entry_storage_size(NODE_SIZE, ENTRY_SIZE, entry_count);

        let base: Arc<dyn Storage> = Arc::new(table);
        (
            SubStorage::new(base.clone(), 0, header_size),
            SubStorage::new(base.clone(), header_size, node_size),
            SubStorage::new(base, header_size + node_size, entry_size),
        )
    }

    fn check_block_range(&self, offset: i64, size: i64) -> Result<()> {
        if !is_aligned(offset, BLOCK_SIZE) {
            return Err(FsError::InvalidOffset);
        }
        if !is_aligned(size, BLOCK_SIZE) {
            return Err(FsError::InvalidSize);
        }
        if !self.table.includes_range(offset, size) {
            return Err(FsError::OutOfRange);
        }
        Ok(())
    }

    fn check_entry_offset(&self, offset: i64) -> Result<()> {
        if !is_aligned(offset, BLOCK_SIZE) || offset < 0 || !self.table.includes(offset) {
            return Err(FsError::InvalidAesCtrCounterExtendedEntryOffset);
        }
        Ok(())
    }
}

impl Storage for AesCtrCounterExtendedStorage {
    fn read(&self, offset: i64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let end = offset + buf.len() as i64;
        self.check_block_range(offset, buf.len() as i64)?;

        self.data.read(offset, buf)?;

        let mut visitor = self.table.find(offset)?;
        self.check_entry_offset(visitor.get::<AesCtrCounterExtendedEntry>().offset)?;

        let mut cur = offset;
        let mut done = 0usize;
        while cur < end {
            let entry: AesCtrCounterExtendedEntry = visitor.get();
            if entry.offset > cur {
                return Err(FsError::InvalidAesCtrCounterExtendedEntryOffset);
            }

            let next = if visitor.can_move_next() {
                visitor.move_next()?;
                let next = visitor.get::<AesCtrCounterExtendedEntry>().offset;
                if !self.table.includes(next) {
                    return Err(FsError::InvalidAesCtrCounterExtendedEntryOffset);
                }
                next
            } else {
                self.table.end()
            };
            if !is_aligned(next, BLOCK_SIZE) || cur >= next {
                return Err(FsError::InvalidAesCtrCounterExtendedEntryOffset);
            }

            let size = (end - cur).min(next - cur) as usize;
            let chunk = &mut buf[done..done + size];
            if entry.is_encrypted() {
                let iv = make_iv(
                    self.secure_value,
                    entry.generation as u32,
                    self.counter_offset + cur,
                );
                self.decryptor.decrypt(chunk, &self.key, &iv);
            }
            tracing::trace!(
                offset = cur,
                size,
                generation = entry.generation,
                encrypted = entry.is_encrypted(),
                "extent decrypted"
            );

            done += size;
            cur += size as i64;
        }
        Ok(())
    }

    fn write(&self, _offset: i64, _buf: &[u8]) -> Result<()> {
        Err(FsError::Unsupported("aes-ctr counter extended storage write"))
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn size(&self) -> Result<i64> {
        Ok(self.table.end())
    }

    fn operate_range(&self, op: OperationId, offset: i64, size: i64) -> Result<QueryRangeInfo> {
        match op {
            OperationId::Invalidate => {
                if size == 0 {
                    return Ok(QueryRangeInfo::default());
                }
                self.check_block_range(offset, size)?;
                self.table.invalidate_cache()?;
                self.data.operate_range(op, offset, size)?;
                Ok(QueryRangeInfo::default())
            }
            OperationId::QueryRange => {
                if size == 0 {
                    return Ok(QueryRangeInfo::default());
                }
                self.check_block_range(offset, size)?;
                let mut info = self.data.operate_range(op, offset, size)?;
                info.merge(&QueryRangeInfo {
                    aes_ctr_key_type: self.decryptor.key_type(),
                    ..QueryRangeInfo::default()
                });
                Ok(info)
            }
            _ => Err(FsError::Unsupported("aes-ctr counter extended storage operate_range")),
        }
    }
}

impl std::fmt::Debug for AesCtrCounterExtendedStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesCtrCounterExtendedStorage")
            .field("table", &self.table)
            .field("secure_value", &self.secure_value)
            .field("counter_offset", &self.counter_offset)
            .finish_non_exhaustive()
    }
}
