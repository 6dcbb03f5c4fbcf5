use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use storage::{MemoryStorage, Storage, SubStorage};

use crate::*;

pub const NODE_SIZE: usize = 1024;

/// A 16-byte entry: virtual offset plus an opaque payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestEntry {
    pub offset: i64,
    pub value: u64,
}

impl BucketTreeEntry for TestEntry {
    const SIZE: usize = 16;

    fn virtual_offset(&self) -> i64 {
        self.offset
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            offset: LittleEndian::read_i64(&buf[0..8]),
            value: LittleEndian::read_u64(&buf[8..16]),
        }
    }

    fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_i64(&mut buf[0..8], self.offset);
        LittleEndian::write_u64(&mut buf[8..16], self.value);
    }
}

/// A 20-byte entry mapping a virtual range onto one of two storages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedEntry {
    pub virtual_offset: i64,
    pub physical_offset: i64,
    pub storage_index: i32,
}

impl BucketTreeEntry for MappedEntry {
    const SIZE: usize = 20;

    fn virtual_offset(&self) -> i64 {
        self.virtual_offset
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            virtual_offset: LittleEndian::read_i64(&buf[0..8]),
            physical_offset: LittleEndian::read_i64(&buf[8..16]),
            storage_index: LittleEndian::read_i32(&buf[16..20]),
        }
    }

    fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_i64(&mut buf[0..8], self.virtual_offset);
        LittleEndian::write_i64(&mut buf[8..16], self.physical_offset);
        LittleEndian::write_i32(&mut buf[16..20], self.storage_index);
    }
}

impl ContinuousReadingEntry for MappedEntry {
    const FRAGMENT_SIZE_MAX: usize = 4 * 1024;

    fn physical_offset(&self) -> i64 {
        self.physical_offset
    }

    fn is_fragment(&self) -> bool {
        self.storage_index != 0
    }
}

pub struct Fixture {
    pub header: Arc<MemoryStorage>,
    pub node: Arc<MemoryStorage>,
    pub entry: Arc<MemoryStorage>,
    pub entry_count: i32,
    pub entry_size: usize,
}

impl Fixture {
    pub fn node_sub(&self) -> SubStorage {
        let size = self.node.size().unwrap();
        SubStorage::new(self.node.clone(), 0, size)
    }

    pub fn entry_sub(&self) -> SubStorage {
        let size = self.entry.size().unwrap();
        SubStorage::new(self.entry.clone(), 0, size)
    }

    pub fn open(&self) -> BucketTree {
        BucketTree::new(
            self.node_sub(),
            self.entry_sub(),
            NODE_SIZE,
            self.entry_size,
            self.entry_count,
        )
        .unwrap()
    }
}

/// Builds a tree over in-memory storages sized by the query functions.
pub fn build<E: BucketTreeEntry>(entries: &[E], end_offset: i64) -> Fixture {
    let count = entries.len() as i32;
    let fixture = Fixture {
        header: Arc::new(MemoryStorage::new(query_header_storage_size() as usize)),
        node: Arc::new(MemoryStorage::new(
            query_node_storage_size(NODE_SIZE, E::SIZE, count) as usize,
        )),
        entry: Arc::new(MemoryStorage::new(
            query_entry_storage_size(NODE_SIZE, E::SIZE, count) as usize,
        )),
        entry_count: count,
        entry_size: E::SIZE,
    };

    let mut builder = BucketTreeBuilder::new(
        SubStorage::new(fixture.header.clone(), 0, HEADER_SIZE as i64),
        fixture.node_sub(),
        fixture.entry_sub(),
        NODE_SIZE,
        E::SIZE,
        count,
    )
    .unwrap();

    let mut buf = vec![0u8; E::SIZE];
    for e in entries {
        e.encode(&mut buf);
        builder.add(&buf).unwrap();
    }
    builder.finalize(end_offset).unwrap();
    fixture
}

/// `count` entries at offsets `first, first + stride, ...`, value = index.
pub fn evenly_spaced(count: usize, first: i64, stride: i64) -> Vec<TestEntry> {
    (0..count)
        .map(|i| TestEntry {
            offset: first + i as i64 * stride,
            value: i as u64,
        })
        .collect()
}
