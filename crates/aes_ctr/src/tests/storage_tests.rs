use std::sync::Arc;

use storage::{aes_ctr_key_type, FsError, MemoryStorage, OperationId, Storage, SubStorage};

use super::helpers::*;
use crate::*;

type Entry = AesCtrCounterExtendedEntry;

fn mixed_entries() -> Vec<Entry> {
    vec![
        Entry::encrypted(0, 1),
        Entry::plain(0x400),
        Entry::encrypted(0x800, 3),
    ]
}

// -------------------- Read --------------------

#[test]
fn decrypts_across_extents() {
    let f = Fixture::new(&mixed_entries(), 0xC00, 0);
    let storage = f.open();
    assert_eq!(storage.size().unwrap(), 0xC00);

    let mut buf = vec![0u8; 0xC00];
    storage.read(0, &mut buf).unwrap();
    assert_eq!(buf, f.plain);
}

#[test]
fn read_starting_mid_extent() {
    let f = Fixture::new(&mixed_entries(), 0xC00, 0);
    let storage = f.open();

    let mut buf = vec![0u8; 0x500];
    storage.read(0x3F0, &mut buf).unwrap();
    assert_eq!(buf, f.plain[0x3F0..0x8F0]);
}

#[test]
fn plain_extent_is_passed_through() {
    let f = Fixture::new(&mixed_entries(), 0xC00, 0);
    let mut raw = vec![0u8; 0x400];
    f.data.read(0x400, &mut raw).unwrap();
    assert_eq!(raw, f.plain[0x400..0x800]);

    let mut encrypted = vec![0u8; 0x400];
    f.data.read(0, &mut encrypted).unwrap();
    assert_ne!(encrypted, f.plain[..0x400]);
}

#[test]
fn generation_and_counter_offset_select_the_keystream() {
    let entries = [Entry::encrypted(0, 7)];
    let f = Fixture::new(&entries, 0x200, 0x1000);

    let mut buf = vec![0u8; 0x200];
    f.open_with(0x1000, Box::new(SoftwareDecryptor)).read(0, &mut buf).unwrap();
    assert_eq!(buf, f.plain);

    f.open().read(0, &mut buf).unwrap();
    assert_ne!(buf, f.plain);
}

#[test]
fn iv_layout_is_big_endian() {
    let iv = make_iv(0x0102_0304, 0x0506_0708, 0x100);
    assert_eq!(iv, [1, 2, 3, 4, 5, 6, 7, 8, 0, 0, 0, 0, 0, 0, 0, 0x10]);
}

#[test]
fn rejects_unaligned_and_out_of_range_reads() {
    let f = Fixture::new(&mixed_entries(), 0xC00, 0);
    let storage = f.open();
    let mut buf = vec![0u8; 0x20];

    assert!(matches!(storage.read(8, &mut buf), Err(FsError::InvalidOffset)));
    assert!(matches!(storage.read(0, &mut buf[..7]), Err(FsError::InvalidSize)));
    assert!(matches!(storage.read(0xBF0, &mut buf), Err(FsError::OutOfRange)));
    storage.read(0xC00, &mut []).unwrap();
}

#[test]
fn unaligned_entry_offset_is_rejected() {
    let entries = [Entry::encrypted(0, 1), Entry::encrypted(0x18, 2)];
    let f = Fixture::new(&entries, 0x100, 0);
    let storage = f.open();

    let mut buf = vec![0u8; 0x10];
    assert!(matches!(
        storage.read(0, &mut buf),
        Err(FsError::InvalidAesCtrCounterExtendedEntryOffset)
    ));
}

#[test]
fn writes_are_unsupported() {
    let f = Fixture::new(&mixed_entries(), 0xC00, 0);
    assert!(matches!(
        f.open().write(0, &[0u8; 16]),
        Err(FsError::Unsupported(_))
    ));
}

// -------------------- Table --------------------

#[test]
fn bad_table_signature_fails_to_open() {
    let f = Fixture::new(&mixed_entries(), 0xC00, 0);
    f.table.write(0, b"XKTR").unwrap();
    assert!(matches!(
        AesCtrCounterExtendedStorage::from_table_storage(KEY, SECURE_VALUE, f.data.clone(), f.table.clone()),
        Err(FsError::InvalidBucketTreeSignature)
    ));
}

#[test]
fn empty_table_is_rejected() {
    let table = SubStorage::new(Arc::new(MemoryStorage::new(16)), 0, 16);
    assert!(matches!(
        AesCtrCounterExtendedStorage::write_table(table, &[], 0x100),
        Err(FsError::InvalidArgument)
    ));
}

#[test]
fn many_extents_span_several_entry_sets() {
    // 16 KiB nodes hold 1023 entries per set, so 2500 entries need three sets.
    let entries: Vec<Entry> = (0..2500)
        .map(|i| {
            if i % 5 == 0 {
                Entry::plain(i * 0x20)
            } else {
                Entry::encrypted(i * 0x20, i as i32)
            }
        })
        .collect();
    let f = Fixture::new(&entries, 2500 * 0x20, 0);
    let storage = f.open();
    assert_eq!(storage.table().entry_count(), 2500);

    let mut buf = vec![0u8; 2500 * 0x20];
    storage.read(0, &mut buf).unwrap();
    assert_eq!(buf, f.plain);
}

// -------------------- Range operations --------------------

#[test]
fn query_range_reports_key_type() {
    let f = Fixture::new(&mixed_entries(), 0xC00, 0);

    let info = f.open().operate_range(OperationId::QueryRange, 0, 0x400).unwrap();
    assert_eq!(info.aes_ctr_key_type, aes_ctr_key_type::INTERNAL_KEY_FOR_SOFTWARE_AES);

    let slotted = f.open_with(0, Box::new(ExternalDecryptor::new(external_aes, 3)));
    let info = slotted.operate_range(OperationId::QueryRange, 0, 0x400).unwrap();
    assert_eq!(info.aes_ctr_key_type, aes_ctr_key_type::INTERNAL_KEY_FOR_HARDWARE_AES);

    let external = f.open_with(0, Box::new(ExternalDecryptor::new(external_aes, -1)));
    let info = external.operate_range(OperationId::QueryRange, 0, 0x400).unwrap();
    assert_eq!(info.aes_ctr_key_type, aes_ctr_key_type::EXTERNAL_KEY_FOR_HARDWARE_AES);

    let empty = external.operate_range(OperationId::QueryRange, 0, 0).unwrap();
    assert_eq!(empty.aes_ctr_key_type, 0);
}

#[test]
fn invalidate_reloads_the_table() {
    let f = Fixture::new(&mixed_entries(), 0xC00, 0);
    let storage = f.open();
    storage.operate_range(OperationId::Invalidate, 0, 0xC00).unwrap();

    let mut buf = vec![0u8; 0xC00];
    storage.read(0, &mut buf).unwrap();
    assert_eq!(buf, f.plain);

    assert!(matches!(
        storage.operate_range(OperationId::Invalidate, 8, 0x10),
        Err(FsError::InvalidOffset)
    ));
    assert!(matches!(
        storage.operate_range(OperationId::FillZero, 0, 0x10),
        Err(FsError::Unsupported(_))
    ));
}
