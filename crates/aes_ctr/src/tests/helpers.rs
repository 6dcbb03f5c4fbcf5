use std::sync::Arc;

use crypto::{aes128_ctr_apply, Aes128Key};
use storage::{MemoryStorage, Storage, SubStorage};

use crate::*;

pub const KEY: Aes128Key = [0x42; 16];
pub const SECURE_VALUE: u32 = 0x1234_5678;

pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(13).wrapping_add(seed)).collect()
}

/// Encrypts `plain` extent by extent the way the storage expects it.
pub fn encrypt(plain: &[u8], entries: &[AesCtrCounterExtendedEntry], counter_offset: i64) -> Vec<u8> {
    let mut out = plain.to_vec();
    for (i, e) in entries.iter().enumerate() {
        let stop = entries.get(i + 1).map_or(plain.len() as i64, |n| n.offset);
        if e.is_encrypted() {
            let iv = make_iv(SECURE_VALUE, e.generation as u32, counter_offset + e.offset);
            aes128_ctr_apply(&KEY, &iv, &mut out[e.offset as usize..stop as usize]);
        }
    }
    out
}

pub struct Fixture {
    pub plain: Vec<u8>,
    pub data: Arc<MemoryStorage>,
    pub table: SubStorage,
}

impl Fixture {
    /// Plaintext of `size` bytes, encrypted per `entries` with `counter_offset`.
    pub fn new(entries: &[AesCtrCounterExtendedEntry], size: usize, counter_offset: i64) -> Self {
        let plain = pattern(size, 3);
        let data = Arc::new(MemoryStorage::from_vec(encrypt(&plain, entries, counter_offset)));

        let table_size = AesCtrCounterExtendedStorage::query_table_size(entries.len() as i32);
        let table = SubStorage::new(Arc::new(MemoryStorage::new(table_size as usize)), 0, table_size);
        AesCtrCounterExtendedStorage::write_table(table.clone(), entries, size as i64).unwrap();

        Self { plain, data, table }
    }

    pub fn open(&self) -> AesCtrCounterExtendedStorage {
        AesCtrCounterExtendedStorage::from_table_storage(
            KEY,
            SECURE_VALUE,
            self.data.clone() as Arc<dyn Storage>,
            self.table.clone(),
        )
        .unwrap()
    }

    pub fn open_with(&self, counter_offset: i64, decryptor: Box<dyn Decryptor>) -> AesCtrCounterExtendedStorage {
        AesCtrCounterExtendedStorage::with_table_storage(
            KEY,
            SECURE_VALUE,
            counter_offset,
            self.data.clone(),
            self.table.clone(),
            decryptor,
        )
        .unwrap()
    }
}

/// A stand-in for an out-of-process AES engine: software AES under the
/// supplied key.
pub fn external_aes(dst: &mut [u8], _key_index: i32, key: &Aes128Key, iv: &crypto::AesIv, src: &[u8]) {
    dst.copy_from_slice(src);
    aes128_ctr_apply(key, iv, dst);
}
