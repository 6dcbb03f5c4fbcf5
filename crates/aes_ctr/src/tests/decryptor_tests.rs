use std::sync::atomic::{AtomicUsize, Ordering};

use crypto::{aes128_ctr_apply, Aes128Key, AesIv};

use super::helpers::*;
use crate::*;

static CALLS: AtomicUsize = AtomicUsize::new(0);

fn counting_aes(dst: &mut [u8], key_index: i32, key: &Aes128Key, iv: &AesIv, src: &[u8]) {
    CALLS.fetch_add(1, Ordering::SeqCst);
    assert!(dst.len() <= 64);
    external_aes(dst, key_index, key, iv, src);
}

#[test]
fn external_chunks_match_software() {
    let iv = make_iv(SECURE_VALUE, 2, 0x40);
    let plain = pattern(200, 9);

    let mut expected = plain.clone();
    SoftwareDecryptor.decrypt(&mut expected, &KEY, &iv);

    let mut chunked = plain;
    let before = CALLS.load(Ordering::SeqCst);
    ExternalDecryptor::with_chunk_size(counting_aes, 0, 64).decrypt(&mut chunked, &KEY, &iv);
    assert_eq!(chunked, expected);
    assert_eq!(CALLS.load(Ordering::SeqCst) - before, 4);
}

#[test]
fn decryption_is_its_own_inverse() {
    let iv = [0u8; 16];
    let plain = pattern(48, 1);
    let mut buf = plain.clone();
    aes128_ctr_apply(&KEY, &iv, &mut buf);
    SoftwareDecryptor.decrypt(&mut buf, &KEY, &iv);
    assert_eq!(buf, plain);
}

#[test]
fn negative_key_index_means_external_key() {
    assert!(ExternalDecryptor::new(external_aes, -1).has_external_decryption_key());
    assert!(!ExternalDecryptor::new(external_aes, 0).has_external_decryption_key());
    assert!(!SoftwareDecryptor.has_external_decryption_key());
}

#[test]
fn key_type_follows_where_the_key_lives() {
    use storage::aes_ctr_key_type;

    assert_eq!(SoftwareDecryptor.key_type(), aes_ctr_key_type::INTERNAL_KEY_FOR_SOFTWARE_AES);
    assert_eq!(
        ExternalDecryptor::new(external_aes, 0).key_type(),
        aes_ctr_key_type::INTERNAL_KEY_FOR_HARDWARE_AES
    );
    assert_eq!(
        ExternalDecryptor::new(external_aes, -1).key_type(),
        aes_ctr_key_type::EXTERNAL_KEY_FOR_HARDWARE_AES
    );
}

#[test]
#[should_panic(expected = "chunk size must be a non-zero multiple of the AES block size")]
fn odd_chunk_size_panics() {
    let _ = ExternalDecryptor::with_chunk_size(external_aes, 0, 24);
}

#[test]
fn entry_encoding_keeps_flags_and_generation() {
    use bucket_tree::BucketTreeEntry;

    let entry = AesCtrCounterExtendedEntry::encrypted(0x4000, -2);
    let mut buf = [0xFFu8; 16];
    entry.encode(&mut buf);
    assert_eq!(buf[8..12], [0, 0, 0, 0]);
    assert_eq!(AesCtrCounterExtendedEntry::decode(&buf), entry);

    buf[8] = 1;
    assert_eq!(AesCtrCounterExtendedEntry::decode(&buf).encryption, Encryption::NotEncrypted);
    buf[8] = 7;
    assert!(AesCtrCounterExtendedEntry::decode(&buf).is_encrypted());
}
