//! # Crypto
//!
//! The small set of primitives the storage stack needs, wrapped so callers
//! never touch the RustCrypto traits directly:
//!
//! - SHA-256 for block hashes ([`sha256`], [`Sha256Generator`]).
//! - HMAC-SHA-256 for deriving per-level salts ([`hmac_sha256`]).
//! - AES-128-CTR with a big-endian 128-bit counter ([`aes128_ctr_apply`]).

use aes::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

pub const SHA256_HASH_SIZE: usize = 32;
pub const AES_BLOCK_SIZE: usize = 16;
pub const AES128_KEY_SIZE: usize = 16;

pub type Sha256Hash = [u8; SHA256_HASH_SIZE];
pub type Aes128Key = [u8; AES128_KEY_SIZE];
pub type AesIv = [u8; AES_BLOCK_SIZE];

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;

/// One-shot SHA-256.
#[must_use]
pub fn sha256(data: &[u8]) -> Sha256Hash {
    Sha256::digest(data).into()
}

/// Incremental SHA-256.
#[derive(Clone, Default)]
pub struct Sha256Generator {
    inner: Sha256,
}

impl Sha256Generator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    #[must_use]
    pub fn finalize(self) -> Sha256Hash {
        self.inner.finalize().into()
    }
}

/// HMAC-SHA-256 of `data` under `key`.
#[must_use]
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Sha256Hash {
    // HMAC accepts keys of any length.
    let mut mac = match Hmac::<Sha256>::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!("hmac accepts keys of any length"),
    };
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// XORs `buf` with the AES-128-CTR keystream for `key` starting at counter `iv`.
///
/// Encryption and decryption are the same operation. `buf` need not be a
/// multiple of the block size.
pub fn aes128_ctr_apply(key: &Aes128Key, iv: &AesIv, buf: &mut [u8]) {
    let mut cipher = Aes128Ctr::new(key.into(), iv.into());
    cipher.apply_keystream(buf);
}

/// Advances a big-endian 128-bit counter by `blocks`, wrapping on overflow.
pub fn add_counter(iv: &mut AesIv, blocks: u64) {
    let value = u128::from_be_bytes(*iv).wrapping_add(u128::from(blocks));
    *iv = value.to_be_bytes();
}
