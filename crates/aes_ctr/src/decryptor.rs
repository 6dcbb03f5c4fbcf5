use buffers::AlignedBuffer;
use crypto::{add_counter, aes128_ctr_apply, Aes128Key, AesIv, AES_BLOCK_SIZE};
use storage::aes_ctr_key_type;

/// Decrypts AES-128-CTR data in place.
pub trait Decryptor: Send + Sync {
    /// Decrypts `buf` with `key`, the counter starting at `iv`.
    fn decrypt(&self, buf: &mut [u8], key: &Aes128Key, iv: &AesIv);

    /// True if the key is held outside this process (a hardware key slot).
    fn has_external_decryption_key(&self) -> bool;

    /// The `aes_ctr_key_type` flag reported for data this decryptor handles.
    fn key_type(&self) -> i32 {
        if self.has_external_decryption_key() {
            aes_ctr_key_type::EXTERNAL_KEY_FOR_HARDWARE_AES
        } else {
            aes_ctr_key_type::INTERNAL_KEY_FOR_HARDWARE_AES
        }
    }
}

/// Decrypts with the in-process AES implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SoftwareDecryptor;

impl Decryptor for SoftwareDecryptor {
    fn decrypt(&self, buf: &mut [u8], key: &Aes128Key, iv: &AesIv) {
        aes128_ctr_apply(key, iv, buf);
    }

    fn has_external_decryption_key(&self) -> bool {
        false
    }

    fn key_type(&self) -> i32 {
        aes_ctr_key_type::INTERNAL_KEY_FOR_SOFTWARE_AES
    }
}

/// An out-of-process AES-CTR routine: decrypts `src` into `dst` (same
/// length) using the key in slot `key_index`, or `key` when the index is
/// negative.
pub type DecryptFunction = fn(dst: &mut [u8], key_index: i32, key: &Aes128Key, iv: &AesIv, src: &[u8]);

/// Largest span handed to a [`DecryptFunction`] at once.
pub const DEFAULT_EXTERNAL_CHUNK_SIZE: usize = 128 * 1024;

/// Routes decryption through a [`DecryptFunction`], bouncing the data
/// through a bounded scratch buffer and advancing the counter between
/// chunks.
#[derive(Debug, Clone, Copy)]
pub struct ExternalDecryptor {
    function: DecryptFunction,
    key_index: i32,
    chunk_size: usize,
}

impl ExternalDecryptor {
    pub fn new(function: DecryptFunction, key_index: i32) -> Self {
        Self::with_chunk_size(function, key_index, DEFAULT_EXTERNAL_CHUNK_SIZE)
    }

    /// # Panics
    ///
    /// Panics if `chunk_size` is zero or not a multiple of the AES block size.
    pub fn with_chunk_size(function: DecryptFunction, key_index: i32, chunk_size: usize) -> Self {
        assert!(
            chunk_size > 0 && chunk_size % AES_BLOCK_SIZE == 0,
            "chunk size must be a non-zero multiple of the AES block size"
        );
        Self {
            function,
            key_index,
            chunk_size,
        }
    }

    #[must_use]
    pub fn key_index(&self) -> i32 {
        self.key_index
    }
}

impl Decryptor for ExternalDecryptor {
    fn decrypt(&self, buf: &mut [u8], key: &Aes128Key, iv: &AesIv) {
        let mut ctr = *iv;
        let mut scratch = AlignedBuffer::<AES_BLOCK_SIZE>::zeroed(self.chunk_size.min(buf.len()));

        let mut done = 0;
        while done < buf.len() {
            let size = scratch.len().min(buf.len() - done);
            let chunk = &mut buf[done..done + size];
            (self.function)(&mut scratch[..size], self.key_index, key, &ctr, chunk);
            chunk.copy_from_slice(&scratch[..size]);

            done += size;
            if done < buf.len() {
                add_counter(&mut ctr, (size / AES_BLOCK_SIZE) as u64);
            }
        }
    }

    fn has_external_decryption_key(&self) -> bool {
        self.key_index < 0
    }
}
