//! # AES-CTR counter-extended storage
//!
//! Decrypts a storage whose extents were encrypted under one AES-128 key but
//! with different counter generations. A bucket tree table maps every
//! extent's start offset to its generation (or marks it plain):
//!
//! ```text
//! table:  [0x0000 gen 1][0x4000 plain][0x8000 gen 3]     end 0xC000
//! data:   |---- gen 1 ----|--- plain ---|---- gen 3 ----|
//! ```
//!
//! The counter for the 16-byte block at offset `o` is
//! `secure_value ‖ generation ‖ (counter_offset + o) / 16`, all big-endian.
//! Decryption goes through a [`Decryptor`]: [`SoftwareDecryptor`] uses the
//! in-process AES implementation, [`ExternalDecryptor`] hands the work to a
//! caller-supplied function.

mod counter_extended;
mod decryptor;
mod entry;

pub use counter_extended::{make_iv, AesCtrCounterExtendedStorage, BLOCK_SIZE, NODE_SIZE};
pub use decryptor::{DecryptFunction, Decryptor, ExternalDecryptor, SoftwareDecryptor, DEFAULT_EXTERNAL_CHUNK_SIZE};
pub use entry::{AesCtrCounterExtendedEntry, Encryption};

#[cfg(test)]
mod tests;
