use bucket_tree::BucketTreeEntry;
use byteorder::{ByteOrder, LittleEndian};

/// Whether an extent's bytes are stored encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encryption {
    Encrypted,
    NotEncrypted,
}

impl Encryption {
    fn from_raw(raw: u8) -> Self {
        // Only an explicit "not encrypted" marker skips decryption.
        if raw == 1 {
            Self::NotEncrypted
        } else {
            Self::Encrypted
        }
    }

    fn to_raw(self) -> u8 {
        match self {
            Self::Encrypted => 0,
            Self::NotEncrypted => 1,
        }
    }
}

/// One extent of a counter-extended table.
///
/// ```text
/// 0x00  offset      i64   start of the extent
/// 0x08  encryption  u8    0 encrypted, 1 plain
/// 0x09  reserved    [u8; 3]
/// 0x0C  generation  i32   upper half of the IV
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AesCtrCounterExtendedEntry {
    pub offset: i64,
    pub encryption: Encryption,
    pub generation: i32,
}

impl AesCtrCounterExtendedEntry {
    #[must_use]
    pub fn encrypted(offset: i64, generation: i32) -> Self {
        Self {
            offset,
            encryption: Encryption::Encrypted,
            generation,
        }
    }

    #[must_use]
    pub fn plain(offset: i64) -> Self {
        Self {
            offset,
            encryption: Encryption::NotEncrypted,
            generation: 0,
        }
    }

    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.encryption == Encryption::Encrypted
    }
}

impl BucketTreeEntry for AesCtrCounterExtendedEntry {
    const SIZE: usize = 16;

    fn virtual_offset(&self) -> i64 {
        self.offset
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            offset: LittleEndian::read_i64(&buf[0..8]),
            encryption: Encryption::from_raw(buf[8]),
            generation: LittleEndian::read_i32(&buf[12..16]),
        }
    }

    fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_i64(&mut buf[0..8], self.offset);
        buf[8] = self.encryption.to_raw();
        buf[9..12].fill(0);
        LittleEndian::write_i32(&mut buf[12..16], self.generation);
    }
}
