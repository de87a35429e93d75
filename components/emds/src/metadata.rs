//! On-flash format: snapshot metadata records and entry headers.
//!
//! All fields are little-endian. A metadata record occupies one
//! [`METADATA_SIZE`] slot counted backwards from the end of a partition:
//!
//! | bytes   | content                                   |
//! |---------|-------------------------------------------|
//! |  0 - 3  | marker, `b"EMDS"`                         |
//! |  4 - 7  | data instance offset                      |
//! |  8 - 11 | data instance length                      |
//! | 12 - 15 | fresh counter                             |
//! | 16 - 19 | CRC32K over bytes 0 - 15                  |
//! | 20 - 23 | CRC32K over the data instance             |
//! | 24 - 31 | reserved, `0xff`                          |
//!
//! The data instance is a sequence of `{id: u16, length: u16}` headers each
//! followed by `length` bytes, padded with `0xff` to the write block size.

use crc::{Algorithm, Crc, Digest};

pub const MARKER: u32 = u32::from_le_bytes(*b"EMDS");

pub const METADATA_SIZE: usize = 32;

/// Length of the part covered by `metadata_crc`.
const HEADER_CRC_LEN: usize = 16;

/// Offset of `snapshot_crc` inside the record; everything before it can be
/// written ahead of the data on write-in-place memory.
pub const SNAPSHOT_CRC_OFFSET: usize = 20;
pub const SNAPSHOT_CRC_SIZE: usize = 4;

const RESERVED: u8 = 0xff;

/// Koopman CRC-32K, reflected, all-ones init and final xor.
const CRC_32_K: Algorithm<u32> = Algorithm {
    width: 32,
    poly: 0x741b_8cd7,
    init: 0xffff_ffff,
    refin: true,
    refout: true,
    xorout: 0xffff_ffff,
    check: 0x2d3d_d0ae,
    residue: 0x0843_323b,
};

pub static CRC32K: Crc<u32> = Crc::<u32>::new(&CRC_32_K);

pub type Crc32kDigest = Digest<'static, u32>;

pub fn crc32k(data: &[u8]) -> u32 {
    CRC32K.checksum(data)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SnapshotMetadata {
    pub marker: u32,
    pub data_instance_off: u32,
    pub data_instance_len: u32,
    pub fresh_cnt: u32,
    pub metadata_crc: u32,
    pub snapshot_crc: u32,
}

impl SnapshotMetadata {
    /// A sealed header for a snapshot that has not been written yet.
    pub fn new(data_instance_off: u32, data_instance_len: u32, fresh_cnt: u32) -> Self {
        let mut metadata = Self {
            marker: MARKER,
            data_instance_off,
            data_instance_len,
            fresh_cnt,
            metadata_crc: 0,
            snapshot_crc: 0,
        };
        metadata.metadata_crc = metadata.header_crc();
        metadata
    }

    pub fn header_crc(&self) -> u32 {
        crc32k(&self.to_bytes()[..HEADER_CRC_LEN])
    }

    /// Marker and header CRC both check out. The data is not looked at.
    pub fn is_valid(&self) -> bool {
        self.marker == MARKER && self.metadata_crc == self.header_crc()
    }

    /// End of the referenced data instance, `None` on overflow.
    pub fn data_end(&self) -> Option<u32> {
        self.data_instance_off.checked_add(self.data_instance_len)
    }

    pub fn to_bytes(&self) -> [u8; METADATA_SIZE] {
        let mut raw = [RESERVED; METADATA_SIZE];
        let fields = [
            self.marker,
            self.data_instance_off,
            self.data_instance_len,
            self.fresh_cnt,
            self.metadata_crc,
            self.snapshot_crc,
        ];
        for (chunk, field) in raw.chunks_exact_mut(4).zip(fields) {
            chunk.copy_from_slice(&field.to_le_bytes());
        }
        raw
    }

    pub fn from_bytes(raw: &[u8; METADATA_SIZE]) -> Self {
        let field = |idx: usize| {
            let mut word = [0u8; 4];
            word.copy_from_slice(&raw[idx * 4..idx * 4 + 4]);
            u32::from_le_bytes(word)
        };
        Self {
            marker: field(0),
            data_instance_off: field(1),
            data_instance_len: field(2),
            fresh_cnt: field(3),
            metadata_crc: field(4),
            snapshot_crc: field(5),
        }
    }
}

/// Id reserved for padding; never accepted for a registered entry.
pub const INVALID_ID: u16 = 0xffff;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryHeader {
    pub id: u16,
    pub length: u16,
}

impl EntryHeader {
    pub const SIZE: usize = 4;

    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut raw = [0u8; Self::SIZE];
        raw[..2].copy_from_slice(&self.id.to_le_bytes());
        raw[2..].copy_from_slice(&self.length.to_le_bytes());
        raw
    }

    pub fn from_bytes(raw: [u8; Self::SIZE]) -> Self {
        Self {
            id: u16::from_le_bytes([raw[0], raw[1]]),
            length: u16::from_le_bytes([raw[2], raw[3]]),
        }
    }

    pub fn is_padding(&self) -> bool {
        self.id == INVALID_ID
    }
}

pub const fn align_up(value: u32, align: u32) -> u32 {
    value.div_ceil(align) * align
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_spells_emds() {
        let raw = SnapshotMetadata::new(0, 16, 1).to_bytes();
        assert_eq!(&raw[..4], b"EMDS");
        assert_eq!(&raw[24..], &[0xff; 8]);
    }

    #[test]
    fn header_crc_ignores_snapshot_crc() {
        let mut metadata = SnapshotMetadata::new(64, 128, 7);
        assert!(metadata.is_valid());
        metadata.snapshot_crc = 0xdead_beef;
        assert!(metadata.is_valid());
        metadata.fresh_cnt += 1;
        assert!(!metadata.is_valid());
    }

    #[test]
    fn erased_slot_is_not_valid() {
        let metadata = SnapshotMetadata::from_bytes(&[0xff; METADATA_SIZE]);
        assert!(!metadata.is_valid());
        let metadata = SnapshotMetadata::from_bytes(&[0x00; METADATA_SIZE]);
        assert!(!metadata.is_valid());
    }

    #[test]
    fn crc32k_check_value() {
        assert_eq!(crc32k(b"123456789"), 0x2d3d_d0ae);
    }

    #[test]
    fn streamed_crc_matches_oneshot() {
        let data: [u8; 40] = core::array::from_fn(|i| i as u8 * 3);
        let mut digest = CRC32K.digest();
        for chunk in data.chunks(16) {
            digest.update(chunk);
        }
        assert_eq!(digest.finalize(), crc32k(&data));
    }

    #[test]
    fn padding_header_is_recognized() {
        let header = EntryHeader::from_bytes([0xff; 4]);
        assert!(header.is_padding());
        assert_eq!(header.length, 0xffff);
        let header = EntryHeader { id: 3, length: 5 };
        assert_eq!(EntryHeader::from_bytes(header.to_bytes()), header);
    }

    #[test]
    fn align_up_rounds_to_multiple() {
        assert_eq!(align_up(0, 4), 0);
        assert_eq!(align_up(1, 4), 4);
        assert_eq!(align_up(16, 16), 16);
        assert_eq!(align_up(17, 16), 32);
    }
}
