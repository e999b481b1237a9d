//! On-disk binary layouts: file headers and fixed-size record headers.
//!
//! Every field is serialized explicitly in little-endian order rather than
//! transmuting structs, so the layout is stable across platforms and
//! compiler versions.

use crate::crc32::Crc32;
use crate::error::StoreError;

pub const MAGIC_NUMBER: u64 = 0x5345_514c_4f47_3031; // "SEQLOG01" in ASCII bytes, read as one LE u64
pub const FORMAT_1: u32 = 1;
pub const BANNER_LEN: usize = 128;

pub const BANNER_DAT: &[u8] = b"This is a seqlog database data file. Do not edit it.\n";
pub const BANNER_IDX: &[u8] = b"This is a seqlog database index file. Do not edit it.\n";

fn banner_bytes(text: &[u8]) -> [u8; BANNER_LEN] {
    let mut banner = [0u8; BANNER_LEN];
    let n = text.len().min(BANNER_LEN);
    banner[..n].copy_from_slice(&text[..n]);
    banner
}

/// Data-file header: magic, format version, a cosmetic banner, and the
/// opaque application milestone.
#[derive(Debug, Clone, Copy)]
pub struct DatHeader {
    pub format: u32,
    pub milestone: u64,
}

impl DatHeader {
    pub const SIZE: usize = 8 + 4 + 4 + BANNER_LEN + 8;

    #[must_use]
    pub fn new() -> Self {
        Self { format: FORMAT_1, milestone: 0 }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.extend_from_slice(&MAGIC_NUMBER.to_le_bytes());
        buf.extend_from_slice(&self.format.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes()); // padding, reserved
        buf.extend_from_slice(&banner_bytes(BANNER_DAT));
        buf.extend_from_slice(&self.milestone.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, StoreError> {
        if buf.len() < Self::SIZE {
            return Err(StoreError::BadDataFormat);
        }
        let magic = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let format = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        // bytes 12..16 reserved, bytes 16..16+BANNER_LEN are the banner (ignored)
        let milestone_off = 16 + BANNER_LEN;
        let milestone = u64::from_le_bytes(buf[milestone_off..milestone_off + 8].try_into().unwrap());

        if magic != MAGIC_NUMBER || format != FORMAT_1 {
            return Err(StoreError::BadDataFormat);
        }

        Ok(Self { format, milestone })
    }
}

impl Default for DatHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// Index-file header: magic and format version only.
#[derive(Debug, Clone, Copy)]
pub struct IdxHeader {
    pub format: u32,
}

impl IdxHeader {
    pub const SIZE: usize = 8 + 4 + 4 + BANNER_LEN;

    #[must_use]
    pub fn new() -> Self {
        Self { format: FORMAT_1 }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.extend_from_slice(&MAGIC_NUMBER.to_le_bytes());
        buf.extend_from_slice(&self.format.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&banner_bytes(BANNER_IDX));
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, StoreError> {
        if buf.len() < Self::SIZE {
            return Err(StoreError::BadIndexFormat);
        }
        let magic = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let format = u32::from_le_bytes(buf[8..12].try_into().unwrap());

        if magic != MAGIC_NUMBER || format != FORMAT_1 {
            return Err(StoreError::BadIndexFormat);
        }

        Ok(Self { format })
    }
}

impl Default for IdxHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed-size header preceding a record's metadata and data payload in the
/// data file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DatRecordHeader {
    pub seqnum: u64,
    pub timestamp: u64,
    pub metadata_len: u32,
    pub data_len: u32,
    pub checksum: u32,
}

impl DatRecordHeader {
    pub const SIZE: usize = 8 + 8 + 4 + 4 + 4;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(&self.seqnum.to_le_bytes());
        buf[8..16].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[16..20].copy_from_slice(&self.metadata_len.to_le_bytes());
        buf[20..24].copy_from_slice(&self.data_len.to_le_bytes());
        buf[24..28].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            seqnum: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            timestamp: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            metadata_len: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
            data_len: u32::from_le_bytes(buf[20..24].try_into().unwrap()),
            checksum: u32::from_le_bytes(buf[24..28].try_into().unwrap()),
        })
    }

    /// Whether this header is the all-zero "empty slot" encoding.
    #[must_use]
    pub fn is_empty_slot(&self) -> bool {
        self.seqnum == 0
    }
}

/// Computes the checksum covering the header fields (excluding the
/// checksum field itself) followed by metadata then data.
pub fn compute_checksum(seqnum: u64, timestamp: u64, metadata_len: u32, data_len: u32, metadata: &[u8], data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(&seqnum.to_le_bytes());
    hasher.update(&timestamp.to_le_bytes());
    hasher.update(&metadata_len.to_le_bytes());
    hasher.update(&data_len.to_le_bytes());
    hasher.update(metadata);
    hasher.update(data);
    hasher.finalize()
}

/// Fixed-size index-file record: seqnum, timestamp, and the absolute byte
/// offset of the corresponding data record's header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdxRecord {
    pub seqnum: u64,
    pub timestamp: u64,
    pub pos: u64,
}

impl IdxRecord {
    pub const SIZE: usize = 8 + 8 + 8;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(&self.seqnum.to_le_bytes());
        buf[8..16].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[16..24].copy_from_slice(&self.pos.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            seqnum: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            timestamp: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            pos: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
        })
    }

    #[must_use]
    pub fn is_empty_slot(&self) -> bool {
        self.seqnum == 0
    }
}

/// Byte offset of the index record for `seqnum`, given the seqnum of the
/// first live record.
#[must_use]
pub fn idx_pos(first_seqnum: u64, seqnum: u64) -> u64 {
    IdxHeader::SIZE as u64 + (seqnum - first_seqnum) * IdxRecord::SIZE as u64
}
