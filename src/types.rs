//! Fixed-width on-disk field types.
//!
//! # Field widths (frozen)
//!
//! ```text
//! Field                 Size  Encoding
//! NeedleId                 8  BE u64
//! Cookie                   4  BE u32
//! Size                     4  BE u32
//! Offset (padded)          4  BE u32 = actual_offset / 8
//! Needle header           16  Cookie | NeedleId | Size
//! Needle checksum          4  BE u32 (CRC32 of Data)
//! Append timestamp         8  BE u64 nanoseconds (v3 only)
//! Record alignment         8  every record zero-padded to 8 bytes
//! Index entry             16  NeedleId | Offset | Size
//! ```
//!
//! All multi-byte integers on disk are big-endian.  The padded offset
//! divides the actual byte position by the 8-byte alignment so that a
//! 32-bit field addresses 32 GiB of volume; `Offset(0)` is the "absent"
//! sentinel (the superblock occupies the first padded block, so no needle
//! can ever live there).

use byteorder::{BigEndian, ByteOrder};
use std::fmt;

pub const NEEDLE_ID_SIZE: usize = 8;
pub const COOKIE_SIZE: usize = 4;
pub const SIZE_SIZE: usize = 4;
pub const OFFSET_SIZE: usize = 4;
/// Needle header: Cookie | NeedleId | Size.
pub const NEEDLE_ENTRY_SIZE: usize = COOKIE_SIZE + NEEDLE_ID_SIZE + SIZE_SIZE;
pub const NEEDLE_CHECKSUM_SIZE: usize = 4;
pub const TIMESTAMP_SIZE: usize = 8;
pub const NEEDLE_PADDING_SIZE: usize = 8;
/// Index entry: NeedleId | Offset | Size.
pub const INDEX_ENTRY_SIZE: usize = NEEDLE_ID_SIZE + OFFSET_SIZE + SIZE_SIZE;

/// All-ones `Size`: the index entry records a deletion.
pub const TOMBSTONE_FILE_SIZE: u32 = u32::MAX;

pub type VolumeId = u32;
pub type NeedleId = u64;
pub type Cookie = u32;

pub fn put_needle_id(buf: &mut [u8], id: NeedleId) {
    BigEndian::write_u64(&mut buf[..NEEDLE_ID_SIZE], id);
}

pub fn get_needle_id(buf: &[u8]) -> NeedleId {
    BigEndian::read_u64(&buf[..NEEDLE_ID_SIZE])
}

pub fn put_cookie(buf: &mut [u8], cookie: Cookie) {
    BigEndian::write_u32(&mut buf[..COOKIE_SIZE], cookie);
}

pub fn get_cookie(buf: &[u8]) -> Cookie {
    BigEndian::read_u32(&buf[..COOKIE_SIZE])
}

/// Fresh anti-enumeration cookie for a new write.
pub fn random_cookie() -> Cookie {
    rand::random::<u32>()
}

// ── Padded offset ────────────────────────────────────────────────────────────

/// On-disk byte position stored as `actual / NEEDLE_PADDING_SIZE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Offset(u32);

impl Offset {
    pub const ZERO: Offset = Offset(0);

    /// Convert an actual byte offset.  The offset must be 8-byte aligned —
    /// every record is padded, so an unaligned value is a logic error.
    pub fn from_actual(actual: u64) -> Offset {
        debug_assert_eq!(
            actual % NEEDLE_PADDING_SIZE as u64,
            0,
            "offset {actual} not aligned to {NEEDLE_PADDING_SIZE}"
        );
        Offset((actual / NEEDLE_PADDING_SIZE as u64) as u32)
    }

    #[inline]
    pub fn to_actual(self) -> u64 {
        self.0 as u64 * NEEDLE_PADDING_SIZE as u64
    }

    /// `Offset(0)` doubles as the "absent" sentinel.
    #[inline]
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn padded(self) -> u32 {
        self.0
    }

    pub fn from_padded(padded: u32) -> Offset {
        Offset(padded)
    }

    pub fn write_to(self, buf: &mut [u8]) {
        BigEndian::write_u32(&mut buf[..OFFSET_SIZE], self.0);
    }

    pub fn read_from(buf: &[u8]) -> Offset {
        Offset(BigEndian::read_u32(&buf[..OFFSET_SIZE]))
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_actual())
    }
}

// ── FileId ───────────────────────────────────────────────────────────────────

/// Client-visible object handle: volume, key, and the cookie bound at write
/// time.  Rendered as `vid,keycookie` with the key+cookie bytes hex-encoded
/// and leading zero bytes trimmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileId {
    pub volume_id: VolumeId,
    pub key: NeedleId,
    pub cookie: Cookie,
}

impl FileId {
    pub fn new(volume_id: VolumeId, key: NeedleId, cookie: Cookie) -> FileId {
        FileId { volume_id, key, cookie }
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut bytes = [0u8; NEEDLE_ID_SIZE + COOKIE_SIZE];
        put_needle_id(&mut bytes[..NEEDLE_ID_SIZE], self.key);
        put_cookie(&mut bytes[NEEDLE_ID_SIZE..], self.cookie);
        // Trim leading zero bytes of the key so small ids stay short.
        let start = bytes
            .iter()
            .position(|&b| b != 0)
            .unwrap_or(bytes.len() - 1);
        write!(f, "{},", self.volume_id)?;
        for b in &bytes[start..] {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_round_trip() {
        let off = Offset::from_actual(4096);
        assert_eq!(off.padded(), 512);
        assert_eq!(off.to_actual(), 4096);
        assert!(!off.is_zero());
        assert!(Offset::ZERO.is_zero());
    }

    #[test]
    fn offset_wire_form_is_big_endian() {
        let mut buf = [0u8; OFFSET_SIZE];
        Offset::from_actual(8).write_to(&mut buf);
        assert_eq!(buf, [0, 0, 0, 1]);
        assert_eq!(Offset::read_from(&buf).to_actual(), 8);
    }

    #[test]
    fn file_id_trims_leading_zeros() {
        let fid = FileId::new(3, 0x01, 0xdead_beef);
        assert_eq!(fid.to_string(), "3,01deadbeef");
    }
}
