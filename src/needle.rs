//! Needle record codec — one stored object on disk.
//!
//! # On-disk layout (after the superblock, all integers big-endian)
//!
//! ```text
//! Header (16 B):   Cookie(4) | NeedleId(8) | Size(4)
//! Body (iff DataSize > 0; v1: iff Size > 0):
//!   v1:            Data[Size]
//!   v2/v3:         DataSize(4) | Data | Flags(1)
//!                  | NameSize(1) | Name          iff FLAG_HAS_NAME
//!                  | MimeSize(1) | Mime          iff FLAG_HAS_MIME
//!                  | LastModified(5)             iff FLAG_HAS_LAST_MODIFIED
//!                  | Ttl(2)                      iff FLAG_HAS_TTL
//!                  | PairsSize(2) | Pairs        iff FLAG_HAS_PAIRS
//! Trailer:         Checksum(4, CRC32 of Data)
//!                  | AppendAtNs(8)               v3 only
//!                  | zero padding to the next 8-byte boundary
//! ```
//!
//! `Size` is the byte length of the body.  For v2/v3 it is computed from
//! the attributes present; `Size == 0` (no body) encodes a deletion marker
//! appended by the delete path so that deletes travel through the follower
//! byte stream like any other record.
//!
//! # Append rollback
//! [`Needle::append`] remembers the file end before writing and truncates
//! back to it if the write fails.  This is the only crash-consistency
//! mechanism for partial writes; a record whose bytes never made it into
//! the index is simply ignored on load.

use byteorder::{BigEndian, ByteOrder};
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;

use crate::error::{Error, Result};
use crate::superblock::Version;
use crate::ttl::Ttl;
use crate::types::{
    get_cookie, get_needle_id, put_cookie, put_needle_id, Cookie, NeedleId, COOKIE_SIZE,
    NEEDLE_CHECKSUM_SIZE, NEEDLE_ENTRY_SIZE, NEEDLE_ID_SIZE, NEEDLE_PADDING_SIZE, TIMESTAMP_SIZE,
};

// ── Flags ────────────────────────────────────────────────────────────────────

pub const FLAG_GZIP: u8 = 0x01;
pub const FLAG_HAS_NAME: u8 = 0x02;
pub const FLAG_HAS_MIME: u8 = 0x04;
pub const FLAG_HAS_LAST_MODIFIED: u8 = 0x08;
pub const FLAG_HAS_TTL: u8 = 0x10;
pub const FLAG_HAS_PAIRS: u8 = 0x20;
pub const FLAG_IS_CHUNK_MANIFEST: u8 = 0x80;

pub const LAST_MODIFIED_BYTES_LENGTH: usize = 5;
pub const TTL_BYTES_LENGTH: usize = 2;

/// Name and mime lengths are stored in one byte each.
const MAX_NAME_OR_MIME: usize = u8::MAX as usize;

// ── Size math ────────────────────────────────────────────────────────────────

/// Zero padding after the trailer, in `[1, 8]`.
pub fn padding_length(needle_size: u32, version: Version) -> u32 {
    let fixed = NEEDLE_ENTRY_SIZE as u32
        + needle_size
        + NEEDLE_CHECKSUM_SIZE as u32
        + if version.has_timestamp() { TIMESTAMP_SIZE as u32 } else { 0 };
    NEEDLE_PADDING_SIZE as u32 - (fixed % NEEDLE_PADDING_SIZE as u32)
}

/// Bytes following the 16-byte header: body, trailer, and padding.
pub fn body_length(needle_size: u32, version: Version) -> u64 {
    needle_size as u64
        + NEEDLE_CHECKSUM_SIZE as u64
        + if version.has_timestamp() { TIMESTAMP_SIZE as u64 } else { 0 }
        + padding_length(needle_size, version) as u64
}

/// Full on-disk footprint of a record with body size `needle_size`.
pub fn actual_size(needle_size: u32, version: Version) -> u64 {
    NEEDLE_ENTRY_SIZE as u64 + body_length(needle_size, version)
}

// ── Needle ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Needle {
    pub cookie: Cookie,
    pub id: NeedleId,
    /// Body size field as stored in the header (not the data length).
    pub size: u32,

    pub data: Vec<u8>,
    pub flags: u8,
    pub name: Vec<u8>,
    pub mime: Vec<u8>,
    pub pairs: Vec<u8>,
    /// Unix seconds, stored in 5 bytes.
    pub last_modified: u64,
    pub ttl: Ttl,

    pub checksum: u32,
    /// v3 only: append wall-clock in nanoseconds, the follow checkpoint.
    pub append_at_ns: u64,
}

impl Needle {
    pub fn new(id: NeedleId, cookie: Cookie, data: Vec<u8>) -> Needle {
        Needle {
            id,
            cookie,
            data,
            ..Needle::empty(id, cookie)
        }
    }

    /// A bodiless record — the deletion marker shape.
    pub fn empty(id: NeedleId, cookie: Cookie) -> Needle {
        Needle {
            cookie,
            id,
            size: 0,
            data: Vec::new(),
            flags: 0,
            name: Vec::new(),
            mime: Vec::new(),
            pairs: Vec::new(),
            last_modified: 0,
            ttl: Ttl::NONE,
            checksum: 0,
            append_at_ns: 0,
        }
    }

    // Flag accessors.

    pub fn is_gzipped(&self) -> bool {
        self.flags & FLAG_GZIP != 0
    }
    pub fn has_name(&self) -> bool {
        self.flags & FLAG_HAS_NAME != 0
    }
    pub fn has_mime(&self) -> bool {
        self.flags & FLAG_HAS_MIME != 0
    }
    pub fn has_last_modified(&self) -> bool {
        self.flags & FLAG_HAS_LAST_MODIFIED != 0
    }
    pub fn has_ttl(&self) -> bool {
        self.flags & FLAG_HAS_TTL != 0
    }
    pub fn has_pairs(&self) -> bool {
        self.flags & FLAG_HAS_PAIRS != 0
    }
    pub fn is_chunk_manifest(&self) -> bool {
        self.flags & FLAG_IS_CHUNK_MANIFEST != 0
    }

    pub fn set_gzipped(&mut self) {
        self.flags |= FLAG_GZIP;
    }
    pub fn set_is_chunk_manifest(&mut self) {
        self.flags |= FLAG_IS_CHUNK_MANIFEST;
    }

    pub fn set_name(&mut self, name: &[u8]) {
        self.name = name[..name.len().min(MAX_NAME_OR_MIME)].to_vec();
        self.flags |= FLAG_HAS_NAME;
    }

    pub fn set_mime(&mut self, mime: &[u8]) {
        self.mime = mime[..mime.len().min(MAX_NAME_OR_MIME)].to_vec();
        self.flags |= FLAG_HAS_MIME;
    }

    pub fn set_last_modified(&mut self, unix_seconds: u64) {
        self.last_modified = unix_seconds;
        self.flags |= FLAG_HAS_LAST_MODIFIED;
    }

    pub fn set_ttl(&mut self, ttl: Ttl) {
        if !ttl.is_empty() {
            self.ttl = ttl;
            self.flags |= FLAG_HAS_TTL;
        }
    }

    pub fn set_pairs(&mut self, pairs: &[u8]) {
        self.pairs = pairs[..pairs.len().min(u16::MAX as usize)].to_vec();
        self.flags |= FLAG_HAS_PAIRS;
    }

    pub fn data_size(&self) -> u32 {
        self.data.len() as u32
    }

    /// Body size field for v2/v3: zero when there is no data, otherwise the
    /// data plus every attribute the flags declare.
    fn computed_size_v2(&self) -> u32 {
        if self.data.is_empty() {
            return 0;
        }
        let mut size = 4 + self.data.len() as u32 + 1;
        if self.has_name() {
            size += 1 + self.name.len() as u32;
        }
        if self.has_mime() {
            size += 1 + self.mime.len() as u32;
        }
        if self.has_last_modified() {
            size += LAST_MODIFIED_BYTES_LENGTH as u32;
        }
        if self.has_ttl() {
            size += TTL_BYTES_LENGTH as u32;
        }
        if self.has_pairs() {
            size += 2 + self.pairs.len() as u32;
        }
        size
    }

    pub fn disk_size(&self, version: Version) -> u64 {
        actual_size(self.size, version)
    }

    // ── Encode ───────────────────────────────────────────────────────────────

    /// Serialise the full record (header through padding) into one buffer.
    /// Updates `self.size` and `self.checksum` as a side effect.
    pub fn encode(&mut self, version: Version) -> Result<Vec<u8>> {
        self.checksum = crc32fast::hash(&self.data);
        match version {
            Version::V1 => {
                self.size = self.data.len() as u32;
                let pad = padding_length(self.size, version) as usize;
                let mut buf =
                    Vec::with_capacity(NEEDLE_ENTRY_SIZE + self.size as usize + 4 + pad);
                self.push_header(&mut buf);
                buf.extend_from_slice(&self.data);
                push_u32(&mut buf, self.checksum);
                buf.resize(buf.len() + pad, 0);
                Ok(buf)
            }
            Version::V2 | Version::V3 => {
                self.size = self.computed_size_v2();
                let pad = padding_length(self.size, version) as usize;
                let mut buf =
                    Vec::with_capacity(actual_size(self.size, version) as usize);
                self.push_header(&mut buf);
                if !self.data.is_empty() {
                    push_u32(&mut buf, self.data.len() as u32);
                    buf.extend_from_slice(&self.data);
                    buf.push(self.flags);
                    if self.has_name() {
                        buf.push(self.name.len() as u8);
                        buf.extend_from_slice(&self.name);
                    }
                    if self.has_mime() {
                        buf.push(self.mime.len() as u8);
                        buf.extend_from_slice(&self.mime);
                    }
                    if self.has_last_modified() {
                        let mut lm = [0u8; 8];
                        BigEndian::write_u64(&mut lm, self.last_modified);
                        buf.extend_from_slice(&lm[8 - LAST_MODIFIED_BYTES_LENGTH..]);
                    }
                    if self.has_ttl() {
                        let mut t = [0u8; TTL_BYTES_LENGTH];
                        self.ttl.write_to(&mut t);
                        buf.extend_from_slice(&t);
                    }
                    if self.has_pairs() {
                        push_u16(&mut buf, self.pairs.len() as u16);
                        buf.extend_from_slice(&self.pairs);
                    }
                }
                push_u32(&mut buf, self.checksum);
                if version.has_timestamp() {
                    push_u64(&mut buf, self.append_at_ns);
                }
                buf.resize(buf.len() + pad, 0);
                Ok(buf)
            }
        }
    }

    fn push_header(&self, buf: &mut Vec<u8>) {
        let mut header = [0u8; NEEDLE_ENTRY_SIZE];
        put_cookie(&mut header[..COOKIE_SIZE], self.cookie);
        put_needle_id(&mut header[COOKIE_SIZE..COOKIE_SIZE + NEEDLE_ID_SIZE], self.id);
        BigEndian::write_u32(&mut header[COOKIE_SIZE + NEEDLE_ID_SIZE..], self.size);
        buf.extend_from_slice(&header);
    }

    // ── Append ───────────────────────────────────────────────────────────────

    /// Append this record at the end of `w`.
    ///
    /// Returns `(offset, size, actual_size)` where `offset` is the byte
    /// position the record starts at and `size` is the value index entries
    /// should carry for it (the data length for v2/v3, the body size for
    /// v1).  On any write failure the file is truncated back to its
    /// pre-append length before the error is surfaced.
    pub fn append(&mut self, w: &mut File, version: Version) -> Result<(u64, u32, u64)> {
        let end = w.seek(SeekFrom::End(0))?;
        let buf = self.encode(version)?;
        if let Err(e) = w.write_all(&buf) {
            if let Err(te) = w.set_len(end) {
                log::warn!("failed to truncate back to {end} after bad append: {te}");
            }
            return Err(e.into());
        }
        let size = match version {
            Version::V1 => self.size,
            Version::V2 | Version::V3 => self.data_size(),
        };
        Ok((end, size, buf.len() as u64))
    }

    // ── Decode ───────────────────────────────────────────────────────────────

    pub fn parse_header(&mut self, bytes: &[u8]) {
        self.cookie = get_cookie(&bytes[..COOKIE_SIZE]);
        self.id = get_needle_id(&bytes[COOKIE_SIZE..COOKIE_SIZE + NEEDLE_ID_SIZE]);
        self.size = BigEndian::read_u32(&bytes[COOKIE_SIZE + NEEDLE_ID_SIZE..NEEDLE_ENTRY_SIZE]);
    }

    /// Read and fully verify the record at `offset` whose index entry said
    /// `size`.  A header size that disagrees with the index means the entry
    /// points at something else — reported as `NotFound`, not corruption.
    pub fn read_data(
        &mut self,
        r: &File,
        offset: u64,
        size: u32,
        version: Version,
    ) -> Result<()> {
        let mut bytes = vec![0u8; actual_size(size, version) as usize];
        r.read_exact_at(&mut bytes, offset)?;
        self.parse_header(&bytes);
        if self.size != size {
            return Err(Error::NotFound);
        }
        let body_end = NEEDLE_ENTRY_SIZE + size as usize;
        match version {
            Version::V1 => {
                self.data = bytes[NEEDLE_ENTRY_SIZE..body_end].to_vec();
            }
            Version::V2 | Version::V3 => {
                self.parse_body_v2(&bytes[NEEDLE_ENTRY_SIZE..body_end], offset)?;
            }
        }
        if size == 0 {
            return Ok(());
        }
        let stored = BigEndian::read_u32(&bytes[body_end..body_end + NEEDLE_CHECKSUM_SIZE]);
        let computed = crc32fast::hash(&self.data);
        if stored != computed {
            return Err(Error::corrupted(offset, "data checksum mismatch"));
        }
        self.checksum = computed;
        if version.has_timestamp() {
            let ts = body_end + NEEDLE_CHECKSUM_SIZE;
            self.append_at_ns = BigEndian::read_u64(&bytes[ts..ts + TIMESTAMP_SIZE]);
        }
        Ok(())
    }

    /// Parse the v2/v3 body.  `bytes` is exactly `self.size` long; every
    /// length prefix is bounds-checked against it before slicing.
    fn parse_body_v2(&mut self, bytes: &[u8], offset: u64) -> Result<()> {
        let oob = || Error::corrupted(offset, "attribute length overruns needle body");
        let mut index = 0usize;
        let len = bytes.len();
        if index < len {
            if index + 4 > len {
                return Err(oob());
            }
            let data_size = BigEndian::read_u32(&bytes[index..index + 4]) as usize;
            index += 4;
            if index + data_size + 1 > len {
                return Err(oob());
            }
            self.data = bytes[index..index + data_size].to_vec();
            index += data_size;
            self.flags = bytes[index];
            index += 1;
        }
        if index < len && self.has_name() {
            let name_size = bytes[index] as usize;
            index += 1;
            if index + name_size > len {
                return Err(oob());
            }
            self.name = bytes[index..index + name_size].to_vec();
            index += name_size;
        }
        if index < len && self.has_mime() {
            let mime_size = bytes[index] as usize;
            index += 1;
            if index + mime_size > len {
                return Err(oob());
            }
            self.mime = bytes[index..index + mime_size].to_vec();
            index += mime_size;
        }
        if index < len && self.has_last_modified() {
            if index + LAST_MODIFIED_BYTES_LENGTH > len {
                return Err(oob());
            }
            let mut lm = [0u8; 8];
            lm[8 - LAST_MODIFIED_BYTES_LENGTH..]
                .copy_from_slice(&bytes[index..index + LAST_MODIFIED_BYTES_LENGTH]);
            self.last_modified = BigEndian::read_u64(&lm);
            index += LAST_MODIFIED_BYTES_LENGTH;
        }
        if index < len && self.has_ttl() {
            if index + TTL_BYTES_LENGTH > len {
                return Err(oob());
            }
            self.ttl = Ttl::from_bytes(&[bytes[index], bytes[index + 1]]);
            index += TTL_BYTES_LENGTH;
        }
        if index < len && self.has_pairs() {
            if index + 2 > len {
                return Err(oob());
            }
            let pairs_size = BigEndian::read_u16(&bytes[index..index + 2]) as usize;
            index += 2;
            if index + pairs_size > len {
                return Err(oob());
            }
            self.pairs = bytes[index..index + pairs_size].to_vec();
        }
        Ok(())
    }
}

/// Read just the 16-byte header at `offset`, returning the partially filled
/// needle and the length of the body that follows it.
pub fn read_needle_header(r: &File, version: Version, offset: u64) -> Result<(Needle, u64)> {
    let mut bytes = [0u8; NEEDLE_ENTRY_SIZE];
    r.read_exact_at(&mut bytes, offset)?;
    let mut n = Needle::default();
    n.parse_header(&bytes);
    let body = body_length(n.size, version);
    Ok((n, body))
}

impl Needle {
    /// Read the body for a needle whose header was already parsed.
    /// `offset` points just past the header.  Verifies the stored checksum
    /// when the record carries data.
    pub fn read_body(
        &mut self,
        r: &File,
        version: Version,
        offset: u64,
        body_len: u64,
    ) -> Result<()> {
        if body_len == 0 {
            return Ok(());
        }
        let mut bytes = vec![0u8; body_len as usize];
        r.read_exact_at(&mut bytes, offset)?;
        let size = self.size as usize;
        match version {
            Version::V1 => {
                self.data = bytes[..size].to_vec();
            }
            Version::V2 | Version::V3 => {
                self.parse_body_v2(&bytes[..size], offset)?;
                if version.has_timestamp() {
                    let ts = size + NEEDLE_CHECKSUM_SIZE;
                    self.append_at_ns = BigEndian::read_u64(&bytes[ts..ts + TIMESTAMP_SIZE]);
                }
            }
        }
        // The checksum trailer sits right after the body in every version.
        if size > 0 {
            let stored = BigEndian::read_u32(&bytes[size..size + NEEDLE_CHECKSUM_SIZE]);
            if stored != crc32fast::hash(&self.data) {
                return Err(Error::corrupted(
                    offset - NEEDLE_ENTRY_SIZE as u64,
                    "data checksum mismatch",
                ));
            }
        }
        self.checksum = crc32fast::hash(&self.data);
        Ok(())
    }
}

fn push_u16(buf: &mut Vec<u8>, v: u16) {
    let mut b = [0u8; 2];
    BigEndian::write_u16(&mut b, v);
    buf.extend_from_slice(&b);
}

fn push_u32(buf: &mut Vec<u8>, v: u32) {
    let mut b = [0u8; 4];
    BigEndian::write_u32(&mut b, v);
    buf.extend_from_slice(&b);
}

fn push_u64(buf: &mut Vec<u8>, v: u64) {
    let mut b = [0u8; 8];
    BigEndian::write_u64(&mut b, v);
    buf.extend_from_slice(&b);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::superblock::Version;
    use proptest::prelude::*;

    #[test]
    fn padding_keeps_records_aligned() {
        for version in [Version::V1, Version::V2, Version::V3] {
            for size in [0u32, 1, 7, 8, 9, 100, 255, 256, 4096, (1 << 24) - 1] {
                let pad = padding_length(size, version);
                assert!((1..=8).contains(&pad), "pad {pad} for size {size}");
                assert_eq!(actual_size(size, version) % NEEDLE_PADDING_SIZE as u64, 0);
            }
        }
    }

    proptest! {
        #[test]
        fn prop_actual_size_is_aligned(size in 0u32..(1 << 24)) {
            for version in [Version::V1, Version::V2, Version::V3] {
                let pad = padding_length(size, version);
                prop_assert!((1..=8).contains(&pad));
                prop_assert_eq!(actual_size(size, version) % 8, 0);
            }
        }
    }

    #[test]
    fn encoded_length_matches_size_math() {
        let mut n = Needle::new(42, 0xcafe_babe, b"hello world".to_vec());
        n.set_name(b"greeting.txt");
        n.set_ttl(Ttl::parse("5m").unwrap());
        n.append_at_ns = 1;
        let buf = n.encode(Version::V3).unwrap();
        assert_eq!(buf.len() as u64, actual_size(n.size, Version::V3));
        assert_eq!(buf.len() % NEEDLE_PADDING_SIZE, 0);
    }

    #[test]
    fn empty_needle_encodes_bodiless() {
        let mut n = Needle::empty(7, 1);
        let buf = n.encode(Version::V3).unwrap();
        assert_eq!(n.size, 0);
        // Header + checksum + timestamp + 4 bytes padding.
        assert_eq!(buf.len(), 32);
    }

    #[test]
    fn name_longer_than_255_is_clipped() {
        let mut n = Needle::new(1, 1, vec![1]);
        n.set_name(&[b'x'; 400]);
        assert_eq!(n.name.len(), 255);
    }
}
