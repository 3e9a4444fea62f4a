//! Superblock — format anchor occupying the first padded block of `.dat`.
//!
//! # On-disk layout (8 bytes)
//!
//! ```text
//! Offset  Size  Field
//!    0      1   version            1, 2, or 3
//!    1      1   replica_placement  packed digit byte (see below)
//!    2      2   ttl                count, unit (see ttl.rs)
//!    4      2   compact_revision   BE u16, +1 per compaction, wraps
//!    6      2   zero padding to the 8-byte record alignment
//! ```
//!
//! The superblock is exactly one padded block, so the first needle record
//! starts at offset 8 and `Offset(0)` can never point at a needle — that
//! bit pattern is reserved as the "absent" sentinel.
//!
//! # Versions
//! v1 records carry only data.  v2 adds the optional attribute body
//! (name, mime, last-modified, TTL, pairs).  v3 is v2 plus an 8-byte
//! append-nanosecond timestamp per record — the follower-sync checkpoint.
//! Mixing versions within one volume is undefined; the superblock version
//! is authoritative for every record in the file.

use byteorder::{BigEndian, ByteOrder};
use serde::Serialize;
use std::fmt;

use crate::error::{Error, Result};
use crate::ttl::Ttl;
use crate::types::NEEDLE_PADDING_SIZE;

pub const SUPER_BLOCK_SIZE: usize = NEEDLE_PADDING_SIZE;

// ── Version ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(into = "u8")]
pub enum Version {
    V1 = 1,
    V2 = 2,
    V3 = 3,
}

pub const CURRENT_VERSION: Version = Version::V3;

impl Version {
    pub fn from_byte(b: u8) -> Result<Version> {
        match b {
            1 => Ok(Version::V1),
            2 => Ok(Version::V2),
            3 => Ok(Version::V3),
            other => Err(Error::UnsupportedVersion(other)),
        }
    }

    #[inline]
    pub fn byte(self) -> u8 {
        self as u8
    }

    /// v3 records trail an 8-byte append timestamp after the checksum.
    #[inline]
    pub fn has_timestamp(self) -> bool {
        matches!(self, Version::V3)
    }
}

impl From<Version> for u8 {
    fn from(v: Version) -> u8 {
        v.byte()
    }
}

// ── Replica placement ────────────────────────────────────────────────────────

/// Replication shape `xyz`: copies in different data centers, on different
/// racks, and on the same rack.  Packed into one byte as
/// `100*dc + 10*rack + same`; total copy count is the digit sum plus one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(into = "String")]
pub struct ReplicaPlacement {
    pub same_rack_count: u8,
    pub diff_rack_count: u8,
    pub diff_data_center_count: u8,
}

impl ReplicaPlacement {
    /// Parse the three-digit string form, e.g. `"001"`, `"010"`, `"200"`.
    pub fn parse(s: &str) -> Option<ReplicaPlacement> {
        let b = s.as_bytes();
        if b.len() != 3 || !b.iter().all(|c| c.is_ascii_digit()) {
            return None;
        }
        Some(ReplicaPlacement {
            diff_data_center_count: b[0] - b'0',
            diff_rack_count: b[1] - b'0',
            same_rack_count: b[2] - b'0',
        })
    }

    pub fn from_byte(b: u8) -> ReplicaPlacement {
        ReplicaPlacement {
            diff_data_center_count: b / 100,
            diff_rack_count: (b / 10) % 10,
            same_rack_count: b % 10,
        }
    }

    pub fn byte(self) -> u8 {
        self.diff_data_center_count * 100 + self.diff_rack_count * 10 + self.same_rack_count
    }

    pub fn copy_count(self) -> u8 {
        self.same_rack_count + self.diff_rack_count + self.diff_data_center_count + 1
    }
}

impl fmt::Display for ReplicaPlacement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            self.diff_data_center_count, self.diff_rack_count, self.same_rack_count
        )
    }
}

impl From<ReplicaPlacement> for String {
    fn from(rp: ReplicaPlacement) -> String {
        rp.to_string()
    }
}

// ── Superblock ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct SuperBlock {
    pub version: Version,
    pub replica_placement: ReplicaPlacement,
    pub ttl: Ttl,
    pub compact_revision: u16,
}

impl SuperBlock {
    pub fn new(replica_placement: ReplicaPlacement, ttl: Ttl) -> SuperBlock {
        SuperBlock {
            version: CURRENT_VERSION,
            replica_placement,
            ttl,
            compact_revision: 0,
        }
    }

    /// Serialise to exactly one padded block.
    pub fn bytes(&self) -> [u8; SUPER_BLOCK_SIZE] {
        let mut buf = [0u8; SUPER_BLOCK_SIZE];
        buf[0] = self.version.byte();
        buf[1] = self.replica_placement.byte();
        self.ttl.write_to(&mut buf[2..4]);
        BigEndian::write_u16(&mut buf[4..6], self.compact_revision);
        buf
    }

    /// Parse and validate the version byte.  An unknown version fails hard;
    /// the caller MUST NOT attempt to read records after that.
    pub fn parse(buf: &[u8; SUPER_BLOCK_SIZE]) -> Result<SuperBlock> {
        let version = Version::from_byte(buf[0])?;
        Ok(SuperBlock {
            version,
            replica_placement: ReplicaPlacement::from_byte(buf[1]),
            ttl: Ttl::from_bytes(&[buf[2], buf[3]]),
            compact_revision: BigEndian::read_u16(&buf[4..6]),
        })
    }
}
