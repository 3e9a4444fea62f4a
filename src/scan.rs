//! Volume file scanner — stream every needle record for rebuild or
//! inspection.
//!
//! The scanner walks `.dat` forward from a given offset, reading each
//! record header, optionally its body, and handing both to a visitor.
//! When bodies are read their checksum is verified; a mismatch stops the
//! scan with a corruption error carrying the failing record's offset, so
//! callers that own the file may truncate it there.
//!
//! The two canonical visitors are [`RebuildIndexScanner`] (repopulate a
//! needle map from raw volume bytes — the tail rebuild after a follow, or
//! a full `.idx` regeneration) and the CLI's record dumper.

use std::fs::File;
use std::io::ErrorKind;

use crate::error::{Error, Result};
use crate::needle::{body_length, read_needle_header, Needle};
use crate::needle_map::NeedleMapper;
use crate::superblock::{SuperBlock, Version, SUPER_BLOCK_SIZE};
use crate::types::{Offset, NEEDLE_ENTRY_SIZE};
use std::os::unix::fs::FileExt;

pub trait VolumeFileScanner {
    fn visit_super_block(&mut self, super_block: &SuperBlock) -> Result<()>;

    /// Whether [`VolumeFileScanner::visit_needle`] needs record bodies.
    /// Header-only scans skip the body read (and its checksum check).
    fn read_needle_body(&self) -> bool;

    /// Called once per record; `offset` is the record's byte position.
    fn visit_needle(&mut self, needle: &Needle, offset: u64) -> Result<()>;
}

/// Scan a `.dat` file from its superblock onward.
pub fn scan_data_file(file: &File, scanner: &mut dyn VolumeFileScanner) -> Result<SuperBlock> {
    let mut raw = [0u8; SUPER_BLOCK_SIZE];
    file.read_exact_at(&mut raw, 0)?;
    let super_block = SuperBlock::parse(&raw)?;
    scanner.visit_super_block(&super_block)?;
    scan_data_file_from(super_block.version, file, SUPER_BLOCK_SIZE as u64, scanner)?;
    Ok(super_block)
}

/// Scan records starting at `offset` (which must be a record boundary).
/// Used directly by the follower to index only the freshly appended tail.
pub fn scan_data_file_from(
    version: Version,
    file: &File,
    mut offset: u64,
    scanner: &mut dyn VolumeFileScanner,
) -> Result<()> {
    loop {
        let (mut needle, body_len) = match read_needle_header(file, version, offset) {
            Ok(v) => v,
            Err(Error::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };
        if scanner.read_needle_body() {
            needle
                .read_body(file, version, offset + NEEDLE_ENTRY_SIZE as u64, body_len)
                .map_err(|e| match e {
                    Error::Corrupted { .. } => {
                        Error::corrupted(offset, "needle body unreadable, scan stopped")
                    }
                    other => other,
                })?;
        }
        scanner.visit_needle(&needle, offset)?;
        offset += NEEDLE_ENTRY_SIZE as u64 + body_len;
    }
}

/// Body length the header's size field implies, exposed for callers that
/// step over records themselves.
pub fn record_span(needle_size: u32, version: Version) -> u64 {
    NEEDLE_ENTRY_SIZE as u64 + body_length(needle_size, version)
}

// ── Rebuild-index visitor ────────────────────────────────────────────────────

/// Replays scanned records into a needle map: live records put, bodiless
/// records (deletion markers) delete.  Reads bodies so that corrupted
/// bytes are caught before they are indexed.
pub struct RebuildIndexScanner<'a> {
    nm: &'a mut dyn NeedleMapper,
}

impl<'a> RebuildIndexScanner<'a> {
    pub fn new(nm: &'a mut dyn NeedleMapper) -> RebuildIndexScanner<'a> {
        RebuildIndexScanner { nm }
    }
}

impl VolumeFileScanner for RebuildIndexScanner<'_> {
    fn visit_super_block(&mut self, _super_block: &SuperBlock) -> Result<()> {
        Ok(())
    }

    fn read_needle_body(&self) -> bool {
        true
    }

    fn visit_needle(&mut self, needle: &Needle, offset: u64) -> Result<()> {
        let at = Offset::from_actual(offset);
        if needle.size > 0 {
            self.nm.put(needle.id, at, needle.size)
        } else {
            self.nm.delete(needle.id, at)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::needle::Needle;
    use crate::superblock::{ReplicaPlacement, SuperBlock};
    use crate::ttl::Ttl;
    use std::io::Write;
    use tempfile::tempdir;

    struct Counting {
        headers: Vec<(u64, u64)>,
        with_body: bool,
    }

    impl VolumeFileScanner for Counting {
        fn visit_super_block(&mut self, _sb: &SuperBlock) -> Result<()> {
            Ok(())
        }
        fn read_needle_body(&self) -> bool {
            self.with_body
        }
        fn visit_needle(&mut self, needle: &Needle, offset: u64) -> Result<()> {
            self.headers.push((needle.id, offset));
            Ok(())
        }
    }

    fn write_volume(path: &std::path::Path, payloads: &[(u64, Vec<u8>)]) {
        let sb = SuperBlock::new(ReplicaPlacement::default(), Ttl::NONE);
        let mut f = File::create(path).unwrap();
        f.write_all(&sb.bytes()).unwrap();
        for (id, data) in payloads {
            let mut n = Needle::new(*id, 0x1111, data.clone());
            n.append_at_ns = *id;
            n.append(&mut f, sb.version).unwrap();
        }
    }

    #[test]
    fn visits_every_record_in_order() {
        let dir = tempdir().unwrap();
        let dat = dir.path().join("7.dat");
        write_volume(&dat, &[(1, vec![0u8; 10]), (2, vec![1u8; 20]), (3, vec![2u8; 30])]);

        let file = File::open(&dat).unwrap();
        let mut scanner = Counting { headers: Vec::new(), with_body: true };
        scan_data_file(&file, &mut scanner).unwrap();
        assert_eq!(scanner.headers.len(), 3);
        assert_eq!(scanner.headers[0], (1, SUPER_BLOCK_SIZE as u64));
        assert!(scanner.headers[1].1 > scanner.headers[0].1);
    }

    #[test]
    fn corrupt_body_stops_scan_at_offset() {
        let dir = tempdir().unwrap();
        let dat = dir.path().join("8.dat");
        write_volume(&dat, &[(1, vec![7u8; 64]), (2, vec![8u8; 64])]);

        // Flip one data byte of the second record.
        let mut raw = std::fs::read(&dat).unwrap();
        let second = SUPER_BLOCK_SIZE as u64 + record_span(4 + 64 + 1, Version::V3);
        let target = second as usize + NEEDLE_ENTRY_SIZE + 4;
        raw[target] ^= 0x80;
        std::fs::write(&dat, &raw).unwrap();

        let file = File::open(&dat).unwrap();
        let mut scanner = Counting { headers: Vec::new(), with_body: true };
        let err = scan_data_file(&file, &mut scanner).unwrap_err();
        match err {
            Error::Corrupted { offset, .. } => assert_eq!(offset, second),
            other => panic!("expected corruption, got {other:?}"),
        }
        assert_eq!(scanner.headers.len(), 1);
    }
}
