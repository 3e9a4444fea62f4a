//! Index file (`.idx`) codec — the durable journal of the needle map.
//!
//! # On-disk layout (16 bytes per entry, big-endian, append-only)
//!
//! ```text
//! Offset  Size  Field
//!    0      8   NeedleId
//!    8      4   PaddedOffset   actual `.dat` offset / 8
//!   12      4   Size           body size; all-ones = tombstone
//! ```
//!
//! Entries are appended on every put and delete and never rewritten in
//! place, so crash recovery is a pure replay: walk the file front to back
//! and apply each entry to an empty map.  The `.dat` append always happens
//! before the `.idx` append; a crash between the two leaks unreferenced
//! `.dat` bytes, which the replay simply never sees.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder};
use std::os::unix::fs::FileExt;

use crate::error::{Error, Result};
use crate::types::{
    get_needle_id, put_needle_id, NeedleId, Offset, INDEX_ENTRY_SIZE, NEEDLE_ID_SIZE, OFFSET_SIZE,
};

/// Entries per read while walking an index file.
const ROWS_TO_READ: usize = 1024;

/// One parsed `.idx` entry.
pub fn parse_index_entry(bytes: &[u8]) -> (NeedleId, Offset, u32) {
    let key = get_needle_id(&bytes[..NEEDLE_ID_SIZE]);
    let offset = Offset::read_from(&bytes[NEEDLE_ID_SIZE..NEEDLE_ID_SIZE + OFFSET_SIZE]);
    let size = BigEndian::read_u32(&bytes[NEEDLE_ID_SIZE + OFFSET_SIZE..INDEX_ENTRY_SIZE]);
    (key, offset, size)
}

pub fn write_index_entry(bytes: &mut [u8], key: NeedleId, offset: Offset, size: u32) {
    put_needle_id(&mut bytes[..NEEDLE_ID_SIZE], key);
    offset.write_to(&mut bytes[NEEDLE_ID_SIZE..NEEDLE_ID_SIZE + OFFSET_SIZE]);
    BigEndian::write_u32(&mut bytes[NEEDLE_ID_SIZE + OFFSET_SIZE..INDEX_ENTRY_SIZE], size);
}

// ── Appender ─────────────────────────────────────────────────────────────────

/// Exclusive handle on one volume's `.idx` file.
///
/// Owned by the needle map; the map appends here *before* mutating its
/// in-memory or sled state so that the file is always the superset.
pub struct IndexFile {
    file: File,
    path: PathBuf,
    size: u64,
}

impl IndexFile {
    /// Open (creating if needed) with the cursor at the end.  Fails with a
    /// corruption error when the existing size is not entry-aligned.
    pub fn open(path: &Path) -> Result<IndexFile> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;
        let size = file.metadata()?.len();
        if size % INDEX_ENTRY_SIZE as u64 != 0 {
            return Err(Error::corrupted(
                size,
                format!("index file {} size is not entry-aligned", path.display()),
            ));
        }
        Ok(IndexFile { file, path: path.to_owned(), size })
    }

    pub fn append(&mut self, key: NeedleId, offset: Offset, size: u32) -> Result<()> {
        let mut bytes = [0u8; INDEX_ENTRY_SIZE];
        write_index_entry(&mut bytes, key, offset, size);
        self.file.write_all(&bytes)?;
        self.size += INDEX_ENTRY_SIZE as u64;
        Ok(())
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Read the last entry, if any — the newest write the volume has
    /// acknowledged, used as the follow checkpoint.
    pub fn last_entry(&self) -> Result<Option<(NeedleId, Offset, u32)>> {
        if self.size == 0 {
            return Ok(None);
        }
        let mut bytes = [0u8; INDEX_ENTRY_SIZE];
        self.file
            .read_exact_at(&mut bytes, self.size - INDEX_ENTRY_SIZE as u64)?;
        Ok(Some(parse_index_entry(&bytes)))
    }
}

// ── Walker ───────────────────────────────────────────────────────────────────

/// Walk every entry front to back, 1024 entries per read, calling `visit`
/// with `(key, offset, size)`.  The walk aborts with the first error the
/// visitor returns.
pub fn walk_index_file<F>(file: &File, mut visit: F) -> Result<()>
where
    F: FnMut(NeedleId, Offset, u32) -> Result<()>,
{
    let total = file.metadata()?.len();
    if total % INDEX_ENTRY_SIZE as u64 != 0 {
        return Err(Error::corrupted(total, "index file size is not entry-aligned"));
    }
    let mut buf = vec![0u8; INDEX_ENTRY_SIZE * ROWS_TO_READ];
    let mut pos = 0u64;
    while pos < total {
        let want = ((total - pos) as usize).min(buf.len());
        match file.read_exact_at(&mut buf[..want], pos) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        for chunk in buf[..want].chunks_exact(INDEX_ENTRY_SIZE) {
            let (key, offset, size) = parse_index_entry(chunk);
            visit(key, offset, size)?;
        }
        pos += want as u64;
    }
    Ok(())
}
