//! Incremental follower replication, volume side.
//!
//! A follower catches up by timestamp, not by entry: it reports the append
//! timestamp of its newest index entry, the leader binary-searches its own
//! `.idx` for the first entry appended after that instant, and streams raw
//! `.dat` bytes from there to the end.  The follower appends the bytes
//! verbatim and rebuilds its needle map from the new tail, so leader and
//! follower volumes stay byte-identical.
//!
//! Works only on v3 volumes — the per-record timestamp is the checkpoint.
//! A compact-revision mismatch means the leader rewrote history; the
//! follower surfaces [`Error::FollowMismatch`] and the replication
//! supervisor escalates to a full copy.

use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::sync::atomic::Ordering;

use log::{info, warn};

use crate::error::{Error, Result};
use crate::index::parse_index_entry;
use crate::needle::read_needle_header;
use crate::scan::{scan_data_file_from, RebuildIndexScanner};
use crate::sync::ClientPool;
use crate::types::{Offset, INDEX_ENTRY_SIZE, NEEDLE_ENTRY_SIZE};
use std::os::unix::fs::FileExt;

use super::{now_secs, Volume};

impl Volume {
    /// Append timestamp of the newest index entry, or 0 for an empty
    /// volume — the checkpoint a follower reports to its leader.
    pub fn find_last_append_at_ns(&self) -> Result<u64> {
        let Some(offset) = self.locate_last_append_entry()? else {
            return Ok(0);
        };
        if offset.is_zero() {
            return Ok(0);
        }
        self.read_append_at_ns(offset)
    }

    fn locate_last_append_entry(&self) -> Result<Option<Offset>> {
        let idx = File::open(self.base_name().with_extension("idx"))?;
        let size = idx.metadata()?.len();
        if size % INDEX_ENTRY_SIZE as u64 != 0 {
            return Err(Error::corrupted(size, "index file size is not entry-aligned"));
        }
        if size == 0 {
            return Ok(None);
        }
        let mut bytes = [0u8; INDEX_ENTRY_SIZE];
        idx.read_exact_at(&mut bytes, size - INDEX_ENTRY_SIZE as u64)?;
        let (_, offset, _) = parse_index_entry(&bytes);
        Ok(Some(offset))
    }

    /// Read the v3 append timestamp of the record at `offset`.
    pub fn read_append_at_ns(&self, offset: Offset) -> Result<u64> {
        let file = self.data_file.read().expect("data file lock");
        let (mut needle, body_len) = read_needle_header(&file, self.version, offset.to_actual())?;
        needle.read_body(
            &file,
            self.version,
            offset.to_actual() + NEEDLE_ENTRY_SIZE as u64,
            body_len,
        )?;
        Ok(needle.append_at_ns)
    }

    /// Binary-search the `.idx` entries (ordered by append time) for the
    /// first one whose record was appended after `since_ns`.
    ///
    /// Returns `(offset, is_last)`: the matching record's `.dat` offset, or
    /// `is_last == true` when every entry is at or before `since_ns`.
    pub fn binary_search_by_append_at_ns(&self, since_ns: u64) -> Result<(Offset, bool)> {
        let idx = File::open(self.base_name().with_extension("idx"))?;
        let size = idx.metadata()?.len();
        if size % INDEX_ENTRY_SIZE as u64 != 0 {
            return Err(Error::corrupted(size, "index file size is not entry-aligned"));
        }
        let entry_count = size / INDEX_ENTRY_SIZE as u64;
        let mut bytes = [0u8; INDEX_ENTRY_SIZE];

        let mut l = 0u64;
        let mut h = entry_count;
        while l < h {
            let m = (l + h) / 2;
            let offset = entry_offset(&idx, &mut bytes, m)?;
            let m_ns = self.read_append_at_ns(offset)?;
            if m_ns <= since_ns {
                l = m + 1;
            } else {
                h = m;
            }
        }
        if l == entry_count {
            return Ok((Offset::ZERO, true));
        }
        Ok((entry_offset(&idx, &mut bytes, l)?, false))
    }

    /// Leader side of a follow, step 1: byte position the stream should
    /// start at, or `None` when the follower is already caught up.
    pub fn tail_start(&self, since_ns: u64) -> Result<Option<u64>> {
        let (offset, is_last) = self.binary_search_by_append_at_ns(since_ns)?;
        Ok(if is_last { None } else { Some(offset.to_actual()) })
    }

    /// Leader side of a follow, step 2: stream raw `.dat` bytes from
    /// `start` up to the end of file as of now.  The bytes are not chunked
    /// by needle boundaries.
    pub fn stream_tail(&self, start: u64, sink: &mut dyn Write) -> Result<u64> {
        let mut pos = start;
        let end = self.size();
        let total = end.saturating_sub(pos);
        let mut buf = vec![0u8; 64 * 1024];
        while pos < end {
            let want = ((end - pos) as usize).min(buf.len());
            {
                let file = self.data_file.read().expect("data file lock");
                file.read_exact_at(&mut buf[..want], pos)?;
            }
            sink.write_all(&buf[..want])?;
            pos += want as u64;
        }
        Ok(total)
    }

    /// Follower side: pull everything the leader appended since our last
    /// index entry and index it locally.
    ///
    /// On any stream error, short write, or corruption in the rebuilt
    /// tail, `.dat` is truncated back to its pre-follow length before the
    /// error surfaces; retrying is the caller's decision.
    pub fn follow(&self, leader_addr: &str, pool: &ClientPool) -> Result<()> {
        let _maintenance = self.maintenance.lock().expect("maintenance lock");
        let start_offset = self.size();
        let since_ns = self.find_last_append_at_ns()?;
        let revision = self.compact_revision();

        let mut stream = pool.volume_follow(leader_addr, self.id, since_ns, revision)?;

        let mut file = self.data_file.write().expect("data file lock");
        file.seek(SeekFrom::Start(start_offset))?;
        let received = match io::copy(&mut stream, &mut *file) {
            Ok(n) => n,
            Err(e) => {
                rollback(&file, start_offset, self.id);
                return Err(e.into());
            }
        };
        if received == 0 {
            return Ok(());
        }

        let mut nm = self.nm.write().expect("needle map lock");
        let mut scanner = RebuildIndexScanner::new(nm.as_mut());
        if let Err(e) = scan_data_file_from(self.version, &file, start_offset, &mut scanner) {
            rollback(&file, start_offset, self.id);
            return Err(e);
        }
        self.last_modified_time.store(now_secs(), Ordering::Release);
        info!(
            "volume {}: followed {} bytes from {}",
            self.id, received, leader_addr
        );
        Ok(())
    }
}

fn entry_offset(idx: &File, bytes: &mut [u8; INDEX_ENTRY_SIZE], entry: u64) -> Result<Offset> {
    idx.read_exact_at(bytes, entry * INDEX_ENTRY_SIZE as u64)?;
    let (_, offset, _) = parse_index_entry(bytes);
    Ok(offset)
}

fn rollback(file: &File, start_offset: u64, volume_id: u32) {
    if let Err(e) = file.set_len(start_offset) {
        warn!("volume {volume_id}: rollback truncate to {start_offset} failed: {e}");
    }
}
