//! Needle map — key → (offset, size), three backends behind one contract.
//!
//! Every mutation appends to the `.idx` journal *first* and only then
//! touches the lookup structure, so a crash at any point leaves the journal
//! a superset of the structure and recovery is a pure replay.
//!
//! Backends (selected by name, instance passed explicitly — there is no
//! process-wide registry):
//! - `compact` — packed 16-byte entries sharded by the high byte of the
//!   key; the default for volumes with hundreds of millions of tiny
//!   objects.
//! - `btree`   — ordered std map; simpler, supports range walks.
//! - `sled`    — on-disk tree at `<volume>.ldb/`, survives restarts
//!   without a full replay when its applied-length marker matches the
//!   journal.
//!
//! A map instance is single-writer.  `get` on the in-memory backends needs
//! the caller's lock around concurrent mutation; the sled backend is
//! natively concurrent.

mod compact;
mod memory;
mod sled_map;

pub use compact::CompactMap;
pub use memory::MemoryNeedleMap;
pub use sled_map::SledNeedleMap;

use std::path::Path;

use crate::error::Result;
use crate::types::{NeedleId, Offset, TOMBSTONE_FILE_SIZE};

// ── Values ───────────────────────────────────────────────────────────────────

/// A live map entry: where the needle's current record lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeedleValue {
    pub offset: Offset,
    pub size: u32,
}

/// Decoded meaning of one `.idx` entry.  The all-ones size and the zero
/// offset are wire sentinels; they never leak past this enum, so nothing
/// downstream can do arithmetic on a tombstone by accident.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexValue {
    Live { offset: Offset, size: u32 },
    Tombstone { offset: Offset },
}

impl IndexValue {
    pub fn from_raw(offset: Offset, size: u32) -> IndexValue {
        if offset.is_zero() || size == TOMBSTONE_FILE_SIZE {
            IndexValue::Tombstone { offset }
        } else {
            IndexValue::Live { offset, size }
        }
    }
}

// ── Metrics ──────────────────────────────────────────────────────────────────

/// Counters derivable by replaying the journal.  `file_count` and
/// `content_size` track the *live* set (an overwrite replaces; a delete
/// removes), so a reload reports the same numbers as the session that
/// wrote the journal.
#[derive(Debug, Default, Clone, Copy)]
pub struct MapMetrics {
    file_count: u64,
    content_size: u64,
    deletion_count: u64,
    deleted_size: u64,
    max_file_key: NeedleId,
}

impl MapMetrics {
    pub fn log_put(&mut self, key: NeedleId, old: Option<NeedleValue>, new_size: u32) {
        self.max_file_key = self.max_file_key.max(key);
        self.content_size += new_size as u64;
        match old {
            Some(prev) => {
                self.deletion_count += 1;
                self.deleted_size += prev.size as u64;
                self.content_size = self.content_size.saturating_sub(prev.size as u64);
            }
            None => self.file_count += 1,
        }
    }

    pub fn log_delete(&mut self, old: Option<NeedleValue>) {
        if let Some(prev) = old {
            self.file_count = self.file_count.saturating_sub(1);
            self.deletion_count += 1;
            self.deleted_size += prev.size as u64;
            self.content_size = self.content_size.saturating_sub(prev.size as u64);
        }
    }

    pub fn note_key(&mut self, key: NeedleId) {
        self.max_file_key = self.max_file_key.max(key);
    }

    pub fn file_count(&self) -> u64 {
        self.file_count
    }
    pub fn deleted_count(&self) -> u64 {
        self.deletion_count
    }
    pub fn deleted_size(&self) -> u64 {
        self.deleted_size
    }
    pub fn content_size(&self) -> u64 {
        self.content_size
    }
    pub fn max_file_key(&self) -> NeedleId {
        self.max_file_key
    }
}

// ── Contract ─────────────────────────────────────────────────────────────────

pub trait NeedleMapper: Send + Sync {
    /// Journal the entry, then install it.  `size` is the raw size value
    /// index entries carry for this record.
    fn put(&mut self, key: NeedleId, offset: Offset, size: u32) -> Result<()>;

    fn get(&self, key: NeedleId) -> Option<NeedleValue>;

    /// Journal a tombstone at `offset` (the deletion marker's position in
    /// `.dat`), then drop the key.
    fn delete(&mut self, key: NeedleId, offset: Offset) -> Result<()>;

    /// Flush and release files.  Idempotent.
    fn close(&mut self) -> Result<()>;

    /// Close and unlink everything the map owns on disk.
    fn destroy(&mut self) -> Result<()>;

    fn file_count(&self) -> u64;
    fn deleted_count(&self) -> u64;
    fn deleted_size(&self) -> u64;
    fn content_size(&self) -> u64;
    fn max_file_key(&self) -> NeedleId;
    fn index_file_size(&self) -> u64;
}

// ── Kind selection ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NeedleMapKind {
    #[default]
    Compact,
    Btree,
    Sled,
}

impl NeedleMapKind {
    pub fn from_name(s: &str) -> Option<NeedleMapKind> {
        match s.to_lowercase().as_str() {
            "compact" | "memory" => Some(NeedleMapKind::Compact),
            "btree" => Some(NeedleMapKind::Btree),
            "sled" | "disk" => Some(NeedleMapKind::Sled),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            NeedleMapKind::Compact => "compact",
            NeedleMapKind::Btree => "btree",
            NeedleMapKind::Sled => "sled",
        }
    }
}

/// Open the map for a volume whose files share the stem `base_name`
/// (`<dir>/<collection?>_<id>`): the journal at `<base_name>.idx`, and for
/// the sled backend its tree at `<base_name>.ldb/`.
pub fn open_needle_map(kind: NeedleMapKind, base_name: &Path) -> Result<Box<dyn NeedleMapper>> {
    let idx_path = base_name.with_extension("idx");
    match kind {
        NeedleMapKind::Compact => Ok(Box::new(MemoryNeedleMap::load_compact(&idx_path)?)),
        NeedleMapKind::Btree => Ok(Box::new(MemoryNeedleMap::load_btree(&idx_path)?)),
        NeedleMapKind::Sled => {
            let ldb_path = base_name.with_extension("ldb");
            Ok(Box::new(SledNeedleMap::open(&ldb_path, &idx_path)?))
        }
    }
}
