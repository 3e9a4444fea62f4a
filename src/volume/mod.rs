//! Volume — one append-only needle log: `<name>.dat` + `<name>.idx`.
//!
//! A volume exclusively owns its data file, its needle map (which owns the
//! index file), and its superblock; everything is released deterministically
//! on close and unlinked on destroy.
//!
//! # Locking
//! - `data_file` (RwLock): every mutation of `.dat` — append, compaction
//!   swap, truncate — holds the write half.  Reads take the read half only
//!   long enough for positional `read_at` calls, so they run concurrently
//!   with each other and are blocked only while an append is in flight.
//! - `nm` (RwLock): lookups take read, mutations write.  Lock order is
//!   always `data_file` before `nm`.
//! - `maintenance` (Mutex): held across compaction and follow; `close` and
//!   `destroy` take it first, so a destructive operation waits for any
//!   in-flight maintenance to finish.
//!
//! Operations on distinct volumes share no locks.

mod compaction;
mod follow;

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::needle::Needle;
use crate::needle_map::{open_needle_map, NeedleMapKind, NeedleMapper};
use crate::superblock::{ReplicaPlacement, SuperBlock, Version, SUPER_BLOCK_SIZE};
use crate::ttl::Ttl;
use crate::types::{NeedleId, Offset, VolumeId};
use std::os::unix::fs::FileExt;

/// Base path (no extension) of a volume's files:
/// `<dir>/<collection>_<id>` or `<dir>/<id>` when the collection is empty.
pub fn volume_base_name(dir: &Path, collection: &str, id: VolumeId) -> PathBuf {
    if collection.is_empty() {
        dir.join(id.to_string())
    } else {
        dir.join(format!("{collection}_{id}"))
    }
}

pub struct Volume {
    id: VolumeId,
    dir: PathBuf,
    collection: String,
    needle_map_kind: NeedleMapKind,
    version: Version,

    super_block: RwLock<SuperBlock>,
    data_file: RwLock<File>,
    nm: RwLock<Box<dyn NeedleMapper>>,

    read_only: AtomicBool,
    /// Unix seconds of the newest append, or the file mtime after a load.
    last_modified_time: AtomicU64,
    /// Completion barrier for compaction/follow vs. close/destroy.
    maintenance: Mutex<()>,
}

/// One row of the engine's `Status()` report.
#[derive(Debug, Clone, Serialize)]
pub struct VolumeStatus {
    pub id: VolumeId,
    pub collection: String,
    pub size: u64,
    pub file_count: u64,
    pub delete_count: u64,
    pub deleted_byte_count: u64,
    pub max_file_key: NeedleId,
    pub version: Version,
    pub ttl: Ttl,
    pub replication: ReplicaPlacement,
    pub compact_revision: u16,
    pub read_only: bool,
}

/// Handshake snapshot a follower compares against before streaming.
#[derive(Debug, Clone, Serialize)]
pub struct VolumeSyncStatus {
    pub volume_id: VolumeId,
    pub collection: String,
    pub tail_offset: u64,
    pub idx_file_size: u64,
    pub compact_revision: u16,
    pub ttl: Ttl,
    pub replication: ReplicaPlacement,
}

impl Volume {
    /// Open a volume, creating its files when absent.
    ///
    /// `replica_placement`/`ttl` seed the superblock of a brand-new volume;
    /// for an existing one the superblock on disk is authoritative and the
    /// arguments are ignored.  `preallocate` is a capacity request in
    /// bytes, checked against the filesystem's free space before a new
    /// volume is created.
    pub fn open(
        dir: &Path,
        collection: &str,
        id: VolumeId,
        kind: NeedleMapKind,
        replica_placement: Option<ReplicaPlacement>,
        ttl: Option<Ttl>,
        preallocate: u64,
    ) -> Result<Volume> {
        let base = volume_base_name(dir, collection, id);
        let dat_path = base.with_extension("dat");
        let creating = !dat_path.exists();
        if creating && preallocate > 0 {
            let available = fs2::available_space(dir)?;
            if available < preallocate {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!(
                        "cannot reserve {preallocate} bytes for volume {id}: only {available} available in {}",
                        dir.display()
                    ),
                )));
            }
        }
        let data_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&dat_path)?;

        let len = data_file.metadata()?.len();
        let super_block = if len == 0 {
            let sb = SuperBlock::new(
                replica_placement.unwrap_or_default(),
                ttl.unwrap_or(Ttl::NONE),
            );
            data_file.write_all_at(&sb.bytes(), 0)?;
            data_file.sync_data()?;
            info!("created volume {} at {}", id, dat_path.display());
            sb
        } else {
            let mut raw = [0u8; SUPER_BLOCK_SIZE];
            data_file.read_exact_at(&mut raw, 0)?;
            SuperBlock::parse(&raw)?
        };

        let nm = open_needle_map(kind, &base)?;

        let mtime = data_file
            .metadata()?
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);

        debug!(
            "volume {} loaded: version {}, revision {}, {} live needles",
            id,
            super_block.version.byte(),
            super_block.compact_revision,
            nm.file_count()
        );

        Ok(Volume {
            id,
            dir: dir.to_owned(),
            collection: collection.to_owned(),
            needle_map_kind: kind,
            version: super_block.version,
            super_block: RwLock::new(super_block),
            data_file: RwLock::new(data_file),
            nm: RwLock::new(nm),
            read_only: AtomicBool::new(false),
            last_modified_time: AtomicU64::new(mtime),
            maintenance: Mutex::new(()),
        })
    }

    pub fn id(&self) -> VolumeId {
        self.id
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn base_name(&self) -> PathBuf {
        volume_base_name(&self.dir, &self.collection, self.id)
    }

    pub fn compact_revision(&self) -> u16 {
        self.super_block.read().expect("superblock lock").compact_revision
    }

    pub fn ttl(&self) -> Ttl {
        self.super_block.read().expect("superblock lock").ttl
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::Release);
    }

    pub fn last_modified_time(&self) -> u64 {
        self.last_modified_time.load(Ordering::Acquire)
    }

    /// Current `.dat` length in bytes.
    pub fn size(&self) -> u64 {
        let file = self.data_file.read().expect("data file lock");
        file.metadata().map(|m| m.len()).unwrap_or(0)
    }

    pub fn file_count(&self) -> u64 {
        self.nm.read().expect("needle map lock").file_count()
    }

    pub fn content_size(&self) -> u64 {
        self.nm.read().expect("needle map lock").content_size()
    }

    pub fn index_file_size(&self) -> u64 {
        self.nm.read().expect("needle map lock").index_file_size()
    }

    // ── Write path ───────────────────────────────────────────────────────────

    /// Append the needle and index it.  Returns the stored data length.
    pub fn write(&self, needle: &mut Needle) -> Result<u32> {
        if self.is_read_only() {
            return Err(Error::ReadOnly(self.id));
        }
        let mut file = self.data_file.write().expect("data file lock");
        needle.append_at_ns = now_nanos();
        let (offset, size, _actual) = needle.append(&mut file, self.version)?;

        let mut nm = self.nm.write().expect("needle map lock");
        // A concurrent replay may already have indexed a newer copy; only
        // move the map forward.
        let stale = nm
            .get(needle.id)
            .map(|nv| nv.offset.to_actual() >= offset)
            .unwrap_or(false);
        if !stale {
            nm.put(needle.id, Offset::from_actual(offset), needle.size)?;
        }
        self.last_modified_time
            .store(needle.append_at_ns / 1_000_000_000, Ordering::Release);
        Ok(size)
    }

    // ── Read path ────────────────────────────────────────────────────────────

    /// Look the key up and read its record back, CRC-verified.
    ///
    /// Cookie checking is the caller's business: a mismatch between the
    /// presented and stored cookie is an authorisation failure at the
    /// boundary, not a data error here.
    pub fn read(&self, key: NeedleId) -> Result<Needle> {
        let value = self
            .nm
            .read()
            .expect("needle map lock")
            .get(key)
            .ok_or(Error::NotFound)?;
        let mut needle = Needle::default();
        let file = self.data_file.read().expect("data file lock");
        needle.read_data(&file, value.offset.to_actual(), value.size, self.version)?;
        Ok(needle)
    }

    // ── Delete path ──────────────────────────────────────────────────────────

    /// Record a deletion.  Appends a bodiless marker record (so deletes
    /// travel the follower byte stream) plus a tombstone index entry; the
    /// data bytes themselves are reclaimed only by compaction.  Returns the
    /// byte count the deletion will eventually free.
    pub fn delete(&self, key: NeedleId) -> Result<u64> {
        if self.is_read_only() {
            return Err(Error::ReadOnly(self.id));
        }
        let mut file = self.data_file.write().expect("data file lock");
        let mut nm = self.nm.write().expect("needle map lock");
        let Some(value) = nm.get(key) else {
            return Ok(0);
        };
        let mut marker = Needle::empty(key, 0);
        marker.append_at_ns = now_nanos();
        let (offset, _, _) = marker.append(&mut file, self.version)?;
        nm.delete(key, Offset::from_actual(offset))?;
        self.last_modified_time
            .store(marker.append_at_ns / 1_000_000_000, Ordering::Release);
        Ok(value.size as u64)
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Flush everything.  Waits for in-flight maintenance.
    pub fn close(&self) -> Result<()> {
        let _barrier = self.maintenance.lock().expect("maintenance lock");
        self.nm.write().expect("needle map lock").close()?;
        let file = self.data_file.write().expect("data file lock");
        file.sync_all()?;
        Ok(())
    }

    /// Close and unlink both files (and the map's own storage).
    pub fn destroy(&self) -> Result<()> {
        let _barrier = self.maintenance.lock().expect("maintenance lock");
        self.nm.write().expect("needle map lock").destroy()?;
        let dat_path = self.base_name().with_extension("dat");
        info!("destroying volume {}: unlinking {}", self.id, dat_path.display());
        std::fs::remove_file(dat_path)?;
        Ok(())
    }

    /// Stream every record in this volume through `scanner`.  Reads run
    /// against the live data file; concurrent appends after the scan
    /// starts are simply not visited.
    pub fn scan(&self, scanner: &mut dyn crate::scan::VolumeFileScanner) -> Result<SuperBlock> {
        let file = self.data_file.read().expect("data file lock");
        crate::scan::scan_data_file(&file, scanner)
    }

    // ── Expiry ───────────────────────────────────────────────────────────────

    /// A volume has expired when it has content, carries a TTL, and its
    /// newest write is older than that TTL.  `volume_size_limit == 0`
    /// (a server that does not yet know its limit) disables the check.
    pub fn expired(&self, volume_size_limit: u64) -> bool {
        if volume_size_limit == 0 || self.content_size() == 0 {
            return false;
        }
        let ttl = self.ttl();
        if ttl.is_empty() {
            return false;
        }
        let lived_minutes = now_secs().saturating_sub(self.last_modified_time()) / 60;
        lived_minutes > ttl.minutes() as u64
    }

    /// Grace period on top of [`Volume::expired`]: a tenth of the TTL,
    /// capped at `max_delay_minutes`.  Only when this also holds may the
    /// volume be unlinked.
    pub fn expired_long_enough(&self, max_delay_minutes: u32) -> bool {
        let ttl = self.ttl();
        if ttl.is_empty() {
            return false;
        }
        let removal_delay = (ttl.minutes() / 10).min(max_delay_minutes);
        (ttl.minutes() + removal_delay) as u64 * 60 + self.last_modified_time() < now_secs()
    }

    // ── Reporting ────────────────────────────────────────────────────────────

    pub fn status(&self) -> VolumeStatus {
        // Snapshot the size before touching the map lock; `size` takes the
        // data-file lock and the write path acquires the two in that order.
        let size = self.size();
        let sb = *self.super_block.read().expect("superblock lock");
        let nm = self.nm.read().expect("needle map lock");
        VolumeStatus {
            id: self.id,
            collection: self.collection.clone(),
            size,
            file_count: nm.file_count(),
            delete_count: nm.deleted_count(),
            deleted_byte_count: nm.deleted_size(),
            max_file_key: nm.max_file_key(),
            version: sb.version,
            ttl: sb.ttl,
            replication: sb.replica_placement,
            compact_revision: sb.compact_revision,
            read_only: self.is_read_only(),
        }
    }

    pub fn sync_status(&self) -> VolumeSyncStatus {
        // One lock at a time; never nested.
        let tail_offset = self.size();
        let idx_file_size = self.index_file_size();
        let sb = *self.super_block.read().expect("superblock lock");
        VolumeSyncStatus {
            volume_id: self.id,
            collection: self.collection.clone(),
            tail_offset,
            idx_file_size,
            compact_revision: sb.compact_revision,
            ttl: sb.ttl,
            replication: sb.replica_placement,
        }
    }
}

pub(crate) fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
