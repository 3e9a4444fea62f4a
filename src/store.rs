//! Store — the engine surface: many volumes, one directory.
//!
//! The store owns `VolumeId → Volume`; operations on distinct volumes are
//! fully parallel and share no locks (the store's own map lock is held
//! only to resolve the id).  This is the interface the HTTP and RPC layers
//! consume: allocate/mount/unmount/delete volumes, read/write/delete
//! needles, follow a leader, and report status.

use std::collections::HashMap;
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use log::info;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::needle::Needle;
use crate::needle_map::NeedleMapKind;
use crate::superblock::ReplicaPlacement;
use crate::sync::{serve_follows, ClientPool};
use crate::ttl::Ttl;
use crate::types::{NeedleId, VolumeId};
use crate::volume::{volume_base_name, Volume, VolumeStatus};

/// Store configuration, loadable from JSON by the CLI.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreOptions {
    pub dir: PathBuf,
    #[serde(default)]
    pub needle_map_kind: Option<String>,
    /// Caps volume growth and arms TTL expiry; 0 means "not yet known".
    #[serde(default)]
    pub volume_size_limit: u64,
}

pub struct Store {
    dir: PathBuf,
    needle_map_kind: NeedleMapKind,
    volume_size_limit: u64,
    volumes: RwLock<HashMap<VolumeId, Arc<Volume>>>,
    pool: ClientPool,
}

impl Store {
    pub fn new(options: StoreOptions) -> Result<Store> {
        let kind = match options.needle_map_kind.as_deref() {
            None => NeedleMapKind::default(),
            Some(name) => NeedleMapKind::from_name(name).ok_or_else(|| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("unknown needle map kind {name:?}"),
                ))
            })?,
        };
        std::fs::create_dir_all(&options.dir)?;
        Ok(Store {
            dir: options.dir,
            needle_map_kind: kind,
            volume_size_limit: options.volume_size_limit,
            volumes: RwLock::new(HashMap::new()),
            pool: ClientPool::new(),
        })
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    pub fn volume(&self, id: VolumeId) -> Option<Arc<Volume>> {
        self.volumes.read().expect("volumes lock").get(&id).cloned()
    }

    fn require(&self, id: VolumeId) -> Result<Arc<Volume>> {
        self.volume(id).ok_or(Error::VolumeNotFound(id))
    }

    // ── Volume lifecycle ─────────────────────────────────────────────────────

    /// Create and mount a new volume.  Fails when the id is already mounted
    /// or its files already exist.
    pub fn allocate_volume(
        &self,
        id: VolumeId,
        collection: &str,
        replica_placement: ReplicaPlacement,
        ttl: Ttl,
        preallocate: u64,
    ) -> Result<()> {
        let dat = volume_base_name(&self.dir, collection, id).with_extension("dat");
        if dat.exists() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("volume file {} already exists", dat.display()),
            )));
        }
        let volume = Volume::open(
            &self.dir,
            collection,
            id,
            self.needle_map_kind,
            Some(replica_placement),
            Some(ttl),
            preallocate,
        )?;
        self.insert(id, volume)
    }

    /// Load an existing volume from disk and make it servable.
    pub fn mount_volume(&self, id: VolumeId, collection: &str) -> Result<()> {
        let dat = volume_base_name(&self.dir, collection, id).with_extension("dat");
        if !dat.exists() {
            return Err(Error::VolumeNotFound(id));
        }
        let volume =
            Volume::open(&self.dir, collection, id, self.needle_map_kind, None, None, 0)?;
        self.insert(id, volume)
    }

    fn insert(&self, id: VolumeId, volume: Volume) -> Result<()> {
        let mut volumes = self.volumes.write().expect("volumes lock");
        if volumes.contains_key(&id) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("volume {id} is already mounted"),
            )));
        }
        volumes.insert(id, Arc::new(volume));
        Ok(())
    }

    /// Flush and stop serving the volume; its files stay on disk.
    pub fn unmount_volume(&self, id: VolumeId) -> Result<()> {
        let volume = {
            self.volumes
                .write()
                .expect("volumes lock")
                .remove(&id)
                .ok_or(Error::VolumeNotFound(id))?
        };
        volume.close()?;
        info!("unmounted volume {id}");
        Ok(())
    }

    /// Unmount and unlink the volume's files.
    pub fn delete_volume(&self, id: VolumeId) -> Result<()> {
        let volume = {
            self.volumes
                .write()
                .expect("volumes lock")
                .remove(&id)
                .ok_or(Error::VolumeNotFound(id))?
        };
        volume.destroy()
    }

    // ── Needle operations ────────────────────────────────────────────────────

    pub fn write(&self, id: VolumeId, needle: &mut Needle) -> Result<u32> {
        let volume = self.require(id)?;
        if self.volume_size_limit > 0 && volume.size() >= self.volume_size_limit {
            volume.set_read_only(true);
            return Err(Error::ReadOnly(id));
        }
        volume.write(needle)
    }

    pub fn read(&self, id: VolumeId, key: NeedleId) -> Result<Needle> {
        self.require(id)?.read(key)
    }

    pub fn delete(&self, id: VolumeId, key: NeedleId) -> Result<u64> {
        self.require(id)?.delete(key)
    }

    // ── Maintenance ──────────────────────────────────────────────────────────

    pub fn compact_volume(&self, id: VolumeId) -> Result<()> {
        self.require(id)?.compact()
    }

    /// Incrementally replicate the volume from `leader_addr`.
    pub fn follow(&self, id: VolumeId, leader_addr: &str) -> Result<()> {
        self.require(id)?.follow(leader_addr, &self.pool)
    }

    /// Unlink volumes whose TTL has lapsed long enough.
    pub fn purge_expired(&self, max_delay_minutes: u32) -> Result<Vec<VolumeId>> {
        let expired: Vec<VolumeId> = {
            let volumes = self.volumes.read().expect("volumes lock");
            volumes
                .values()
                .filter(|v| {
                    v.expired(self.volume_size_limit) && v.expired_long_enough(max_delay_minutes)
                })
                .map(|v| v.id())
                .collect()
        };
        for id in &expired {
            info!("volume {id} expired, deleting");
            self.delete_volume(*id)?;
        }
        Ok(expired)
    }

    pub fn status(&self) -> Vec<VolumeStatus> {
        let volumes = self.volumes.read().expect("volumes lock");
        let mut all: Vec<VolumeStatus> = volumes.values().map(|v| v.status()).collect();
        all.sort_by_key(|s| s.id);
        all
    }

    /// Serve follow streams to other stores.  Blocks the calling thread;
    /// each accepted connection gets its own.
    pub fn serve_follow(self: &Arc<Self>, listener: TcpListener) -> Result<()> {
        serve_follows(Arc::clone(self), listener)?;
        Ok(())
    }
}
