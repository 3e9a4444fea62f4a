//! In-memory needle maps (compact or btree) over the `.idx` journal.
//!
//! Loading replays the journal front to back: live entries install into
//! the structure, tombstones remove, and the metrics are rebuilt along the
//! way so a reloaded volume reports the same counters as the session that
//! wrote the journal.

use std::collections::BTreeMap;
use std::path::Path;

use log::{debug, info};

use crate::error::Result;
use crate::index::{walk_index_file, IndexFile};
use crate::types::{NeedleId, Offset, TOMBSTONE_FILE_SIZE};

use super::{CompactMap, IndexValue, MapMetrics, NeedleMapper, NeedleValue};

enum Lookup {
    Compact(CompactMap),
    Btree(BTreeMap<NeedleId, NeedleValue>),
}

impl Lookup {
    fn set(&mut self, key: NeedleId, value: NeedleValue) -> Option<NeedleValue> {
        match self {
            Lookup::Compact(m) => m.set(key, value.offset, value.size),
            Lookup::Btree(m) => m.insert(key, value),
        }
    }

    fn get(&self, key: NeedleId) -> Option<NeedleValue> {
        match self {
            Lookup::Compact(m) => m.get(key),
            Lookup::Btree(m) => m.get(&key).copied(),
        }
    }

    fn remove(&mut self, key: NeedleId) -> Option<NeedleValue> {
        match self {
            Lookup::Compact(m) => m.remove(key),
            Lookup::Btree(m) => m.remove(&key),
        }
    }
}

pub struct MemoryNeedleMap {
    lookup: Lookup,
    index: IndexFile,
    metrics: MapMetrics,
}

impl MemoryNeedleMap {
    pub fn load_compact(idx_path: &Path) -> Result<MemoryNeedleMap> {
        Self::load(Lookup::Compact(CompactMap::new()), idx_path)
    }

    pub fn load_btree(idx_path: &Path) -> Result<MemoryNeedleMap> {
        Self::load(Lookup::Btree(BTreeMap::new()), idx_path)
    }

    fn load(mut lookup: Lookup, idx_path: &Path) -> Result<MemoryNeedleMap> {
        let index = IndexFile::open(idx_path)?;
        let mut metrics = MapMetrics::default();
        walk_index_file(index.file(), |key, offset, size| {
            metrics.note_key(key);
            match IndexValue::from_raw(offset, size) {
                IndexValue::Live { offset, size } => {
                    let old = lookup.set(key, NeedleValue { offset, size });
                    metrics.log_put(key, old, size);
                }
                IndexValue::Tombstone { .. } => {
                    let old = lookup.remove(key);
                    metrics.log_delete(old);
                }
            }
            Ok(())
        })?;
        info!(
            "loaded needle map from {}: {} live, max key {}",
            idx_path.display(),
            metrics.file_count(),
            metrics.max_file_key()
        );
        Ok(MemoryNeedleMap { lookup, index, metrics })
    }
}

impl NeedleMapper for MemoryNeedleMap {
    fn put(&mut self, key: NeedleId, offset: Offset, size: u32) -> Result<()> {
        self.index.append(key, offset, size)?;
        let old = self.lookup.set(key, NeedleValue { offset, size });
        self.metrics.log_put(key, old, size);
        Ok(())
    }

    fn get(&self, key: NeedleId) -> Option<NeedleValue> {
        self.lookup.get(key)
    }

    fn delete(&mut self, key: NeedleId, offset: Offset) -> Result<()> {
        self.index.append(key, offset, TOMBSTONE_FILE_SIZE)?;
        let old = self.lookup.remove(key);
        self.metrics.log_delete(old);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.index.flush()
    }

    fn destroy(&mut self) -> Result<()> {
        self.index.flush()?;
        let path = self.index.path().to_owned();
        debug!("unlinking {}", path.display());
        std::fs::remove_file(path)?;
        Ok(())
    }

    fn file_count(&self) -> u64 {
        self.metrics.file_count()
    }
    fn deleted_count(&self) -> u64 {
        self.metrics.deleted_count()
    }
    fn deleted_size(&self) -> u64 {
        self.metrics.deleted_size()
    }
    fn content_size(&self) -> u64 {
        self.metrics.content_size()
    }
    fn max_file_key(&self) -> NeedleId {
        self.metrics.max_file_key()
    }
    fn index_file_size(&self) -> u64 {
        self.index.size()
    }
}
