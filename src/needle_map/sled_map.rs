//! Sled-backed needle map — the on-disk variant.
//!
//! Keys are the 8 big-endian bytes of the needle id; values are 8 bytes,
//! `PaddedOffset(4) | Size(4)`.  The tree lives at `<volume>.ldb/`.
//!
//! # Freshness
//! The tree is a cache of the `.idx` journal.  Its directory carries a
//! `LOG` marker file holding the big-endian byte length of the journal
//! prefix the tree has applied; the marker is rewritten after a rebuild
//! and on clean close.  On open, a missing marker or one that disagrees
//! with the current journal length forces a rebuild by replay — file
//! mtimes are never consulted, so a clock step cannot fake freshness.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder};
use log::{debug, info};

use crate::error::Result;
use crate::index::{walk_index_file, IndexFile};
use crate::types::{
    put_needle_id, NeedleId, Offset, NEEDLE_ID_SIZE, OFFSET_SIZE, SIZE_SIZE,
    TOMBSTONE_FILE_SIZE,
};

use super::{IndexValue, MapMetrics, NeedleMapper, NeedleValue};

const MARKER_FILE: &str = "LOG";

pub struct SledNeedleMap {
    db: sled::Db,
    ldb_path: PathBuf,
    index: IndexFile,
    metrics: MapMetrics,
}

fn key_bytes(key: NeedleId) -> [u8; NEEDLE_ID_SIZE] {
    let mut b = [0u8; NEEDLE_ID_SIZE];
    put_needle_id(&mut b, key);
    b
}

fn value_bytes(value: NeedleValue) -> [u8; OFFSET_SIZE + SIZE_SIZE] {
    let mut b = [0u8; OFFSET_SIZE + SIZE_SIZE];
    value.offset.write_to(&mut b[..OFFSET_SIZE]);
    BigEndian::write_u32(&mut b[OFFSET_SIZE..], value.size);
    b
}

fn parse_value(raw: &[u8]) -> Option<NeedleValue> {
    if raw.len() != OFFSET_SIZE + SIZE_SIZE {
        return None;
    }
    Some(NeedleValue {
        offset: Offset::read_from(&raw[..OFFSET_SIZE]),
        size: BigEndian::read_u32(&raw[OFFSET_SIZE..]),
    })
}

fn read_marker(ldb_path: &Path) -> Option<u64> {
    let raw = fs::read(ldb_path.join(MARKER_FILE)).ok()?;
    if raw.len() != 8 {
        return None;
    }
    Some(BigEndian::read_u64(&raw))
}

fn write_marker(ldb_path: &Path, applied_len: u64) -> Result<()> {
    let mut b = [0u8; 8];
    BigEndian::write_u64(&mut b, applied_len);
    fs::write(ldb_path.join(MARKER_FILE), b)?;
    Ok(())
}

impl SledNeedleMap {
    pub fn open(ldb_path: &Path, idx_path: &Path) -> Result<SledNeedleMap> {
        let index = IndexFile::open(idx_path)?;
        let fresh = read_marker(ldb_path) == Some(index.size());
        let db = sled::open(ldb_path)?;
        if !fresh {
            info!(
                "rebuilding {} from {} ({} bytes)",
                ldb_path.display(),
                idx_path.display(),
                index.size()
            );
            db.clear()?;
        }

        // One walk serves both purposes: the metrics always come from the
        // journal, and a stale tree is repopulated in the same pass.  The
        // scratch map supplies the previous value per key so overwrite and
        // delete accounting matches the in-memory backends.
        let mut metrics = MapMetrics::default();
        let mut scratch: BTreeMap<NeedleId, NeedleValue> = BTreeMap::new();
        walk_index_file(index.file(), |key, offset, size| {
            metrics.note_key(key);
            match IndexValue::from_raw(offset, size) {
                IndexValue::Live { offset, size } => {
                    let value = NeedleValue { offset, size };
                    let old = scratch.insert(key, value);
                    metrics.log_put(key, old, size);
                    if !fresh {
                        db.insert(key_bytes(key), &value_bytes(value)[..])?;
                    }
                }
                IndexValue::Tombstone { .. } => {
                    let old = scratch.remove(&key);
                    metrics.log_delete(old);
                    if !fresh {
                        db.remove(key_bytes(key))?;
                    }
                }
            }
            Ok(())
        })?;

        if !fresh {
            db.flush()?;
            write_marker(ldb_path, index.size())?;
            info!("rebuilt {}: {} live entries", ldb_path.display(), metrics.file_count());
        } else {
            debug!("{} is fresh, skipping rebuild", ldb_path.display());
        }

        Ok(SledNeedleMap { db, ldb_path: ldb_path.to_owned(), index, metrics })
    }
}

impl NeedleMapper for SledNeedleMap {
    fn put(&mut self, key: NeedleId, offset: Offset, size: u32) -> Result<()> {
        let old = self.get(key);
        self.index.append(key, offset, size)?;
        self.db
            .insert(key_bytes(key), &value_bytes(NeedleValue { offset, size })[..])?;
        self.metrics.log_put(key, old, size);
        Ok(())
    }

    fn get(&self, key: NeedleId) -> Option<NeedleValue> {
        self.db
            .get(key_bytes(key))
            .ok()
            .flatten()
            .and_then(|raw| parse_value(&raw))
    }

    fn delete(&mut self, key: NeedleId, offset: Offset) -> Result<()> {
        let old = self.get(key);
        self.index.append(key, offset, TOMBSTONE_FILE_SIZE)?;
        self.db.remove(key_bytes(key))?;
        self.metrics.log_delete(old);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.index.flush()?;
        self.db.flush()?;
        write_marker(&self.ldb_path, self.index.size())
    }

    fn destroy(&mut self) -> Result<()> {
        self.close()?;
        fs::remove_file(self.index.path())?;
        fs::remove_dir_all(&self.ldb_path)?;
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

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn survives_reopen_without_rebuild() {
        let dir = tempdir().unwrap();
        let ldb = dir.path().join("5.ldb");
        let idx = dir.path().join("5.idx");
        {
            let mut m = SledNeedleMap::open(&ldb, &idx).unwrap();
            m.put(1, Offset::from_actual(8), 100).unwrap();
            m.put(2, Offset::from_actual(128), 200).unwrap();
            m.close().unwrap();
        }
        let m = SledNeedleMap::open(&ldb, &idx).unwrap();
        assert_eq!(m.get(1).unwrap().size, 100);
        assert_eq!(m.file_count(), 2);
    }

    #[test]
    fn missing_marker_forces_rebuild() {
        let dir = tempdir().unwrap();
        let ldb = dir.path().join("6.ldb");
        let idx = dir.path().join("6.idx");
        {
            let mut m = SledNeedleMap::open(&ldb, &idx).unwrap();
            m.put(1, Offset::from_actual(8), 100).unwrap();
            m.delete(1, Offset::from_actual(128)).unwrap();
            m.put(2, Offset::from_actual(192), 50).unwrap();
            m.close().unwrap();
        }
        fs::remove_file(ldb.join(MARKER_FILE)).unwrap();
        let m = SledNeedleMap::open(&ldb, &idx).unwrap();
        assert!(m.get(1).is_none());
        assert_eq!(m.get(2).unwrap().size, 50);
        assert_eq!(m.file_count(), 1);
        assert_eq!(m.deleted_count(), 1);
        // Rebuild restored the marker.
        assert_eq!(read_marker(&ldb), Some(m.index_file_size()));
    }
}
