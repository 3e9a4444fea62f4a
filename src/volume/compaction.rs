//! Compaction — rewrite a volume keeping only its live needles.
//!
//! Runs to sibling files (`.cpd`/`.cpx`) and swaps them in atomically, so
//! a crash mid-compaction leaves the live volume untouched and at most a
//! pair of stale siblings to delete.  The copy preserves each needle's
//! cookie, data, flags, attributes, and append timestamp; only the offsets
//! change.  The new superblock carries `compact_revision + 1` (wrapping at
//! 2^16) — followers compare revisions and fall back to a full copy when
//! theirs no longer matches.
//!
//! Writers are excluded for the duration: the copy and the swap hold the
//! volume's data-file write lock, and `close`/`destroy` wait on the
//! maintenance barrier taken here.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::sync::atomic::Ordering;

use log::info;

use crate::error::Result;
use crate::index::IndexFile;
use crate::needle::Needle;
use crate::needle_map::open_needle_map;
use crate::scan::{scan_data_file_from, VolumeFileScanner};
use crate::superblock::{SuperBlock, SUPER_BLOCK_SIZE};
use crate::types::Offset;

use super::{now_secs, Volume};

impl Volume {
    /// Compact the volume in place (copy live needles, swap, reload map).
    pub fn compact(&self) -> Result<()> {
        let _maintenance = self.maintenance.lock().expect("maintenance lock");
        let mut data_file = self.data_file.write().expect("data file lock");
        let mut nm = self.nm.write().expect("needle map lock");

        let base = self.base_name();
        let cpd_path = base.with_extension("cpd");
        let cpx_path = base.with_extension("cpx");

        let old_revision = self.super_block.read().expect("superblock lock").compact_revision;
        let new_revision = old_revision.wrapping_add(1);

        // Leftovers of a compaction that never committed.
        if cpx_path.exists() {
            fs::remove_file(&cpx_path)?;
        }

        // 1. Copy live needles in insertion order into the siblings.
        {
            let mut new_super = *self.super_block.read().expect("superblock lock");
            new_super.compact_revision = new_revision;

            let mut cpd = File::create(&cpd_path)?;
            cpd.write_all(&new_super.bytes())?;
            let mut cpx = IndexFile::open(&cpx_path)?;

            let mut copier = CompactionCopier {
                nm: nm.as_ref(),
                cpd: &mut cpd,
                cpx: &mut cpx,
                super_block: new_super,
                copied: 0,
            };
            scan_data_file_from(
                self.version,
                &data_file,
                SUPER_BLOCK_SIZE as u64,
                &mut copier,
            )?;
            let copied = copier.copied;
            cpd.sync_all()?;
            cpx.flush()?;
            info!(
                "volume {}: compacted {} live needles into {}",
                self.id,
                copied,
                cpd_path.display()
            );
        }

        // 2. Swap.  Renames are atomic; the data file handle is replaced
        //    under the write lock, and the needle map is reloaded from the
        //    renamed index (a stale sled tree rebuilds itself from it).
        nm.close()?;
        fs::rename(&cpd_path, base.with_extension("dat"))?;
        fs::rename(&cpx_path, base.with_extension("idx"))?;

        *data_file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(base.with_extension("dat"))?;
        *nm = open_needle_map(self.needle_map_kind, &base)?;
        self.super_block.write().expect("superblock lock").compact_revision = new_revision;
        self.last_modified_time.store(now_secs(), Ordering::Release);

        info!(
            "volume {}: compaction committed, revision {} -> {}",
            self.id, old_revision, new_revision
        );
        Ok(())
    }
}

/// Visitor that appends every still-live needle to the sibling files.
/// A record is live when the map points exactly at it — anything else is
/// an overwritten copy, a deleted body, or a deletion marker.
struct CompactionCopier<'a> {
    nm: &'a dyn crate::needle_map::NeedleMapper,
    cpd: &'a mut File,
    cpx: &'a mut IndexFile,
    super_block: SuperBlock,
    copied: u64,
}

impl VolumeFileScanner for CompactionCopier<'_> {
    fn visit_super_block(&mut self, _super_block: &SuperBlock) -> Result<()> {
        Ok(())
    }

    fn read_needle_body(&self) -> bool {
        true
    }

    fn visit_needle(&mut self, needle: &Needle, offset: u64) -> Result<()> {
        let live = self
            .nm
            .get(needle.id)
            .map(|nv| nv.offset.to_actual() == offset && nv.size == needle.size)
            .unwrap_or(false);
        if !live {
            return Ok(());
        }
        let mut copy = needle.clone();
        let (new_offset, _, _) = copy.append(self.cpd, self.super_block.version)?;
        self.cpx
            .append(copy.id, Offset::from_actual(new_offset), copy.size)?;
        self.copied += 1;
        Ok(())
    }
}
