//! # volstore — append-only needle/volume blob storage engine
//!
//! Format guarantees (frozen):
//! - All multi-byte integers on disk are big-endian; never negotiated
//! - Every record is zero-padded to an 8-byte boundary; offsets are stored
//!   as 32-bit padded offsets (`actual / 8`), and `Offset(0)` means absent
//! - Every data-carrying record ends in a mandatory CRC32 of its data;
//!   corrupt records abort reads and scans
//! - The `.idx` journal is append-only and always written before the
//!   lookup structure it feeds — crash recovery is a pure replay
//! - `.dat` appends precede their `.idx` entries; a crash between the two
//!   leaks bytes that the replay never references
//! - v3 records carry an append-nanosecond timestamp, binary-searchable
//!   through the index — the follower replication checkpoint
//! - The superblock's compact revision increments on every compaction;
//!   followers with a different revision must full-copy, never follow

pub mod error;
pub mod types;
pub mod ttl;
pub mod superblock;
pub mod needle;
pub mod index;
pub mod needle_map;
pub mod scan;
pub mod volume;
pub mod sync;
pub mod store;

// Flat re-exports for the most common types.
pub use error::{Error, Result};
pub use types::{Cookie, FileId, NeedleId, Offset, VolumeId, TOMBSTONE_FILE_SIZE};
pub use ttl::Ttl;
pub use superblock::{ReplicaPlacement, SuperBlock, Version, CURRENT_VERSION};
pub use needle::Needle;
pub use needle_map::{NeedleMapKind, NeedleMapper, NeedleValue};
pub use scan::{RebuildIndexScanner, VolumeFileScanner};
pub use volume::{Volume, VolumeStatus, VolumeSyncStatus};
pub use sync::ClientPool;
pub use store::{Store, StoreOptions};
