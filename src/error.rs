//! Engine-level error type.
//!
//! One enum for the whole engine.  The codec layer surfaces every failure;
//! the volume layer rolls back partial `.dat` appends via truncate before
//! propagating.  Nothing in the engine retries I/O — retry policy belongs
//! to the caller (the replication supervisor for follows, the HTTP layer
//! for reads and writes).

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Needle id absent from the map, or the on-disk record's size field
    /// disagrees with the index entry that pointed at it.
    #[error("needle not found")]
    NotFound,

    /// CRC mismatch, unparseable record, or an index file whose size is not
    /// a multiple of the entry size.  `offset` is the byte position of the
    /// offending record in its file (0 when not applicable).
    #[error("corrupted data at offset {offset}: {reason}")]
    Corrupted { offset: u64, reason: String },

    #[error("unsupported volume version {0}")]
    UnsupportedVersion(u8),

    /// The follower's compact revision trails the leader's; incremental
    /// follow is impossible and the caller must escalate to a full copy.
    #[error("compact revision mismatch: local {local}, remote {remote}")]
    FollowMismatch { local: u16, remote: u16 },

    /// Remote side refused or aborted a follow stream.
    #[error("follow stream rejected: {0}")]
    FollowRejected(String),

    #[error("volume {0} is not mounted")]
    VolumeNotFound(u32),

    #[error("volume {0} is read-only")]
    ReadOnly(u32),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("needle map backend: {0}")]
    Map(#[from] sled::Error),

    #[error("status serialisation: {0}")]
    Serde(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn corrupted(offset: u64, reason: impl Into<String>) -> Self {
        Error::Corrupted { offset, reason: reason.into() }
    }
}
