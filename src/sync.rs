//! Follow wire protocol — blocking TCP, one stream per follow.
//!
//! # Request (18 bytes, big-endian)
//!
//! ```text
//! Offset  Size  Field
//!    0      4   magic             0x564F4C46 ("VOLF")
//!    4      4   volume_id
//!    8      8   since_ns          follower's newest append timestamp
//!   16      2   compact_revision  follower's revision
//! ```
//!
//! # Response
//!
//! One status byte: 0 ok, 1 volume not found, 2 revision mismatch (the
//! leader's revision follows as a BE u16), 3 internal error.  On ok the
//! tail bytes follow as length-prefixed chunks (`BE u32` length, then the
//! payload; a zero length terminates the stream).  Chunk boundaries are
//! arbitrary — they never align with needle records.  After a terminator
//! or a non-ok status the connection is back in its idle state and can
//! carry another request, which is what makes pooling worthwhile.
//!
//! The pool hands out one connection per follow; the checked-out handle's
//! scope is exactly one stream, and it returns to the idle set only after
//! a clean end.  Anything that dies mid-stream is dropped, not reused.

use std::collections::HashMap;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;

use byteorder::{BigEndian, ByteOrder};
use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::store::Store;
use crate::types::VolumeId;

pub const FOLLOW_MAGIC: u32 = 0x564F_4C46; // "VOLF"
pub const FOLLOW_REQUEST_SIZE: usize = 18;

const STATUS_OK: u8 = 0;
const STATUS_NOT_FOUND: u8 = 1;
const STATUS_REVISION_MISMATCH: u8 = 2;
const STATUS_INTERNAL: u8 = 3;

const CHUNK_SIZE: usize = 64 * 1024;

// ── Request codec ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FollowRequest {
    pub volume_id: VolumeId,
    pub since_ns: u64,
    pub compact_revision: u16,
}

impl FollowRequest {
    pub fn encode(&self) -> [u8; FOLLOW_REQUEST_SIZE] {
        let mut buf = [0u8; FOLLOW_REQUEST_SIZE];
        BigEndian::write_u32(&mut buf[0..4], FOLLOW_MAGIC);
        BigEndian::write_u32(&mut buf[4..8], self.volume_id);
        BigEndian::write_u64(&mut buf[8..16], self.since_ns);
        BigEndian::write_u16(&mut buf[16..18], self.compact_revision);
        buf
    }

    pub fn decode(buf: &[u8; FOLLOW_REQUEST_SIZE]) -> io::Result<FollowRequest> {
        let magic = BigEndian::read_u32(&buf[0..4]);
        if magic != FOLLOW_MAGIC {
            return Err(io::Error::new(
                ErrorKind::InvalidData,
                format!("bad follow magic {magic:#010x}"),
            ));
        }
        Ok(FollowRequest {
            volume_id: BigEndian::read_u32(&buf[4..8]),
            since_ns: BigEndian::read_u64(&buf[8..16]),
            compact_revision: BigEndian::read_u16(&buf[16..18]),
        })
    }
}

// ── Client pool ──────────────────────────────────────────────────────────────

/// Connections to leader volume servers, keyed by address.
#[derive(Default)]
pub struct ClientPool {
    idle: Mutex<HashMap<String, Vec<TcpStream>>>,
}

impl ClientPool {
    pub fn new() -> ClientPool {
        ClientPool::default()
    }

    fn checkout(&self, addr: &str) -> Result<TcpStream> {
        if let Some(conn) = self
            .idle
            .lock()
            .expect("pool lock")
            .get_mut(addr)
            .and_then(Vec::pop)
        {
            debug!("reusing pooled connection to {addr}");
            return Ok(conn);
        }
        Ok(TcpStream::connect(addr)?)
    }

    fn checkin(&self, addr: &str, conn: TcpStream) {
        self.idle
            .lock()
            .expect("pool lock")
            .entry(addr.to_owned())
            .or_default()
            .push(conn);
    }

    /// Open one follow stream.  The returned handle reads the leader's raw
    /// tail bytes; when the stream ends cleanly the connection goes back to
    /// the idle set.
    pub fn volume_follow(
        &self,
        addr: &str,
        volume_id: VolumeId,
        since_ns: u64,
        compact_revision: u16,
    ) -> Result<FollowStream<'_>> {
        let mut conn = self.checkout(addr)?;
        let req = FollowRequest { volume_id, since_ns, compact_revision };
        conn.write_all(&req.encode())?;
        conn.flush()?;

        let mut status = [0u8; 1];
        conn.read_exact(&mut status)?;
        match status[0] {
            STATUS_OK => Ok(FollowStream {
                pool: self,
                addr: addr.to_owned(),
                conn: Some(conn),
                remaining: 0,
                done: false,
            }),
            STATUS_NOT_FOUND => {
                self.checkin(addr, conn);
                Err(Error::VolumeNotFound(volume_id))
            }
            STATUS_REVISION_MISMATCH => {
                let mut rev = [0u8; 2];
                conn.read_exact(&mut rev)?;
                self.checkin(addr, conn);
                Err(Error::FollowMismatch {
                    local: compact_revision,
                    remote: BigEndian::read_u16(&rev),
                })
            }
            other => Err(Error::FollowRejected(format!(
                "leader {addr} answered status {other}"
            ))),
        }
    }
}

/// Reader over one follow stream's chunked payload.
pub struct FollowStream<'a> {
    pool: &'a ClientPool,
    addr: String,
    conn: Option<TcpStream>,
    remaining: usize,
    done: bool,
}

impl Read for FollowStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.done || buf.is_empty() {
            return Ok(0);
        }
        if self.remaining == 0 {
            let conn = self.conn.as_mut().ok_or_else(|| {
                io::Error::new(ErrorKind::NotConnected, "stream already finished")
            })?;
            let mut len = [0u8; 4];
            conn.read_exact(&mut len)?;
            let len = BigEndian::read_u32(&len) as usize;
            if len == 0 {
                self.done = true;
                if let Some(conn) = self.conn.take() {
                    self.pool.checkin(&self.addr, conn);
                }
                return Ok(0);
            }
            self.remaining = len;
        }
        let conn = self.conn.as_mut().ok_or_else(|| {
            io::Error::new(ErrorKind::NotConnected, "stream already finished")
        })?;
        let want = buf.len().min(self.remaining);
        let n = conn.read(&mut buf[..want])?;
        if n == 0 {
            return Err(io::Error::new(
                ErrorKind::UnexpectedEof,
                "leader closed mid-chunk",
            ));
        }
        self.remaining -= n;
        Ok(n)
    }
}

// ── Server side ──────────────────────────────────────────────────────────────

/// Length-prefix framing over the raw socket; `finish` writes the
/// zero-length terminator.
struct ChunkWriter<'a> {
    conn: &'a mut TcpStream,
}

impl Write for ChunkWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let take = buf.len().min(CHUNK_SIZE);
        let mut len = [0u8; 4];
        BigEndian::write_u32(&mut len, take as u32);
        self.conn.write_all(&len)?;
        self.conn.write_all(&buf[..take])?;
        Ok(take)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.conn.flush()
    }
}

impl ChunkWriter<'_> {
    fn finish(&mut self) -> io::Result<()> {
        self.conn.write_all(&[0u8; 4])?;
        self.conn.flush()
    }
}

/// Accept loop: one blocking thread per connection, connections carry any
/// number of sequential follow requests.
pub fn serve_follows(store: Arc<Store>, listener: TcpListener) -> io::Result<()> {
    info!("follow listener on {}", listener.local_addr()?);
    for conn in listener.incoming() {
        let conn = conn?;
        let store = Arc::clone(&store);
        thread::spawn(move || {
            let peer = conn
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "?".to_owned());
            if let Err(e) = serve_connection(&store, conn) {
                // An EOF just means the follower hung up between requests.
                if e.kind() != ErrorKind::UnexpectedEof {
                    warn!("follow connection from {peer}: {e}");
                }
            }
        });
    }
    Ok(())
}

fn serve_connection(store: &Store, mut conn: TcpStream) -> io::Result<()> {
    loop {
        let mut raw = [0u8; FOLLOW_REQUEST_SIZE];
        conn.read_exact(&mut raw)?;
        let req = FollowRequest::decode(&raw)?;

        let Some(volume) = store.volume(req.volume_id) else {
            conn.write_all(&[STATUS_NOT_FOUND])?;
            continue;
        };
        let leader_revision = volume.compact_revision();
        if leader_revision != req.compact_revision {
            let mut resp = [STATUS_REVISION_MISMATCH, 0, 0];
            BigEndian::write_u16(&mut resp[1..], leader_revision);
            conn.write_all(&resp)?;
            continue;
        }

        // Locate the boundary before committing to a stream, so a search
        // failure can still be reported in-band.
        let start = match volume.tail_start(req.since_ns) {
            Ok(start) => start,
            Err(e) => {
                warn!("volume {}: tail search failed: {e}", req.volume_id);
                conn.write_all(&[STATUS_INTERNAL])?;
                continue;
            }
        };

        conn.write_all(&[STATUS_OK])?;
        let sent = match start {
            None => 0,
            Some(start) => {
                let mut sink = ChunkWriter { conn: &mut conn };
                match volume.stream_tail(start, &mut sink) {
                    Ok(sent) => sent,
                    Err(e) => {
                        // Mid-stream failure: no in-band signal left, so
                        // drop the connection; the follower sees a missing
                        // terminator and rolls back.
                        warn!("volume {}: tail stream failed: {e}", req.volume_id);
                        return Err(io::Error::new(ErrorKind::Other, e.to_string()));
                    }
                }
            }
        };
        ChunkWriter { conn: &mut conn }.finish()?;
        debug!(
            "volume {}: streamed {} tail bytes since {}",
            req.volume_id, sent, req.since_ns
        );
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> io::Error {
        match e {
            Error::Io(io) => io,
            other => io::Error::new(ErrorKind::Other, other.to_string()),
        }
    }
}
