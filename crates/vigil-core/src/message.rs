//! Peer message payloads — the unit handed to and received from a channel.
//!
//! A message is written exactly once (streamed in from a socket or built by
//! the poll layer) and read exactly once (streamed out to a socket or handed
//! to a handler). Small messages live in memory; messages at or above the
//! configured spill threshold are backed by a temp file chosen at creation
//! time from the estimated size, never by inspecting the payload later.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::{Duration, Instant, SystemTime};

use tempfile::NamedTempFile;

use crate::identity::PeerIdentity;

/// Default cap on delivery attempts for a requeued message.
pub const DEFAULT_RETRY_MAX: u32 = 3;

enum Backing {
    Memory(Vec<u8>),
    File(NamedTempFile),
}

/// A protocol-tagged payload with a single-write/single-read contract.
pub struct PeerMessage {
    protocol: u32,
    sender: Option<PeerIdentity>,
    backing: Backing,
    size: u64,
    written: bool,
    read: bool,

    // Redelivery bookkeeping, consulted by the channel manager when a
    // channel dies with this message still queued.
    requeueable: bool,
    expiration: Option<SystemTime>,
    retry_count: u32,
    retry_max: u32,
    last_retry: Option<Instant>,
    retry_interval: Option<Duration>,
}

impl PeerMessage {
    /// Memory-backed message, for payloads known to be small.
    pub fn memory(protocol: u32) -> Self {
        Self::with_backing(protocol, Backing::Memory(Vec::new()))
    }

    /// Choose the backing store from the estimated payload size: memory
    /// below `spill_threshold`, a temp file in `spill_dir` otherwise.
    pub fn with_estimated_size(
        protocol: u32,
        estimated: u64,
        spill_threshold: u64,
        spill_dir: &Path,
    ) -> io::Result<Self> {
        let backing = if estimated >= spill_threshold {
            Backing::File(NamedTempFile::new_in(spill_dir)?)
        } else {
            Backing::Memory(Vec::with_capacity(estimated as usize))
        };
        Ok(Self::with_backing(protocol, backing))
    }

    /// Memory-backed message pre-filled with `data` and sealed.
    pub fn from_bytes(protocol: u32, data: &[u8]) -> Self {
        let mut msg = Self::with_backing(protocol, Backing::Memory(data.to_vec()));
        msg.size = data.len() as u64;
        msg.written = true;
        msg
    }

    fn with_backing(protocol: u32, backing: Backing) -> Self {
        PeerMessage {
            protocol,
            sender: None,
            backing,
            size: 0,
            written: false,
            read: false,
            requeueable: true,
            expiration: None,
            retry_count: 0,
            retry_max: DEFAULT_RETRY_MAX,
            last_retry: None,
            retry_interval: None,
        }
    }

    // ── Write side ────────────────────────────────────────────────────────

    /// Append payload bytes. Fails once the message has been sealed.
    pub fn append(&mut self, chunk: &[u8]) -> Result<(), MessageError> {
        if self.written {
            return Err(MessageError::AlreadyWritten);
        }
        match &mut self.backing {
            Backing::Memory(buf) => buf.extend_from_slice(chunk),
            Backing::File(file) => file.as_file_mut().write_all(chunk)?,
        }
        self.size += chunk.len() as u64;
        Ok(())
    }

    /// Seal the payload. After this the message is readable exactly once.
    pub fn finish(&mut self) -> Result<(), MessageError> {
        if self.written {
            return Err(MessageError::AlreadyWritten);
        }
        if let Backing::File(file) = &mut self.backing {
            file.as_file_mut().flush()?;
        }
        self.written = true;
        Ok(())
    }

    // ── Read side ─────────────────────────────────────────────────────────

    /// The payload reader. Obtainable exactly once, and only after the
    /// message has been sealed.
    pub fn reader(&mut self) -> Result<MessageReader<'_>, MessageError> {
        if !self.written {
            return Err(MessageError::NotWritten);
        }
        if self.read {
            return Err(MessageError::AlreadyRead);
        }
        self.read = true;
        match &mut self.backing {
            Backing::Memory(buf) => Ok(MessageReader::Memory(io::Cursor::new(&buf[..]))),
            Backing::File(file) => {
                file.as_file_mut().seek(SeekFrom::Start(0))?;
                Ok(MessageReader::File(file.as_file_mut()))
            }
        }
    }

    /// Re-arm a sealed message for another delivery attempt after a
    /// failed write. The read-once contract applies per attempt.
    pub fn rewind(&mut self) {
        self.read = false;
    }

    /// Release backing storage immediately. Equivalent to dropping, but
    /// explicit at call sites where a message dies before delivery.
    pub fn delete(self) {}

    // ── Accessors ─────────────────────────────────────────────────────────

    pub fn protocol(&self) -> u32 {
        self.protocol
    }

    pub fn data_size(&self) -> u64 {
        self.size
    }

    pub fn sender(&self) -> Option<&PeerIdentity> {
        self.sender.as_ref()
    }

    pub fn set_sender(&mut self, sender: PeerIdentity) {
        self.sender = Some(sender);
    }

    pub fn is_file_backed(&self) -> bool {
        matches!(self.backing, Backing::File(_))
    }

    // ── Redelivery bookkeeping ────────────────────────────────────────────

    pub fn is_requeueable(&self) -> bool {
        self.requeueable
    }

    pub fn set_requeueable(&mut self, requeueable: bool) {
        self.requeueable = requeueable;
    }

    pub fn set_expiration(&mut self, at: SystemTime) {
        self.expiration = Some(at);
    }

    pub fn is_expired(&self) -> bool {
        match self.expiration {
            Some(at) => SystemTime::now() >= at,
            None => false,
        }
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn retries_left(&self) -> bool {
        self.retry_count < self.retry_max
    }

    pub fn incr_retry_count(&mut self) {
        self.retry_count += 1;
    }

    pub fn note_retry(&mut self) {
        self.last_retry = Some(Instant::now());
    }

    pub fn last_retry(&self) -> Option<Instant> {
        self.last_retry
    }

    pub fn retry_interval(&self) -> Option<Duration> {
        self.retry_interval
    }

    pub fn set_retry_interval(&mut self, interval: Duration) {
        self.retry_interval = Some(interval);
    }
}

impl std::fmt::Debug for PeerMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerMessage")
            .field("protocol", &self.protocol)
            .field("size", &self.size)
            .field("file_backed", &self.is_file_backed())
            .field("sender", &self.sender.as_ref().map(|s| s.key().to_string()))
            .finish()
    }
}

/// Reader over a sealed message payload.
pub enum MessageReader<'a> {
    Memory(io::Cursor<&'a [u8]>),
    File(&'a mut std::fs::File),
}

impl Read for MessageReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            MessageReader::Memory(cursor) => cursor.read(buf),
            MessageReader::File(file) => file.read(buf),
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("message payload already written")]
    AlreadyWritten,

    #[error("message payload not yet written")]
    NotWritten,

    #[error("message payload already consumed")]
    AlreadyRead,

    #[error(transparent)]
    Io(#[from] io::Error),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
