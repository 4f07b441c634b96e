//! Vigil wire formats — on-wire types for all peer communication.
//!
//! These types ARE the protocol. Every field, every offset, every sentinel
//! byte is part of the wire format; changing anything here is a breaking
//! change for every deployed cache.
//!
//! Two formats live here:
//!   * the framed stream header exchanged over peer channels, and
//!   * the datagram envelope routed over multicast/unicast UDP.
//!
//! All multi-byte integers are big-endian.

use bytes::{BufMut, Bytes, BytesMut};
use std::io::{Read, Write};

// ── Stream framing ────────────────────────────────────────────────────────────

/// Sentinel carried in the first byte of every stream message header.
/// A header that does not start with this byte aborts the channel.
pub const HEADER_CHECK: u8 = 0xE7;

/// Stream message header length: check byte, opcode, u32 payload length,
/// u32 protocol id.
pub const HEADER_LEN: usize = 10;

/// Maximum length of a peer identity key, and therefore of the payload of
/// a [`Opcode::PeerId`] message.
pub const MAX_PEERID_LEN: usize = 50;

/// Stream message opcodes.
///
/// The first message in each direction on a freshly established channel
/// must be `PeerId`; everything after that is `Data`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    PeerId = 1,
    Data = 2,
}

impl TryFrom<u8> for Opcode {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Opcode::PeerId),
            2 => Ok(Opcode::Data),
            other => Err(WireError::UnknownOpcode(other)),
        }
    }
}

/// Decoded stream message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHeader {
    pub op: Opcode,
    /// Payload length in bytes, not including this header.
    pub len: u32,
    /// Application-level multiplexing key. Not interpreted by the channel.
    pub protocol: u32,
}

impl StreamHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = HEADER_CHECK;
        buf[1] = self.op as u8;
        buf[2..6].copy_from_slice(&self.len.to_be_bytes());
        buf[6..10].copy_from_slice(&self.protocol.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8; HEADER_LEN]) -> Result<Self, WireError> {
        if buf[0] != HEADER_CHECK {
            return Err(WireError::BadCheckByte(buf[0]));
        }
        Ok(StreamHeader {
            op: Opcode::try_from(buf[1])?,
            len: u32::from_be_bytes(buf[2..6].try_into().unwrap()),
            protocol: u32::from_be_bytes(buf[6..10].try_into().unwrap()),
        })
    }
}

// ── Datagram format ───────────────────────────────────────────────────────────

/// Protocol id reserved for the audit poll envelope carried by the router.
pub const PROTOCOL_AUDIT: u32 = 1;

/// Datagram header length: u32 protocol id.
pub const DATAGRAM_HEADER_LEN: usize = 4;

/// Standard gzip magic, checked at decode time. Compression is detected by
/// content, never signalled by a flag.
pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Encode a datagram: protocol id header plus payload, gzip-wrapping the
/// whole packet when compression is on and the packet reaches `compress_min`.
pub fn encode_datagram(
    protocol: u32,
    payload: &[u8],
    compress: bool,
    compress_min: usize,
) -> Result<Vec<u8>, WireError> {
    let mut pkt = Vec::with_capacity(DATAGRAM_HEADER_LEN + payload.len());
    pkt.extend_from_slice(&protocol.to_be_bytes());
    pkt.extend_from_slice(payload);
    if compress && pkt.len() >= compress_min {
        let mut enc =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(&pkt).map_err(|_| WireError::Compress)?;
        pkt = enc.finish().map_err(|_| WireError::Compress)?;
    }
    Ok(pkt)
}

/// Decode a datagram into (protocol id, payload), transparently
/// decompressing when the packet starts with the gzip magic.
pub fn decode_datagram(data: &[u8]) -> Result<(u32, Bytes), WireError> {
    let plain;
    let data = if data.len() >= 2 && data[0..2] == GZIP_MAGIC {
        let mut dec = flate2::read::GzDecoder::new(data);
        let mut out = Vec::new();
        dec.read_to_end(&mut out).map_err(|_| WireError::Decompress)?;
        plain = out;
        &plain[..]
    } else {
        data
    };
    if data.len() < DATAGRAM_HEADER_LEN {
        return Err(WireError::Truncated);
    }
    let protocol = u32::from_be_bytes(data[..DATAGRAM_HEADER_LEN].try_into().unwrap());
    Ok((protocol, Bytes::copy_from_slice(&data[DATAGRAM_HEADER_LEN..])))
}

// ── Audit envelope ────────────────────────────────────────────────────────────

/// Length of the random verifier nonce used for duplicate suppression.
pub const VERIFIER_LEN: usize = 20;

/// Kinds of audit poll messages. The router only cares which of these are
/// unicast-only and which are no-ops; payload semantics belong to the poll
/// layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EnvelopeKind {
    Noop = 0,
    ContentPollCall = 1,
    ContentPollVote = 2,
    NamePollCall = 3,
    NamePollVote = 4,
    VerifyPollCall = 5,
    VerifyPollVote = 6,
}

impl EnvelopeKind {
    /// Verify polls are point-to-point challenges; flooding them would
    /// invite unsolicited responses from caches that never saw the vote.
    pub fn is_unicast_only(self) -> bool {
        matches!(self, EnvelopeKind::VerifyPollCall | EnvelopeKind::VerifyPollVote)
    }

    pub fn is_noop(self) -> bool {
        matches!(self, EnvelopeKind::Noop)
    }
}

impl TryFrom<u8> for EnvelopeKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(EnvelopeKind::Noop),
            1 => Ok(EnvelopeKind::ContentPollCall),
            2 => Ok(EnvelopeKind::ContentPollVote),
            3 => Ok(EnvelopeKind::NamePollCall),
            4 => Ok(EnvelopeKind::NamePollVote),
            5 => Ok(EnvelopeKind::VerifyPollCall),
            6 => Ok(EnvelopeKind::VerifyPollVote),
            other => Err(WireError::UnknownKind(other)),
        }
    }
}

/// The routed unit of the audit datagram protocol.
///
/// Wire layout: kind u8 | hop_count u8 | stop_time u64 | verifier 20 bytes |
/// originator key length u8 | originator key | payload.
///
/// The router consumes kind, hop count, originator, verifier and stop time;
/// the payload is opaque and handed to registered handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    /// Decremented on each forward; a message at zero is never forwarded.
    pub hop_count: u8,
    /// End of the poll this message belongs to, in ms since the epoch.
    /// Zero for no-ops, which have no poll.
    pub stop_time: u64,
    /// Random nonce used purely for duplicate detection.
    pub verifier: [u8; VERIFIER_LEN],
    /// Identity key of the cache that originated the message.
    pub originator: String,
    pub payload: Bytes,
}

impl Envelope {
    /// Minimum encoded size: fixed fields plus an empty originator.
    pub const MIN_LEN: usize = 1 + 1 + 8 + VERIFIER_LEN + 1;

    /// Build a beacon no-op from the local identity with a fresh verifier.
    pub fn noop(originator: &str) -> Self {
        Envelope {
            kind: EnvelopeKind::Noop,
            hop_count: 0,
            stop_time: 0,
            verifier: random_verifier(),
            originator: originator.to_string(),
            payload: Bytes::new(),
        }
    }

    pub fn encode(&self) -> Result<Bytes, WireError> {
        if self.originator.len() > MAX_PEERID_LEN {
            return Err(WireError::OriginatorTooLong(self.originator.len()));
        }
        let mut buf =
            BytesMut::with_capacity(Self::MIN_LEN + self.originator.len() + self.payload.len());
        buf.put_u8(self.kind as u8);
        buf.put_u8(self.hop_count);
        buf.put_u64(self.stop_time);
        buf.put_slice(&self.verifier);
        buf.put_u8(self.originator.len() as u8);
        buf.put_slice(self.originator.as_bytes());
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < Self::MIN_LEN {
            return Err(WireError::Truncated);
        }
        let kind = EnvelopeKind::try_from(data[0])?;
        let hop_count = data[1];
        let stop_time = u64::from_be_bytes(data[2..10].try_into().unwrap());
        let mut verifier = [0u8; VERIFIER_LEN];
        verifier.copy_from_slice(&data[10..10 + VERIFIER_LEN]);
        let orig_len = data[10 + VERIFIER_LEN] as usize;
        if orig_len > MAX_PEERID_LEN {
            return Err(WireError::OriginatorTooLong(orig_len));
        }
        let orig_start = Self::MIN_LEN;
        if data.len() < orig_start + orig_len {
            return Err(WireError::Truncated);
        }
        let originator = std::str::from_utf8(&data[orig_start..orig_start + orig_len])
            .map_err(|_| WireError::BadOriginator)?
            .to_string();
        Ok(Envelope {
            kind,
            hop_count,
            stop_time,
            verifier,
            originator,
            payload: Bytes::copy_from_slice(&data[orig_start + orig_len..]),
        })
    }
}

/// Fresh random verifier nonce.
pub fn random_verifier() -> [u8; VERIFIER_LEN] {
    let mut v = [0u8; VERIFIER_LEN];
    rand::Rng::fill(&mut rand::thread_rng(), &mut v[..]);
    v
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("message doesn't start with the check byte: got 0x{0:02x}")]
    BadCheckByte(u8),

    #[error("unknown opcode: {0}")]
    UnknownOpcode(u8),

    #[error("unknown envelope kind: {0}")]
    UnknownKind(u8),

    #[error("packet truncated")]
    Truncated,

    #[error("originator key too long: {0} bytes")]
    OriginatorTooLong(usize),

    #[error("originator key is not valid UTF-8")]
    BadOriginator,

    #[error("gzip compression failed")]
    Compress,

    #[error("gzip decompression failed")]
    Decompress,
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_header_round_trip() {
        let hdr = StreamHeader {
            op: Opcode::Data,
            len: 100,
            protocol: 7,
        };
        let bytes = hdr.encode();
        assert_eq!(bytes.len(), HEADER_LEN);
        assert_eq!(bytes[0], HEADER_CHECK);
        assert_eq!(StreamHeader::decode(&bytes).unwrap(), hdr);
    }

    #[test]
    fn header_fields_are_big_endian() {
        let hdr = StreamHeader {
            op: Opcode::PeerId,
            len: 0x0102_0304,
            protocol: 0x0506_0708,
        };
        let bytes = hdr.encode();
        assert_eq!(&bytes[2..6], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&bytes[6..10], &[0x05, 0x06, 0x07, 0x08]);
    }

    #[test]
    fn bad_check_byte_rejected() {
        let mut bytes = StreamHeader {
            op: Opcode::Data,
            len: 0,
            protocol: 0,
        }
        .encode();
        bytes[0] = 0x00;
        assert_eq!(
            StreamHeader::decode(&bytes),
            Err(WireError::BadCheckByte(0x00))
        );
    }

    #[test]
    fn unknown_opcode_rejected() {
        let mut bytes = StreamHeader {
            op: Opcode::Data,
            len: 0,
            protocol: 0,
        }
        .encode();
        bytes[1] = 9;
        assert_eq!(StreamHeader::decode(&bytes), Err(WireError::UnknownOpcode(9)));
    }

    #[test]
    fn envelope_round_trip() {
        let env = Envelope {
            kind: EnvelopeKind::ContentPollCall,
            hop_count: 2,
            stop_time: 1_700_000_000_000,
            verifier: [0xAB; VERIFIER_LEN],
            originator: "TCP:[10.4.0.1]:9729".to_string(),
            payload: Bytes::from_static(b"poll body"),
        };
        let encoded = env.encode().unwrap();
        assert_eq!(Envelope::decode(&encoded).unwrap(), env);
    }

    #[test]
    fn envelope_rejects_truncation() {
        let env = Envelope::noop("10.4.0.1");
        let encoded = env.encode().unwrap();
        for cut in 0..Envelope::MIN_LEN {
            assert!(Envelope::decode(&encoded[..cut]).is_err());
        }
    }

    #[test]
    fn noop_envelopes_get_distinct_verifiers() {
        let a = Envelope::noop("10.4.0.1");
        let b = Envelope::noop("10.4.0.1");
        assert_ne!(a.verifier, b.verifier);
    }

    #[test]
    fn unicast_only_kinds() {
        assert!(EnvelopeKind::VerifyPollCall.is_unicast_only());
        assert!(EnvelopeKind::VerifyPollVote.is_unicast_only());
        assert!(!EnvelopeKind::ContentPollCall.is_unicast_only());
        assert!(!EnvelopeKind::Noop.is_unicast_only());
    }

    #[test]
    fn datagram_round_trip_uncompressed() {
        let pkt = encode_datagram(PROTOCOL_AUDIT, b"hello", false, 0).unwrap();
        assert_eq!(&pkt[..4], &PROTOCOL_AUDIT.to_be_bytes());
        let (proto, payload) = decode_datagram(&pkt).unwrap();
        assert_eq!(proto, PROTOCOL_AUDIT);
        assert_eq!(&payload[..], b"hello");
    }

    #[test]
    fn datagram_compresses_above_threshold() {
        let body = vec![0x41u8; 4096];
        let pkt = encode_datagram(3, &body, true, 128).unwrap();
        assert_eq!(pkt[..2], GZIP_MAGIC, "large packet should be gzip-wrapped");
        assert!(pkt.len() < body.len());
        let (proto, payload) = decode_datagram(&pkt).unwrap();
        assert_eq!(proto, 3);
        assert_eq!(payload.len(), 4096);
    }

    #[test]
    fn datagram_below_threshold_stays_plain() {
        let pkt = encode_datagram(3, b"tiny", true, 128).unwrap();
        assert_ne!(pkt[..2], GZIP_MAGIC);
        let (_, payload) = decode_datagram(&pkt).unwrap();
        assert_eq!(&payload[..], b"tiny");
    }

    #[test]
    fn short_datagram_rejected() {
        assert_eq!(decode_datagram(&[0x00, 0x01]), Err(WireError::Truncated));
    }
}
