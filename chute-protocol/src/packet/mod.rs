//! Wire formats for the datagram channel.
//!
//! A data packet is laid out as
//!
//! ```ignore,
//! +----------------+----------+---------+----------------------+
//! | checksum (32)  | chunk(2) | seq(6)  | payload (<= 984)     |
//! +----------------+----------+---------+----------------------+
//! ```
//!
//! where `checksum` is the lowercase hex MD5 digest of everything that
//! follows it, `chunk` and `seq` are zero-padded ASCII decimal fields, and
//! the payload is raw chunk bytes or the literal `FIN`. The digest must be
//! recomputed and compared on receipt before any other field is trusted.

mod control;
mod error;

use std::fmt;

use bytes::{Buf, BufMut, Bytes};
use md5::{Digest, Md5};

pub use control::{Ack, BufferReport, ControlMessage, TransferRequest};
pub use error::PacketParseError;

/// Size of one datagram. Chosen so the UDP payload ratio matches TCP's.
pub const DATAGRAM_SIZE: usize = 1024;
/// Hex characters the MD5 digest occupies.
pub const CHECKSUM_LEN: usize = 32;
/// Decimal digits the chunk id occupies.
pub const CHUNK_ID_DIGITS: usize = 2;
/// Decimal digits the sequence number occupies.
pub const SEQ_NO_DIGITS: usize = 6;
/// Bytes of header before the payload.
pub const HEADER_LEN: usize = CHECKSUM_LEN + CHUNK_ID_DIGITS + SEQ_NO_DIGITS;
/// Maximum payload bytes per packet.
pub const MAX_PAYLOAD: usize = DATAGRAM_SIZE - HEADER_LEN;
/// Highest chunk id the two-digit field can carry.
pub const MAX_CHUNK_ID: u32 = 99;
/// Highest sequence number the six-digit field can carry.
pub const MAX_SEQ_NO: u64 = 999_999;

/// Reserved payload marking the end of a chunk transfer.
const FIN_MARKER: &[u8] = b"FIN";

/// Identifies one video stream end to end. The original prototype keyed
/// streams by port pairs; with a multiplexed socket the id travels in every
/// control message instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u32);

/// Index of a segment within a stream. Chunk 0 is the init segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId(pub u32);

/// Packet sequence number within one chunk transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeqNo(pub u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SeqNo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SeqNo {
    pub fn next(self) -> SeqNo {
        SeqNo(self.0 + 1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketPayload {
    Data(Bytes),
    Fin,
}

impl PacketPayload {
    pub fn is_fin(&self) -> bool {
        matches!(self, PacketPayload::Fin)
    }

    pub fn len(&self) -> usize {
        match self {
            PacketPayload::Data(b) => b.len(),
            PacketPayload::Fin => FIN_MARKER.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn wire_bytes(&self) -> &[u8] {
        match self {
            PacketPayload::Data(b) => b,
            PacketPayload::Fin => FIN_MARKER,
        }
    }
}

/// One datagram of a chunk transfer.
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    pub chunk_id: ChunkId,
    pub seq_no: SeqNo,
    pub payload: PacketPayload,
}

impl Packet {
    /// A payload of exactly `FIN` is indistinguishable from the FIN marker
    /// on the wire; the format inherits that ambiguity.
    pub fn data(chunk_id: ChunkId, seq_no: SeqNo, payload: Bytes) -> Packet {
        assert!(payload.len() <= MAX_PAYLOAD);
        Packet {
            chunk_id,
            seq_no,
            payload: PacketPayload::Data(payload),
        }
    }

    pub fn fin(chunk_id: ChunkId, seq_no: SeqNo) -> Packet {
        Packet {
            chunk_id,
            seq_no,
            payload: PacketPayload::Fin,
        }
    }

    /// Callers must have validated the field bounds when the request was
    /// parsed; see `MAX_CHUNK_ID` and `MAX_SEQ_NO`.
    pub fn serialize(&self, into: &mut impl BufMut) {
        assert!(self.chunk_id.0 <= MAX_CHUNK_ID);
        assert!(self.seq_no.0 <= MAX_SEQ_NO);

        let body = self.body();
        let mut hasher = Md5::new();
        hasher.update(&body);
        let digest = hasher.finalize();

        let mut checksum = [0u8; CHECKSUM_LEN];
        hex_encode(&digest, &mut checksum);

        into.put_slice(&checksum);
        into.put_slice(&body);
    }

    fn body(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(CHUNK_ID_DIGITS + SEQ_NO_DIGITS + self.payload.len());
        body.extend_from_slice(format!("{:02}", self.chunk_id.0).as_bytes());
        body.extend_from_slice(format!("{:06}", self.seq_no.0).as_bytes());
        body.extend_from_slice(self.payload.wire_bytes());
        body
    }

    /// Parses a received datagram, recomputing the checksum over everything
    /// after it. Any mismatch or malformed field yields an error; the caller
    /// must drop the packet silently and treat it as loss.
    pub fn parse(buf: &mut impl Buf) -> Result<Packet, PacketParseError> {
        let raw = buf.copy_to_bytes(buf.remaining());
        if raw.len() < HEADER_LEN {
            return Err(PacketParseError::NotEnoughData);
        }

        let (received, body) = raw.split_at(CHECKSUM_LEN);
        let mut hasher = Md5::new();
        hasher.update(body);
        let digest = hasher.finalize();
        let mut computed = [0u8; CHECKSUM_LEN];
        hex_encode(&digest, &mut computed);
        if received != computed {
            return Err(PacketParseError::BadChecksum);
        }

        let chunk_id = parse_digits(&body[..CHUNK_ID_DIGITS])
            .ok_or(PacketParseError::BadChunkId)? as u32;
        let seq_no = parse_digits(&body[CHUNK_ID_DIGITS..CHUNK_ID_DIGITS + SEQ_NO_DIGITS])
            .ok_or(PacketParseError::BadSeqNo)?;

        let payload = &raw[HEADER_LEN..];
        let payload = if payload == FIN_MARKER {
            PacketPayload::Fin
        } else {
            PacketPayload::Data(raw.slice(HEADER_LEN..))
        };

        Ok(Packet {
            chunk_id: ChunkId(chunk_id),
            seq_no: SeqNo(seq_no),
            payload,
        })
    }
}

fn parse_digits(field: &[u8]) -> Option<u64> {
    let mut value: u64 = 0;
    for b in field {
        if !b.is_ascii_digit() {
            return None;
        }
        value = value * 10 + u64::from(b - b'0');
    }
    Some(value)
}

fn hex_encode(digest: &[u8], out: &mut [u8]) {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    for (i, byte) in digest.iter().enumerate() {
        out[i * 2] = HEX[(byte >> 4) as usize];
        out[i * 2 + 1] = HEX[(byte & 0x0f) as usize];
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        match &self.payload {
            PacketPayload::Fin => {
                write!(f, "{{FIN chunk={} seq={}}}", self.chunk_id, self.seq_no)
            }
            PacketPayload::Data(b) => write!(
                f,
                "{{DATA chunk={} seq={} payload=[len={}]}}",
                self.chunk_id,
                self.seq_no,
                b.len(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use proptest::prelude::*;

    use super::*;

    #[test]
    fn fixed_widths() {
        let pkt = Packet::data(ChunkId(3), SeqNo(42), Bytes::from_static(b"abc"));
        let mut wire = vec![];
        pkt.serialize(&mut wire);

        assert_eq!(wire.len(), HEADER_LEN + 3);
        assert_eq!(&wire[CHECKSUM_LEN..CHECKSUM_LEN + 2], b"03");
        assert_eq!(&wire[CHECKSUM_LEN + 2..CHECKSUM_LEN + 8], b"000042");
        assert_eq!(&wire[HEADER_LEN..], b"abc");
    }

    #[test]
    fn fin_round_trip() {
        let pkt = Packet::fin(ChunkId(7), SeqNo(1043));
        let mut wire = vec![];
        pkt.serialize(&mut wire);

        let parsed = Packet::parse(&mut Cursor::new(&wire)).unwrap();
        assert_eq!(parsed, pkt);
        assert!(parsed.payload.is_fin());
    }

    #[test]
    fn truncated_rejected() {
        let err = Packet::parse(&mut Cursor::new(b"too short")).unwrap_err();
        assert!(matches!(err, PacketParseError::NotEnoughData));
    }

    proptest! {
        #[test]
        fn round_trip(chunk in 0u32..100, seq in 0u64..1_000_000, payload in proptest::collection::vec(any::<u8>(), 0..MAX_PAYLOAD)) {
            prop_assume!(payload != b"FIN");

            let pkt = Packet::data(ChunkId(chunk), SeqNo(seq), Bytes::from(payload.clone()));
            let mut wire = vec![];
            pkt.serialize(&mut wire);

            let parsed = Packet::parse(&mut Cursor::new(&wire)).unwrap();
            prop_assert_eq!(parsed.chunk_id, ChunkId(chunk));
            prop_assert_eq!(parsed.seq_no, SeqNo(seq));
            prop_assert_eq!(parsed.payload, PacketPayload::Data(Bytes::from(payload)));
        }

        #[test]
        fn corruption_rejected(seq in 0u64..1_000_000, payload in proptest::collection::vec(any::<u8>(), 1..MAX_PAYLOAD), flip_at in any::<prop::sample::Index>(), flip_with in 1u8..=255) {
            prop_assume!(payload != b"FIN");

            let pkt = Packet::data(ChunkId(1), SeqNo(seq), Bytes::from(payload));
            let mut wire = vec![];
            pkt.serialize(&mut wire);

            let at = flip_at.index(wire.len());
            wire[at] ^= flip_with;

            prop_assert!(Packet::parse(&mut Cursor::new(&wire)).is_err());
        }
    }
}
