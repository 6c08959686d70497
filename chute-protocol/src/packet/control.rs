//! Control-plane message grammar.
//!
//! Everything on the control and ACK sockets is line-oriented ASCII, kept
//! byte-compatible in shape with the research prototype this protocol grew
//! out of. Three verbs arrive on the control socket:
//!
//! ```ignore,
//! Request: Transmission\nStream-1-\nFile-video5/03.m4s-\nseq_no-0-
//! Report: 1-7.25-12
//! Quality: 1-
//! ```
//!
//! and ACKs arrive on the ACK socket as `stream-chunk-seq-is_last`.

use std::fmt;
use std::str::from_utf8;

use super::{ChunkId, PacketParseError, SeqNo, StreamId, MAX_SEQ_NO};

const TRANSFER_PREFIX: &str = "Request: Transmission\n";
const REPORT_PREFIX: &str = "Report: ";
const QUALITY_PREFIX: &str = "Quality: ";

/// Asks the sender to start transferring a chunk file, beginning at
/// `start_seq`. Re-sending this for an in-flight stream performs a
/// preemptive seek instead of starting a second transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub stream: StreamId,
    /// Path of the chunk file, relative to the sender's storage root.
    pub path: String,
    pub start_seq: SeqNo,
}

/// Per-packet acknowledgment from the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub stream: StreamId,
    pub chunk_id: ChunkId,
    pub seq_no: SeqNo,
    pub is_last: bool,
}

/// Client-reported playback buffer occupancy, indexed by report sequence
/// rather than chunk id. The most recent report wins at decision time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferReport {
    pub stream: StreamId,
    pub buffer_seconds: f64,
    pub index: u64,
}

/// A message received on the sender's control socket.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    Transfer(TransferRequest),
    Report(BufferReport),
    /// Synchronous quality query; the sender replies with the bitrate tier.
    Quality(StreamId),
}

impl ControlMessage {
    pub fn parse(raw: &[u8]) -> Result<ControlMessage, PacketParseError> {
        let text = from_utf8(raw)?;
        if let Some(rest) = text.strip_prefix(TRANSFER_PREFIX) {
            return Ok(ControlMessage::Transfer(TransferRequest::parse_fields(
                rest,
            )?));
        }
        if let Some(rest) = text.strip_prefix(REPORT_PREFIX) {
            return Ok(ControlMessage::Report(BufferReport::parse_fields(rest)?));
        }
        if let Some(rest) = text.strip_prefix(QUALITY_PREFIX) {
            let stream = rest
                .strip_suffix('-')
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| PacketParseError::BadControlType(text.to_string()))?;
            return Ok(ControlMessage::Quality(StreamId(stream)));
        }
        Err(PacketParseError::BadControlType(
            text.chars().take(32).collect(),
        ))
    }
}

impl fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ControlMessage::Transfer(t) => write!(
                f,
                "{}Stream-{}-\nFile-{}-\nseq_no-{}-",
                TRANSFER_PREFIX, t.stream, t.path, t.start_seq
            ),
            ControlMessage::Report(r) => write!(
                f,
                "{}{}-{}-{}",
                REPORT_PREFIX, r.stream, r.buffer_seconds, r.index
            ),
            ControlMessage::Quality(stream) => write!(f, "{}{}-", QUALITY_PREFIX, stream),
        }
    }
}

impl TransferRequest {
    fn parse_fields(rest: &str) -> Result<TransferRequest, PacketParseError> {
        let bad = || PacketParseError::BadTransferRequest(rest.to_string());
        let mut lines = rest.lines();
        let stream = field(lines.next().ok_or_else(bad)?, "Stream").ok_or_else(bad)?;
        let path = field(lines.next().ok_or_else(bad)?, "File").ok_or_else(bad)?;
        let seq = field(lines.next().ok_or_else(bad)?, "seq_no").ok_or_else(bad)?;
        // the six-digit wire field bounds what a request may ask for
        let start_seq: u64 = seq.parse().map_err(|_| bad())?;
        if start_seq > MAX_SEQ_NO {
            return Err(bad());
        }
        Ok(TransferRequest {
            stream: StreamId(stream.parse().map_err(|_| bad())?),
            path: path.to_string(),
            start_seq: SeqNo(start_seq),
        })
    }
}

impl Ack {
    pub fn parse(raw: &[u8]) -> Result<Ack, PacketParseError> {
        let text = from_utf8(raw)?;
        let bad = || PacketParseError::BadAck(text.to_string());
        let mut parts = text.split('-');
        let stream = parts.next().and_then(|p| p.parse().ok()).ok_or_else(bad)?;
        let chunk = parts.next().and_then(|p| p.parse().ok()).ok_or_else(bad)?;
        let seq = parts.next().and_then(|p| p.parse().ok()).ok_or_else(bad)?;
        let is_last = match parts.next() {
            Some("0") => false,
            Some("1") => true,
            _ => return Err(bad()),
        };
        if parts.next().is_some() {
            return Err(bad());
        }
        Ok(Ack {
            stream: StreamId(stream),
            chunk_id: ChunkId(chunk),
            seq_no: SeqNo(seq),
            is_last,
        })
    }
}

impl fmt::Display for Ack {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}",
            self.stream,
            self.chunk_id,
            self.seq_no,
            u8::from(self.is_last)
        )
    }
}

impl BufferReport {
    fn parse_fields(rest: &str) -> Result<BufferReport, PacketParseError> {
        let bad = || PacketParseError::BadReport(rest.to_string());
        let mut parts = rest.split('-');
        let stream = parts.next().and_then(|p| p.parse().ok()).ok_or_else(bad)?;
        let buffer_seconds = parts.next().and_then(|p| p.parse().ok()).ok_or_else(bad)?;
        let index = parts.next().and_then(|p| p.parse().ok()).ok_or_else(bad)?;
        if parts.next().is_some() {
            return Err(bad());
        }
        Ok(BufferReport {
            stream: StreamId(stream),
            buffer_seconds,
            index,
        })
    }
}

fn field<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    line.strip_prefix(key)?
        .strip_prefix('-')?
        .strip_suffix('-')
}
