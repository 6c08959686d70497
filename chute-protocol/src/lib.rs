#![forbid(unsafe_code)]

//! Protocol logic for chute, an adaptive video-chunk delivery path over UDP.
//!
//! This crate is sans-io: nothing here owns a socket, a file, or a task.
//! Every state machine is driven by the caller passing in packets, ACKs and
//! `Instant`s, which keeps the ARQ acceptance rule, the congestion loop and
//! the quality selector unit-testable without any timing jitter. The tokio
//! glue lives in `chute-tokio`.

pub mod congestion;
pub mod packet;
pub mod quality;
pub mod stream;
pub mod timing;

pub use congestion::{CongestionController, CongestionSnapshot};
pub use packet::{
    Ack, BufferReport, ChunkId, ControlMessage, Packet, PacketParseError, PacketPayload, SeqNo,
    StreamId, TransferRequest,
};
pub use quality::{QualitySelector, ThroughputSample, ThroughputWindow, BITRATES_KBPS};
pub use stream::{AckDisposition, StreamState};
pub use timing::RtoEstimator;
