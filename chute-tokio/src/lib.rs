#![forbid(unsafe_code)]

//! Tokio implementation of the chute delivery path.
//!
//! Two long-lived halves, connected only by UDP:
//!
//! * [`SenderService`] owns the chunk storage and, per stream, a transfer
//!   worker (framing, pacing, preemptive seeks) and an ACK worker (in-order
//!   acceptance, RTT/RTO estimation, congestion control, quality
//!   selection). Workers communicate exclusively over channels; no mutable
//!   protocol state is shared.
//! * [`Gateway`] accepts a player's chunk request over HTTP, fetches the
//!   chunk over the datagram protocol with per-packet ACKs, validates the
//!   reassembled size, and streams the bytes back.

pub mod gateway;
pub mod sender;
pub mod storage;

pub use gateway::{Gateway, GatewayConfig, GatewayError};
pub use sender::{SenderConfig, SenderService};
pub use storage::{ChunkStore, StorageError};
