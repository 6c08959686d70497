//! HTTP-facing gateway: bridges player requests onto the datagram channel.
//!
//! Each chunk request opens a fresh pair of ephemeral UDP sockets (data and
//! ACK), asks the sender for a quality decision, requests the chunk file at
//! the chosen tier, and reassembles it in memory with strictly in-order
//! acceptance. Every accepted packet is ACKed back immediately; packets
//! already appended are re-ACKed without appending so a retransmitting
//! sender can make progress. The reassembled size is validated against the
//! gateway's own view of the storage before anything is handed to the
//! player.

use std::{
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::{Bytes, BytesMut};
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{net::UdpSocket, time::timeout};

use chute_protocol::{
    packet::{
        Ack, BufferReport, ChunkId, ControlMessage, Packet, PacketPayload, SeqNo, StreamId,
        TransferRequest, DATAGRAM_SIZE,
    },
    quality::BITRATES_KBPS,
};

use crate::storage::{ChunkStore, StorageError};

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Stream this gateway proxies.
    pub stream: StreamId,
    /// The sender's control/data socket.
    pub sender_addr: SocketAddr,
    /// The sender's ACK socket.
    pub sender_ack_addr: SocketAddr,
    /// Storage root, shared with the sender, used only to learn expected
    /// chunk sizes.
    pub storage_root: PathBuf,
    /// Overall budget for one chunk fetch, quality exchange included.
    pub fetch_timeout: Duration,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("reassembled {received} bytes of chunk {chunk} but storage holds {expected}")]
    SizeMismatch {
        chunk: ChunkId,
        expected: u64,
        received: u64,
    },
    #[error("no usable reply from the sender within {0:?}")]
    TimedOut(Duration),
    #[error("sender returned an unparseable quality decision")]
    BadQualityReply,
    #[error("request is for stream {requested}, this gateway serves stream {served}")]
    WrongStream {
        requested: StreamId,
        served: StreamId,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub struct Gateway {
    config: GatewayConfig,
    store: ChunkStore,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Gateway {
        let store = ChunkStore::new(config.storage_root.clone());
        Gateway { config, store }
    }

    pub fn stream(&self) -> StreamId {
        self.config.stream
    }

    /// Asks the sender which tier its current throughput estimate maps to.
    /// Issued once per chunk request, before the transfer request.
    pub async fn select_quality(&self) -> Result<usize, GatewayError> {
        self.quality_exchange(ControlMessage::Quality(self.config.stream))
            .await
    }

    /// Pushes a playback buffer report; the sender folds it into the next
    /// decision and answers with the tier it implies.
    pub async fn push_report(&self, buffer_seconds: f64, index: u64) -> Result<usize, GatewayError> {
        self.quality_exchange(ControlMessage::Report(BufferReport {
            stream: self.config.stream,
            buffer_seconds,
            index,
        }))
        .await
    }

    async fn quality_exchange(&self, msg: ControlMessage) -> Result<usize, GatewayError> {
        let socket = UdpSocket::bind(ephemeral(self.config.sender_addr)).await?;
        socket
            .send_to(msg.to_string().as_bytes(), self.config.sender_addr)
            .await?;

        let budget = self.config.fetch_timeout;
        let mut buf = [0u8; 16];
        let (n, _) = timeout(budget, socket.recv_from(&mut buf))
            .await
            .map_err(|_| GatewayError::TimedOut(budget))??;
        std::str::from_utf8(&buf[..n])
            .ok()
            .and_then(|s| s.trim().parse::<usize>().ok())
            .filter(|tier| *tier < BITRATES_KBPS.len())
            .ok_or(GatewayError::BadQualityReply)
    }

    /// Fetches one chunk at the given tier over the datagram protocol and
    /// validates the reassembled size against storage.
    pub async fn fetch_chunk(&self, chunk: ChunkId, tier: usize) -> Result<Bytes, GatewayError> {
        let relative = ChunkStore::relative_path(tier, chunk);
        let expected = self.store.chunk_len(&relative).await?;

        let data = UdpSocket::bind(ephemeral(self.config.sender_addr)).await?;
        let acks = UdpSocket::bind(ephemeral(self.config.sender_ack_addr)).await?;

        let request = ControlMessage::Transfer(TransferRequest {
            stream: self.config.stream,
            path: relative,
            start_seq: SeqNo(0),
        });
        data.send_to(request.to_string().as_bytes(), self.config.sender_addr)
            .await?;

        let budget = self.config.fetch_timeout;
        let assembled = timeout(budget, self.reassemble(&data, &acks, chunk))
            .await
            .map_err(|_| GatewayError::TimedOut(budget))??;

        if assembled.len() as u64 != expected {
            return Err(GatewayError::SizeMismatch {
                chunk,
                expected,
                received: assembled.len() as u64,
            });
        }
        debug!("chunk {}: reassembled {} bytes", chunk, assembled.len());
        Ok(assembled.freeze())
    }

    async fn reassemble(
        &self,
        data: &UdpSocket,
        acks: &UdpSocket,
        chunk: ChunkId,
    ) -> Result<BytesMut, GatewayError> {
        let mut assembled = BytesMut::new();
        let mut prev: i64 = -1;
        let mut dgram = vec![0u8; DATAGRAM_SIZE];

        loop {
            let (n, _) = data.recv_from(&mut dgram).await?;
            let packet = match Packet::parse(&mut &dgram[..n]) {
                Ok(packet) => packet,
                // a checksum failure is treated exactly like loss
                Err(e) => {
                    trace!("dropping corrupt datagram: {}", e);
                    continue;
                }
            };
            if packet.chunk_id != chunk {
                trace!("dropping packet for chunk {} (want {})", packet.chunk_id, chunk);
                continue;
            }

            let seq = packet.seq_no.0 as i64;
            if seq == prev + 1 {
                match packet.payload {
                    PacketPayload::Fin => {
                        self.send_ack(acks, chunk, packet.seq_no, true).await?;
                        return Ok(assembled);
                    }
                    PacketPayload::Data(bytes) => {
                        assembled.extend_from_slice(&bytes);
                        prev += 1;
                        self.send_ack(acks, chunk, packet.seq_no, false).await?;
                    }
                }
            } else if seq <= prev && !packet.payload.is_fin() {
                // a retransmission of something already appended; re-ACK
                // without appending so the sender advances
                self.send_ack(acks, chunk, packet.seq_no, false).await?;
            }
            // packets from the future mean an earlier one was lost; drop
            // them and let the sender's rto bring them back in order
        }
    }

    async fn send_ack(
        &self,
        socket: &UdpSocket,
        chunk: ChunkId,
        seq_no: SeqNo,
        is_last: bool,
    ) -> io::Result<()> {
        let ack = Ack {
            stream: self.config.stream,
            chunk_id: chunk,
            seq_no,
            is_last,
        };
        socket
            .send_to(ack.to_string().as_bytes(), self.config.sender_ack_addr)
            .await?;
        Ok(())
    }

    fn check_stream(&self, requested: StreamId) -> Result<(), GatewayError> {
        if requested != self.config.stream {
            return Err(GatewayError::WrongStream {
                requested,
                served: self.config.stream,
            });
        }
        Ok(())
    }
}

/// An unbound address in the peer's family, for ephemeral sockets.
fn ephemeral(peer: SocketAddr) -> SocketAddr {
    let ip = match peer {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    SocketAddr::new(ip, 0)
}

#[derive(Debug, Deserialize)]
pub struct ReportBody {
    pub buffer_seconds: f64,
    pub index: u64,
}

#[derive(Debug, Serialize)]
pub struct QualityDecision {
    pub tier: usize,
    pub bitrate_kbps: u32,
}

pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/chunk/{stream}/{chunk_id}", get(handle_chunk))
        .route("/report/{stream}", post(handle_report))
        .with_state(gateway)
}

async fn handle_chunk(
    State(gateway): State<Arc<Gateway>>,
    Path((stream, chunk_id)): Path<(u32, u32)>,
) -> Result<Response, GatewayError> {
    gateway.check_stream(StreamId(stream))?;
    let tier = gateway.select_quality().await?;
    let chunk = ChunkId(chunk_id);
    let bytes = gateway.fetch_chunk(chunk, tier).await?;
    info!("served chunk {} at tier {} ({} bytes)", chunk, tier, bytes.len());
    Ok(([(header::CONTENT_TYPE, "video/iso.segment")], bytes).into_response())
}

async fn handle_report(
    State(gateway): State<Arc<Gateway>>,
    Path(stream): Path<u32>,
    Json(body): Json<ReportBody>,
) -> Result<Json<QualityDecision>, GatewayError> {
    gateway.check_stream(StreamId(stream))?;
    let tier = gateway.push_report(body.buffer_seconds, body.index).await?;
    Ok(Json(QualityDecision {
        tier,
        bitrate_kbps: BITRATES_KBPS[tier],
    }))
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match &self {
            GatewayError::Storage(StorageError::Missing(_)) => StatusCode::NOT_FOUND,
            GatewayError::WrongStream { .. } => StatusCode::NOT_FOUND,
            GatewayError::TimedOut(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        warn!("request failed: {}", self);
        (status, self.to_string()).into_response()
    }
}

pub async fn serve(gateway: Arc<Gateway>, listen: SocketAddr) -> anyhow::Result<()> {
    let app = router(gateway);
    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!("gateway listening on {}", listen);
    axum::serve(listener, app).await?;
    Ok(())
}
