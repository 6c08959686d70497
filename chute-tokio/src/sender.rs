//! The chunk-sending side: per-stream transfer and acknowledgment workers.
//!
//! One control socket receives transfer requests, buffer reports and
//! quality queries, and doubles as the data socket; a second socket
//! receives ACKs. Datagrams from both are funneled into a single router
//! task that owns the map of per-stream workers, so no lock guards any of
//! it. Each stream gets:
//!
//! * a transfer worker: opens the chunk file, frames `cwnd`-sized bursts,
//!   sleeps the pacing interval between them, and applies preemptive seeks
//!   before every packet it emits;
//! * an ACK worker: the single owner of the stream's acceptance state,
//!   RTT estimator, congestion controller, throughput window and quality
//!   selector. It judges each burst (confirmed within the rto, or timed
//!   out) and publishes pacing snapshots back to the transfer worker over
//!   a watch channel.

use std::{
    collections::HashMap,
    io::{self, SeekFrom},
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
};

use bytes::Bytes;
use log::{debug, info, trace, warn};
use thiserror::Error;
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
    net::UdpSocket,
    sync::{mpsc, oneshot, watch},
    time::{sleep, sleep_until, Instant},
};

use chute_protocol::{
    congestion::{CongestionController, CongestionSnapshot},
    packet::{
        Ack, BufferReport, ChunkId, ControlMessage, Packet, SeqNo, StreamId, DATAGRAM_SIZE,
        MAX_PAYLOAD, MAX_SEQ_NO,
    },
    quality::{QualitySelector, ThroughputSample, ThroughputWindow},
    stream::{AckDisposition, StreamState},
    timing::RtoEstimator,
};

use crate::storage::ChunkStore;

/// Consecutive burst timeouts tolerated before a transfer is abandoned.
const MAX_CONSECUTIVE_TIMEOUTS: u32 = 8;

#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Control socket address. Requests, reports and quality queries arrive
    /// here, and data packets leave from it.
    pub bind: SocketAddr,
    /// ACK socket address.
    pub ack_bind: SocketAddr,
    /// Root of the segmented video storage.
    pub storage_root: PathBuf,
}

/// Handle to a running sender service. Workers are spawned per stream on
/// first use and run until the service is dropped.
pub struct SenderService {
    control_addr: SocketAddr,
    ack_addr: SocketAddr,
}

impl SenderService {
    pub async fn bind(config: SenderConfig) -> io::Result<SenderService> {
        let control = Arc::new(UdpSocket::bind(config.bind).await?);
        let acks = UdpSocket::bind(config.ack_bind).await?;
        let control_addr = control.local_addr()?;
        let ack_addr = acks.local_addr()?;
        let store = ChunkStore::new(config.storage_root);

        let (events_tx, events_rx) = mpsc::channel(256);
        tokio::spawn(read_control(control.clone(), events_tx.clone()));
        tokio::spawn(read_acks(acks, events_tx));
        tokio::spawn(route(events_rx, control, store));

        info!(
            "sender listening on {} (acks on {})",
            control_addr, ack_addr
        );
        Ok(SenderService {
            control_addr,
            ack_addr,
        })
    }

    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    pub fn ack_addr(&self) -> SocketAddr {
        self.ack_addr
    }
}

enum SenderEvent {
    Control(ControlMessage, SocketAddr),
    Ack(Ack),
}

async fn read_control(socket: Arc<UdpSocket>, events: mpsc::Sender<SenderEvent>) {
    let mut buf = vec![0u8; DATAGRAM_SIZE];
    loop {
        let (n, src) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                warn!("control socket receive failed: {}", e);
                continue;
            }
        };
        match ControlMessage::parse(&buf[..n]) {
            Ok(msg) => {
                if events.send(SenderEvent::Control(msg, src)).await.is_err() {
                    return;
                }
            }
            Err(e) => debug!("dropping control datagram from {}: {}", src, e),
        }
    }
}

async fn read_acks(socket: UdpSocket, events: mpsc::Sender<SenderEvent>) {
    let mut buf = vec![0u8; DATAGRAM_SIZE];
    loop {
        let (n, src) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                warn!("ack socket receive failed: {}", e);
                continue;
            }
        };
        match Ack::parse(&buf[..n]) {
            Ok(ack) => {
                if events.send(SenderEvent::Ack(ack)).await.is_err() {
                    return;
                }
            }
            Err(e) => debug!("dropping ack datagram from {}: {}", src, e),
        }
    }
}

struct StreamHandles {
    transfer: mpsc::Sender<TransferCmd>,
    acks: mpsc::Sender<AckEvent>,
}

/// Owns the stream map and dispatches every inbound datagram to the right
/// worker. Streams are created on first use, keyed by id.
async fn route(
    mut events: mpsc::Receiver<SenderEvent>,
    socket: Arc<UdpSocket>,
    store: ChunkStore,
) {
    let mut streams: HashMap<StreamId, StreamHandles> = HashMap::new();

    while let Some(event) = events.recv().await {
        match event {
            SenderEvent::Control(ControlMessage::Transfer(req), src) => {
                let chunk = match ChunkStore::chunk_id_of(&req.path) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        warn!("rejecting transfer request: {}", e);
                        continue;
                    }
                };
                let path = match store.resolve(&req.path) {
                    Ok(path) => path,
                    Err(e) => {
                        warn!("rejecting transfer request: {}", e);
                        continue;
                    }
                };
                let handles = stream_handles(&mut streams, req.stream, &socket);
                let cmd = TransferCmd {
                    chunk,
                    path,
                    start_seq: req.start_seq,
                    dest: src,
                };
                if handles.transfer.send(cmd).await.is_err() {
                    warn!("stream {}: transfer worker gone", req.stream);
                    streams.remove(&req.stream);
                }
            }
            SenderEvent::Control(ControlMessage::Report(report), src) => {
                let handles = stream_handles(&mut streams, report.stream, &socket);
                let (reply, rx) = oneshot::channel();
                let _ = handles.acks.send(AckEvent::Report { report, reply }).await;
                reply_tier(socket.clone(), src, rx);
            }
            SenderEvent::Control(ControlMessage::Quality(stream), src) => {
                let handles = stream_handles(&mut streams, stream, &socket);
                let (reply, rx) = oneshot::channel();
                let _ = handles.acks.send(AckEvent::Quality { reply }).await;
                reply_tier(socket.clone(), src, rx);
            }
            SenderEvent::Ack(ack) => match streams.get(&ack.stream) {
                // never let a slow worker block the router; a dropped ack
                // is indistinguishable from network loss anyway
                Some(handles) => {
                    let _ = handles.acks.try_send(AckEvent::Ack(ack));
                }
                None => trace!("ack for unknown stream {}", ack.stream),
            },
        }
    }
}

fn stream_handles<'a>(
    streams: &'a mut HashMap<StreamId, StreamHandles>,
    stream: StreamId,
    socket: &Arc<UdpSocket>,
) -> &'a StreamHandles {
    streams
        .entry(stream)
        .or_insert_with(|| spawn_stream(stream, socket.clone()))
}

fn spawn_stream(stream: StreamId, socket: Arc<UdpSocket>) -> StreamHandles {
    info!("stream {}: starting workers", stream);

    let controller = CongestionController::new();
    let selector = QualitySelector::new();
    let initial = controller.snapshot(selector.current_bitrate_kbps());
    let (snapshot_tx, snapshot_rx) = watch::channel(initial);
    let (transfer_tx, transfer_rx) = mpsc::channel(8);
    let (ack_tx, ack_rx) = mpsc::channel(256);

    tokio::spawn(
        AckWorker {
            stream,
            events: ack_rx,
            state: StreamState::new(),
            estimator: RtoEstimator::new(),
            controller,
            window: ThroughputWindow::new(),
            selector,
            snapshot: snapshot_tx,
            pending: None,
        }
        .run(),
    );
    tokio::spawn(
        TransferWorker {
            stream,
            socket,
            cmds: transfer_rx,
            acks: ack_tx.clone(),
            congestion: snapshot_rx,
        }
        .run(),
    );

    StreamHandles {
        transfer: transfer_tx,
        acks: ack_tx,
    }
}

fn reply_tier(socket: Arc<UdpSocket>, dst: SocketAddr, rx: oneshot::Receiver<usize>) {
    tokio::spawn(async move {
        if let Ok(tier) = rx.await {
            if let Err(e) = socket.send_to(tier.to_string().as_bytes(), dst).await {
                warn!("failed to send quality decision to {}: {}", dst, e);
            }
        }
    });
}

#[derive(Debug)]
struct TransferCmd {
    chunk: ChunkId,
    path: PathBuf,
    start_seq: SeqNo,
    dest: SocketAddr,
}

enum AckEvent {
    Ack(Ack),
    /// A fresh chunk transfer (or an externally requested seek) realigns
    /// the acceptance state.
    Begin { chunk: ChunkId, start_seq: SeqNo },
    /// A burst went out; judge it against the rto.
    Burst {
        end_seq: SeqNo,
        packets: u32,
        sent_at: Instant,
        reply: oneshot::Sender<BurstVerdict>,
    },
    /// A FIN went out; confirmed once its `is_last` ACK is accepted.
    Fin {
        fin_seq: SeqNo,
        sent_at: Instant,
        reply: oneshot::Sender<BurstVerdict>,
    },
    Report {
        report: BufferReport,
        reply: oneshot::Sender<usize>,
    },
    Quality {
        reply: oneshot::Sender<usize>,
    },
}

#[derive(Debug, Clone, Copy)]
enum BurstVerdict {
    Confirmed,
    TimedOut { resume_from: SeqNo },
}

#[derive(Debug, Error)]
enum TransferError {
    #[error("chunk file missing: {0}")]
    StorageMissing(PathBuf),
    #[error("chunk file too large for the wire sequence field: {0} bytes")]
    TooLarge(u64),
    #[error("cursor stopped at seq {actual} but the file size implies fin at {expected}; seek/advance accounting is corrupt")]
    FinalSequenceMismatch { expected: SeqNo, actual: SeqNo },
    #[error("gave up after {0} consecutive burst timeouts")]
    TooManyTimeouts(u32),
    #[error("acknowledgment worker stopped")]
    AckWorkerGone,
    #[error(transparent)]
    Io(#[from] io::Error),
}

enum Outcome {
    Completed,
    /// A request for a different chunk arrived mid-transfer; the remaining
    /// bytes of this one are abandoned.
    Preempted(TransferCmd),
}

struct TransferWorker {
    stream: StreamId,
    socket: Arc<UdpSocket>,
    cmds: mpsc::Receiver<TransferCmd>,
    acks: mpsc::Sender<AckEvent>,
    congestion: watch::Receiver<CongestionSnapshot>,
}

impl TransferWorker {
    async fn run(mut self) {
        while let Some(cmd) = self.cmds.recv().await {
            let mut next = Some(cmd);
            while let Some(cmd) = next.take() {
                let chunk = cmd.chunk;
                match self.transfer(cmd).await {
                    Ok(Outcome::Completed) => {
                        info!("stream {}: chunk {} sent", self.stream, chunk)
                    }
                    Ok(Outcome::Preempted(cmd)) => {
                        debug!(
                            "stream {}: chunk {} preempted by chunk {}",
                            self.stream, chunk, cmd.chunk
                        );
                        next = Some(cmd);
                    }
                    Err(TransferError::AckWorkerGone) => return,
                    Err(e) => {
                        warn!("stream {}: chunk {} aborted: {}", self.stream, chunk, e)
                    }
                }
            }
        }
        debug!("stream {}: transfer worker stopped", self.stream);
    }

    async fn transfer(&mut self, cmd: TransferCmd) -> Result<Outcome, TransferError> {
        let TransferCmd {
            chunk,
            path,
            start_seq,
            dest,
        } = cmd;

        let mut file = match File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(TransferError::StorageMissing(path))
            }
            Err(e) => return Err(e.into()),
        };
        let len = file.metadata().await?.len();
        let expected_fin = SeqNo(len / MAX_PAYLOAD as u64 + 1);
        if expected_fin.0 > MAX_SEQ_NO {
            return Err(TransferError::TooLarge(len));
        }
        let mut seq = start_seq;
        let mut retry = RetryBudget::new();

        self.begin(chunk, seq).await?;
        debug!(
            "stream {}: sending chunk {} ({} bytes) from seq {}",
            self.stream, chunk, len, seq
        );

        let mut wire = Vec::with_capacity(DATAGRAM_SIZE);
        'pacing: loop {
            let snapshot = *self.congestion.borrow();
            let round_start = Instant::now();
            let mut sent = 0u32;
            let mut reached_end = false;

            while sent < snapshot.burst_packets {
                // a repeated request must redirect the very next packet
                if let Ok(new) = self.cmds.try_recv() {
                    if new.path == path && new.dest == dest {
                        debug!("stream {}: seek to seq {}", self.stream, new.start_seq);
                        seq = new.start_seq;
                        self.begin(chunk, seq).await?;
                    } else {
                        return Ok(Outcome::Preempted(new));
                    }
                }

                let payload = read_slice(&mut file, seq).await?;
                if payload.is_empty() {
                    reached_end = true;
                    break;
                }
                wire.clear();
                Packet::data(chunk, seq, payload).serialize(&mut wire);
                self.socket.send_to(&wire, dest).await?;
                trace!("stream {}: sent chunk {} seq {}", self.stream, chunk, seq);
                seq = seq.next();
                sent += 1;
            }

            // the tail burst is judged like any other; only a round that
            // sent nothing has nothing to wait for
            if sent > 0 {
                match self.await_verdict(seq, sent, round_start).await? {
                    BurstVerdict::Confirmed => retry.confirmed(),
                    BurstVerdict::TimedOut { resume_from } => {
                        retry.timed_out(resume_from)?;
                        debug!(
                            "stream {}: retransmitting from seq {}",
                            self.stream, resume_from
                        );
                        seq = resume_from;
                        continue 'pacing;
                    }
                }
            }
            if reached_end {
                break 'pacing;
            }

            if let Some(rest) = snapshot.pacing_interval.checked_sub(round_start.elapsed()) {
                sleep(rest).await;
            }
        }

        // the cursor must land exactly where the file size says the FIN
        // belongs; anything else means the seek/advance logic corrupted
        // itself and the transfer is not trustworthy
        if seq != expected_fin {
            return Err(TransferError::FinalSequenceMismatch {
                expected: expected_fin,
                actual: seq,
            });
        }

        // the FIN is itself subject to loss: resend it on timeout until its
        // is_last ACK is accepted
        loop {
            wire.clear();
            Packet::fin(chunk, seq).serialize(&mut wire);
            self.socket.send_to(&wire, dest).await?;
            match self.await_fin(seq).await? {
                BurstVerdict::Confirmed => return Ok(Outcome::Completed),
                BurstVerdict::TimedOut { resume_from } => {
                    retry.timed_out(resume_from)?;
                    debug!("stream {}: resending fin seq {}", self.stream, seq);
                }
            }
        }
    }

    async fn begin(&self, chunk: ChunkId, start_seq: SeqNo) -> Result<(), TransferError> {
        self.acks
            .send(AckEvent::Begin { chunk, start_seq })
            .await
            .map_err(|_| TransferError::AckWorkerGone)
    }

    async fn await_verdict(
        &mut self,
        next_seq: SeqNo,
        packets: u32,
        sent_at: Instant,
    ) -> Result<BurstVerdict, TransferError> {
        let (reply, rx) = oneshot::channel();
        self.acks
            .send(AckEvent::Burst {
                end_seq: SeqNo(next_seq.0 - 1),
                packets,
                sent_at,
                reply,
            })
            .await
            .map_err(|_| TransferError::AckWorkerGone)?;
        rx.await.map_err(|_| TransferError::AckWorkerGone)
    }

    async fn await_fin(&mut self, fin_seq: SeqNo) -> Result<BurstVerdict, TransferError> {
        let (reply, rx) = oneshot::channel();
        self.acks
            .send(AckEvent::Fin {
                fin_seq,
                sent_at: Instant::now(),
                reply,
            })
            .await
            .map_err(|_| TransferError::AckWorkerGone)?;
        rx.await.map_err(|_| TransferError::AckWorkerGone)
    }
}

/// Bounds retransmission: a run of timeouts that makes no forward progress
/// (the resume point never advances) aborts the transfer.
struct RetryBudget {
    consecutive: u32,
    stalled_at: Option<SeqNo>,
}

impl RetryBudget {
    fn new() -> Self {
        Self {
            consecutive: 0,
            stalled_at: None,
        }
    }

    fn confirmed(&mut self) {
        self.consecutive = 0;
        self.stalled_at = None;
    }

    fn timed_out(&mut self, resume_from: SeqNo) -> Result<(), TransferError> {
        if self.stalled_at == Some(resume_from) {
            self.consecutive += 1;
        } else {
            self.consecutive = 1;
            self.stalled_at = Some(resume_from);
        }
        if self.consecutive >= MAX_CONSECUTIVE_TIMEOUTS {
            return Err(TransferError::TooManyTimeouts(self.consecutive));
        }
        Ok(())
    }
}

async fn read_slice(file: &mut File, seq: SeqNo) -> io::Result<Bytes> {
    file.seek(SeekFrom::Start(seq.0 * MAX_PAYLOAD as u64)).await?;
    let mut buf = vec![0u8; MAX_PAYLOAD];
    let mut filled = 0;
    loop {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
        if filled == buf.len() {
            break;
        }
    }
    buf.truncate(filled);
    Ok(buf.into())
}

struct PendingBurst {
    end_seq: SeqNo,
    packets: u32,
    sent_at: Instant,
    deadline: Instant,
    reply: oneshot::Sender<BurstVerdict>,
    /// A pending FIN only completes the chunk; it contributes no throughput
    /// sample and no window transition.
    is_fin: bool,
}

struct AckWorker {
    stream: StreamId,
    events: mpsc::Receiver<AckEvent>,
    state: StreamState,
    estimator: RtoEstimator,
    controller: CongestionController,
    window: ThroughputWindow,
    selector: QualitySelector,
    snapshot: watch::Sender<CongestionSnapshot>,
    pending: Option<PendingBurst>,
}

impl AckWorker {
    async fn run(mut self) {
        loop {
            let deadline = self.pending.as_ref().map(|p| p.deadline);
            let event = match deadline {
                Some(deadline) => tokio::select! {
                    _ = sleep_until(deadline) => None,
                    event = self.events.recv() => match event {
                        Some(event) => Some(event),
                        None => break,
                    },
                },
                None => match self.events.recv().await {
                    Some(event) => Some(event),
                    None => break,
                },
            };

            match event {
                None => self.on_timeout(),
                Some(AckEvent::Ack(ack)) => self.on_ack(&ack),
                Some(AckEvent::Begin { chunk, start_seq }) => {
                    // a preempted transfer may leave a stale burst behind
                    self.pending = None;
                    self.state.begin(chunk, start_seq);
                }
                Some(AckEvent::Burst {
                    end_seq,
                    packets,
                    sent_at,
                    reply,
                }) => {
                    let deadline = sent_at + self.estimator.rto();
                    self.pending = Some(PendingBurst {
                        end_seq,
                        packets,
                        sent_at,
                        deadline,
                        reply,
                        is_fin: false,
                    });
                    // acks may already have raced ahead of the notice
                    self.try_confirm();
                }
                Some(AckEvent::Fin {
                    fin_seq,
                    sent_at,
                    reply,
                }) => {
                    let deadline = sent_at + self.estimator.rto();
                    self.pending = Some(PendingBurst {
                        end_seq: fin_seq,
                        packets: 0,
                        sent_at,
                        deadline,
                        reply,
                        is_fin: true,
                    });
                    // the is_last ACK may already have been accepted
                    self.try_confirm();
                }
                Some(AckEvent::Report { report, reply }) => {
                    self.selector.handle_report(report);
                    let tier = self.selector.select(&self.window);
                    self.publish();
                    let _ = reply.send(tier);
                }
                Some(AckEvent::Quality { reply }) => {
                    let tier = self.selector.select(&self.window);
                    self.publish();
                    let _ = reply.send(tier);
                }
            }
        }
        debug!("stream {}: ack worker stopped", self.stream);
    }

    fn on_ack(&mut self, ack: &Ack) {
        match self.state.handle_ack(ack) {
            AckDisposition::Ignored => {}
            AckDisposition::Accepted { is_last } => {
                if is_last {
                    info!(
                        "stream {}: chunk {} fully acknowledged",
                        self.stream, ack.chunk_id
                    );
                }
                self.try_confirm();
            }
        }
    }

    fn try_confirm(&mut self) {
        let confirmed = match &self.pending {
            Some(p) => self.state.last_acked_seq() >= p.end_seq.0 as i64,
            None => false,
        };
        if !confirmed {
            return;
        }
        let p = match self.pending.take() {
            Some(p) => p,
            None => return,
        };

        if p.is_fin {
            debug!("stream {}: fin acknowledged at seq {}", self.stream, p.end_seq);
            let _ = p.reply.send(BurstVerdict::Confirmed);
            return;
        }

        let sample = p.sent_at.elapsed();
        self.estimator.update(sample);
        self.controller.on_confirmation();
        let rate_bps = p.packets as f64 * (DATAGRAM_SIZE * 8) as f64 / sample.as_secs_f64();
        self.window.push(ThroughputSample {
            rate_bps,
            at: std::time::Instant::now(),
        });
        self.publish();
        debug!(
            "stream {}: burst of {} confirmed in {:?} ({:.0} bps), srtt {:?} rto {:?}",
            self.stream,
            p.packets,
            sample,
            rate_bps,
            self.estimator.srtt(),
            self.estimator.rto()
        );
        let _ = p.reply.send(BurstVerdict::Confirmed);
    }

    fn on_timeout(&mut self) {
        let p = match self.pending.take() {
            Some(p) => p,
            None => return,
        };
        self.estimator.backoff();
        if !p.is_fin {
            self.controller.on_timeout();
            self.publish();
        }
        warn!(
            "stream {}: no ack for seq {} within rto, backing off to {:?}",
            self.stream,
            p.end_seq,
            self.estimator.rto()
        );
        let _ = p.reply.send(BurstVerdict::TimedOut {
            resume_from: self.state.next_seq(),
        });
    }

    fn publish(&self) {
        let _ = self
            .snapshot
            .send(self.controller.snapshot(self.selector.current_bitrate_kbps()));
    }
}
