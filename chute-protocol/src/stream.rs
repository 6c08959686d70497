//! Per-stream delivery state driven by the acknowledgment listener.

use log::trace;

use crate::packet::{Ack, ChunkId, SeqNo};

/// What became of a received ACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDisposition {
    /// The ACK was the immediate successor of the last accepted one.
    Accepted { is_last: bool },
    /// Duplicate, stale, out-of-order, or for another chunk. Dropped.
    Ignored,
}

/// Delivery bookkeeping for one stream.
///
/// Acceptance is strictly in-order: an ACK advances `last_acked_seq` only if
/// it carries exactly the next sequence number for the current chunk.
/// Everything else is ignored outright, which makes duplicate and reordered
/// ACKs harmless without any dedup set.
#[derive(Debug)]
pub struct StreamState {
    current_chunk: ChunkId,
    last_acked_seq: i64,
    complete: bool,
    last_completed_chunk: Option<ChunkId>,
}

impl StreamState {
    pub fn new() -> Self {
        Self {
            current_chunk: ChunkId(0),
            last_acked_seq: -1,
            complete: false,
            last_completed_chunk: None,
        }
    }

    /// Resets acceptance for a fresh chunk transfer starting at `start_seq`.
    pub fn begin(&mut self, chunk: ChunkId, start_seq: SeqNo) {
        self.current_chunk = chunk;
        self.last_acked_seq = start_seq.0 as i64 - 1;
        self.complete = false;
    }

    pub fn handle_ack(&mut self, ack: &Ack) -> AckDisposition {
        if self.complete || ack.chunk_id != self.current_chunk {
            trace!("ignoring ack for chunk {} (current {})", ack.chunk_id, self.current_chunk);
            return AckDisposition::Ignored;
        }
        if ack.seq_no.0 as i64 != self.last_acked_seq + 1 {
            trace!(
                "ignoring out-of-order ack seq {} (last acked {})",
                ack.seq_no,
                self.last_acked_seq
            );
            return AckDisposition::Ignored;
        }

        self.last_acked_seq += 1;
        if ack.is_last {
            self.complete = true;
            self.last_completed_chunk = Some(self.current_chunk);
        }
        AckDisposition::Accepted {
            is_last: ack.is_last,
        }
    }

    pub fn last_acked_seq(&self) -> i64 {
        self.last_acked_seq
    }

    /// Where a retransmission must resume from.
    pub fn next_seq(&self) -> SeqNo {
        SeqNo((self.last_acked_seq + 1) as u64)
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn last_completed_chunk(&self) -> Option<ChunkId> {
        self.last_completed_chunk
    }
}

impl Default for StreamState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::StreamId;

    fn ack(chunk: u32, seq: u64, is_last: bool) -> Ack {
        Ack {
            stream: StreamId(1),
            chunk_id: ChunkId(chunk),
            seq_no: SeqNo(seq),
            is_last,
        }
    }

    #[test]
    fn advances_only_by_one() {
        let mut state = StreamState::new();
        state.begin(ChunkId(3), SeqNo(0));

        assert_eq!(
            state.handle_ack(&ack(3, 0, false)),
            AckDisposition::Accepted { is_last: false }
        );
        assert_eq!(state.last_acked_seq(), 0);

        // skipping ahead is ignored, as is replaying
        assert_eq!(state.handle_ack(&ack(3, 2, false)), AckDisposition::Ignored);
        assert_eq!(state.handle_ack(&ack(3, 0, false)), AckDisposition::Ignored);
        assert_eq!(state.last_acked_seq(), 0);

        assert_eq!(
            state.handle_ack(&ack(3, 1, false)),
            AckDisposition::Accepted { is_last: false }
        );
        assert_eq!(state.last_acked_seq(), 1);
    }

    #[test]
    fn shuffled_acks_make_exactly_one_step() {
        let mut state = StreamState::new();
        state.begin(ChunkId(1), SeqNo(5));
        assert_eq!(state.last_acked_seq(), 4);

        // only the single valid +1 step among these may land
        let accepted = [9, 7, 5, 8, 5]
            .into_iter()
            .filter(|&seq| state.handle_ack(&ack(1, seq, false)) != AckDisposition::Ignored)
            .count();
        assert_eq!(accepted, 1);
        assert_eq!(state.last_acked_seq(), 5);
    }

    #[test]
    fn wrong_chunk_ignored() {
        let mut state = StreamState::new();
        state.begin(ChunkId(2), SeqNo(0));
        assert_eq!(state.handle_ack(&ack(5, 0, false)), AckDisposition::Ignored);
        assert_eq!(state.last_acked_seq(), -1);
    }

    #[test]
    fn last_ack_completes_chunk() {
        let mut state = StreamState::new();
        state.begin(ChunkId(2), SeqNo(0));
        state.handle_ack(&ack(2, 0, false));
        assert_eq!(
            state.handle_ack(&ack(2, 1, true)),
            AckDisposition::Accepted { is_last: true }
        );
        assert!(state.is_complete());
        assert_eq!(state.last_completed_chunk(), Some(ChunkId(2)));

        // nothing more is accepted until the next begin()
        assert_eq!(state.handle_ack(&ack(2, 2, false)), AckDisposition::Ignored);

        state.begin(ChunkId(3), SeqNo(0));
        assert!(!state.is_complete());
        assert_eq!(state.next_seq(), SeqNo(0));
    }
}
