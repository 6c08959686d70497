//! Window-based congestion control and packet pacing.

use std::time::Duration;

use log::{debug, trace};
use rand::{rngs::SmallRng, Rng, SeedableRng};

use crate::packet::DATAGRAM_SIZE;

/// Maximum segment size used in the window-to-rate conversion, in bytes.
const MSS: u64 = 1024;
/// The sender deliberately over-sends into the receive buffer rather than
/// under-utilizing capacity; excess packets queue at the receiver.
const PACING_MULTIPLIER: f64 = 1.5;
/// Trim applied to the drain-time budget, carried over from the tuned
/// research prototype.
const PACING_TRIM: f64 = 0.93;

/// Bootstrap slow-start threshold, in packets.
const INITIAL_SSTHRESH: u32 = 64;

/// Pacing parameters for one round, derived from the current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CongestionSnapshot {
    pub cwnd: u32,
    /// Packets to emit per pacing round.
    pub burst_packets: u32,
    /// Time budget to drain the window at the chosen bitrate.
    pub pacing_interval: Duration,
}

/// Per-stream congestion window and slow-start threshold.
///
/// Transitions on a confirmed burst: slow start doubles the window below
/// `ssthresh`; a window above a randomly drawn upper band is redrawn into a
/// lower band; otherwise the window grows by one. The redraw reacts to
/// window *magnitude*, not loss, so this is not textbook AIMD. On a
/// timeout the threshold and window both collapse to half the window.
#[derive(Debug)]
pub struct CongestionController {
    cwnd: u32,
    ssthresh: u32,
    rng: SmallRng,
}

impl CongestionController {
    /// The initial window is drawn randomly: the sender has no prior
    /// estimate of the path.
    const STARTUP_WINDOW: std::ops::RangeInclusive<u32> = 20..=50;
    const UPPER_BAND: std::ops::RangeInclusive<u32> = 100..=150;
    const RESET_BAND: std::ops::RangeInclusive<u32> = 40..=80;

    pub fn new() -> Self {
        Self::with_rng(SmallRng::from_entropy())
    }

    /// Deterministic construction for tests.
    pub fn with_rng(mut rng: SmallRng) -> Self {
        let cwnd = rng.gen_range(Self::STARTUP_WINDOW);
        Self {
            cwnd,
            ssthresh: INITIAL_SSTHRESH,
            rng,
        }
    }

    pub fn cwnd(&self) -> u32 {
        self.cwnd
    }

    pub fn ssthresh(&self) -> u32 {
        self.ssthresh
    }

    /// A burst was acknowledged within the timeout.
    pub fn on_confirmation(&mut self) {
        if self.cwnd < self.ssthresh {
            self.cwnd *= 2;
        } else if self.cwnd > self.rng.gen_range(Self::UPPER_BAND) {
            self.cwnd = self.rng.gen_range(Self::RESET_BAND);
        } else {
            self.cwnd += 1;
        }
        debug!("cwnd {} ssthresh {}", self.cwnd, self.ssthresh);
    }

    /// No qualifying ACK arrived within the timeout.
    pub fn on_timeout(&mut self) {
        self.ssthresh = (self.cwnd / 2).max(1);
        self.cwnd = self.ssthresh;
        debug!("timeout: cwnd {} ssthresh {}", self.cwnd, self.ssthresh);
    }

    /// Pacing parameters for draining the current window at `bitrate_kbps`.
    pub fn snapshot(&self, bitrate_kbps: u32) -> CongestionSnapshot {
        let exact_pps = self.cwnd as f64 * MSS as f64 / DATAGRAM_SIZE as f64 * PACING_MULTIPLIER;
        let burst_packets = (exact_pps.ceil() as u32).max(1);

        let window_bits = self.cwnd as f64 * (MSS * 8) as f64;
        let seconds =
            window_bits * PACING_MULTIPLIER / (bitrate_kbps as f64 * 1000.0) * PACING_TRIM;
        let pacing_interval = Duration::from_secs_f64(seconds);
        trace!(
            "pacing: cwnd {} burst {} interval {:?} at {} kbps",
            self.cwnd,
            burst_packets,
            pacing_interval,
            bitrate_kbps
        );

        CongestionSnapshot {
            cwnd: self.cwnd,
            burst_packets,
            pacing_interval,
        }
    }
}

impl Default for CongestionController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(seed: u64) -> CongestionController {
        CongestionController::with_rng(SmallRng::seed_from_u64(seed))
    }

    #[test]
    fn starts_within_bounds() {
        for seed in 0..64 {
            let cc = controller(seed);
            assert!(CongestionController::STARTUP_WINDOW.contains(&cc.cwnd()));
            assert_eq!(cc.ssthresh(), 64);
        }
    }

    #[test]
    fn slow_start_doubles() {
        let mut cc = controller(7);
        let before = cc.cwnd();
        assert!(before < cc.ssthresh());
        cc.on_confirmation();
        assert_eq!(cc.cwnd(), before * 2);
    }

    #[test]
    fn high_window_redrawn_into_lower_band() {
        let mut cc = controller(7);
        cc.cwnd = 200;
        cc.ssthresh = 64;
        cc.on_confirmation();
        assert!(CongestionController::RESET_BAND.contains(&cc.cwnd()));
    }

    #[test]
    fn linear_increase_between_bands() {
        let mut cc = controller(7);
        cc.cwnd = 70;
        cc.ssthresh = 64;
        cc.on_confirmation();
        // 70 is below the lowest possible upper-band draw
        assert_eq!(cc.cwnd(), 71);
    }

    #[test]
    fn timeout_halves_and_floors_at_one() {
        let mut cc = controller(7);
        cc.cwnd = 9;
        cc.on_timeout();
        assert_eq!(cc.cwnd(), 4);
        assert_eq!(cc.ssthresh(), 4);

        cc.cwnd = 1;
        cc.on_timeout();
        assert_eq!(cc.cwnd(), 1);
    }

    #[test]
    fn cwnd_never_below_one() {
        for seed in 0..16 {
            let mut cc = controller(seed);
            for step in 0..1000 {
                if step % 3 == 0 {
                    cc.on_timeout();
                } else {
                    cc.on_confirmation();
                }
                assert!(cc.cwnd() >= 1);
            }
        }
    }

    #[test]
    fn pacing_scales_inversely_with_bitrate() {
        let cc = controller(7);
        let slow = cc.snapshot(300).pacing_interval;
        let fast = cc.snapshot(4300).pacing_interval;
        assert!(slow > fast);
        assert!(cc.snapshot(300).burst_packets >= cc.cwnd());
    }
}
