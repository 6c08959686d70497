//! Retransmission-timeout estimation, Jacobson/Karels style.

use std::time::Duration;

/// Smoothed RTT, RTT deviation and the derived retransmission timeout for
/// one stream.
///
/// On each in-time acknowledgment:
/// `rttvar = 0.75*rttvar + 0.25*|sample - srtt|`,
/// `srtt = 0.875*srtt + 0.125*sample`, `rto = srtt + 4*rttvar`. The first
/// sample seeds both estimates. On a timeout the rto doubles.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RtoEstimator {
    srtt: Option<f64>,
    rttvar: f64,
    rto: Duration,
}

impl RtoEstimator {
    /// Timeout used before the first sample arrives.
    const INITIAL_RTO: Duration = Duration::from_secs(1);
    /// The rto must never reach zero; exponential backoff must not run away.
    const MIN_RTO: Duration = Duration::from_millis(10);
    const MAX_RTO: Duration = Duration::from_secs(64);

    pub fn new() -> Self {
        Self {
            srtt: None,
            rttvar: 0.0,
            rto: Self::INITIAL_RTO,
        }
    }

    pub fn update(&mut self, sample: Duration) {
        let sample = sample.as_secs_f64();
        let srtt = match self.srtt {
            None => {
                self.rttvar = sample;
                sample
            }
            Some(srtt) => {
                self.rttvar = 0.75 * self.rttvar + 0.25 * (sample - srtt).abs();
                0.875 * srtt + 0.125 * sample
            }
        };
        self.srtt = Some(srtt);
        let rto = srtt + 4.0 * self.rttvar;
        self.rto = Duration::from_secs_f64(rto).clamp(Self::MIN_RTO, Self::MAX_RTO);
    }

    /// Exponential backoff after a timeout with no qualifying ACK.
    pub fn backoff(&mut self) {
        self.rto = (self.rto * 2).min(Self::MAX_RTO);
    }

    pub fn rto(&self) -> Duration {
        self.rto
    }

    pub fn srtt(&self) -> Option<Duration> {
        self.srtt.map(Duration::from_secs_f64)
    }

    pub fn rttvar(&self) -> Duration {
        Duration::from_secs_f64(self.rttvar)
    }
}

impl Default for RtoEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_seeds_both_estimates() {
        let mut est = RtoEstimator::new();
        est.update(Duration::from_millis(100));

        assert_eq!(est.srtt(), Some(Duration::from_millis(100)));
        assert_eq!(est.rttvar(), Duration::from_millis(100));
        // srtt + 4 * rttvar
        assert_eq!(est.rto(), Duration::from_millis(500));
    }

    #[test]
    fn ewma_update() {
        let mut est = RtoEstimator::new();
        est.update(Duration::from_millis(100));
        est.update(Duration::from_millis(200));

        // srtt = 0.875*0.1 + 0.125*0.2, rttvar = 0.75*0.1 + 0.25*0.1
        let srtt = est.srtt().unwrap().as_secs_f64();
        assert!((srtt - 0.1125).abs() < 1e-9);
        assert!((est.rttvar().as_secs_f64() - 0.1).abs() < 1e-9);
        assert!((est.rto().as_secs_f64() - 0.5125).abs() < 1e-9);
    }

    #[test]
    fn backoff_strictly_increases_until_cap() {
        let mut est = RtoEstimator::new();
        let mut prev = est.rto();
        for _ in 0..6 {
            est.backoff();
            assert!(est.rto() > prev);
            prev = est.rto();
        }
        assert_eq!(est.rto(), Duration::from_secs(64));
        est.backoff();
        assert_eq!(est.rto(), Duration::from_secs(64));
    }

    #[test]
    fn rto_bounded_below() {
        let mut est = RtoEstimator::new();
        for _ in 0..32 {
            est.update(Duration::from_micros(1));
        }
        assert!(est.rto() >= Duration::from_millis(10));
    }
}
