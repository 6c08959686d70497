//! Rate-based quality selection with buffer-occupancy hysteresis.

use std::collections::VecDeque;
use std::time::Instant;

use log::debug;

use crate::packet::BufferReport;

/// The bitrate ladder, in kbps. Tier `i` maps to `video{i+1}` in storage.
pub const BITRATES_KBPS: [u32; 6] = [300, 750, 1200, 1850, 2850, 4300];

/// Bitrate assumed until enough throughput samples exist.
const BOOTSTRAP_KBPS: f64 = 750.0;
/// Headroom required before a tier qualifies: the estimate must exceed the
/// tier bitrate by this factor.
const SAFETY_MARGIN: f64 = 1.1;
/// Seconds of video per chunk, used to project buffer drain during a fetch.
const CHUNK_SECONDS: f64 = 4.0;
/// Projected occupancy must stay above this for a one-tier upgrade.
const UPGRADE_BUFFER_SECONDS: f64 = 8.5;
/// Below this occupancy the selector backs off a tier.
const LOW_WATER_SECONDS: f64 = 4.5;
/// Samples considered by the pessimistic estimator.
const ESTIMATE_WINDOW: usize = 15;

/// One throughput measurement, appended on every confirmed pacing round.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThroughputSample {
    pub rate_bps: f64,
    pub at: Instant,
}

/// Bounded ring of recent throughput samples for one stream.
#[derive(Debug)]
pub struct ThroughputWindow {
    samples: VecDeque<ThroughputSample>,
    capacity: usize,
}

impl ThroughputWindow {
    pub fn new() -> Self {
        Self::with_capacity(64)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > ESTIMATE_WINDOW);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, sample: ThroughputSample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    fn recent_kbps(&self, n: usize) -> impl Iterator<Item = f64> + '_ {
        let skip = self.samples.len().saturating_sub(n);
        self.samples.iter().skip(skip).map(|s| s.rate_bps / 1000.0)
    }
}

impl Default for ThroughputWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// Chooses the bitrate tier for the next chunk from recent throughput and
/// the latest client buffer report.
///
/// The throughput estimate is deliberately conservative: once enough history
/// exists it averages the two *worst* of the last fifteen samples, so a
/// single lucky burst cannot trigger an upgrade. Hysteresis then nudges the
/// mapped tier by at most one step in either direction based on buffer
/// occupancy.
#[derive(Debug)]
pub struct QualitySelector {
    previous_tier: usize,
    latest_report: Option<BufferReport>,
}

impl QualitySelector {
    pub fn new() -> Self {
        Self {
            // the prototype seeds playback at the second-highest rung
            previous_tier: 4,
            latest_report: None,
        }
    }

    /// Records a buffer-occupancy report. Reports are indexed by report
    /// sequence, not chunk id; a stale index never replaces a newer one.
    pub fn handle_report(&mut self, report: BufferReport) {
        match &self.latest_report {
            Some(latest) if latest.index > report.index => {}
            _ => self.latest_report = Some(report),
        }
    }

    pub fn previous_tier(&self) -> usize {
        self.previous_tier
    }

    /// Bitrate of the tier most recently selected, for pacing.
    pub fn current_bitrate_kbps(&self) -> u32 {
        BITRATES_KBPS[self.previous_tier]
    }

    /// Picks the tier for the next chunk request.
    pub fn select(&mut self, window: &ThroughputWindow) -> usize {
        let estimate = estimate_kbps(window);

        let mut tier = 0;
        for i in (0..BITRATES_KBPS.len()).rev() {
            if estimate >= BITRATES_KBPS[i] as f64 * SAFETY_MARGIN {
                tier = i;
                break;
            }
        }

        match self.latest_report {
            Some(report) if report.buffer_seconds < LOW_WATER_SECONDS => {
                // starving: never rise above the previous tier, and back off
                tier = tier.min(self.previous_tier).saturating_sub(1);
            }
            Some(report) if tier < self.previous_tier && tier + 1 < BITRATES_KBPS.len() => {
                let projected = report.buffer_seconds
                    + CHUNK_SECONDS * estimate / BITRATES_KBPS[tier + 1] as f64;
                if projected > UPGRADE_BUFFER_SECONDS {
                    tier += 1;
                }
            }
            _ => {}
        }

        debug!(
            "quality: estimate {:.0} kbps, tier {} ({} kbps), buffer {:?}",
            estimate,
            tier,
            BITRATES_KBPS[tier],
            self.latest_report.map(|r| r.buffer_seconds),
        );
        self.previous_tier = tier;
        tier
    }
}

impl Default for QualitySelector {
    fn default() -> Self {
        Self::new()
    }
}

fn estimate_kbps(window: &ThroughputWindow) -> f64 {
    if window.len() < 3 {
        return BOOTSTRAP_KBPS;
    }
    if window.len() <= ESTIMATE_WINDOW {
        let recent: Vec<f64> = window.recent_kbps(2).collect();
        return recent.iter().sum::<f64>() / recent.len() as f64;
    }
    // mean of the two lowest among the last fifteen
    let mut recent: Vec<f64> = window.recent_kbps(ESTIMATE_WINDOW).collect();
    recent.sort_by(|a, b| a.total_cmp(b));
    (recent[0] + recent[1]) / 2.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::StreamId;

    fn window_of(rates_kbps: &[f64]) -> ThroughputWindow {
        let mut window = ThroughputWindow::new();
        for &r in rates_kbps {
            window.push(ThroughputSample {
                rate_bps: r * 1000.0,
                at: Instant::now(),
            });
        }
        window
    }

    fn report(buffer_seconds: f64, index: u64) -> BufferReport {
        BufferReport {
            stream: StreamId(1),
            buffer_seconds,
            index,
        }
    }

    #[test]
    fn bootstrap_below_three_samples() {
        let mut selector = QualitySelector::new();
        // 750 kbps bootstrap clears only the lowest rung at margin 1.1
        assert_eq!(selector.select(&window_of(&[9000.0, 9000.0])), 0);
    }

    #[test]
    fn maps_to_highest_tier_with_headroom() {
        let mut selector = QualitySelector::new();
        // 1000/1.1 = 909: highest tier not exceeding it is 750
        assert_eq!(selector.select(&window_of(&[1000.0, 1000.0, 1000.0])), 1);
    }

    #[test]
    fn pessimistic_beyond_fifteen_samples() {
        let mut rates = vec![4000.0; 18];
        rates[10] = 500.0;
        rates[16] = 700.0;
        // estimate = (500 + 700) / 2 = 600 -> clears only 300 * 1.1
        let mut selector = QualitySelector::new();
        assert_eq!(selector.select(&window_of(&rates)), 0);
    }

    #[test]
    fn low_buffer_caps_at_previous_and_backs_off() {
        let mut selector = QualitySelector::new();
        let window = window_of(&[5000.0, 5000.0, 5000.0]);

        selector.handle_report(report(10.0, 1));
        assert_eq!(selector.select(&window), 5);

        selector.handle_report(report(2.0, 2));
        let tier = selector.select(&window);
        assert!(tier <= 5);
        assert_eq!(tier, 4);

        // still starving: keeps stepping down, one tier per decision
        selector.handle_report(report(1.0, 3));
        assert_eq!(selector.select(&window), 3);
    }

    #[test]
    fn healthy_buffer_upgrades_one_tier() {
        let mut selector = QualitySelector::new();
        // previous tier starts at 4; mapped tier is 1
        selector.handle_report(report(8.0, 1));
        // projected: 8.0 + 4 * 1000 / 1200 = 11.3 > 8.5
        assert_eq!(selector.select(&window_of(&[1000.0, 1000.0, 1000.0])), 2);
    }

    #[test]
    fn stale_report_index_ignored() {
        let mut selector = QualitySelector::new();
        selector.handle_report(report(10.0, 5));
        selector.handle_report(report(1.0, 3));
        // the stale starving report must not cap the selection
        assert_eq!(selector.select(&window_of(&[5000.0, 5000.0, 5000.0])), 5);
    }

    #[test]
    fn ring_is_bounded() {
        let mut window = ThroughputWindow::with_capacity(16);
        for i in 0..100 {
            window.push(ThroughputSample {
                rate_bps: i as f64,
                at: Instant::now(),
            });
        }
        assert_eq!(window.len(), 16);
    }
}
