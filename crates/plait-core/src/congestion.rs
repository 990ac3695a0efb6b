//! Loss-driven congestion window and RTT estimation.
//!
//! The window is counted in reliable sends (slots), not bytes. It only moves
//! in two situations:
//!
//! - every [`LOSS_SAMPLE`] resolved sends, a loss rate above the threshold
//!   shrinks it proportionally (never below the floor)
//! - when the window is observed full, it grows by an eighth of the gap to
//!   `RTO / age_of_oldest_unacked * cwnd * 0.9`
//!
//! RTT follows Jacobson/Karels: `RTO = SRTT + 4 * RTTVAR`.

use crate::config::{TunnelConfig, millis};
use std::collections::VecDeque;

/// Resolved sends per loss-rate evaluation
pub const LOSS_SAMPLE: usize = 64;

/// Fraction of the RTO-derived target the window aims for
const TARGET_GAIN: f64 = 0.9;

/// Share of the gap closed per full-window observation
const GROWTH_SHARE: f64 = 0.125;

/// Jacobson/Karels RTT estimator
#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt: Option<f64>,
    rttvar: f64,
    rto_ms: u64,
    min_rto_ms: u64,
    max_rto_ms: u64,
}

impl RttEstimator {
    /// Estimator with the configured initial RTO and clamps
    #[must_use]
    pub fn new(config: &TunnelConfig) -> Self {
        Self {
            srtt: None,
            rttvar: 0.0,
            rto_ms: millis(config.initial_rto),
            min_rto_ms: millis(config.min_rto),
            max_rto_ms: millis(config.max_rto),
        }
    }

    /// Fold in one round-trip sample
    pub fn update(&mut self, rtt_ms: u64) {
        let r = rtt_ms as f64;
        match self.srtt {
            None => {
                self.srtt = Some(r);
                self.rttvar = r / 2.0;
            }
            Some(srtt) => {
                self.rttvar = 0.75 * self.rttvar + 0.25 * (srtt - r).abs();
                self.srtt = Some(0.875 * srtt + 0.125 * r);
            }
        }
        let srtt = self.srtt.unwrap_or(r);
        let rto = (srtt + 4.0 * self.rttvar).ceil() as u64;
        self.rto_ms = rto.clamp(self.min_rto_ms, self.max_rto_ms);
    }

    /// Current retransmission timeout
    #[must_use]
    pub fn rto_ms(&self) -> u64 {
        self.rto_ms
    }

    /// Smoothed RTT, once sampled
    #[must_use]
    pub fn srtt_ms(&self) -> Option<u64> {
        self.srtt.map(|s| s.round() as u64)
    }
}

/// Congestion window in slots
#[derive(Debug, Clone)]
pub struct CongestionWindow {
    cwnd: f64,
    min: f64,
    max: f64,
    loss_threshold: f64,
    acked: usize,
    lost: usize,
}

impl CongestionWindow {
    /// Window with the configured initial size, floor and ceiling
    #[must_use]
    pub fn new(config: &TunnelConfig) -> Self {
        Self {
            cwnd: config.initial_window as f64,
            min: config.min_window as f64,
            max: config.window_capacity as f64,
            loss_threshold: config.loss_threshold,
            acked: 0,
            lost: 0,
        }
    }

    /// Current window in whole slots
    #[must_use]
    pub fn cwnd(&self) -> usize {
        self.cwnd as usize
    }

    /// Whether `in_flight` sends fill the window
    #[must_use]
    pub fn is_full(&self, in_flight: usize) -> bool {
        in_flight >= self.cwnd()
    }

    /// Count an acknowledged send
    pub fn on_packet_acked(&mut self) {
        self.acked += 1;
        self.evaluate();
    }

    /// Count a lost send
    pub fn on_packet_lost(&mut self) {
        self.lost += 1;
        self.evaluate();
    }

    fn evaluate(&mut self) {
        let total = self.acked + self.lost;
        if total < LOSS_SAMPLE {
            return;
        }
        let rate = self.lost as f64 / total as f64;
        if rate > self.loss_threshold {
            self.cwnd = (self.cwnd * (1.0 - rate)).max(self.min);
            tracing::debug!(rate, cwnd = self.cwnd(), "congestion window shrunk");
        }
        self.acked = 0;
        self.lost = 0;
    }

    /// Grow toward the RTO-derived target after the window filled up
    pub fn on_window_full(&mut self, rto_ms: u64, oldest_age_ms: u64) {
        let age = oldest_age_ms.max(1) as f64;
        let target = (rto_ms as f64 / age) * self.cwnd * TARGET_GAIN;
        if target > self.cwnd {
            self.cwnd = (self.cwnd + (target - self.cwnd) * GROWTH_SHARE).min(self.max);
        }
    }
}

/// One resolved reliable send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sample {
    Acked { rtt_ms: Option<u32> },
    Lost,
}

/// Loss and latency over a trailing time window
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LinkQuality {
    /// Mean RTT of sampled acks
    pub latency_ms: Option<u32>,
    /// Lost share of resolved sends
    pub loss_rate: f64,
    /// Resolved sends in the window
    pub samples: usize,
}

/// Bounded history of resolved sends
#[derive(Debug, Clone)]
pub struct QualityHistory {
    samples: VecDeque<(u64, Sample)>,
    capacity: usize,
}

impl QualityHistory {
    /// History holding at most `capacity` samples
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    fn push(&mut self, at_ms: u64, sample: Sample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back((at_ms, sample));
    }

    /// Record an ack, with its RTT when one was measured
    pub fn record_ack(&mut self, at_ms: u64, rtt_ms: Option<u32>) {
        self.push(at_ms, Sample::Acked { rtt_ms });
    }

    /// Record a loss
    pub fn record_loss(&mut self, at_ms: u64) {
        self.push(at_ms, Sample::Lost);
    }

    /// Summarize samples newer than `now - window_ms`
    #[must_use]
    pub fn quality(&self, now_ms: u64, window_ms: u64) -> LinkQuality {
        let since = now_ms.saturating_sub(window_ms);
        let (mut total, mut lost, mut rtt_sum, mut rtt_count) = (0usize, 0usize, 0u64, 0u64);
        for (at, sample) in self.samples.iter().rev() {
            if *at < since {
                break;
            }
            total += 1;
            match sample {
                Sample::Lost => lost += 1,
                Sample::Acked { rtt_ms: Some(r) } => {
                    rtt_sum += u64::from(*r);
                    rtt_count += 1;
                }
                Sample::Acked { rtt_ms: None } => {}
            }
        }
        LinkQuality {
            latency_ms: (rtt_count > 0).then(|| (rtt_sum / rtt_count) as u32),
            loss_rate: if total == 0 {
                0.0
            } else {
                lost as f64 / total as f64
            },
            samples: total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtt_initial_rto() {
        let est = RttEstimator::new(&TunnelConfig::default());
        assert_eq!(est.rto_ms(), 1_000);
        assert_eq!(est.srtt_ms(), None);
    }

    #[test]
    fn test_rtt_first_sample() {
        let mut est = RttEstimator::new(&TunnelConfig::default());
        est.update(100);
        assert_eq!(est.srtt_ms(), Some(100));
        // 100 + 4 * 50
        assert_eq!(est.rto_ms(), 300);
    }

    #[test]
    fn test_rtt_clamped() {
        let mut est = RttEstimator::new(&TunnelConfig::default());
        est.update(1);
        assert_eq!(est.rto_ms(), 100);
        for _ in 0..50 {
            est.update(60_000);
        }
        assert_eq!(est.rto_ms(), 10_000);
    }

    #[test]
    fn test_cwnd_shrinks_on_heavy_loss() {
        let mut cw = CongestionWindow::new(&TunnelConfig {
            initial_window: 200,
            ..Default::default()
        });
        for i in 0..LOSS_SAMPLE {
            if i % 2 == 0 {
                cw.on_packet_lost();
            } else {
                cw.on_packet_acked();
            }
        }
        assert_eq!(cw.cwnd(), 100);
    }

    #[test]
    fn test_cwnd_floor() {
        let mut cw = CongestionWindow::new(&TunnelConfig::default());
        for _ in 0..LOSS_SAMPLE * 4 {
            cw.on_packet_lost();
        }
        assert_eq!(cw.cwnd(), 64);
    }

    #[test]
    fn test_cwnd_tolerates_light_loss() {
        let mut cw = CongestionWindow::new(&TunnelConfig::default());
        cw.on_packet_lost();
        cw.on_packet_lost();
        for _ in 0..LOSS_SAMPLE - 2 {
            cw.on_packet_acked();
        }
        assert_eq!(cw.cwnd(), 64);
    }

    #[test]
    fn test_cwnd_ten_percent_loss() {
        let mut cw = CongestionWindow::new(&TunnelConfig {
            initial_window: 1_000,
            ..Default::default()
        });
        // 6 of 64 lost
        for i in 0..LOSS_SAMPLE {
            if i % 11 == 5 {
                cw.on_packet_lost();
            } else {
                cw.on_packet_acked();
            }
        }
        assert_eq!(cw.cwnd(), 906);
    }

    #[test]
    fn test_cwnd_kept_without_loss() {
        let mut cw = CongestionWindow::new(&TunnelConfig {
            initial_window: 1_000,
            ..Default::default()
        });
        for _ in 0..LOSS_SAMPLE * 20 {
            cw.on_packet_acked();
        }
        assert_eq!(cw.cwnd(), 1_000);
        cw.on_window_full(1_000, 500);
        let grown = cw.cwnd();
        assert!(grown > 1_000);
        for _ in 0..LOSS_SAMPLE * 20 {
            cw.on_packet_acked();
        }
        assert_eq!(cw.cwnd(), grown);
    }

    #[test]
    fn test_cwnd_grows_when_full_and_fast() {
        let mut cw = CongestionWindow::new(&TunnelConfig::default());
        cw.on_window_full(1_000, 100);
        // target = 10 * 64 * 0.9 = 576, gap 512, +64
        assert_eq!(cw.cwnd(), 128);
        cw.on_window_full(1_000, 950);
        assert_eq!(cw.cwnd(), 128);
    }

    #[test]
    fn test_history_quality() {
        let mut h = QualityHistory::new(4);
        h.record_loss(0);
        h.record_ack(10, Some(30));
        h.record_ack(20, Some(50));
        h.record_ack(30, None);
        h.record_loss(40);
        let q = h.quality(40, 1_000);
        assert_eq!(q.samples, 4);
        assert_eq!(q.latency_ms, Some(40));
        assert!((q.loss_rate - 0.25).abs() < f64::EPSILON);

        let recent = h.quality(40, 15);
        assert_eq!(recent.samples, 2);
    }
}
