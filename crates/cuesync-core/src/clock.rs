//! Server clock estimation
//!
//! Each heartbeat yields one sample `local receipt time - server reference time`,
//! which is the true clock offset plus the one-way network latency. Samples are
//! smoothed with an exponentially weighted moving average so that a single
//! delayed frame does not yank the timeline around.

use std::sync::atomic::{AtomicI64, Ordering};

use crate::error::StaleClockError;

/// Source of local wall-clock time in milliseconds
pub trait LocalClock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// Wall clock of this machine
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl LocalClock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to; for simulations and tests
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(start_ms),
        }
    }

    pub fn advance(&self, ms: i64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: i64) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl LocalClock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Smoothed estimate of `local time - server time`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockOffset {
    /// Milliseconds to add to a server time to get local time
    pub offset_ms: f64,
    /// Exponentially weighted variance of the samples around the offset (ms²)
    pub variance: f64,
    /// 0.0 (know nothing) to 1.0 (warmed up and fresh)
    pub confidence: f64,
    /// Heartbeats observed so far
    pub samples: u32,
}

impl ClockOffset {
    /// Estimate before any heartbeat has arrived
    pub const UNKNOWN: ClockOffset = ClockOffset {
        offset_ms: 0.0,
        variance: 0.0,
        confidence: 0.0,
        samples: 0,
    };

    /// Server clock reading corresponding to a local instant
    pub fn server_time_at(&self, local_ms: i64) -> f64 {
        local_ms as f64 - self.offset_ms
    }

    /// Local instant corresponding to a server clock reading
    pub fn local_time_at(&self, server_ms: i64) -> i64 {
        (server_ms as f64 + self.offset_ms).round() as i64
    }

    /// Standard deviation of the samples
    pub fn jitter_ms(&self) -> f64 {
        self.variance.max(0.0).sqrt()
    }

    pub fn is_confident(&self, threshold: f64) -> bool {
        self.confidence >= threshold
    }
}

/// Tuning for [`TimelineEstimator`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EstimatorSettings {
    /// Weight of the newest sample (α)
    pub smoothing_factor: f64,
    /// Samples needed to reach full confidence
    pub warmup_samples: u32,
    /// Silence after which confidence starts to decay, in ms
    pub staleness_ms: i64,
}

impl Default for EstimatorSettings {
    fn default() -> Self {
        Self {
            smoothing_factor: 0.2,
            warmup_samples: 3,
            staleness_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Smoothed {
    offset_ms: f64,
    variance: f64,
    samples: u32,
    last_observed_at: i64,
}

/// Turns heartbeat reference times into a local clock offset
#[derive(Debug, Clone)]
pub struct TimelineEstimator {
    settings: EstimatorSettings,
    smoothed: Option<Smoothed>,
}

impl TimelineEstimator {
    pub fn new(settings: EstimatorSettings) -> Self {
        Self {
            settings,
            smoothed: None,
        }
    }

    pub fn settings(&self) -> &EstimatorSettings {
        &self.settings
    }

    /// Fold in one heartbeat
    ///
    /// `newOffset = α·(localReceiptTime − serverReferenceTime) + (1−α)·oldOffset`;
    /// the first sample is taken as-is.
    pub fn observe(&mut self, server_reference_ms: i64, local_receipt_ms: i64) -> ClockOffset {
        let sample = (local_receipt_ms - server_reference_ms) as f64;
        let alpha = self.settings.smoothing_factor;

        let next = match self.smoothed {
            None => Smoothed {
                offset_ms: sample,
                variance: 0.0,
                samples: 1,
                last_observed_at: local_receipt_ms,
            },
            Some(prev) => {
                let residual = sample - prev.offset_ms;
                Smoothed {
                    offset_ms: alpha * sample + (1.0 - alpha) * prev.offset_ms,
                    variance: (1.0 - alpha) * (prev.variance + alpha * residual * residual),
                    samples: prev.samples.saturating_add(1),
                    last_observed_at: prev.last_observed_at.max(local_receipt_ms),
                }
            }
        };
        self.smoothed = Some(next);

        self.estimate(local_receipt_ms)
    }

    /// Current offset with confidence evaluated at local time `now_ms`
    pub fn estimate(&self, now_ms: i64) -> ClockOffset {
        let Some(s) = self.smoothed else {
            return ClockOffset::UNKNOWN;
        };

        let warmup = self.settings.warmup_samples.max(1) as f64;
        let mut confidence = (s.samples as f64 / warmup).min(1.0);

        let staleness = self.settings.staleness_ms.max(1);
        let age = now_ms - s.last_observed_at;
        if age > staleness {
            // Halve per additional staleness window of silence
            let windows = (age - staleness) as f64 / staleness as f64;
            confidence *= 0.5_f64.powf(windows);
        }

        ClockOffset {
            offset_ms: s.offset_ms,
            variance: s.variance,
            confidence: confidence.clamp(0.0, 1.0),
            samples: s.samples,
        }
    }

    /// Estimate, or an error when it is too uncertain to act on
    pub fn require_confidence(
        &self,
        now_ms: i64,
        threshold: f64,
    ) -> Result<ClockOffset, StaleClockError> {
        let estimate = self.estimate(now_ms);
        if estimate.is_confident(threshold) {
            Ok(estimate)
        } else {
            Err(StaleClockError {
                confidence: estimate.confidence,
                threshold,
            })
        }
    }

    /// Local time of the most recent heartbeat
    pub fn last_observed_at(&self) -> Option<i64> {
        self.smoothed.map(|s| s.last_observed_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn estimator() -> TimelineEstimator {
        TimelineEstimator::new(EstimatorSettings::default())
    }

    #[test]
    fn test_no_samples_is_unknown() {
        let est = estimator();
        assert_eq!(est.estimate(1_000), ClockOffset::UNKNOWN);
        assert!(est.require_confidence(1_000, 0.5).is_err());
    }

    #[test]
    fn test_first_sample_taken_as_is() {
        let mut est = estimator();
        let offset = est.observe(1_000, 1_050);
        assert!((offset.offset_ms - 50.0).abs() < 1e-9);
        assert_eq!(offset.samples, 1);
        assert_eq!(offset.variance, 0.0);
    }

    #[test]
    fn test_smoothing_formula() {
        let mut est = estimator();
        est.observe(1_000, 1_050); // offset 50
        let offset = est.observe(2_000, 2_150); // sample 150
        // 0.2 * 150 + 0.8 * 50
        assert!((offset.offset_ms - 70.0).abs() < 1e-9);
        assert!(offset.variance > 0.0);
    }

    #[test]
    fn test_single_outlier_is_damped() {
        let mut est = estimator();
        for i in 0..10 {
            est.observe(i * 1_000, i * 1_000 + 50);
        }
        let offset = est.observe(10_000, 10_000 + 550);
        assert!(offset.offset_ms < 160.0, "outlier moved offset too far");
        assert!(offset.offset_ms > 50.0);
    }

    #[test]
    fn test_confidence_rises_with_samples() {
        let mut est = estimator();
        let c1 = est.observe(0, 50).confidence;
        let c2 = est.observe(1_000, 1_050).confidence;
        let c3 = est.observe(2_000, 2_050).confidence;
        let c4 = est.observe(3_000, 3_050).confidence;
        assert!(c1 < c2 && c2 < c3);
        assert_eq!(c3, 1.0);
        assert_eq!(c4, 1.0);
    }

    #[test]
    fn test_confidence_decays_when_stale() {
        let mut est = estimator();
        for i in 0..3 {
            est.observe(i * 1_000, i * 1_000 + 50);
        }
        let last = 2_050;

        // Within the staleness window nothing changes
        assert_eq!(est.estimate(last + 10_000).confidence, 1.0);
        // One extra window of silence halves it
        let half = est.estimate(last + 20_000).confidence;
        assert!((half - 0.5).abs() < 1e-9);
        // Never negative
        assert!(est.estimate(last + 1_000_000).confidence >= 0.0);

        assert!(est.require_confidence(last + 25_000, 0.5).is_err());
    }

    #[test]
    fn test_fresh_sample_restores_confidence() {
        let mut est = estimator();
        for i in 0..3 {
            est.observe(i * 1_000, i * 1_000 + 50);
        }
        assert!(est.estimate(60_000).confidence < 0.5);

        let offset = est.observe(58_000, 58_050);
        assert_eq!(offset.confidence, 1.0);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(1_000);
        clock.advance(250);
        assert_eq!(clock.now_ms(), 1_250);
        clock.set(5);
        assert_eq!(clock.now_ms(), 5);
    }

    #[test]
    fn test_time_conversion() {
        let offset = ClockOffset {
            offset_ms: 50.0,
            variance: 0.0,
            confidence: 1.0,
            samples: 3,
        };
        assert_eq!(offset.local_time_at(1_000), 1_050);
        assert!((offset.server_time_at(3_050) - 3_000.0).abs() < 1e-9);
    }
}
