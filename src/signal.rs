//! Velocity/position signal processing for the monitor sample stream.
//!
//! BLE transmission corruption shows up as wild position excursions that no
//! cable can physically perform. The processor keeps the last known-good
//! position per channel, substitutes it for gross spikes, rejects samples
//! that fail range or jump validation, and derives an EMA-smoothed signed
//! velocity from the accepted position history. Velocity stays signed so
//! jitter oscillations average toward zero instead of biasing high;
//! magnitude thresholds elsewhere use `abs(velocity)`.

use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::types::{PollStats, SignalConfig, WorkoutMetric};

/// Stateful per-connection sample filter and velocity estimator
#[derive(Debug)]
pub struct SignalProcessor {
    config: SignalConfig,
    last_position_a: Option<f32>,
    last_position_b: Option<f32>,
    last_good_a: Option<f32>,
    last_good_b: Option<f32>,
    velocity_a: f32,
    velocity_b: f32,
    last_sample_at: Option<Instant>,
    gap_min: Duration,
    gap_max: Duration,
    gap_sum: Duration,
    gap_count: u64,
}

impl SignalProcessor {
    /// Create a processor with the given thresholds
    #[must_use]
    pub fn new(config: SignalConfig) -> Self {
        Self {
            config,
            last_position_a: None,
            last_position_b: None,
            last_good_a: None,
            last_good_b: None,
            velocity_a: 0.0,
            velocity_b: 0.0,
            last_sample_at: None,
            gap_min: Duration::MAX,
            gap_max: Duration::ZERO,
            gap_sum: Duration::ZERO,
            gap_count: 0,
        }
    }

    /// Forget all per-connection state
    pub fn reset(&mut self) {
        *self = Self::new(self.config.clone());
    }

    /// Run one sample through spike substitution, validation and velocity
    /// estimation
    ///
    /// Returns the sample with velocities filled in, or `None` when the
    /// sample was rejected. Rejected samples never update the last-good
    /// state.
    pub fn process(&mut self, metric: WorkoutMetric) -> Option<WorkoutMetric> {
        self.process_at(metric, Instant::now())
    }

    /// [`Self::process`] with an explicit clock, for deterministic tests
    pub fn process_at(&mut self, mut metric: WorkoutMetric, now: Instant) -> Option<WorkoutMetric> {
        // Gross excursions are radio corruption, not motion; substitute the
        // last good value before range/jump validation sees them.
        if metric.position_a.abs() > self.config.spike_threshold {
            if let Some(good) = self.last_good_a {
                trace!(raw = metric.position_a, "spike on channel A replaced");
                metric.position_a = good;
            }
        }
        if metric.position_b.abs() > self.config.spike_threshold {
            if let Some(good) = self.last_good_b {
                trace!(raw = metric.position_b, "spike on channel B replaced");
                metric.position_b = good;
            }
        }

        if !self.validate(metric.position_a, metric.load_a, metric.position_b, metric.load_b) {
            return None;
        }

        self.update_velocity(metric.position_a, metric.position_b, now);
        metric.velocity_a = self.velocity_a;
        metric.velocity_b = self.velocity_b;

        self.record_gap(now);
        self.last_position_a = Some(metric.position_a);
        self.last_position_b = Some(metric.position_b);
        self.last_good_a = Some(metric.position_a);
        self.last_good_b = Some(metric.position_b);
        self.last_sample_at = Some(now);

        Some(metric)
    }

    /// Check a sample against the position range and, when strict jump
    /// validation is enabled, against the inter-sample jump threshold
    #[must_use]
    pub fn validate(&self, pos_a: f32, _load_a: f32, pos_b: f32, _load_b: f32) -> bool {
        let in_range = |pos: f32| pos >= self.config.min_position && pos <= self.config.max_position;

        if !in_range(pos_a) || !in_range(pos_b) {
            debug!(pos_a, pos_b, "sample rejected: position out of range");
            return false;
        }

        if self.config.strict_jump_validation {
            let jumped = |pos: f32, last: Option<f32>| {
                last.is_some_and(|l| (pos - l).abs() > self.config.position_jump_threshold)
            };
            if jumped(pos_a, self.last_position_a) || jumped(pos_b, self.last_position_b) {
                debug!(pos_a, pos_b, "sample rejected: position jump too large");
                return false;
            }
        }

        true
    }

    fn update_velocity(&mut self, pos_a: f32, pos_b: f32, now: Instant) {
        let alpha = self.config.ema_alpha;
        let dt = self
            .last_sample_at
            .map_or(0.0, |t| now.duration_since(t).as_secs_f32());

        let raw = |pos: f32, last: Option<f32>| {
            if dt <= 0.0 {
                return 0.0;
            }
            last.map_or(0.0, |l| (pos - l) / dt)
        };

        let raw_a = raw(pos_a, self.last_position_a);
        let raw_b = raw(pos_b, self.last_position_b);

        self.velocity_a = alpha.mul_add(raw_a, (1.0 - alpha) * self.velocity_a);
        self.velocity_b = alpha.mul_add(raw_b, (1.0 - alpha) * self.velocity_b);
    }

    fn record_gap(&mut self, now: Instant) {
        if let Some(last) = self.last_sample_at {
            let gap = now.duration_since(last);
            self.gap_min = self.gap_min.min(gap);
            self.gap_max = self.gap_max.max(gap);
            self.gap_sum += gap;
            self.gap_count += 1;
        }
    }

    /// Inter-sample gap statistics, for diagnostic visibility only
    #[must_use]
    pub fn poll_stats(&self) -> PollStats {
        if self.gap_count == 0 {
            return PollStats::default();
        }
        #[allow(clippy::cast_precision_loss)]
        PollStats {
            min_gap_ms: self.gap_min.as_secs_f64() * 1000.0,
            max_gap_ms: self.gap_max.as_secs_f64() * 1000.0,
            mean_gap_ms: self.gap_sum.as_secs_f64() * 1000.0 / self.gap_count as f64,
            samples: self.gap_count,
        }
    }

    /// Current smoothed velocities (channel A, channel B)
    #[must_use]
    pub const fn velocities(&self) -> (f32, f32) {
        (self.velocity_a, self.velocity_b)
    }
}

impl Default for SignalProcessor {
    fn default() -> Self {
        Self::new(SignalConfig::default())
    }
}
