//! Measurement math shared by the throughput and ping phases.
//!
//! [`ThroughputMeter`] turns a running byte total into a bandwidth value,
//! discarding the grace window at the start of a phase. [`JitterEstimator`]
//! folds round-trip samples into smoothed ping and jitter values.

use std::time::Duration;
use tokio::time::Instant;

/// How often the throughput sampler runs.
pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(200);

/// Unit used when reporting bandwidth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateUnit {
    /// 1 Mbps = 1,000,000 bits per second.
    Megabits,
    /// 1 Mibps = 1,048,576 bits per second.
    Mebibits,
}

impl RateUnit {
    pub fn divisor(&self) -> f64 {
        match self {
            RateUnit::Megabits => 1_000_000.0,
            RateUnit::Mebibits => 1_048_576.0,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RateUnit::Megabits => "Mbps",
            RateUnit::Mebibits => "Mibps",
        }
    }
}

/// Convert a byte rate into the reported bandwidth value.
///
/// Bytes become bits, the transport overhead factor is applied and the
/// result is scaled to mega- or mebibits per second.
pub fn bandwidth_value(
    bytes_per_second: f64,
    overhead_factor: f64,
    unit: RateUnit,
) -> f64 {
    bytes_per_second * 8.0 * overhead_factor / unit.divisor()
}

/// Round to the two decimals that are published to the host.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Parameters for one throughput phase.
#[derive(Debug, Clone, Copy)]
pub struct MeterConfig {
    /// Length of the measured window once the grace period is over.
    pub duration: Duration,
    /// Initial window discarded to let TCP ramp up.
    pub grace: Duration,
    /// Multiplier compensating for protocol overhead.
    pub overhead_factor: f64,
    pub unit: RateUnit,
}

/// Result of one sampler tick.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Sample {
    /// Progress fraction, only once the grace window is over.
    pub progress: Option<f64>,
    /// Current bandwidth value, rounded to two decimals.
    pub value: Option<f64>,
    /// Whether the phase should end now.
    pub done: bool,
}

/// Running byte total plus the clock of the current measurement window.
#[derive(Debug)]
pub struct ThroughputMeter {
    config: MeterConfig,
    window_start: Instant,
    total_bytes: u64,
    grace_done: bool,
}

impl ThroughputMeter {
    pub fn new(config: MeterConfig, started: Instant) -> Self {
        Self { config, window_start: started, total_bytes: 0, grace_done: false }
    }

    /// Add bytes moved by one of the streams.
    pub fn add(&mut self, bytes: u64) {
        self.total_bytes = self.total_bytes.saturating_add(bytes);
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn grace_done(&self) -> bool {
        self.grace_done
    }

    /// Run one sampler tick at `now`.
    ///
    /// While the grace window runs nothing is published. When it elapses the
    /// window is restarted, unless not a single byte has arrived yet: on a
    /// connection that slow the grace bytes are all there is to measure.
    pub fn sample(&mut self, now: Instant, failed: bool) -> Sample {
        let elapsed = now.saturating_duration_since(self.window_start);
        let mut sample = Sample::default();

        if self.grace_done {
            let fraction = if self.config.duration.is_zero() {
                1.0
            } else {
                elapsed.as_secs_f64() / self.config.duration.as_secs_f64()
            };
            sample.progress = Some(fraction.clamp(0.0, 1.0));
        }

        if failed {
            sample.done = true;
            return sample;
        }

        if elapsed < SAMPLE_INTERVAL {
            return sample;
        }

        if !self.grace_done {
            if elapsed > self.config.grace {
                if self.total_bytes > 0 {
                    self.window_start = now;
                    self.total_bytes = 0;
                }
                self.grace_done = true;
            }
            return sample;
        }

        let rate = self.total_bytes as f64 / elapsed.as_secs_f64();
        let value = round2(bandwidth_value(
            rate,
            self.config.overhead_factor,
            self.config.unit,
        ));

        sample.value = Some(value);
        sample.done = elapsed > self.config.duration && value > 0.0;
        sample
    }
}

/// Pick the round-trip estimate for one ping.
///
/// `measured` is wall time around the request. A response-start timing from
/// the transport replaces it when it is strictly between zero and the
/// wall-clock value.
pub fn refine_round_trip(
    measured: Duration,
    response_start: Option<Duration>,
    allow_precise_timing: bool,
) -> f64 {
    let measured_ms = measured.as_secs_f64() * 1000.0;

    if !allow_precise_timing {
        return measured_ms;
    }

    match response_start.map(|t| t.as_secs_f64() * 1000.0) {
        Some(precise) if precise > 0.0 && precise < measured_ms => precise,
        _ => measured_ms,
    }
}

/// Exponentially weighted ping and jitter.
///
/// Rising jitter is weighted at 80% so spikes show up at once; falling
/// jitter decays at 10% per sample. Ping is a plain 90/10 average seeded by
/// the first sample.
#[derive(Debug, Clone, Default)]
pub struct JitterEstimator {
    ping_ms: f64,
    jitter_ms: f64,
    previous_ms: f64,
    samples: usize,
}

impl JitterEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one round trip (milliseconds) into the estimates.
    pub fn record(&mut self, round_trip_ms: f64) {
        if !round_trip_ms.is_finite() || round_trip_ms < 0.0 {
            return;
        }

        let instant_jitter = (round_trip_ms - self.previous_ms).abs();

        if self.samples == 0 {
            self.ping_ms = round_trip_ms;
        } else {
            self.ping_ms = self.ping_ms * 0.9 + round_trip_ms * 0.1;
            self.jitter_ms = if instant_jitter > self.jitter_ms {
                self.jitter_ms * 0.2 + instant_jitter * 0.8
            } else {
                self.jitter_ms * 0.9 + instant_jitter * 0.1
            };
        }

        self.previous_ms = round_trip_ms;
        self.samples += 1;
    }

    pub fn ping_ms(&self) -> f64 {
        self.ping_ms
    }

    pub fn jitter_ms(&self) -> f64 {
        self.jitter_ms
    }

    /// Number of samples folded in so far.
    pub fn samples(&self) -> usize {
        self.samples
    }
}
