//! Round-trip clock synchronization.
//!
//! The initiating side periodically samples the peer's clock: it sends its
//! local time `T0`, the peer answers with its own time `Tr`, and on receipt at
//! `T1` we estimate one-way latency as half the round trip and the offset as
//! `Tr - T1 + latency`. Samples are gathered in cycles of `N` spread over a
//! window; each completed cycle replaces the offset with a mean that ignores
//! outliers.

use crate::config::ClockConfig;
use tracing::{debug, trace};

/// Samples further than this factor from the cycle median are discarded.
pub const OUTLIER_FACTOR: f64 = 1.5;

/// One completed round trip.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockSample {
    /// Estimated one-way latency in milliseconds.
    pub latency_ms: f64,
    /// Estimated `remote - local` offset in milliseconds.
    pub delta_ms: f64,
}

impl ClockSample {
    /// `t0`: local send time, `t1`: local receive time, `remote`: peer time
    /// embedded in the response. All UTC milliseconds.
    pub fn from_round_trip(t0: i64, t1: i64, remote: i64) -> Self {
        let latency_ms = ((t1 - t0) as f64 / 2.0).max(0.0);
        let delta_ms = (remote - t1) as f64 + latency_ms;
        Self {
            latency_ms,
            delta_ms,
        }
    }
}

fn median(sorted: &[f64]) -> f64 {
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Collapse one cycle of deltas into a single offset.
///
/// Takes the median, drops every delta whose magnitude exceeds
/// `OUTLIER_FACTOR * |median|`, and averages what is left. If nothing
/// survives the median itself is used. Returns `None` for an empty cycle.
pub fn reduce_cycle(deltas: &[f64]) -> Option<f64> {
    if deltas.is_empty() {
        return None;
    }

    let mut sorted = deltas.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let median = median(&sorted);
    let limit = OUTLIER_FACTOR * median.abs();

    let survivors: Vec<f64> = deltas.iter().copied().filter(|d| d.abs() <= limit).collect();
    if survivors.is_empty() {
        return Some(median);
    }
    Some(survivors.iter().sum::<f64>() / survivors.len() as f64)
}

/// Sampling schedule and current offset for one connection.
#[derive(Debug, Clone)]
pub struct ClockSync {
    sample_count: i32,
    spacing_ms: i64,
    interval_ms: i64,
    delta_ms: Option<f64>,
    cycle: Vec<f64>,
    next_due_ms: Option<i64>,
    outstanding: bool,
    cycles_completed: u64,
}

impl ClockSync {
    pub fn new(config: &ClockConfig) -> Self {
        let window_ms = config.sample_window.as_millis() as i64;
        let spacing_ms = if config.sample_count > 1 {
            window_ms / i64::from(config.sample_count)
        } else {
            0
        };

        Self {
            sample_count: config.sample_count,
            spacing_ms,
            interval_ms: config.sync_interval.as_millis() as i64,
            delta_ms: None,
            cycle: Vec::new(),
            next_due_ms: None,
            outstanding: false,
            cycles_completed: 0,
        }
    }

    /// A non-positive sample count turns sampling off.
    pub fn is_enabled(&self) -> bool {
        self.sample_count > 0
    }

    pub fn is_running(&self) -> bool {
        self.next_due_ms.is_some()
    }

    /// Begin sampling; the first request is due immediately.
    pub fn start(&mut self, now_ms: i64) {
        if self.is_enabled() && self.next_due_ms.is_none() {
            debug!(sample_count = self.sample_count, spacing_ms = self.spacing_ms, "Clock sync started");
            self.next_due_ms = Some(now_ms);
        }
    }

    pub fn stop(&mut self) {
        self.next_due_ms = None;
        self.outstanding = false;
        self.cycle.clear();
    }

    /// True when a sample request should go out now. Marks it outstanding so
    /// at most one request is in flight.
    pub fn poll_due(&mut self, now_ms: i64) -> bool {
        match self.next_due_ms {
            Some(due) if !self.outstanding && now_ms >= due => {
                self.outstanding = true;
                true
            }
            _ => false,
        }
    }

    /// Release the in-flight slot of a request that was never sent and try
    /// again after the usual spacing.
    pub fn abandon_request(&mut self, now_ms: i64) {
        if !self.outstanding {
            return;
        }
        self.outstanding = false;
        if self.next_due_ms.is_some() {
            self.next_due_ms = Some(now_ms + self.spacing_ms);
        }
    }

    /// Fold in the response to an outstanding request.
    pub fn record(&mut self, t0: i64, t1: i64, remote: i64) -> ClockSample {
        let sample = ClockSample::from_round_trip(t0, t1, remote);
        self.outstanding = false;

        if self.delta_ms.is_none() {
            // First sample of the connection seeds the offset
            self.delta_ms = Some(sample.delta_ms);
        }

        self.cycle.push(sample.delta_ms);
        trace!(
            latency_ms = sample.latency_ms,
            delta_ms = sample.delta_ms,
            collected = self.cycle.len(),
            "Clock sample recorded"
        );

        if self.cycle.len() as i64 >= i64::from(self.sample_count.max(1)) {
            if let Some(delta) = reduce_cycle(&self.cycle) {
                self.delta_ms = Some(delta);
            }
            self.cycle.clear();
            self.cycles_completed += 1;
            if self.next_due_ms.is_some() {
                self.next_due_ms = Some(t1 + self.interval_ms);
            }
            debug!(delta_ms = ?self.delta_ms, cycles = self.cycles_completed, "Clock cycle complete");
        } else if self.next_due_ms.is_some() {
            self.next_due_ms = Some(t1 + self.spacing_ms);
        }

        sample
    }

    /// Current offset in milliseconds, zero before the first sample.
    pub fn delta_ms(&self) -> f64 {
        self.delta_ms.unwrap_or(0.0)
    }

    pub fn cycles_completed(&self) -> u64 {
        self.cycles_completed
    }

    /// Local UTC milliseconds shifted onto the peer's clock.
    pub fn synchronized_ms(&self, local_ms: i64) -> i64 {
        local_ms + self.delta_ms().round() as i64
    }
}
