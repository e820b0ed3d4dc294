//! Rolling measurement window for one topic
//!
//! Turns a message count plus start/stop instants into a messages-per-second
//! rate. Taking a rate re-arms the window, so reads are not idempotent.

use std::time::Duration;
use tokio::time::Instant;

/// Upper bound for the shortest window that yields a rate
const MAX_MIN_WINDOW: Duration = Duration::from_secs(25);

/// Message count and timing of the current measurement window
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeasurementWindow {
    message_count: u64,
    started_at: Option<Instant>,
    stopped_at: Option<Instant>,
}

impl MeasurementWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message_count(&self) -> u64 {
        self.message_count
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    pub fn stopped_at(&self) -> Option<Instant> {
        self.stopped_at
    }

    /// Count one inbound message
    pub fn record_message(&mut self) {
        self.message_count = self.message_count.saturating_add(1);
    }

    /// Subscription confirmed, measurement starts now
    pub fn start(&mut self, now: Instant) {
        self.started_at = Some(now);
        self.stopped_at = None;
    }

    /// Connection lost; the pending count stays for the next read
    pub fn stop(&mut self, now: Instant) {
        self.stopped_at = Some(now);
    }

    /// Forget everything, used before a fresh connection attempt
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Compute the rate and re-arm the window at `now`
    ///
    /// Returns `None` when the window was never started or is too short. In
    /// that case the window keeps accumulating.
    pub fn take_rate(&mut self, now: Instant, keep_alive: Duration) -> Option<f64> {
        let rate = compute_rate(
            self.message_count,
            self.started_at?,
            self.stopped_at,
            now,
            keep_alive,
        )?;

        self.message_count = 0;
        self.started_at = Some(now);
        self.stopped_at = None;

        Some(rate)
    }
}

/// Shortest window that produces a rate: `min(25s, 10 * keep_alive)`
pub fn minimum_window(keep_alive: Duration) -> Duration {
    MAX_MIN_WINDOW.min(keep_alive.saturating_mul(10))
}

/// Time subtracted from windows ending in a disconnect
///
/// A silently dropped connection is only noticed after about two keep-alive
/// periods, during which no messages arrived.
pub fn disconnect_correction(keep_alive: Duration) -> Duration {
    keep_alive.saturating_mul(2)
}

/// Effective measured time of a window
pub fn effective_elapsed(
    started_at: Instant,
    stopped_at: Option<Instant>,
    now: Instant,
    keep_alive: Duration,
) -> Duration {
    match stopped_at {
        Some(stopped_at) => stopped_at
            .saturating_duration_since(started_at)
            .saturating_sub(disconnect_correction(keep_alive)),
        None => now.saturating_duration_since(started_at),
    }
}

/// Messages per second over the window, `None` if the window is too short
pub fn compute_rate(
    message_count: u64,
    started_at: Instant,
    stopped_at: Option<Instant>,
    now: Instant,
    keep_alive: Duration,
) -> Option<f64> {
    let elapsed = effective_elapsed(started_at, stopped_at, now, keep_alive);
    if elapsed < minimum_window(keep_alive) || elapsed.is_zero() {
        return None;
    }
    Some(message_count as f64 / elapsed.as_secs_f64())
}
