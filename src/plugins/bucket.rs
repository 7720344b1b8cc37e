//! Continuous-refill token bucket for plugin output quotas.

use std::time::Instant;

/// Two-pool token bucket: one pool counts events, the other bytes.
///
/// Both pools start full, refill proportionally to elapsed time and are capped
/// at their per-second rate, so the burst capacity equals the budget.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    events_per_second: f64,
    bytes_per_second: f64,
    events: f64,
    bytes: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// `min_bytes_per_second` floors the byte rate so a tiny budget cannot
    /// starve every non-trivial event.
    pub fn new(events_per_second: u32, bytes_per_second: u64, min_bytes_per_second: u64) -> Self {
        Self::starting_at(
            events_per_second,
            bytes_per_second,
            min_bytes_per_second,
            Instant::now(),
        )
    }

    pub fn starting_at(
        events_per_second: u32,
        bytes_per_second: u64,
        min_bytes_per_second: u64,
        now: Instant,
    ) -> Self {
        let events_per_second = f64::from(events_per_second.max(1));
        let bytes_per_second = bytes_per_second.max(min_bytes_per_second).max(1) as f64;
        Self {
            events_per_second,
            bytes_per_second,
            events: events_per_second,
            bytes: bytes_per_second,
            last_refill: now,
        }
    }

    /// Debit one event and `bytes` bytes, or nothing.
    pub fn try_consume(&mut self, bytes: usize) -> bool {
        self.try_consume_at(bytes, Instant::now())
    }

    pub fn try_consume_at(&mut self, bytes: usize, now: Instant) -> bool {
        self.refill(now);
        let cost = bytes as f64;
        if self.events >= 1.0 && self.bytes >= cost {
            self.events -= 1.0;
            self.bytes -= cost;
            true
        } else {
            false
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }
        self.last_refill = now;
        self.events = (self.events + elapsed * self.events_per_second).min(self.events_per_second);
        self.bytes = (self.bytes + elapsed * self.bytes_per_second).min(self.bytes_per_second);
    }

    pub fn events_available(&self) -> f64 {
        self.events
    }

    pub fn bytes_available(&self) -> f64 {
        self.bytes
    }
}
