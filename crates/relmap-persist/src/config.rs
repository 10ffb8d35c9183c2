//! Coordinator configuration.

use relmap_core::now_micros;

/// Settings shared by every lifecycle operation of a coordinator.
#[derive(Debug, Clone, Copy)]
pub struct PersistConfig {
    /// Clock for timestamp attributes, in microseconds since the epoch
    pub now: fn() -> i64,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self { now: now_micros }
    }
}

impl PersistConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a fixed or simulated clock.
    pub fn clock(mut self, now: fn() -> i64) -> Self {
        self.now = now;
        self
    }

    pub fn now(&self) -> i64 {
        (self.now)()
    }
}
