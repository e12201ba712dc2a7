use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Monotonic clock anchored to the wall clock once, at construction.
///
/// `unix_us` never steps backwards even when the system clock does, which
/// keeps per-tag timestamps strictly advancing.
#[derive(Debug, Clone, Copy)]
pub struct TimeBase {
    start: Instant,
    start_unix_us: u64,
}

impl TimeBase {
    pub fn new() -> Self {
        let start_unix_us = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64;
        Self::anchored_at(start_unix_us)
    }

    /// Time base whose `unix_us` starts at the given instant.
    pub fn anchored_at(start_unix_us: u64) -> Self {
        Self {
            start: Instant::now(),
            start_unix_us,
        }
    }

    /// Monotonic microseconds since start.
    pub fn now_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }

    /// Unix microseconds, derived from the monotonic clock.
    pub fn unix_us(&self) -> u64 {
        self.start_unix_us.saturating_add(self.now_us())
    }
}

impl Default for TimeBase {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_time_never_goes_backwards() {
        let tb = TimeBase::anchored_at(1_700_000_000_000_000);
        let mut last = tb.unix_us();
        for _ in 0..1000 {
            let now = tb.unix_us();
            assert!(now >= last);
            last = now;
        }
        assert!(last >= 1_700_000_000_000_000);
    }
}
