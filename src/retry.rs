//! Backoff schedule shared by the outbox (per-cycle retries) and the
//! transmission client (per-request retries).

use std::time::Duration;

/// Longest delay produced past the end of the configured table.
pub const MAX_FALLBACK_DELAY_SECS: u64 = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySchedule {
    delays: Vec<Duration>,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self::from_secs(&[1, 2, 4, 8, 16])
    }
}

impl RetrySchedule {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    pub fn from_secs(secs: &[u64]) -> Self {
        Self::new(secs.iter().copied().map(Duration::from_secs).collect())
    }

    /// Delay after the `attempt`-th failure (1-based). Attempt 1 uses the
    /// first table entry; beyond the table the delay is `min(2^attempt, 256)`s.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let index = attempt.saturating_sub(1) as usize;
        if let Some(delay) = self.delays.get(index) {
            return *delay;
        }
        let secs = 1_u64
            .checked_shl(attempt)
            .unwrap_or(u64::MAX)
            .min(MAX_FALLBACK_DELAY_SECS);
        Duration::from_secs(secs)
    }

    pub fn len(&self) -> usize {
        self.delays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.delays.is_empty()
    }
}
