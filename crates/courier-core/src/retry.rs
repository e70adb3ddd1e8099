use std::time::Duration;

/// Longest wait a server retry hint may impose.
const MAX_HINTED_DELAY: Duration = Duration::from_secs(60);

/// Fixed reconnection interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    delay: Duration,
}

impl RetryPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self { delay }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Wait before the next attempt. A longer server hint wins, up to a minute.
    pub fn next_delay(&self, retry_after_hint_ms: Option<u64>) -> Duration {
        let hinted = Duration::from_millis(retry_after_hint_ms.unwrap_or(0)).min(MAX_HINTED_DELAY);
        self.delay.max(hinted)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(5))
    }
}
