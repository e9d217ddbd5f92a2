use std::time::Duration;

use rand::Rng;

/// Pure reconnect-delay calculator: `min(base * 2^attempt, max_delay)` plus a
/// uniform jitter draw in `[0, jitter)` to avoid thundering-herd reconnects.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    pub base: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1_000),
            max_delay: Duration::from_secs(30),
            jitter: Duration::from_millis(1_000),
        }
    }
}

impl ReconnectBackoff {
    /// Delay before reconnect attempt number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.capped(attempt) + self.jitter_draw()
    }

    /// The deterministic portion of the delay, without jitter.
    pub fn capped(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        let scaled = if attempt >= 32 {
            u64::MAX
        } else {
            base_ms.saturating_mul(1u64 << attempt)
        };
        Duration::from_millis(scaled.min(self.max_delay.as_millis() as u64))
    }

    fn jitter_draw(&self) -> Duration {
        let span = self.jitter.as_millis() as u64;
        if span == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..span))
    }
}
