//! Retry backoff schedule

use crate::config::DeliveryConfig;

/// Exponential schedule with a cap
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base_ms: u64,
    factor: u64,
    max_ms: u64,
}

impl Backoff {
    pub fn new(base_ms: u64, factor: u64, max_ms: u64) -> Self {
        Backoff {
            base_ms,
            factor: factor.max(1),
            max_ms,
        }
    }

    pub fn from_config(config: &DeliveryConfig) -> Self {
        Backoff::new(
            config.backoff_base.as_millis() as u64,
            config.backoff_factor as u64,
            config.backoff_max.as_millis() as u64,
        )
    }

    /// Wait before the attempt following `retry_count` failures.
    /// Fresh entries go immediately; then `base * factor^(n-1)`, capped.
    pub fn delay_ms(&self, retry_count: u32) -> u64 {
        if retry_count == 0 {
            return 0;
        }
        let mut delay = self.base_ms;
        for _ in 1..retry_count {
            delay = delay.saturating_mul(self.factor);
            if delay >= self.max_ms {
                return self.max_ms;
            }
        }
        delay.min(self.max_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule() {
        let backoff = Backoff::from_config(&DeliveryConfig::default());
        assert_eq!(backoff.delay_ms(0), 0);
        assert_eq!(backoff.delay_ms(1), 5_000);
        assert_eq!(backoff.delay_ms(2), 25_000);
        assert_eq!(backoff.delay_ms(3), 125_000);
        assert_eq!(backoff.delay_ms(4), 600_000);
        assert_eq!(backoff.delay_ms(40), 600_000);
    }
}
