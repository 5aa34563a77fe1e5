//! Bounded exponential reconnect policy for the signaling channel.

use std::time::Duration;

/// Reconnect tuning. Defaults match the web client.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay after the first failed attempt.
    pub min_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Multiplier applied per consecutive failure.
    pub growth_factor: f64,
    /// Consecutive failed attempts after which the channel gives up.
    pub max_retries: u32,
    /// How long a single connection attempt may take.
    pub connection_timeout: Duration,
    /// A connection must stay up this long before the budget is refilled.
    /// Shorter-lived connections count as failed attempts.
    pub min_uptime: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            growth_factor: 1.5,
            max_retries: 10,
            connection_timeout: Duration::from_millis(4000),
            min_uptime: Duration::from_millis(5000),
        }
    }
}

impl ReconnectConfig {
    /// Delay to wait after the `failures`-th consecutive failure (1-based).
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.growth_factor.max(1.0).powi(exponent);
        let millis = self.min_delay.as_millis() as f64 * factor;
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }
}

/// Tracks consecutive failures against a [`ReconnectConfig`] budget.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: ReconnectConfig,
    failures: u32,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            failures: 0,
        }
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn is_exhausted(&self) -> bool {
        self.failures >= self.config.max_retries
    }

    /// Records a failed attempt. Returns the delay before the next attempt,
    /// or `None` once the budget is spent.
    pub fn record_failure(&mut self) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        if self.is_exhausted() {
            None
        } else {
            Some(self.config.delay_for(self.failures))
        }
    }

    /// A connection that stayed up long enough grants a fresh budget.
    pub fn record_success(&mut self) {
        self.failures = 0;
    }

    /// Settles a connection that was open for `uptime`. Returns the delay
    /// before redialing, or `None` once the budget is spent.
    pub fn record_uptime(&mut self, uptime: Duration) -> Option<Duration> {
        if uptime >= self.config.min_uptime {
            self.record_success();
            Some(self.config.min_delay)
        } else {
            self.record_failure()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_retries: u32) -> ReconnectConfig {
        ReconnectConfig {
            min_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            growth_factor: 1.5,
            max_retries,
            connection_timeout: Duration::from_millis(4000),
            min_uptime: Duration::from_millis(5000),
        }
    }

    #[test]
    fn test_delay_grows_and_clamps() {
        let cfg = config(10);
        assert_eq!(cfg.delay_for(1), Duration::from_millis(1000));
        assert_eq!(cfg.delay_for(2), Duration::from_millis(1500));
        assert_eq!(cfg.delay_for(3), Duration::from_millis(2250));
        assert_eq!(cfg.delay_for(20), Duration::from_millis(10_000));
    }

    #[test]
    fn test_budget_is_exhausted_after_max_retries() {
        let mut backoff = Backoff::new(config(3));
        assert!(backoff.record_failure().is_some());
        assert!(backoff.record_failure().is_some());
        assert!(backoff.record_failure().is_none());
        assert!(backoff.is_exhausted());
        assert!(backoff.record_failure().is_none());
    }

    #[test]
    fn test_success_resets_budget() {
        let mut backoff = Backoff::new(config(3));
        backoff.record_failure();
        backoff.record_failure();
        backoff.record_success();
        assert_eq!(backoff.failures(), 0);

        // A later independent failure streak gets the full budget again.
        assert_eq!(backoff.record_failure(), Some(Duration::from_millis(1000)));
        assert_eq!(backoff.record_failure(), Some(Duration::from_millis(1500)));
        assert_eq!(backoff.record_failure(), None);
    }

    #[test]
    fn test_short_lived_connections_spend_budget() {
        let mut backoff = Backoff::new(config(2));
        assert_eq!(
            backoff.record_uptime(Duration::from_millis(10)),
            Some(Duration::from_millis(1000))
        );
        assert_eq!(backoff.record_uptime(Duration::from_millis(10)), None);
    }

    #[test]
    fn test_long_lived_connection_refills_budget() {
        let mut backoff = Backoff::new(config(2));
        backoff.record_failure();
        assert_eq!(
            backoff.record_uptime(Duration::from_secs(6)),
            Some(Duration::from_millis(1000))
        );
        assert_eq!(backoff.failures(), 0);
    }

    #[test]
    fn test_growth_factor_below_one_is_treated_as_constant() {
        let cfg = ReconnectConfig {
            growth_factor: 0.5,
            ..config(5)
        };
        assert_eq!(cfg.delay_for(4), Duration::from_millis(1000));
    }
}
