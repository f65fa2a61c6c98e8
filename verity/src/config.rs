//! Scheduler configuration.
//!
//! This module provides the options consumed by `RequestScheduler`, similar
//! in shape to a socket-options struct: documented fields with `with_*`
//! builders and defaults taken from [`settings`].

use std::time::Duration;

/// Compile-time defaults. Kept in one place so tests and embedders can see
/// every knob next to its rationale.
pub mod settings {
    use std::time::Duration;

    /// Base pacing interval between request batches.
    pub const REQUEST_INTERVAL: Duration = Duration::from_millis(1000);

    /// Divisor for the pacing scale factor floor (`base = 1 / this`).
    pub const REQUEST_SCALE_FACTOR: u32 = 4;

    /// Deadline for a single cube / notification request.
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

    /// Grace before an interactively issued request joins a batch.
    pub const INTERACTIVE_REQUEST_DELAY: Duration = Duration::from_millis(50);

    /// How long a server-side subscription grant lasts.
    pub const CUBE_SUBSCRIPTION_PERIOD: Duration = Duration::from_secs(60);

    /// Renew this much before a subscription grant would lapse.
    pub const RENEW_SUBSCRIPTIONS_BEFORE_EXPIRY: Duration = Duration::from_secs(5);

    /// Connection budget used by the pacing scale factor.
    pub const MAX_CONNECTIONS: usize = 10;
}

/// Peer-selection policy for the pacing timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrategyKind {
    /// Uniformly random among ready peers.
    #[default]
    Random,
    /// Highest reputation first.
    BestReputation,
}

/// Configuration for a scheduler (and the node wrapping it).
///
/// # Examples
///
/// ```
/// use verity::config::SchedulerOptions;
/// use std::time::Duration;
///
/// let opts = SchedulerOptions::default()
///     .with_request_timeout(Duration::from_secs(2))
///     .with_light_node(false);
/// ```
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Light nodes store only what they asked for; full nodes sync and
    /// store every valid cube they learn of.
    /// - Default: `true`
    pub light_node: bool,

    /// Peer-selection policy used by the pacing timer.
    /// - Default: `StrategyKind::Random`
    pub request_strategy: StrategyKind,

    /// Base interval between pacing ticks; scaled by the connection count.
    pub request_interval: Duration,

    /// Pacing scale divisor: the scale factor floor is `1 / this`.
    pub request_scale_factor: u32,

    /// Deadline for a single request waiter; fulfillment after this
    /// settles with the sentinel.
    pub request_timeout: Duration,

    /// Delay before an interactive request is batched, letting bursts of
    /// `request_cube` calls share one message.
    pub interactive_request_delay: Duration,

    /// Duration this node grants to inbound subscriptions, and the period
    /// its own renewals assume when a server grants nothing shorter.
    pub cube_subscription_period: Duration,

    /// Renewal lead time before an outbound subscription grant lapses.
    pub renew_subscriptions_before_expiry: Duration,

    /// Connection budget; feeds the pacing scale factor.
    pub max_connections: usize,

    /// Minimum proof-of-work difficulty for inbound cubes.
    /// - Default: 0 (accept everything structurally valid)
    pub required_difficulty: u8,

    /// Whether offered keys are filtered by the retention policy.
    /// - Default: `true`
    pub retention_enabled: bool,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            light_node: true,
            request_strategy: StrategyKind::Random,
            request_interval: settings::REQUEST_INTERVAL,
            request_scale_factor: settings::REQUEST_SCALE_FACTOR,
            request_timeout: settings::REQUEST_TIMEOUT,
            interactive_request_delay: settings::INTERACTIVE_REQUEST_DELAY,
            cube_subscription_period: settings::CUBE_SUBSCRIPTION_PERIOD,
            renew_subscriptions_before_expiry: settings::RENEW_SUBSCRIPTIONS_BEFORE_EXPIRY,
            max_connections: settings::MAX_CONNECTIONS,
            required_difficulty: 0,
            retention_enabled: true,
        }
    }
}

impl SchedulerOptions {
    #[must_use]
    pub fn with_light_node(mut self, light: bool) -> Self {
        self.light_node = light;
        self
    }

    #[must_use]
    pub fn with_request_strategy(mut self, strategy: StrategyKind) -> Self {
        self.request_strategy = strategy;
        self
    }

    #[must_use]
    pub fn with_request_interval(mut self, interval: Duration) -> Self {
        self.request_interval = interval;
        self
    }

    #[must_use]
    pub fn with_request_scale_factor(mut self, factor: u32) -> Self {
        self.request_scale_factor = factor.max(1);
        self
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_interactive_request_delay(mut self, delay: Duration) -> Self {
        self.interactive_request_delay = delay;
        self
    }

    #[must_use]
    pub fn with_cube_subscription_period(mut self, period: Duration) -> Self {
        self.cube_subscription_period = period;
        self
    }

    #[must_use]
    pub fn with_renew_subscriptions_before_expiry(mut self, lead: Duration) -> Self {
        self.renew_subscriptions_before_expiry = lead;
        self
    }

    #[must_use]
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max.max(2);
        self
    }

    #[must_use]
    pub fn with_required_difficulty(mut self, difficulty: u8) -> Self {
        self.required_difficulty = difficulty;
        self
    }

    #[must_use]
    pub fn with_retention_enabled(mut self, enabled: bool) -> Self {
        self.retention_enabled = enabled;
        self
    }

    /// Pacing multiplier for the current connection count.
    ///
    /// `base + (max - conn - 1) * (1 - base) / (max - 1)` with
    /// `base = 1 / request_scale_factor`, clamped to `[base, 1]`.
    #[must_use]
    pub fn scale_factor(&self, connected: usize) -> f64 {
        let base = 1.0 / f64::from(self.request_scale_factor.max(1));
        let max = self.max_connections.max(2) as f64;
        let conn = (connected.min(self.max_connections - 1)) as f64;
        let factor = base + (max - conn - 1.0) * (1.0 - base) / (max - 1.0);
        factor.clamp(base, 1.0)
    }

    /// Renewal lead: `max(duration / 2, duration - renewal lead time)`.
    #[must_use]
    pub fn renew_after(&self, granted: Duration) -> Duration {
        let lead = granted.saturating_sub(self.renew_subscriptions_before_expiry);
        lead.max(granted / 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scale_factor_range() {
        let opts = SchedulerOptions::default();

        // Alone on the network: full interval.
        assert!((opts.scale_factor(0) - 1.0).abs() < 1e-9);

        // Fully connected: floor at 1/scale_factor.
        let base = 1.0 / f64::from(opts.request_scale_factor);
        assert!((opts.scale_factor(opts.max_connections) - base).abs() < 1e-9);

        // Monotonic in between.
        assert!(opts.scale_factor(2) > opts.scale_factor(5));
    }

    #[test]
    fn renew_after_prefers_lead_time() {
        let opts = SchedulerOptions::default()
            .with_renew_subscriptions_before_expiry(Duration::from_secs(5));

        // Long grant: renew 5s before expiry.
        assert_eq!(
            opts.renew_after(Duration::from_secs(60)),
            Duration::from_secs(55)
        );

        // Short grant: never before half the period.
        assert_eq!(
            opts.renew_after(Duration::from_secs(6)),
            Duration::from_secs(3)
        );
    }
}
