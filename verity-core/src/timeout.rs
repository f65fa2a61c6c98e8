//! Shortenable deadlines.
//!
//! One timer abstraction backs the pacing tick and the per-peer key-offer
//! whitelists: a deadline where `set` replaces the current value only when
//! the new one is strictly sooner. The owning actor sleeps toward the
//! earliest armed deadline; callbacks are ordinary code on the actor task,
//! so this type stays pure state and is tested with injected clocks.

use std::time::{Duration, Instant};

/// A deadline that accepts only strictly-sooner resets.
#[derive(Debug, Clone, Default)]
pub struct ShortenableTimeout {
    deadline: Option<Instant>,
}

impl ShortenableTimeout {
    #[must_use]
    pub const fn new() -> Self {
        Self { deadline: None }
    }

    /// Arm the deadline, or pull it in. A later `when` than the currently
    /// armed deadline is a no-op. Returns whether the deadline changed.
    pub fn set(&mut self, when: Instant) -> bool {
        match self.deadline {
            Some(current) if current <= when => false,
            _ => {
                self.deadline = Some(when);
                true
            }
        }
    }

    /// Convenience over [`set`](Self::set) for relative intervals.
    pub fn set_after(&mut self, now: Instant, after: Duration) -> bool {
        self.set(now + after)
    }

    /// Unconditionally replace the deadline, sooner or later. Used by the
    /// key-offer whitelist, which keeps exactly one timer per peer.
    pub fn force(&mut self, when: Instant) {
        self.deadline = Some(when);
    }

    pub fn clear(&mut self) {
        self.deadline = None;
    }

    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    #[must_use]
    pub const fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Time left until the deadline; `Duration::ZERO` when already due.
    #[must_use]
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(now))
    }

    /// If the deadline has passed, disarm it and report `true`.
    pub fn take_due(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(d) if d <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sooner_reset_replaces() {
        let now = Instant::now();
        let mut t = ShortenableTimeout::new();

        assert!(t.set(now + Duration::from_secs(10)));
        assert!(t.set(now + Duration::from_secs(5)));
        assert_eq!(t.deadline(), Some(now + Duration::from_secs(5)));
    }

    #[test]
    fn later_reset_is_noop() {
        let now = Instant::now();
        let mut t = ShortenableTimeout::new();

        t.set(now + Duration::from_secs(5));
        assert!(!t.set(now + Duration::from_secs(10)));
        assert_eq!(t.deadline(), Some(now + Duration::from_secs(5)));
    }

    #[test]
    fn force_extends() {
        let now = Instant::now();
        let mut t = ShortenableTimeout::new();

        t.set(now + Duration::from_secs(5));
        t.force(now + Duration::from_secs(60));
        assert_eq!(t.deadline(), Some(now + Duration::from_secs(60)));
    }

    #[test]
    fn take_due_fires_once() {
        let now = Instant::now();
        let mut t = ShortenableTimeout::new();

        t.set(now);
        assert!(t.take_due(now + Duration::from_millis(1)));
        assert!(!t.take_due(now + Duration::from_secs(1)));
        assert!(!t.is_armed());
    }

    #[test]
    fn remaining_saturates() {
        let now = Instant::now();
        let mut t = ShortenableTimeout::new();
        assert_eq!(t.remaining(now), None);

        t.set(now + Duration::from_secs(2));
        assert_eq!(t.remaining(now), Some(Duration::from_secs(2)));
        assert_eq!(
            t.remaining(now + Duration::from_secs(3)),
            Some(Duration::ZERO)
        );
    }
}
