//! Session clock bounding the run time of every loop.

use std::time::{Duration, Instant};

/// A fixed deadline computed once from the configured lifetime.
///
/// Loops check it at their heads; it never interrupts work in progress.
#[derive(Debug, Clone, Copy)]
pub struct SessionClock {
    deadline: Instant,
}

impl SessionClock {
    /// Start a session lasting `lifetime` from now.
    pub fn start(lifetime: Duration) -> Self {
        Self {
            deadline: Instant::now() + lifetime,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_lifetime_is_expired() {
        let clock = SessionClock::start(Duration::ZERO);
        assert!(clock.expired());
        assert_eq!(clock.remaining(), Duration::ZERO);
    }

    #[test]
    fn test_remaining_bounded_by_lifetime() {
        let clock = SessionClock::start(Duration::from_secs(60));
        assert!(!clock.expired());
        assert!(clock.remaining() <= Duration::from_secs(60));
        assert!(clock.remaining() > Duration::from_secs(59));
    }
}
