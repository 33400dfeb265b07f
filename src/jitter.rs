//! Randomized decisions injected into the server and the agents.
//!
//! The multiplexer asks a [`FaultInjector`] whether to lose a request and how
//! long to hold a reply; an agent asks its [`Pacer`] how long to wait between
//! requests. Random implementations draw from a `StdRng`; fixed ones make
//! tests deterministic.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::ops::RangeInclusive;
use std::time::Duration;

/// Simulated loss and latency on the server.
pub trait FaultInjector {
    /// Whether the request just read should be discarded.
    fn drop_request(&mut self) -> bool;

    /// How long to hold the reply before queueing it.
    fn reply_delay(&mut self) -> Duration;
}

/// Interval between two requests of an agent.
pub trait Pacer {
    fn pause(&mut self) -> Duration;
}

/// Drops with a fixed probability and delays uniformly within a range.
pub struct RandomFaults {
    rng: StdRng,
    drop_probability: f64,
    delay_ms: RangeInclusive<u64>,
}

impl RandomFaults {
    pub fn new(drop_probability: f64, delay_ms: RangeInclusive<u64>) -> Self {
        Self::with_rng(StdRng::from_os_rng(), drop_probability, delay_ms)
    }

    pub fn seeded(seed: u64, drop_probability: f64, delay_ms: RangeInclusive<u64>) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed), drop_probability, delay_ms)
    }

    fn with_rng(rng: StdRng, drop_probability: f64, delay_ms: RangeInclusive<u64>) -> Self {
        Self {
            rng,
            drop_probability: drop_probability.clamp(0.0, 1.0),
            delay_ms,
        }
    }
}

impl FaultInjector for RandomFaults {
    fn drop_request(&mut self) -> bool {
        self.rng.random_bool(self.drop_probability)
    }

    fn reply_delay(&mut self) -> Duration {
        Duration::from_millis(self.rng.random_range(self.delay_ms.clone()))
    }
}

/// Always makes the same decision.
#[derive(Debug, Clone, Copy)]
pub struct FixedFaults {
    pub drop: bool,
    pub delay: Duration,
}

impl FaultInjector for FixedFaults {
    fn drop_request(&mut self) -> bool {
        self.drop
    }

    fn reply_delay(&mut self) -> Duration {
        self.delay
    }
}

/// Pauses uniformly within a range of milliseconds.
pub struct RandomPacer {
    rng: StdRng,
    pause_ms: RangeInclusive<u64>,
}

impl RandomPacer {
    pub fn new(pause_ms: RangeInclusive<u64>) -> Self {
        Self {
            rng: StdRng::from_os_rng(),
            pause_ms,
        }
    }

    pub fn seeded(seed: u64, pause_ms: RangeInclusive<u64>) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            pause_ms,
        }
    }
}

impl Pacer for RandomPacer {
    fn pause(&mut self) -> Duration {
        Duration::from_millis(self.rng.random_range(self.pause_ms.clone()))
    }
}

/// Constant pause.
#[derive(Debug, Clone, Copy)]
pub struct FixedPacer(pub Duration);

impl Pacer for FixedPacer {
    fn pause(&mut self) -> Duration {
        self.0
    }
}
