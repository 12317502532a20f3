//! Seed sources for sampling.
//!
//! A session asks its seed source for a seed only when the caller passes a
//! negative seed. Tests inject [`FixedSeed`] to make that path deterministic.

use std::time::{SystemTime, UNIX_EPOCH};

/// Supplies a seed when the caller did not pick one.
pub trait SeedSource: Send {
    fn next_seed(&mut self) -> u64;
}

/// Wall-clock seed in whole seconds. Not reproducible across runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeSeed;

impl SeedSource for TimeSeed {
    fn next_seed(&mut self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// Always returns the same seed.
#[derive(Debug, Clone, Copy)]
pub struct FixedSeed(pub u64);

impl SeedSource for FixedSeed {
    fn next_seed(&mut self) -> u64 {
        self.0
    }
}
