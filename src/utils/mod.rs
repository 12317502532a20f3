//! Utility modules for thread resolution and seeding.

mod seed;
mod threads;

pub use seed::{FixedSeed, SeedSource, TimeSeed};
pub use threads::{resolve_threads, DEFAULT_MAX_THREADS};
