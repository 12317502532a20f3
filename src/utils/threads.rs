//! Worker thread count resolution.

/// Upper bound on the default thread count.
pub const DEFAULT_MAX_THREADS: usize = 4;

/// Resolve the number of evaluation threads.
///
/// A negative request selects `min(available_parallelism, 4)`. Zero is
/// bumped to one so a backend always gets at least one worker.
pub fn resolve_threads(threads: i32) -> usize {
    if threads < 0 {
        let available = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or_else(|e| {
                tracing::warn!("Could not query available parallelism: {}", e);
                1
            });
        return available.min(DEFAULT_MAX_THREADS);
    }

    (threads as usize).max(1)
}
