use std::time::Duration;

use weave_core::config::BackoffConfig;

/// Delay before retry attempt `attempt` (1-based; attempt 0 never waits).
///
/// `min(initial * 2^(attempt-1), max)` plus up to `jitter_ratio` of that
/// delay, floored to whole milliseconds.
pub fn calculate_backoff(attempt: u32, config: &BackoffConfig) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let exp = (attempt - 1).min(32);
    let base = config
        .initial_backoff_ms
        .saturating_mul(1u64 << exp)
        .min(config.max_backoff_ms);
    let jitter = rand::random::<f64>() * config.jitter_ratio.max(0.0) * base as f64;
    Duration::from_millis((base as f64 + jitter).floor() as u64)
}
