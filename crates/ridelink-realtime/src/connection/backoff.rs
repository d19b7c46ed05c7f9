//! Exponential backoff with jitter for reconnect scheduling.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use ridelink_core::config::ReconnectConfig;

/// Smallest delay handed out for any attempt.
const MIN_DELAY: Duration = Duration::from_millis(1);

/// Compute the delay before reconnect attempt `attempt` (1-based).
///
/// `min(base × 2^(attempt−1) × j, max)` where `j` is uniform in
/// `[1−jitter, 1+jitter]`. Attempt `0` yields zero.
pub fn delay<R: Rng + ?Sized>(
    attempt: u32,
    base: Duration,
    max: Duration,
    jitter: f64,
    rng: &mut R,
) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let factor = if jitter > 0.0 {
        rng.gen_range((1.0 - jitter)..=(1.0 + jitter))
    } else {
        1.0
    };

    let scaled = nominal_millis(attempt, base) * factor;
    let capped = scaled.min(max.as_millis() as f64);
    Duration::from_millis(capped.round() as u64).max(MIN_DELAY)
}

/// Delay for `attempt` ignoring jitter. Non-decreasing in `attempt`.
pub fn nominal_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let capped = nominal_millis(attempt, base).min(max.as_millis() as f64);
    Duration::from_millis(capped.round() as u64).max(MIN_DELAY)
}

fn nominal_millis(attempt: u32, base: Duration) -> f64 {
    // 2^62 ms is already centuries; clamp the exponent to keep the math finite.
    let exponent = attempt.saturating_sub(1).min(62) as i32;
    base.as_millis() as f64 * 2f64.powi(exponent)
}

/// Stateful wrapper owning the policy and its random source.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: f64,
    rng: StdRng,
}

impl Backoff {
    /// Build from config; a configured seed makes jitter reproducible.
    pub fn from_config(config: &ReconnectConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            base: config.base_delay(),
            max: config.max_delay(),
            jitter: config.jitter,
            rng,
        }
    }

    /// Jittered delay for the given attempt.
    pub fn delay_for(&mut self, attempt: u32) -> Duration {
        delay(attempt, self.base, self.max, self.jitter, &mut self.rng)
    }
}
