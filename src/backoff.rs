//! Backoff delay computation for retry scheduling
//!
//! Pure functions: exponential growth from an initial delay, capped at a
//! maximum, with uniform jitter added on top to desynchronize concurrent
//! retriers. No state, no suspension.

use std::time::Duration;

use rand::Rng;

/// Fraction of the capped delay added as uniform random jitter.
///
/// The computed delay always falls in `[capped, (1 + JITTER_FACTOR) * capped]`.
pub const JITTER_FACTOR: f64 = 0.3;

/// Compute the delay before the next retry attempt.
///
/// `attempt` is zero-based: 0 is the delay scheduled before the second
/// try. The exponential delay `initial_delay * backoff_factor^attempt` is
/// capped at `max_delay`, then a uniformly random extra delay in
/// `[0, JITTER_FACTOR * capped]` is added. The result is floored to whole
/// milliseconds.
pub fn compute_delay(
    attempt: u32,
    initial_delay: Duration,
    max_delay: Duration,
    backoff_factor: f64,
) -> Duration {
    compute_delay_with_rng(
        attempt,
        initial_delay,
        max_delay,
        backoff_factor,
        &mut rand::thread_rng(),
    )
}

/// [`compute_delay`] with an injected random source.
///
/// Deterministic given a fixed RNG; tests seed a [`rand::rngs::StdRng`]
/// (or use a zeroed mock) instead of asserting exact jittered values.
pub fn compute_delay_with_rng<R: Rng + ?Sized>(
    attempt: u32,
    initial_delay: Duration,
    max_delay: Duration,
    backoff_factor: f64,
    rng: &mut R,
) -> Duration {
    let base_ms = initial_delay.as_millis() as f64 * backoff_factor.powi(attempt as i32);
    let capped_ms = base_ms.min(max_delay.as_millis() as f64);
    let jitter_ms = rng.gen_range(0.0..=capped_ms * JITTER_FACTOR);

    Duration::from_millis((capped_ms + jitter_ms) as u64)
}
