//! Retry-with-backoff helper shared by the ingress and order-execution
//! paths. In the shape of `infrastructure/core/circuit_breaker.rs`'s
//! closed/open/half-open state machine, adapted to a plain retry helper
//! since bounded retries are called for here rather than a tripping
//! breaker.

use rand::Rng;
use std::time::Duration;

/// Computes `min(cap, base * 2^attempt)` with +/-20% jitter, matching the
/// TaskSupervisor's backoff formula (§4.3) so ingress reconnects and order
/// retries behave consistently.
pub fn backoff_with_jitter(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let base_ms = base.as_millis() as u64;
    let cap_ms = cap.as_millis() as u64;
    let raw = base_ms.saturating_mul(1u64 << attempt.min(32)).min(cap_ms);
    let jitter_frac = rand::rng().random_range(-0.2..=0.2);
    let jittered = (raw as f64) * (1.0 + jitter_frac);
    Duration::from_millis(jittered.max(0.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let base = Duration::from_millis(100);
        let cap = Duration::from_secs(30);
        let b0 = backoff_with_jitter(base, cap, 0);
        let b5 = backoff_with_jitter(base, cap, 5);
        assert!(b0 <= Duration::from_millis(130));
        assert!(b5 <= cap + Duration::from_millis(1));
    }
}
