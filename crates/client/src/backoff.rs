//! Reconnect backoff
//!
//! Linear growth with a cap: `min(base × attempt, max)`. The attempt
//! counter resets to zero on a successful resubscription or a manual
//! reconnect, so a flapping link never escalates past `max`.

use std::time::Duration;

/// Delay before reconnect attempt `attempt` (1-based).
pub fn delay_for_attempt(attempt: u32, base: Duration, max: Duration) -> Duration {
    base.saturating_mul(attempt.max(1)).min(max)
}
