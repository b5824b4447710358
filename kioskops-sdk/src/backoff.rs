//! Deterministic exponential retry schedule.
//!
//! No jitter: support staff can predict exactly when a stuck device retries,
//! and the host scheduler's own cadence supplies spread across a fleet.

const BASE_S: i64 = 10;
const MAX_S: i64 = 21_600; // 6 h ceiling

/// Delay before an event that has failed `attempts` times becomes visible
/// again. Negative input is clamped to zero; the exponent saturates at 10.
pub fn next_delay_ms(attempts: i64) -> i64 {
    let exp = attempts.clamp(0, 10) as u32;
    (BASE_S.saturating_mul(1i64 << exp)).min(MAX_S) * 1000
}
