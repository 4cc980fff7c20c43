use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

pub const MS_PER_DAY: i64 = 86_400_000;

pub fn now_ts() -> f64 {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    now.as_secs_f64()
}

/// Whole days left until `target`, rounded up, never negative.
pub fn days_remaining(target: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let diff_ms = (target - now).num_milliseconds();
    if diff_ms <= 0 {
        return 0;
    }
    (diff_ms + MS_PER_DAY - 1) / MS_PER_DAY
}

/// Exponential backoff with up to 25% random jitter, capped at `max`.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exp = base.saturating_mul(1u32 << attempt.min(16));
    let capped = exp.min(max);
    let jitter_ms = (capped.as_millis() as u64) / 4;
    let extra = if jitter_ms > 0 {
        rand::rng().random_range(0..=jitter_ms)
    } else {
        0
    };
    (capped + Duration::from_millis(extra)).min(max)
}
