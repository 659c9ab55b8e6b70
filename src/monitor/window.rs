use chrono::{DateTime, Duration, Utc};

/// Round `t` to the nearest multiple of `period_seconds` since the epoch,
/// halves rounding up. Sub-millisecond precision is dropped.
pub fn round_to_period(t: DateTime<Utc>, period_seconds: u32) -> DateTime<Utc> {
    if period_seconds == 0 {
        return t;
    }

    let period_ms = i64::from(period_seconds) * 1000;
    let half = period_ms / 2;
    let rounded = (t.timestamp_millis() + half).div_euclid(period_ms) * period_ms;

    DateTime::from_timestamp_millis(rounded).unwrap_or(t)
}

/// Query window `(start, end)` for a batch.
///
/// With a non-zero rounding period the reference time is
/// `round(now - period / 2, period)`, which aligns it to the period boundary
/// at or before `now`. `end` trails the reference by `delay`, and `start`
/// precedes `end` by `length`.
pub fn query_window(
    now: DateTime<Utc>,
    rounding_period_seconds: u32,
    length_seconds: u64,
    delay_seconds: u64,
) -> (DateTime<Utc>, DateTime<Utc>) {
    let reference = if rounding_period_seconds == 0 {
        now
    } else {
        let half = Duration::milliseconds(i64::from(rounding_period_seconds) * 500);
        round_to_period(now - half, rounding_period_seconds)
    };

    let length = seconds(length_seconds);
    let delay = seconds(delay_seconds);

    (reference - (length + delay), reference - delay)
}

fn seconds(s: u64) -> Duration {
    Duration::seconds(i64::try_from(s).unwrap_or(i64::MAX / 1000))
}
