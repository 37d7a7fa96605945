//! Compact interval strings such as `1d`, `12h`, `1d12h` or `90m`.

use chrono::TimeDelta;
use questcycle_common::{ConfigError, ConfigResult};

/// Parses a compact interval string.
///
/// Every `<digits><unit>` pair with unit `d`, `h` or `m` is summed; anything
/// else is skipped. A string without a single pair yields a zero interval,
/// which schedules reject as invalid.
pub fn parse_interval(raw: &str) -> ConfigResult<TimeDelta> {
    let invalid = || ConfigError::InvalidInterval {
        value: raw.to_string(),
    };

    let mut total = TimeDelta::zero();
    let mut digits = String::new();

    for c in raw.trim().chars().map(|c| c.to_ascii_lowercase()) {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }

        if !digits.is_empty() {
            let minutes_per_unit: i64 = match c {
                'd' => 24 * 60,
                'h' => 60,
                'm' => 1,
                _ => {
                    digits.clear();
                    continue;
                },
            };
            let value: i64 = digits.parse().map_err(|_| invalid())?;
            let minutes = value.checked_mul(minutes_per_unit).ok_or_else(invalid)?;
            let delta = TimeDelta::try_minutes(minutes).ok_or_else(invalid)?;
            total = total.checked_add(&delta).ok_or_else(invalid)?;
            digits.clear();
        }
    }

    Ok(total)
}

/// Formats an interval back into the compact form, for logs.
#[must_use]
pub fn format_interval(interval: TimeDelta) -> String {
    let total_minutes = interval.num_minutes().max(0);
    let days = total_minutes / (24 * 60);
    let hours = (total_minutes / 60) % 24;
    let minutes = total_minutes % 60;

    let mut out = String::new();
    if days > 0 {
        out.push_str(&format!("{days}d"));
    }
    if hours > 0 {
        out.push_str(&format!("{hours}h"));
    }
    if minutes > 0 {
        out.push_str(&format!("{minutes}m"));
    }
    if out.is_empty() {
        out.push_str("0m");
    }
    out
}

/// Formats a remaining duration in milliseconds as `1d2h3m`, `2h3m` or `3m`.
/// Anything under a minute is reported as `few_seconds`.
#[must_use]
pub fn format_remaining(millis: u64, few_seconds: &str) -> String {
    let days = millis / (1000 * 60 * 60 * 24);
    let hours = (millis / (1000 * 60 * 60)) % 24;
    let minutes = (millis / (1000 * 60)) % 60;

    if days != 0 {
        format!("{days}d{hours}h{minutes}m")
    } else if hours != 0 {
        format!("{hours}h{minutes}m")
    } else if minutes != 0 {
        format!("{minutes}m")
    } else {
        few_seconds.to_string()
    }
}
