//! Time-of-day strings for renewal anchors.
//!
//! Accepted forms: `h:mma` (`3:30PM`), `ha` (`3PM`), `H:mm` (`15:30`) and
//! `H` (`15`). Case and surrounding whitespace are ignored.

use chrono::NaiveTime;
use questcycle_common::{ConfigError, ConfigResult};

/// Parses a renewal anchor time.
pub fn parse_time_of_day(raw: &str) -> ConfigResult<NaiveTime> {
    let invalid = || ConfigError::InvalidTime {
        value: raw.to_string(),
    };

    let normalized = raw.trim().to_ascii_uppercase();
    let (clock, meridiem) = if let Some(rest) = normalized.strip_suffix("AM") {
        (rest.trim_end(), Some(false))
    } else if let Some(rest) = normalized.strip_suffix("PM") {
        (rest.trim_end(), Some(true))
    } else {
        (normalized.as_str(), None)
    };

    let (hour_str, minute_str) = match clock.split_once(':') {
        Some((h, m)) => (h, Some(m)),
        None => (clock, None),
    };

    let hour = parse_field(hour_str).ok_or_else(invalid)?;
    let minute = match minute_str {
        Some(m) if m.len() == 2 => parse_field(m).ok_or_else(invalid)?,
        Some(_) => return Err(invalid()),
        None => 0,
    };

    let hour = match meridiem {
        Some(pm) => {
            if !(1..=12).contains(&hour) {
                return Err(invalid());
            }
            match (hour, pm) {
                (12, false) => 0,
                (12, true) => 12,
                (h, false) => h,
                (h, true) => h + 12,
            }
        },
        None => hour,
    };

    NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(invalid)
}

fn parse_field(s: &str) -> Option<u32> {
    if s.is_empty() || s.len() > 2 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}
