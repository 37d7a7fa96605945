//! Anchored renewal schedule.
//!
//! Ticks are `anchor + k * interval`, where the anchor is the renewal time on
//! the current calendar day of the target zone. Within a day `k * interval`
//! is an exact duration from the anchor, so sub-daily ticks stay evenly
//! spaced on DST days. Whole days are counted on the zone's calendar and
//! land on a later day's anchor, so a daily tick keeps its local time. Every
//! tick is recomputed from the anchor, never from the previous tick, so
//! repeated rescheduling cannot drift.
//!
//! Mapping an anchor to an instant:
//! - an anchor inside a DST gap is shifted forward by the length of the gap
//! - an anchor inside a DST overlap takes its earliest occurrence

use crate::zone::RenewZone;
use chrono::{
    DateTime, Days, Local, NaiveDate, NaiveDateTime, NaiveTime, Offset, TimeDelta, TimeZone, Utc,
};
use questcycle_common::SchedulingError;
use serde::{Deserialize, Serialize};

const NANOS_PER_SECOND: i128 = 1_000_000_000;

const NANOS_PER_DAY: i128 = 86_400 * NANOS_PER_SECOND;

/// How a stored renewal timestamp is judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestampMode {
    /// Renew on the anchored schedule; driven by the group scheduler.
    #[default]
    Anchored,
    /// Renew once `interval` has elapsed since the last draw; checked lazily.
    Elapsed,
}

/// Anchor time, interval and zone of one renewal schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleSettings {
    /// Wall-clock time of day the lattice is anchored to.
    pub renew_time: NaiveTime,
    /// Distance between ticks.
    pub interval: TimeDelta,
    /// Zone whose wall clock the lattice lives on.
    pub zone: RenewZone,
}

impl ScheduleSettings {
    /// Creates schedule settings.
    #[must_use]
    pub fn new(renew_time: NaiveTime, interval: TimeDelta, zone: RenewZone) -> Self {
        Self {
            renew_time,
            interval,
            zone,
        }
    }

    /// Whether the interval is strictly positive.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.interval > TimeDelta::zero()
    }

    /// Returns `self` if valid, otherwise a scheduling error naming `group`.
    pub fn validated(self, group: &str) -> Result<Self, SchedulingError> {
        if self.is_valid() {
            Ok(self)
        } else {
            Err(SchedulingError::NonPositiveInterval {
                group: group.to_string(),
            })
        }
    }

    /// Smallest tick that is `>= now`.
    ///
    /// Invalid settings return `now`; check [`Self::is_valid`] first.
    #[must_use]
    pub fn next_execution_at_or_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.zone {
            RenewZone::System => self.at_or_after_in(&Local, now),
            RenewZone::Named(tz) => self.at_or_after_in(&tz, now),
        }
    }

    /// Smallest tick that is strictly after `t`.
    #[must_use]
    pub fn next_execution_after(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let next = self.next_execution_at_or_after(t);
        if next > t || !self.is_valid() {
            return next;
        }
        self.next_execution_at_or_after(t + TimeDelta::nanoseconds(1))
    }

    /// True iff at least one tick lies in `(last, now]`.
    #[must_use]
    pub fn should_renew_since(&self, last: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.next_execution_after(last) <= now
    }

    /// Milliseconds from `now` to the next tick, never negative.
    #[must_use]
    pub fn millis_until_next(&self, now: DateTime<Utc>) -> u64 {
        millis_between(now, self.next_execution_at_or_after(now))
    }

    /// Whether a draw made at `last` is due for renewal under `mode`.
    /// A missing timestamp is always due.
    #[must_use]
    pub fn is_due(
        &self,
        mode: TimestampMode,
        last: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(last) = last else {
            return true;
        };
        match mode {
            TimestampMode::Anchored => self.should_renew_since(last, now),
            TimestampMode::Elapsed => now - last >= self.interval,
        }
    }

    /// Milliseconds until a draw made at `last` becomes due under `mode`.
    #[must_use]
    pub fn millis_until_renewal(
        &self,
        mode: TimestampMode,
        last: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> u64 {
        match (mode, last) {
            (TimestampMode::Elapsed, Some(last)) => millis_between(now, last + self.interval),
            (TimestampMode::Elapsed, None) => 0,
            (TimestampMode::Anchored, _) => self.millis_until_next(now),
        }
    }

    fn at_or_after_in<Z: TimeZone>(&self, zone: &Z, now: DateTime<Utc>) -> DateTime<Utc> {
        let interval = total_nanos(self.interval);
        if interval <= 0 {
            return now;
        }

        let date = now.with_timezone(zone).date_naive();
        let Some(anchor) = self.anchor_on(zone, date) else {
            return now + self.interval;
        };
        if anchor >= now {
            return anchor;
        }

        let elapsed = total_nanos(now - anchor);
        let steps = (elapsed + interval - 1) / interval;
        self.tick(zone, date, anchor, steps * interval)
            .unwrap_or(now + self.interval)
    }

    /// The instant `offset` past the anchor of `date`. Whole days move to the
    /// anchor of a later date; the rest is added as an exact duration.
    fn tick<Z: TimeZone>(
        &self,
        zone: &Z,
        date: NaiveDate,
        anchor: DateTime<Utc>,
        offset: i128,
    ) -> Option<DateTime<Utc>> {
        let days = u64::try_from(offset / NANOS_PER_DAY).ok()?;
        let rest = from_nanos(offset % NANOS_PER_DAY)?;
        let base = if days == 0 {
            anchor
        } else {
            self.anchor_on(zone, date.checked_add_days(Days::new(days))?)?
        };
        base.checked_add_signed(rest)
    }

    fn anchor_on<Z: TimeZone>(&self, zone: &Z, date: NaiveDate) -> Option<DateTime<Utc>> {
        resolve_wall_clock(zone, date.and_time(self.renew_time))
    }
}

/// Maps a wall-clock time in `zone` to an instant.
fn resolve_wall_clock<Z: TimeZone>(zone: &Z, wall: NaiveDateTime) -> Option<DateTime<Utc>> {
    if let Some(instant) = zone.from_local_datetime(&wall).earliest() {
        return Some(instant.with_timezone(&Utc));
    }

    // Gap: keep the offset in force before the transition.
    let before = wall.checked_sub_signed(TimeDelta::days(1))?;
    let offset = zone.offset_from_local_datetime(&before).earliest()?.fix();
    let utc = wall.checked_sub_signed(TimeDelta::seconds(i64::from(offset.local_minus_utc())))?;
    Some(Utc.from_utc_datetime(&utc))
}

fn total_nanos(delta: TimeDelta) -> i128 {
    i128::from(delta.num_seconds()) * NANOS_PER_SECOND + i128::from(delta.subsec_nanos())
}

fn from_nanos(nanos: i128) -> Option<TimeDelta> {
    let seconds = i64::try_from(nanos.div_euclid(NANOS_PER_SECOND)).ok()?;
    let rest = i64::try_from(nanos.rem_euclid(NANOS_PER_SECOND)).ok()?;
    TimeDelta::try_seconds(seconds)?.checked_add(&TimeDelta::nanoseconds(rest))
}

fn millis_between(from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
    u64::try_from((to - from).num_milliseconds()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, NaiveDate, Timelike};
    use chrono_tz::Tz;
    use proptest::prelude::*;

    fn utc(s: &str) -> DateTime<Utc> {
        s.parse().expect("valid RFC 3339 timestamp")
    }

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).expect("valid time")
    }

    fn daily_utc(h: u32, m: u32) -> ScheduleSettings {
        ScheduleSettings::new(hm(h, m), TimeDelta::days(1), RenewZone::UTC)
    }

    fn new_york(h: u32, m: u32, interval: TimeDelta) -> ScheduleSettings {
        ScheduleSettings::new(hm(h, m), interval, RenewZone::Named(Tz::America__New_York))
    }

    #[test]
    fn test_scenario_a_crossing_midnight_is_due() {
        let settings = daily_utc(0, 0);
        assert!(settings.should_renew_since(
            utc("2026-05-10T23:00:00Z"),
            utc("2026-05-11T00:30:00Z"),
        ));
    }

    #[test]
    fn test_scenario_b_same_day_not_due() {
        let settings = daily_utc(0, 0);
        assert!(!settings.should_renew_since(
            utc("2026-05-11T00:30:00Z"),
            utc("2026-05-11T23:00:00Z"),
        ));
    }

    #[test]
    fn test_last_on_tick_waits_for_next_tick() {
        let settings = daily_utc(0, 0);
        let tick = utc("2026-05-11T00:00:00Z");
        assert!(!settings.should_renew_since(tick, utc("2026-05-11T23:59:59Z")));
        assert!(settings.should_renew_since(tick, utc("2026-05-12T00:00:00Z")));
    }

    #[test]
    fn test_anchor_later_today_is_returned() {
        let settings = daily_utc(18, 0);
        assert_eq!(
            settings.next_execution_at_or_after(utc("2026-05-11T09:15:00Z")),
            utc("2026-05-11T18:00:00Z")
        );
    }

    #[test]
    fn test_exact_tick_is_at_or_after_but_not_after() {
        let settings = daily_utc(6, 0);
        let tick = utc("2026-05-11T06:00:00Z");
        assert_eq!(settings.next_execution_at_or_after(tick), tick);
        assert_eq!(settings.next_execution_after(tick), utc("2026-05-12T06:00:00Z"));
    }

    #[test]
    fn test_sub_daily_interval() {
        let settings = ScheduleSettings::new(hm(0, 0), TimeDelta::hours(6), RenewZone::UTC);
        assert_eq!(
            settings.next_execution_at_or_after(utc("2026-05-11T13:00:00Z")),
            utc("2026-05-11T18:00:00Z")
        );
    }

    #[test]
    fn test_interval_not_dividing_a_day_spills_past_midnight() {
        let settings = ScheduleSettings::new(hm(0, 0), TimeDelta::hours(7), RenewZone::UTC);
        assert_eq!(
            settings.next_execution_at_or_after(utc("2026-05-11T22:00:00Z")),
            utc("2026-05-12T04:00:00Z")
        );
    }

    #[test]
    fn test_millis_until_next() {
        let settings = daily_utc(0, 0);
        assert_eq!(settings.millis_until_next(utc("2026-05-11T23:59:00Z")), 60_000);
        assert_eq!(settings.millis_until_next(utc("2026-05-12T00:00:00Z")), 0);
    }

    #[test]
    fn test_invalid_interval() {
        let settings = ScheduleSettings::new(hm(0, 0), TimeDelta::zero(), RenewZone::UTC);
        assert!(!settings.is_valid());
        assert_eq!(
            settings.validated("daily"),
            Err(SchedulingError::NonPositiveInterval {
                group: "daily".to_string()
            })
        );
        let now = utc("2026-05-11T12:00:00Z");
        assert_eq!(settings.next_execution_at_or_after(now), now);
    }

    #[test]
    fn test_elapsed_mode() {
        let settings = ScheduleSettings::new(hm(0, 0), TimeDelta::hours(12), RenewZone::UTC);
        let last = utc("2026-05-11T08:00:00Z");
        assert!(!settings.is_due(TimestampMode::Elapsed, Some(last), utc("2026-05-11T19:59:00Z")));
        assert!(settings.is_due(TimestampMode::Elapsed, Some(last), utc("2026-05-11T20:00:00Z")));
        assert!(settings.is_due(TimestampMode::Elapsed, None, last));
        assert_eq!(
            settings.millis_until_renewal(
                TimestampMode::Elapsed,
                Some(last),
                utc("2026-05-11T19:00:00Z")
            ),
            3_600_000
        );
    }

    #[test]
    fn test_daily_midnight_holds_across_spring_forward() {
        let settings = new_york(0, 0, TimeDelta::days(1));
        let tz = Tz::America__New_York;

        let mut tick = settings.next_execution_at_or_after(utc("2026-03-05T12:00:00Z"));
        let mut previous_date = tick.with_timezone(&tz).date_naive();
        for _ in 0..6 {
            let next = settings.next_execution_after(tick);
            let local = next.with_timezone(&tz);
            assert_eq!(local.time(), hm(0, 0));
            assert_eq!(local.date_naive(), previous_date.succ_opt().expect("date in range"));
            previous_date = local.date_naive();
            tick = next;
        }
        // The chain crossed the 2026-03-08 transition.
        assert!(previous_date > NaiveDate::from_ymd_opt(2026, 3, 8).expect("valid date"));
    }

    #[test]
    fn test_daily_midnight_holds_across_fall_back() {
        let settings = new_york(0, 0, TimeDelta::days(1));
        let tz = Tz::America__New_York;

        let mut tick = settings.next_execution_at_or_after(utc("2026-10-29T12:00:00Z"));
        for _ in 0..6 {
            let next = settings.next_execution_after(tick);
            assert_eq!(next.with_timezone(&tz).hour(), 0);
            assert_eq!(next.with_timezone(&tz).minute(), 0);
            tick = next;
        }
        assert_eq!(tick.with_timezone(&tz).month(), 11);
    }

    #[test]
    fn test_sub_daily_ticks_use_exact_durations_on_dst_day() {
        let settings = new_york(0, 0, TimeDelta::hours(6));
        // 00:00 EST; the clocks jump from 02:00 to 03:00 later that night.
        let midnight = utc("2026-03-08T05:00:00Z");
        assert_eq!(settings.next_execution_at_or_after(midnight), midnight);
        assert_eq!(
            settings.next_execution_at_or_after(utc("2026-03-08T12:00:00Z")),
            utc("2026-03-08T17:00:00Z")
        );

        let mut tick = midnight;
        for expected in [
            "2026-03-08T11:00:00Z",
            "2026-03-08T17:00:00Z",
            "2026-03-08T23:00:00Z",
            // Next day's anchor, 00:00 EDT.
            "2026-03-09T04:00:00Z",
        ] {
            tick = settings.next_execution_after(tick);
            assert_eq!(tick, utc(expected));
        }
    }

    #[test]
    fn test_tick_in_gap_shifts_forward() {
        let settings = new_york(2, 30, TimeDelta::days(1));
        // 00:00 EST on the spring-forward day.
        let now = utc("2026-03-08T05:00:00Z");
        let tick = settings.next_execution_at_or_after(now);
        // 02:30 does not exist; fires at 03:30 EDT.
        assert_eq!(tick, utc("2026-03-08T07:30:00Z"));
        assert_eq!(settings.next_execution_after(tick), utc("2026-03-09T06:30:00Z"));
    }

    #[test]
    fn test_tick_in_overlap_fires_once() {
        let settings = new_york(1, 30, TimeDelta::days(1));
        let first = settings.next_execution_at_or_after(utc("2026-11-01T04:00:00Z"));
        // Earliest 01:30, still on EDT.
        assert_eq!(first, utc("2026-11-01T05:30:00Z"));
        // Second pass through 01:30 EST is not another tick.
        assert_eq!(
            settings.next_execution_at_or_after(utc("2026-11-01T06:00:00Z")),
            utc("2026-11-02T06:30:00Z")
        );
        assert_eq!(settings.next_execution_after(first), utc("2026-11-02T06:30:00Z"));
    }

    fn brute_force_due(
        settings: &ScheduleSettings,
        last: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> bool {
        let day_start =
            last.date_naive().and_time(settings.renew_time).and_utc() - TimeDelta::days(1);
        let mut tick = day_start;
        while tick <= now {
            if tick > last {
                return true;
            }
            tick += settings.interval;
        }
        false
    }

    proptest! {
        #[test]
        fn prop_next_is_never_before_now(
            secs in 1_600_000_000i64..1_900_000_000i64,
            hour in 0u32..24,
            minute in 0u32..60,
            interval_minutes in 1i64..20_000,
            new_york_zone in any::<bool>(),
        ) {
            let zone = if new_york_zone {
                RenewZone::Named(Tz::America__New_York)
            } else {
                RenewZone::Named(Tz::Australia__Lord_Howe)
            };
            let settings = ScheduleSettings::new(
                hm(hour, minute),
                TimeDelta::minutes(interval_minutes),
                zone,
            );
            let now = DateTime::<Utc>::from_timestamp(secs, 0).expect("in range");
            let next = settings.next_execution_at_or_after(now);
            prop_assert!(next >= now);
            prop_assert!(settings.next_execution_after(now) > now);
        }

        #[test]
        fn prop_should_renew_matches_enumeration(
            last_secs in 1_700_000_000i64..1_800_000_000i64,
            gap_secs in 0i64..(3 * 86_400),
            hour in 0u32..24,
            minute in 0u32..60,
            divisor in prop::sample::select(vec![1i64, 2, 3, 4, 6, 8, 12, 24]),
        ) {
            let settings = ScheduleSettings::new(
                hm(hour, minute),
                TimeDelta::hours(24 / divisor),
                RenewZone::UTC,
            );
            let last = DateTime::<Utc>::from_timestamp(last_secs, 0).expect("in range");
            let now = last + TimeDelta::seconds(gap_secs);
            prop_assert_eq!(
                settings.should_renew_since(last, now),
                brute_force_due(&settings, last, now)
            );
        }

        #[test]
        fn prop_repeated_ticks_advance_by_interval(
            start_secs in 1_700_000_000i64..1_800_000_000i64,
            divisor in prop::sample::select(vec![1i64, 2, 3, 4, 6, 8, 12, 24]),
        ) {
            let settings =
                ScheduleSettings::new(hm(0, 0), TimeDelta::hours(24 / divisor), RenewZone::UTC);
            let start = DateTime::<Utc>::from_timestamp(start_secs, 0).expect("in range");
            let mut tick = settings.next_execution_at_or_after(start);
            for _ in 0..10 {
                let next = settings.next_execution_after(tick);
                prop_assert_eq!(next - tick, settings.interval);
                tick = next;
            }
        }
    }
}
