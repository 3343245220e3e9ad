use chrono::{Duration, NaiveDateTime, NaiveTime};
use memwake_core::HourWindow;
use rand::{seq::index, Rng};

use crate::types::ScheduleSet;

/// Days in the sampling horizon; offsets are drawn from `[0, DAYS_PER_WEEK)`.
pub const DAYS_PER_WEEK: usize = 7;

/// Compute the next pair of randomized wake instants.
///
/// Two distinct day offsets are drawn from `[0, 7)` without replacement. Each
/// gets a uniform hour in `[window.start_hour, window.end_hour)` and a uniform
/// minute, with seconds and sub-seconds zeroed. A candidate that is not
/// strictly after `now` is pushed forward one week. The result is sorted.
///
/// `window` must already be validated (see [`HourWindow::validate`]).
///
/// # Panics
///
/// Panics if `window` is empty (`start_hour >= end_hour`).
pub fn compute_schedule_set<R: Rng + ?Sized>(
    now: NaiveDateTime,
    window: HourWindow,
    rng: &mut R,
) -> ScheduleSet {
    let offsets = index::sample(rng, DAYS_PER_WEEK, 2);
    let first = slot_for_offset(now, window, offsets.index(0), rng);
    let second = slot_for_offset(now, window, offsets.index(1), rng);
    ScheduleSet::new(first, second)
}

fn slot_for_offset<R: Rng + ?Sized>(
    now: NaiveDateTime,
    window: HourWindow,
    offset: usize,
    rng: &mut R,
) -> NaiveDateTime {
    let hour = rng.gen_range(window.start_hour..window.end_hour);
    let minute = rng.gen_range(0..60);
    candidate(now, offset as i64, hour, minute)
}

/// `now`'s date plus `offset` days at `hour:minute:00`, advanced a week when
/// it does not lie strictly in the future.
pub fn candidate(now: NaiveDateTime, offset: i64, hour: u32, minute: u32) -> NaiveDateTime {
    // hour < 24 and minute < 60 are guaranteed by the sampling ranges.
    let time = NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN);
    let at = (now.date() + Duration::days(offset)).and_time(time);
    if at > now {
        at
    } else {
        at + Duration::days(DAYS_PER_WEEK as i64)
    }
}
