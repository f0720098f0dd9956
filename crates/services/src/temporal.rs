//! Weekday and active-hours gating.

use chrono::{Datelike, NaiveDateTime, NaiveTime, Timelike};
use domains::models::{ActiveHours, ActiveTimesCapsFilter};

/// Passes when no filter is attached, or when both the weekday and the
/// active-hours checks pass for the current day.
pub fn passes_temporal_gate(filter: Option<&ActiveTimesCapsFilter>, now: NaiveDateTime) -> bool {
    let Some(filter) = filter else {
        return true;
    };

    let today = now.weekday();
    if filter.restricts_weekdays() && !filter.is_active_on(today) {
        return false;
    }

    within_active_hours(filter.hours_on(today), minute_of(now))
}

/// Hours are compared at minute resolution.
fn minute_of(now: NaiveDateTime) -> NaiveTime {
    NaiveTime::from_hms_opt(now.hour(), now.minute(), 0).unwrap_or(NaiveTime::MIN)
}

/// A begin later than end wraps midnight: only `[end, begin]` is rejected.
pub fn within_active_hours(hours: &ActiveHours, now: NaiveTime) -> bool {
    match (hours.begin, hours.end) {
        (Some(begin), Some(end)) if begin <= end => begin <= now && now <= end,
        (Some(begin), Some(end)) => !(end <= now && now <= begin),
        (Some(begin), None) => begin <= now,
        (None, Some(end)) => now <= end,
        (None, None) => true,
    }
}
