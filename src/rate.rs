use chrono::Timelike;
use std::str::FromStr;

use crate::config::CostConfig;
use crate::error::ScheduleFormatError;

const MINUTES_PER_DAY: u16 = 24 * 60;

/// A time-of-day range in minutes since midnight, both ends inclusive.
///
/// When `end < start` the range wraps past midnight and covers
/// `[start, 24:00]` and `[00:00, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: u16,
    pub end: u16,
}

impl TimeRange {
    pub fn is_overnight(&self) -> bool {
        self.end < self.start
    }

    pub fn contains(&self, minute: u16) -> bool {
        if self.is_overnight() {
            minute >= self.start || minute <= self.end
        } else {
            self.start <= minute && minute <= self.end
        }
    }
}

impl FromStr for TimeRange {
    type Err = ScheduleFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ScheduleFormatError(s.to_string());
        let mut parts = s.split('-');
        let (Some(start), Some(end), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(invalid());
        };
        Ok(Self {
            start: parse_clock(start).ok_or_else(invalid)?,
            end: parse_clock(end).ok_or_else(invalid)?,
        })
    }
}

/// Parses `HH:MM` into minutes since midnight. `24:00` is accepted as the end
/// of the day.
fn parse_clock(s: &str) -> Option<u16> {
    let (hours, minutes) = s.trim().split_once(':')?;
    let digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
    if !(1..=2).contains(&hours.len()) || minutes.len() != 2 || !digits(hours) || !digits(minutes) {
        return None;
    }
    let hours: u16 = hours.parse().ok()?;
    let minutes: u16 = minutes.parse().ok()?;
    match (hours, minutes) {
        (24, 0) => Some(MINUTES_PER_DAY),
        (0..=23, 0..=59) => Some(hours * 60 + minutes),
        _ => None,
    }
}

/// Minutes since midnight of a clock reading. Seconds are dropped.
pub fn minute_of_day<T: Timelike>(time: &T) -> u16 {
    (time.hour() * 60 + time.minute()) as u16
}

/// Electricity rate applicable at `minute` (minutes since midnight).
///
/// Rules are scanned in configured order and the first match wins. Rules with
/// a malformed time range are skipped.
pub fn current_rate(cost: &CostConfig, minute: u16) -> f64 {
    if !cost.enabled {
        return 0.0;
    }

    cost.rates
        .iter()
        .filter_map(|rule| match rule.time.parse::<TimeRange>() {
            Ok(range) => Some((range, rule.rate)),
            Err(e) => {
                tracing::trace!(error = %e, "skipping cost rule");
                None
            }
        })
        .find(|(range, _)| range.contains(minute))
        .map(|(_, rate)| rate)
        .unwrap_or(cost.default_rate)
}
