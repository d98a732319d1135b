//! Pattern resolution: recurrence + window → ordered occurrence instants.
//!
//! Resolution is a pure function of its inputs. It walks calendar dates
//! inside the window, so the cost is bounded by the window length and the
//! same (pattern, date) always yields the same instant.

use chrono::{Duration, NaiveDateTime};

use crate::domain::{RecurrencePattern, TimeWindow};

/// How far `next_occurrence` searches before giving up
pub const NEXT_OCCURRENCE_HORIZON_DAYS: i64 = 400;

/// Resolve all occurrences of `pattern` starting inside `window`, ascending.
///
/// Monthly patterns skip months that do not have the configured day.
pub fn resolve_occurrences(pattern: &RecurrencePattern, window: TimeWindow) -> Vec<NaiveDateTime> {
    let mut occurrences = Vec::new();
    if window.is_empty() {
        return occurrences;
    }

    let last_date = (window.end - Duration::nanoseconds(1)).date();
    let mut date = window.start.date();

    while date <= last_date {
        if pattern.matches_date(date) {
            let instant = pattern.at(date);
            if window.contains(instant) {
                occurrences.push(instant);
            }
        }
        match date.succ_opt() {
            Some(next) => date = next,
            None => break,
        }
    }

    occurrences
}

/// First occurrence strictly after `after`, within the search horizon
pub fn next_occurrence(pattern: &RecurrencePattern, after: NaiveDateTime) -> Option<NaiveDateTime> {
    let window = TimeWindow::new(
        after + Duration::nanoseconds(1),
        after + Duration::days(NEXT_OCCURRENCE_HORIZON_DAYS),
    );
    resolve_occurrences(pattern, window).into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::WeekdaySet;
    use chrono::{Datelike, NaiveDate, NaiveTime, Weekday};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn nine() -> NaiveTime {
        NaiveTime::from_hms_opt(9, 0, 0).unwrap()
    }

    #[test]
    fn test_daily_every_day() {
        let pattern = RecurrencePattern::daily(nine());
        let window = TimeWindow::days(date(2026, 10, 1), date(2026, 10, 7));
        let occurrences = resolve_occurrences(&pattern, window);

        assert_eq!(occurrences.len(), 7);
        assert_eq!(occurrences[0], date(2026, 10, 1).and_time(nine()));
        assert_eq!(occurrences[6], date(2026, 10, 7).and_time(nine()));
    }

    #[test]
    fn test_weekly_mon_wed_fri_two_weeks() {
        let days = WeekdaySet::from_days(&[Weekday::Mon, Weekday::Wed, Weekday::Fri]);
        let pattern = RecurrencePattern::weekly(days, nine());

        // 2026-10-19 is a Monday
        let window = TimeWindow::days(date(2026, 10, 19), date(2026, 11, 1));
        let occurrences = resolve_occurrences(&pattern, window);

        assert_eq!(occurrences.len(), 6);
        let weekdays: Vec<Weekday> = occurrences.iter().map(|o| o.weekday()).collect();
        assert_eq!(
            weekdays,
            vec![
                Weekday::Mon,
                Weekday::Wed,
                Weekday::Fri,
                Weekday::Mon,
                Weekday::Wed,
                Weekday::Fri
            ]
        );
    }

    #[test]
    fn test_monthly_day_31_skips_short_months() {
        let pattern = RecurrencePattern::monthly(31, nine());
        let window = TimeWindow::days(date(2026, 1, 1), date(2026, 12, 31));
        let occurrences = resolve_occurrences(&pattern, window);

        // Jan, Mar, May, Jul, Aug, Oct, Dec
        assert_eq!(occurrences.len(), 7);
        assert!(occurrences.iter().all(|o| o.day() == 31));

        let november = TimeWindow::days(date(2026, 11, 1), date(2026, 11, 30));
        assert!(resolve_occurrences(&pattern, november).is_empty());
    }

    #[test]
    fn test_monthly_day_29_february() {
        let pattern = RecurrencePattern::monthly(29, nine());
        let common = TimeWindow::days(date(2026, 2, 1), date(2026, 2, 28));
        assert!(resolve_occurrences(&pattern, common).is_empty());

        let leap = TimeWindow::days(date(2028, 2, 1), date(2028, 2, 29));
        assert_eq!(
            resolve_occurrences(&pattern, leap),
            vec![date(2028, 2, 29).and_time(nine())]
        );
    }

    #[test]
    fn test_window_is_half_open() {
        let pattern = RecurrencePattern::daily(nine());
        let start = date(2026, 10, 5).and_time(nine());
        let end = date(2026, 10, 7).and_time(nine());
        let occurrences = resolve_occurrences(&pattern, TimeWindow::new(start, end));

        assert_eq!(
            occurrences,
            vec![start, date(2026, 10, 6).and_time(nine())]
        );
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let pattern = RecurrencePattern::weekly(WeekdaySet::WEEKEND, nine());
        let window = TimeWindow::days(date(2026, 1, 1), date(2026, 3, 31));

        let first = resolve_occurrences(&pattern, window);
        let second = resolve_occurrences(&pattern, window);
        assert_eq!(first, second);
        assert!(first.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn test_empty_window() {
        let pattern = RecurrencePattern::daily(nine());
        let instant = date(2026, 10, 5).and_time(nine());
        assert!(resolve_occurrences(&pattern, TimeWindow::new(instant, instant)).is_empty());
    }

    #[test]
    fn test_next_occurrence() {
        let pattern = RecurrencePattern::monthly(31, nine());
        let after = date(2026, 10, 31).and_time(nine());
        assert_eq!(
            next_occurrence(&pattern, after),
            Some(date(2026, 12, 31).and_time(nine()))
        );
    }
}
