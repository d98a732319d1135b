//! Recurrence patterns and time windows.
//!
//! A pattern is a day rule (daily, weekly on a set of weekdays, or monthly on
//! a day of the month) plus a local time of day. Resolution into concrete
//! instants lives in `core::resolver`.

use std::fmt;

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};

/// Set of weekdays stored as a bitmask (bit 0 = Monday)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "Vec<String>", try_from = "Vec<String>")]
pub struct WeekdaySet(u8);

impl WeekdaySet {
    /// Monday through Friday
    pub const WORKDAYS: WeekdaySet = WeekdaySet(0b0001_1111);

    /// Saturday and Sunday
    pub const WEEKEND: WeekdaySet = WeekdaySet(0b0110_0000);

    /// Every day of the week
    pub const ALL: WeekdaySet = WeekdaySet(0b0111_1111);

    pub fn empty() -> Self {
        Self(0)
    }

    pub fn from_days(days: &[Weekday]) -> Self {
        days.iter().fold(Self::empty(), |set, day| set.with(*day))
    }

    pub fn with(self, day: Weekday) -> Self {
        Self(self.0 | (1 << day.num_days_from_monday()))
    }

    pub fn contains(&self, day: Weekday) -> bool {
        self.0 & (1 << day.num_days_from_monday()) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// Days in Monday-first order
    pub fn days(&self) -> Vec<Weekday> {
        let mut day = Weekday::Mon;
        let mut days = Vec::with_capacity(self.len());
        for _ in 0..7 {
            if self.contains(day) {
                days.push(day);
            }
            day = day.succ();
        }
        days
    }
}

impl From<WeekdaySet> for Vec<String> {
    fn from(set: WeekdaySet) -> Self {
        set.days()
            .into_iter()
            .map(|d| d.to_string().to_lowercase())
            .collect()
    }
}

impl TryFrom<Vec<String>> for WeekdaySet {
    type Error = String;

    fn try_from(names: Vec<String>) -> Result<Self, Self::Error> {
        names.iter().try_fold(WeekdaySet::empty(), |set, name| {
            name.parse::<Weekday>()
                .map(|day| set.with(day))
                .map_err(|_| format!("Unknown weekday: {}", name))
        })
    }
}

impl fmt::Display for WeekdaySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::WORKDAYS {
            return write!(f, "weekdays");
        }
        if *self == Self::WEEKEND {
            return write!(f, "weekends");
        }
        let names: Vec<String> = self.days().iter().map(|d| d.to_string()).collect();
        write!(f, "{}", names.join(", "))
    }
}

/// Day rule of a recurrence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Recurrence {
    /// Every day
    Daily,

    /// Each selected weekday
    Weekly { days: WeekdaySet },

    /// One day of the month; months without that day are skipped
    Monthly { day: u32 },
}

/// A recurrence rule anchored to a local time of day
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurrencePattern {
    #[serde(flatten)]
    pub recurrence: Recurrence,

    /// Local wall-clock start time
    pub time_of_day: NaiveTime,
}

impl RecurrencePattern {
    pub fn daily(time_of_day: NaiveTime) -> Self {
        Self {
            recurrence: Recurrence::Daily,
            time_of_day,
        }
    }

    pub fn weekly(days: WeekdaySet, time_of_day: NaiveTime) -> Self {
        Self {
            recurrence: Recurrence::Weekly { days },
            time_of_day,
        }
    }

    pub fn monthly(day: u32, time_of_day: NaiveTime) -> Self {
        Self {
            recurrence: Recurrence::Monthly { day },
            time_of_day,
        }
    }

    /// Check the rule can ever produce an occurrence
    pub fn validate(&self) -> Result<(), String> {
        match &self.recurrence {
            Recurrence::Daily => Ok(()),
            Recurrence::Weekly { days } if days.is_empty() => {
                Err("Weekly recurrence needs at least one weekday".to_string())
            }
            Recurrence::Weekly { .. } => Ok(()),
            Recurrence::Monthly { day } if !(1..=31).contains(day) => {
                Err(format!("Day of month must be 1-31, got {}", day))
            }
            Recurrence::Monthly { .. } => Ok(()),
        }
    }

    /// Whether the rule selects this calendar date
    pub fn matches_date(&self, date: NaiveDate) -> bool {
        match &self.recurrence {
            Recurrence::Daily => true,
            Recurrence::Weekly { days } => days.contains(date.weekday()),
            Recurrence::Monthly { day } => date.day() == *day,
        }
    }

    /// Occurrence instant for a selected date
    pub fn at(&self, date: NaiveDate) -> NaiveDateTime {
        date.and_time(self.time_of_day)
    }
}

impl fmt::Display for RecurrencePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let time = self.time_of_day.format("%H:%M");
        match &self.recurrence {
            Recurrence::Daily => write!(f, "Daily at {}", time),
            Recurrence::Weekly { days } => write!(f, "Weekly on {} at {}", days, time),
            Recurrence::Monthly { day } => write!(f, "Monthly on day {} at {}", day, time),
        }
    }
}

/// Half-open local time range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl TimeWindow {
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Self {
        Self { start, end }
    }

    /// Whole days from `first` through `last` inclusive
    pub fn days(first: NaiveDate, last: NaiveDate) -> Self {
        let start = first.and_time(NaiveTime::MIN);
        let end = last
            .succ_opt()
            .map(|d| d.and_time(NaiveTime::MIN))
            .unwrap_or(NaiveDateTime::MAX);
        Self { start, end }
    }

    pub fn contains(&self, instant: NaiveDateTime) -> bool {
        instant >= self.start && instant < self.end
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weekday_set_round_trip_names() {
        let set = WeekdaySet::from_days(&[Weekday::Mon, Weekday::Wed, Weekday::Fri]);
        let names: Vec<String> = set.into();
        assert_eq!(names, vec!["mon", "wed", "fri"]);

        let parsed = WeekdaySet::try_from(vec!["Monday".to_string(), "wed".to_string(), "fri".to_string()])
            .unwrap();
        assert_eq!(parsed, set);
    }

    #[test]
    fn test_weekday_set_rejects_unknown_name() {
        let result = WeekdaySet::try_from(vec!["funday".to_string()]);
        assert!(result.is_err());
    }

    #[test]
    fn test_presets() {
        assert_eq!(WeekdaySet::WORKDAYS.len(), 5);
        assert!(WeekdaySet::WEEKEND.contains(Weekday::Sun));
        assert!(!WeekdaySet::WEEKEND.contains(Weekday::Fri));
        assert_eq!(WeekdaySet::WORKDAYS.to_string(), "weekdays");
    }

    #[test]
    fn test_pattern_yaml() {
        let yaml = "kind: weekly\ndays: [mon, fri]\ntime_of_day: \"09:00:00\"\n";
        let pattern: RecurrencePattern = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            pattern,
            RecurrencePattern::weekly(
                WeekdaySet::from_days(&[Weekday::Mon, Weekday::Fri]),
                NaiveTime::from_hms_opt(9, 0, 0).unwrap()
            )
        );
        assert_eq!(pattern.to_string(), "Weekly on Mon, Fri at 09:00");
    }

    #[test]
    fn test_validate() {
        let nine = NaiveTime::from_hms_opt(9, 0, 0).unwrap();
        assert!(RecurrencePattern::monthly(0, nine).validate().is_err());
        assert!(RecurrencePattern::monthly(32, nine).validate().is_err());
        assert!(RecurrencePattern::monthly(31, nine).validate().is_ok());
        assert!(RecurrencePattern::weekly(WeekdaySet::empty(), nine)
            .validate()
            .is_err());
    }
}
