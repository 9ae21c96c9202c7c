//! Recurring time windows
//!
//! A window is `start`..=`end` on a set of weekdays. When `end` is earlier
//! than `start` the window crosses midnight: `22:00`-`05:00` covers late
//! evening and early morning.

use chrono::{DateTime, Datelike, TimeZone, Timelike, Weekday};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Minute-precision time of day (`HH:MM`, 24h)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClockTime {
    minutes: u16,
}

impl ClockTime {
    pub fn new(hour: u32, minute: u32) -> Option<Self> {
        if hour > 23 || minute > 59 {
            return None;
        }
        Some(Self {
            minutes: (hour * 60 + minute) as u16,
        })
    }

    /// Time of day of `at`, truncated to the minute
    pub fn of<Tz: TimeZone>(at: &DateTime<Tz>) -> Self {
        Self {
            minutes: (at.hour() * 60 + at.minute()) as u16,
        }
    }

    pub fn hour(&self) -> u32 {
        u32::from(self.minutes / 60)
    }

    pub fn minute(&self) -> u32 {
        u32::from(self.minutes % 60)
    }
}

impl FromStr for ClockTime {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || format!("invalid time '{}' (use HH:MM)", s);
        let (h, m) = s.trim().split_once(':').ok_or_else(invalid)?;
        if h.is_empty() || h.len() > 2 || m.len() != 2 {
            return Err(invalid());
        }
        if !h.bytes().chain(m.bytes()).all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let hour: u32 = h.parse().map_err(|_| invalid())?;
        let minute: u32 = m.parse().map_err(|_| invalid())?;
        ClockTime::new(hour, minute).ok_or_else(invalid)
    }
}

impl fmt::Display for ClockTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour(), self.minute())
    }
}

impl Serialize for ClockTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ClockTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A recurring blocking (or allowing) interval
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: ClockTime,
    pub end: ClockTime,
    #[serde(with = "weekday_list")]
    pub days: Vec<Weekday>,
}

impl TimeWindow {
    pub fn new(start: ClockTime, end: ClockTime, days: Vec<Weekday>) -> Self {
        Self { start, end, days }
    }

    /// Every day of the week
    pub fn daily(start: ClockTime, end: ClockTime) -> Self {
        Self::new(
            start,
            end,
            vec![
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
                Weekday::Sat,
                Weekday::Sun,
            ],
        )
    }

    pub fn crosses_midnight(&self) -> bool {
        self.end < self.start
    }

    /// Time-of-day test, bounds inclusive
    pub fn contains_time(&self, now: ClockTime) -> bool {
        if self.start <= self.end {
            self.start <= now && now <= self.end
        } else {
            now >= self.start || now <= self.end
        }
    }

    /// Weekday and time-of-day test against the current weekday
    pub fn matches<Tz: TimeZone>(&self, at: &DateTime<Tz>) -> bool {
        self.days.contains(&at.weekday()) && self.contains_time(ClockTime::of(at))
    }

    pub fn describe(&self) -> String {
        let days: Vec<String> = self.days.iter().map(|d| d.to_string()).collect();
        format!("{}-{} ({})", self.start, self.end, days.join(","))
    }
}

/// True if any window matches `at`. An empty list never matches.
pub fn any_matches<Tz: TimeZone>(windows: &[TimeWindow], at: &DateTime<Tz>) -> bool {
    windows.iter().any(|w| w.matches(at))
}

mod weekday_list {
    use chrono::Weekday;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(days: &[Weekday], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(days.iter().map(|d| d.to_string()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Weekday>, D::Error> {
        let raw = Vec::<String>::deserialize(deserializer)?;
        raw.iter()
            .map(|d| {
                d.parse::<Weekday>()
                    .map_err(|_| serde::de::Error::custom(format!("invalid weekday '{}'", d)))
            })
            .collect()
    }
}
