//! Time axis normalization and bucketing.
//!
//! Model output does not always carry a time axis that a CF decoder understands:
//! some files count months since a reference date, some use fractional offsets,
//! and some have no usable units at all, so the time axis has to be rebuilt from
//! the year range in the file name. Everything in this module ends in a
//! [`TimeAxis`], whose coordinates each map to exactly one [`BucketKey`].
use std::{collections::BTreeMap, fmt::Display};

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

/// First date representable as a nanosecond timestamp, the usual limit for downstream tools. Axes with
/// any date before this are carried as (year, month) labels instead.
pub const TIMESTAMP_FLOOR: (i32, u32, u32) = (1677, 9, 22);

const SECONDS_PER_DAY: i64 = 86_400;

#[derive(Debug, thiserror::Error)]
pub enum CalendarError {
    #[error("Could not find a reference date in the time units '{0}'")]
    MalformedTimeUnits(String),
    #[error("Could not determine the time step (months, days, ...) from the time units '{0}'")]
    UnknownStep(String),
    #[error("Reference date {0} does not exist in the {1} calendar")]
    InvalidReference(CivilDate, CalendarKind),
    #[error("{n_obs} time steps over {n_years} years is neither annual nor monthly data")]
    UnsupportedFrequency { n_obs: usize, n_years: i64 },
    #[error("End year {end} is before start year {start}")]
    InvertedYearRange { start: i32, end: i32 },
    #[error("Time offset {0} cannot be converted to a date")]
    OffsetOutOfRange(f64),
}

/// The step unit declared in a time units string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeStep {
    Year,
    Month,
    Day,
    Hour,
    Minute,
    Second,
}

impl TimeStep {
    fn seconds(&self) -> Option<i64> {
        match self {
            TimeStep::Year | TimeStep::Month => None,
            TimeStep::Day => Some(SECONDS_PER_DAY),
            TimeStep::Hour => Some(3600),
            TimeStep::Minute => Some(60),
            TimeStep::Second => Some(1),
        }
    }
}

/// A calendar date that may not exist in the Gregorian calendar (e.g. 30 Feb in a
/// 360-day calendar).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CivilDate {
    pub year: i32,
    pub month: u32,
    pub day: u32,
}

impl CivilDate {
    pub fn new(year: i32, month: u32, day: u32) -> Self {
        Self { year, month, day }
    }

    fn to_gregorian(self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.year, self.month, self.day)
    }
}

impl Display for CivilDate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04}-{:02}-{:02}", self.year, self.month, self.day)
    }
}

/// Calendars found in CMIP/ISIMIP output.
///
/// The "standard" and "gregorian" calendars are treated as proleptic Gregorian;
/// the Julian/Gregorian switch in 1582 is far outside the periods these models cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CalendarKind {
    #[default]
    Standard,
    NoLeap,
    AllLeap,
    Day360,
}

impl CalendarKind {
    /// Interpret the value of a time variable's "calendar" attribute. A missing
    /// attribute means the standard calendar; an unrecognized one is logged and
    /// also treated as standard.
    pub fn parse(calendar: Option<&str>) -> Self {
        let Some(cal) = calendar else {
            return Self::Standard;
        };

        match cal.trim().to_ascii_lowercase().as_str() {
            "standard" | "gregorian" | "proleptic_gregorian" | "" => Self::Standard,
            "noleap" | "no_leap" | "365_day" => Self::NoLeap,
            "all_leap" | "366_day" => Self::AllLeap,
            "360_day" => Self::Day360,
            other => {
                log::warn!("Unrecognized calendar '{other}', treating it as the standard calendar");
                Self::Standard
            }
        }
    }

    fn month_lengths(&self) -> Option<[i64; 12]> {
        match self {
            CalendarKind::Standard => None,
            CalendarKind::NoLeap => Some([31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31]),
            CalendarKind::AllLeap => Some([31, 29, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31]),
            CalendarKind::Day360 => Some([30; 12]),
        }
    }

    /// Add a number of whole days to a date in this calendar.
    fn add_days(&self, date: CivilDate, days: i64) -> Result<CivilDate, CalendarError> {
        let Some(month_lengths) = self.month_lengths() else {
            let start = date
                .to_gregorian()
                .ok_or(CalendarError::InvalidReference(date, *self))?;
            let end = chrono::Duration::try_days(days)
                .and_then(|delta| start.checked_add_signed(delta))
                .ok_or(CalendarError::OffsetOutOfRange(days as f64))?;
            return Ok(CivilDate::new(end.year(), end.month(), end.day()));
        };

        if date.month < 1 || date.month > 12 || date.day < 1 || date.day as i64 > month_lengths[date.month as usize - 1] {
            return Err(CalendarError::InvalidReference(date, *self));
        }

        // Every year has the same length in these calendars, so a date is just
        // an index into a repeating sequence of days.
        let year_len: i64 = month_lengths.iter().sum();
        let day_of_year: i64 = month_lengths[..date.month as usize - 1].iter().sum::<i64>() + date.day as i64 - 1;
        let index = (date.year as i64 * year_len + day_of_year)
            .checked_add(days)
            .ok_or(CalendarError::OffsetOutOfRange(days as f64))?;

        let year = index.div_euclid(year_len);
        let mut remaining = index.rem_euclid(year_len);
        let mut month = 1;
        for len in month_lengths {
            if remaining < len {
                break;
            }
            remaining -= len;
            month += 1;
        }

        let year = i32::try_from(year).map_err(|_| CalendarError::OffsetOutOfRange(days as f64))?;
        Ok(CivilDate::new(year, month, remaining as u32 + 1))
    }
}

impl Display for CalendarKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CalendarKind::Standard => write!(f, "standard"),
            CalendarKind::NoLeap => write!(f, "noleap"),
            CalendarKind::AllLeap => write!(f, "all_leap"),
            CalendarKind::Day360 => write!(f, "360_day"),
        }
    }
}

/// A parsed time units string, e.g. "months since 1850-1-1 00:00:00".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeUnits {
    pub step: TimeStep,
    pub reference: CivilDate,
    /// Seconds after midnight of the reference date
    pub reference_seconds: i64,
}

impl TimeUnits {
    pub fn parse(units: &str) -> Result<Self, CalendarError> {
        static REF_RE: Lazy<Regex> = Lazy::new(|| {
            Regex::new(r"(-?\d{1,4})-(\d{1,2})-(\d{1,2})(?:[ T](\d{1,2}):(\d{1,2})(?::(\d{1,2}))?)?").unwrap()
        });

        let caps = REF_RE
            .captures(units)
            .ok_or_else(|| CalendarError::MalformedTimeUnits(units.to_string()))?;

        // The regex guarantees these are digits, but they could still overflow
        let parse_num = |i: usize| -> Result<i64, CalendarError> {
            caps.get(i)
                .map(|m| m.as_str().parse::<i64>())
                .unwrap_or(Ok(0))
                .map_err(|_| CalendarError::MalformedTimeUnits(units.to_string()))
        };

        let reference = CivilDate::new(parse_num(1)? as i32, parse_num(2)? as u32, parse_num(3)? as u32);
        let reference_seconds = parse_num(4)? * 3600 + parse_num(5)? * 60 + parse_num(6)?;

        // Only look at the part before the date so that e.g. "1-1" does not
        // get mistaken for part of a unit name.
        let lead = units[..caps.get(0).map(|m| m.start()).unwrap_or(0)].to_ascii_lowercase();
        let step = if lead.contains("month") {
            TimeStep::Month
        } else if lead.contains("day") {
            TimeStep::Day
        } else if lead.contains("hour") {
            TimeStep::Hour
        } else if lead.contains("minute") {
            TimeStep::Minute
        } else if lead.contains("second") {
            TimeStep::Second
        } else if lead.contains("year") {
            TimeStep::Year
        } else {
            return Err(CalendarError::UnknownStep(units.to_string()));
        };

        Ok(Self { step, reference, reference_seconds })
    }
}

/// One coordinate on a normalized time axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimeCoord {
    /// A real date and time.
    Timestamp(NaiveDateTime),
    /// An explicit (year, month) pair, used when the axis cannot be held as
    /// native timestamps.
    Label { year: i32, month: u32 },
}

impl TimeCoord {
    pub fn year(&self) -> i32 {
        match self {
            TimeCoord::Timestamp(dt) => dt.year(),
            TimeCoord::Label { year, month: _ } => *year,
        }
    }

    pub fn month(&self) -> u32 {
        match self {
            TimeCoord::Timestamp(dt) => dt.month(),
            TimeCoord::Label { year: _, month } => *month,
        }
    }

    pub fn bucket(&self, granularity: Granularity) -> BucketKey {
        match granularity {
            Granularity::Month => BucketKey::Month { year: self.year(), month: self.month() },
            Granularity::Year => BucketKey::Year(self.year()),
        }
    }
}

impl Display for TimeCoord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeCoord::Timestamp(dt) if dt.num_seconds_from_midnight() == 0 => {
                write!(f, "{}", dt.format("%Y-%m-%d"))
            }
            TimeCoord::Timestamp(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M:%S")),
            TimeCoord::Label { year, month } => write!(f, "{year:04}-{month:02}"),
        }
    }
}

/// How finely to group time steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Month,
    Year,
}

/// A time bucket. Buckets of one granularity sort chronologically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BucketKey {
    Year(i32),
    Month { year: i32, month: u32 },
}

impl BucketKey {
    pub fn year(&self) -> i32 {
        match self {
            BucketKey::Year(y) => *y,
            BucketKey::Month { year, month: _ } => *year,
        }
    }
}

impl Display for BucketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BucketKey::Year(y) => write!(f, "{y}"),
            BucketKey::Month { year, month } => write!(f, "{year:04}-{month:02}"),
        }
    }
}

/// An inclusive range of years to keep, e.g. the 1950-2015 historical period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct YearWindow {
    pub first: i32,
    pub last: i32,
}

impl YearWindow {
    pub fn contains(&self, year: i32) -> bool {
        year >= self.first && year <= self.last
    }
}

/// A normalized time axis.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeAxis {
    coords: Vec<TimeCoord>,
}

impl TimeAxis {
    /// Build an axis from a list of civil dates and times of day. If every date is a valid
    /// Gregorian date on or after [`TIMESTAMP_FLOOR`], the axis holds timestamps, otherwise
    /// the whole axis holds (year, month) labels.
    fn from_civil(dates: Vec<(CivilDate, i64)>) -> Self {
        let floor = CivilDate::new(TIMESTAMP_FLOOR.0, TIMESTAMP_FLOOR.1, TIMESTAMP_FLOOR.2);
        let timestamps: Option<Vec<TimeCoord>> = dates
            .iter()
            .map(|(date, secs)| {
                if *date < floor {
                    return None;
                }
                let time = NaiveTime::from_num_seconds_from_midnight_opt(*secs as u32, 0)?;
                date.to_gregorian().map(|d| TimeCoord::Timestamp(d.and_time(time)))
            })
            .collect();

        if let Some(coords) = timestamps {
            return Self { coords };
        }

        log::info!("Time axis cannot be represented as timestamps, using (year, month) labels instead");
        let coords = dates
            .into_iter()
            .map(|(date, _)| TimeCoord::Label { year: date.year, month: date.month })
            .collect();
        Self { coords }
    }

    pub fn len(&self) -> usize {
        self.coords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coords.is_empty()
    }

    pub fn coords(&self) -> &[TimeCoord] {
        &self.coords
    }

    /// Returns `true` if this axis had to fall back on (year, month) labels.
    pub fn uses_labels(&self) -> bool {
        self.coords.iter().any(|c| matches!(c, TimeCoord::Label { .. }))
    }

    /// First and last year on the axis, `None` if the axis is empty.
    pub fn year_span(&self) -> Option<(i32, i32)> {
        let first = self.coords.iter().map(|c| c.year()).min()?;
        let last = self.coords.iter().map(|c| c.year()).max()?;
        Some((first, last))
    }

    /// Group the step indices of this axis into buckets. Buckets iterate in chronological
    /// order and each holds its step indices in axis order. If `window` is given, steps
    /// outside it are dropped.
    pub fn buckets(&self, granularity: Granularity, window: Option<YearWindow>) -> BTreeMap<BucketKey, Vec<usize>> {
        let mut buckets: BTreeMap<BucketKey, Vec<usize>> = BTreeMap::new();
        for (i, coord) in self.coords.iter().enumerate() {
            if window.map(|w| !w.contains(coord.year())).unwrap_or(false) {
                continue;
            }
            buckets.entry(coord.bucket(granularity)).or_default().push(i);
        }
        buckets
    }
}

/// Convert numeric time offsets into a [`TimeAxis`].
///
/// Offsets are floored to a whole number of steps first; some models write e.g.
/// 0.5, 1.5, ... months to mean mid-month. Month and year steps advance the calendar
/// month/year and land on the first of the month. Day and shorter steps are added to
/// the reference date using the given calendar's month lengths.
pub fn normalize_offsets(values: &[f64], units: &TimeUnits, calendar: CalendarKind) -> Result<TimeAxis, CalendarError> {
    let reference = units.reference;
    let mut dates = Vec::with_capacity(values.len());

    for &v in values {
        let n = v.floor();
        if !n.is_finite() || n.abs() >= i64::MAX as f64 {
            return Err(CalendarError::OffsetOutOfRange(v));
        }
        let n = n as i64;

        let civil = match units.step {
            TimeStep::Year => {
                let year = (reference.year as i64).saturating_add(n);
                let year = i32::try_from(year).map_err(|_| CalendarError::OffsetOutOfRange(v))?;
                (CivilDate::new(year, 1, 1), 0)
            }
            TimeStep::Month => {
                let total = (reference.year as i64 * 12 + reference.month as i64 - 1)
                    .checked_add(n)
                    .ok_or(CalendarError::OffsetOutOfRange(v))?;
                let year = i32::try_from(total.div_euclid(12)).map_err(|_| CalendarError::OffsetOutOfRange(v))?;
                let month = total.rem_euclid(12) as u32 + 1;
                (CivilDate::new(year, month, 1), 0)
            }
            step => {
                let step_secs = step.seconds().ok_or(CalendarError::OffsetOutOfRange(v))?;
                let total_secs = n
                    .checked_mul(step_secs)
                    .and_then(|s| s.checked_add(units.reference_seconds))
                    .ok_or(CalendarError::OffsetOutOfRange(v))?;
                let days = total_secs.div_euclid(SECONDS_PER_DAY);
                let secs = total_secs.rem_euclid(SECONDS_PER_DAY);
                (calendar.add_days(reference, days)?, secs)
            }
        };
        dates.push(civil);
    }

    Ok(TimeAxis::from_civil(dates))
}

/// Parse the units string and convert the offsets in one go.
pub fn normalize_time(values: &[f64], units: &str, calendar: Option<&str>) -> Result<TimeAxis, CalendarError> {
    let units = TimeUnits::parse(units)?;
    normalize_offsets(values, &units, CalendarKind::parse(calendar))
}

/// Rebuild a time axis from the first and last year of a file and its number of
/// time steps. One step per year is annual data starting 1 Jan of `start_year`;
/// twelve per year is monthly data starting in January. Anything else is an error.
pub fn from_year_range(start_year: i32, end_year: i32, n_obs: usize) -> Result<TimeAxis, CalendarError> {
    if end_year < start_year {
        return Err(CalendarError::InvertedYearRange { start: start_year, end: end_year });
    }

    let n_years = (end_year - start_year) as i64 + 1;
    let step = if n_obs as i64 == n_years {
        TimeStep::Year
    } else if n_obs as i64 == 12 * n_years {
        TimeStep::Month
    } else {
        return Err(CalendarError::UnsupportedFrequency { n_obs, n_years });
    };

    let units = TimeUnits { step, reference: CivilDate::new(start_year, 1, 1), reference_seconds: 0 };
    let offsets: Vec<f64> = (0..n_obs).map(|i| i as f64).collect();
    normalize_offsets(&offsets, &units, CalendarKind::Standard)
}
