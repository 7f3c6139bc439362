use std::fmt;

use chrono::{Datelike, NaiveDate};
use thiserror::Error;

/// Year written to storage for birthdays whose year is unknown.
pub const UNKNOWN_YEAR: i32 = 0;

/// Earliest birth year accepted from user input. Also keeps typed dates
/// clear of [`UNKNOWN_YEAR`].
pub const MIN_ENTRY_YEAR: i32 = 1900;

/// Leap year used to validate month/day pairs when the year is unknown,
/// so that 29.02 is accepted.
const PROBE_YEAR: i32 = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MonthDay {
    pub month: u32,
    pub day: u32,
}

impl MonthDay {
    pub fn of(date: NaiveDate) -> Self {
        Self {
            month: date.month(),
            day: date.day(),
        }
    }
}

/// Same layout as characters 6..=10 of a stored `YYYY-MM-DD` date.
impl fmt::Display for MonthDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}-{:02}", self.month, self.day)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed stored date '{0}'")]
pub struct MalformedDate(pub String);

/// A birth date whose year may be unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BirthDate {
    year: Option<i32>,
    month: u32,
    day: u32,
}

impl BirthDate {
    pub fn new(year: Option<i32>, month: u32, day: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year.unwrap_or(PROBE_YEAR), month, day)?;
        Some(Self { year, month, day })
    }

    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            year: Some(date.year()),
            month: date.month(),
            day: date.day(),
        }
    }

    /// Completed years on `today`, by plain year subtraction.
    /// `None` when the year is unknown or the result is not a positive age.
    pub fn age_on(&self, today: NaiveDate) -> Option<i32> {
        let age = today.year() - self.year?;
        (age > 0).then_some(age)
    }

    pub fn to_storage(&self) -> String {
        format!(
            "{:04}-{:02}-{:02}",
            self.year.unwrap_or(UNKNOWN_YEAR),
            self.month,
            self.day
        )
    }

    pub fn parse_storage(raw: &str) -> Result<Self, MalformedDate> {
        let malformed = || MalformedDate(raw.to_string());
        let mut parts = raw.split('-');
        let (Some(y), Some(m), Some(d), None) = (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(malformed());
        };
        if y.len() != 4 || m.len() != 2 || d.len() != 2 {
            return Err(malformed());
        }
        let year: i32 = y.parse().map_err(|_| malformed())?;
        let month: u32 = m.parse().map_err(|_| malformed())?;
        let day: u32 = d.parse().map_err(|_| malformed())?;
        let year = (year != UNKNOWN_YEAR).then_some(year);
        Self::new(year, month, day).ok_or_else(malformed)
    }
}

/// `dd.mm.yyyy`, or `dd.mm` when the year is unknown.
impl fmt::Display for BirthDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.year {
            Some(year) => write!(f, "{:02}.{:02}.{:04}", self.day, self.month, year),
            None => write!(f, "{:02}.{:02}", self.day, self.month),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DateEntryError {
    #[error("no supported date format matched '{0}'")]
    NoFormatMatched(String),
    #[error("birth date {0} is in the future")]
    InFuture(NaiveDate),
}

type EntryParser = fn(&[&str], NaiveDate) -> Option<NaiveDate>;

/// Tried in order; the first parser that accepts the input wins.
const ENTRY_PARSERS: &[(&str, EntryParser)] = &[
    ("dd.mm.yyyy", parse_full_year),
    ("dd.mm.yy", parse_short_year),
    ("dd.mm", parse_without_year),
];

/// Parse a birth date typed by a user. `/` and `-` are accepted as
/// separators; a missing year means the current one.
pub fn parse_entry(input: &str, today: NaiveDate) -> Result<BirthDate, DateEntryError> {
    let normalized = input.trim().replace(['/', '-'], ".");
    let parts: Vec<&str> = normalized.split('.').collect();
    if parts.iter().any(|p| p.is_empty() || !p.bytes().all(|b| b.is_ascii_digit())) {
        return Err(DateEntryError::NoFormatMatched(input.trim().to_string()));
    }

    let (format, date) = ENTRY_PARSERS
        .iter()
        .find_map(|(name, parser)| parser(&parts, today).map(|d| (*name, d)))
        .ok_or_else(|| DateEntryError::NoFormatMatched(input.trim().to_string()))?;
    tracing::debug!("Parsed '{input}' as {format}: {date}");

    if date.year() < MIN_ENTRY_YEAR {
        return Err(DateEntryError::NoFormatMatched(input.trim().to_string()));
    }
    if date > today {
        return Err(DateEntryError::InFuture(date));
    }
    Ok(BirthDate::from_date(date))
}

fn parse_full_year(parts: &[&str], _today: NaiveDate) -> Option<NaiveDate> {
    match parts {
        [_, _, year] if year.len() == 4 => {
            NaiveDate::parse_from_str(&parts.join("."), "%d.%m.%Y").ok()
        }
        _ => None,
    }
}

fn parse_short_year(parts: &[&str], _today: NaiveDate) -> Option<NaiveDate> {
    match parts {
        [_, _, year] if year.len() == 2 => {
            NaiveDate::parse_from_str(&parts.join("."), "%d.%m.%y").ok()
        }
        _ => None,
    }
}

fn parse_without_year(parts: &[&str], today: NaiveDate) -> Option<NaiveDate> {
    match parts {
        [day, month] if day.len() <= 2 && month.len() <= 2 => {
            NaiveDate::from_ymd_opt(today.year(), month.parse().ok()?, day.parse().ok()?)
        }
        _ => None,
    }
}
