use anyhow::{Context, Result};
use chrono::{Days, NaiveDateTime};

use crate::dates::MonthDay;
use crate::store::{BirthdayRecord, BirthdayStore};

#[derive(Debug, Default)]
pub struct Matches {
    pub tomorrow: Vec<BirthdayRecord>,
    pub today: Vec<BirthdayRecord>,
}

/// Birthdays falling tomorrow and today relative to `now`, compared by
/// month-day only. A 29.02 birthday matches nothing in a non-leap year.
pub fn find(store: &dyn BirthdayStore, now: NaiveDateTime) -> Result<Matches> {
    let today = now.date();
    let tomorrow = today
        .checked_add_days(Days::new(1))
        .context("Calendar overflow computing tomorrow")?;

    let matches = Matches {
        tomorrow: store.match_month_day(MonthDay::of(tomorrow))?,
        today: store.match_month_day(MonthDay::of(today))?,
    };
    tracing::debug!(
        "Birthdays for {tomorrow}: {}, for {today}: {}",
        matches.tomorrow.len(),
        matches.today.len()
    );
    Ok(matches)
}
