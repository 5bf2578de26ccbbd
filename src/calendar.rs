use chrono::{Datelike, NaiveDate};
use std::fmt;

/// One calendar month of one year, both ends inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub year: i32,
    pub month: u32,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    /// Date range covering `month` of `year`, or `None` for an invalid month
    pub fn for_month(year: i32, month: u32) -> Option<Self> {
        let start = NaiveDate::from_ymd_opt(year, month, 1)?;
        let end = NaiveDate::from_ymd_opt(year, month, days_in_month(year, month)?)?;
        Some(Self {
            year,
            month,
            start,
            end,
        })
    }

    pub fn start_param(&self) -> String {
        self.start.format("%Y-%m-%d").to_string()
    }

    pub fn end_param(&self) -> String {
        self.end.format("%Y-%m-%d").to_string()
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start_param(), self.end_param())
    }
}

/// Number of days in the given month, honoring leap years
pub fn days_in_month(year: i32, month: u32) -> Option<u32> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let next_first = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    Some(next_first.signed_duration_since(first).num_days() as u32)
}

/// Twelve monthly date ranges for `year`
pub fn generate_date_ranges(year: i32) -> Vec<DateRange> {
    (1..=12)
        .filter_map(|month| DateRange::for_month(year, month))
        .collect()
}

/// (year, month) unit a date belongs to
pub fn month_of(date: NaiveDate) -> (i32, u32) {
    (date.year(), date.month())
}
