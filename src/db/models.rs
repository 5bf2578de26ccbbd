use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;

use crate::error::AppError;

/// Measured quantity code returned by the climate API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Datatype {
    Tmax,
    Tmin,
    Prcp,
}

impl Datatype {
    pub fn as_str(&self) -> &'static str {
        match self {
            Datatype::Tmax => "TMAX",
            Datatype::Tmin => "TMIN",
            Datatype::Prcp => "PRCP",
        }
    }
}

impl fmt::Display for Datatype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Datatype {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TMAX" => Ok(Datatype::Tmax),
            "TMIN" => Ok(Datatype::Tmin),
            "PRCP" => Ok(Datatype::Prcp),
            other => Err(AppError::InvalidData(format!("Unknown datatype '{}'", other))),
        }
    }
}

/// One daily reading for one station
///
/// `year` is assigned by the extractor, not by the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationRecord {
    pub date: NaiveDate,
    pub datatype: Datatype,
    pub station: String,
    pub value: f64,
    pub year: i32,
}

/// Raw row as stored in the `observations` checkpoint table
#[derive(Debug, Clone, FromRow)]
pub struct StoredObservation {
    pub date: NaiveDate,
    pub datatype: String,
    pub station: String,
    pub value: f64,
    pub year: i32,
}

impl TryFrom<StoredObservation> for ObservationRecord {
    type Error = AppError;

    fn try_from(row: StoredObservation) -> Result<Self, Self::Error> {
        Ok(ObservationRecord {
            date: row.date,
            datatype: row.datatype.parse()?,
            station: row.station,
            value: row.value,
            year: row.year,
        })
    }
}

/// One row per (date, station, year) with each datatype as a column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct WideObservationRow {
    pub date: NaiveDate,
    pub station: String,
    pub year: i32,
    pub tmax: Option<f64>,
    pub tmin: Option<f64>,
    pub prcp: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonthStatus {
    Completed,
    Partial,
}

impl MonthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonthStatus::Completed => "completed",
            MonthStatus::Partial => "partial",
        }
    }
}

/// Checkpoint entry for one fetched (year, month) unit
#[derive(Debug, Clone, FromRow)]
pub struct FetchedMonth {
    pub year: i32,
    pub month: i32,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub records_fetched: i64,
    pub status: String,
    pub error: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewFetchedMonth {
    pub year: i32,
    pub month: u32,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub records_fetched: i64,
    pub status: MonthStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct InsertResult {
    pub inserted: usize,
    pub replaced: usize,
}

/// Result row of the per-station maximum temperature query
#[derive(Debug, Clone, FromRow)]
pub struct StationMaxTemp {
    pub date: NaiveDate,
    pub station: String,
    pub max_temp: f64,
    pub year: i32,
}
