use crate::db::models::{Datatype, ObservationRecord};
use crate::error::{AppError, Result};
use chrono::{Datelike, NaiveDate};
use serde::Deserialize;
use tracing::warn;

/// Default failure threshold - fail if more than 10% of results fail to parse
const DEFAULT_FAILURE_THRESHOLD: f64 = 0.10;

#[derive(Debug, Clone, Default)]
pub struct ParseStats {
    pub total_results: usize,
    pub parsed_successfully: usize,
    pub parse_failures: usize,
    pub failure_rate: f64,
}

impl ParseStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finalize(&mut self) {
        self.failure_rate = if self.total_results > 0 {
            self.parse_failures as f64 / self.total_results as f64
        } else {
            0.0
        };
    }

    pub fn exceeds_threshold(&self, threshold: f64) -> bool {
        self.failure_rate > threshold
    }
}

/// Result-set metadata reported by the API for one page
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct ResultSet {
    #[serde(default)]
    pub offset: u32,
    #[serde(default)]
    pub count: u32,
    #[serde(default)]
    pub limit: u32,
}

#[derive(Debug, Clone)]
pub struct ApiPage {
    pub records: Vec<ObservationRecord>,
    pub resultset: ResultSet,
}

#[derive(Debug, Deserialize)]
struct RawPage {
    #[serde(default)]
    results: Vec<serde_json::Value>,
    #[serde(default)]
    metadata: Option<RawMetadata>,
}

#[derive(Debug, Deserialize)]
struct RawMetadata {
    #[serde(default)]
    resultset: Option<ResultSet>,
}

#[derive(Debug, Deserialize)]
struct RawResult {
    date: String,
    datatype: String,
    station: String,
    value: f64,
}

pub struct Parser;

impl Parser {
    /// Parse one `/data` response body into records and parse statistics
    pub fn parse_page(body: &str) -> Result<(ApiPage, ParseStats)> {
        Self::parse_page_with_threshold(body, DEFAULT_FAILURE_THRESHOLD)
    }

    /// Parse one `/data` response body with a custom failure threshold
    ///
    /// The API answers an empty result set with `{}`, which parses to a page
    /// with no records and a zero count.
    pub fn parse_page_with_threshold(
        body: &str,
        failure_threshold: f64,
    ) -> Result<(ApiPage, ParseStats)> {
        let raw: RawPage = serde_json::from_str(body)
            .map_err(|e| AppError::Parse(format!("Invalid response body: {}", e)))?;

        let resultset = raw
            .metadata
            .and_then(|m| m.resultset)
            .unwrap_or_default();

        let mut records = Vec::with_capacity(raw.results.len());
        let mut stats = ParseStats::new();

        for (index, value) in raw.results.into_iter().enumerate() {
            stats.total_results += 1;

            match Self::parse_result(value) {
                Ok(record) => {
                    records.push(record);
                    stats.parsed_successfully += 1;
                }
                Err(e) => {
                    stats.parse_failures += 1;
                    warn!(
                        "Failed to parse result {} (failure {}/{}): {}",
                        index + 1,
                        stats.parse_failures,
                        stats.total_results,
                        e
                    );
                }
            }
        }

        stats.finalize();

        if stats.exceeds_threshold(failure_threshold) {
            return Err(AppError::Parse(format!(
                "Parse failure rate {:.1}% exceeds threshold {:.1}%: {} failures out of {} results",
                stats.failure_rate * 100.0,
                failure_threshold * 100.0,
                stats.parse_failures,
                stats.total_results
            )));
        }

        Ok((ApiPage { records, resultset }, stats))
    }

    fn parse_result(value: serde_json::Value) -> Result<ObservationRecord> {
        let raw: RawResult = serde_json::from_value(value)
            .map_err(|e| AppError::Parse(format!("Malformed result: {}", e)))?;

        let date = parse_date(&raw.date)?;
        let datatype: Datatype = raw.datatype.parse()?;

        if raw.station.trim().is_empty() {
            return Err(AppError::Parse("Result has an empty station".to_string()));
        }

        if !raw.value.is_finite() {
            return Err(AppError::Parse(format!(
                "Non-finite value for {} on {}",
                raw.station, raw.date
            )));
        }

        Ok(ObservationRecord {
            date,
            datatype,
            station: raw.station,
            value: raw.value,
            year: date.year(),
        })
    }
}

/// Parse the date portion of an API timestamp such as `2020-01-01T00:00:00`
fn parse_date(s: &str) -> Result<NaiveDate> {
    let date_part = s.get(..10).unwrap_or(s);
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
        .map_err(|e| AppError::Parse(format!("Failed to parse date '{}': {}", s, e)))
}
