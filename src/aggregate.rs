//! Pivoting of long-format observations and the summaries derived from them.

use crate::db::models::{Datatype, ObservationRecord, WideObservationRow};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnualSummary {
    pub year: i32,
    pub avg_tmax: Option<f64>,
    pub avg_tmin: Option<f64>,
    pub avg_temp: Option<f64>,
    pub total_precip: f64,
    pub station_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationSummary {
    pub station: String,
    pub mean_tmax: Option<f64>,
    pub mean_tmin: Option<f64>,
    pub mean_precip: Option<f64>,
    pub data_years: usize,
}

/// Ordinary least squares fit of annual average temperature on year
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemperatureTrend {
    pub slope: f64,
    pub intercept: f64,
    pub r_value: f64,
    pub r_squared: f64,
    /// Standard error of the slope
    pub std_err: f64,
    pub n: usize,
}

impl TemperatureTrend {
    pub fn per_decade(&self) -> f64 {
        self.slope * 10.0
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct MeanAcc {
    sum: f64,
    count: usize,
}

impl MeanAcc {
    fn push(&mut self, value: Option<f64>) {
        if let Some(v) = value {
            self.sum += v;
            self.count += 1;
        }
    }

    fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

/// Pivot long records into one row per (date, station, year)
///
/// When a (date, station, datatype) appears more than once the first value
/// wins and later ones are dropped, so the result depends on input order.
pub fn pivot(records: &[ObservationRecord]) -> Vec<WideObservationRow> {
    let mut rows: BTreeMap<(NaiveDate, &str, i32), WideObservationRow> = BTreeMap::new();
    let mut duplicates = 0;

    for record in records {
        let row = rows
            .entry((record.date, record.station.as_str(), record.year))
            .or_insert_with(|| WideObservationRow {
                date: record.date,
                station: record.station.clone(),
                year: record.year,
                tmax: None,
                tmin: None,
                prcp: None,
            });

        let slot = match record.datatype {
            Datatype::Tmax => &mut row.tmax,
            Datatype::Tmin => &mut row.tmin,
            Datatype::Prcp => &mut row.prcp,
        };

        if slot.is_none() {
            *slot = Some(record.value);
        } else {
            duplicates += 1;
        }
    }

    if duplicates > 0 {
        debug!("Pivot dropped {} duplicate values (first value kept)", duplicates);
    }

    rows.into_values().collect()
}

/// Per-year averages, precipitation total and station count, ordered by year
pub fn annual_summary(rows: &[WideObservationRow]) -> Vec<AnnualSummary> {
    #[derive(Default)]
    struct YearAcc<'a> {
        tmax: MeanAcc,
        tmin: MeanAcc,
        precip: f64,
        stations: HashSet<&'a str>,
    }

    let mut years: BTreeMap<i32, YearAcc> = BTreeMap::new();

    for row in rows {
        let acc = years.entry(row.year).or_default();
        acc.tmax.push(row.tmax);
        acc.tmin.push(row.tmin);
        acc.precip += row.prcp.unwrap_or(0.0);
        acc.stations.insert(row.station.as_str());
    }

    years
        .into_iter()
        .map(|(year, acc)| {
            let avg_tmax = acc.tmax.mean();
            let avg_tmin = acc.tmin.mean();
            let avg_temp = match (avg_tmax, avg_tmin) {
                (Some(hi), Some(lo)) => Some((hi + lo) / 2.0),
                _ => None,
            };
            AnnualSummary {
                year,
                avg_tmax,
                avg_tmin,
                avg_temp,
                total_precip: acc.precip,
                station_count: acc.stations.len(),
            }
        })
        .collect()
}

/// Per-station means and number of distinct years, ordered by station
pub fn station_summary(rows: &[WideObservationRow]) -> Vec<StationSummary> {
    #[derive(Default)]
    struct StationAcc {
        tmax: MeanAcc,
        tmin: MeanAcc,
        precip: MeanAcc,
        years: HashSet<i32>,
    }

    let mut stations: BTreeMap<&str, StationAcc> = BTreeMap::new();

    for row in rows {
        let acc = stations.entry(row.station.as_str()).or_default();
        acc.tmax.push(row.tmax);
        acc.tmin.push(row.tmin);
        acc.precip.push(row.prcp);
        acc.years.insert(row.year);
    }

    stations
        .into_iter()
        .map(|(station, acc)| StationSummary {
            station: station.to_string(),
            mean_tmax: acc.tmax.mean(),
            mean_tmin: acc.tmin.mean(),
            mean_precip: acc.precip.mean(),
            data_years: acc.years.len(),
        })
        .collect()
}

/// Least squares fit over `(x, y)` points
///
/// Needs at least two points with distinct `x`.
pub fn linear_regression(points: &[(f64, f64)]) -> Option<TemperatureTrend> {
    let n = points.len();
    if n < 2 {
        return None;
    }

    let nf = n as f64;
    let mean_x = points.iter().map(|(x, _)| x).sum::<f64>() / nf;
    let mean_y = points.iter().map(|(_, y)| y).sum::<f64>() / nf;

    let (mut sxx, mut syy, mut sxy) = (0.0, 0.0, 0.0);
    for (x, y) in points {
        let dx = x - mean_x;
        let dy = y - mean_y;
        sxx += dx * dx;
        syy += dy * dy;
        sxy += dx * dy;
    }

    if sxx == 0.0 {
        return None;
    }

    let slope = sxy / sxx;
    let intercept = mean_y - slope * mean_x;
    let r_value = if syy == 0.0 {
        0.0
    } else {
        (sxy / (sxx * syy).sqrt()).clamp(-1.0, 1.0)
    };
    let r_squared = r_value * r_value;
    let std_err = if n > 2 {
        ((1.0 - r_squared) * syy / sxx / (nf - 2.0)).max(0.0).sqrt()
    } else {
        0.0
    };

    Some(TemperatureTrend {
        slope,
        intercept,
        r_value,
        r_squared,
        std_err,
        n,
    })
}

/// Trend of `avg_temp` over year, skipping years without an average
pub fn linear_trend(annual: &[AnnualSummary]) -> Option<TemperatureTrend> {
    let points: Vec<(f64, f64)> = annual
        .iter()
        .filter_map(|a| a.avg_temp.map(|t| (a.year as f64, t)))
        .collect();
    linear_regression(&points)
}

/// The `n` stations with the largest `key`, missing values last
pub fn top_stations_by<F>(stations: &[StationSummary], key: F, n: usize) -> Vec<&StationSummary>
where
    F: Fn(&StationSummary) -> Option<f64>,
{
    let mut sorted: Vec<&StationSummary> = stations.iter().collect();
    sorted.sort_by(|a, b| match (key(a), key(b)) {
        (Some(x), Some(y)) => y.total_cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
    sorted.truncate(n);
    sorted
}
