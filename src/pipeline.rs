use crate::aggregate::{
    annual_summary, linear_trend, pivot, station_summary, top_stations_by, AnnualSummary,
    StationSummary, TemperatureTrend,
};
use crate::charts::{render_precipitation_chart, render_temperature_chart};
use crate::config::{Config, StationFilter};
use crate::db::models::{ObservationRecord, WideObservationRow};
use crate::db::Repository;
use crate::error::Result;
use crate::extractor::Extractor;
use crate::output;
use std::sync::Arc;
use tracing::{info, warn};

/// Tracing target for phase transitions, mirrored into the lifecycle log file
pub const LIFECYCLE: &str = "lifecycle";

/// Wide table and the summaries computed from it
#[derive(Debug, Clone, Default)]
pub struct Transformed {
    pub wide_rows: Vec<WideObservationRow>,
    pub annual: Vec<AnnualSummary>,
    pub stations: Vec<StationSummary>,
    pub trend: Option<TemperatureTrend>,
}

/// Filter, pivot and summarize observation records
pub fn transform(mut records: Vec<ObservationRecord>, filter: &StationFilter) -> Transformed {
    let before_filter = records.len();
    records.retain(|r| filter.matches(&r.station));
    if records.len() < before_filter {
        info!(
            "Station filter: kept {}/{} observations matching configured stations",
            records.len(),
            before_filter
        );
    }

    let wide_rows = pivot(&records);
    let annual = annual_summary(&wide_rows);
    let stations = station_summary(&wide_rows);
    let trend = linear_trend(&annual);

    Transformed {
        wide_rows,
        annual,
        stations,
        trend,
    }
}

pub struct Pipeline {
    config: Config,
    repository: Arc<Repository>,
}

impl Pipeline {
    pub fn new(config: Config, repository: Arc<Repository>) -> Self {
        Self { config, repository }
    }

    /// Run extraction, transformation, outputs and the example query
    pub async fn run(&self) -> Result<Transformed> {
        info!(target: LIFECYCLE, "Preliminaries complete. Initiating ETL process.");

        let extractor = Extractor::from_config(&self.config, self.repository.clone())?;
        let combined_csv = self.config.output.path(&self.config.output.combined_csv);

        let seeded = extractor.seed_from_csv(&combined_csv).await?;
        if seeded > 0 {
            info!(
                target: LIFECYCLE,
                "Previous CSV available, seeded {} records from {}",
                seeded,
                combined_csv.display()
            );
        }

        let start_year = self.config.extract.start_year;
        let end_year = self.config.extract.end_year;
        let report = extractor.extract(start_year, end_year).await?;

        info!(
            target: LIFECYCLE,
            "Data extraction complete ({} records, {} months fetched, {} reused, {} incomplete). \
             Initiating Transformation process.",
            report.records.len(),
            report.fetched_months,
            report.skipped_months,
            report.failed_months.len()
        );

        if report.is_empty() {
            warn!(
                target: LIFECYCLE,
                "No observations available for {}..{}, nothing to transform",
                start_year,
                end_year
            );
            return Ok(Transformed::default());
        }

        let transformed = transform(report.records, &self.config.stations);
        self.report_summaries(&transformed);
        self.write_outputs(&transformed)?;

        info!(
            target: LIFECYCLE,
            "Data transformation complete. Initiating loading process."
        );

        self.repository
            .replace_weather_data(&transformed.wide_rows)
            .await?;
        info!(
            target: LIFECYCLE,
            "Data loaded to Database as table. Running the query."
        );

        self.run_query(start_year, end_year).await?;

        info!(target: LIFECYCLE, "Process Complete.");
        Ok(transformed)
    }

    fn report_summaries(&self, transformed: &Transformed) {
        for summary in transformed.annual.iter().take(5) {
            info!(
                "{}: avg_tmax={:?} avg_tmin={:?} avg_temp={:?} total_precip={:.1} stations={}",
                summary.year,
                summary.avg_tmax,
                summary.avg_tmin,
                summary.avg_temp,
                summary.total_precip,
                summary.station_count
            );
        }

        match &transformed.trend {
            Some(trend) => info!(
                "Trend: {:.3} °C per year ({:.2} °C per decade), intercept={:.2}, r²={:.3}, stderr={:.4}, n={}",
                trend.slope,
                trend.per_decade(),
                trend.intercept,
                trend.r_squared,
                trend.std_err,
                trend.n
            ),
            None => warn!("Not enough annual averages to compute a temperature trend"),
        }

        for station in top_stations_by(&transformed.stations, |s| s.mean_tmax, 5) {
            info!(
                "top5_hot: {} mean_tmax={:?} years={}",
                station.station, station.mean_tmax, station.data_years
            );
        }

        for station in top_stations_by(&transformed.stations, |s| s.mean_precip, 5) {
            info!(
                "top5_wet: {} mean_precip={:?} years={}",
                station.station, station.mean_precip, station.data_years
            );
        }
    }

    fn write_outputs(&self, transformed: &Transformed) -> Result<()> {
        let out = &self.config.output;

        render_temperature_chart(&out.path(&out.temperature_chart), &transformed.annual)?;
        render_precipitation_chart(&out.path(&out.precipitation_chart), &transformed.annual)?;

        output::write_csv(out.path(&out.annual_summary_csv), &transformed.annual)?;
        output::write_csv(out.path(&out.station_summary_csv), &transformed.stations)?;

        info!(target: LIFECYCLE, "Data saved to CSV file.");
        Ok(())
    }

    async fn run_query(&self, start_year: i32, end_year: i32) -> Result<()> {
        info!(
            "SELECT date, station, MAX(tmax) AS max_temp, year FROM weather_data \
             WHERE year >= {} AND year < {} GROUP BY station ORDER BY station",
            start_year, end_year
        );

        let rows = self
            .repository
            .max_temp_by_station(start_year, end_year)
            .await?;

        for row in &rows {
            info!(
                "{:>24} {} {:>6.1} {}",
                row.station, row.date, row.max_temp, row.year
            );
        }
        info!("{} stations returned", rows.len());
        Ok(())
    }
}
