use crate::calendar::{generate_date_ranges, month_of, DateRange};
use crate::config::Config;
use crate::db::models::{MonthStatus, NewFetchedMonth, ObservationRecord};
use crate::db::Repository;
use crate::error::{AppError, Result};
use crate::fetcher::{Fetcher, RangeOutcome};
use crate::output;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct MonthOutcome {
    pub range: DateRange,
    pub records_fetched: usize,
    pub status: MonthStatus,
    pub error: Option<String>,
}

/// Result of fetching the outstanding months of one year
#[derive(Debug, Clone)]
pub struct YearFetch {
    pub year: i32,
    /// Records fetched in this call; months already checkpointed are not included
    pub records: Vec<ObservationRecord>,
    pub months: Vec<MonthOutcome>,
    pub skipped_months: usize,
}

impl YearFetch {
    pub fn failed_months(&self) -> impl Iterator<Item = &MonthOutcome> {
        self.months
            .iter()
            .filter(|m| m.status == MonthStatus::Partial)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExtractReport {
    /// Every checkpointed observation in the span, fresh and from earlier runs
    pub records: Vec<ObservationRecord>,
    pub fetched_months: usize,
    pub skipped_months: usize,
    pub failed_months: Vec<DateRange>,
}

impl ExtractReport {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

pub struct Extractor {
    fetcher: Fetcher,
    repository: Arc<Repository>,
    month_delay: Duration,
    combined_csv: PathBuf,
}

impl Extractor {
    pub fn new(
        fetcher: Fetcher,
        repository: Arc<Repository>,
        month_delay: Duration,
        combined_csv: PathBuf,
    ) -> Self {
        Self {
            fetcher,
            repository,
            month_delay,
            combined_csv,
        }
    }

    pub fn from_config(config: &Config, repository: Arc<Repository>) -> Result<Self> {
        Ok(Self::new(
            Fetcher::from_config(config)?,
            repository,
            Duration::from_millis(config.extract.month_delay_ms),
            config.output.path(&config.output.combined_csv),
        ))
    }

    /// Fetch every month of `year` not yet checkpointed as completed
    ///
    /// Each month is persisted as soon as it is fetched. A month whose
    /// pagination failed keeps its partial rows and is marked `partial`, so
    /// the next run fetches it again.
    pub async fn fetch_year(&self, year: i32) -> Result<YearFetch> {
        let completed = self.repository.completed_months_for_year(year).await?;

        let mut records = Vec::new();
        let mut months = Vec::new();
        let mut skipped_months = 0;

        for range in generate_date_ranges(year) {
            if completed.contains(&range.month) {
                skipped_months += 1;
                continue;
            }

            info!("Fetching {}", range);
            let fetch = self.fetcher.fetch_range(&range).await;

            let fetched = fetch.records.len();
            let mut month_records: Vec<ObservationRecord> = fetch
                .records
                .into_iter()
                .filter(|r| range.contains(r.date))
                .collect();

            if month_records.len() < fetched {
                warn!(
                    "Dropped {} records dated outside {}",
                    fetched - month_records.len(),
                    range
                );
            }

            for record in &mut month_records {
                record.year = year;
            }

            let (status, error) = match &fetch.outcome {
                RangeOutcome::Complete => (MonthStatus::Completed, None),
                RangeOutcome::Failed(e) => {
                    error!(
                        "Failed to retrieve {} after {} pages: {}",
                        range, fetch.pages_requested, e
                    );
                    (MonthStatus::Partial, Some(e.to_string()))
                }
            };

            let unit = NewFetchedMonth {
                year,
                month: range.month,
                start_date: range.start,
                end_date: range.end,
                records_fetched: month_records.len() as i64,
                status,
                error: error.clone(),
            };
            let insert_result = self.repository.save_month(unit, &month_records).await?;

            info!(
                "Stored {} for {}: {} inserted, {} replaced",
                status.as_str(),
                range,
                insert_result.inserted,
                insert_result.replaced
            );

            months.push(MonthOutcome {
                range,
                records_fetched: month_records.len(),
                status,
                error,
            });
            records.extend(month_records);

            // Rate limiting: delay between months
            if !self.month_delay.is_zero() {
                tokio::time::sleep(self.month_delay).await;
            }
        }

        if records.is_empty() && skipped_months < 12 {
            info!("No data returned for {}", year);
        }

        Ok(YearFetch {
            year,
            records,
            months,
            skipped_months,
        })
    }

    /// Fetch years `[start_year, end_year)` and write the combined CSV
    ///
    /// An empty report means nothing is stored for the span; it is logged,
    /// not raised.
    pub async fn extract(&self, start_year: i32, end_year: i32) -> Result<ExtractReport> {
        let mut report = ExtractReport::default();

        for year in start_year..end_year {
            let year_fetch = self.fetch_year(year).await?;

            report.fetched_months += year_fetch.months.len();
            report.skipped_months += year_fetch.skipped_months;
            report
                .failed_months
                .extend(year_fetch.failed_months().map(|m| m.range));

            info!(
                "Year {} complete: {} records from {} months, {} months already stored",
                year_fetch.year,
                year_fetch.records.len(),
                year_fetch.months.len(),
                year_fetch.skipped_months
            );
        }

        report.records = self
            .repository
            .load_observations(start_year, end_year)
            .await?;

        if report.records.is_empty() {
            warn!(
                "Failed to save data: no observations stored for {}..{}",
                start_year, end_year
            );
            return Ok(report);
        }

        // The CSV seeds months as completed, so unfinished months stay out of it
        let unfinished: HashSet<(i32, u32)> = report
            .failed_months
            .iter()
            .map(|range| (range.year, range.month))
            .collect();
        let finished: Vec<ObservationRecord> = report
            .records
            .iter()
            .filter(|r| !unfinished.contains(&month_of(r.date)))
            .cloned()
            .collect();

        output::write_csv(&self.combined_csv, &finished)?;
        info!(
            "Saved {} records to {} ({} from incomplete months left out)",
            finished.len(),
            self.combined_csv.display(),
            report.records.len() - finished.len()
        );

        if !report.failed_months.is_empty() {
            warn!(
                "{} months are incomplete and will be fetched again on the next run",
                report.failed_months.len()
            );
        }

        Ok(report)
    }

    /// Import a combined CSV from a previous run into an empty checkpoint store
    ///
    /// Every (year, month) present in the file is marked completed; `extract`
    /// only writes months that finished. Returns the number of records
    /// imported.
    pub async fn seed_from_csv(&self, path: &Path) -> Result<usize> {
        if !path.exists() {
            return Ok(0);
        }

        if self.repository.observation_count().await? > 0 {
            info!(
                "Checkpoint store already populated, ignoring {}",
                path.display()
            );
            return Ok(0);
        }

        let records: Vec<ObservationRecord> = output::read_csv(path)?;
        info!("Seeding {} records from {}", records.len(), path.display());

        let mut by_month: BTreeMap<(i32, u32), Vec<ObservationRecord>> = BTreeMap::new();
        for record in records {
            by_month.entry(month_of(record.date)).or_default().push(record);
        }

        let mut imported = 0;
        for ((year, month), month_records) in by_month {
            let range = DateRange::for_month(year, month).ok_or_else(|| {
                AppError::InvalidData(format!("Invalid month {}-{}", year, month))
            })?;

            let unit = NewFetchedMonth {
                year,
                month,
                start_date: range.start,
                end_date: range.end,
                records_fetched: month_records.len() as i64,
                status: MonthStatus::Completed,
                error: None,
            };
            let result = self.repository.save_month(unit, &month_records).await?;
            imported += result.inserted;
        }

        Ok(imported)
    }
}
