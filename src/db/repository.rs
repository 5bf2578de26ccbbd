use crate::db::models::{
    FetchedMonth, InsertResult, MonthStatus, NewFetchedMonth, ObservationRecord,
    StationMaxTemp, StoredObservation, WideObservationRow,
};
use crate::error::Result;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool};
use std::collections::HashSet;
use std::str::FromStr;
use tracing::{debug, info};

/// Rows per multi-row INSERT, well under SQLite's bound-parameter limit
const BATCH_SIZE: usize = 1000;

pub struct Repository {
    pool: SqlitePool,
}

impl Repository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the SQLite database at `database_url`
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(Self::new(pool))
    }

    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations...");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Months of `year` whose fetch finished without a page failure
    pub async fn completed_months_for_year(&self, year: i32) -> Result<HashSet<u32>> {
        let months = sqlx::query_scalar::<_, i64>(
            "SELECT month FROM fetched_months WHERE year = ? AND status = ?",
        )
        .bind(year)
        .bind(MonthStatus::Completed.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(months.into_iter().map(|m| m as u32).collect())
    }

    pub async fn get_fetched_month(&self, year: i32, month: u32) -> Result<Option<FetchedMonth>> {
        let result = sqlx::query_as::<_, FetchedMonth>(
            "SELECT * FROM fetched_months WHERE year = ? AND month = ?",
        )
        .bind(year)
        .bind(month)
        .fetch_optional(&self.pool)
        .await?;

        Ok(result)
    }

    /// Persist one fetched month atomically
    ///
    /// Rows previously stored for the month's dates are replaced, so a
    /// partial month can be fetched again without duplicating data. Within
    /// `records` the first value for a (date, station, datatype) wins.
    pub async fn save_month(
        &self,
        unit: NewFetchedMonth,
        records: &[ObservationRecord],
    ) -> Result<InsertResult> {
        let mut tx = self.pool.begin().await?;

        let replaced = sqlx::query("DELETE FROM observations WHERE date >= ? AND date <= ?")
            .bind(unit.start_date)
            .bind(unit.end_date)
            .execute(&mut *tx)
            .await?
            .rows_affected() as usize;

        let mut inserted = 0;
        let batches = records.len().div_ceil(BATCH_SIZE);

        for (batch_idx, chunk) in records.chunks(BATCH_SIZE).enumerate() {
            debug!(
                "Inserting batch {}/{} ({} observations)",
                batch_idx + 1,
                batches,
                chunk.len()
            );

            let mut query_builder = sqlx::QueryBuilder::<Sqlite>::new(
                "INSERT OR IGNORE INTO observations (date, datatype, station, value, year) ",
            );

            query_builder.push_values(chunk, |mut b, record| {
                b.push_bind(record.date)
                    .push_bind(record.datatype.as_str())
                    .push_bind(&record.station)
                    .push_bind(record.value)
                    .push_bind(record.year);
            });

            let result = query_builder.build().execute(&mut *tx).await?;
            inserted += result.rows_affected() as usize;
        }

        sqlx::query(
            r#"
            INSERT INTO fetched_months
                (year, month, start_date, end_date, records_fetched, status, error, fetched_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (year, month) DO UPDATE SET
                start_date = excluded.start_date,
                end_date = excluded.end_date,
                records_fetched = excluded.records_fetched,
                status = excluded.status,
                error = excluded.error,
                fetched_at = excluded.fetched_at
            "#,
        )
        .bind(unit.year)
        .bind(unit.month)
        .bind(unit.start_date)
        .bind(unit.end_date)
        .bind(unit.records_fetched)
        .bind(unit.status.as_str())
        .bind(&unit.error)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(InsertResult { inserted, replaced })
    }

    pub async fn observation_count(&self) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM observations")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Every stored observation for years in `[start_year, end_year)`, in insertion order
    pub async fn load_observations(
        &self,
        start_year: i32,
        end_year: i32,
    ) -> Result<Vec<ObservationRecord>> {
        let rows = sqlx::query_as::<_, StoredObservation>(
            "SELECT date, datatype, station, value, year FROM observations \
             WHERE year >= ? AND year < ? ORDER BY rowid",
        )
        .bind(start_year)
        .bind(end_year)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ObservationRecord::try_from).collect()
    }

    /// Replace the contents of `weather_data` with `rows`
    pub async fn replace_weather_data(&self, rows: &[WideObservationRow]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM weather_data")
            .execute(&mut *tx)
            .await?;

        let mut loaded = 0;
        for chunk in rows.chunks(BATCH_SIZE) {
            let mut query_builder = sqlx::QueryBuilder::<Sqlite>::new(
                "INSERT INTO weather_data (date, station, year, tmax, tmin, prcp) ",
            );

            query_builder.push_values(chunk, |mut b, row| {
                b.push_bind(row.date)
                    .push_bind(&row.station)
                    .push_bind(row.year)
                    .push_bind(row.tmax)
                    .push_bind(row.tmin)
                    .push_bind(row.prcp);
            });

            let result = query_builder.build().execute(&mut *tx).await?;
            loaded += result.rows_affected() as usize;
        }

        tx.commit().await?;

        info!("Loaded {} rows into weather_data", loaded);
        Ok(loaded)
    }

    pub async fn weather_data_count(&self) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM weather_data")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Hottest recorded TMAX per station, with the date it occurred
    pub async fn max_temp_by_station(
        &self,
        start_year: i32,
        end_year: i32,
    ) -> Result<Vec<StationMaxTemp>> {
        let rows = sqlx::query_as::<_, StationMaxTemp>(
            r#"
            SELECT date, station, MAX(tmax) AS max_temp, year
            FROM weather_data
            WHERE tmax IS NOT NULL AND year >= ? AND year < ?
            GROUP BY station
            ORDER BY station
            "#,
        )
        .bind(start_year)
        .bind(end_year)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}
