use ny_weather_etl::aggregate::AnnualSummary;
use ny_weather_etl::calendar::DateRange;
use ny_weather_etl::config::{ApiConfig, Config};
use ny_weather_etl::db::models::{
    Datatype, MonthStatus, NewFetchedMonth, ObservationRecord,
};
use ny_weather_etl::db::Repository;
use ny_weather_etl::extractor::Extractor;
use ny_weather_etl::fetcher::{Fetcher, RetryPolicy};
use ny_weather_etl::output;
use ny_weather_etl::parser::Parser;
use ny_weather_etl::pipeline::Pipeline;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

const DATA_PATH: &str = "/cdo-web/api/v2/data";

/// Serves canned results per `startdate`; every other month is empty
struct MonthResponder {
    months: HashMap<String, Value>,
}

impl MonthResponder {
    fn new(months: Vec<(&str, Value)>) -> Self {
        Self {
            months: months
                .into_iter()
                .map(|(start, body)| (start.to_string(), body))
                .collect(),
        }
    }
}

impl Respond for MonthResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let start = request
            .url
            .query_pairs()
            .find(|(k, _)| k == "startdate")
            .map(|(_, v)| v.into_owned())
            .unwrap_or_default();

        match self.months.get(&start) {
            Some(body) => ResponseTemplate::new(200).set_body_json(body.clone()),
            None => ResponseTemplate::new(200).set_body_string("{}"),
        }
    }
}

fn result(date: &str, datatype: &str, station: &str, value: f64) -> Value {
    json!({
        "date": format!("{}T00:00:00", date),
        "datatype": datatype,
        "station": station,
        "attributes": ",,7,",
        "value": value
    })
}

fn single_page(results: Vec<Value>) -> Value {
    json!({
        "metadata": {"resultset": {"offset": 1, "count": results.len(), "limit": 1000}},
        "results": results
    })
}

/// Two days at one station: tmax 10/0, tmin -4/0, prcp 2/1
fn january_2020_page() -> Value {
    single_page(vec![
        result("2020-01-15", "TMAX", "GHCND:USW00094728", 10.0),
        result("2020-01-15", "TMIN", "GHCND:USW00094728", -4.0),
        result("2020-01-15", "PRCP", "GHCND:USW00094728", 2.0),
        result("2020-01-16", "TMAX", "GHCND:USW00094728", 0.0),
        result("2020-01-16", "TMIN", "GHCND:USW00094728", 0.0),
        result("2020-01-16", "PRCP", "GHCND:USW00094728", 1.0),
    ])
}

fn api_config(server: &MockServer) -> ApiConfig {
    ApiConfig {
        base_url: format!("{}{}", server.uri(), DATA_PATH),
        token: "test-token".to_string(),
        dataset_id: "GHCND".to_string(),
        location_id: "FIPS:36".to_string(),
        datatypes: vec![Datatype::Tmax, Datatype::Tmin, Datatype::Prcp],
        units: "metric".to_string(),
        page_limit: 1000,
        timeout_seconds: 5,
    }
}

async fn open_repository(dir: &Path) -> Arc<Repository> {
    let url = format!("sqlite://{}", dir.join("checkpoint.db").display());
    let repo = Repository::connect(&url)
        .await
        .expect("Failed to open database");
    repo.run_migrations().await.expect("Migrations failed");
    Arc::new(repo)
}

fn extractor(server: &MockServer, repo: Arc<Repository>, dir: &Path, attempts: u32) -> Extractor {
    let retry = RetryPolicy {
        max_attempts: attempts,
        backoff_base: 2.0,
        backoff_unit: Duration::from_millis(1),
    };
    let fetcher = Fetcher::new(api_config(server), retry).expect("Failed to create fetcher");
    Extractor::new(fetcher, repo, Duration::ZERO, dir.join("new_york_weather.csv"))
}

async fn request_count(server: &MockServer) -> usize {
    server.received_requests().await.unwrap().len()
}

/// A finished year is fully checkpointed and never requested again
#[tokio::test]
async fn test_fetch_year_checkpoints_every_month() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(DATA_PATH))
        .respond_with(MonthResponder::new(vec![("2020-01-01", january_2020_page())]))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let repo = open_repository(dir.path()).await;
    let extractor = extractor(&server, repo.clone(), dir.path(), 1);

    let first = extractor.fetch_year(2020).await.expect("fetch_year failed");
    assert_eq!(first.months.len(), 12);
    assert_eq!(first.skipped_months, 0);
    assert_eq!(first.records.len(), 6);
    assert_eq!(first.failed_months().count(), 0);
    assert!(first.records.iter().all(|r| r.year == 2020));
    assert_eq!(request_count(&server).await, 12);

    let completed = repo.completed_months_for_year(2020).await.unwrap();
    assert_eq!(completed.len(), 12);

    let second = extractor.fetch_year(2020).await.expect("fetch_year failed");
    assert!(second.months.is_empty());
    assert_eq!(second.skipped_months, 12);
    assert!(second.records.is_empty());
    assert_eq!(request_count(&server).await, 12);
}

/// A month that failed is stored as partial and fetched again next run
#[tokio::test]
async fn test_fetch_year_refetches_partial_month() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(DATA_PATH))
        .and(query_param("startdate", "2020-03-01"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path(DATA_PATH))
        .respond_with(MonthResponder::new(vec![(
            "2020-03-01",
            single_page(vec![result("2020-03-10", "PRCP", "GHCND:USC00305801", 4.2)]),
        )]))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let repo = open_repository(dir.path()).await;
    let extractor = extractor(&server, repo.clone(), dir.path(), 1);

    let first = extractor.fetch_year(2020).await.unwrap();
    let failed: Vec<u32> = first.failed_months().map(|m| m.range.month).collect();
    assert_eq!(failed, vec![3]);

    let march = repo.get_fetched_month(2020, 3).await.unwrap().unwrap();
    assert_eq!(march.status, MonthStatus::Partial.as_str());
    assert!(march.error.is_some());

    let before = request_count(&server).await;
    let second = extractor.fetch_year(2020).await.unwrap();
    assert_eq!(second.skipped_months, 11);
    assert_eq!(second.months.len(), 1);
    assert_eq!(second.records.len(), 1);
    assert_eq!(request_count(&server).await, before + 1);

    let march = repo.get_fetched_month(2020, 3).await.unwrap().unwrap();
    assert_eq!(march.status, MonthStatus::Completed.as_str());
}

/// Records dated outside the requested month are not stored
#[tokio::test]
async fn test_fetch_year_drops_out_of_range_records() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(DATA_PATH))
        .respond_with(MonthResponder::new(vec![(
            "2021-02-01",
            single_page(vec![
                result("2021-02-28", "TMAX", "GHCND:USW00014732", 3.0),
                result("2021-03-01", "TMAX", "GHCND:USW00014732", 4.0),
            ]),
        )]))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let repo = open_repository(dir.path()).await;
    let year = extractor(&server, repo, dir.path(), 1)
        .fetch_year(2021)
        .await
        .unwrap();

    assert_eq!(year.records.len(), 1);
    assert_eq!(year.records[0].value, 3.0);
}

/// Extraction writes every stored observation to the combined CSV
#[tokio::test]
async fn test_extract_writes_combined_csv() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(DATA_PATH))
        .respond_with(MonthResponder::new(vec![("2020-01-01", january_2020_page())]))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let repo = open_repository(dir.path()).await;
    let report = extractor(&server, repo, dir.path(), 1)
        .extract(2020, 2021)
        .await
        .unwrap();

    assert_eq!(report.records.len(), 6);
    assert_eq!(report.fetched_months, 12);
    assert!(report.failed_months.is_empty());

    let csv_path = dir.path().join("new_york_weather.csv");
    let saved: Vec<ObservationRecord> = output::read_csv(&csv_path).unwrap();
    assert_eq!(saved, report.records);
}

/// No data anywhere yields an empty report and no CSV
#[tokio::test]
async fn test_extract_with_no_data() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(DATA_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let repo = open_repository(dir.path()).await;
    let report = extractor(&server, repo, dir.path(), 1)
        .extract(2020, 2021)
        .await
        .unwrap();

    assert!(report.is_empty());
    assert!(!dir.path().join("new_york_weather.csv").exists());
}

/// A combined CSV from an earlier run seeds the checkpoint store
#[tokio::test]
async fn test_seed_from_csv_marks_months_completed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(DATA_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let csv_path = dir.path().join("previous.csv");
    let (page, _) = Parser::parse_page(
        &single_page(vec![
            result("2019-05-01", "TMAX", "GHCND:USW00094728", 20.0),
            result("2019-06-30", "TMIN", "GHCND:USW00094728", 15.0),
        ])
        .to_string(),
    )
    .unwrap();
    let records = page.records;
    output::write_csv(&csv_path, &records).unwrap();

    let repo = open_repository(dir.path()).await;
    let extractor = extractor(&server, repo.clone(), dir.path(), 1);

    assert_eq!(extractor.seed_from_csv(&csv_path).await.unwrap(), 2);
    assert_eq!(extractor.seed_from_csv(&csv_path).await.unwrap(), 0);

    let completed = repo.completed_months_for_year(2019).await.unwrap();
    assert_eq!(completed.len(), 2);
    assert!(completed.contains(&5) && completed.contains(&6));

    let year = extractor.fetch_year(2019).await.unwrap();
    assert_eq!(year.skipped_months, 2);
    assert_eq!(request_count(&server).await, 10);
}

/// Rows of a month that failed partway never reach the combined CSV, so
/// seeding from it cannot mark that month completed
#[tokio::test]
async fn test_combined_csv_leaves_out_unfinished_months() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(DATA_PATH))
        .and(query_param("startdate", "2020-03-01"))
        .and(query_param("offset", "1001"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let march_first_page = json!({
        "metadata": {"resultset": {"offset": 1, "count": 2000, "limit": 1000}},
        "results": [result("2020-03-05", "TMAX", "GHCND:USW00094728", 12.0)]
    });
    Mock::given(method("GET"))
        .and(path(DATA_PATH))
        .respond_with(MonthResponder::new(vec![
            ("2020-01-01", january_2020_page()),
            ("2020-03-01", march_first_page),
        ]))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let repo = open_repository(dir.path()).await;
    let report = extractor(&server, repo.clone(), dir.path(), 1)
        .extract(2020, 2021)
        .await
        .unwrap();

    let failed: Vec<u32> = report.failed_months.iter().map(|r| r.month).collect();
    assert_eq!(failed, vec![3]);
    assert_eq!(report.records.len(), 7);

    let march = repo.get_fetched_month(2020, 3).await.unwrap().unwrap();
    assert_eq!(march.status, MonthStatus::Partial.as_str());

    let csv_path = dir.path().join("new_york_weather.csv");
    let saved: Vec<ObservationRecord> = output::read_csv(&csv_path).unwrap();
    assert_eq!(saved.len(), 6);
    assert!(saved.iter().all(|r| r.date.format("%m").to_string() == "01"));

    // A fresh checkpoint store seeded from the CSV still fetches March
    let fresh_dir = TempDir::new().unwrap();
    let fresh_repo = open_repository(fresh_dir.path()).await;
    let seeder = extractor(&server, fresh_repo.clone(), fresh_dir.path(), 1);
    assert_eq!(seeder.seed_from_csv(&csv_path).await.unwrap(), 6);

    let completed = fresh_repo.completed_months_for_year(2020).await.unwrap();
    assert!(completed.contains(&1));
    assert!(!completed.contains(&3));
}

/// A parsed page can be stored as a month directly
#[tokio::test]
async fn test_parse_and_save_month() {
    let dir = TempDir::new().unwrap();
    let repo = open_repository(dir.path()).await;

    let (page, stats) = Parser::parse_page(&january_2020_page().to_string()).unwrap();
    assert_eq!(stats.parsed_successfully, 6);
    assert_eq!(page.resultset.count, 6);

    let range = DateRange::for_month(2020, 1).unwrap();
    let unit = NewFetchedMonth {
        year: 2020,
        month: 1,
        start_date: range.start,
        end_date: range.end,
        records_fetched: page.records.len() as i64,
        status: MonthStatus::Completed,
        error: None,
    };
    let inserted = repo.save_month(unit, &page.records).await.unwrap();

    assert_eq!(inserted.inserted, 6);
    assert_eq!(repo.observation_count().await.unwrap(), 6);
}

/// Full run: extract, transform, write outputs and load the wide table
#[tokio::test]
async fn test_pipeline_end_to_end() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(DATA_PATH))
        .respond_with(MonthResponder::new(vec![("2020-01-01", january_2020_page())]))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let yaml = format!(
        r#"
api:
  base_url: https://www.ncei.noaa.gov/cdo-web/api/v2/data
  token: test-token
retry:
  max_attempts: 1
  backoff_unit_ms: 1
extract:
  start_year: 2020
  end_year: 2021
  page_delay_ms: 0
  month_delay_ms: 0
output:
  dir: {}
"#,
        dir.path().display()
    );
    let mut config = Config::from_yaml_str(&yaml).expect("Invalid config");
    config.api.base_url = format!("{}{}", server.uri(), DATA_PATH);

    let out = config.output.clone();
    let repo = open_repository(dir.path()).await;
    let transformed = Pipeline::new(config, repo.clone())
        .run()
        .await
        .expect("Pipeline failed");

    assert_eq!(transformed.wide_rows.len(), 2);
    assert_eq!(transformed.annual.len(), 1);
    assert!(transformed.trend.is_none());

    let annual: Vec<AnnualSummary> =
        output::read_csv(out.path(&out.annual_summary_csv)).unwrap();
    assert_eq!(
        annual,
        vec![AnnualSummary {
            year: 2020,
            avg_tmax: Some(5.0),
            avg_tmin: Some(-2.0),
            avg_temp: Some(1.5),
            total_precip: 3.0,
            station_count: 1,
        }]
    );

    assert!(out.path(&out.combined_csv).exists());
    assert!(out.path(&out.station_summary_csv).exists());
    assert!(out.path(&out.temperature_chart).exists());
    assert!(out.path(&out.precipitation_chart).exists());
    assert_eq!(repo.weather_data_count().await.unwrap(), 2);
}
