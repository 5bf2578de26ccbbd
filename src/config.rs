use crate::db::models::Datatype;
use crate::error::{AppError, Result};
use crate::fetcher::RetryPolicy;
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// NOAA caps `limit` at 1000 results per page
const MAX_PAGE_LIMIT: u32 = 1000;

const MAX_RETRY_ATTEMPTS: u32 = 20;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub api: ApiConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    pub extract: ExtractConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub stations: StationFilter,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub token: String,
    #[serde(default = "default_dataset_id")]
    pub dataset_id: String,
    #[serde(default = "default_location_id")]
    pub location_id: String,
    #[serde(default = "default_datatypes")]
    pub datatypes: Vec<Datatype>,
    #[serde(default = "default_units")]
    pub units: String,
    #[serde(default = "default_page_limit", deserialize_with = "deserialize_number")]
    pub page_limit: u32,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_dataset_id() -> String {
    "GHCND".to_string()
}

fn default_location_id() -> String {
    "FIPS:36".to_string()
}

fn default_datatypes() -> Vec<Datatype> {
    vec![Datatype::Tmax, Datatype::Tmin, Datatype::Prcp]
}

fn default_units() -> String {
    "metric".to_string()
}

fn default_page_limit() -> u32 {
    MAX_PAGE_LIMIT
}

fn default_timeout_seconds() -> u64 {
    60
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts", deserialize_with = "deserialize_number")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base")]
    pub backoff_base: f64,
    #[serde(default = "default_backoff_unit_ms")]
    pub backoff_unit_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_base() -> f64 {
    2.0
}

fn default_backoff_unit_ms() -> u64 {
    1000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base: default_backoff_base(),
            backoff_unit_ms: default_backoff_unit_ms(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff_base: self.backoff_base,
            backoff_unit: Duration::from_millis(self.backoff_unit_ms),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractConfig {
    /// First year fetched (inclusive)
    #[serde(deserialize_with = "deserialize_number")]
    pub start_year: i32,
    /// Last year fetched (exclusive)
    #[serde(deserialize_with = "deserialize_number")]
    pub end_year: i32,
    #[serde(default = "default_page_delay_ms")]
    pub page_delay_ms: u64,
    #[serde(default = "default_month_delay_ms")]
    pub month_delay_ms: u64,
}

fn default_page_delay_ms() -> u64 {
    200
}

fn default_month_delay_ms() -> u64 {
    500
}

/// Custom deserializer that handles numbers given either as numbers or strings
///
/// Accepts:
/// - `start_year: 1974` (number)
/// - `start_year: "1974"` (string that parses to number)
/// - `start_year: ${START_YEAR}` (env var substituted to either)
fn deserialize_number<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr + TryFrom<i64>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberValue {
        Number(i64),
        String(String),
    }

    match NumberValue::deserialize(deserializer)? {
        NumberValue::Number(n) => T::try_from(n)
            .map_err(|_| serde::de::Error::custom(format!("Number out of range: {}", n))),
        NumberValue::String(s) => s
            .trim()
            .parse::<T>()
            .map_err(|_| serde::de::Error::custom(format!("Invalid number: '{}'", s))),
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_database_file")]
    pub database_file: String,
    #[serde(default = "default_combined_csv")]
    pub combined_csv: String,
    #[serde(default = "default_annual_summary_csv")]
    pub annual_summary_csv: String,
    #[serde(default = "default_station_summary_csv")]
    pub station_summary_csv: String,
    #[serde(default = "default_temperature_chart")]
    pub temperature_chart: String,
    #[serde(default = "default_precipitation_chart")]
    pub precipitation_chart: String,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./output")
}

fn default_database_file() -> String {
    "ny_weather.db".to_string()
}

fn default_combined_csv() -> String {
    "new_york_weather.csv".to_string()
}

fn default_annual_summary_csv() -> String {
    "ny_annual_climate_summary.csv".to_string()
}

fn default_station_summary_csv() -> String {
    "ny_station_summary.csv".to_string()
}

fn default_temperature_chart() -> String {
    "average_temp_ny.svg".to_string()
}

fn default_precipitation_chart() -> String {
    "total_precipitation_ny.svg".to_string()
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
            database_file: default_database_file(),
            combined_csv: default_combined_csv(),
            annual_summary_csv: default_annual_summary_csv(),
            station_summary_csv: default_station_summary_csv(),
            temperature_chart: default_temperature_chart(),
            precipitation_chart: default_precipitation_chart(),
        }
    }
}

impl OutputConfig {
    /// Resolve a configured file name inside the output directory
    pub fn path(&self, file_name: &str) -> PathBuf {
        self.dir.join(file_name)
    }

    pub fn database_url(&self) -> String {
        format!("sqlite://{}", self.path(&self.database_file).display())
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StationFilter {
    #[serde(default)]
    pub stations: Vec<String>,
    #[serde(default)]
    pub patterns: Vec<String>,
}

impl StationFilter {
    pub fn is_empty(&self) -> bool {
        self.stations.is_empty() && self.patterns.is_empty()
    }

    pub fn matches(&self, station: &str) -> bool {
        if self.is_empty() {
            return true;
        }

        if self.stations.iter().any(|s| s == station) {
            return true;
        }

        self.patterns.iter().any(|pattern| {
            glob::Pattern::new(pattern)
                .map(|p| p.matches(station))
                .unwrap_or(false)
        })
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,
}

fn default_log_file() -> PathBuf {
    PathBuf::from("code_log.txt")
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_file: default_log_file(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| AppError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_yaml_str(&content)
    }

    /// Parse and validate configuration from YAML text, expanding `${VAR}` references
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content)?;

        let config: Config = serde_yaml::from_str(&expanded)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    ///
    /// Checks for:
    /// - Unexpanded environment variables and an empty API token
    /// - Valid HTTPS base URL
    /// - Page limit within the API maximum
    /// - Retry count (bounded) and exponential backoff base
    /// - A non-empty year span
    /// - Well-formed station patterns
    fn validate(&self) -> Result<()> {
        if self.api.token.contains("${") {
            return Err(AppError::Config(
                "NOAA_TOKEN environment variable is not set. \
                 Please set it or create a .env file. \
                 See .env.example for required variables."
                    .to_string(),
            ));
        }

        if self.api.token.trim().is_empty() {
            return Err(AppError::Config("API token cannot be empty".to_string()));
        }

        let parsed = url::Url::parse(&self.api.base_url).map_err(|e| {
            AppError::Config(format!(
                "Invalid api base_url '{}': {}",
                self.api.base_url, e
            ))
        })?;

        if parsed.scheme() != "https" {
            return Err(AppError::Config(format!(
                "API base_url must use HTTPS, got: {}",
                parsed.scheme()
            )));
        }

        if self.api.datatypes.is_empty() {
            return Err(AppError::Config(
                "At least one datatype must be requested".to_string(),
            ));
        }

        if self.api.page_limit == 0 || self.api.page_limit > MAX_PAGE_LIMIT {
            return Err(AppError::Config(format!(
                "API page_limit must be between 1 and {}, got {}",
                MAX_PAGE_LIMIT, self.api.page_limit
            )));
        }

        if self.retry.max_attempts == 0 || self.retry.max_attempts > MAX_RETRY_ATTEMPTS {
            return Err(AppError::Config(format!(
                "Retry max_attempts must be between 1 and {}, got {}",
                MAX_RETRY_ATTEMPTS, self.retry.max_attempts
            )));
        }

        if self.retry.backoff_base <= 1.0 {
            return Err(AppError::Config(format!(
                "Retry backoff_base must be greater than 1, got {}",
                self.retry.backoff_base
            )));
        }

        if self.extract.start_year >= self.extract.end_year {
            return Err(AppError::Config(format!(
                "Extract start_year {} must be before end_year {} (end is exclusive)",
                self.extract.start_year, self.extract.end_year
            )));
        }

        if self.extract.page_delay_ms == 0 {
            tracing::warn!("Page delay is 0ms, the API may start rate limiting requests");
        }

        for pattern in &self.stations.patterns {
            if let Err(e) = glob::Pattern::new(pattern) {
                return Err(AppError::Config(format!(
                    "Invalid station pattern '{}': {}",
                    pattern, e
                )));
            }
        }

        Ok(())
    }
}

fn expand_env_vars(content: &str) -> Result<String> {
    let mut result = content.to_string();
    let re = regex_lite::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| AppError::Config(format!("Invalid env pattern: {}", e)))?;

    let mut missing_vars = Vec::new();

    for cap in re.captures_iter(content) {
        let var_name = &cap[1];
        match std::env::var(var_name) {
            Ok(value) => {
                result = result.replace(&cap[0], &value);
            }
            Err(_) => {
                missing_vars.push(var_name.to_string());
            }
        }
    }

    if !missing_vars.is_empty() {
        return Err(AppError::Config(format!(
            "Missing required environment variable{}: {}\n\n\
             To fix this:\n\
             1. Create a .env file in the project root (copy .env.example)\n\
             2. Set the missing variable{}: export {}=<value>\n\
             3. Or set {} in your environment before running",
            if missing_vars.len() > 1 { "s" } else { "" },
            missing_vars.join(", "),
            if missing_vars.len() > 1 { "s" } else { "" },
            missing_vars[0],
            missing_vars.join(", ")
        )));
    }

    Ok(result)
}
