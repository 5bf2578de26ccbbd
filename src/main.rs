use ny_weather_etl::config::Config;
use ny_weather_etl::db::Repository;
use ny_weather_etl::pipeline::{Pipeline, LIFECYCLE};
use std::fs::OpenOptions;
use std::sync::{Arc, Mutex};
use tracing::info;
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_CONFIG_PATH: &str = "config/config.yaml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    let config_path =
        std::env::var("NY_WEATHER_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

    let config = Config::load(&config_path).map_err(|e| {
        anyhow::anyhow!(
            "Failed to load configuration from {}: {}\n\n\
             Make sure:\n\
             1. {} exists (or set NY_WEATHER_CONFIG)\n\
             2. NOAA_TOKEN is set (check .env.example)\n\
             3. Create a .env file if needed",
            config_path,
            e,
            config_path
        )
    })?;

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.logging.log_file)
        .map_err(|e| {
            anyhow::anyhow!(
                "Failed to open log file {}: {}",
                config.logging.log_file.display(),
                e
            )
        })?;

    // Console gets everything per RUST_LOG; the log file only gets phase transitions
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer().with_filter(
                EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| EnvFilter::new("info,ny_weather_etl=debug,sqlx=warn")),
            ),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(Mutex::new(log_file))
                .with_ansi(false)
                .with_target(false)
                .with_filter(filter_fn(|meta| meta.target() == LIFECYCLE)),
        )
        .init();

    info!("NY weather ETL starting...");
    info!(
        "Configuration loaded: {} {} for {}..{}",
        config.api.dataset_id,
        config.api.location_id,
        config.extract.start_year,
        config.extract.end_year
    );

    std::fs::create_dir_all(&config.output.dir)?;

    let database_url = config.output.database_url();
    let repository = Repository::connect(&database_url).await.map_err(|e| {
        anyhow::anyhow!(
            "Failed to open database {}: {}\n\n\
             Check that the output directory {} is writable",
            database_url,
            e,
            config.output.dir.display()
        )
    })?;
    info!("Connected to database: {}", database_url);

    let repository = Arc::new(repository);
    repository.run_migrations().await?;

    let pipeline = Pipeline::new(config, repository);
    let transformed = pipeline.run().await?;

    info!(
        "NY weather ETL finished: {} wide rows, {} years summarized",
        transformed.wide_rows.len(),
        transformed.annual.len()
    );
    Ok(())
}
