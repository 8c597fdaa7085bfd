use chrono::{Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use gridcarbon::api::{self, ApiState};
use gridcarbon::config::{redact_dsn, Config};
use gridcarbon::domain::FuelMix;
use gridcarbon::error::GridError;
use gridcarbon::forecaster::{HeuristicForecaster, REGION_TZ};
use gridcarbon::ingest::{self, ProgressFn};
use gridcarbon::pipeline::PipelineResult;
use gridcarbon::sources::{nyiso, weather};
use gridcarbon::store::{blocking::BlockingStore, Store};

/// Exit codes: 0 success, 1 data unavailable, 2 misconfigured.
pub enum CliError {
    DataUnavailable(String),
    Misconfigured(String),
    Other(anyhow::Error),
}

impl From<GridError> for CliError {
    fn from(err: GridError) -> Self {
        match err {
            GridError::Config(msg) => CliError::Misconfigured(msg),
            other => CliError::Other(anyhow::anyhow!(other)),
        }
    }
}

impl From<anyhow::Error> for CliError {
    fn from(err: anyhow::Error) -> Self {
        CliError::Other(err)
    }
}

#[derive(Parser)]
#[command(
    name = "gridcarbon",
    about = "Real-time carbon intensity tracking and forecasting for the NYISO grid",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose (debug) logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Get the current grid carbon intensity and recommendation
    Now,
    /// Get a carbon intensity forecast with best/worst windows
    Forecast {
        /// Hours to forecast (1-48)
        #[arg(short = 'H', long, default_value_t = 24)]
        hours: usize,
    },
    /// Seed historical data from NYISO and Open-Meteo
    Seed {
        /// Days of history to backfill
        #[arg(short, long, default_value_t = 30)]
        days: u32,
        /// Skip weather data seeding
        #[arg(long)]
        no_weather: bool,
    },
    /// Run continuous ingestion until interrupted
    Ingest {
        /// NYISO poll interval in seconds
        #[arg(short, long, default_value_t = 300)]
        interval: u64,
        /// Weather poll interval in seconds
        #[arg(long, default_value_t = 3600)]
        weather_interval: u64,
    },
    /// Start the REST API server
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(short, long, default_value_t = 8000)]
        port: u16,
    },
    /// Show database status and data coverage
    Status,
}

impl Cli {
    pub fn run(self) -> Result<(), CliError> {
        match self.command {
            Commands::Now => run_async(now),
            Commands::Forecast { hours } => run_async(move || forecast(hours)),
            Commands::Seed { days, no_weather } => run_async(move || seed(days, no_weather)),
            Commands::Ingest {
                interval,
                weather_interval,
            } => run_async(move || ingest_continuous(interval, weather_interval)),
            Commands::Serve { host, port } => run_async(move || serve(host, port)),
            Commands::Status => status(),
        }
    }
}

fn run_async<F, Fut>(func: F) -> Result<(), CliError>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<(), CliError>>,
{
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Other(err.into()))?;
    runtime.block_on(func())
}

/// Interrupt observer for the long-running commands: first Ctrl+C requests
/// a graceful drain through the shared token.
fn install_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received, draining");
            token.cancel();
        }
    });
}

fn print_pipeline_result<T>(result: &PipelineResult<T>, label: &str) {
    println!("  [{label}] {}", result.summary().replace('\n', "\n  "));
}

fn print_mix(mix: &FuelMix) {
    let Ok(ci) = mix.carbon_intensity() else {
        return;
    };
    let local = mix.timestamp.with_timezone(&REGION_TZ);
    println!();
    println!("NYISO Grid Carbon Intensity");
    println!("  {:.0} gCO2/kWh  [{}]", ci.grams_co2_per_kwh, ci.category().label());
    println!("  {}", ci.category().recommendation());
    println!("  as of {}", local.format("%Y-%m-%d %H:%M %Z"));
    println!();
    println!("  {:<22} {:>9} {:>7}", "Fuel", "MW", "%");
    let total = mix.total_generation_mw();
    for (fuel, mw) in mix.fuel_breakdown() {
        let pct = if total > 0.0 { mw / total * 100.0 } else { 0.0 };
        let bar = "#".repeat((pct / 3.0) as usize);
        println!("  {:<22} {:>9.0} {:>6.1}% {}", fuel.as_label(), mw, pct, bar);
    }
    println!("  {:<22} {:>9.0} {:>6.1}%", "Total", total, 100.0);
    println!();
    println!("  Clean energy: {:.1}%", mix.clean_percentage());
}

async fn now() -> Result<(), CliError> {
    let client = reqwest::Client::new();
    let latest = nyiso::fetch_latest(&client)
        .await
        .map_err(|err| CliError::DataUnavailable(err.to_string()))?;
    let Some(mix) = latest else {
        return Err(CliError::DataUnavailable(
            "could not fetch current data from NYISO".into(),
        ));
    };

    // Opportunistic write-through; a missing database is not an error for
    // a read command.
    if let Ok(config) = Config::from_env() {
        if let Ok(store) = Store::connect(&config.database_url).await {
            if let Err(err) = store.save_fuel_mix(&mix).await {
                tracing::debug!(error = %err, "could not save live snapshot");
            }
        }
    }

    print_mix(&mix);
    Ok(())
}

async fn forecast(hours: usize) -> Result<(), CliError> {
    let config = Config::from_env()?;
    let store = Arc::new(Store::connect(&config.database_url).await?);
    let client = reqwest::Client::new();

    let current = match nyiso::fetch_latest(&client).await {
        Ok(Some(mix)) => mix.carbon_intensity().ok(),
        _ => None,
    };
    let weather_data = weather::fetch_forecast(&client, 2).await.ok();

    let mut forecaster = HeuristicForecaster::new(store);
    let fc = forecaster
        .forecast(hours, weather_data.as_deref(), current)
        .await?;

    println!();
    println!("{}", fc.summary(REGION_TZ));
    println!();
    println!("  {:<16} {:>9}  {:<12} {:<10}", "Time", "gCO2/kWh", "Level", "Confidence");
    for point in &fc.hourly {
        let g = point.predicted.grams_co2_per_kwh;
        let bar = "#".repeat((g / 20.0) as usize);
        println!(
            "  {:<16} {:>9.0}  {:<12} {:<10} {}",
            point.hour.with_timezone(&REGION_TZ).format("%a %I:%M %p"),
            g,
            point.predicted.category().label(),
            point.confidence.as_str(),
            bar
        );
    }
    Ok(())
}

async fn seed(days: u32, no_weather: bool) -> Result<(), CliError> {
    let config = Config::from_env()?;
    let store = Arc::new(Store::connect(&config.database_url).await?);

    let end = Utc::now().with_timezone(&REGION_TZ).date_naive() - ChronoDuration::days(1);
    let start = end - ChronoDuration::days(i64::from(days.saturating_sub(1)));

    let sources = if no_weather { "NYISO" } else { "NYISO + weather" };
    println!("Seeding {days} days of {sources} data ({start} to {end})");

    let progress: ProgressFn = Arc::new(|day, count| {
        println!("  {day}: {count} records");
    });

    let (fuel_result, weather_result) = ingest::run_seed(
        store.clone(),
        &config,
        start,
        end,
        !no_weather,
        Some(progress),
    )
    .await;

    println!();
    println!("Seeding complete");
    print_pipeline_result(&fuel_result, "NYISO");
    if let Some(weather_result) = &weather_result {
        print_pipeline_result(weather_result, "Weather");
    }
    println!("  Database: {}", config.redacted_database_url());
    Ok(())
}

async fn ingest_continuous(interval: u64, weather_interval: u64) -> Result<(), CliError> {
    let mut config = Config::from_env()?;
    config.fuel_mix_poll_interval_seconds = interval;
    config.weather_poll_interval_seconds = weather_interval;

    let store = Arc::new(Store::connect(&config.database_url).await?);
    let shutdown = CancellationToken::new();
    install_interrupt(shutdown.clone());

    println!("Starting continuous ingestion");
    println!("  NYISO:   polling every {interval}s");
    println!("  Weather: polling every {weather_interval}s");
    println!("Press Ctrl+C to stop.");

    let (fuel_result, weather_result) =
        ingest::run_continuous(store, &config, shutdown).await;

    println!();
    println!("Ingestion stopped.");
    print_pipeline_result(&fuel_result, "NYISO");
    print_pipeline_result(&weather_result, "Weather");
    Ok(())
}

async fn serve(host: String, port: u16) -> Result<(), CliError> {
    let config = Config::from_env()?;
    let store = Arc::new(Store::connect(&config.database_url).await?);
    println!("Starting gridcarbon API at http://{host}:{port}");
    api::serve(ApiState::new(store), &host, port)
        .await
        .map_err(CliError::Other)
}

fn status() -> Result<(), CliError> {
    let config = Config::from_env()?;
    let store = BlockingStore::connect(&config.database_url)?;

    let count = store.record_count()?;
    let range = store.date_range()?;
    let ingestion = store.get_ingestion_status()?;
    let weather = store.get_weather_freshness()?;

    println!("gridcarbon status");
    println!("  Database: {}", redact_dsn(store.dsn()));
    println!("  Records:  {count}");
    match range {
        Some((earliest, latest)) => {
            println!("  Earliest: {earliest}");
            println!("  Latest:   {latest}");
        }
        None => {
            println!("  Earliest: n/a");
            println!("  Latest:   n/a");
        }
    }
    println!(
        "  Ingestion: {} ({} records, {} errors in the last hour)",
        if ingestion.is_active { "active" } else { "inactive" },
        ingestion.records_last_hour,
        ingestion.errors_last_hour
    );
    println!("  Weather:   {}", weather.status);

    if count == 0 {
        println!();
        println!("No data yet. Run `gridcarbon seed --days 30` to get started.");
    }
    Ok(())
}
