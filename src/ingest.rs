//! Ingestion topology: the concrete fuel-mix and weather pipelines wired
//! onto the pipeline runtime.
//!
//! Both data streams get a seed pipeline (finite backfill over a date
//! range) and a continuous pipeline (infinite poll loop):
//!
//! ```text
//! source -> validate -> persist
//!   ValidationError -> event log + dead letters
//!   StoreError      -> retried, then event log + dead letters
//! ```
//!
//! Continuous pipelines additionally emit stage lifecycle events and
//! stream periodic stage metrics into `pipeline_metrics`.

pub mod sources;
pub mod stages;

#[cfg(test)]
mod tests;

use chrono::NaiveDate;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::domain::{FuelMix, WeatherSnapshot};
use crate::error::ErrorKind;
use crate::pipeline::{
    error_hook_fn, handler_fn, hook_fn, observer_fn, ErrorHandler, LifecycleHooks, MetricsObserver,
    Pipeline, PipelineResult, StageConfig,
};
use crate::store::{failure_details, Store};

pub use sources::ProgressFn;

const PERSIST_RETRIES: u32 = 2;
const PERSIST_RETRY_BASE_DELAY_MS: u64 = 100;
const WEATHER_BATCH_SIZE: usize = 24;
const WEATHER_FLUSH_TIMEOUT_SECS: u64 = 5;

fn http_client() -> reqwest::Client {
    reqwest::Client::new()
}

/// Error handler that records a `<stage>_failure` row in
/// `ingestion_events` for every dead-lettered item.
pub fn event_logging_handler<T: Clone + Send + 'static>(store: Arc<Store>) -> ErrorHandler<T> {
    handler_fn(move |failed| {
        let store = store.clone();
        async move {
            let event_type = format!("{}_failure", failed.stage_name);
            let message = failed.error.to_string();
            store
                .log_event(
                    &event_type,
                    Some(&failed.stage_name),
                    Some(&message),
                    Some(failure_details(&message, failed.attempts)),
                )
                .await;
        }
    })
}

/// Lifecycle hooks that mirror stage transitions into the event log.
fn event_logging_hooks<T: Clone + Send + 'static>(store: Arc<Store>) -> LifecycleHooks<T> {
    let start_store = store.clone();
    let error_store = store.clone();
    let complete_store = store;
    LifecycleHooks {
        on_start: Some(hook_fn(move |stage: String| {
            let store = start_store.clone();
            async move {
                store.log_event("stage_start", Some(&stage), None, None).await;
            }
        })),
        on_error: Some(error_hook_fn(move |stage: String, _item: T, error| {
            let store = error_store.clone();
            async move {
                store
                    .log_event("stage_error", Some(&stage), Some(&error.to_string()), None)
                    .await;
            }
        })),
        on_complete: Some(hook_fn(move |stage: String| {
            let store = complete_store.clone();
            async move {
                store
                    .log_event("stage_complete", Some(&stage), None, None)
                    .await;
            }
        })),
    }
}

/// Metrics observer that writes every snapshot batch to
/// `pipeline_metrics`.
fn metrics_writer(store: Arc<Store>, pipeline_name: &'static str) -> MetricsObserver {
    observer_fn(move |snapshots| {
        let store = store.clone();
        async move {
            store.save_pipeline_metrics(pipeline_name, &snapshots).await;
        }
    })
}

fn persist_stage_config() -> StageConfig {
    StageConfig::default()
        .retries(PERSIST_RETRIES)
        .retry_base_delay(std::time::Duration::from_millis(PERSIST_RETRY_BASE_DELAY_MS))
}

// ── Pipeline builders ──

pub fn build_fuel_seed_pipeline(
    store: Arc<Store>,
    config: &Config,
    start: NaiveDate,
    end: NaiveDate,
    progress: Option<ProgressFn>,
) -> Pipeline<FuelMix> {
    let client = http_client();
    let rate_limit = config.rate_limit_delay_fuel();
    let handler = event_logging_handler::<FuelMix>(store.clone());
    let persist_store = store;

    Pipeline::builder("fuelmix-seed")
        .channel_capacity(config.channel_capacity_seed)
        .drain_timeout(config.drain_timeout_seed())
        .source(move |ctx| {
            sources::fuel_mix_date_source(ctx, client, start, end, rate_limit, progress)
        })
        .stage("validate", StageConfig::default(), |mix: FuelMix| async move {
            stages::validate_fuel_mix(mix)
        })
        .stage("persist", persist_stage_config(), move |mix: FuelMix| {
            let store = persist_store.clone();
            async move { stages::persist_fuel_mix(store, mix).await }
        })
        .on_error_with(ErrorKind::Validation, handler.clone())
        .on_error_with(ErrorKind::Store, handler)
        .build()
}

pub fn build_fuel_continuous_pipeline(
    store: Arc<Store>,
    config: &Config,
    shutdown: CancellationToken,
) -> Pipeline<FuelMix> {
    let client = http_client();
    let poll_interval = config.fuel_mix_poll_interval();
    let handler = event_logging_handler::<FuelMix>(store.clone());
    let persist_store = store.clone();

    Pipeline::builder("fuelmix-ingest")
        .channel_capacity(config.channel_capacity_continuous)
        .drain_timeout(config.drain_timeout_continuous())
        .shutdown_token(shutdown)
        .source(move |ctx| sources::fuel_mix_continuous_source(ctx, client, poll_interval))
        .stage("validate", StageConfig::default(), |mix: FuelMix| async move {
            stages::validate_fuel_mix(mix)
        })
        .stage("persist", persist_stage_config(), move |mix: FuelMix| {
            let store = persist_store.clone();
            async move { stages::persist_fuel_mix(store, mix).await }
        })
        .on_error_with(ErrorKind::Validation, handler.clone())
        .on_error_with(ErrorKind::Store, handler)
        .hooks(event_logging_hooks::<FuelMix>(store.clone()))
        .on_metrics(metrics_writer(store, "fuelmix-ingest"))
        .metrics_interval(config.metrics_interval())
        .build()
}

pub fn build_weather_seed_pipeline(
    store: Arc<Store>,
    config: &Config,
    start: NaiveDate,
    end: NaiveDate,
) -> Pipeline<WeatherSnapshot> {
    let client = http_client();
    let rate_limit = config.rate_limit_delay_weather();
    let handler = event_logging_handler::<WeatherSnapshot>(store.clone());
    let persist_store = store;

    Pipeline::builder("weather-seed")
        .channel_capacity(config.channel_capacity_seed)
        .drain_timeout(config.drain_timeout_seed())
        .source(move |ctx| sources::weather_date_source(ctx, client, start, end, rate_limit))
        .stage(
            "validate",
            StageConfig::default(),
            |snap: WeatherSnapshot| async move { stages::validate_weather(snap) },
        )
        .batch_stage(
            "persist",
            persist_stage_config().batch(
                WEATHER_BATCH_SIZE,
                std::time::Duration::from_secs(WEATHER_FLUSH_TIMEOUT_SECS),
            ),
            move |batch: Vec<WeatherSnapshot>| {
                let store = persist_store.clone();
                async move { stages::persist_weather_batch(store, batch).await }
            },
        )
        .on_error_with(ErrorKind::Validation, handler.clone())
        .on_error_with(ErrorKind::Store, handler)
        .build()
}

pub fn build_weather_continuous_pipeline(
    store: Arc<Store>,
    config: &Config,
    shutdown: CancellationToken,
) -> Pipeline<WeatherSnapshot> {
    let client = http_client();
    let poll_interval = config.weather_poll_interval();
    let handler = event_logging_handler::<WeatherSnapshot>(store.clone());
    let persist_store = store.clone();

    Pipeline::builder("weather-ingest")
        .channel_capacity(config.channel_capacity_continuous)
        .drain_timeout(config.drain_timeout_continuous())
        .shutdown_token(shutdown)
        .source(move |ctx| sources::weather_continuous_source(ctx, client, poll_interval))
        .stage(
            "validate",
            StageConfig::default(),
            |snap: WeatherSnapshot| async move { stages::validate_weather(snap) },
        )
        .batch_stage(
            "persist",
            persist_stage_config().batch(
                WEATHER_BATCH_SIZE,
                std::time::Duration::from_secs(WEATHER_FLUSH_TIMEOUT_SECS),
            ),
            move |batch: Vec<WeatherSnapshot>| {
                let store = persist_store.clone();
                async move { stages::persist_weather_batch(store, batch).await }
            },
        )
        .on_error_with(ErrorKind::Validation, handler.clone())
        .on_error_with(ErrorKind::Store, handler)
        .hooks(event_logging_hooks::<WeatherSnapshot>(store.clone()))
        .on_metrics(metrics_writer(store, "weather-ingest"))
        .metrics_interval(config.metrics_interval())
        .build()
}

// ── Runners ──

/// Backfill a date range. Runs the fuel-mix pipeline and, unless disabled,
/// the weather pipeline concurrently.
pub async fn run_seed(
    store: Arc<Store>,
    config: &Config,
    start: NaiveDate,
    end: NaiveDate,
    include_weather: bool,
    progress: Option<ProgressFn>,
) -> (
    PipelineResult<FuelMix>,
    Option<PipelineResult<WeatherSnapshot>>,
) {
    let fuel = build_fuel_seed_pipeline(store.clone(), config, start, end, progress);
    tracing::info!(topology = %fuel.topology(), "seed pipeline starting");

    if include_weather {
        let weather = build_weather_seed_pipeline(store, config, start, end);
        tracing::info!(topology = %weather.topology(), "weather seed pipeline starting");
        let (fuel_result, weather_result) = tokio::join!(fuel.run(), weather.run());
        tracing::info!("seed complete\n{}", fuel_result.summary());
        tracing::info!("weather seed complete\n{}", weather_result.summary());
        (fuel_result, Some(weather_result))
    } else {
        let fuel_result = fuel.run().await;
        tracing::info!("seed complete\n{}", fuel_result.summary());
        (fuel_result, None)
    }
}

/// Run continuous ingestion for both streams until `shutdown` fires.
pub async fn run_continuous(
    store: Arc<Store>,
    config: &Config,
    shutdown: CancellationToken,
) -> (
    PipelineResult<FuelMix>,
    PipelineResult<WeatherSnapshot>,
) {
    store
        .log_event("pipeline_start", None, Some("Continuous ingestion started"), None)
        .await;

    let fuel = build_fuel_continuous_pipeline(store.clone(), config, shutdown.clone());
    let weather = build_weather_continuous_pipeline(store.clone(), config, shutdown);
    tracing::info!(topology = %fuel.topology(), "continuous pipeline starting");
    tracing::info!(topology = %weather.topology(), "continuous pipeline starting");

    let (fuel_result, weather_result) = tokio::join!(fuel.run(), weather.run());

    store
        .log_event(
            "pipeline_stop",
            None,
            Some(&format!(
                "Ingestion stopped after {:.1}s",
                fuel_result.duration_seconds
            )),
            None,
        )
        .await;
    tracing::info!("ingestion stopped\n{}", fuel_result.summary());
    tracing::info!("ingestion stopped\n{}", weather_result.summary());

    (fuel_result, weather_result)
}
