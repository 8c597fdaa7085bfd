use chrono::NaiveDate;
use std::sync::Arc;
use std::time::Duration;

use crate::domain::{FuelMix, WeatherSnapshot};
use crate::pipeline::SourceCtx;
use crate::sources::{nyiso, weather};

/// Invoked with `(day, record_count)` after each successful daily fetch.
pub type ProgressFn = Arc<dyn Fn(NaiveDate, usize) + Send + Sync>;

/// Seed source: walk a date range one calendar day at a time, yielding
/// each fuel mix individually so backpressure applies per item. A failed
/// day is logged and skipped; the walk continues.
pub async fn fuel_mix_date_source(
    ctx: SourceCtx<FuelMix>,
    client: reqwest::Client,
    start: NaiveDate,
    end: NaiveDate,
    rate_limit_delay: Duration,
    progress: Option<ProgressFn>,
) {
    let mut current = start;
    let mut days_fetched = 0u32;
    while current <= end {
        if ctx.is_shutdown() {
            break;
        }
        match nyiso::fetch_fuel_mix(&client, current).await {
            Ok(mixes) => {
                days_fetched += 1;
                if let Some(progress) = &progress {
                    progress(current, mixes.len());
                }
                let count = mixes.len();
                for mix in mixes {
                    if !ctx.send(mix).await {
                        return;
                    }
                }
                tracing::debug!(day = %current, records = count, "fuel mix source yielded a day");
            }
            Err(err) => {
                tracing::warn!(day = %current, error = %err, "fuel mix source skipping day");
            }
        }
        // Be polite to the upstream between daily fetches.
        if !ctx.sleep(rate_limit_delay).await {
            return;
        }
        match current.succ_opt() {
            Some(next) => current = next,
            None => break,
        }
    }
    tracing::info!(days_fetched, "fuel mix source exhausted");
}

/// Continuous source: poll for the latest fuel mix snapshot forever. Fetch
/// failures are logged and the loop continues; only pipeline shutdown
/// terminates it.
pub async fn fuel_mix_continuous_source(
    ctx: SourceCtx<FuelMix>,
    client: reqwest::Client,
    poll_interval: Duration,
) {
    tracing::info!(
        poll_secs = poll_interval.as_secs(),
        "continuous fuel mix source starting"
    );
    loop {
        match nyiso::fetch_latest(&client).await {
            Ok(Some(latest)) => {
                let ts = latest.timestamp;
                if !ctx.send(latest).await {
                    return;
                }
                tracing::debug!(timestamp = %ts, "polled latest fuel mix");
            }
            Ok(None) => tracing::warn!("fuel mix poll returned no data"),
            Err(err) => tracing::warn!(error = %err, "fuel mix poll failed"),
        }
        if !ctx.sleep(poll_interval).await {
            return;
        }
    }
}

/// Seed source for weather: one archive day per request, yielding hourly
/// snapshots individually.
pub async fn weather_date_source(
    ctx: SourceCtx<WeatherSnapshot>,
    client: reqwest::Client,
    start: NaiveDate,
    end: NaiveDate,
    rate_limit_delay: Duration,
) {
    let mut current = start;
    while current <= end {
        if ctx.is_shutdown() {
            break;
        }
        match weather::fetch_historical(&client, current, current).await {
            Ok(snapshots) => {
                for snap in snapshots {
                    if !ctx.send(snap).await {
                        return;
                    }
                }
            }
            Err(err) => {
                tracing::warn!(day = %current, error = %err, "weather source skipping day");
            }
        }
        if !ctx.sleep(rate_limit_delay).await {
            return;
        }
        match current.succ_opt() {
            Some(next) => current = next,
            None => break,
        }
    }
    tracing::info!("weather source exhausted");
}

/// Continuous source for weather: poll the short-range forecast hourly and
/// yield each hourly snapshot individually.
pub async fn weather_continuous_source(
    ctx: SourceCtx<WeatherSnapshot>,
    client: reqwest::Client,
    poll_interval: Duration,
) {
    tracing::info!(
        poll_secs = poll_interval.as_secs(),
        "continuous weather source starting"
    );
    loop {
        match weather::fetch_forecast(&client, 2).await {
            Ok(snapshots) => {
                for snap in snapshots {
                    if !ctx.send(snap).await {
                        return;
                    }
                }
            }
            Err(err) => tracing::warn!(error = %err, "weather poll failed"),
        }
        if !ctx.sleep(poll_interval).await {
            return;
        }
    }
}
