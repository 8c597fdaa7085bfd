//! Open-Meteo weather adapter for NYC. No API key required.
//!
//! Hourly variables: `temperature_2m` (C), `wind_speed_80m` (km/h, hub
//! height), `cloud_cover` (%). Converted at this boundary to F and mph,
//! the units the rest of the system works in.

use chrono::{NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::America::New_York;
use serde::Deserialize;

use crate::domain::WeatherSnapshot;
use crate::error::GridError;

pub const NYC_LAT: f64 = 40.71;
pub const NYC_LON: f64 = -74.01;

const FORECAST_URL: &str = "https://api.open-meteo.com/v1/forecast";
const HISTORICAL_URL: &str = "https://archive-api.open-meteo.com/v1/archive";

const KMH_TO_MPH: f64 = 0.621371;

#[derive(Debug, Deserialize)]
struct OpenMeteoResponse {
    hourly: Option<OpenMeteoHourly>,
}

#[derive(Debug, Deserialize)]
struct OpenMeteoHourly {
    time: Vec<String>,
    #[serde(default)]
    temperature_2m: Vec<Option<f64>>,
    #[serde(default)]
    wind_speed_80m: Vec<Option<f64>>,
    #[serde(default)]
    cloud_cover: Vec<Option<f64>>,
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn parse_hourly(payload: OpenMeteoResponse) -> Vec<WeatherSnapshot> {
    let Some(hourly) = payload.hourly else {
        return Vec::new();
    };

    let mut snapshots = Vec::with_capacity(hourly.time.len());
    for (i, raw_ts) in hourly.time.iter().enumerate() {
        // Times arrive as local wall-clock "2024-01-15T00:00".
        let Ok(naive) = NaiveDateTime::parse_from_str(raw_ts.trim(), "%Y-%m-%dT%H:%M") else {
            tracing::debug!(raw = %raw_ts, "skipping weather point with bad timestamp");
            continue;
        };
        let Some(local) = New_York.from_local_datetime(&naive).earliest() else {
            continue;
        };

        let temp_c = hourly.temperature_2m.get(i).copied().flatten().unwrap_or(0.0);
        let wind_kmh = hourly.wind_speed_80m.get(i).copied().flatten().unwrap_or(0.0);
        let cloud = hourly.cloud_cover.get(i).copied().flatten().unwrap_or(0.0);

        snapshots.push(WeatherSnapshot {
            timestamp: local.with_timezone(&Utc),
            temperature_f: round1(temp_c * 9.0 / 5.0 + 32.0),
            wind_speed_80m_mph: round1(wind_kmh * KMH_TO_MPH),
            cloud_cover_pct: round1(cloud),
        });
    }
    snapshots
}

async fn fetch(
    client: &reqwest::Client,
    url: &str,
    params: &[(&str, String)],
    timeout: std::time::Duration,
) -> Result<Vec<WeatherSnapshot>, GridError> {
    let response = client
        .get(url)
        .query(params)
        .timeout(timeout)
        .send()
        .await
        .map_err(|err| GridError::WeatherFetch(format!("request failed: {err}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(GridError::WeatherFetch(format!("Open-Meteo HTTP {status}")));
    }

    let payload: OpenMeteoResponse = response
        .json()
        .await
        .map_err(|err| GridError::WeatherFetch(format!("decode failed: {err}")))?;
    Ok(parse_hourly(payload))
}

/// Fetch the hourly weather forecast for the next `days` days.
pub async fn fetch_forecast(
    client: &reqwest::Client,
    days: u32,
) -> Result<Vec<WeatherSnapshot>, GridError> {
    let params = [
        ("latitude", NYC_LAT.to_string()),
        ("longitude", NYC_LON.to_string()),
        (
            "hourly",
            "temperature_2m,wind_speed_80m,cloud_cover".to_string(),
        ),
        ("forecast_days", days.to_string()),
        ("timezone", "America/New_York".to_string()),
    ];
    fetch(client, FORECAST_URL, &params, std::time::Duration::from_secs(15)).await
}

/// Fetch archived hourly observations for a date range (inclusive).
pub async fn fetch_historical(
    client: &reqwest::Client,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Vec<WeatherSnapshot>, GridError> {
    let params = [
        ("latitude", NYC_LAT.to_string()),
        ("longitude", NYC_LON.to_string()),
        ("start_date", start.format("%Y-%m-%d").to_string()),
        ("end_date", end.format("%Y-%m-%d").to_string()),
        (
            "hourly",
            "temperature_2m,wind_speed_80m,cloud_cover".to_string(),
        ),
        ("timezone", "America/New_York".to_string()),
    ];
    fetch(client, HISTORICAL_URL, &params, std::time::Duration::from_secs(30)).await
}
