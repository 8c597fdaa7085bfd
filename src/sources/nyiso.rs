//! NYISO real-time fuel mix adapter.
//!
//! Daily CSV files live at predictable URLs:
//!
//!   http://mis.nyiso.com/public/csv/rtfuelmix/{YYYYMMDD}rtfuelmix.csv
//!
//! Columns: `Time Stamp, Time Zone, Fuel Category, Gen MW`. One row per
//! (timestamp, fuel category); rows sharing a timestamp form one fuel mix
//! snapshot. Updated every 5 minutes, history back to ~2013.

use chrono::{NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::America::New_York;
use serde::Deserialize;
use std::collections::BTreeMap;

use crate::domain::{FuelCategory, FuelGeneration, FuelMix};
use crate::error::GridError;

const BASE_URL: &str = "http://mis.nyiso.com/public/csv/rtfuelmix";
const TIMESTAMP_FORMAT: &str = "%m/%d/%Y %H:%M:%S";

fn build_url(day: NaiveDate) -> String {
    format!("{BASE_URL}/{}rtfuelmix.csv", day.format("%Y%m%d"))
}

#[derive(Debug, Deserialize)]
struct FuelMixRow {
    #[serde(rename = "Time Stamp")]
    time_stamp: String,
    #[serde(rename = "Fuel Category")]
    fuel_category: String,
    #[serde(rename = "Gen MW")]
    gen_mw: String,
}

/// Parse fuel mix CSV text into snapshots, grouped by timestamp.
/// Malformed rows and unknown fuel labels are skipped with a debug log;
/// a snapshot is only as complete as its parseable rows.
pub fn parse_fuel_mix_csv(text: &str) -> Vec<FuelMix> {
    let mut reader = csv::Reader::from_reader(text.as_bytes());
    let mut by_timestamp: BTreeMap<String, Vec<FuelGeneration>> = BTreeMap::new();

    for record in reader.deserialize::<FuelMixRow>() {
        let row = match record {
            Ok(row) => row,
            Err(err) => {
                tracing::debug!(error = %err, "skipping malformed fuel mix row");
                continue;
            }
        };
        if row.time_stamp.trim().is_empty() || row.fuel_category.trim().is_empty() {
            continue;
        }
        let fuel = match FuelCategory::parse_label(&row.fuel_category) {
            Ok(fuel) => fuel,
            Err(err) => {
                tracing::debug!(error = %err, "skipping fuel mix row");
                continue;
            }
        };
        let generation_mw = match row.gen_mw.trim().parse::<f64>() {
            Ok(mw) => mw,
            Err(err) => {
                tracing::debug!(error = %err, raw = %row.gen_mw, "skipping fuel mix row");
                continue;
            }
        };
        by_timestamp
            .entry(row.time_stamp.trim().to_string())
            .or_default()
            .push(FuelGeneration {
                fuel,
                generation_mw,
            });
    }

    let mut mixes = Vec::with_capacity(by_timestamp.len());
    for (ts_str, fuels) in by_timestamp {
        let Ok(naive) = NaiveDateTime::parse_from_str(&ts_str, TIMESTAMP_FORMAT) else {
            tracing::debug!(raw = %ts_str, "could not parse fuel mix timestamp");
            continue;
        };
        // NYISO stamps are regional wall-clock time; earliest() picks the
        // first occurrence across the fall-back DST repeat.
        let Some(local) = New_York.from_local_datetime(&naive).earliest() else {
            tracing::debug!(raw = %ts_str, "fuel mix timestamp is not a valid local time");
            continue;
        };
        mixes.push(FuelMix::new(local.with_timezone(&Utc), fuels));
    }
    mixes
}

/// Fetch all fuel mix snapshots for one day (up to 288 at 5-minute
/// intervals).
pub async fn fetch_fuel_mix(
    client: &reqwest::Client,
    day: NaiveDate,
) -> Result<Vec<FuelMix>, GridError> {
    let url = build_url(day);
    tracing::debug!(day = %day, "fetching NYISO fuel mix");

    let response = client
        .get(&url)
        .timeout(std::time::Duration::from_secs(30))
        .send()
        .await
        .map_err(|err| GridError::NyisoFetch(format!("request for {url} failed: {err}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(GridError::NyisoFetch(format!(
            "NYISO returned {status} for {url}"
        )));
    }

    let text = response
        .text()
        .await
        .map_err(|err| GridError::NyisoFetch(format!("failed to read {url}: {err}")))?;
    Ok(parse_fuel_mix_csv(&text))
}

/// Fetch the most recent snapshot. Tries today first, then yesterday, in
/// case today's file is not posted yet just after midnight.
pub async fn fetch_latest(client: &reqwest::Client) -> Result<Option<FuelMix>, GridError> {
    let today = Utc::now().with_timezone(&New_York).date_naive();
    for day in [today, today - chrono::Duration::days(1)] {
        match fetch_fuel_mix(client, day).await {
            Ok(mixes) => {
                if let Some(latest) = mixes.into_iter().last() {
                    return Ok(Some(latest));
                }
            }
            Err(err) => {
                tracing::debug!(day = %day, error = %err, "latest fuel mix fetch fell through");
            }
        }
    }
    Ok(None)
}
