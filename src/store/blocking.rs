//! Blocking façade over [`Store`](super::Store) for synchronous callers.
//!
//! Owns a private current-thread runtime, so it must only be used from
//! plain synchronous code (CLI command paths), never from inside an async
//! context.

use chrono::{DateTime, NaiveDate, Utc};
use std::collections::BTreeMap;

use crate::domain::{FuelMix, WeatherSnapshot};
use crate::error::GridError;
use crate::pipeline::StageMetricsSnapshot;
use crate::store::{
    IngestionEvent, IngestionStatus, IntensityRow, PipelineMetricsRow, Store, WeatherFreshness,
};

pub struct BlockingStore {
    inner: Store,
    runtime: tokio::runtime::Runtime,
}

impl BlockingStore {
    pub fn connect(dsn: &str) -> Result<Self, GridError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| GridError::Store(format!("failed to start runtime: {err}")))?;
        let inner = runtime.block_on(Store::connect(dsn))?;
        Ok(Self { inner, runtime })
    }

    pub fn dsn(&self) -> &str {
        self.inner.dsn()
    }

    pub fn save_fuel_mix(&self, mix: &FuelMix) -> Result<(), GridError> {
        self.runtime.block_on(self.inner.save_fuel_mix(mix))
    }

    pub fn save_fuel_mixes(&self, mixes: &[FuelMix]) -> usize {
        self.runtime.block_on(self.inner.save_fuel_mixes(mixes))
    }

    pub fn save_weather(
        &self,
        timestamp: DateTime<Utc>,
        temperature_f: f64,
        wind_speed_80m_mph: f64,
        cloud_cover_pct: f64,
    ) -> Result<(), GridError> {
        self.runtime.block_on(self.inner.save_weather(
            timestamp,
            temperature_f,
            wind_speed_80m_mph,
            cloud_cover_pct,
        ))
    }

    pub fn save_weather_batch(&self, rows: &[WeatherSnapshot]) -> Result<(), GridError> {
        self.runtime.block_on(self.inner.save_weather_batch(rows))
    }

    pub fn get_carbon_intensity(&self, hours: i32) -> Result<Vec<IntensityRow>, GridError> {
        self.runtime.block_on(self.inner.get_carbon_intensity(hours))
    }

    pub fn get_intensity_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<IntensityRow>, GridError> {
        self.runtime
            .block_on(self.inner.get_intensity_range(start, end))
    }

    pub fn get_latest_intensity(&self) -> Result<Option<IntensityRow>, GridError> {
        self.runtime.block_on(self.inner.get_latest_intensity())
    }

    pub fn get_hourly_averages(
        &self,
        month: Option<u32>,
        day_of_week: Option<u32>,
    ) -> Result<BTreeMap<u32, f64>, GridError> {
        self.runtime
            .block_on(self.inner.get_hourly_averages(month, day_of_week))
    }

    pub fn record_count(&self) -> Result<i64, GridError> {
        self.runtime.block_on(self.inner.record_count())
    }

    pub fn date_range(&self) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>, GridError> {
        self.runtime.block_on(self.inner.date_range())
    }

    pub fn log_event(
        &self,
        event_type: &str,
        stage_name: Option<&str>,
        message: Option<&str>,
        details: Option<serde_json::Value>,
    ) {
        self.runtime
            .block_on(self.inner.log_event(event_type, stage_name, message, details))
    }

    pub fn get_recent_events(
        &self,
        limit: i64,
        event_type: Option<&str>,
    ) -> Result<Vec<IngestionEvent>, GridError> {
        self.runtime
            .block_on(self.inner.get_recent_events(limit, event_type))
    }

    pub fn get_ingestion_status(&self) -> Result<IngestionStatus, GridError> {
        self.runtime.block_on(self.inner.get_ingestion_status())
    }

    pub fn get_weather_freshness(&self) -> Result<WeatherFreshness, GridError> {
        self.runtime.block_on(self.inner.get_weather_freshness())
    }

    pub fn save_pipeline_metrics(&self, pipeline_name: &str, snapshots: &[StageMetricsSnapshot]) {
        self.runtime
            .block_on(self.inner.save_pipeline_metrics(pipeline_name, snapshots))
    }

    pub fn get_pipeline_metrics(
        &self,
        pipeline_name: &str,
        hours: i32,
    ) -> Result<Vec<PipelineMetricsRow>, GridError> {
        self.runtime
            .block_on(self.inner.get_pipeline_metrics(pipeline_name, hours))
    }
}
