//! Postgres storage façade.
//!
//! One relational store with upsert semantics throughout: replaying the
//! same fuel mix or weather snapshot is a no-op. The async surface here is
//! used by the pipelines, forecaster, and REST layer; [`blocking`] wraps
//! the same operations for synchronous CLI paths.
//!
//! Schema lives in `migrations/` and is applied by an external runner.

pub mod blocking;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use std::collections::BTreeMap;

use crate::domain::{FuelMix, WeatherSnapshot};
use crate::error::GridError;
use crate::pipeline::StageMetricsSnapshot;

/// Pool bounds: a handful of concurrent readers plus one writer per
/// pipeline instance.
const POOL_MIN_CONNECTIONS: u32 = 2;
const POOL_MAX_CONNECTIONS: u32 = 10;

/// The ingestion feed is considered live while the newest intensity row is
/// younger than this.
const ACTIVE_WINDOW_SECONDS: i64 = 600;

fn store_err(err: sqlx::Error) -> GridError {
    GridError::Store(err.to_string())
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct IntensityRow {
    pub timestamp: DateTime<Utc>,
    pub grams_co2_per_kwh: f64,
    pub total_generation_mw: f64,
    pub clean_percentage: f64,
    #[serde(rename = "fuel_breakdown")]
    pub fuel_breakdown_json: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct IngestionEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub stage_name: Option<String>,
    pub message: Option<String>,
    #[serde(rename = "details")]
    pub details_json: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestionStatus {
    pub is_active: bool,
    pub last_data_at: Option<DateTime<Utc>>,
    pub records_last_hour: i64,
    pub errors_last_hour: i64,
    pub total_records: i64,
    pub earliest: Option<DateTime<Utc>>,
    pub latest: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WeatherFreshness {
    pub status: &'static str,
    pub last_data_at: Option<DateTime<Utc>>,
    pub records_last_hour: i64,
    pub provider: &'static str,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PipelineMetricsRow {
    pub timestamp: DateTime<Utc>,
    pub stage_name: String,
    pub items_in: i64,
    pub items_out: i64,
    pub items_errored: i64,
    pub items_retried: i64,
    pub error_rate: Option<f64>,
    pub throughput_per_sec: Option<f64>,
    pub latency_p50: Option<f64>,
    pub latency_p95: Option<f64>,
    pub latency_p99: Option<f64>,
    pub queue_depth: Option<i64>,
    pub queue_utilization: Option<f64>,
}

#[derive(Clone)]
pub struct Store {
    pool: PgPool,
    dsn: String,
}

impl Store {
    pub async fn connect(dsn: &str) -> Result<Self, GridError> {
        let pool = PgPoolOptions::new()
            .min_connections(POOL_MIN_CONNECTIONS)
            .max_connections(POOL_MAX_CONNECTIONS)
            .connect(dsn)
            .await
            .map_err(store_err)?;
        Ok(Self {
            pool,
            dsn: dsn.to_string(),
        })
    }

    pub fn from_pool(pool: PgPool, dsn: impl Into<String>) -> Self {
        Self {
            pool,
            dsn: dsn.into(),
        }
    }

    pub fn dsn(&self) -> &str {
        &self.dsn
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ── Writes ──

    /// Upsert all fuel rows of a snapshot plus its derived intensity row in
    /// one transaction, keyed on `(timestamp, fuel_category)` and
    /// `timestamp`. Replaying the same mix leaves the store unchanged.
    pub async fn save_fuel_mix(&self, mix: &FuelMix) -> Result<(), GridError> {
        let ci = mix.carbon_intensity()?;
        let mut tx = self.pool.begin().await.map_err(store_err)?;

        for fuel in mix.fuels() {
            sqlx::query(
                r#"
                INSERT INTO fuel_mix (timestamp, fuel_category, generation_mw)
                VALUES ($1, $2, $3)
                ON CONFLICT (timestamp, fuel_category)
                DO UPDATE SET generation_mw = EXCLUDED.generation_mw
                "#,
            )
            .bind(mix.timestamp)
            .bind(fuel.fuel.as_label())
            .bind(fuel.generation_mw)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        }

        sqlx::query(
            r#"
            INSERT INTO carbon_intensity
                (timestamp, grams_co2_per_kwh, total_generation_mw,
                 clean_percentage, fuel_breakdown_json)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (timestamp)
            DO UPDATE SET grams_co2_per_kwh = EXCLUDED.grams_co2_per_kwh,
                          total_generation_mw = EXCLUDED.total_generation_mw,
                          clean_percentage = EXCLUDED.clean_percentage,
                          fuel_breakdown_json = EXCLUDED.fuel_breakdown_json
            "#,
        )
        .bind(mix.timestamp)
        .bind(ci.grams_co2_per_kwh)
        .bind(mix.total_generation_mw())
        .bind(mix.clean_percentage())
        .bind(mix.breakdown_json())
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;

        tx.commit().await.map_err(store_err)
    }

    /// Bulk save; skips snapshots that fail and returns the count saved.
    pub async fn save_fuel_mixes(&self, mixes: &[FuelMix]) -> usize {
        let mut count = 0;
        for mix in mixes {
            match self.save_fuel_mix(mix).await {
                Ok(()) => count += 1,
                Err(err) => tracing::warn!(error = %err, "skipping fuel mix save"),
            }
        }
        count
    }

    pub async fn save_weather(
        &self,
        timestamp: DateTime<Utc>,
        temperature_f: f64,
        wind_speed_80m_mph: f64,
        cloud_cover_pct: f64,
    ) -> Result<(), GridError> {
        sqlx::query(
            r#"
            INSERT INTO weather
                (timestamp, temperature_f, wind_speed_80m_mph, cloud_cover_pct)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (timestamp)
            DO UPDATE SET temperature_f = EXCLUDED.temperature_f,
                          wind_speed_80m_mph = EXCLUDED.wind_speed_80m_mph,
                          cloud_cover_pct = EXCLUDED.cloud_cover_pct
            "#,
        )
        .bind(timestamp)
        .bind(temperature_f)
        .bind(wind_speed_80m_mph)
        .bind(cloud_cover_pct)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    /// Upsert a whole batch of weather rows inside one transaction.
    pub async fn save_weather_batch(&self, rows: &[WeatherSnapshot]) -> Result<(), GridError> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO weather (timestamp, temperature_f, wind_speed_80m_mph, cloud_cover_pct) ",
        );
        builder.push_values(rows.iter(), |mut b, snap| {
            b.push_bind(snap.timestamp)
                .push_bind(snap.temperature_f)
                .push_bind(snap.wind_speed_80m_mph)
                .push_bind(snap.cloud_cover_pct);
        });
        builder.push(
            " ON CONFLICT (timestamp) DO UPDATE SET \
             temperature_f = EXCLUDED.temperature_f, \
             wind_speed_80m_mph = EXCLUDED.wind_speed_80m_mph, \
             cloud_cover_pct = EXCLUDED.cloud_cover_pct",
        );

        builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    // ── Reads ──

    /// Intensity records newer than `hours` ago, ascending.
    pub async fn get_carbon_intensity(&self, hours: i32) -> Result<Vec<IntensityRow>, GridError> {
        sqlx::query_as(
            r#"
            SELECT timestamp, grams_co2_per_kwh, total_generation_mw,
                   clean_percentage, fuel_breakdown_json
            FROM carbon_intensity
            WHERE timestamp > NOW() - make_interval(hours => $1)
            ORDER BY timestamp ASC
            "#,
        )
        .bind(hours)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)
    }

    pub async fn get_latest_intensity(&self) -> Result<Option<IntensityRow>, GridError> {
        sqlx::query_as(
            r#"
            SELECT timestamp, grams_co2_per_kwh, total_generation_mw,
                   clean_percentage, fuel_breakdown_json
            FROM carbon_intensity
            ORDER BY timestamp DESC LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)
    }

    /// Average intensity by hour of day, optionally narrowed to a month
    /// and/or a day of week (`0 = Monday`; translated here to Postgres's
    /// `0 = Sunday` DOW encoding). Hours with no data are absent.
    pub async fn get_hourly_averages(
        &self,
        month: Option<u32>,
        day_of_week: Option<u32>,
    ) -> Result<BTreeMap<u32, f64>, GridError> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "SELECT EXTRACT(HOUR FROM timestamp)::int AS hour, \
             AVG(grams_co2_per_kwh) AS avg_ci FROM carbon_intensity",
        );
        let mut has_where = false;
        if let Some(month) = month {
            builder.push(" WHERE EXTRACT(MONTH FROM timestamp) = ");
            builder.push_bind(month as i32);
            has_where = true;
        }
        if let Some(dow) = day_of_week {
            builder.push(if has_where { " AND " } else { " WHERE " });
            builder.push("EXTRACT(DOW FROM timestamp) = ");
            builder.push_bind(((dow + 1) % 7) as i32);
        }
        builder.push(" GROUP BY hour ORDER BY hour");

        let rows: Vec<(i32, f64)> = builder
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(rows.into_iter().map(|(h, avg)| (h as u32, avg)).collect())
    }

    pub async fn get_intensity_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<IntensityRow>, GridError> {
        if end < start {
            return Err(GridError::InvalidDateRange(format!(
                "{end} precedes {start}"
            )));
        }
        sqlx::query_as(
            r#"
            SELECT timestamp, grams_co2_per_kwh, total_generation_mw,
                   clean_percentage, fuel_breakdown_json
            FROM carbon_intensity
            WHERE timestamp >= $1::date AND timestamp < $2::date
            ORDER BY timestamp ASC
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)
    }

    /// Total intensity records stored.
    pub async fn record_count(&self) -> Result<i64, GridError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM carbon_intensity")
            .fetch_one(&self.pool)
            .await
            .map_err(store_err)?;
        row.try_get("cnt").map_err(store_err)
    }

    /// Earliest and latest intensity timestamps, or None on an empty store.
    pub async fn date_range(
        &self,
    ) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>, GridError> {
        let row = sqlx::query(
            "SELECT MIN(timestamp) AS earliest, MAX(timestamp) AS latest FROM carbon_intensity",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(store_err)?;
        let earliest: Option<DateTime<Utc>> = row.try_get("earliest").map_err(store_err)?;
        let latest: Option<DateTime<Utc>> = row.try_get("latest").map_err(store_err)?;
        Ok(earliest.zip(latest))
    }

    // ── Ingestion events ──

    /// Best-effort append to the ingestion event log. Failures are logged
    /// and swallowed so an event-log outage can never take down ingestion.
    pub async fn log_event(
        &self,
        event_type: &str,
        stage_name: Option<&str>,
        message: Option<&str>,
        details: Option<serde_json::Value>,
    ) {
        let result = sqlx::query(
            r#"
            INSERT INTO ingestion_events (event_type, stage_name, message, details_json)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(event_type)
        .bind(stage_name)
        .bind(message)
        .bind(details)
        .execute(&self.pool)
        .await;

        if let Err(err) = result {
            tracing::warn!(error = %err, event_type, "failed to log ingestion event");
        }
    }

    pub async fn get_recent_events(
        &self,
        limit: i64,
        event_type: Option<&str>,
    ) -> Result<Vec<IngestionEvent>, GridError> {
        let rows = if let Some(event_type) = event_type {
            sqlx::query_as(
                r#"
                SELECT timestamp, event_type, stage_name, message, details_json
                FROM ingestion_events
                WHERE event_type = $1
                ORDER BY timestamp DESC LIMIT $2
                "#,
            )
            .bind(event_type)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query_as(
                r#"
                SELECT timestamp, event_type, stage_name, message, details_json
                FROM ingestion_events
                ORDER BY timestamp DESC LIMIT $1
                "#,
            )
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        };
        rows.map_err(store_err)
    }

    /// Derived ingestion status for the admin surface. `is_active` means
    /// the newest intensity row is within the last 10 minutes.
    pub async fn get_ingestion_status(&self) -> Result<IngestionStatus, GridError> {
        let total_records = self.record_count().await?;
        let range = self.date_range().await?;

        let stats = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM carbon_intensity
                 WHERE timestamp > NOW() - INTERVAL '1 hour') AS records_last_hour,
                (SELECT COUNT(*) FROM ingestion_events
                 WHERE event_type IN ('validate_failure', 'persist_failure')
                   AND timestamp > NOW() - INTERVAL '1 hour') AS errors_last_hour
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(store_err)?;

        let latest = range.map(|(_, latest)| latest);
        let is_active = latest
            .map(|ts| (Utc::now() - ts).num_seconds() < ACTIVE_WINDOW_SECONDS)
            .unwrap_or(false);

        Ok(IngestionStatus {
            is_active,
            last_data_at: latest,
            records_last_hour: stats.try_get("records_last_hour").map_err(store_err)?,
            errors_last_hour: stats.try_get("errors_last_hour").map_err(store_err)?,
            total_records,
            earliest: range.map(|(earliest, _)| earliest),
            latest,
        })
    }

    /// Weather table freshness. Weather updates hourly, so the feed counts
    /// as active for two hours.
    pub async fn get_weather_freshness(&self) -> Result<WeatherFreshness, GridError> {
        let row = sqlx::query(
            r#"
            SELECT
                MAX(timestamp) AS latest,
                (SELECT COUNT(*) FROM weather
                 WHERE timestamp > NOW() - INTERVAL '1 hour') AS records_last_hour
            FROM weather
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(store_err)?;

        let latest: Option<DateTime<Utc>> = row.try_get("latest").map_err(store_err)?;
        let records_last_hour: i64 = row.try_get("records_last_hour").map_err(store_err)?;

        let status = match latest {
            Some(ts) => {
                let age = (Utc::now() - ts).num_seconds();
                if age < 7200 {
                    "active"
                } else if age < 86400 {
                    "stale"
                } else {
                    "inactive"
                }
            }
            None => "inactive",
        };

        Ok(WeatherFreshness {
            status,
            last_data_at: latest,
            records_last_hour,
            provider: "Open-Meteo",
        })
    }

    // ── Pipeline metrics ──

    /// Bulk-insert one observer batch of stage snapshots. Best-effort like
    /// the event log.
    pub async fn save_pipeline_metrics(
        &self,
        pipeline_name: &str,
        snapshots: &[StageMetricsSnapshot],
    ) {
        if snapshots.is_empty() {
            return;
        }

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO pipeline_metrics \
             (pipeline_name, stage_name, items_in, items_out, items_errored, \
              items_retried, error_rate, throughput_per_sec, latency_p50, \
              latency_p95, latency_p99, queue_depth, queue_utilization) ",
        );
        builder.push_values(snapshots.iter(), |mut b, snap| {
            b.push_bind(pipeline_name)
                .push_bind(&snap.stage)
                .push_bind(snap.items_in as i64)
                .push_bind(snap.items_out as i64)
                .push_bind(snap.items_errored as i64)
                .push_bind(snap.items_retried as i64)
                .push_bind(snap.error_rate)
                .push_bind(snap.throughput_per_sec)
                .push_bind(snap.latency_p50)
                .push_bind(snap.latency_p95)
                .push_bind(snap.latency_p99)
                .push_bind(snap.queue_depth.map(|d| d as i64))
                .push_bind(snap.queue_utilization);
        });

        if let Err(err) = builder.build().execute(&self.pool).await {
            tracing::warn!(error = %err, pipeline_name, "failed to save pipeline metrics");
        }
    }

    pub async fn get_pipeline_metrics(
        &self,
        pipeline_name: &str,
        hours: i32,
    ) -> Result<Vec<PipelineMetricsRow>, GridError> {
        sqlx::query_as(
            r#"
            SELECT timestamp, stage_name, items_in, items_out,
                   items_errored, items_retried, error_rate,
                   throughput_per_sec, latency_p50, latency_p95,
                   latency_p99, queue_depth, queue_utilization
            FROM pipeline_metrics
            WHERE pipeline_name = $1
              AND timestamp > NOW() - make_interval(hours => $2)
            ORDER BY timestamp DESC
            "#,
        )
        .bind(pipeline_name)
        .bind(hours)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("dsn", &crate::config::redact_dsn(&self.dsn))
            .finish()
    }
}

/// Standard `details_json` payload for stage failure events.
pub fn failure_details(error: &str, attempts: u32) -> serde_json::Value {
    json!({ "error": error, "attempts": attempts })
}
