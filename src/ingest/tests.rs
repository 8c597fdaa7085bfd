use super::stages::{validate_fuel_mix, validate_weather};
use super::*;
use crate::domain::{FuelCategory, FuelGeneration, FuelMix, WeatherSnapshot};
use crate::pipeline::{Pipeline, SourceCtx, StageConfig};
use anyhow::Result;
use chrono::{Duration, TimeZone, Utc};
use sqlx::postgres::PgPoolOptions;
use std::env;
use std::sync::Mutex;

fn make_mix(offset_minutes: i64, gas_mw: f64) -> FuelMix {
    let ts = Utc.with_ymd_and_hms(2024, 6, 15, 16, 0, 0).unwrap()
        + Duration::minutes(offset_minutes);
    FuelMix::new(
        ts,
        vec![
            FuelGeneration {
                fuel: FuelCategory::NaturalGas,
                generation_mw: gas_mw,
            },
            FuelGeneration {
                fuel: FuelCategory::Nuclear,
                generation_mw: 3000.0,
            },
            FuelGeneration {
                fuel: FuelCategory::Hydro,
                generation_mw: 2000.0,
            },
            FuelGeneration {
                fuel: FuelCategory::Wind,
                generation_mw: 500.0,
            },
        ],
    )
}

fn make_bad_mix(offset_minutes: i64) -> FuelMix {
    let ts = Utc.with_ymd_and_hms(2024, 6, 15, 16, 0, 0).unwrap()
        + Duration::minutes(offset_minutes);
    FuelMix::new(
        ts,
        vec![
            FuelGeneration {
                fuel: FuelCategory::NaturalGas,
                generation_mw: 0.0,
            },
            FuelGeneration {
                fuel: FuelCategory::Nuclear,
                generation_mw: 0.0,
            },
            FuelGeneration {
                fuel: FuelCategory::Hydro,
                generation_mw: 0.0,
            },
        ],
    )
}

fn make_weather(offset_hours: i64) -> WeatherSnapshot {
    WeatherSnapshot {
        timestamp: Utc.with_ymd_and_hms(2024, 6, 15, 0, 0, 0).unwrap()
            + Duration::hours(offset_hours),
        temperature_f: 72.0,
        wind_speed_80m_mph: 12.0,
        cloud_cover_pct: 40.0,
    }
}

// ── Stage unit tests ──

#[test]
fn valid_mix_passes_validation_unchanged() {
    let mix = make_mix(0, 5000.0);
    let ts = mix.timestamp;
    let validated = validate_fuel_mix(mix).unwrap();
    assert_eq!(validated.timestamp, ts);
    assert_eq!(validated.fuels().len(), 4);
}

#[test]
fn zero_generation_fails_validation() {
    let err = validate_fuel_mix(make_bad_mix(0)).unwrap_err();
    assert!(err.to_string().contains("Zero/negative"));
}

#[test]
fn too_few_fuels_fails_validation() {
    let ts = Utc.with_ymd_and_hms(2024, 6, 15, 16, 0, 0).unwrap();
    let sparse = FuelMix::new(
        ts,
        vec![
            FuelGeneration {
                fuel: FuelCategory::NaturalGas,
                generation_mw: 5000.0,
            },
            FuelGeneration {
                fuel: FuelCategory::Nuclear,
                generation_mw: 3000.0,
            },
        ],
    );
    let err = validate_fuel_mix(sparse).unwrap_err();
    assert!(err.to_string().contains("Only 2"));
}

#[test]
fn negative_generation_fails_validation() {
    let ts = Utc.with_ymd_and_hms(2024, 6, 15, 16, 0, 0).unwrap();
    let bad = FuelMix::new(
        ts,
        vec![
            FuelGeneration {
                fuel: FuelCategory::NaturalGas,
                generation_mw: -100.0,
            },
            FuelGeneration {
                fuel: FuelCategory::Nuclear,
                generation_mw: 3000.0,
            },
            FuelGeneration {
                fuel: FuelCategory::Hydro,
                generation_mw: 2000.0,
            },
        ],
    );
    let err = validate_fuel_mix(bad).unwrap_err();
    assert!(err.to_string().contains("Negative generation"));
}

#[test]
fn weather_bounds_are_enforced() {
    assert!(validate_weather(make_weather(0)).is_ok());

    let mut too_cold = make_weather(0);
    too_cold.temperature_f = -60.0;
    assert!(validate_weather(too_cold).is_err());

    let mut too_hot = make_weather(0);
    too_hot.temperature_f = 140.0;
    assert!(validate_weather(too_hot).is_err());

    let mut negative_wind = make_weather(0);
    negative_wind.wind_speed_80m_mph = -1.0;
    assert!(validate_weather(negative_wind).is_err());

    let mut bad_cloud = make_weather(0);
    bad_cloud.cloud_cover_pct = 140.0;
    assert!(validate_weather(bad_cloud).is_err());
}

// ── Pipeline wiring, in memory ──

/// Valid and invalid snapshots interleaved: the invalid ones route to the
/// dead-letter buffer, the valid ones land in the sink, and the pipeline
/// completes.
#[tokio::test]
async fn validation_failures_route_to_dead_letters() {
    let items = vec![
        make_mix(0, 5000.0),
        make_bad_mix(5),
        make_mix(10, 5000.0),
        make_bad_mix(15),
        make_mix(20, 5000.0),
    ];
    let persisted: Arc<Mutex<Vec<FuelMix>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = persisted.clone();

    let result = Pipeline::builder("test-errors")
        .channel_capacity(16)
        .drain_timeout(std::time::Duration::from_secs(5))
        .source(move |ctx: SourceCtx<FuelMix>| async move {
            for item in items {
                if !ctx.send(item).await {
                    return;
                }
            }
        })
        .stage("validate", StageConfig::default(), |mix: FuelMix| async move {
            validate_fuel_mix(mix)
        })
        .stage("persist", StageConfig::default(), move |mix: FuelMix| {
            let sink = sink.clone();
            async move {
                if let Ok(mut rows) = sink.lock() {
                    rows.push(mix.clone());
                }
                Ok(mix)
            }
        })
        .on_error(ErrorKind::Validation)
        .build()
        .run()
        .await;

    assert!(result.completed);
    assert_eq!(result.dead_letter_count, 2);
    assert_eq!(persisted.lock().unwrap().len(), 3);
    assert!(result
        .dead_letter_items
        .iter()
        .all(|f| f.error.to_string().contains("Zero/negative")));
    assert!(result
        .dead_letter_items
        .iter()
        .all(|f| f.stage_name == "validate"));
}

// ── Postgres-backed integration tests ──
//
// Gated on GRIDCARBON_TEST_DATABASE_URL; each test works in its own
// scratch schema so runs are isolated and repeatable.

fn test_database_url() -> Option<String> {
    env::var("GRIDCARBON_TEST_DATABASE_URL").ok()
}

async fn setup_test_store(database_url: &str, label: &str) -> Result<Store> {
    let schema = format!("gridcarbon_{}_{}", label, std::process::id());

    let admin = PgPoolOptions::new()
        .max_connections(1)
        .connect(database_url)
        .await?;
    sqlx::query(&format!("DROP SCHEMA IF EXISTS {schema} CASCADE"))
        .execute(&admin)
        .await?;
    sqlx::query(&format!("CREATE SCHEMA {schema}"))
        .execute(&admin)
        .await?;
    drop(admin);

    let schema_name = schema.clone();
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .after_connect(move |conn, _meta| {
            let schema = schema_name.clone();
            Box::pin(async move {
                sqlx::query(&format!("SET search_path TO {schema}"))
                    .execute(conn)
                    .await?;
                Ok(())
            })
        })
        .connect(database_url)
        .await?;

    for statement in [
        r#"
        CREATE TABLE fuel_mix (
            id BIGSERIAL PRIMARY KEY,
            timestamp TIMESTAMPTZ NOT NULL,
            fuel_category TEXT NOT NULL,
            generation_mw DOUBLE PRECISION NOT NULL,
            UNIQUE (timestamp, fuel_category)
        )
        "#,
        r#"
        CREATE TABLE carbon_intensity (
            id BIGSERIAL PRIMARY KEY,
            timestamp TIMESTAMPTZ NOT NULL UNIQUE,
            grams_co2_per_kwh DOUBLE PRECISION NOT NULL,
            total_generation_mw DOUBLE PRECISION NOT NULL,
            clean_percentage DOUBLE PRECISION NOT NULL,
            fuel_breakdown_json JSONB
        )
        "#,
        r#"
        CREATE TABLE weather (
            id BIGSERIAL PRIMARY KEY,
            timestamp TIMESTAMPTZ NOT NULL UNIQUE,
            temperature_f DOUBLE PRECISION,
            wind_speed_80m_mph DOUBLE PRECISION,
            cloud_cover_pct DOUBLE PRECISION
        )
        "#,
        r#"
        CREATE TABLE ingestion_events (
            id BIGSERIAL PRIMARY KEY,
            timestamp TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            event_type TEXT NOT NULL,
            stage_name TEXT,
            message TEXT,
            details_json JSONB
        )
        "#,
        r#"
        CREATE TABLE pipeline_metrics (
            id BIGSERIAL PRIMARY KEY,
            timestamp TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            pipeline_name TEXT NOT NULL,
            stage_name TEXT NOT NULL,
            items_in BIGINT NOT NULL,
            items_out BIGINT NOT NULL,
            items_errored BIGINT NOT NULL,
            items_retried BIGINT NOT NULL DEFAULT 0,
            error_rate DOUBLE PRECISION,
            throughput_per_sec DOUBLE PRECISION,
            latency_p50 DOUBLE PRECISION,
            latency_p95 DOUBLE PRECISION,
            latency_p99 DOUBLE PRECISION,
            queue_depth BIGINT,
            queue_utilization DOUBLE PRECISION
        )
        "#,
    ] {
        sqlx::query(statement).execute(&pool).await?;
    }

    Ok(Store::from_pool(pool, database_url))
}

#[tokio::test]
async fn saving_a_fuel_mix_twice_is_idempotent() -> Result<()> {
    let Some(url) = test_database_url() else {
        return Ok(());
    };
    let store = setup_test_store(&url, "idempotent").await?;

    let mix = make_mix(0, 5000.0);
    store.save_fuel_mix(&mix).await?;
    assert_eq!(store.record_count().await?, 1);
    let first = store.get_latest_intensity().await?.unwrap();

    store.save_fuel_mix(&mix).await?;
    assert_eq!(store.record_count().await?, 1);
    let second = store.get_latest_intensity().await?.unwrap();
    assert_eq!(first.grams_co2_per_kwh, second.grams_co2_per_kwh);
    assert_eq!(first.timestamp, second.timestamp);
    Ok(())
}

#[tokio::test]
async fn pipeline_persists_valid_and_event_logs_invalid() -> Result<()> {
    let Some(url) = test_database_url() else {
        return Ok(());
    };
    let store = Arc::new(setup_test_store(&url, "events").await?);

    let items = vec![
        make_mix(0, 5000.0),
        make_bad_mix(5),
        make_mix(10, 5000.0),
        make_bad_mix(15),
        make_mix(20, 5000.0),
    ];
    let handler = event_logging_handler::<FuelMix>(store.clone());
    let persist_store = store.clone();

    let result = Pipeline::builder("test-seed")
        .channel_capacity(16)
        .drain_timeout(std::time::Duration::from_secs(10))
        .source(move |ctx: SourceCtx<FuelMix>| async move {
            for item in items {
                if !ctx.send(item).await {
                    return;
                }
            }
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
        .run()
        .await;

    assert!(result.completed, "{}", result.summary());
    assert_eq!(result.dead_letter_count, 2);
    assert_eq!(store.record_count().await?, 3);
    assert!(result
        .dead_letter_items
        .iter()
        .all(|f| f.error.to_string().contains("Zero/negative")));

    let failures = store
        .get_recent_events(10, Some("validate_failure"))
        .await?;
    assert_eq!(failures.len(), 2);
    for event in &failures {
        assert_eq!(event.stage_name.as_deref(), Some("validate"));
        assert!(event.message.as_deref().unwrap_or("").contains("Zero/negative"));
        let details = event.details_json.as_ref().unwrap();
        assert_eq!(details["attempts"], 1);
    }
    Ok(())
}

#[tokio::test]
async fn hourly_averages_group_and_translate_day_of_week() -> Result<()> {
    let Some(url) = test_database_url() else {
        return Ok(());
    };
    let store = setup_test_store(&url, "averages").await?;

    // 2024-06-15 is a Saturday (UTC): day-of-week 5 with 0=Monday.
    for hour in 0..24u32 {
        let ts = Utc.with_ymd_and_hms(2024, 6, 15, hour, 0, 0).unwrap();
        let mix = FuelMix::new(
            ts,
            vec![
                FuelGeneration {
                    fuel: FuelCategory::NaturalGas,
                    generation_mw: 3000.0 + f64::from(hour) * 100.0,
                },
                FuelGeneration {
                    fuel: FuelCategory::Nuclear,
                    generation_mw: 3000.0,
                },
            ],
        );
        store.save_fuel_mix(&mix).await?;
    }

    let all = store.get_hourly_averages(None, None).await?;
    assert_eq!(all.len(), 24);
    assert!(all[&20] > all[&3]);

    let saturday = store.get_hourly_averages(Some(6), Some(5)).await?;
    assert_eq!(saturday.len(), 24);

    let monday = store.get_hourly_averages(Some(6), Some(0)).await?;
    assert!(monday.is_empty());
    Ok(())
}

#[tokio::test]
async fn weather_batches_upsert_in_one_transaction() -> Result<()> {
    let Some(url) = test_database_url() else {
        return Ok(());
    };
    let store = setup_test_store(&url, "weather").await?;

    let now = Utc::now();
    let rows: Vec<WeatherSnapshot> = (0..24)
        .map(|h| WeatherSnapshot {
            timestamp: now - Duration::minutes(h),
            temperature_f: 70.0 + h as f64,
            wind_speed_80m_mph: 8.0,
            cloud_cover_pct: 20.0,
        })
        .collect();

    store.save_weather_batch(&rows).await?;
    store.save_weather_batch(&rows).await?;

    let freshness = store.get_weather_freshness().await?;
    assert_eq!(freshness.status, "active");
    assert_eq!(freshness.records_last_hour, 24);
    Ok(())
}

#[tokio::test]
async fn ingestion_status_reflects_recency() -> Result<()> {
    let Some(url) = test_database_url() else {
        return Ok(());
    };
    let store = setup_test_store(&url, "status").await?;

    let empty = store.get_ingestion_status().await?;
    assert_eq!(empty.total_records, 0);
    assert!(!empty.is_active);

    let stale = FuelMix::new(
        Utc::now() - Duration::hours(2),
        vec![
            FuelGeneration {
                fuel: FuelCategory::NaturalGas,
                generation_mw: 5000.0,
            },
            FuelGeneration {
                fuel: FuelCategory::Nuclear,
                generation_mw: 3000.0,
            },
        ],
    );
    store.save_fuel_mix(&stale).await?;
    let status = store.get_ingestion_status().await?;
    assert_eq!(status.total_records, 1);
    assert!(!status.is_active);

    let fresh = FuelMix::new(
        Utc::now(),
        vec![
            FuelGeneration {
                fuel: FuelCategory::NaturalGas,
                generation_mw: 5000.0,
            },
            FuelGeneration {
                fuel: FuelCategory::Nuclear,
                generation_mw: 3000.0,
            },
        ],
    );
    store.save_fuel_mix(&fresh).await?;
    let status = store.get_ingestion_status().await?;
    assert_eq!(status.total_records, 2);
    assert!(status.is_active);
    Ok(())
}

#[tokio::test]
async fn pipeline_metrics_round_trip() -> Result<()> {
    let Some(url) = test_database_url() else {
        return Ok(());
    };
    let store = setup_test_store(&url, "metrics").await?;

    let metrics = crate::pipeline::StageMetrics::new("persist", std::time::Instant::now());
    metrics.record_in(10);
    metrics.record_out(9);
    metrics.record_errored(1);
    let snapshot = metrics.snapshot(Some(3), 16);

    store
        .save_pipeline_metrics("fuelmix-ingest", &[snapshot])
        .await;
    let rows = store.get_pipeline_metrics("fuelmix-ingest", 1).await?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].stage_name, "persist");
    assert_eq!(rows[0].items_in, 10);
    assert_eq!(rows[0].items_out, 9);
    assert_eq!(rows[0].queue_depth, Some(3));

    assert!(store.get_pipeline_metrics("weather-ingest", 1).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn log_event_failures_are_swallowed() -> Result<()> {
    let Some(url) = test_database_url() else {
        return Ok(());
    };
    let store = setup_test_store(&url, "badlog").await?;

    // Drop the events table out from under the logger: the call must not
    // panic or error.
    sqlx::query("DROP TABLE ingestion_events")
        .execute(store.pool())
        .await?;
    store
        .log_event("pipeline_start", None, Some("should be swallowed"), None)
        .await;
    Ok(())
}
