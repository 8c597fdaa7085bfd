//! REST façade over the store, fetchers, and forecaster.
//!
//! Endpoints:
//!   GET /          API info and data coverage
//!   GET /now       Current intensity + recommendation (live, then stored)
//!   GET /forecast  Hourly forecast with cleanest/dirtiest windows
//!   GET /history   Stored intensity rows, ascending
//!   GET /factors   Emission factor table
//!   GET /status    Ingestion status and recent events
//!   GET /health    Liveness
//!
//! Error mapping: semantic/validation failures are 422, upstream
//! unavailability is 503, store and anything else is 500.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::domain::{emission_factors, Forecast, ForecastWindow, FuelMix, Intensity};
use crate::error::{ErrorKind, GridError};
use crate::forecaster::{HeuristicForecaster, REGION};
use crate::sources::{nyiso, weather};
use crate::store::Store;

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<Store>,
    pub http: reqwest::Client,
}

impl ApiState {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            http: reqwest::Client::new(),
        }
    }
}

struct ApiError(GridError);

impl From<GridError> for ApiError {
    fn from(err: GridError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind() {
            ErrorKind::Validation | ErrorKind::Semantic => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::DataSource => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Store | ErrorKind::Config => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "detail": self.0.to_string() }))).into_response()
    }
}

/// 503 with an actionable message when neither live nor stored data
/// exists.
fn no_data() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({
            "detail": "No carbon intensity data available. Seed the store first."
        })),
    )
        .into_response()
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/now", get(now))
        .route("/forecast", get(forecast))
        .route("/history", get(history))
        .route("/factors", get(factors))
        .route("/status", get(status))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(state: ApiState, host: &str, port: u16) -> anyhow::Result<()> {
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "API listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn root(State(state): State<ApiState>) -> Result<Json<JsonValue>, ApiError> {
    let count = state.store.record_count().await?;
    let range = state.store.date_range().await?;
    Ok(Json(json!({
        "name": "gridcarbon",
        "version": env!("CARGO_PKG_VERSION"),
        "region": REGION,
        "description": "Carbon intensity tracking and forecasting for the NYISO grid",
        "data": {
            "records": count,
            "earliest": range.map(|(earliest, _)| earliest),
            "latest": range.map(|(_, latest)| latest),
        },
        "endpoints": ["/now", "/forecast", "/history", "/factors", "/status", "/health"],
    })))
}

fn intensity_json(ci: &Intensity) -> JsonValue {
    json!({
        "grams_co2_per_kwh": round1(ci.grams_co2_per_kwh),
        "kg_co2_per_mwh": round1(ci.kg_co2_per_mwh()),
        "category": ci.category().as_str(),
        "label": ci.category().label(),
    })
}

fn live_now_json(mix: &FuelMix, ci: &Intensity) -> JsonValue {
    let breakdown: serde_json::Map<String, JsonValue> = mix
        .fuel_breakdown()
        .into_iter()
        .map(|(fuel, mw)| (fuel.as_label().to_string(), json!(round1(mw))))
        .collect();
    let percentages: serde_json::Map<String, JsonValue> = mix
        .fuel_percentages()
        .into_iter()
        .map(|(fuel, pct)| (fuel.as_label().to_string(), json!(pct)))
        .collect();
    json!({
        "timestamp": mix.timestamp,
        "carbon_intensity": intensity_json(ci),
        "recommendation": ci.category().recommendation(),
        "generation": {
            "total_mw": round1(mix.total_generation_mw()),
            "clean_percentage": round1(mix.clean_percentage()),
            "fuel_breakdown_mw": breakdown,
            "fuel_percentages": percentages,
        },
        "source": "live",
    })
}

async fn now(State(state): State<ApiState>) -> Result<Json<JsonValue>, Response> {
    // Live data first; the store is both the fallback and the write-through
    // target.
    match nyiso::fetch_latest(&state.http).await {
        Ok(Some(mix)) => {
            if let Ok(ci) = mix.carbon_intensity() {
                if let Err(err) = state.store.save_fuel_mix(&mix).await {
                    tracing::debug!(error = %err, "best-effort save of live fuel mix failed");
                }
                return Ok(Json(live_now_json(&mix, &ci)));
            }
        }
        Ok(None) => {}
        Err(err) => tracing::debug!(error = %err, "live fetch failed, falling back to store"),
    }

    let stored = state
        .store
        .get_latest_intensity()
        .await
        .map_err(|err| ApiError(err).into_response())?;
    match stored {
        Some(row) => {
            let ci = Intensity::new(row.grams_co2_per_kwh);
            Ok(Json(json!({
                "timestamp": row.timestamp,
                "carbon_intensity": {
                    "grams_co2_per_kwh": round1(row.grams_co2_per_kwh),
                    "category": ci.category().as_str(),
                    "label": ci.category().label(),
                },
                "recommendation": ci.category().recommendation(),
                "source": "stored",
            })))
        }
        None => Err(no_data()),
    }
}

#[derive(Debug, Deserialize)]
struct ForecastParams {
    #[serde(default = "default_forecast_hours")]
    hours: usize,
    #[serde(default = "default_window_hours")]
    window_hours: usize,
}

fn default_forecast_hours() -> usize {
    24
}

fn default_window_hours() -> usize {
    3
}

fn window_json(window: Option<ForecastWindow>) -> JsonValue {
    match window {
        Some(w) => json!({
            "start": w.start,
            "end": w.end,
            "duration_hours": w.duration_hours(),
            "avg_grams_co2_per_kwh": round1(w.average.grams_co2_per_kwh),
            "category": w.average.category().as_str(),
            "label": w.label.as_str(),
        }),
        None => JsonValue::Null,
    }
}

fn forecast_json(fc: &Forecast, window_hours: usize) -> JsonValue {
    let hourly: Vec<JsonValue> = fc
        .hourly
        .iter()
        .map(|h| {
            json!({
                "hour": h.hour,
                "grams_co2_per_kwh": round1(h.predicted.grams_co2_per_kwh),
                "category": h.predicted.category().as_str(),
                "label": h.predicted.category().label(),
                "confidence": h.confidence.as_str(),
            })
        })
        .collect();

    let mut body = json!({
        "region": fc.region,
        "generated_at": fc.generated_at,
        "forecast_hours": fc.forecast_hours(),
        "hourly": hourly,
        "cleanest_3h_window": window_json(fc.cleanest_window(3)),
        "dirtiest_3h_window": window_json(fc.dirtiest_window(3)),
    });
    if let Some(map) = body.as_object_mut() {
        map.insert(
            format!("cleanest_{window_hours}h_window"),
            window_json(fc.cleanest_window(window_hours)),
        );
        map.insert(
            format!("dirtiest_{window_hours}h_window"),
            window_json(fc.dirtiest_window(window_hours)),
        );
    }
    body
}

async fn forecast(
    State(state): State<ApiState>,
    Query(params): Query<ForecastParams>,
) -> Result<Json<JsonValue>, ApiError> {
    if !(1..=48).contains(&params.hours) {
        return Err(GridError::Validation(format!(
            "hours must be within 1..=48, got {}",
            params.hours
        ))
        .into());
    }
    if !(1..=12).contains(&params.window_hours) {
        return Err(GridError::Validation(format!(
            "window_hours must be within 1..=12, got {}",
            params.window_hours
        ))
        .into());
    }

    // Current intensity and weather are both best-effort inputs.
    let current = match nyiso::fetch_latest(&state.http).await {
        Ok(Some(mix)) => mix.carbon_intensity().ok(),
        _ => None,
    };
    let weather = weather::fetch_forecast(&state.http, 2).await.ok();

    let mut forecaster = HeuristicForecaster::new(state.store.clone());
    let fc = forecaster
        .forecast(params.hours, weather.as_deref(), current)
        .await?;

    Ok(Json(forecast_json(&fc, params.window_hours)))
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    #[serde(default = "default_forecast_hours")]
    hours: usize,
}

async fn history(
    State(state): State<ApiState>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<JsonValue>, ApiError> {
    if !(1..=720).contains(&params.hours) {
        return Err(GridError::Validation(format!(
            "hours must be within 1..=720, got {}",
            params.hours
        ))
        .into());
    }
    let records = state.store.get_carbon_intensity(params.hours as i32).await?;
    Ok(Json(json!({
        "hours": params.hours,
        "count": records.len(),
        "records": records,
    })))
}

async fn factors() -> Json<JsonValue> {
    let rows: Vec<JsonValue> = emission_factors()
        .iter()
        .map(|f| {
            json!({
                "fuel": f.fuel.as_label(),
                "grams_co2_per_kwh": f.grams_co2_per_kwh,
                "source": f.source,
            })
        })
        .collect();
    Json(json!({
        "methodology": "direct_combustion",
        "source": "EPA eGRID 2022 + EIA derived factors for NYISO",
        "factors": rows,
    }))
}

#[derive(Debug, Deserialize)]
struct StatusParams {
    #[serde(default = "default_event_limit")]
    limit: i64,
    event_type: Option<String>,
}

fn default_event_limit() -> i64 {
    50
}

async fn status(
    State(state): State<ApiState>,
    Query(params): Query<StatusParams>,
) -> Result<Json<JsonValue>, ApiError> {
    let ingestion = state.store.get_ingestion_status().await?;
    let weather = state.store.get_weather_freshness().await?;
    let events = state
        .store
        .get_recent_events(params.limit.clamp(1, 500), params.event_type.as_deref())
        .await?;
    Ok(Json(json!({
        "ingestion": ingestion,
        "weather": weather,
        "recent_events": events,
    })))
}

async fn health() -> Json<JsonValue> {
    Json(json!({ "status": "ok" }))
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Confidence, HourlyForecast};
    use chrono::{Duration, TimeZone, Utc};

    #[test]
    fn forecast_json_includes_requested_windows() {
        let start = Utc.with_ymd_and_hms(2024, 6, 15, 0, 0, 0).unwrap();
        let hourly = (0..24)
            .map(|h| HourlyForecast {
                hour: start + Duration::hours(h),
                predicted: Intensity::new(200.0 + h as f64),
                confidence: Confidence::Medium,
            })
            .collect();
        let fc = Forecast {
            generated_at: start,
            region: REGION.to_string(),
            hourly,
        };

        let body = forecast_json(&fc, 5);
        assert_eq!(body["forecast_hours"], 24);
        assert!(body["cleanest_3h_window"].is_object());
        assert!(body["cleanest_5h_window"].is_object());
        assert!(body["dirtiest_5h_window"].is_object());
        assert_eq!(body["hourly"].as_array().unwrap().len(), 24);
    }

    #[test]
    fn window_json_is_null_when_absent() {
        assert!(window_json(None).is_null());
    }
}
