use std::sync::Arc;

use crate::domain::{FuelMix, WeatherSnapshot};
use crate::error::GridError;
use crate::store::Store;

/// Validate one fuel mix snapshot. Invalid records are routed to the dead
/// letter buffer by the pipeline's error router.
pub fn validate_fuel_mix(mix: FuelMix) -> Result<FuelMix, GridError> {
    if mix.total_generation_mw() <= 0.0 {
        return Err(GridError::Validation(format!(
            "Zero/negative total generation ({} MW) at {}",
            mix.total_generation_mw(),
            mix.timestamp.to_rfc3339()
        )));
    }

    if mix.fuels().len() < 3 {
        return Err(GridError::Validation(format!(
            "Only {} fuel categories at {} (expected at least 3)",
            mix.fuels().len(),
            mix.timestamp.to_rfc3339()
        )));
    }

    for fuel in mix.fuels() {
        if fuel.generation_mw < 0.0 {
            return Err(GridError::Validation(format!(
                "Negative generation ({} MW) for {} at {}",
                fuel.generation_mw,
                fuel.fuel,
                mix.timestamp.to_rfc3339()
            )));
        }
    }

    Ok(mix)
}

/// Validate one weather observation against physical bounds.
pub fn validate_weather(snap: WeatherSnapshot) -> Result<WeatherSnapshot, GridError> {
    if !(-40.0..=130.0).contains(&snap.temperature_f) {
        return Err(GridError::Validation(format!(
            "Temperature {}F out of range at {}",
            snap.temperature_f,
            snap.timestamp.to_rfc3339()
        )));
    }
    if snap.wind_speed_80m_mph < 0.0 {
        return Err(GridError::Validation(format!(
            "Negative wind speed ({} mph) at {}",
            snap.wind_speed_80m_mph,
            snap.timestamp.to_rfc3339()
        )));
    }
    if !(0.0..=100.0).contains(&snap.cloud_cover_pct) {
        return Err(GridError::Validation(format!(
            "Cloud cover {}% out of range at {}",
            snap.cloud_cover_pct,
            snap.timestamp.to_rfc3339()
        )));
    }
    Ok(snap)
}

/// Persist one validated fuel mix. Anything the store throws that is not
/// already a store failure gets rewrapped so the retry policy sees a
/// single kind.
pub async fn persist_fuel_mix(store: Arc<Store>, mix: FuelMix) -> Result<FuelMix, GridError> {
    match store.save_fuel_mix(&mix).await {
        Ok(()) => Ok(mix),
        Err(err @ GridError::Store(_)) => Err(err),
        Err(other) => Err(GridError::Store(format!("unexpected persist error: {other}"))),
    }
}

/// Persist a batch of weather rows in one transaction.
pub async fn persist_weather_batch(
    store: Arc<Store>,
    batch: Vec<WeatherSnapshot>,
) -> Result<Vec<WeatherSnapshot>, GridError> {
    match store.save_weather_batch(&batch).await {
        Ok(()) => Ok(batch),
        Err(err @ GridError::Store(_)) => Err(err),
        Err(other) => Err(GridError::Store(format!("unexpected persist error: {other}"))),
    }
}
