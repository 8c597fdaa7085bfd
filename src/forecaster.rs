//! Heuristic carbon intensity forecaster.
//!
//! No ML. The gas-dominated grid has strongly repeating daily and seasonal
//! shapes, so the forecast is a baseline from historical `(month, day of
//! week, hour)` averages, corrected multiplicatively for temperature and
//! wind, and blended with the current observed intensity over the first
//! few hours. With too little history, a built-in typical profile with
//! seasonal and weekend adjustments takes over.

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use crate::domain::{Confidence, Forecast, HourlyForecast, Intensity, WeatherSnapshot};
use crate::error::GridError;
use crate::store::Store;

pub const REGION: &str = "NYISO";
pub const REGION_TZ: Tz = chrono_tz::America::New_York;

pub const MAX_FORECAST_HOURS: usize = 48;

/// Typical hourly profile (gCO2/kWh) for an average day, used when the
/// store cannot supply a historical profile.
const TYPICAL_HOURLY_PROFILE: [f64; 24] = [
    200.0, 185.0, 175.0, 170.0, 170.0, 180.0, // overnight trough
    220.0, 270.0, 310.0, 330.0, 320.0, 310.0, // morning ramp
    300.0, 290.0, 290.0, 300.0, 330.0, 370.0, // afternoon
    380.0, 360.0, 330.0, 300.0, 260.0, 230.0, // evening peak and decay
];

/// Seasonal multipliers by month (January first). Shoulder seasons run
/// cleaner.
const SEASONAL_MULTIPLIER: [f64; 12] = [
    1.10, 1.05, 0.95, 0.90, 0.88, 1.00, 1.15, 1.15, 1.00, 0.90, 0.95, 1.05,
];

/// Weekend load discount.
const WEEKEND_MULTIPLIER: f64 = 0.88;

/// Per-degree correction outside the 65-75F comfort zone.
const TEMP_CORRECTION_PER_DEGREE: f64 = 0.005;

/// Per-mph correction above the hub-height wind threshold.
const WIND_CORRECTION_PER_MPH: f64 = 0.003;
const WIND_THRESHOLD_MPH: f64 = 10.0;

/// Blend horizon for the current-intensity persistence term.
pub const PERSISTENCE_HOURS: usize = 6;

/// Physical floor: nuclear/hydro baseload keeps the grid above this.
const INTENSITY_FLOOR: f64 = 50.0;

/// A minimum of 20 of 24 hours must be covered before a historical profile
/// replaces the typical one.
const MIN_PROFILE_HOURS: usize = 20;

/// Where the forecaster reads historical hourly profiles from. `Store`
/// implements this; tests substitute fixtures.
pub trait ProfileSource {
    fn hourly_averages(
        &self,
        month: u32,
        day_of_week: u32,
    ) -> impl Future<Output = Result<BTreeMap<u32, f64>, GridError>> + Send;
}

impl ProfileSource for Arc<Store> {
    fn hourly_averages(
        &self,
        month: u32,
        day_of_week: u32,
    ) -> impl Future<Output = Result<BTreeMap<u32, f64>, GridError>> + Send {
        self.get_hourly_averages(Some(month), Some(day_of_week))
    }
}

/// The `(month, day of week)` profile choice is cached for the lifetime of
/// the forecaster; the cache is instance-private and not thread-safe, so
/// either serialize forecast calls or build one per request.
pub struct HeuristicForecaster<S> {
    store: S,
    profile_cache: HashMap<(u32, u32), BTreeMap<u32, f64>>,
}

impl<S: ProfileSource> HeuristicForecaster<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            profile_cache: HashMap::new(),
        }
    }

    /// Generate a forecast for the next `hours` hours (clamped to 1..=48).
    ///
    /// `weather` supplies optional corrections, matched to forecast
    /// offsets by hour; `current` is the observed intensity used for the
    /// near-term persistence blend.
    pub async fn forecast(
        &mut self,
        hours: usize,
        weather: Option<&[WeatherSnapshot]>,
        current: Option<Intensity>,
    ) -> Result<Forecast, GridError> {
        let now = Utc::now();
        self.forecast_at(now, hours, weather, current).await
    }

    /// Deterministic variant used by tests: forecast as of a fixed
    /// `now`.
    pub async fn forecast_at(
        &mut self,
        now: DateTime<Utc>,
        hours: usize,
        weather: Option<&[WeatherSnapshot]>,
        current: Option<Intensity>,
    ) -> Result<Forecast, GridError> {
        let hours = hours.clamp(1, MAX_FORECAST_HOURS);
        let local_now = now.with_timezone(&REGION_TZ);

        // Index weather by whole-hour offset from now.
        let mut weather_by_offset: HashMap<usize, &WeatherSnapshot> = HashMap::new();
        if let Some(weather) = weather {
            for snap in weather {
                let seconds = (snap.timestamp - now).num_seconds();
                if seconds < 0 {
                    continue;
                }
                let offset = (seconds / 3600) as usize;
                if offset < hours {
                    weather_by_offset.entry(offset).or_insert(snap);
                }
            }
        }

        let mut hourly = Vec::with_capacity(hours);
        for h in 0..hours {
            let target = local_now + Duration::hours(h as i64);
            let month = target.month();
            let day_of_week = target.weekday().num_days_from_monday();
            let hour_of_day = target.hour();

            let mut predicted = self.baseline(month, day_of_week, hour_of_day).await?;

            if let Some(snap) = weather_by_offset.get(&h) {
                predicted = apply_weather_correction(predicted, snap);
            }

            if let Some(current) = current {
                if h < PERSISTENCE_HOURS {
                    let weight = 1.0 - h as f64 / PERSISTENCE_HOURS as f64;
                    predicted =
                        predicted * (1.0 - weight) + current.grams_co2_per_kwh * weight;
                }
            }

            predicted = predicted.max(INTENSITY_FLOOR);

            let confidence = if h < 6 {
                Confidence::High
            } else if h < 18 {
                Confidence::Medium
            } else {
                Confidence::Low
            };

            let hour_start = truncate_to_hour(target).with_timezone(&Utc);
            hourly.push(HourlyForecast {
                hour: hour_start,
                predicted: Intensity::at(predicted, hour_start),
                confidence,
            });
        }

        Ok(Forecast {
            generated_at: now,
            region: REGION.to_string(),
            hourly,
        })
    }

    /// Baseline for a `(month, day of week, hour)`. Historical averages
    /// win when coverage is adequate; otherwise the typical profile with
    /// seasonal and weekend adjustments.
    async fn baseline(&mut self, month: u32, day_of_week: u32, hour: u32) -> Result<f64, GridError> {
        let key = (month, day_of_week);
        if !self.profile_cache.contains_key(&key) {
            let averages = self.store.hourly_averages(month, day_of_week).await?;
            let profile = if averages.len() >= MIN_PROFILE_HOURS {
                averages
            } else {
                BTreeMap::new()
            };
            self.profile_cache.insert(key, profile);
        }

        if let Some(value) = self
            .profile_cache
            .get(&key)
            .and_then(|profile| profile.get(&hour))
        {
            return Ok(*value);
        }

        Ok(fallback_baseline(month, day_of_week, hour))
    }

    /// Drop cached profiles, e.g. after seeding new historical data.
    pub fn clear_cache(&mut self) {
        self.profile_cache.clear();
    }
}

/// Typical-profile baseline with seasonal and weekend scaling.
pub fn fallback_baseline(month: u32, day_of_week: u32, hour: u32) -> f64 {
    let mut base = TYPICAL_HOURLY_PROFILE
        .get(hour as usize)
        .copied()
        .unwrap_or(280.0);
    base *= SEASONAL_MULTIPLIER
        .get((month.saturating_sub(1)) as usize)
        .copied()
        .unwrap_or(1.0);
    if day_of_week >= 5 {
        base *= WEEKEND_MULTIPLIER;
    }
    base
}

/// Temperature departure from the comfort zone pushes intensity up; hub
/// wind above the cut-in threshold pulls it down.
fn apply_weather_correction(base: f64, snap: &WeatherSnapshot) -> f64 {
    let mut corrected = base;
    corrected *= 1.0 + snap.temperature_departure_from_comfort() * TEMP_CORRECTION_PER_DEGREE;
    let wind_excess = (snap.wind_speed_80m_mph - WIND_THRESHOLD_MPH).max(0.0);
    corrected *= 1.0 - wind_excess * WIND_CORRECTION_PER_MPH;
    corrected
}

fn truncate_to_hour(ts: DateTime<Tz>) -> DateTime<Tz> {
    REGION_TZ
        .with_ymd_and_hms(ts.year(), ts.month(), ts.day(), ts.hour(), 0, 0)
        .earliest()
        .unwrap_or(ts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Profile source with a fixed answer and a call counter.
    struct FixtureStore {
        profile: BTreeMap<u32, f64>,
        calls: AtomicUsize,
    }

    impl FixtureStore {
        fn empty() -> Self {
            Self {
                profile: BTreeMap::new(),
                calls: AtomicUsize::new(0),
            }
        }

        fn with_flat_profile(value: f64) -> Self {
            Self {
                profile: (0..24).map(|h| (h, value)).collect(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl<'a> ProfileSource for &'a FixtureStore {
        fn hourly_averages(
            &self,
            _month: u32,
            _day_of_week: u32,
        ) -> impl Future<Output = Result<BTreeMap<u32, f64>, GridError>> + Send {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Ok(self.profile.clone()))
        }
    }

    fn fixed_now() -> DateTime<Utc> {
        // A Saturday noon in June, Eastern.
        Utc.with_ymd_and_hms(2024, 6, 15, 16, 0, 0).unwrap()
    }

    fn flat_weather(now: DateTime<Utc>, temperature_f: f64, wind_mph: f64) -> Vec<WeatherSnapshot> {
        (0..24)
            .map(|h| WeatherSnapshot {
                timestamp: now + Duration::hours(h),
                temperature_f,
                wind_speed_80m_mph: wind_mph,
                cloud_cover_pct: 0.0,
            })
            .collect()
    }

    #[tokio::test]
    async fn empty_store_falls_back_to_typical_profile() {
        let store = FixtureStore::empty();
        let mut forecaster = HeuristicForecaster::new(&store);
        let fc = forecaster
            .forecast_at(fixed_now(), 24, None, None)
            .await
            .unwrap();

        assert_eq!(fc.forecast_hours(), 24);
        assert!(fc
            .hourly
            .iter()
            .all(|h| h.predicted.grams_co2_per_kwh >= 50.0));

        // June Saturday: typical profile scaled by 1.0 (June) and 0.88.
        let local = fixed_now().with_timezone(&REGION_TZ);
        let expected = fallback_baseline(
            local.month(),
            local.weekday().num_days_from_monday(),
            local.hour(),
        );
        assert!((fc.hourly[0].predicted.grams_co2_per_kwh - expected).abs() < 1e-9);
    }

    #[tokio::test]
    async fn adequate_history_replaces_the_typical_profile() {
        let store = FixtureStore::with_flat_profile(321.0);
        let mut forecaster = HeuristicForecaster::new(&store);
        let fc = forecaster
            .forecast_at(fixed_now(), 12, None, None)
            .await
            .unwrap();
        assert!(fc
            .hourly
            .iter()
            .all(|h| (h.predicted.grams_co2_per_kwh - 321.0).abs() < 1e-9));
    }

    #[tokio::test]
    async fn profile_queries_are_cached_per_month_and_dow() {
        let store = FixtureStore::with_flat_profile(300.0);
        let mut forecaster = HeuristicForecaster::new(&store);
        // 24 hours spanning Saturday noon to Sunday noon: two (month, dow)
        // keys, so exactly two store queries.
        let _ = forecaster
            .forecast_at(fixed_now(), 24, None, None)
            .await
            .unwrap();
        assert_eq!(store.calls.load(Ordering::SeqCst), 2);

        let _ = forecaster
            .forecast_at(fixed_now(), 24, None, None)
            .await
            .unwrap();
        assert_eq!(store.calls.load(Ordering::SeqCst), 2);

        forecaster.clear_cache();
        let _ = forecaster
            .forecast_at(fixed_now(), 24, None, None)
            .await
            .unwrap();
        assert_eq!(store.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn hot_still_days_forecast_dirtier_than_mild_windy_days() {
        let store = FixtureStore::empty();
        let now = fixed_now();

        let mut forecaster = HeuristicForecaster::new(&store);
        let hot = forecaster
            .forecast_at(now, 24, Some(&flat_weather(now, 100.0, 5.0)), None)
            .await
            .unwrap();
        let mild = forecaster
            .forecast_at(now, 24, Some(&flat_weather(now, 70.0, 20.0)), None)
            .await
            .unwrap();

        let avg = |fc: &Forecast| {
            fc.hourly
                .iter()
                .map(|h| h.predicted.grams_co2_per_kwh)
                .sum::<f64>()
                / fc.hourly.len() as f64
        };
        assert!(avg(&hot) > avg(&mild));
    }

    #[tokio::test]
    async fn weather_correction_is_monotone() {
        let snap = |t: f64, w: f64| WeatherSnapshot {
            timestamp: fixed_now(),
            temperature_f: t,
            wind_speed_80m_mph: w,
            cloud_cover_pct: 0.0,
        };
        // Holding wind fixed, larger comfort departure never lowers CI.
        assert!(
            apply_weather_correction(300.0, &snap(95.0, 5.0))
                >= apply_weather_correction(300.0, &snap(80.0, 5.0))
        );
        // Holding temperature fixed, more wind above threshold never
        // raises CI.
        assert!(
            apply_weather_correction(300.0, &snap(70.0, 30.0))
                <= apply_weather_correction(300.0, &snap(70.0, 15.0))
        );
        // Below the threshold wind has no effect.
        assert_eq!(
            apply_weather_correction(300.0, &snap(70.0, 5.0)),
            apply_weather_correction(300.0, &snap(70.0, 9.0))
        );
    }

    #[tokio::test]
    async fn persistence_blend_anchors_the_first_hours() {
        let store = FixtureStore::empty();
        let now = fixed_now();
        let mut forecaster = HeuristicForecaster::new(&store);

        let current = Intensity::new(500.0);
        let fc = forecaster
            .forecast_at(now, 24, None, Some(current))
            .await
            .unwrap();

        // Hour 0 equals the current observation exactly.
        assert!((fc.hourly[0].predicted.grams_co2_per_kwh - 500.0).abs() < 1e-9);
        // And it decays towards the baseline.
        assert!(
            fc.hourly[23].predicted.grams_co2_per_kwh < fc.hourly[0].predicted.grams_co2_per_kwh
        );

        // Each blended hour is the linear mix of baseline and current.
        let local = now.with_timezone(&REGION_TZ);
        for h in 0..PERSISTENCE_HOURS {
            let target = local + Duration::hours(h as i64);
            let baseline = fallback_baseline(
                target.month(),
                target.weekday().num_days_from_monday(),
                target.hour(),
            );
            let weight = 1.0 - h as f64 / PERSISTENCE_HOURS as f64;
            let expected = baseline * (1.0 - weight) + 500.0 * weight;
            assert!(
                (fc.hourly[h].predicted.grams_co2_per_kwh - expected).abs() < 1e-6,
                "hour {h}"
            );
        }

        // From the persistence horizon on, the blend has no effect.
        let pure = forecaster.forecast_at(now, 24, None, None).await.unwrap();
        for h in PERSISTENCE_HOURS..24 {
            assert!(
                (fc.hourly[h].predicted.grams_co2_per_kwh
                    - pure.hourly[h].predicted.grams_co2_per_kwh)
                    .abs()
                    < 1e-9
            );
        }
    }

    #[tokio::test]
    async fn horizon_is_clamped_to_48_hours() {
        let store = FixtureStore::empty();
        let mut forecaster = HeuristicForecaster::new(&store);
        let fc = forecaster
            .forecast_at(fixed_now(), 100, None, None)
            .await
            .unwrap();
        assert_eq!(fc.forecast_hours(), 48);

        let fc = forecaster
            .forecast_at(fixed_now(), 0, None, None)
            .await
            .unwrap();
        assert_eq!(fc.forecast_hours(), 1);
    }

    #[tokio::test]
    async fn confidence_degrades_with_horizon() {
        let store = FixtureStore::empty();
        let mut forecaster = HeuristicForecaster::new(&store);
        let fc = forecaster
            .forecast_at(fixed_now(), 24, None, None)
            .await
            .unwrap();
        assert_eq!(fc.hourly[0].confidence, Confidence::High);
        assert_eq!(fc.hourly[5].confidence, Confidence::High);
        assert_eq!(fc.hourly[6].confidence, Confidence::Medium);
        assert_eq!(fc.hourly[17].confidence, Confidence::Medium);
        assert_eq!(fc.hourly[18].confidence, Confidence::Low);
        assert_eq!(fc.hourly[23].confidence, Confidence::Low);
    }

    #[tokio::test]
    async fn forecast_hours_are_truncated_to_the_hour() {
        let store = FixtureStore::empty();
        let mut forecaster = HeuristicForecaster::new(&store);
        let now = Utc.with_ymd_and_hms(2024, 6, 15, 16, 37, 12).unwrap();
        let fc = forecaster.forecast_at(now, 3, None, None).await.unwrap();
        for point in &fc.hourly {
            assert_eq!(point.hour.minute(), 0);
            assert_eq!(point.hour.second(), 0);
        }
        assert_eq!(fc.hourly[0].hour, Utc.with_ymd_and_hms(2024, 6, 15, 16, 0, 0).unwrap());
    }
}
