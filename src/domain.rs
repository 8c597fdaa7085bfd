//! Domain model: fuel categories and emission factors, fuel-mix snapshots,
//! carbon intensity, weather observations, and forecast records. Pure data,
//! no I/O.

mod forecast;
mod fuel;
mod intensity;
mod weather;

pub use forecast::{Confidence, Forecast, ForecastWindow, HourlyForecast, WindowLabel};
pub use fuel::{emission_factors, factor_for, EmissionFactor, FuelCategory, FuelGeneration, FuelMix};
pub use intensity::{Intensity, IntensityCategory};
pub use weather::WeatherSnapshot;
