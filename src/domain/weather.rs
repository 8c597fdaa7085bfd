use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Hourly weather observation relevant to grid carbon intensity:
/// temperature drives heating/cooling demand, hub-height wind determines
/// wind generation output, cloud cover affects behind-the-meter solar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeatherSnapshot {
    pub timestamp: DateTime<Utc>,
    pub temperature_f: f64,
    pub wind_speed_80m_mph: f64,
    pub cloud_cover_pct: f64,
}

impl WeatherSnapshot {
    pub fn temperature_c(&self) -> f64 {
        (self.temperature_f - 32.0) * 5.0 / 9.0
    }

    /// Below ~65F, heating demand increases gas consumption.
    pub fn is_heating(&self) -> bool {
        self.temperature_f < 65.0
    }

    /// Above ~75F, cooling demand increases gas consumption.
    pub fn is_cooling(&self) -> bool {
        self.temperature_f > 75.0
    }

    /// Degrees away from the 65-75F comfort zone. Always >= 0.
    pub fn temperature_departure_from_comfort(&self) -> f64 {
        if self.temperature_f < 65.0 {
            65.0 - self.temperature_f
        } else if self.temperature_f > 75.0 {
            self.temperature_f - 75.0
        } else {
            0.0
        }
    }
}
