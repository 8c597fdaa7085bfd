use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use super::intensity::Intensity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::Low => "low",
            Confidence::Medium => "medium",
            Confidence::High => "high",
        }
    }
}

/// A single hourly forecast point.
#[derive(Debug, Clone, Copy)]
pub struct HourlyForecast {
    pub hour: DateTime<Utc>,
    pub predicted: Intensity,
    pub confidence: Confidence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowLabel {
    Cleanest,
    Dirtiest,
}

impl WindowLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            WindowLabel::Cleanest => "cleanest",
            WindowLabel::Dirtiest => "dirtiest",
        }
    }
}

/// A contiguous span of forecast hours identified as notable.
#[derive(Debug, Clone, Copy)]
pub struct ForecastWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub average: Intensity,
    pub label: WindowLabel,
}

impl ForecastWindow {
    pub fn duration_hours(&self) -> f64 {
        (self.end - self.start).num_seconds() as f64 / 3600.0
    }
}

/// Complete forecast: hourly predictions for a 1..48 hour horizon plus
/// window extraction for load-shifting recommendations.
#[derive(Debug, Clone)]
pub struct Forecast {
    pub generated_at: DateTime<Utc>,
    pub region: String,
    pub hourly: Vec<HourlyForecast>,
}

impl Forecast {
    pub fn forecast_hours(&self) -> usize {
        self.hourly.len()
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.hourly.first().map(|h| h.hour).unwrap_or(self.generated_at)
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.hourly.last().map(|h| h.hour).unwrap_or(self.generated_at)
    }

    /// The contiguous `window_hours`-hour span with the lowest mean
    /// intensity. None if the forecast is shorter than the window.
    pub fn cleanest_window(&self, window_hours: usize) -> Option<ForecastWindow> {
        self.find_window(window_hours, WindowLabel::Cleanest)
    }

    /// The contiguous `window_hours`-hour span with the highest mean
    /// intensity.
    pub fn dirtiest_window(&self, window_hours: usize) -> Option<ForecastWindow> {
        self.find_window(window_hours, WindowLabel::Dirtiest)
    }

    fn find_window(&self, window_hours: usize, label: WindowLabel) -> Option<ForecastWindow> {
        if window_hours == 0 || self.hourly.len() < window_hours {
            return None;
        }

        let mut best_avg = match label {
            WindowLabel::Cleanest => f64::INFINITY,
            WindowLabel::Dirtiest => f64::NEG_INFINITY,
        };
        let mut best_start = 0;

        for start in 0..=(self.hourly.len() - window_hours) {
            let avg = self.hourly[start..start + window_hours]
                .iter()
                .map(|h| h.predicted.grams_co2_per_kwh)
                .sum::<f64>()
                / window_hours as f64;
            // Strict comparison keeps the earliest start on ties.
            let better = match label {
                WindowLabel::Cleanest => avg < best_avg,
                WindowLabel::Dirtiest => avg > best_avg,
            };
            if better {
                best_avg = avg;
                best_start = start;
            }
        }

        let window = &self.hourly[best_start..best_start + window_hours];
        Some(ForecastWindow {
            start: window[0].hour,
            end: window[window_hours - 1].hour + Duration::hours(1),
            average: Intensity::new(best_avg),
            label,
        })
    }

    /// Plain-English summary for the CLI, rendered in the region's local
    /// timezone.
    pub fn summary(&self, tz: Tz) -> String {
        let Some(current) = self.hourly.first() else {
            return "No forecast data available.".to_string();
        };

        let mut lines = vec![
            format!("Grid Carbon Forecast for {}", self.region),
            format!(
                "Generated: {}",
                self.generated_at.with_timezone(&tz).format("%Y-%m-%d %H:%M %Z")
            ),
            String::new(),
            format!(
                "Right now: {:.0} gCO2/kWh ({})",
                current.predicted.grams_co2_per_kwh,
                current.predicted.category().label()
            ),
            format!("  {}", current.predicted.category().recommendation()),
        ];

        if let Some(cleanest) = self.cleanest_window(3) {
            lines.push(String::new());
            lines.push(format!(
                "Cleanest 3-hour window: {} to {}",
                cleanest.start.with_timezone(&tz).format("%I:%M %p"),
                cleanest.end.with_timezone(&tz).format("%I:%M %p")
            ));
            lines.push(format!(
                "  {:.0} gCO2/kWh ({})",
                cleanest.average.grams_co2_per_kwh,
                cleanest.average.category().as_str()
            ));
        }

        if let Some(dirtiest) = self.dirtiest_window(3) {
            lines.push(String::new());
            lines.push(format!(
                "Dirtiest 3-hour window: {} to {}",
                dirtiest.start.with_timezone(&tz).format("%I:%M %p"),
                dirtiest.end.with_timezone(&tz).format("%I:%M %p")
            ));
            lines.push(format!(
                "  {:.0} gCO2/kWh ({})",
                dirtiest.average.grams_co2_per_kwh,
                dirtiest.average.category().as_str()
            ));
        }

        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};
    use chrono_tz::America::New_York;

    /// Daily pattern used by the window tests: cleanest at 3am, rising
    /// with distance from it.
    fn synthetic_forecast(hours: usize) -> Forecast {
        let start = Utc.with_ymd_and_hms(2024, 6, 15, 0, 0, 0).unwrap();
        let hourly = (0..hours)
            .map(|h| {
                let hour = start + Duration::hours(h as i64);
                let hour_of_day = hour.hour() as f64;
                let ci = 200.0 + 150.0 * (hour_of_day - 3.0).abs() / 15.0;
                HourlyForecast {
                    hour,
                    predicted: Intensity::new(ci),
                    confidence: if h < 6 { Confidence::High } else { Confidence::Medium },
                }
            })
            .collect();
        Forecast {
            generated_at: start,
            region: "NYISO".to_string(),
            hourly,
        }
    }

    #[test]
    fn cleanest_window_centers_on_the_overnight_trough() {
        let fc = synthetic_forecast(24);
        let cleanest = fc.cleanest_window(3).unwrap();
        assert_eq!(cleanest.label, WindowLabel::Cleanest);
        // Minimum of 200 + 150*|h-3|/15 over a 3-hour mean sits at 2..5.
        assert_eq!(cleanest.start.hour(), 2);
        assert_eq!(cleanest.duration_hours(), 3.0);
        assert_eq!(cleanest.end, cleanest.start + Duration::hours(3));
    }

    #[test]
    fn dirtiest_window_sits_farthest_from_the_trough() {
        let fc = synthetic_forecast(24);
        let dirtiest = fc.dirtiest_window(3).unwrap();
        assert_eq!(dirtiest.label, WindowLabel::Dirtiest);
        // |h-3| is maximized at the end of the day: hours 21..24.
        assert_eq!(dirtiest.start.hour(), 21);
    }

    #[test]
    fn cleanest_never_exceeds_dirtiest() {
        let fc = synthetic_forecast(24);
        let cleanest = fc.cleanest_window(3).unwrap();
        let dirtiest = fc.dirtiest_window(3).unwrap();
        assert!(cleanest.average <= dirtiest.average);
    }

    #[test]
    fn equal_values_tie_break_to_earliest_start() {
        let start = Utc.with_ymd_and_hms(2024, 6, 15, 0, 0, 0).unwrap();
        let hourly = (0..12)
            .map(|h| HourlyForecast {
                hour: start + Duration::hours(h),
                predicted: Intensity::new(300.0),
                confidence: Confidence::Medium,
            })
            .collect();
        let fc = Forecast {
            generated_at: start,
            region: "NYISO".to_string(),
            hourly,
        };
        let cleanest = fc.cleanest_window(4).unwrap();
        let dirtiest = fc.dirtiest_window(4).unwrap();
        assert_eq!(cleanest.start, start);
        assert_eq!(dirtiest.start, start);
        assert_eq!(
            cleanest.average.grams_co2_per_kwh,
            dirtiest.average.grams_co2_per_kwh
        );
    }

    #[test]
    fn window_longer_than_forecast_is_none() {
        let fc = synthetic_forecast(6);
        assert!(fc.cleanest_window(7).is_none());
        assert!(fc.cleanest_window(6).is_some());
    }

    #[test]
    fn summary_names_the_windows() {
        let fc = synthetic_forecast(24);
        let summary = fc.summary(New_York);
        assert!(summary.contains("NYISO"));
        assert!(summary.contains("Cleanest 3-hour window"));
        assert!(summary.contains("Dirtiest 3-hour window"));
    }
}
