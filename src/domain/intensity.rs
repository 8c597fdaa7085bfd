use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Carbon intensity at a point in time.
///
/// Canonical unit: grams CO2 per kilowatt-hour. Conversions are exposed as
/// named accessors; the value composes through `+` and `/` so a window of
/// intensities can be accumulated and averaged.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Intensity {
    pub grams_co2_per_kwh: f64,
    pub timestamp: Option<DateTime<Utc>>,
}

impl Intensity {
    pub fn new(grams_co2_per_kwh: f64) -> Self {
        Self {
            grams_co2_per_kwh,
            timestamp: None,
        }
    }

    pub fn at(grams_co2_per_kwh: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            grams_co2_per_kwh,
            timestamp: Some(timestamp),
        }
    }

    pub fn kg_co2_per_kwh(&self) -> f64 {
        self.grams_co2_per_kwh / 1000.0
    }

    pub fn kg_co2_per_mwh(&self) -> f64 {
        self.grams_co2_per_kwh
    }

    pub fn lbs_co2_per_mwh(&self) -> f64 {
        self.kg_co2_per_mwh() * 2.20462
    }

    pub fn tons_co2_per_mwh(&self) -> f64 {
        self.lbs_co2_per_mwh() / 2000.0
    }

    /// Classification thresholds calibrated for NYISO's typical range of
    /// roughly 100-450 gCO2/kWh.
    pub fn category(&self) -> IntensityCategory {
        let g = self.grams_co2_per_kwh;
        if g <= 150.0 {
            IntensityCategory::VeryClean
        } else if g <= 250.0 {
            IntensityCategory::Clean
        } else if g <= 350.0 {
            IntensityCategory::Moderate
        } else if g <= 450.0 {
            IntensityCategory::Dirty
        } else {
            IntensityCategory::VeryDirty
        }
    }

    pub fn total_cmp(&self, other: &Intensity) -> std::cmp::Ordering {
        self.grams_co2_per_kwh.total_cmp(&other.grams_co2_per_kwh)
    }
}

impl PartialEq for Intensity {
    fn eq(&self, other: &Self) -> bool {
        self.grams_co2_per_kwh == other.grams_co2_per_kwh
    }
}

impl PartialOrd for Intensity {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.grams_co2_per_kwh.partial_cmp(&other.grams_co2_per_kwh)
    }
}

impl std::ops::Add for Intensity {
    type Output = Intensity;

    fn add(self, other: Intensity) -> Intensity {
        Intensity::new(self.grams_co2_per_kwh + other.grams_co2_per_kwh)
    }
}

impl std::ops::Div<f64> for Intensity {
    type Output = Intensity;

    fn div(self, divisor: f64) -> Intensity {
        Intensity::new(self.grams_co2_per_kwh / divisor)
    }
}

impl std::fmt::Display for Intensity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:.0} gCO2/kWh [{}]",
            self.grams_co2_per_kwh,
            self.category().as_str()
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntensityCategory {
    VeryClean,
    Clean,
    Moderate,
    Dirty,
    VeryDirty,
}

impl IntensityCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntensityCategory::VeryClean => "very_clean",
            IntensityCategory::Clean => "clean",
            IntensityCategory::Moderate => "moderate",
            IntensityCategory::Dirty => "dirty",
            IntensityCategory::VeryDirty => "very_dirty",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            IntensityCategory::VeryClean => "Very Clean",
            IntensityCategory::Clean => "Clean",
            IntensityCategory::Moderate => "Moderate",
            IntensityCategory::Dirty => "Dirty",
            IntensityCategory::VeryDirty => "Very Dirty",
        }
    }

    /// Plain-English load-shifting recommendation.
    pub fn recommendation(&self) -> &'static str {
        match self {
            IntensityCategory::VeryClean => "Great time to run energy-intensive tasks!",
            IntensityCategory::Clean => "Good time for discretionary electricity use.",
            IntensityCategory::Moderate => {
                "Grid is average right now. Defer if you can wait a few hours."
            }
            IntensityCategory::Dirty => "Consider waiting, the grid is carbon-heavy right now.",
            IntensityCategory::VeryDirty => "Worst time for electricity use. Defer everything you can.",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_thresholds() {
        assert_eq!(Intensity::new(100.0).category(), IntensityCategory::VeryClean);
        assert_eq!(Intensity::new(150.0).category(), IntensityCategory::VeryClean);
        assert_eq!(Intensity::new(150.1).category(), IntensityCategory::Clean);
        assert_eq!(Intensity::new(250.0).category(), IntensityCategory::Clean);
        assert_eq!(Intensity::new(300.0).category(), IntensityCategory::Moderate);
        assert_eq!(Intensity::new(350.1).category(), IntensityCategory::Dirty);
        assert_eq!(Intensity::new(450.0).category(), IntensityCategory::Dirty);
        assert_eq!(Intensity::new(450.1).category(), IntensityCategory::VeryDirty);
    }

    #[test]
    fn category_is_monotone_in_grams() {
        let mut last = IntensityCategory::VeryClean;
        for g in (0..700).map(|g| g as f64) {
            let cat = Intensity::new(g).category();
            assert!(cat as u8 >= last as u8);
            last = cat;
        }
    }

    #[test]
    fn every_category_has_label_and_recommendation() {
        for g in [100.0, 200.0, 300.0, 400.0, 500.0] {
            let cat = Intensity::new(g).category();
            assert!(!cat.label().is_empty());
            assert!(!cat.recommendation().is_empty());
        }
    }

    #[test]
    fn unit_conversions() {
        let ci = Intensity::new(300.0);
        assert!((ci.kg_co2_per_kwh() - 0.3).abs() < 1e-9);
        assert!((ci.kg_co2_per_mwh() - 300.0).abs() < 1e-9);
        assert!((ci.lbs_co2_per_mwh() - 661.386).abs() < 0.001);
    }

    #[test]
    fn arithmetic_and_ordering() {
        let a = Intensity::new(200.0);
        let b = Intensity::new(400.0);
        let avg = (a + b) / 2.0;
        assert!((avg.grams_co2_per_kwh - 300.0).abs() < 1e-9);
        assert!(a < b);
        assert!(a <= a);
    }
}
