use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::GridError;

use super::intensity::Intensity;

/// The seven fuel categories NYISO reports in its real-time fuel mix feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FuelCategory {
    #[serde(rename = "Natural Gas")]
    NaturalGas,
    #[serde(rename = "Dual Fuel")]
    DualFuel,
    #[serde(rename = "Nuclear")]
    Nuclear,
    #[serde(rename = "Hydro")]
    Hydro,
    #[serde(rename = "Wind")]
    Wind,
    #[serde(rename = "Other Renewables")]
    OtherRenewables,
    #[serde(rename = "Other Fossil Fuels")]
    OtherFossil,
}

impl FuelCategory {
    pub const ALL: [FuelCategory; 7] = [
        FuelCategory::NaturalGas,
        FuelCategory::DualFuel,
        FuelCategory::Nuclear,
        FuelCategory::Hydro,
        FuelCategory::Wind,
        FuelCategory::OtherRenewables,
        FuelCategory::OtherFossil,
    ];

    pub fn as_label(&self) -> &'static str {
        match self {
            FuelCategory::NaturalGas => "Natural Gas",
            FuelCategory::DualFuel => "Dual Fuel",
            FuelCategory::Nuclear => "Nuclear",
            FuelCategory::Hydro => "Hydro",
            FuelCategory::Wind => "Wind",
            FuelCategory::OtherRenewables => "Other Renewables",
            FuelCategory::OtherFossil => "Other Fossil Fuels",
        }
    }

    /// Parse a fuel category from an upstream label. Case- and
    /// whitespace-insensitive, with aliases for minor labeling variations
    /// across NYISO datasets.
    pub fn parse_label(label: &str) -> Result<FuelCategory, GridError> {
        match label.trim().to_lowercase().as_str() {
            "natural gas" => Ok(FuelCategory::NaturalGas),
            "dual fuel" => Ok(FuelCategory::DualFuel),
            "nuclear" => Ok(FuelCategory::Nuclear),
            "hydro" => Ok(FuelCategory::Hydro),
            "wind" => Ok(FuelCategory::Wind),
            "other renewables" => Ok(FuelCategory::OtherRenewables),
            "other fossil fuels" | "other fossil" => Ok(FuelCategory::OtherFossil),
            _ => Err(GridError::UnknownFuelCategory(format!(
                "'{}' is not a known NYISO fuel category",
                label.trim()
            ))),
        }
    }

    /// Direct combustion emission factor in gCO2/kWh.
    pub fn factor(&self) -> f64 {
        factor_for(*self)
    }

    pub fn is_clean(&self) -> bool {
        self.factor() == 0.0
    }
}

impl std::fmt::Display for FuelCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Emission factor for one fuel category, with provenance.
///
/// Factors are direct combustion values (EPA eGRID methodology, the
/// standard for Scope 2 accounting), not lifecycle values.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct EmissionFactor {
    pub fuel: FuelCategory,
    pub grams_co2_per_kwh: f64,
    pub source: &'static str,
}

const EMISSION_FACTORS: [EmissionFactor; 7] = [
    EmissionFactor {
        fuel: FuelCategory::NaturalGas,
        grams_co2_per_kwh: 450.0,
        source: "EPA eGRID 2022 NYCW/NYUP weighted average for gas fleet",
    },
    EmissionFactor {
        fuel: FuelCategory::DualFuel,
        grams_co2_per_kwh: 480.0,
        source: "EPA eGRID 2022, NYC dual-fuel plants (predominantly gas operation)",
    },
    EmissionFactor {
        fuel: FuelCategory::Nuclear,
        grams_co2_per_kwh: 0.0,
        source: "Zero direct combustion emissions",
    },
    EmissionFactor {
        fuel: FuelCategory::Hydro,
        grams_co2_per_kwh: 0.0,
        source: "Zero direct combustion emissions",
    },
    EmissionFactor {
        fuel: FuelCategory::Wind,
        grams_co2_per_kwh: 0.0,
        source: "Zero direct combustion emissions",
    },
    EmissionFactor {
        fuel: FuelCategory::OtherRenewables,
        grams_co2_per_kwh: 0.0,
        source: "Biomass/landfill gas treated as carbon-neutral by convention",
    },
    EmissionFactor {
        fuel: FuelCategory::OtherFossil,
        grams_co2_per_kwh: 840.0,
        source: "EPA eGRID 2022 weighted average for oil/coal in NYISO",
    },
];

pub fn emission_factors() -> &'static [EmissionFactor; 7] {
    &EMISSION_FACTORS
}

pub fn factor_for(fuel: FuelCategory) -> f64 {
    match fuel {
        FuelCategory::NaturalGas => 450.0,
        FuelCategory::DualFuel => 480.0,
        FuelCategory::OtherFossil => 840.0,
        FuelCategory::Nuclear
        | FuelCategory::Hydro
        | FuelCategory::Wind
        | FuelCategory::OtherRenewables => 0.0,
    }
}

/// Generation from one fuel category at a point in time, one row of the
/// upstream fuel-mix CSV.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FuelGeneration {
    pub fuel: FuelCategory,
    pub generation_mw: f64,
}

impl FuelGeneration {
    pub fn is_clean(&self) -> bool {
        self.fuel.is_clean()
    }

    pub fn is_fossil(&self) -> bool {
        !self.is_clean()
    }
}

/// A complete fuel mix snapshot: generation across fuel categories for a
/// single timestamp. One snapshot corresponds to one 5-minute NYISO
/// interval.
///
/// Totals and the carbon intensity are derived eagerly at construction and
/// never change afterwards; snapshots move through the pipeline by value.
#[derive(Debug, Clone)]
pub struct FuelMix {
    pub timestamp: DateTime<Utc>,
    fuels: Vec<FuelGeneration>,
    total_mw: f64,
    clean_mw: f64,
    intensity: Option<Intensity>,
}

impl FuelMix {
    pub fn new(timestamp: DateTime<Utc>, fuels: Vec<FuelGeneration>) -> Self {
        let total_mw: f64 = fuels.iter().map(|f| f.generation_mw).sum();
        let clean_mw: f64 = fuels
            .iter()
            .filter(|f| f.is_clean())
            .map(|f| f.generation_mw)
            .sum();
        let intensity = if fuels.is_empty() {
            None
        } else {
            let grams = if total_mw <= 0.0 {
                0.0
            } else {
                fuels
                    .iter()
                    .map(|f| f.generation_mw * f.fuel.factor())
                    .sum::<f64>()
                    / total_mw
            };
            Some(Intensity::at(grams, timestamp))
        };
        Self {
            timestamp,
            fuels,
            total_mw,
            clean_mw,
            intensity,
        }
    }

    pub fn fuels(&self) -> &[FuelGeneration] {
        &self.fuels
    }

    /// Generation-weighted average intensity. Fails on a mix constructed
    /// with no fuel rows.
    pub fn carbon_intensity(&self) -> Result<Intensity, GridError> {
        self.intensity
            .ok_or_else(|| GridError::Validation("fuel mix has no fuel data".into()))
    }

    pub fn total_generation_mw(&self) -> f64 {
        self.total_mw
    }

    pub fn clean_generation_mw(&self) -> f64 {
        self.clean_mw
    }

    pub fn fossil_generation_mw(&self) -> f64 {
        self.total_mw - self.clean_mw
    }

    pub fn clean_percentage(&self) -> f64 {
        if self.total_mw <= 0.0 {
            return 0.0;
        }
        self.clean_mw / self.total_mw * 100.0
    }

    /// Fuel category and MW, sorted by generation descending. The sort is
    /// stable; ties keep input order.
    pub fn fuel_breakdown(&self) -> Vec<(FuelCategory, f64)> {
        let mut rows: Vec<(FuelCategory, f64)> = self
            .fuels
            .iter()
            .map(|f| (f.fuel, f.generation_mw))
            .collect();
        rows.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        rows
    }

    /// Fuel category and share of total generation, rounded to one decimal.
    pub fn fuel_percentages(&self) -> Vec<(FuelCategory, f64)> {
        if self.total_mw <= 0.0 {
            return Vec::new();
        }
        self.fuel_breakdown()
            .into_iter()
            .map(|(fuel, mw)| (fuel, (mw / self.total_mw * 1000.0).round() / 10.0))
            .collect()
    }

    /// JSON object form of the breakdown, for the intensity row's
    /// `fuel_breakdown_json` column.
    pub fn breakdown_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (fuel, mw) in self.fuel_breakdown() {
            map.insert(fuel.as_label().to_string(), json!(mw));
        }
        serde_json::Value::Object(map)
    }
}
