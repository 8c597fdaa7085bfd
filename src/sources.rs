//! Upstream data source adapters: NYISO real-time fuel mix CSV and
//! Open-Meteo hourly weather. Both are public, unauthenticated feeds.

pub mod nyiso;
pub mod weather;
