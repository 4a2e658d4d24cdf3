//! Weather for Routecast
//!
//! Provides point forecasts via the Open-Meteo API, a resilient
//! `WeatherService` (timeout, retry, backoff) and the `DataManager`
//! forecast cache that coalesces concurrent lookups.

pub mod cache;
pub mod provider;
pub mod retry;
pub mod service;
pub mod types;

pub use cache::{CacheEntry, CacheKey, CacheSettings, CacheStats, DataManager, Quantizer};
pub use provider::{ForecastSource, OpenMeteoSource};
pub use retry::RetryConfig;
pub use service::WeatherService;
pub use types::*;
