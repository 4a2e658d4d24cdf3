//! Shared foundations for Routecast: coordinates, configuration, the error
//! taxonomy and logging setup.

pub mod config;
pub mod error;
pub mod geo;

pub use config::{
    Config, PredictionConfig, RiskThresholds, RoutingBackend, RoutingConfig, ValidationResult,
    WeatherConfig,
};
pub use error::{
    AppError, ConfigError, MapError, NetworkError, ReqwestErrorExt, WeatherError,
};
pub use geo::{Coordinate, CoordinateError};

use anyhow::Result;

/// Initialize tracing/logging
pub fn init() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {}", e))?;

    tracing::info!("Routecast core initialized");
    Ok(())
}
