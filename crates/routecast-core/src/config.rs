use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use url::Url;

use crate::error::ConfigError;

/// Configuration validation errors
#[derive(Debug, Clone)]
pub struct ConfigValidationError {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Result of config validation
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<ConfigValidationError>,
    pub warnings: Vec<ConfigValidationError>,
}

impl ValidationResult {
    /// Returns true if there are no errors (warnings are OK)
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Add an error
    pub fn add_error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ConfigValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Add a warning
    pub fn add_warning(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(ConfigValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Get a user-friendly message summarizing all errors
    pub fn error_summary(&self) -> String {
        if self.errors.is_empty() {
            return String::new();
        }
        self.errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Convert into a `ConfigError` when there are errors, logging warnings.
    pub fn into_result(self) -> Result<Vec<ConfigValidationError>, ConfigError> {
        if !self.is_valid() {
            return Err(ConfigError::Invalid(self.error_summary()));
        }
        for warning in &self.warnings {
            tracing::warn!("Config warning: {}", warning);
        }
        Ok(self.warnings)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Application configuration directory
    pub config_dir: PathBuf,

    /// Sampling, risk and cache settings for route prediction
    #[serde(default)]
    pub prediction: PredictionConfig,

    /// Upstream weather provider settings
    #[serde(default)]
    pub weather: WeatherConfig,

    /// Upstream routing provider settings
    #[serde(default)]
    pub routing: RoutingConfig,
}

/// Precipitation/wind cutoffs for the risk bands.
///
/// A value exactly at a cutoff belongs to the higher band.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RiskThresholds {
    /// Precipitation probability (%) at or above which risk is Moderate
    #[serde(alias = "moderatePrecipitationPct")]
    pub moderate_precipitation_pct: f64,
    /// Precipitation probability (%) at or above which risk is Severe
    #[serde(alias = "severePrecipitationPct")]
    pub severe_precipitation_pct: f64,
    /// Wind speed (km/h) at or above which risk is Moderate
    #[serde(alias = "moderateWindKmh")]
    pub moderate_wind_kmh: f64,
    /// Wind speed (km/h) at or above which risk is Severe
    #[serde(alias = "severeWindKmh")]
    pub severe_wind_kmh: f64,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            moderate_precipitation_pct: 40.0,
            severe_precipitation_pct: 70.0,
            moderate_wind_kmh: 40.0,
            severe_wind_kmh: 65.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PredictionConfig {
    /// Distance between weather samples along the route
    #[serde(default = "default_sample_interval", alias = "sampleIntervalMeters")]
    pub sample_interval_meters: f64,

    /// How long a cached forecast counts as fresh
    #[serde(default = "default_cache_ttl", alias = "cacheTtlSeconds")]
    pub cache_ttl_seconds: u64,

    /// How long an expired forecast is kept as a fallback
    #[serde(default = "default_stale_retention", alias = "staleRetentionSeconds")]
    pub stale_retention_seconds: u64,

    /// Upper bound on concurrent forecast lookups per prediction run
    #[serde(default = "default_max_concurrent", alias = "maxConcurrentFetches")]
    pub max_concurrent_fetches: usize,

    /// Cache grid cell size
    #[serde(default = "default_grid_resolution", alias = "gridResolutionMeters")]
    pub grid_resolution_meters: f64,

    /// Cache time bucket width
    #[serde(default = "default_time_bucket", alias = "timeBucketSeconds")]
    pub time_bucket_seconds: i64,

    /// Risk band cutoffs
    #[serde(default, alias = "riskThresholds")]
    pub risk_thresholds: RiskThresholds,
}

fn default_sample_interval() -> f64 {
    10_000.0
}

fn default_cache_ttl() -> u64 {
    30 * 60
}

fn default_stale_retention() -> u64 {
    6 * 60 * 60
}

fn default_max_concurrent() -> usize {
    4
}

fn default_grid_resolution() -> f64 {
    2_000.0
}

fn default_time_bucket() -> i64 {
    3_600
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            sample_interval_meters: default_sample_interval(),
            risk_thresholds: RiskThresholds::default(),
            cache_ttl_seconds: default_cache_ttl(),
            stale_retention_seconds: default_stale_retention(),
            max_concurrent_fetches: default_max_concurrent(),
            grid_resolution_meters: default_grid_resolution(),
            time_bucket_seconds: default_time_bucket(),
        }
    }
}

impl PredictionConfig {
    fn validate_into(&self, result: &mut ValidationResult) {
        if !self.sample_interval_meters.is_finite() || self.sample_interval_meters <= 0.0 {
            result.add_error(
                "prediction.sample_interval_meters",
                "Sample interval must be a positive distance",
            );
        } else if self.sample_interval_meters < 500.0 {
            result.add_warning(
                "prediction.sample_interval_meters",
                "Sample interval under 500 m will issue many weather lookups",
            );
        }

        let t = &self.risk_thresholds;
        let all_finite = [
            t.moderate_precipitation_pct,
            t.severe_precipitation_pct,
            t.moderate_wind_kmh,
            t.severe_wind_kmh,
        ]
        .iter()
        .all(|v| v.is_finite() && *v >= 0.0);
        if !all_finite {
            result.add_error(
                "prediction.risk_thresholds",
                "Thresholds must be finite, non-negative numbers",
            );
        } else {
            if t.severe_precipitation_pct > 100.0 {
                result.add_error(
                    "prediction.risk_thresholds.severe_precipitation_pct",
                    "Precipitation probability cannot exceed 100%",
                );
            }
            if t.moderate_precipitation_pct > t.severe_precipitation_pct {
                result.add_error(
                    "prediction.risk_thresholds",
                    "Moderate precipitation cutoff must not exceed the severe cutoff",
                );
            }
            if t.moderate_wind_kmh > t.severe_wind_kmh {
                result.add_error(
                    "prediction.risk_thresholds",
                    "Moderate wind cutoff must not exceed the severe cutoff",
                );
            }
        }

        if self.cache_ttl_seconds == 0 {
            result.add_warning(
                "prediction.cache_ttl_seconds",
                "Forecast caching disabled (0 seconds)",
            );
        } else if self.cache_ttl_seconds > 24 * 60 * 60 {
            result.add_warning(
                "prediction.cache_ttl_seconds",
                "Cached forecasts stay fresh for more than 24 hours",
            );
        }

        if self.max_concurrent_fetches == 0 {
            result.add_error(
                "prediction.max_concurrent_fetches",
                "At least one concurrent fetch is required",
            );
        } else if self.max_concurrent_fetches > 64 {
            result.add_warning(
                "prediction.max_concurrent_fetches",
                "More than 64 concurrent fetches is likely to hit provider rate limits",
            );
        }

        if !self.grid_resolution_meters.is_finite() || self.grid_resolution_meters <= 0.0 {
            result.add_error(
                "prediction.grid_resolution_meters",
                "Grid resolution must be a positive distance",
            );
        }

        if self.time_bucket_seconds <= 0 {
            result.add_error(
                "prediction.time_bucket_seconds",
                "Time bucket must be at least one second",
            );
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WeatherConfig {
    /// Base URL of the Open-Meteo compatible forecast API
    pub base_url: String,

    /// Timeout for a single upstream call
    pub request_timeout_secs: u64,

    /// Retries after the first attempt for transient failures
    pub max_retries: u32,

    /// First backoff delay; doubles each retry
    pub initial_backoff_ms: u64,

    /// Upper bound on a single backoff delay
    pub max_backoff_ms: u64,
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.open-meteo.com".to_string(),
            request_timeout_secs: 10,
            max_retries: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
        }
    }
}

/// Which routing backend resolves routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RoutingBackend {
    /// OSRM compatible HTTP routing service
    #[default]
    Osrm,
    /// Offline great-circle route at a constant speed
    Direct,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RoutingConfig {
    pub backend: RoutingBackend,

    /// Base URL of the OSRM compatible routing API
    pub base_url: String,

    /// OSRM profile (driving, cycling, foot)
    pub profile: String,

    /// Timeout for a single routing call
    pub request_timeout_secs: u64,

    /// Travel speed assumed by the direct backend
    pub direct_speed_kmh: f64,

    /// Point spacing for the direct backend
    pub direct_step_meters: f64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            backend: RoutingBackend::Osrm,
            base_url: "https://router.project-osrm.org".to_string(),
            profile: "driving".to_string(),
            request_timeout_secs: 15,
            direct_speed_kmh: 80.0,
            direct_step_meters: 1_000.0,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("routecast");

        Self {
            config_dir,
            prediction: PredictionConfig::default(),
            weather: WeatherConfig::default(),
            routing: RoutingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the default location, creating it if missing
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        Self::load_from(&config_path)
    }

    /// Load configuration from a specific file, creating a default one if it doesn't exist
    pub fn load_from(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            let mut config = Self::default();
            if let Some(parent) = config_path.parent() {
                config.config_dir = parent.to_path_buf();
            }
            config.save_to(config_path)?;
            tracing::info!("Created default config at {}", config_path.display());
            return Ok(config);
        }

        let contents = std::fs::read_to_string(config_path)
            .context("Failed to read config file")?;

        let config: Config = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseError(e.to_string()))
            .context("Failed to parse config file")?;

        Ok(config)
    }

    /// Load configuration and validate it
    ///
    /// Returns the config along with any validation warnings.
    /// Returns an error if validation fails with critical errors.
    pub fn load_validated(path: Option<&Path>) -> Result<(Self, ValidationResult)> {
        let config = match path {
            Some(p) => Self::load_from(p)?,
            None => Self::load()?,
        };
        let validation = config.validate();

        if !validation.is_valid() {
            anyhow::bail!(
                "Configuration validation failed: {}",
                validation.error_summary()
            );
        }

        for warning in &validation.warnings {
            tracing::warn!("Config warning: {}", warning);
        }

        Ok((config, validation))
    }

    /// Validate the configuration
    ///
    /// Returns a ValidationResult containing any errors or warnings.
    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        self.prediction.validate_into(&mut result);

        self.validate_url(&self.weather.base_url, "weather.base_url", &mut result);
        if self.weather.request_timeout_secs == 0 {
            result.add_error(
                "weather.request_timeout_secs",
                "Every weather call needs a timeout greater than 0",
            );
        }
        if self.weather.max_retries > 10 {
            result.add_warning("weather.max_retries", "More than 10 retries per lookup");
        }
        if self.weather.initial_backoff_ms > self.weather.max_backoff_ms {
            result.add_error(
                "weather.initial_backoff_ms",
                "Initial backoff must not exceed max_backoff_ms",
            );
        }

        if self.routing.backend == RoutingBackend::Osrm {
            self.validate_url(&self.routing.base_url, "routing.base_url", &mut result);
            if self.routing.profile.trim().is_empty() {
                result.add_error("routing.profile", "Routing profile must not be empty");
            }
        }
        if self.routing.request_timeout_secs == 0 {
            result.add_error(
                "routing.request_timeout_secs",
                "Routing calls need a timeout greater than 0",
            );
        }
        if !self.routing.direct_speed_kmh.is_finite() || self.routing.direct_speed_kmh <= 0.0 {
            result.add_error("routing.direct_speed_kmh", "Speed must be positive");
        }
        if !self.routing.direct_step_meters.is_finite() || self.routing.direct_step_meters <= 0.0 {
            result.add_error("routing.direct_step_meters", "Step must be positive");
        }

        result
    }

    /// Validate a URL field
    fn validate_url(&self, url_str: &str, field_name: &str, result: &mut ValidationResult) {
        match Url::parse(url_str) {
            Ok(url) => {
                if url.scheme() != "http" && url.scheme() != "https" {
                    result.add_error(
                        field_name,
                        format!("URL must use http or https scheme, got: {}", url.scheme()),
                    );
                }

                if url.host().is_none() {
                    result.add_error(field_name, "URL must have a host");
                }

                if let Some(port) = url.port() {
                    if port == 0 {
                        result.add_error(field_name, "Port cannot be 0");
                    }
                }
            }
            Err(e) => {
                result.add_error(field_name, format!("Invalid URL: {}", e));
            }
        }
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;
        self.save_to(&config_path)
    }

    /// Save configuration to a specific file
    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        std::fs::write(config_path, contents)
            .context("Failed to write config file")?;

        Ok(())
    }

    /// Get the path to the configuration file
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("routecast");

        Ok(config_dir.join("config.toml"))
    }
}
