//! Centralized error types for Routecast.
//!
//! This module provides a typed error hierarchy that:
//! - Separates transient upstream failures from fatal ones
//! - Provides user-friendly messages suitable for UI display
//! - Preserves full error context for debugging/logging
//!
//! Component errors are `Clone` so a single failure can be handed to every
//! caller waiting on the same coalesced fetch.

use thiserror::Error;

use crate::geo::CoordinateError;

/// Top-level application error type.
///
/// Use `user_message()` to get a UI-appropriate message.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Routing error: {0}")]
    Route(#[from] MapError),

    #[error("Weather service error: {0}")]
    Weather(#[from] WeatherError),

    #[error("Invalid coordinate: {0}")]
    Coordinate(#[from] CoordinateError),

    #[error("Prediction cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// Returns a user-friendly message suitable for display in the UI.
    pub fn user_message(&self) -> &'static str {
        match self {
            AppError::Network(e) => e.user_message(),
            AppError::Config(e) => e.user_message(),
            AppError::Route(e) => e.user_message(),
            AppError::Weather(e) => e.user_message(),
            AppError::Coordinate(_) => "That location is not a valid coordinate.",
            AppError::Cancelled => "The previous route request was replaced.",
            AppError::Io(_) => "A file operation failed. Please try again.",
            AppError::Other(_) => "An unexpected error occurred. Please try again.",
        }
    }
}

/// Network-related errors (HTTP, connectivity).
#[derive(Debug, Clone, Error)]
pub enum NetworkError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Server error: {status} - {message}")]
    ServerError { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl NetworkError {
    pub fn user_message(&self) -> &'static str {
        match self {
            NetworkError::ConnectionFailed(_) => {
                "Unable to connect. Check your internet connection."
            }
            NetworkError::Timeout => "The request timed out. Please try again.",
            NetworkError::ServerError { status, .. } if *status >= 500 => {
                "The server is experiencing issues. Please try again later."
            }
            NetworkError::ServerError { .. } => "The request failed. Please try again.",
            NetworkError::InvalidResponse(_) => {
                "Received an unexpected response. Please try again."
            }
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Configuration parse error: {0}")]
    ParseError(String),

    #[error("Missing required setting: {0}")]
    MissingSetting(String),
}

impl ConfigError {
    pub fn user_message(&self) -> &'static str {
        match self {
            ConfigError::NotFound(_) => "Configuration not found. Using defaults.",
            ConfigError::Invalid(_) => "Invalid configuration. Check your settings.",
            ConfigError::ParseError(_) => "Configuration file is malformed. Check your settings.",
            ConfigError::MissingSetting(_) => "A required setting is missing. Check your settings.",
        }
    }
}

/// Routing and route-geometry errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MapError {
    /// The routing provider failed or no path exists.
    #[error("Route unavailable: {0}")]
    RouteUnavailable(String),

    /// Progress outside the route bounds. Indicates a sampling bug.
    #[error("Progress {requested} outside route bounds [0, {limit}]")]
    OutOfRangeProgress { requested: f64, limit: f64 },
}

impl MapError {
    pub fn user_message(&self) -> &'static str {
        match self {
            MapError::RouteUnavailable(_) => {
                "No route could be found between those places."
            }
            MapError::OutOfRangeProgress { .. } => {
                "Something went wrong while sampling the route."
            }
        }
    }
}

/// Weather provider errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum WeatherError {
    /// Transient upstream failure, including timeouts.
    #[error("Weather unavailable: {0}")]
    Unavailable(String),

    /// Upstream quota exhausted.
    #[error("Weather provider rate limited{}", retry_suffix(.retry_after_secs))]
    RateLimited { retry_after_secs: Option<u64> },

    /// The provider answered with something we cannot use.
    #[error("Invalid weather response: {0}")]
    InvalidResponse(String),
}

impl WeatherError {
    pub fn user_message(&self) -> &'static str {
        match self {
            WeatherError::Unavailable(_) => {
                "Weather service unavailable. Please try again later."
            }
            WeatherError::RateLimited { .. } => {
                "Too many weather requests. Please wait a moment."
            }
            WeatherError::InvalidResponse(_) => "Weather service error. Please try again.",
        }
    }

    /// Whether the failure is worth retrying with backoff.
    ///
    /// Rate limiting is surfaced to the caller instead of retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, WeatherError::Unavailable(_))
    }
}

fn retry_suffix(retry_after_secs: &Option<u64>) -> String {
    retry_after_secs
        .map(|s| format!(" (retry after {}s)", s))
        .unwrap_or_default()
}

impl From<NetworkError> for WeatherError {
    fn from(e: NetworkError) -> Self {
        match e {
            NetworkError::InvalidResponse(msg) => WeatherError::InvalidResponse(msg),
            NetworkError::ServerError { status: 429, .. } => {
                WeatherError::RateLimited { retry_after_secs: None }
            }
            NetworkError::ServerError { status, message } if status < 500 => {
                WeatherError::InvalidResponse(format!("{} - {}", status, message))
            }
            other => WeatherError::Unavailable(other.to_string()),
        }
    }
}

impl From<NetworkError> for MapError {
    fn from(e: NetworkError) -> Self {
        MapError::RouteUnavailable(e.to_string())
    }
}

/// Extension trait for converting reqwest errors to our error types.
pub trait ReqwestErrorExt {
    fn into_network_error(self) -> NetworkError;
}

impl ReqwestErrorExt for reqwest::Error {
    fn into_network_error(self) -> NetworkError {
        if self.is_timeout() {
            NetworkError::Timeout
        } else if self.is_connect() {
            NetworkError::ConnectionFailed(self.to_string())
        } else if self.is_decode() {
            NetworkError::InvalidResponse(self.to_string())
        } else if let Some(status) = self.status() {
            NetworkError::ServerError {
                status: status.as_u16(),
                message: self.to_string(),
            }
        } else {
            NetworkError::ConnectionFailed(self.to_string())
        }
    }
}
