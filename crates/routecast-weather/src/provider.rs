//! Upstream forecast sources.
//!
//! `OpenMeteoSource` talks to an Open-Meteo compatible `/v1/forecast`
//! endpoint. Free, no API key required.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, DurationRound, NaiveDateTime, TimeDelta, Utc};
use reqwest::{Client, StatusCode};
use routecast_core::{Coordinate, ReqwestErrorExt, WeatherConfig, WeatherError};
use serde::Deserialize;
use tracing::instrument;
use url::Url;

use crate::types::ForecastSample;

const USER_AGENT: &str = "Routecast/0.1.0";
const HOURLY_VARIABLES: &str = "temperature_2m,precipitation_probability,wind_speed_10m,weather_code";
const HOUR_FORMAT: &str = "%Y-%m-%dT%H:%M";

/// A black-box provider of point forecasts.
#[async_trait]
pub trait ForecastSource: Send + Sync {
    /// Forecast for `coordinate` at instant `at`.
    async fn fetch(
        &self,
        coordinate: Coordinate,
        at: DateTime<Utc>,
    ) -> Result<ForecastSample, WeatherError>;
}

#[derive(Debug, Deserialize)]
struct OpenMeteoResponse {
    hourly: Option<OpenMeteoHourly>,
}

#[derive(Debug, Deserialize)]
struct OpenMeteoHourly {
    time: Vec<String>,
    temperature_2m: Vec<Option<f64>>,
    precipitation_probability: Vec<Option<f64>>,
    wind_speed_10m: Vec<Option<f64>>,
    weather_code: Vec<Option<i32>>,
}

/// Open-Meteo hourly forecast client.
#[derive(Debug, Clone)]
pub struct OpenMeteoSource {
    client: Client,
    base_url: String,
}

impl OpenMeteoSource {
    pub fn new(config: &WeatherConfig) -> Result<Self, WeatherError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| WeatherError::Unavailable(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn request_url(
        &self,
        coordinate: Coordinate,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Url, WeatherError> {
        let start_hour = start.format(HOUR_FORMAT).to_string();
        let end_hour = end.format(HOUR_FORMAT).to_string();
        Url::parse_with_params(
            &format!("{}/v1/forecast", self.base_url),
            &[
                ("latitude", coordinate.latitude().to_string()),
                ("longitude", coordinate.longitude().to_string()),
                ("hourly", HOURLY_VARIABLES.to_string()),
                ("timezone", "UTC".to_string()),
                ("wind_speed_unit", "kmh".to_string()),
                ("start_hour", start_hour),
                ("end_hour", end_hour),
            ],
        )
        .map_err(|e| WeatherError::InvalidResponse(format!("invalid forecast URL: {}", e)))
    }
}

#[async_trait]
impl ForecastSource for OpenMeteoSource {
    #[instrument(skip(self), level = "debug")]
    async fn fetch(
        &self,
        coordinate: Coordinate,
        at: DateTime<Utc>,
    ) -> Result<ForecastSample, WeatherError> {
        let start = at
            .duration_trunc(TimeDelta::hours(1))
            .map_err(|e| WeatherError::InvalidResponse(format!("bad timestamp {}: {}", at, e)))?;
        let end = start + TimeDelta::hours(1);
        let url = self.request_url(coordinate, start, end)?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| WeatherError::from(e.into_network_error()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            tracing::warn!("Open-Meteo rate limited (retry after {:?}s)", retry_after_secs);
            return Err(WeatherError::RateLimited { retry_after_secs });
        }
        if status.is_server_error() {
            return Err(WeatherError::Unavailable(format!("upstream returned {}", status)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(WeatherError::InvalidResponse(format!("{} - {}", status, body)));
        }

        let body: OpenMeteoResponse = response
            .json()
            .await
            .map_err(|e| WeatherError::from(e.into_network_error()))?;

        let hourly = body
            .hourly
            .ok_or_else(|| WeatherError::InvalidResponse("missing hourly block".to_string()))?;
        let samples = parse_hourly(coordinate, &hourly)?;
        pick_sample(&samples, at)
    }
}

/// Turn the column-oriented hourly block into samples, skipping hours with gaps.
fn parse_hourly(
    coordinate: Coordinate,
    hourly: &OpenMeteoHourly,
) -> Result<Vec<ForecastSample>, WeatherError> {
    let len = hourly.time.len();
    if hourly.temperature_2m.len() != len
        || hourly.precipitation_probability.len() != len
        || hourly.wind_speed_10m.len() != len
        || hourly.weather_code.len() != len
    {
        return Err(WeatherError::InvalidResponse(
            "hourly columns have mismatched lengths".to_string(),
        ));
    }

    let mut samples = Vec::with_capacity(len);
    for i in 0..len {
        let time = NaiveDateTime::parse_from_str(&hourly.time[i], HOUR_FORMAT)
            .map_err(|_| WeatherError::InvalidResponse(format!("bad hour '{}'", hourly.time[i])))?
            .and_utc();

        let (Some(temp), Some(precip), Some(wind), Some(code)) = (
            hourly.temperature_2m[i],
            hourly.precipitation_probability[i],
            hourly.wind_speed_10m[i],
            hourly.weather_code[i],
        ) else {
            tracing::debug!("Skipping incomplete hour {}", hourly.time[i]);
            continue;
        };

        samples.push(ForecastSample::new(coordinate, time, temp, precip, wind, code));
    }
    Ok(samples)
}

/// Pick or interpolate the sample for `at` from time-ordered hourly samples.
fn pick_sample(
    samples: &[ForecastSample],
    at: DateTime<Utc>,
) -> Result<ForecastSample, WeatherError> {
    let after_idx = samples.partition_point(|s| s.timestamp < at);

    match (after_idx.checked_sub(1).and_then(|i| samples.get(i)), samples.get(after_idx)) {
        (_, Some(after)) if after.timestamp == at => Ok(ForecastSample {
            timestamp: at,
            ..after.clone()
        }),
        (Some(before), Some(after)) => Ok(ForecastSample::interpolate(before, after, at)),
        _ => Err(WeatherError::InvalidResponse(format!(
            "no hourly data covering {}",
            at
        ))),
    }
}
