//! Weather lookups with timeout, bounded retry and exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use routecast_core::{Coordinate, WeatherConfig, WeatherError};

use crate::provider::ForecastSource;
use crate::retry::{with_retry, RetryConfig};
use crate::types::ForecastSample;

/// Resilient front for a `ForecastSource`.
///
/// Does not deduplicate identical concurrent calls; that is the
/// `DataManager`'s job.
#[derive(Clone)]
pub struct WeatherService {
    source: Arc<dyn ForecastSource>,
    retry: RetryConfig,
    timeout: Duration,
}

impl std::fmt::Debug for WeatherService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeatherService")
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl WeatherService {
    pub fn new(source: Arc<dyn ForecastSource>, retry: RetryConfig, timeout: Duration) -> Self {
        Self {
            source,
            retry,
            timeout,
        }
    }

    /// Build from the `[weather]` config section.
    pub fn from_config(source: Arc<dyn ForecastSource>, config: &WeatherConfig) -> Self {
        Self::new(
            source,
            RetryConfig::from(config),
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    /// Forecast for a coordinate and instant.
    ///
    /// Each attempt is bounded by the configured timeout; an elapsed timeout
    /// counts as `WeatherError::Unavailable` and is retried like any other
    /// transient failure. `RateLimited` is returned immediately.
    pub async fn get_forecast(
        &self,
        coordinate: Coordinate,
        at: DateTime<Utc>,
    ) -> Result<ForecastSample, WeatherError> {
        with_retry(&self.retry, || {
            let source = Arc::clone(&self.source);
            let timeout = self.timeout;
            async move {
                match tokio::time::timeout(timeout, source.fetch(coordinate, at)).await {
                    Ok(result) => result,
                    Err(_) => {
                        tracing::warn!("Forecast for {} timed out after {:?}", coordinate, timeout);
                        Err(WeatherError::Unavailable(format!(
                            "timed out after {:?}",
                            timeout
                        )))
                    }
                }
            }
        })
        .await
    }
}
