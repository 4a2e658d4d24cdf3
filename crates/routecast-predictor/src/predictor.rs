//! The prediction pipeline as an explicit state machine.
//!
//! `Idle -> Resolving -> Sampling -> Annotating -> Ready`, with `Error` as
//! the terminal state of a failed run. Each step can be driven on its own or
//! all at once through [`Predictor::run`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use routecast_core::{AppError, Coordinate, MapError, PredictionConfig, WeatherError};
use routecast_maps::{MapService, Progress, Route, RoutePoint};
use routecast_weather::{DataManager, ForecastSample, WeatherService};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::analysis::{Analysis, RiskSegment, RouteSummary};

/// What the caller asked for.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RouteRequest {
    pub origin: Coordinate,
    pub destination: Coordinate,
    pub departure: DateTime<Utc>,
}

/// Read-only result of a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RouteForecast {
    pub request: RouteRequest,
    pub route: Route,
    pub sample_points: Vec<RoutePoint>,
    /// One forecast per sample point, in route order
    pub forecasts: Vec<ForecastSample>,
    pub segments: Vec<RiskSegment>,
    pub summary: RouteSummary,
}

/// Observable pipeline phase, without payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub enum Phase {
    #[default]
    Idle,
    Resolving,
    Sampling,
    Annotating,
    Ready,
    Error,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Resolving => "resolving",
            Phase::Sampling => "sampling",
            Phase::Annotating => "annotating",
            Phase::Ready => "ready",
            Phase::Error => "error",
        };
        f.pad(name)
    }
}

#[derive(Debug, Clone, Default)]
pub enum PredictorState {
    #[default]
    Idle,
    Resolving(RouteRequest),
    Sampling {
        request: RouteRequest,
        route: Route,
    },
    Annotating {
        request: RouteRequest,
        route: Route,
        points: Vec<RoutePoint>,
    },
    Ready(RouteForecast),
    Error(PredictError),
}

impl PredictorState {
    pub fn phase(&self) -> Phase {
        match self {
            Self::Idle => Phase::Idle,
            Self::Resolving(_) => Phase::Resolving,
            Self::Sampling { .. } => Phase::Sampling,
            Self::Annotating { .. } => Phase::Annotating,
            Self::Ready(_) => Phase::Ready,
            Self::Error(_) => Phase::Error,
        }
    }
}

/// Why a run failed, tagged with the step that failed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PredictError {
    #[error("Resolving route failed: {0}")]
    Route(MapError),

    #[error("Sampling route failed: {0}")]
    Sampling(MapError),

    #[error("Forecast for sample {index} failed: {source}")]
    Forecast { index: usize, source: WeatherError },

    #[error("Prediction cancelled while {phase}")]
    Cancelled { phase: Phase },

    #[error("Cannot {step} while {state}")]
    InvalidTransition { step: &'static str, state: Phase },
}

impl PredictError {
    /// Phase the failure happened in.
    pub fn step(&self) -> Phase {
        match self {
            Self::Route(_) => Phase::Resolving,
            Self::Sampling(_) => Phase::Sampling,
            Self::Forecast { .. } => Phase::Annotating,
            Self::Cancelled { phase } => *phase,
            Self::InvalidTransition { state, .. } => *state,
        }
    }
}

impl From<PredictError> for AppError {
    fn from(e: PredictError) -> Self {
        match e {
            PredictError::Route(e) | PredictError::Sampling(e) => AppError::Route(e),
            PredictError::Forecast { source, .. } => AppError::Weather(source),
            PredictError::Cancelled { .. } => AppError::Cancelled,
            other @ PredictError::InvalidTransition { .. } => {
                AppError::Other(anyhow::anyhow!(other))
            }
        }
    }
}

/// Distances at which to sample a route of `total_m` meters.
///
/// Every `interval_m` from the origin, plus the end of the route.
pub fn sample_distances(total_m: f64, interval_m: f64) -> Vec<f64> {
    if !interval_m.is_finite() || interval_m <= 0.0 {
        return vec![0.0, total_m];
    }
    let mut distances = Vec::new();
    let mut i = 0u32;
    loop {
        let d = interval_m * f64::from(i);
        if d >= total_m {
            break;
        }
        distances.push(d);
        i += 1;
    }
    distances.push(total_m);
    distances
}

/// Drives one route request from resolution to risk segments.
pub struct Predictor {
    maps: MapService,
    weather: WeatherService,
    cache: Arc<DataManager>,
    analysis: Analysis,
    sample_interval_m: f64,
    max_concurrent_fetches: usize,
    state: PredictorState,
    phase: watch::Sender<Phase>,
}

impl std::fmt::Debug for Predictor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Predictor")
            .field("state", &self.state.phase())
            .field("sample_interval_m", &self.sample_interval_m)
            .field("max_concurrent_fetches", &self.max_concurrent_fetches)
            .finish_non_exhaustive()
    }
}

impl Predictor {
    pub fn new(
        maps: MapService,
        weather: WeatherService,
        cache: Arc<DataManager>,
        config: &PredictionConfig,
    ) -> Self {
        let (phase, _) = watch::channel(Phase::Idle);
        Self {
            maps,
            weather,
            cache,
            analysis: Analysis::new(config.risk_thresholds),
            sample_interval_m: config.sample_interval_meters,
            max_concurrent_fetches: config.max_concurrent_fetches.max(1),
            state: PredictorState::Idle,
            phase,
        }
    }

    pub fn state(&self) -> &PredictorState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    /// Receiver that sees every phase change.
    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    fn set_state(&mut self, state: PredictorState) {
        let phase = state.phase();
        self.state = state;
        tracing::info!("Predictor -> {}", phase);
        self.phase.send_replace(phase);
    }

    fn fail(&mut self, error: PredictError) -> PredictError {
        tracing::error!("Prediction failed: {}", error);
        self.set_state(PredictorState::Error(error.clone()));
        error
    }

    fn invalid(&self, step: &'static str) -> PredictError {
        PredictError::InvalidTransition {
            step,
            state: self.phase(),
        }
    }

    /// Accept a new request, discarding any finished or failed run.
    pub fn start(&mut self, request: RouteRequest) -> Result<(), PredictError> {
        match self.state {
            PredictorState::Idle | PredictorState::Ready(_) | PredictorState::Error(_) => {
                self.set_state(PredictorState::Resolving(request));
                Ok(())
            }
            _ => Err(self.invalid("start")),
        }
    }

    /// Resolving -> Sampling.
    pub async fn resolve(&mut self) -> Result<(), PredictError> {
        let PredictorState::Resolving(request) = self.state else {
            return Err(self.invalid("resolve"));
        };

        match self
            .maps
            .resolve_route(request.origin, request.destination, request.departure)
            .await
        {
            Ok(route) => {
                self.set_state(PredictorState::Sampling { request, route });
                Ok(())
            }
            Err(e) => Err(self.fail(PredictError::Route(e))),
        }
    }

    /// Sampling -> Annotating.
    pub fn sample(&mut self) -> Result<(), PredictError> {
        let PredictorState::Sampling { request, route } = &self.state else {
            return Err(self.invalid("sample"));
        };
        let (request, route) = (*request, route.clone());

        let points = sample_distances(route.total_distance_m(), self.sample_interval_m)
            .into_iter()
            .map(|d| self.maps.point_at_progress(&route, Progress::Distance(d)))
            .collect::<Result<Vec<_>, _>>();

        match points {
            Ok(points) => {
                tracing::debug!(
                    "Sampled {} points every {} m over {:.0} m",
                    points.len(),
                    self.sample_interval_m,
                    route.total_distance_m()
                );
                self.set_state(PredictorState::Annotating {
                    request,
                    route,
                    points,
                });
                Ok(())
            }
            Err(e) => Err(self.fail(PredictError::Sampling(e))),
        }
    }

    /// Annotating -> Ready.
    ///
    /// Looks up every sample point through the cache with bounded
    /// concurrency and restores route order before analysis.
    pub async fn annotate(&mut self) -> Result<RouteForecast, PredictError> {
        let PredictorState::Annotating { points, .. } = &self.state else {
            return Err(self.invalid("annotate"));
        };
        let points = points.clone();

        let cache = Arc::clone(&self.cache);
        let weather = self.weather.clone();
        let lookups = points.iter().copied().enumerate().map(|(index, point)| {
            let cache = Arc::clone(&cache);
            let weather = weather.clone();
            async move {
                let result = cache
                    .get_or_fetch(point.coordinate, point.eta, move |c, at| async move {
                        weather.get_forecast(c, at).await
                    })
                    .await;
                (index, result)
            }
        });

        let mut results =
            futures::stream::iter(lookups).buffer_unordered(self.max_concurrent_fetches);
        let mut forecasts: Vec<(usize, ForecastSample)> = Vec::with_capacity(points.len());
        let mut failure = None;
        while let Some((index, result)) = results.next().await {
            match result {
                Ok(sample) => forecasts.push((index, sample)),
                Err(source) => {
                    failure = Some(PredictError::Forecast { index, source });
                    break;
                }
            }
        }
        drop(results);

        if let Some(error) = failure {
            return Err(self.fail(error));
        }

        forecasts.sort_by_key(|(index, _)| *index);
        let forecasts: Vec<ForecastSample> = forecasts.into_iter().map(|(_, s)| s).collect();

        let PredictorState::Annotating {
            request,
            route,
            points,
        } = std::mem::take(&mut self.state)
        else {
            return Err(self.invalid("annotate"));
        };

        let segments = self
            .analysis
            .summarize_route(&points, &forecasts, route.total_distance_m());
        let summary = self.analysis.route_summary(&segments);
        let forecast = RouteForecast {
            request,
            route,
            sample_points: points,
            forecasts,
            segments,
            summary,
        };

        self.set_state(PredictorState::Ready(forecast.clone()));
        Ok(forecast)
    }

    /// Run every step for `request`, giving up when `cancel` fires.
    pub async fn run(
        &mut self,
        request: RouteRequest,
        cancel: &CancellationToken,
    ) -> Result<RouteForecast, PredictError> {
        self.start(request)?;

        let resolved = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            r = self.resolve() => Some(r),
        };
        match resolved {
            Some(r) => r?,
            None => return Err(self.cancelled()),
        }

        if cancel.is_cancelled() {
            return Err(self.cancelled());
        }
        self.sample()?;

        let annotated = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            r = self.annotate() => Some(r),
        };
        match annotated {
            Some(r) => r,
            None => Err(self.cancelled()),
        }
    }

    fn cancelled(&mut self) -> PredictError {
        let phase = self.phase();
        tracing::info!("Prediction cancelled while {}", phase);
        let error = PredictError::Cancelled { phase };
        self.set_state(PredictorState::Error(error.clone()));
        error
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{TimeDelta, TimeZone};
    use routecast_maps::{DirectSource, RouteSource};
    use routecast_weather::{CacheSettings, ForecastSource, RetryConfig};

    struct Fixed;

    #[async_trait]
    impl ForecastSource for Fixed {
        async fn fetch(
            &self,
            coordinate: Coordinate,
            at: DateTime<Utc>,
        ) -> Result<ForecastSample, WeatherError> {
            Ok(ForecastSample::new(coordinate, at, 20.0, 10.0, 5.0, 0))
        }
    }

    struct NoRoute;

    #[async_trait]
    impl RouteSource for NoRoute {
        async fn route(
            &self,
            _: Coordinate,
            _: Coordinate,
            _: DateTime<Utc>,
        ) -> Result<Route, MapError> {
            Err(MapError::RouteUnavailable("NoRoute".to_string()))
        }
    }

    fn predictor(route_source: Arc<dyn RouteSource>) -> Predictor {
        let config = PredictionConfig::default();
        Predictor::new(
            MapService::new(route_source),
            WeatherService::new(Arc::new(Fixed), RetryConfig::new(0, 1, 1), Duration::from_secs(5)),
            Arc::new(DataManager::new(CacheSettings::from(&config))),
            &config,
        )
    }

    fn request() -> RouteRequest {
        RouteRequest {
            origin: Coordinate::new(47.0, 8.0).unwrap(),
            destination: Coordinate::new(47.3, 8.3).unwrap(),
            departure: Utc.with_ymd_and_hms(2026, 10, 2, 7, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_sample_distances() {
        assert_eq!(sample_distances(25_000.0, 10_000.0), vec![0.0, 10_000.0, 20_000.0, 25_000.0]);
        assert_eq!(sample_distances(20_000.0, 10_000.0), vec![0.0, 10_000.0, 20_000.0]);
        assert_eq!(sample_distances(500.0, 10_000.0), vec![0.0, 500.0]);
        assert_eq!(sample_distances(500.0, 0.0), vec![0.0, 500.0]);
    }

    #[tokio::test]
    async fn test_steps_walk_through_states() {
        let mut p = predictor(Arc::new(DirectSource::new(80.0, 1000.0)));
        let mut phases = p.subscribe();
        assert_eq!(p.phase(), Phase::Idle);

        p.start(request()).unwrap();
        assert_eq!(*phases.borrow_and_update(), Phase::Resolving);
        p.resolve().await.unwrap();
        assert_eq!(p.phase(), Phase::Sampling);
        p.sample().unwrap();
        assert_eq!(p.phase(), Phase::Annotating);
        let forecast = p.annotate().await.unwrap();
        assert_eq!(*phases.borrow(), Phase::Ready);

        assert_eq!(forecast.forecasts.len(), forecast.sample_points.len());
        assert_eq!(forecast.sample_points[0].distance_m, 0.0);
        assert_eq!(
            forecast.sample_points.last().unwrap().distance_m,
            forecast.route.total_distance_m()
        );
        assert_eq!(forecast.segments.len(), 1);
    }

    #[tokio::test]
    async fn test_wrong_state_is_invalid_transition() {
        let mut p = predictor(Arc::new(DirectSource::new(80.0, 1000.0)));
        let err = p.resolve().await.unwrap_err();
        assert_eq!(
            err,
            PredictError::InvalidTransition {
                step: "resolve",
                state: Phase::Idle
            }
        );
        assert!(p.sample().is_err());
        assert!(p.annotate().await.is_err());
        assert_eq!(p.phase(), Phase::Idle);

        p.start(request()).unwrap();
        assert!(p.start(request()).is_err());
        assert_eq!(p.phase(), Phase::Resolving);
    }

    #[tokio::test]
    async fn test_route_failure_ends_in_error() {
        let mut p = predictor(Arc::new(NoRoute));
        let err = p.run(request(), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, PredictError::Route(MapError::RouteUnavailable(_))));
        assert_eq!(err.step(), Phase::Resolving);
        assert!(matches!(p.state(), PredictorState::Error(PredictError::Route(_))));
    }

    #[tokio::test]
    async fn test_rerun_after_ready_starts_over() {
        let mut p = predictor(Arc::new(DirectSource::new(80.0, 1000.0)));
        let cancel = CancellationToken::new();
        let first = p.run(request(), &cancel).await.unwrap();

        let later = RouteRequest {
            departure: request().departure + TimeDelta::hours(3),
            ..request()
        };
        let second = p.run(later, &cancel).await.unwrap();
        assert_eq!(p.phase(), Phase::Ready);
        assert_ne!(first.route.origin().eta, second.route.origin().eta);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_reports_cancelled() {
        let mut p = predictor(Arc::new(DirectSource::new(80.0, 1000.0)));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = p.run(request(), &cancel).await.unwrap_err();
        assert_eq!(err, PredictError::Cancelled { phase: Phase::Resolving });
        assert_eq!(p.phase(), Phase::Error);
    }

    #[test]
    fn test_into_app_error() {
        let app: AppError = PredictError::Cancelled { phase: Phase::Annotating }.into();
        assert!(matches!(app, AppError::Cancelled));
        let app: AppError = PredictError::Forecast {
            index: 2,
            source: WeatherError::RateLimited { retry_after_secs: None },
        }
        .into();
        assert!(matches!(app, AppError::Weather(WeatherError::RateLimited { .. })));
    }
}
