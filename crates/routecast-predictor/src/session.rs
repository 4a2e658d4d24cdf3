//! Long-lived planner owning the shared services, and per-user sessions.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use routecast_core::{AppError, Config, PredictionConfig};
use routecast_maps::{MapService, RouteSource};
use routecast_weather::{
    CacheSettings, DataManager, ForecastSource, OpenMeteoSource, WeatherService,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::predictor::{Phase, PredictError, Predictor, RouteForecast, RouteRequest};

/// Owns the routing and weather services plus the one forecast cache.
#[derive(Debug, Clone)]
pub struct RoutePlanner {
    maps: MapService,
    weather: WeatherService,
    cache: Arc<DataManager>,
    prediction: PredictionConfig,
}

impl RoutePlanner {
    /// Validate `config` and build the configured backends.
    pub fn new(config: &Config) -> Result<Self, AppError> {
        config.validate().into_result()?;

        let maps = MapService::from_config(&config.routing)?;
        let forecasts: Arc<dyn ForecastSource> = Arc::new(OpenMeteoSource::new(&config.weather)?);
        let weather = WeatherService::from_config(forecasts, &config.weather);

        tracing::info!(
            "Route planner ready (routing: {:?}, sample every {} m)",
            config.routing.backend,
            config.prediction.sample_interval_meters
        );
        Ok(Self::from_parts(maps, weather, &config.prediction))
    }

    /// Build around caller-supplied sources.
    pub fn with_sources(
        routes: Arc<dyn RouteSource>,
        forecasts: Arc<dyn ForecastSource>,
        config: &Config,
    ) -> Self {
        Self::from_parts(
            MapService::new(routes),
            WeatherService::from_config(forecasts, &config.weather),
            &config.prediction,
        )
    }

    fn from_parts(
        maps: MapService,
        weather: WeatherService,
        prediction: &PredictionConfig,
    ) -> Self {
        Self {
            maps,
            weather,
            cache: Arc::new(DataManager::new(CacheSettings::from(prediction))),
            prediction: prediction.clone(),
        }
    }

    pub fn cache(&self) -> &Arc<DataManager> {
        &self.cache
    }

    /// A fresh predictor sharing this planner's cache.
    pub fn predictor(&self) -> Predictor {
        Predictor::new(
            self.maps.clone(),
            self.weather.clone(),
            Arc::clone(&self.cache),
            &self.prediction,
        )
    }

    pub fn session(&self) -> Session {
        Session {
            planner: self.clone(),
            current: Arc::new(Mutex::new(None)),
        }
    }

    /// Periodically drop cache entries past their stale window.
    pub fn spawn_sweeper(&self, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        self.cache.spawn_sweeper(period, cancel)
    }
}

#[derive(Debug)]
struct ActiveRun {
    cancel: CancellationToken,
    phase: watch::Receiver<Phase>,
}

/// One logical user session: at most one live run at a time.
#[derive(Debug, Clone)]
pub struct Session {
    planner: RoutePlanner,
    current: Arc<Mutex<Option<ActiveRun>>>,
}

impl Session {
    /// Predict weather along the requested route.
    ///
    /// Cancels the session's previous run if it is still going. Forecasts
    /// that run already cached stay in the shared cache.
    pub async fn predict(&self, request: RouteRequest) -> Result<RouteForecast, PredictError> {
        let mut predictor = self.planner.predictor();
        let cancel = CancellationToken::new();

        let previous = self.current.lock().replace(ActiveRun {
            cancel: cancel.clone(),
            phase: predictor.subscribe(),
        });
        if let Some(previous) = previous {
            tracing::debug!("Superseding previous run");
            previous.cancel.cancel();
        }

        predictor.run(request, &cancel).await
    }

    /// Phase of the latest run, `Idle` before the first one.
    pub fn phase(&self) -> watch::Receiver<Phase> {
        match self.current.lock().as_ref() {
            Some(run) => run.phase.clone(),
            None => watch::channel(Phase::Idle).1,
        }
    }

    /// Cancel the running prediction, if any.
    pub fn cancel(&self) {
        if let Some(run) = self.current.lock().as_ref() {
            run.cancel.cancel();
        }
    }
}
