//! Route resolution and positional queries along a route.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use routecast_core::{Coordinate, MapError, RoutingBackend, RoutingConfig};

use crate::provider::{DirectSource, OsrmSource, RouteSource};
use crate::types::{Progress, Route, RoutePoint};

/// Front for a `RouteSource`.
#[derive(Clone)]
pub struct MapService {
    source: Arc<dyn RouteSource>,
}

impl std::fmt::Debug for MapService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapService").finish_non_exhaustive()
    }
}

impl MapService {
    pub fn new(source: Arc<dyn RouteSource>) -> Self {
        Self { source }
    }

    /// Build the backend selected in the `[routing]` config section.
    pub fn from_config(config: &RoutingConfig) -> Result<Self, MapError> {
        let source: Arc<dyn RouteSource> = match config.backend {
            RoutingBackend::Osrm => Arc::new(OsrmSource::new(config)?),
            RoutingBackend::Direct => Arc::new(DirectSource::from_config(config)),
        };
        Ok(Self::new(source))
    }

    /// Resolve a route between two places.
    ///
    /// The provider's answer is re-checked so callers can rely on the route
    /// invariants no matter which backend produced it.
    pub async fn resolve_route(
        &self,
        origin: Coordinate,
        destination: Coordinate,
        departure: DateTime<Utc>,
    ) -> Result<Route, MapError> {
        tracing::debug!("Resolving route {} -> {} at {}", origin, destination, departure);
        let route = self.source.route(origin, destination, departure).await?;
        let route = Route::new(route.points().to_vec())?;
        tracing::info!(
            "Route resolved: {} points, {:.1} km, {} min",
            route.points().len(),
            route.total_distance_m() / 1000.0,
            route.total_duration().num_minutes()
        );
        Ok(route)
    }

    /// Position and ETA at `progress` along `route`.
    pub fn point_at_progress(
        &self,
        route: &Route,
        progress: Progress,
    ) -> Result<RoutePoint, MapError> {
        route.point_at(progress)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
    use super::*;
    use async_trait::async_trait;
    use chrono::{TimeDelta, TimeZone};

    struct Failing;

    #[async_trait]
    impl RouteSource for Failing {
        async fn route(
            &self,
            _: Coordinate,
            _: Coordinate,
            _: DateTime<Utc>,
        ) -> Result<Route, MapError> {
            Err(MapError::RouteUnavailable("NoRoute".to_string()))
        }
    }

    fn departure() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 7, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_resolve_route_with_direct_backend() {
        let service = MapService::from_config(&RoutingConfig {
            backend: RoutingBackend::Direct,
            ..RoutingConfig::default()
        })
        .unwrap();
        let origin = Coordinate::new(47.0, 8.0).unwrap();
        let destination = Coordinate::new(47.1, 8.1).unwrap();

        let route = service.resolve_route(origin, destination, departure()).await.unwrap();
        assert_eq!(route.origin().coordinate, origin);
        assert_eq!(route.origin().eta, departure());
        assert!(route.total_duration() > TimeDelta::zero());

        let mid = service.point_at_progress(&route, Progress::Fraction(0.5)).unwrap();
        assert!((mid.distance_m - route.total_distance_m() / 2.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_resolve_route_propagates_failure() {
        let service = MapService::new(Arc::new(Failing));
        let here = Coordinate::new(0.0, 0.0).unwrap();
        let err = service.resolve_route(here, here, departure()).await.unwrap_err();
        assert_eq!(err, MapError::RouteUnavailable("NoRoute".to_string()));
    }
}
