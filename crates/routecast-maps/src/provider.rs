//! Route providers.
//!
//! `OsrmSource` queries an OSRM-compatible `/route/v1` endpoint.
//! `DirectSource` draws a straight great-circle line at a fixed speed and
//! needs no network.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use reqwest::Client;
use routecast_core::{Coordinate, MapError, ReqwestErrorExt, RoutingConfig};
use serde::Deserialize;
use tracing::instrument;
use url::Url;

use crate::types::{Route, RoutePoint};

const USER_AGENT: &str = "Routecast/0.1.0";

/// A black-box provider of driving routes.
#[async_trait]
pub trait RouteSource: Send + Sync {
    /// Route from `origin` to `destination` leaving at `departure`.
    async fn route(
        &self,
        origin: Coordinate,
        destination: Coordinate,
        departure: DateTime<Utc>,
    ) -> Result<Route, MapError>;
}

#[derive(Debug, Deserialize)]
struct OsrmResponse {
    code: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    routes: Vec<OsrmRoute>,
}

#[derive(Debug, Deserialize)]
struct OsrmRoute {
    geometry: OsrmGeometry,
    #[serde(default)]
    legs: Vec<OsrmLeg>,
    duration: f64,
}

#[derive(Debug, Deserialize)]
struct OsrmGeometry {
    coordinates: Vec<[f64; 2]>,
}

#[derive(Debug, Deserialize)]
struct OsrmLeg {
    annotation: Option<OsrmAnnotation>,
}

#[derive(Debug, Default, Deserialize)]
struct OsrmAnnotation {
    #[serde(default)]
    distance: Vec<f64>,
    #[serde(default)]
    duration: Vec<f64>,
}

/// OSRM HTTP routing client.
#[derive(Debug, Clone)]
pub struct OsrmSource {
    client: Client,
    base_url: String,
    profile: String,
}

impl OsrmSource {
    pub fn new(config: &RoutingConfig) -> Result<Self, MapError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| {
                MapError::RouteUnavailable(format!("failed to build HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            profile: config.profile.clone(),
        })
    }

    fn request_url(&self, origin: Coordinate, destination: Coordinate) -> Result<Url, MapError> {
        // OSRM wants lon,lat order
        let waypoints = format!(
            "{},{};{},{}",
            origin.longitude(),
            origin.latitude(),
            destination.longitude(),
            destination.latitude()
        );
        Url::parse_with_params(
            &format!("{}/route/v1/{}/{}", self.base_url, self.profile, waypoints),
            &[
                ("overview", "full"),
                ("geometries", "geojson"),
                ("annotations", "distance,duration"),
            ],
        )
        .map_err(|e| MapError::RouteUnavailable(format!("invalid routing URL: {}", e)))
    }
}

#[async_trait]
impl RouteSource for OsrmSource {
    #[instrument(skip(self), level = "debug")]
    async fn route(
        &self,
        origin: Coordinate,
        destination: Coordinate,
        departure: DateTime<Utc>,
    ) -> Result<Route, MapError> {
        let url = self.request_url(origin, destination)?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| MapError::from(e.into_network_error()))?;

        let status = response.status();
        // OSRM reports NoRoute and friends as 400 with a JSON body
        let body: OsrmResponse = match response.json().await {
            Ok(body) => body,
            Err(e) if status.is_success() => {
                return Err(MapError::from(e.into_network_error()));
            }
            Err(_) => {
                return Err(MapError::RouteUnavailable(format!(
                    "routing provider returned {}",
                    status
                )));
            }
        };

        if body.code != "Ok" {
            let detail = body.message.unwrap_or_default();
            tracing::warn!("OSRM answered {} ({}): {}", body.code, status, detail);
            return Err(MapError::RouteUnavailable(if detail.is_empty() {
                body.code
            } else {
                format!("{}: {}", body.code, detail)
            }));
        }

        let route = body
            .routes
            .into_iter()
            .next()
            .ok_or_else(|| MapError::RouteUnavailable("no routes in response".to_string()))?;

        build_route(route, departure)
    }
}

/// Turn an OSRM route into validated points.
///
/// Per-edge annotations are used when they line up with the geometry;
/// otherwise edge lengths come from haversine and the total duration is
/// spread proportionally.
fn build_route(route: OsrmRoute, departure: DateTime<Utc>) -> Result<Route, MapError> {
    let coords = route
        .geometry
        .coordinates
        .iter()
        .map(|[lon, lat]| {
            Coordinate::new(*lat, *lon)
                .map_err(|e| MapError::RouteUnavailable(format!("bad geometry: {}", e)))
        })
        .collect::<Result<Vec<_>, _>>()?;

    if coords.len() < 2 {
        return Err(MapError::RouteUnavailable(
            "route geometry has fewer than two points".to_string(),
        ));
    }
    let edges = coords.len() - 1;

    let annotation = route.legs.into_iter().fold(OsrmAnnotation::default(), |mut acc, leg| {
        if let Some(a) = leg.annotation {
            acc.distance.extend(a.distance);
            acc.duration.extend(a.duration);
        }
        acc
    });

    let (distances, durations) =
        if annotation.distance.len() == edges && annotation.duration.len() == edges {
            (annotation.distance, annotation.duration)
        } else {
            tracing::debug!(
                "OSRM annotations do not match geometry ({} edges), estimating",
                edges
            );
            let distances: Vec<f64> = coords.windows(2).map(|w| w[0].distance_to(&w[1])).collect();
            let total: f64 = distances.iter().sum();
            let durations = distances
                .iter()
                .map(|d| if total > 0.0 { route.duration * d / total } else { 0.0 })
                .collect();
            (distances, durations)
        };

    let mut points = Vec::with_capacity(coords.len());
    points.push(RoutePoint {
        coordinate: coords[0],
        distance_m: 0.0,
        eta: departure,
    });
    let mut distance_m = 0.0;
    let mut elapsed_secs = 0.0;

    for (i, coordinate) in coords.iter().enumerate().skip(1) {
        distance_m += distances[i - 1].max(0.0);
        elapsed_secs += durations[i - 1].max(0.0);
        let eta = departure + TimeDelta::milliseconds((elapsed_secs * 1000.0).round() as i64);

        // Zero-length edges fold into the previous point. The origin keeps
        // the departure time; a wait there shows up at the next point.
        let at_origin = points.len() == 1;
        if let Some(last) = points.last_mut() {
            if distance_m <= last.distance_m {
                if !at_origin {
                    last.eta = eta;
                }
                continue;
            }
        }
        points.push(RoutePoint {
            coordinate: *coordinate,
            distance_m,
            eta,
        });
    }

    Route::new(points)
}

/// Straight-line routing at constant speed.
#[derive(Debug, Clone)]
pub struct DirectSource {
    speed_kmh: f64,
    step_m: f64,
}

impl DirectSource {
    pub fn new(speed_kmh: f64, step_m: f64) -> Self {
        Self { speed_kmh, step_m }
    }

    pub fn from_config(config: &RoutingConfig) -> Self {
        Self::new(config.direct_speed_kmh, config.direct_step_meters)
    }
}

#[async_trait]
impl RouteSource for DirectSource {
    async fn route(
        &self,
        origin: Coordinate,
        destination: Coordinate,
        departure: DateTime<Utc>,
    ) -> Result<Route, MapError> {
        let total = origin.distance_to(&destination);
        if total <= 0.0 {
            return Err(MapError::RouteUnavailable(
                "origin and destination are the same place".to_string(),
            ));
        }
        if self.speed_kmh <= 0.0 || self.step_m <= 0.0 {
            return Err(MapError::RouteUnavailable(
                "direct routing needs a positive speed and step".to_string(),
            ));
        }

        let steps = (total / self.step_m).ceil().max(1.0) as usize;
        let meters_per_sec = self.speed_kmh * 1000.0 / 3600.0;

        let points = (0..=steps)
            .map(|i| {
                let t = i as f64 / steps as f64;
                let distance_m = total * t;
                let elapsed_ms = (distance_m / meters_per_sec * 1000.0).round() as i64;
                RoutePoint {
                    coordinate: origin.interpolate(&destination, t),
                    distance_m,
                    eta: departure + TimeDelta::milliseconds(elapsed_ms),
                }
            })
            .collect();

        Route::new(points)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
    use super::*;
    use crate::types::Progress;
    use chrono::TimeZone;

    fn departure() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 7, 0, 0).unwrap()
    }

    fn osrm_route(
        coords: Vec<[f64; 2]>,
        annotation: Option<OsrmAnnotation>,
        duration: f64,
    ) -> OsrmRoute {
        OsrmRoute {
            geometry: OsrmGeometry { coordinates: coords },
            legs: vec![OsrmLeg { annotation }],
            duration,
        }
    }

    #[test]
    fn test_build_route_uses_annotations() {
        let route = build_route(
            osrm_route(
                vec![[8.0, 47.0], [8.01, 47.0], [8.02, 47.0]],
                Some(OsrmAnnotation {
                    distance: vec![800.0, 700.0],
                    duration: vec![60.0, 30.0],
                }),
                90.0,
            ),
            departure(),
        )
        .unwrap();

        let p = route.points();
        assert_eq!(p.len(), 3);
        assert_eq!(p[1].distance_m, 800.0);
        assert_eq!(route.total_distance_m(), 1500.0);
        assert_eq!(p[1].eta, departure() + TimeDelta::seconds(60));
        assert_eq!(route.total_duration(), TimeDelta::seconds(90));
    }

    #[test]
    fn test_build_route_merges_zero_length_edges() {
        let route = build_route(
            osrm_route(
                vec![[8.0, 47.0], [8.0, 47.0], [8.01, 47.0]],
                Some(OsrmAnnotation {
                    distance: vec![0.0, 760.0],
                    duration: vec![5.0, 40.0],
                }),
                45.0,
            ),
            departure(),
        )
        .unwrap();

        assert_eq!(route.points().len(), 2);
        assert_eq!(route.origin().eta, departure());
        assert_eq!(route.destination().eta, departure() + TimeDelta::seconds(45));
        assert_eq!(route.total_duration(), TimeDelta::seconds(45));
    }

    #[test]
    fn test_build_route_folds_trailing_zero_length_edge() {
        let route = build_route(
            osrm_route(
                vec![[8.0, 47.0], [8.01, 47.0], [8.01, 47.0]],
                Some(OsrmAnnotation {
                    distance: vec![760.0, 0.0],
                    duration: vec![40.0, 5.0],
                }),
                45.0,
            ),
            departure(),
        )
        .unwrap();

        assert_eq!(route.points().len(), 2);
        assert_eq!(route.origin().eta, departure());
        assert_eq!(route.total_duration(), TimeDelta::seconds(45));
    }

    #[test]
    fn test_build_route_estimates_without_annotations() {
        let route = build_route(
            osrm_route(vec![[0.0, 0.0], [0.1, 0.0], [0.3, 0.0]], None, 300.0),
            departure(),
        )
        .unwrap();

        let p = route.points();
        let first_share = p[1].distance_m / route.total_distance_m();
        assert!((first_share - 1.0 / 3.0).abs() < 1e-6);
        assert_eq!(p[1].eta, departure() + TimeDelta::seconds(100));
        assert_eq!(route.total_duration(), TimeDelta::seconds(300));
    }

    #[test]
    fn test_build_route_rejects_single_point() {
        let err = build_route(osrm_route(vec![[8.0, 47.0]], None, 0.0), departure()).unwrap_err();
        assert!(matches!(err, MapError::RouteUnavailable(_)));
    }

    #[test]
    fn test_request_url_orders_lon_lat() {
        let source = OsrmSource::new(&RoutingConfig {
            base_url: "http://localhost:5000/".to_string(),
            ..RoutingConfig::default()
        })
        .unwrap();
        let url = source
            .request_url(Coordinate::new(47.0, 8.0).unwrap(), Coordinate::new(46.0, 7.0).unwrap())
            .unwrap();
        assert_eq!(url.path(), "/route/v1/driving/8,47;7,46");
        assert!(url.query().unwrap().contains("geometries=geojson"));
    }

    #[tokio::test]
    async fn test_direct_route_densifies_and_times() {
        let source = DirectSource::new(36.0, 1000.0);
        let origin = Coordinate::new(0.0, 0.0).unwrap();
        let destination = Coordinate::new(0.0, 0.05).unwrap();
        let route = source.route(origin, destination, departure()).await.unwrap();

        let total = origin.distance_to(&destination);
        assert_eq!(route.points().len(), (total / 1000.0).ceil() as usize + 1);
        assert!((route.total_distance_m() - total).abs() < 1e-6);
        // 36 km/h is 10 m/s
        let expected_ms = (total / 10.0 * 1000.0).round() as i64;
        assert_eq!(route.total_duration(), TimeDelta::milliseconds(expected_ms));
        assert_eq!(route.destination().coordinate, destination);
    }

    #[tokio::test]
    async fn test_direct_route_crosses_antimeridian_the_short_way() {
        let origin = Coordinate::new(0.0, 179.9).unwrap();
        let destination = Coordinate::new(0.0, -179.9).unwrap();
        let route = DirectSource::new(80.0, 1000.0)
            .route(origin, destination, departure())
            .await
            .unwrap();

        assert!(route.total_distance_m() < 25_000.0);
        for p in route.points() {
            assert!(
                p.coordinate.longitude().abs() >= 179.9 - 1e-9,
                "off route at {}",
                p.coordinate
            );
        }
        for pair in route.points().windows(2) {
            let recorded = pair[1].distance_m - pair[0].distance_m;
            let actual = pair[0].coordinate.distance_to(&pair[1].coordinate);
            assert!((recorded - actual).abs() < 1.0, "recorded {} actual {}", recorded, actual);
        }

        let mid = route.point_at(Progress::Fraction(0.5)).unwrap();
        assert!((mid.coordinate.longitude().abs() - 180.0).abs() < 1e-6, "got {}", mid.coordinate);
    }

    #[tokio::test]
    async fn test_direct_route_rejects_same_place() {
        let here = Coordinate::new(10.0, 10.0).unwrap();
        let err = DirectSource::new(80.0, 1000.0)
            .route(here, here, departure())
            .await
            .unwrap_err();
        assert!(matches!(err, MapError::RouteUnavailable(_)));
    }
}
