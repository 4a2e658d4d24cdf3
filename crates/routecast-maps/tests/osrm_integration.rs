//! Integration tests for the OSRM source using wiremock.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use routecast_core::{Coordinate, MapError, RoutingConfig};
use routecast_maps::{MapService, OsrmSource, Progress};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config(server: &MockServer) -> RoutingConfig {
    RoutingConfig {
        base_url: server.uri(),
        request_timeout_secs: 2,
        ..RoutingConfig::default()
    }
}

fn departure() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 8, 14, 6, 30, 0).unwrap()
}

fn bern() -> Coordinate {
    Coordinate::new(46.948, 7.447).unwrap()
}

fn thun() -> Coordinate {
    Coordinate::new(46.758, 7.628).unwrap()
}

const ROUTE_PATH: &str = "/route/v1/driving/7.447,46.948;7.628,46.758";

#[tokio::test]
async fn test_route_from_annotated_response() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(ROUTE_PATH))
        .and(query_param("overview", "full"))
        .and(query_param("geometries", "geojson"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "code": "Ok",
            "routes": [{
                "distance": 30000.0,
                "duration": 1500.0,
                "geometry": {
                    "type": "LineString",
                    "coordinates": [[7.447, 46.948], [7.53, 46.85], [7.628, 46.758]]
                },
                "legs": [{
                    "annotation": {
                        "distance": [14000.0, 16000.0],
                        "duration": [600.0, 900.0]
                    }
                }]
            }],
            "waypoints": []
        })))
        .expect(1)
        .mount(&server)
        .await;

    let service = MapService::new(Arc::new(OsrmSource::new(&config(&server)).unwrap()));
    let route = service.resolve_route(bern(), thun(), departure()).await.unwrap();

    assert_eq!(route.points().len(), 3);
    assert_eq!(route.total_distance_m(), 30000.0);
    assert_eq!(route.origin().eta, departure());
    assert_eq!(route.destination().eta, departure() + TimeDelta::seconds(1500));

    let p = service
        .point_at_progress(&route, Progress::Distance(21000.0))
        .unwrap();
    // 7 km into a 16 km / 900 s edge
    let expected = departure() + TimeDelta::seconds(600) + TimeDelta::milliseconds(393_750);
    assert_eq!(p.eta, expected);
}

#[tokio::test]
async fn test_no_route_code_is_unavailable() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(ROUTE_PATH))
        .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
            "code": "NoRoute",
            "message": "Impossible route between points"
        })))
        .mount(&server)
        .await;

    let service = MapService::new(Arc::new(OsrmSource::new(&config(&server)).unwrap()));
    let err = service.resolve_route(bern(), thun(), departure()).await.unwrap_err();

    assert!(matches!(err, MapError::RouteUnavailable(ref m) if m.contains("NoRoute")));
}

#[tokio::test]
async fn test_server_error_is_unavailable() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(ROUTE_PATH))
        .respond_with(ResponseTemplate::new(502).set_body_string("Bad Gateway"))
        .mount(&server)
        .await;

    let service = MapService::new(Arc::new(OsrmSource::new(&config(&server)).unwrap()));
    let err = service.resolve_route(bern(), thun(), departure()).await.unwrap_err();

    assert!(matches!(err, MapError::RouteUnavailable(ref m) if m.contains("502")));
}

#[tokio::test]
async fn test_empty_routes_is_unavailable() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(ROUTE_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "code": "Ok",
            "routes": []
        })))
        .mount(&server)
        .await;

    let source = OsrmSource::new(&config(&server)).unwrap();
    let service = MapService::new(Arc::new(source));
    let err = service.resolve_route(bern(), thun(), departure()).await.unwrap_err();

    assert!(matches!(err, MapError::RouteUnavailable(_)));
}
