//! Routing for Routecast
//!
//! Resolves origin/destination pairs into validated routes with cumulative
//! distance and ETA per point, via OSRM or a straight-line fallback.

pub mod provider;
pub mod service;
pub mod types;

pub use provider::{DirectSource, OsrmSource, RouteSource};
pub use service::MapService;
pub use types::{Progress, Route, RoutePoint};
