//! Prediction pipeline for Routecast
//!
//! Resolves a route, samples it at a fixed interval, looks up forecasts
//! through the shared cache and groups the results into risk segments.

pub mod analysis;
pub mod predictor;
pub mod session;

pub use analysis::{Analysis, RiskLevel, RiskSegment, RouteSpan, RouteSummary};
pub use predictor::{
    sample_distances, Phase, PredictError, Predictor, PredictorState, RouteForecast, RouteRequest,
};
pub use session::{RoutePlanner, Session};
