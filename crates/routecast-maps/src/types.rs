use chrono::{DateTime, TimeDelta, Utc};
use routecast_core::{Coordinate, MapError};
use serde::{Deserialize, Serialize};

/// A position on a route with its cumulative distance and ETA.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RoutePoint {
    pub coordinate: Coordinate,
    /// Meters travelled from the route origin
    pub distance_m: f64,
    /// Estimated arrival time at this point
    pub eta: DateTime<Utc>,
}

/// How far along a route to look.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Progress {
    /// Share of the total distance, 0.0 to 1.0
    Fraction(f64),
    /// Meters from the origin
    Distance(f64),
}

/// An ordered, validated sequence of route points.
///
/// The first point sits at distance 0, distances strictly increase and ETAs
/// never decrease along the sequence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Route {
    points: Vec<RoutePoint>,
}

impl Route {
    /// Validate and wrap a point sequence.
    pub fn new(points: Vec<RoutePoint>) -> Result<Self, MapError> {
        if points.len() < 2 {
            return Err(MapError::RouteUnavailable(format!(
                "route needs at least two points, got {}",
                points.len()
            )));
        }
        if points[0].distance_m != 0.0 {
            return Err(MapError::RouteUnavailable(format!(
                "route must start at distance 0, starts at {}",
                points[0].distance_m
            )));
        }
        for (i, pair) in points.windows(2).enumerate() {
            let (a, b) = (&pair[0], &pair[1]);
            if !b.distance_m.is_finite() || b.distance_m <= a.distance_m {
                return Err(MapError::RouteUnavailable(format!(
                    "distance not strictly increasing at point {}",
                    i + 1
                )));
            }
            if b.eta < a.eta {
                return Err(MapError::RouteUnavailable(format!(
                    "arrival time decreases at point {}",
                    i + 1
                )));
            }
        }
        Ok(Self { points })
    }

    pub fn points(&self) -> &[RoutePoint] {
        &self.points
    }

    pub fn origin(&self) -> &RoutePoint {
        &self.points[0]
    }

    pub fn destination(&self) -> &RoutePoint {
        &self.points[self.points.len() - 1]
    }

    pub fn total_distance_m(&self) -> f64 {
        self.destination().distance_m
    }

    pub fn total_duration(&self) -> TimeDelta {
        self.destination().eta - self.origin().eta
    }

    /// Point at the given progress, interpolated between its bounding points.
    ///
    /// Position is interpolated linearly by distance; time assumes constant
    /// speed within the segment.
    pub fn point_at(&self, progress: Progress) -> Result<RoutePoint, MapError> {
        let total = self.total_distance_m();
        let distance = match progress {
            Progress::Fraction(f) => {
                if !f.is_finite() || !(0.0..=1.0).contains(&f) {
                    return Err(MapError::OutOfRangeProgress {
                        requested: f,
                        limit: 1.0,
                    });
                }
                f * total
            }
            Progress::Distance(d) => {
                if !d.is_finite() || !(0.0..=total).contains(&d) {
                    return Err(MapError::OutOfRangeProgress {
                        requested: d,
                        limit: total,
                    });
                }
                d
            }
        };

        // First point strictly beyond `distance`; its predecessor bounds from below.
        let upper = self
            .points
            .partition_point(|p| p.distance_m <= distance)
            .min(self.points.len() - 1);
        let lower = upper.saturating_sub(1);
        let (a, b) = (&self.points[lower], &self.points[upper]);

        if distance >= b.distance_m {
            return Ok(*b);
        }

        let span = b.distance_m - a.distance_m;
        let t = ((distance - a.distance_m) / span).clamp(0.0, 1.0);
        let segment_ms = (b.eta - a.eta).num_milliseconds() as f64;
        let eta = a.eta + TimeDelta::milliseconds((segment_ms * t).round() as i64);

        Ok(RoutePoint {
            coordinate: a.coordinate.interpolate(&b.coordinate, t),
            distance_m: distance,
            eta,
        })
    }
}
