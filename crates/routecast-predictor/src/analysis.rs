//! Risk classification and aggregation of per-sample forecasts.

use chrono::{DateTime, Utc};
use routecast_core::RiskThresholds;
use routecast_maps::RoutePoint;
use routecast_weather::{ForecastSample, WeatherCondition};
use serde::{Deserialize, Serialize};

/// Weather risk band, ordered from least to most severe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RiskLevel {
    #[default]
    Low,
    Moderate,
    Severe,
}

impl RiskLevel {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Moderate => "moderate",
            Self::Severe => "severe",
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.label())
    }
}

/// Stretch of road a segment covers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RouteSpan {
    pub start_distance_m: f64,
    pub end_distance_m: f64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl RouteSpan {
    pub fn length_m(&self) -> f64 {
        self.end_distance_m - self.start_distance_m
    }
}

/// A maximal run of consecutive samples sharing one risk level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskSegment {
    pub risk: RiskLevel,
    /// Index of the first sample in the run
    pub start_index: usize,
    /// Index of the last sample in the run, inclusive
    pub end_index: usize,
    pub samples: Vec<ForecastSample>,
    /// Set when the segment was summarized along a route
    pub span: Option<RouteSpan>,
}

/// Route-level digest of the segments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteSummary {
    pub worst_risk: RiskLevel,
    pub low_distance_m: f64,
    pub moderate_distance_m: f64,
    pub severe_distance_m: f64,
    pub max_precipitation_probability: f64,
    pub max_wind_speed_kmh: f64,
    /// Coldest and warmest sampled temperature
    pub temperature_range_c: Option<(f64, f64)>,
    pub sample_count: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Analysis {
    thresholds: RiskThresholds,
}

impl Analysis {
    pub fn new(thresholds: RiskThresholds) -> Self {
        Self { thresholds }
    }

    /// Risk band for one sample.
    ///
    /// A value equal to a cutoff lands in the higher band. Some conditions
    /// raise the band regardless of the numbers.
    pub fn classify(&self, sample: &ForecastSample) -> RiskLevel {
        let t = &self.thresholds;
        let precip = sample.precipitation_probability;
        let wind = sample.wind_speed_kmh;

        let by_metrics = if precip >= t.severe_precipitation_pct || wind >= t.severe_wind_kmh {
            RiskLevel::Severe
        } else if precip >= t.moderate_precipitation_pct || wind >= t.moderate_wind_kmh {
            RiskLevel::Moderate
        } else {
            RiskLevel::Low
        };

        by_metrics.max(condition_floor(sample.condition()))
    }

    /// Group consecutive samples of equal risk into the fewest segments.
    pub fn summarize(&self, samples: &[ForecastSample]) -> Vec<RiskSegment> {
        let mut segments: Vec<RiskSegment> = Vec::new();

        for (index, sample) in samples.iter().enumerate() {
            let risk = self.classify(sample);
            match segments.last_mut() {
                Some(current) if current.risk == risk => {
                    current.end_index = index;
                    current.samples.push(sample.clone());
                }
                _ => segments.push(RiskSegment {
                    risk,
                    start_index: index,
                    end_index: index,
                    samples: vec![sample.clone()],
                    span: None,
                }),
            }
        }

        segments
    }

    /// Like `summarize`, with each segment tied to the stretch of road it covers.
    ///
    /// Every sample owns the road between the midpoints to its neighbours;
    /// the first starts at the route origin and the last ends at
    /// `total_distance_m`. `points[i]` is where `samples[i]` was taken;
    /// samples without a point are ignored.
    pub fn summarize_route(
        &self,
        points: &[RoutePoint],
        samples: &[ForecastSample],
        total_distance_m: f64,
    ) -> Vec<RiskSegment> {
        let n = points.len().min(samples.len());
        if n == 0 {
            return Vec::new();
        }
        let points = &points[..n];

        let mut segments = self.summarize(&samples[..n]);
        for segment in &mut segments {
            let (start_distance_m, start_time) = if segment.start_index == 0 {
                (0.0, points[0].eta)
            } else {
                midpoint(&points[segment.start_index - 1], &points[segment.start_index])
            };
            let (end_distance_m, end_time) = if segment.end_index == n - 1 {
                (total_distance_m, points[n - 1].eta)
            } else {
                midpoint(&points[segment.end_index], &points[segment.end_index + 1])
            };
            segment.span = Some(RouteSpan {
                start_distance_m,
                end_distance_m,
                start_time,
                end_time,
            });
        }
        segments
    }

    /// Aggregate figures over all segments.
    pub fn route_summary(&self, segments: &[RiskSegment]) -> RouteSummary {
        let mut summary = RouteSummary::default();

        for segment in segments {
            summary.worst_risk = summary.worst_risk.max(segment.risk);
            let length = segment.span.map(|s| s.length_m()).unwrap_or(0.0);
            match segment.risk {
                RiskLevel::Low => summary.low_distance_m += length,
                RiskLevel::Moderate => summary.moderate_distance_m += length,
                RiskLevel::Severe => summary.severe_distance_m += length,
            }

            for sample in &segment.samples {
                summary.sample_count += 1;
                summary.max_precipitation_probability =
                    summary.max_precipitation_probability.max(sample.precipitation_probability);
                summary.max_wind_speed_kmh = summary.max_wind_speed_kmh.max(sample.wind_speed_kmh);
                let t = sample.temperature_c;
                summary.temperature_range_c = Some(match summary.temperature_range_c {
                    Some((lo, hi)) => (lo.min(t), hi.max(t)),
                    None => (t, t),
                });
            }
        }
        summary
    }
}

/// Lowest band a condition allows.
fn condition_floor(condition: WeatherCondition) -> RiskLevel {
    match condition {
        WeatherCondition::Thunderstorm => RiskLevel::Severe,
        WeatherCondition::HeavyRain
        | WeatherCondition::Snow
        | WeatherCondition::Sleet
        | WeatherCondition::Fog => RiskLevel::Moderate,
        _ => RiskLevel::Low,
    }
}

fn midpoint(a: &RoutePoint, b: &RoutePoint) -> (f64, DateTime<Utc>) {
    ((a.distance_m + b.distance_m) / 2.0, a.eta + (b.eta - a.eta) / 2)
}
