use chrono::{DateTime, Utc};
use routecast_core::Coordinate;
use serde::{Deserialize, Serialize};

/// Weather condition categories mapped from WMO codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WeatherCondition {
    #[default]
    Clear,
    PartlyCloudy,
    Cloudy,
    Fog,
    Drizzle,
    Rain,
    HeavyRain,
    Snow,
    Sleet,
    Thunderstorm,
}

impl WeatherCondition {
    /// Convert WMO weather code to WeatherCondition
    /// See: https://open-meteo.com/en/docs#weathervariables
    pub fn from_wmo_code(code: i32) -> Self {
        match code {
            0 => Self::Clear,
            1..=2 => Self::PartlyCloudy,
            3 => Self::Cloudy,
            45 | 48 => Self::Fog,
            51 | 53 | 55 => Self::Drizzle,
            56 | 57 => Self::Sleet, // Freezing drizzle
            61 | 63 | 80 => Self::Rain,
            65 | 81 | 82 => Self::HeavyRain,
            66 | 67 => Self::Sleet, // Freezing rain
            71 | 73 | 75 | 77 | 85 | 86 => Self::Snow,
            95 | 96 | 99 => Self::Thunderstorm,
            _ => Self::Clear, // Unknown codes default to clear
        }
    }

    /// Get a human-readable description
    pub fn description(&self) -> &'static str {
        match self {
            Self::Clear => "Clear",
            Self::PartlyCloudy => "Partly Cloudy",
            Self::Cloudy => "Cloudy",
            Self::Fog => "Fog",
            Self::Drizzle => "Drizzle",
            Self::Rain => "Rain",
            Self::HeavyRain => "Heavy Rain",
            Self::Snow => "Snow",
            Self::Sleet => "Sleet",
            Self::Thunderstorm => "Thunderstorm",
        }
    }
}

/// Forecast for one coordinate at one instant.
///
/// Produced by a weather source and never modified afterwards; the cache
/// hands out clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastSample {
    pub coordinate: Coordinate,
    pub timestamp: DateTime<Utc>,
    /// Air temperature in °C
    pub temperature_c: f64,
    /// Chance of precipitation, 0-100
    pub precipitation_probability: f64,
    /// Wind speed at 10 m in km/h
    pub wind_speed_kmh: f64,
    /// Raw WMO weather code
    pub condition_code: i32,
}

impl ForecastSample {
    pub fn new(
        coordinate: Coordinate,
        timestamp: DateTime<Utc>,
        temperature_c: f64,
        precipitation_probability: f64,
        wind_speed_kmh: f64,
        condition_code: i32,
    ) -> Self {
        Self {
            coordinate,
            timestamp,
            temperature_c,
            precipitation_probability: precipitation_probability.clamp(0.0, 100.0),
            wind_speed_kmh: wind_speed_kmh.max(0.0),
            condition_code,
        }
    }

    pub fn condition(&self) -> WeatherCondition {
        WeatherCondition::from_wmo_code(self.condition_code)
    }

    /// Linearly interpolate metrics between two samples of the same place.
    ///
    /// The condition code is taken from whichever sample is closer in time.
    /// `at` outside `[before.timestamp, after.timestamp]` is clamped.
    pub fn interpolate(before: &ForecastSample, after: &ForecastSample, at: DateTime<Utc>) -> Self {
        let span = (after.timestamp - before.timestamp).num_milliseconds();
        let t = if span <= 0 {
            0.0
        } else {
            let offset = (at - before.timestamp).num_milliseconds();
            (offset as f64 / span as f64).clamp(0.0, 1.0)
        };
        let lerp = |a: f64, b: f64| a + (b - a) * t;

        Self {
            coordinate: before.coordinate,
            timestamp: at,
            temperature_c: lerp(before.temperature_c, after.temperature_c),
            precipitation_probability: lerp(
                before.precipitation_probability,
                after.precipitation_probability,
            ),
            wind_speed_kmh: lerp(before.wind_speed_kmh, after.wind_speed_kmh),
            condition_code: if t < 0.5 {
                before.condition_code
            } else {
                after.condition_code
            },
        }
    }
}
