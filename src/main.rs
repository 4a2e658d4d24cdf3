//! Routecast: weather along a driving route.
//!
//! Resolves a route, samples it at a fixed interval, fetches forecasts for
//! the estimated arrival time at each sample and prints the risk segments.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use clap::Parser;
use routecast_core::{AppError, Config, Coordinate};
use routecast_predictor::{RouteForecast, RoutePlanner, RouteRequest};

/// Route weather prediction
#[derive(Parser)]
#[command(name = "routecast", about = "Weather risk along a driving route")]
struct Cli {
    /// Origin as "lat,lon"
    #[arg(long, allow_hyphen_values = true)]
    from: Coordinate,

    /// Destination as "lat,lon"
    #[arg(long, allow_hyphen_values = true)]
    to: Coordinate,

    /// Departure time (RFC 3339), defaults to now
    #[arg(long)]
    depart: Option<DateTime<Utc>>,

    /// Config file, defaults to the user config directory
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print the full forecast as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    routecast_core::init()?;

    let (config, _) = Config::load_validated(cli.config.as_deref())?;
    let planner = RoutePlanner::new(&config)?;

    let request = RouteRequest {
        origin: cli.from,
        destination: cli.to,
        departure: cli.depart.unwrap_or_else(Utc::now),
    };
    tracing::info!("Predicting {} -> {}", request.origin, request.destination);

    let forecast = match planner.session().predict(request).await {
        Ok(forecast) => forecast,
        Err(e) => {
            let app: AppError = e.into();
            eprintln!("{}", app.user_message());
            return Err(anyhow::Error::new(app).context("Prediction failed"));
        }
    };

    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&forecast).context("Failed to serialize forecast")?
        );
    } else {
        print_forecast(&forecast);
    }

    Ok(())
}

fn print_forecast(forecast: &RouteForecast) {
    let route = &forecast.route;
    let summary = &forecast.summary;

    println!(
        "Route: {:.1} km, {} min, departing {}",
        route.total_distance_m() / 1000.0,
        route.total_duration().num_minutes(),
        route.origin().eta.to_rfc3339_opts(SecondsFormat::Secs, true)
    );
    println!(
        "Worst risk: {} ({} samples, max rain {:.0}%, max wind {:.0} km/h)",
        summary.worst_risk,
        summary.sample_count,
        summary.max_precipitation_probability,
        summary.max_wind_speed_kmh
    );
    if let Some((lo, hi)) = summary.temperature_range_c {
        println!("Temperature: {:.1} to {:.1} °C", lo, hi);
    }
    println!();

    for segment in &forecast.segments {
        match segment.span {
            Some(span) => println!(
                "  {:>8}  km {:>6.1} - {:>6.1}  {} - {}",
                segment.risk,
                span.start_distance_m / 1000.0,
                span.end_distance_m / 1000.0,
                span.start_time.format("%H:%M"),
                span.end_time.format("%H:%M")
            ),
            None => println!(
                "  {:>8}  samples {} - {}",
                segment.risk, segment.start_index, segment.end_index
            ),
        }
    }
}
