mod fixture;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use clap::{Args, Parser, Subcommand};
use dispatch_core::clock::{Clock, ManualClock, SystemClock};
use dispatch_core::config::{DispatchConfig, ScoringWeights};
use dispatch_core::engine::DispatchEngine;
use dispatch_core::model::{DriverStatus, TripId, TripStatus};
use dispatch_core::scheduler::TickReport;
use dispatch_core::store::{DriverFilter, DriverRegistry, TripStore};
use dispatch_core::weights::{load_durable_copy, save_durable_copy};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use crate::fixture::Fixture;

// ── CLI definition ─────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "dispatchd",
    about = "Trip dispatch engine over in-memory stores",
    long_about = "Seeds the in-memory stores from a JSON fixture, submits its\n\
                  requests and drives the sweep scheduler."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit the fixture's requests and run the sweep scheduler
    Run {
        #[command(flatten)]
        source: Source,
        /// Run this many scheduler ticks on a simulated clock, then exit
        #[arg(long)]
        ticks: Option<u32>,
        /// Simulated seconds between ticks
        #[arg(long, default_value_t = 15)]
        tick_secs: i64,
    },
    /// Print the ranked candidate pool of a stored trip as JSON
    Rank {
        #[command(flatten)]
        source: Source,
        /// Trip id from the fixture
        #[arg(long)]
        trip: Uuid,
        /// Keep only the best N candidates
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Inspect or replace the durable copy of the scoring weights
    Weights {
        #[command(subcommand)]
        action: WeightsAction,
    },
}

#[derive(Args)]
struct Source {
    /// JSON fixture with drivers, trips and requests
    #[arg(long)]
    fixture: PathBuf,
    /// JSON engine config; defaults apply when absent
    #[arg(long, env = "DISPATCH_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum WeightsAction {
    /// Print the stored weight set, or the defaults when none is stored
    Show {
        #[arg(long)]
        fallback: PathBuf,
    },
    /// Overwrite individual weights and store the result
    Set {
        #[arg(long)]
        fallback: PathBuf,
        #[arg(long)]
        w_dist: Option<f64>,
        #[arg(long)]
        w_eta: Option<f64>,
        #[arg(long)]
        w_recency: Option<f64>,
        #[arg(long)]
        w_vehicle: Option<f64>,
        #[arg(long)]
        w_rating: Option<f64>,
    },
}

// ── Entry point ────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            source,
            ticks,
            tick_secs,
        } => run(&source, ticks, tick_secs).await,
        Commands::Rank {
            source,
            trip,
            limit,
        } => rank(&source, TripId(trip), limit).await,
        Commands::Weights { action } => weights(action),
    }
}

fn load_config(path: Option<&Path>) -> Result<DispatchConfig> {
    match path {
        Some(path) => Ok(DispatchConfig::from_json_file(path)?),
        None => Ok(DispatchConfig::default()),
    }
}

// ── Commands ───────────────────────────────────────────────────────

async fn run(source: &Source, ticks: Option<u32>, tick_secs: i64) -> Result<()> {
    if tick_secs <= 0 {
        bail!("--tick-secs must be positive");
    }
    let config = load_config(source.config.as_deref())?;
    let fixture = Fixture::from_json_file(&source.fixture)?;
    let collaborators = fixture.seed().await?;

    let manual = ticks.map(|_| Arc::new(ManualClock::new(fixture.now.unwrap_or_else(Utc::now))));
    let clock: Arc<dyn Clock> = match &manual {
        Some(manual) => manual.clone(),
        None => Arc::new(SystemClock),
    };
    let engine = DispatchEngine::new(config, collaborators, clock.clone());

    engine.refresh_weights().await;
    for request in &fixture.requests {
        match engine.submit_trip(request.clone()).await {
            Ok(submitted) if submitted.long_distance.is_long_distance() => {
                info!(trip_id = %submitted.trip.id, distance_km = submitted.trip.distance_km, "long-distance trip submitted");
            }
            Ok(submitted) if submitted.no_candidates() => {
                warn!(trip_id = %submitted.trip.id, "no driver found");
            }
            Ok(submitted) => {
                info!(trip_id = %submitted.trip.id, offers = submitted.offers.len(), "trip submitted");
            }
            Err(err) => warn!(error = %err, "{}", err.user_message()),
        }
    }

    let scheduler = engine.scheduler();
    match (ticks, manual) {
        (Some(ticks), Some(manual)) => {
            for _ in 0..ticks {
                let report = scheduler.tick(clock.now()).await;
                log_tick(&report);
                manual.advance(Duration::seconds(tick_secs));
            }
        }
        _ => {
            let cancel = CancellationToken::new();
            let stop = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("shutdown requested");
                }
                stop.cancel();
            });
            scheduler.run(cancel).await;
        }
    }

    print_summary(&engine).await
}

async fn rank(source: &Source, trip_id: TripId, limit: Option<usize>) -> Result<()> {
    let config = load_config(source.config.as_deref())?;
    let fixture = Fixture::from_json_file(&source.fixture)?;
    let collaborators = fixture.seed().await?;
    let clock: Arc<dyn Clock> = match fixture.now {
        Some(now) => Arc::new(ManualClock::new(now)),
        None => Arc::new(SystemClock),
    };
    let engine = DispatchEngine::new(config, collaborators, clock);
    engine.refresh_weights().await;

    let pool = engine
        .rank_trip(trip_id, limit)
        .await
        .with_context(|| format!("failed to rank trip {trip_id}"))?;
    let entries: Vec<_> = pool.candidates.iter().map(|c| c.to_pool_entry()).collect();
    println!("{}", serde_json::to_string_pretty(&entries)?);
    Ok(())
}

fn weights(action: WeightsAction) -> Result<()> {
    match action {
        WeightsAction::Show { fallback } => {
            let stored = load_durable_copy(&fallback)?;
            if stored.is_none() {
                info!(path = %fallback.display(), "no stored weights, showing defaults");
            }
            println!("{}", serde_json::to_string_pretty(&stored.unwrap_or_default())?);
        }
        WeightsAction::Set {
            fallback,
            w_dist,
            w_eta,
            w_recency,
            w_vehicle,
            w_rating,
        } => {
            let mut next: ScoringWeights = load_durable_copy(&fallback)?.unwrap_or_default();
            if let Some(value) = w_dist {
                next.distance = value;
            }
            if let Some(value) = w_eta {
                next.eta = value;
            }
            if let Some(value) = w_recency {
                next.recency = value;
            }
            if let Some(value) = w_vehicle {
                next.vehicle_mismatch = value;
            }
            if let Some(value) = w_rating {
                next.rating = value;
            }
            next.validate()?;
            save_durable_copy(&fallback, next)?;
            info!(path = %fallback.display(), "weights stored");
            println!("{}", serde_json::to_string_pretty(&next)?);
        }
    }
    Ok(())
}

// ── Reporting ──────────────────────────────────────────────────────

fn log_tick(report: &TickReport) {
    if report.is_idle() {
        return;
    }
    if let Some(reassign) = &report.reassignment {
        info!(
            examined = reassign.examined,
            reassigned = reassign.reassigned.len(),
            unassigned = reassign.unassigned.len(),
            no_candidates = reassign.no_candidates.len(),
            "reassignment sweep"
        );
    }
    if let Some(long) = &report.long_distance {
        info!(
            broadcast = long.broadcast.len(),
            auto_dispatched = long.auto_dispatched.len(),
            pending = long.pending.len(),
            "long-distance sweep"
        );
    }
    if let Some(scheduled) = &report.scheduled {
        info!(
            offered = scheduled.offered.len(),
            skipped_live = scheduled.skipped_live.len(),
            "scheduled-ride sweep"
        );
    }
}

async fn print_summary(engine: &DispatchEngine) -> Result<()> {
    let trips = &engine.collaborators().trips;
    println!("trips:");
    for status in [
        TripStatus::Requested,
        TripStatus::Accepted,
        TripStatus::InProgress,
        TripStatus::Completed,
        TripStatus::Cancelled,
    ] {
        let count = trips.list_by_status(status).await?.len();
        println!("  {:<12} {count}", serde_json::to_string(&status)?.trim_matches('"'));
    }

    let drivers = engine
        .collaborators()
        .drivers
        .list(&DriverFilter::default())
        .await?;
    println!("drivers:");
    for status in [
        DriverStatus::Idle,
        DriverStatus::Busy,
        DriverStatus::OnTrip,
        DriverStatus::BusyOverlay,
        DriverStatus::Offline,
    ] {
        let count = drivers.iter().filter(|d| d.status == status).count();
        println!("  {:<12} {count}", serde_json::to_string(&status)?.trim_matches('"'));
    }
    Ok(())
}
