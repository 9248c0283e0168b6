//! JSON fixtures that seed the in-memory collaborators.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dispatch_core::config::ScoringWeights;
use dispatch_core::engine::Collaborators;
use dispatch_core::model::{Driver, NewTrip, ScheduledRide, Trip};
use dispatch_core::store::{
    DriverRegistry, InMemoryAuditLog, InMemoryDriverRegistry, InMemoryScheduledRideStore,
    InMemorySettingsStore, InMemoryTripStore, ScheduledRideStore, TripStore,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Fixture {
    /// Clock start for tick-driven runs; wall-clock time when absent.
    pub now: Option<DateTime<Utc>>,
    pub drivers: Vec<Driver>,
    /// Trips already stored, in any status.
    pub trips: Vec<Trip>,
    /// Passenger requests submitted through the engine at start-up.
    pub requests: Vec<NewTrip>,
    pub scheduled_rides: Vec<ScheduledRide>,
    /// Remote weight set; engine defaults apply when absent.
    pub weights: Option<ScoringWeights>,
}

impl Fixture {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read fixture '{}'", path.display()))?;
        Self::from_json_str(&raw)
            .with_context(|| format!("failed to parse fixture '{}'", path.display()))
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Fresh in-memory stores holding this fixture's rows.
    pub async fn seed(&self) -> Result<Collaborators> {
        let trips = Arc::new(InMemoryTripStore::new());
        let drivers = Arc::new(InMemoryDriverRegistry::new());
        let rides = Arc::new(InMemoryScheduledRideStore::new());
        let settings = Arc::new(match self.weights {
            Some(weights) => InMemorySettingsStore::with_weights(weights),
            None => InMemorySettingsStore::new(),
        });

        for driver in &self.drivers {
            drivers.upsert(driver.clone()).await?;
        }
        for trip in &self.trips {
            trips.insert(trip.clone()).await?;
        }
        for ride in &self.scheduled_rides {
            rides.insert(ride.clone()).await?;
        }

        Ok(Collaborators {
            trips,
            drivers,
            rides,
            audit: Arc::new(InMemoryAuditLog::new()),
            settings,
        })
    }
}
