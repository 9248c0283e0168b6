//! Collaborator contracts the engine reads from and writes to.
//!
//! Every cross-entity write is a conditional update evaluated atomically by the
//! implementation ("update where status = X"); there are no read-then-write
//! sequences on the engine side. [`memory`] provides in-process
//! implementations used by the runtime and the tests.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::ScoringWeights;
use crate::error::StoreError;
use crate::geo::{GeoPoint, SearchArea};
use crate::model::{
    Driver, DriverId, DriverStatus, ScheduledRide, ScheduledRideId, Trip, TripId, TripPatch,
    TripStamp, TripStatus,
};

pub use memory::{
    InMemoryAuditLog, InMemoryDriverRegistry, InMemoryScheduledRideStore, InMemorySettingsStore,
    InMemoryTripStore,
};

/// Result of a compare-and-swap write.
#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome<T> {
    /// The expectation held and the write was applied; carries the new value.
    Applied(T),
    /// The stored value no longer matched; carries what is stored now.
    Mismatch(T),
}

impl<T> CasOutcome<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, CasOutcome::Applied(_))
    }
}

#[async_trait]
pub trait TripStore: Send + Sync {
    async fn insert(&self, trip: Trip) -> Result<(), StoreError>;

    async fn get(&self, id: TripId) -> Result<Option<Trip>, StoreError>;

    async fn list_by_status(&self, status: TripStatus) -> Result<Vec<Trip>, StoreError>;

    /// Apply `patch` only if the trip's status and driver still equal
    /// `expected`. Status changes must respect
    /// [`TripStatus::can_advance_to`].
    async fn update_if(
        &self,
        id: TripId,
        expected: TripStamp,
        patch: TripPatch,
    ) -> Result<CasOutcome<Trip>, StoreError>;
}

/// Restriction applied by [`DriverRegistry::list`]. Empty `statuses` admits
/// every status.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DriverFilter {
    pub online_only: bool,
    pub require_position: bool,
    pub statuses: Vec<DriverStatus>,
    pub area: Option<SearchArea>,
}

impl DriverFilter {
    /// Online drivers with a known position, any status.
    pub fn online() -> Self {
        Self {
            online_only: true,
            require_position: true,
            ..Self::default()
        }
    }

    pub fn with_statuses(mut self, statuses: &[DriverStatus]) -> Self {
        self.statuses = statuses.to_vec();
        self
    }

    pub fn within(mut self, area: SearchArea) -> Self {
        self.area = Some(area);
        self
    }

    pub fn matches(&self, driver: &Driver) -> bool {
        if self.online_only && !driver.online {
            return false;
        }
        if self.require_position && driver.position.is_none() {
            return false;
        }
        if !self.statuses.is_empty() && !self.statuses.contains(&driver.status) {
            return false;
        }
        match (self.area, driver.position) {
            (Some(area), Some(position)) => area.contains(position),
            (Some(_), None) => false,
            (None, _) => true,
        }
    }
}

#[async_trait]
pub trait DriverRegistry: Send + Sync {
    async fn upsert(&self, driver: Driver) -> Result<(), StoreError>;

    async fn get(&self, id: DriverId) -> Result<Option<Driver>, StoreError>;

    async fn list(&self, filter: &DriverFilter) -> Result<Vec<Driver>, StoreError>;

    /// Heartbeat write: position, online flag and last-seen time.
    async fn heartbeat(
        &self,
        id: DriverId,
        position: Option<GeoPoint>,
        online: bool,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Set the operational status only if it is currently one of `expected`.
    async fn update_status_if(
        &self,
        id: DriverId,
        expected: &[DriverStatus],
        next: DriverStatus,
    ) -> Result<CasOutcome<Driver>, StoreError>;
}

#[async_trait]
pub trait ScheduledRideStore: Send + Sync {
    async fn insert(&self, ride: ScheduledRide) -> Result<(), StoreError>;

    async fn get(&self, id: ScheduledRideId) -> Result<Option<ScheduledRide>, StoreError>;

    /// Rows with `processed = false`, ordered by `scheduled_time`.
    async fn list_unprocessed(&self) -> Result<Vec<ScheduledRide>, StoreError>;

    /// Set `accepted_driver_id` and `processed = true` only if the row is
    /// still unclaimed. The first writer wins.
    async fn claim_if_unclaimed(
        &self,
        id: ScheduledRideId,
        driver: DriverId,
    ) -> Result<CasOutcome<ScheduledRide>, StoreError>;
}

/// Admin-editable global settings (the weight set).
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn load_weights(&self) -> Result<Option<ScoringWeights>, StoreError>;

    async fn save_weights(&self, weights: ScoringWeights) -> Result<(), StoreError>;
}
