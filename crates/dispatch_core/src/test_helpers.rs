//! Test helpers for common test setup and utilities.
//!
//! Shared fixtures for unit tests, integration tests and benches: fixed
//! coordinates, driver and trip constructors, and in-memory collaborators.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::engine::Collaborators;
use crate::geo::GeoPoint;
use crate::model::{CarClass, Driver, DriverId, DriverStatus, NewTrip, PassengerId, Place, Vehicle};
use crate::store::{
    InMemoryAuditLog, InMemoryDriverRegistry, InMemoryScheduledRideStore, InMemorySettingsStore,
    InMemoryTripStore,
};

/// Pickup used across tests (Taipei 101).
pub const TEST_PICKUP: GeoPoint = GeoPoint::new(25.033, 121.565);

/// Dropoff roughly 5 km west of [`TEST_PICKUP`].
pub const TEST_DROPOFF: GeoPoint = GeoPoint::new(25.047, 121.517);

/// Fixed start instant so test timestamps are reproducible.
pub fn test_epoch() -> DateTime<Utc> {
    DateTime::from_timestamp(1_767_225_600, 0).unwrap_or_default()
}

/// Point `km` kilometres north of `origin`.
pub fn offset_north(origin: GeoPoint, km: f64) -> GeoPoint {
    GeoPoint::new(origin.lat + km / 111.195, origin.lng)
}

/// Online idle standard-class driver heard from `age_secs` before `now`.
pub fn driver_at(position: GeoPoint, now: DateTime<Utc>, age_secs: i64) -> Driver {
    Driver {
        id: DriverId::new(),
        name: String::new(),
        position: Some(position),
        online: true,
        status: DriverStatus::Idle,
        last_seen_at: now - Duration::seconds(age_secs),
        vehicle: Some(Vehicle {
            class: CarClass::Standard,
            plate: String::new(),
        }),
        rating: Some(4.8),
    }
}

pub fn trip_request(pickup: GeoPoint, dropoff: GeoPoint) -> NewTrip {
    NewTrip {
        passenger_id: PassengerId::new(),
        pickup: Place::new(pickup, "pickup"),
        dropoff: Place::new(dropoff, "dropoff"),
        car_class: CarClass::Standard,
        price_estimate: None,
    }
}

/// In-memory collaborators with concrete handles kept for assertions.
#[derive(Clone, Default)]
pub struct InMemoryCollaborators {
    pub trips: Arc<InMemoryTripStore>,
    pub drivers: Arc<InMemoryDriverRegistry>,
    pub rides: Arc<InMemoryScheduledRideStore>,
    pub audit: Arc<InMemoryAuditLog>,
    pub settings: Arc<InMemorySettingsStore>,
}

impl InMemoryCollaborators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_collaborators(&self) -> Collaborators {
        Collaborators {
            trips: self.trips.clone(),
            drivers: self.drivers.clone(),
            rides: self.rides.clone(),
            audit: self.audit.clone(),
            settings: self.settings.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::haversine_km;

    #[test]
    fn offset_north_moves_by_requested_distance() {
        let moved = offset_north(TEST_PICKUP, 32.0);
        assert!((haversine_km(TEST_PICKUP, moved) - 32.0).abs() < 0.05);
    }

    #[test]
    fn driver_fixture_is_fresh() {
        let now = test_epoch();
        assert!(driver_at(TEST_PICKUP, now, 10).is_fresh(now, 600));
    }
}
