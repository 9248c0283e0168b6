#![allow(dead_code)]

use chrono::{DateTime, Duration, Utc};
use dispatch_core::geo::GeoPoint;
use dispatch_core::model::{
    CarClass, Driver, DriverId, DriverStatus, NewTrip, PassengerId, Place, ScheduledRide, Vehicle,
};
use dispatch_core::test_helpers::{offset_north, TEST_DROPOFF, TEST_PICKUP};

/// Pickup shared by every scenario.
pub fn seeded_pickup() -> GeoPoint {
    TEST_PICKUP
}

/// Short-hop dropoff, well under the long-distance threshold.
pub fn seeded_dropoff() -> GeoPoint {
    TEST_DROPOFF
}

/// Dropoff `km` north of the seeded pickup.
pub fn dropoff_at_km(km: f64) -> GeoPoint {
    offset_north(TEST_PICKUP, km)
}

/// Builder for driver fixtures.
#[derive(Clone, Debug)]
pub struct DriverBuilder {
    position: Option<GeoPoint>,
    online: bool,
    status: DriverStatus,
    heartbeat_age_secs: i64,
    class: Option<CarClass>,
    rating: Option<f64>,
}

impl DriverBuilder {
    /// Online idle standard-class driver with a fresh heartbeat at the seeded pickup.
    pub fn new() -> Self {
        Self {
            position: Some(TEST_PICKUP),
            online: true,
            status: DriverStatus::Idle,
            heartbeat_age_secs: 5,
            class: Some(CarClass::Standard),
            rating: Some(4.8),
        }
    }

    /// Place the driver `km` north of the seeded pickup.
    pub fn km_from_pickup(mut self, km: f64) -> Self {
        self.position = Some(offset_north(TEST_PICKUP, km));
        self
    }

    pub fn without_position(mut self) -> Self {
        self.position = None;
        self
    }

    pub fn offline(mut self) -> Self {
        self.online = false;
        self
    }

    pub fn status(mut self, status: DriverStatus) -> Self {
        self.status = status;
        self
    }

    /// Seconds since the last heartbeat.
    pub fn heartbeat_age(mut self, secs: i64) -> Self {
        self.heartbeat_age_secs = secs;
        self
    }

    pub fn class(mut self, class: CarClass) -> Self {
        self.class = Some(class);
        self
    }

    pub fn rating(mut self, rating: Option<f64>) -> Self {
        self.rating = rating;
        self
    }

    pub fn build(self, now: DateTime<Utc>) -> Driver {
        Driver {
            id: DriverId::new(),
            name: String::new(),
            position: self.position,
            online: self.online,
            status: self.status,
            last_seen_at: now - Duration::seconds(self.heartbeat_age_secs),
            vehicle: self.class.map(|class| Vehicle {
                class,
                plate: String::new(),
            }),
            rating: self.rating,
        }
    }
}

impl Default for DriverBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Trip request from the seeded pickup to `dropoff`.
pub fn trip_to(dropoff: GeoPoint) -> NewTrip {
    NewTrip {
        passenger_id: PassengerId::new(),
        pickup: Place::new(TEST_PICKUP, "Taipei 101"),
        dropoff: Place::new(dropoff, "destination"),
        car_class: CarClass::Standard,
        price_estimate: None,
    }
}

/// Scheduled ride from the seeded pickup, `minutes_ahead` after `now`.
pub fn scheduled_ride(now: DateTime<Utc>, minutes_ahead: i64) -> ScheduledRide {
    ScheduledRide::new(
        PassengerId::new(),
        Place::new(TEST_PICKUP, "Taipei 101"),
        Place::new(TEST_DROPOFF, "Main Station"),
        now + Duration::minutes(minutes_ahead),
    )
}
