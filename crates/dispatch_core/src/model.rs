//! Domain records shared by every engine component: trips, drivers, scheduled
//! rides and the identifiers that tie them together.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geo::{haversine_km, GeoPoint};
use crate::pricing::estimate_fare;

macro_rules! id_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

id_newtype!(
    /// Trip identity.
    TripId
);
id_newtype!(
    /// Driver identity.
    DriverId
);
id_newtype!(
    /// Passenger identity.
    PassengerId
);
id_newtype!(
    /// Pre-booked ride identity.
    ScheduledRideId
);

/// A coordinate plus the human-readable address shown to drivers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Place {
    pub point: GeoPoint,
    #[serde(default)]
    pub address: String,
}

impl Place {
    pub fn new(point: GeoPoint, address: impl Into<String>) -> Self {
        Self {
            point,
            address: address.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CarClass {
    Economy,
    #[default]
    Standard,
    Comfort,
    Van,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripStatus {
    Requested,
    Accepted,
    InProgress,
    Completed,
    Cancelled,
}

impl TripStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TripStatus::Completed | TripStatus::Cancelled)
    }

    /// Status machine. `Accepted -> Requested` is the binding clear used by
    /// release; nothing at or past `InProgress` goes back to `Requested`.
    pub fn can_advance_to(self, next: TripStatus) -> bool {
        use TripStatus::*;
        match (self, next) {
            (Requested, Accepted) | (Requested, Cancelled) => true,
            (Accepted, Accepted) | (Accepted, Requested) => true,
            (Accepted, InProgress) | (Accepted, Cancelled) => true,
            (InProgress, Completed) | (InProgress, Cancelled) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TripStatus::Requested => "requested",
            TripStatus::Accepted => "accepted",
            TripStatus::InProgress => "in_progress",
            TripStatus::Completed => "completed",
            TripStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TripStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Passenger input for a new trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTrip {
    pub passenger_id: PassengerId,
    pub pickup: Place,
    pub dropoff: Place,
    #[serde(default)]
    pub car_class: CarClass,
    #[serde(default)]
    pub price_estimate: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trip {
    pub id: TripId,
    pub passenger_id: PassengerId,
    pub pickup: Place,
    pub dropoff: Place,
    pub car_class: CarClass,
    pub status: TripStatus,
    /// Bound driver; `Some` exactly while the trip is accepted or in progress.
    pub driver_id: Option<DriverId>,
    /// Haversine pickup-to-dropoff distance, fixed at creation.
    pub distance_km: f64,
    pub price_estimate: f64,
    #[serde(default)]
    pub final_price: Option<f64>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub accepted_at: Option<DateTime<Utc>>,
}

impl Trip {
    pub fn from_request(request: NewTrip, now: DateTime<Utc>) -> Self {
        let distance_km = haversine_km(request.pickup.point, request.dropoff.point);
        let price_estimate = request
            .price_estimate
            .unwrap_or_else(|| estimate_fare(distance_km, request.car_class));
        Self {
            id: TripId::new(),
            passenger_id: request.passenger_id,
            pickup: request.pickup,
            dropoff: request.dropoff,
            car_class: request.car_class,
            status: TripStatus::Requested,
            driver_id: None,
            distance_km,
            price_estimate,
            final_price: None,
            created_at: now,
            accepted_at: None,
        }
    }

    /// The fields a conditional write compares against.
    pub fn stamp(&self) -> TripStamp {
        TripStamp {
            status: self.status,
            driver_id: self.driver_id,
        }
    }
}

/// Snapshot of the compare-and-swap fields of a trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TripStamp {
    pub status: TripStatus,
    pub driver_id: Option<DriverId>,
}

/// Fields a conditional trip write may change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TripPatch {
    pub status: Option<TripStatus>,
    pub driver_id: Option<Option<DriverId>>,
    pub accepted_at: Option<Option<DateTime<Utc>>>,
    pub final_price: Option<f64>,
}

impl TripPatch {
    pub fn bind(driver_id: DriverId, now: DateTime<Utc>) -> Self {
        Self {
            status: Some(TripStatus::Accepted),
            driver_id: Some(Some(driver_id)),
            accepted_at: Some(Some(now)),
            final_price: None,
        }
    }

    pub fn release() -> Self {
        Self {
            status: Some(TripStatus::Requested),
            driver_id: Some(None),
            accepted_at: Some(None),
            final_price: None,
        }
    }

    pub fn status(status: TripStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn apply(&self, trip: &mut Trip) {
        if let Some(status) = self.status {
            trip.status = status;
        }
        if let Some(driver_id) = self.driver_id {
            trip.driver_id = driver_id;
        }
        if let Some(accepted_at) = self.accepted_at {
            trip.accepted_at = accepted_at;
        }
        if let Some(final_price) = self.final_price {
            trip.final_price = Some(final_price);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverStatus {
    Idle,
    Busy,
    OnTrip,
    /// On a trip with a back-to-back booking queued behind it.
    BusyOverlay,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vehicle {
    pub class: CarClass,
    #[serde(default)]
    pub plate: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Driver {
    pub id: DriverId,
    #[serde(default)]
    pub name: String,
    pub position: Option<GeoPoint>,
    pub online: bool,
    pub status: DriverStatus,
    pub last_seen_at: DateTime<Utc>,
    #[serde(default)]
    pub vehicle: Option<Vehicle>,
    #[serde(default)]
    pub rating: Option<f64>,
}

impl Driver {
    /// Vehicle class used for mismatch scoring.
    pub fn derived_class(&self) -> CarClass {
        self.vehicle
            .as_ref()
            .map(|vehicle| vehicle.class)
            .unwrap_or_default()
    }

    pub fn heartbeat_age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.last_seen_at).num_seconds()
    }

    /// Online, positioned and heard from within `freshness_secs`.
    pub fn is_fresh(&self, now: DateTime<Utc>, freshness_secs: u64) -> bool {
        self.online
            && self.position.is_some()
            && self.heartbeat_age_secs(now) < i64::try_from(freshness_secs).unwrap_or(i64::MAX)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledRide {
    pub id: ScheduledRideId,
    pub passenger_id: PassengerId,
    pub pickup: Place,
    pub dropoff: Place,
    #[serde(default)]
    pub car_class: CarClass,
    pub scheduled_time: DateTime<Utc>,
    #[serde(default)]
    pub processed: bool,
    #[serde(default)]
    pub accepted_driver_id: Option<DriverId>,
}

impl ScheduledRide {
    pub fn new(
        passenger_id: PassengerId,
        pickup: Place,
        dropoff: Place,
        scheduled_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ScheduledRideId::new(),
            passenger_id,
            pickup,
            dropoff,
            car_class: CarClass::default(),
            scheduled_time,
            processed: false,
            accepted_driver_id: None,
        }
    }

    pub fn is_claimed(&self) -> bool {
        self.processed || self.accepted_driver_id.is_some()
    }

    pub fn distance_km(&self) -> f64 {
        haversine_km(self.pickup.point, self.dropoff.point)
    }
}

/// Who is asking for a bind. Priority windows admit actors by kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "driver_id", rename_all = "snake_case")]
pub enum Actor {
    /// Self-service acceptance from a driver client.
    Driver(DriverId),
    /// Operator-directed assignment from the admin console.
    Operator,
    /// Automatic dispatch by the engine.
    System,
}
