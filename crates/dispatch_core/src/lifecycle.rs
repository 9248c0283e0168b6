//! Driver- and passenger-driven status advances after a bind.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::assignment::AssignmentCoordinator;
use crate::audit::{AuditEvent, AuditLog, AuditSubject};
use crate::error::{BindError, Conflict, ConflictReason, StoreError};
use crate::model::{Actor, DriverId, Trip, TripId, TripPatch, TripStatus};
use crate::retry::{with_backoff, RetryPolicy};
use crate::store::{CasOutcome, TripStore};

#[derive(Clone)]
pub struct TripLifecycle {
    trips: Arc<dyn TripStore>,
    audit: Arc<dyn AuditLog>,
    coordinator: AssignmentCoordinator,
    retry: RetryPolicy,
}

impl TripLifecycle {
    pub fn new(
        trips: Arc<dyn TripStore>,
        audit: Arc<dyn AuditLog>,
        coordinator: AssignmentCoordinator,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            trips,
            audit,
            coordinator,
            retry,
        }
    }

    async fn load(&self, trip_id: TripId) -> Result<Trip, BindError> {
        Ok(self
            .trips
            .get(trip_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("trip {trip_id}")))?)
    }

    /// The trip as bound to `driver_id` in `status`.
    async fn load_bound(
        &self,
        trip_id: TripId,
        driver_id: DriverId,
        status: TripStatus,
    ) -> Result<Trip, BindError> {
        let trip = self.load(trip_id).await?;
        if trip.driver_id != Some(driver_id) {
            return Err(Conflict::new(trip_id, ConflictReason::NotAssignedDriver).into());
        }
        if trip.status != status {
            return Err(Conflict::new(trip_id, ConflictReason::TripNotAssignable).into());
        }
        Ok(trip)
    }

    /// Driver reached the pickup. Appends `driver_arrived`, which stops the
    /// reassignment sweep from touching the trip.
    pub async fn mark_arrived(
        &self,
        trip_id: TripId,
        driver_id: DriverId,
        now: DateTime<Utc>,
    ) -> Result<(), BindError> {
        self.load_bound(trip_id, driver_id, TripStatus::Accepted).await?;
        with_backoff(self.retry, "append driver_arrived", || {
            self.audit.append(
                AuditSubject::Trip(trip_id),
                now,
                AuditEvent::DriverArrived { driver_id },
            )
        })
        .await?;
        debug!(trip_id = %trip_id, driver_id = %driver_id, "driver arrived");
        Ok(())
    }

    pub async fn start(
        &self,
        trip_id: TripId,
        driver_id: DriverId,
        now: DateTime<Utc>,
    ) -> Result<Trip, BindError> {
        let trip = self.load_bound(trip_id, driver_id, TripStatus::Accepted).await?;
        self.advance(&trip, TripPatch::status(TripStatus::InProgress), now)
            .await
    }

    /// Finish the ride. `final_price` defaults to the estimate.
    pub async fn complete(
        &self,
        trip_id: TripId,
        driver_id: DriverId,
        final_price: Option<f64>,
        now: DateTime<Utc>,
    ) -> Result<Trip, BindError> {
        let trip = self.load_bound(trip_id, driver_id, TripStatus::InProgress).await?;
        let patch = TripPatch {
            final_price: Some(final_price.unwrap_or(trip.price_estimate)),
            ..TripPatch::status(TripStatus::Completed)
        };
        let completed = self.advance(&trip, patch, now).await?;
        self.coordinator.free_driver(driver_id).await;
        Ok(completed)
    }

    /// Cancel from any non-terminal status. A bound driver is freed; a
    /// driver may only cancel a trip bound to them.
    pub async fn cancel(
        &self,
        trip_id: TripId,
        actor: Actor,
        now: DateTime<Utc>,
    ) -> Result<Trip, BindError> {
        let trip = self.load(trip_id).await?;
        if trip.status.is_terminal() {
            return Err(Conflict::new(trip_id, ConflictReason::TripNotAssignable).into());
        }
        if let Actor::Driver(driver_id) = actor {
            if trip.driver_id != Some(driver_id) {
                return Err(Conflict::new(trip_id, ConflictReason::NotAssignedDriver).into());
            }
        }
        let cancelled = self
            .advance(&trip, TripPatch::status(TripStatus::Cancelled), now)
            .await?;
        if let Some(driver_id) = trip.driver_id {
            self.coordinator.free_driver(driver_id).await;
        }
        Ok(cancelled)
    }

    async fn advance(&self, trip: &Trip, patch: TripPatch, now: DateTime<Utc>) -> Result<Trip, BindError> {
        let stamp = trip.stamp();
        let outcome = with_backoff(self.retry, "advance trip", || {
            self.trips.update_if(trip.id, stamp, patch.clone())
        })
        .await?;
        let updated = match outcome {
            CasOutcome::Applied(updated) => updated,
            CasOutcome::Mismatch(_) => {
                return Err(Conflict::new(trip.id, ConflictReason::LostRace).into());
            }
        };

        let event = AuditEvent::TripStatusChange {
            from: trip.status,
            to: updated.status,
            driver_id: updated.driver_id,
        };
        let appended = with_backoff(self.retry, "append trip_status", || {
            self.audit.append(AuditSubject::Trip(trip.id), now, event.clone())
        })
        .await;
        if let Err(err) = appended {
            warn!(trip_id = %trip.id, error = %err, "trip_status append failed after transition");
        }
        info!(trip_id = %trip.id, from = %trip.status, to = %updated.status, "trip status changed");
        Ok(updated)
    }
}
