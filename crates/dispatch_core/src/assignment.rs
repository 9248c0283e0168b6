//! Atomic trip-to-driver binding.
//!
//! [`AssignmentCoordinator::bind`] is the single place the engine turns a
//! decision into state. The driver status flip and the trip write are each
//! one conditional update; a failure of either leaves the other untouched or
//! rolled back, so a trip never shows two bound drivers and an `accepted` trip
//! always carries its driver.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, AuditKind, AuditLog, AuditQuery, AuditRecord, AuditSubject};
use crate::error::{BindError, Conflict, ConflictReason, StoreError};
use crate::model::{Actor, DriverId, DriverStatus, Trip, TripId, TripPatch, TripStatus};
use crate::retry::{with_backoff, RetryPolicy};
use crate::store::{CasOutcome, DriverRegistry, TripStore};

/// Long-distance exclusivity windows for one trip.
///
/// Before `lock_until` only the authorized driver may accept; until
/// `admin_until` only an operator may assign; afterwards anyone may.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityLock {
    pub trip_id: TripId,
    pub lock_until: DateTime<Utc>,
    pub admin_until: DateTime<Utc>,
    pub authorized_driver: Option<DriverId>,
}

impl PriorityLock {
    pub fn from_record(record: &AuditRecord) -> Option<Self> {
        match (&record.subject, &record.event) {
            (
                AuditSubject::Trip(trip_id),
                AuditEvent::PriorityLock {
                    lock_until,
                    admin_until,
                    authorized_driver,
                },
            ) => Some(Self {
                trip_id: *trip_id,
                lock_until: *lock_until,
                admin_until: *admin_until,
                authorized_driver: *authorized_driver,
            }),
            _ => None,
        }
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now < self.admin_until
    }

    pub fn permits(&self, actor: Actor, now: DateTime<Utc>) -> bool {
        if now < self.lock_until {
            matches!(actor, Actor::Driver(id) if Some(id) == self.authorized_driver)
        } else if now < self.admin_until {
            actor == Actor::Operator
        } else {
            true
        }
    }
}

/// A bind attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindRequest {
    pub trip_id: TripId,
    pub driver_id: DriverId,
    pub actor: Actor,
    /// Allow taking an `accepted` trip away from its current driver.
    pub reassign: bool,
    /// Also admit a driver who is still on another trip
    /// (`on_trip -> busy_overlay`).
    pub overlay: bool,
}

impl BindRequest {
    pub fn new(trip_id: TripId, driver_id: DriverId, actor: Actor) -> Self {
        Self {
            trip_id,
            driver_id,
            actor,
            reassign: false,
            overlay: false,
        }
    }

    pub fn reassigning(mut self) -> Self {
        self.reassign = true;
        self
    }

    pub fn overlay(mut self, overlay: bool) -> Self {
        self.overlay = overlay;
        self
    }

    /// Status flip for a driver currently in `current`. An overlay request
    /// whose driver has already finished the other trip binds as a plain one.
    fn driver_transition(&self, current: DriverStatus) -> (DriverStatus, DriverStatus) {
        if self.overlay && current == DriverStatus::OnTrip {
            (DriverStatus::OnTrip, DriverStatus::BusyOverlay)
        } else {
            (DriverStatus::Idle, DriverStatus::OnTrip)
        }
    }
}

/// A successful bind.
#[derive(Debug, Clone, PartialEq)]
pub struct Bound {
    pub trip: Trip,
    pub driver_status: DriverStatus,
    /// Driver displaced by a reassignment.
    pub previous_driver: Option<DriverId>,
}

/// Outcome of an operator batch.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub bound: Vec<Bound>,
    pub failed: Vec<(TripId, DriverId, BindError)>,
}

#[derive(Clone)]
pub struct AssignmentCoordinator {
    trips: Arc<dyn TripStore>,
    drivers: Arc<dyn DriverRegistry>,
    audit: Arc<dyn AuditLog>,
    freshness_secs: u64,
    retry: RetryPolicy,
}

impl AssignmentCoordinator {
    pub fn new(
        trips: Arc<dyn TripStore>,
        drivers: Arc<dyn DriverRegistry>,
        audit: Arc<dyn AuditLog>,
        freshness_secs: u64,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            trips,
            drivers,
            audit,
            freshness_secs,
            retry,
        }
    }

    /// Newest priority lock recorded for the trip, active or not.
    pub async fn priority_lock(&self, trip_id: TripId) -> Result<Option<PriorityLock>, StoreError> {
        let query = AuditQuery::for_trip(trip_id).kind(AuditKind::PriorityLock);
        Ok(self
            .audit
            .latest(&query)
            .await?
            .as_ref()
            .and_then(PriorityLock::from_record))
    }

    /// Bind `request.driver_id` to `request.trip_id`.
    ///
    /// Conflicts are expected under concurrent dispatch and are returned, not
    /// logged as failures. Callers re-rank and try the next candidate rather
    /// than repeating the same bind.
    pub async fn bind(&self, request: BindRequest, now: DateTime<Utc>) -> Result<Bound, BindError> {
        let conflict = |reason| BindError::Conflict(Conflict::new(request.trip_id, reason));

        let trip = self
            .trips
            .get(request.trip_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("trip {}", request.trip_id)))?;
        let assignable = match trip.status {
            TripStatus::Requested => true,
            TripStatus::Accepted => request.reassign && trip.driver_id != Some(request.driver_id),
            _ => false,
        };
        if !assignable {
            debug!(trip_id = %trip.id, status = %trip.status, "trip not assignable");
            return Err(conflict(ConflictReason::TripNotAssignable));
        }

        if let Some(lock) = self.priority_lock(trip.id).await? {
            if !lock.permits(request.actor, now) {
                debug!(trip_id = %trip.id, actor = ?request.actor, "bind refused by priority lock");
                return Err(conflict(ConflictReason::PriorityLocked));
            }
        }

        let driver = match self.drivers.get(request.driver_id).await? {
            Some(driver) if driver.is_fresh(now, self.freshness_secs) => driver,
            _ => return Err(conflict(ConflictReason::StaleDriverState)),
        };

        let (from, to) = request.driver_transition(driver.status);
        match self.drivers.update_status_if(driver.id, &[from], to).await? {
            CasOutcome::Applied(_) => {}
            CasOutcome::Mismatch(current) => {
                debug!(driver_id = %driver.id, status = ?current.status, "driver not available for bind");
                return Err(conflict(ConflictReason::DriverUnavailable));
            }
        }

        let stamp = trip.stamp();
        let patch = TripPatch::bind(driver.id, now);
        let written = with_backoff(self.retry, "bind trip", || {
            self.trips.update_if(trip.id, stamp, patch.clone())
        })
        .await;
        let bound_trip = match written {
            Ok(CasOutcome::Applied(bound_trip)) => bound_trip,
            Ok(CasOutcome::Mismatch(_)) => {
                self.revert_driver(driver.id, to, from).await;
                debug!(trip_id = %trip.id, driver_id = %driver.id, "lost bind race");
                return Err(conflict(ConflictReason::LostRace));
            }
            Err(err) => {
                self.revert_driver(driver.id, to, from).await;
                return Err(err.into());
            }
        };

        let previous_driver = trip.driver_id.filter(|previous| *previous != driver.id);
        if let Some(previous) = previous_driver {
            self.free_driver(previous).await;
        }

        self.append_best_effort(
            AuditSubject::Trip(trip.id),
            now,
            AuditEvent::AssignDriver {
                driver_id: driver.id,
            },
        )
        .await;
        info!(trip_id = %trip.id, driver_id = %driver.id, actor = ?request.actor, "driver bound");

        Ok(Bound {
            trip: bound_trip,
            driver_status: to,
            previous_driver,
        })
    }

    /// Clear the binding of an `accepted` trip and free its driver. Returns
    /// the released driver.
    pub async fn release(&self, trip_id: TripId) -> Result<DriverId, BindError> {
        let conflict = |reason| BindError::Conflict(Conflict::new(trip_id, reason));
        let trip = self
            .trips
            .get(trip_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("trip {trip_id}")))?;
        let driver_id = match (trip.status, trip.driver_id) {
            (TripStatus::Accepted, Some(driver_id)) => driver_id,
            _ => return Err(conflict(ConflictReason::TripNotAssignable)),
        };

        let stamp = trip.stamp();
        let outcome = with_backoff(self.retry, "release trip", || {
            self.trips.update_if(trip_id, stamp, TripPatch::release())
        })
        .await?;
        if !outcome.is_applied() {
            return Err(conflict(ConflictReason::LostRace));
        }
        self.free_driver(driver_id).await;
        debug!(trip_id = %trip_id, driver_id = %driver_id, "binding released");
        Ok(driver_id)
    }

    /// Operator-directed binds of several (trip, driver) pairs. Lost pairs are
    /// reported and not retried.
    pub async fn assign_batch(
        &self,
        pairs: &[(TripId, DriverId)],
        now: DateTime<Utc>,
    ) -> Result<BatchOutcome, StoreError> {
        let mut outcome = BatchOutcome::default();
        for &(trip_id, driver_id) in pairs {
            let request = BindRequest::new(trip_id, driver_id, Actor::Operator);
            match self.bind(request, now).await {
                Ok(bound) => outcome.bound.push(bound),
                Err(err) => outcome.failed.push((trip_id, driver_id, err)),
            }
        }
        let ids: Vec<TripId> = outcome.bound.iter().map(|bound| bound.trip.id).collect();
        with_backoff(self.retry, "append candidate_assign_batch", || {
            self.audit.append(
                AuditSubject::Batch,
                now,
                AuditEvent::CandidateAssignBatch {
                    count: ids.len(),
                    ids: ids.clone(),
                },
            )
        })
        .await?;
        info!(bound = outcome.bound.len(), failed = outcome.failed.len(), "batch assignment done");
        Ok(outcome)
    }

    /// Return a driver from a finished or released trip: `on_trip -> idle`,
    /// or `busy_overlay -> on_trip` when a queued booking remains.
    pub async fn free_driver(&self, driver_id: DriverId) {
        let attempts = [
            (DriverStatus::OnTrip, DriverStatus::Idle),
            (DriverStatus::BusyOverlay, DriverStatus::OnTrip),
        ];
        for (from, to) in attempts {
            match self.drivers.update_status_if(driver_id, &[from], to).await {
                Ok(CasOutcome::Applied(_)) => return,
                Ok(CasOutcome::Mismatch(_)) => continue,
                Err(err) => {
                    warn!(driver_id = %driver_id, error = %err, "failed to free driver");
                    return;
                }
            }
        }
    }

    async fn revert_driver(&self, driver_id: DriverId, from: DriverStatus, to: DriverStatus) {
        if let Err(err) = self.drivers.update_status_if(driver_id, &[from], to).await {
            warn!(driver_id = %driver_id, error = %err, "failed to revert driver status");
        }
    }

    /// Audit after a write that already happened; a failure here must not
    /// undo or hide the write.
    async fn append_best_effort(&self, subject: AuditSubject, at: DateTime<Utc>, event: AuditEvent) {
        let kind = event.kind();
        let appended = with_backoff(self.retry, "append audit", || {
            self.audit.append(subject, at, event.clone())
        })
        .await;
        if let Err(err) = appended {
            warn!(?subject, ?kind, error = %err, "audit append failed after state change");
        }
    }
}
