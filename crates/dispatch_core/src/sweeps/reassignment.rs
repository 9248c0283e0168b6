//! Reassignment sweep: detects accepted trips whose driver never arrived and
//! re-runs matching for them.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::assignment::{AssignmentCoordinator, BindRequest};
use crate::audit::{AuditEvent, AuditKind, AuditLog, AuditQuery, AuditRecord, AuditSubject, ReassignReason};
use crate::config::{secs, ReassignmentConfig, ScoringWeights};
use crate::error::{ConflictReason, StoreError};
use crate::matching::{CandidateRanker, RankRequest};
use crate::model::{Actor, DriverId, Trip, TripId, TripStatus};
use crate::offers::OfferBroker;
use crate::retry::{with_backoff, RetryPolicy};
use crate::store::TripStore;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReassignReport {
    pub examined: usize,
    /// (trip, previous driver, new driver)
    pub reassigned: Vec<(TripId, DriverId, DriverId)>,
    /// Released, but every candidate bind lost.
    pub unassigned: Vec<TripId>,
    /// Left bound; an empty pool snapshot was recorded for an operator.
    pub no_candidates: Vec<TripId>,
}

#[derive(Clone)]
pub struct ReassignmentSweeper {
    trips: Arc<dyn TripStore>,
    audit: Arc<dyn AuditLog>,
    ranker: CandidateRanker,
    coordinator: AssignmentCoordinator,
    offers: OfferBroker,
    config: ReassignmentConfig,
    retry: RetryPolicy,
}

impl ReassignmentSweeper {
    pub fn new(
        trips: Arc<dyn TripStore>,
        audit: Arc<dyn AuditLog>,
        ranker: CandidateRanker,
        coordinator: AssignmentCoordinator,
        offers: OfferBroker,
        config: ReassignmentConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            trips,
            audit,
            ranker,
            coordinator,
            offers,
            config,
            retry,
        }
    }

    pub async fn sweep(&self, weights: &ScoringWeights, now: DateTime<Utc>) -> Result<ReassignReport, StoreError> {
        let mut report = ReassignReport::default();
        for trip in self.trips.list_by_status(TripStatus::Accepted).await? {
            report.examined += 1;
            if !self.is_stalled(&trip, now).await? {
                continue;
            }
            if let Err(err) = self.reassign(&trip, weights, now, &mut report).await {
                warn!(trip_id = %trip.id, error = %err, "reassignment failed");
            }
        }
        if !report.reassigned.is_empty() || !report.no_candidates.is_empty() {
            info!(
                reassigned = report.reassigned.len(),
                unassigned = report.unassigned.len(),
                no_candidates = report.no_candidates.len(),
                "reassignment sweep"
            );
        }
        Ok(report)
    }

    /// Stalled: assigned longer than the timeout ago and no `driver_arrived`
    /// recorded after that assignment.
    pub async fn is_stalled(&self, trip: &Trip, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let assign = self.latest(trip.id, AuditKind::AssignDriver).await?;
        let assigned_at = match (&assign, trip.accepted_at) {
            (Some(record), _) => record.at,
            (None, Some(accepted_at)) => accepted_at,
            (None, None) => return Ok(false),
        };
        if now - assigned_at <= secs(self.config.timeout_secs) {
            return Ok(false);
        }
        let arrived = self.latest(trip.id, AuditKind::DriverArrived).await?;
        let arrived_after = match (arrived, assign) {
            (Some(arrived), Some(assign)) => arrived.seq > assign.seq,
            (Some(arrived), None) => arrived.at >= assigned_at,
            (None, _) => false,
        };
        if arrived_after {
            debug!(trip_id = %trip.id, "driver arrived, not stalled");
        }
        Ok(!arrived_after)
    }

    async fn latest(&self, trip_id: TripId, kind: AuditKind) -> Result<Option<AuditRecord>, StoreError> {
        self.audit
            .latest(&AuditQuery::for_trip(trip_id).kind(kind))
            .await
    }

    async fn reassign(
        &self,
        trip: &Trip,
        weights: &ScoringWeights,
        now: DateTime<Utc>,
        report: &mut ReassignReport,
    ) -> Result<(), StoreError> {
        let Some(previous) = trip.driver_id else {
            return Ok(());
        };
        let rejected = self.offers.rejected_drivers(trip.id).await?;
        let request = RankRequest::for_trip(trip)
            .excluding(std::iter::once(previous).chain(rejected));
        let pool = self.ranker.rank(&request, weights, now).await?;
        if pool.is_empty() {
            info!(trip_id = %trip.id, "stalled trip has no replacement candidates");
            report.no_candidates.push(trip.id);
            return Ok(());
        }

        match self.coordinator.release(trip.id).await {
            Ok(_) => {}
            Err(err) if err.is_conflict() => {
                debug!(trip_id = %trip.id, "trip changed before release, skipping");
                return Ok(());
            }
            Err(err) => {
                warn!(trip_id = %trip.id, error = %err, "release failed");
                return Ok(());
            }
        }

        let mut assigned = None;
        for candidate in &pool.candidates {
            let request = BindRequest::new(trip.id, candidate.driver_id, Actor::System)
                .overlay(candidate.is_overlay());
            match self.coordinator.bind(request, now).await {
                Ok(bound) => {
                    assigned = Some(bound);
                    break;
                }
                Err(err) => match err.conflict_reason() {
                    Some(ConflictReason::DriverUnavailable | ConflictReason::StaleDriverState) => {
                        continue;
                    }
                    _ => {
                        debug!(trip_id = %trip.id, error = %err, "bind stopped");
                        break;
                    }
                },
            }
        }

        let assigned_driver = assigned.as_ref().and_then(|bound| bound.trip.driver_id);
        with_backoff(self.retry, "append auto_reassign", || {
            self.audit.append(
                AuditSubject::Trip(trip.id),
                now,
                AuditEvent::AutoReassign {
                    reason: ReassignReason::TimeoutNoArrival,
                    previous,
                    assigned: assigned_driver,
                },
            )
        })
        .await?;

        match assigned_driver {
            Some(next) => {
                info!(trip_id = %trip.id, previous = %previous, assigned = %next, "trip reassigned");
                report.reassigned.push((trip.id, previous, next));
            }
            None => {
                info!(trip_id = %trip.id, previous = %previous, "stalled trip released without replacement");
                report.unassigned.push(trip.id);
            }
        }
        Ok(())
    }
}
