//! Long-distance handling: operator decision window, priority lock, and the
//! broadcast fallback when nobody decides.
//!
//! At or above `request_km` a trip is flagged with `long_distance_request` and
//! held back from automatic offers. An operator may answer with
//! `long_distance_handle{auto|manual}` within the decision window; silence
//! means a broadcast to the nearest drivers with no radius limit. At or above
//! `lock_km` a priority lock is also written at creation, reserving the trip
//! for one pre-selected driver and then for operators.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::assignment::{AssignmentCoordinator, PriorityLock};
use crate::audit::{AuditEvent, AuditKind, AuditLog, AuditQuery, AuditRecord, AuditSubject, LongDistanceMode};
use crate::config::{secs, LongDistanceConfig, OfferConfig, ScoringWeights};
use crate::error::{DispatchError, StoreError};
use crate::matching::{AreaLimit, CandidateRanker, RankOrder, RankRequest};
use crate::model::{Trip, TripId, TripStatus};
use crate::offers::OfferBroker;
use crate::retry::{with_backoff, RetryPolicy};
use crate::store::TripStore;

/// What happened when a new trip was checked.
#[derive(Debug, Clone, PartialEq)]
pub enum LongDistanceOutcome {
    /// Below the request threshold; dispatch normally.
    Normal,
    /// Flagged; waiting for an operator decision.
    Flagged,
    /// Flagged and locked.
    Locked(PriorityLock),
}

impl LongDistanceOutcome {
    pub fn is_long_distance(&self) -> bool {
        !matches!(self, LongDistanceOutcome::Normal)
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct LongDistanceReport {
    /// Decision window elapsed, or automatic offers lapsed; broadcast sent.
    pub broadcast: Vec<TripId>,
    /// Operator chose `auto`; normal offers sent.
    pub auto_dispatched: Vec<TripId>,
    /// Nothing sent on this run: a window or lock is still open, offers are
    /// still live, or the broadcast already went out.
    pub pending: Vec<TripId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AutoStep {
    Dispatched,
    Broadcast,
    Waiting,
}

#[derive(Clone)]
pub struct LongDistanceHandler {
    trips: Arc<dyn TripStore>,
    audit: Arc<dyn AuditLog>,
    ranker: CandidateRanker,
    offers: OfferBroker,
    coordinator: AssignmentCoordinator,
    config: LongDistanceConfig,
    offer_config: OfferConfig,
    retry: RetryPolicy,
}

impl LongDistanceHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        trips: Arc<dyn TripStore>,
        audit: Arc<dyn AuditLog>,
        ranker: CandidateRanker,
        offers: OfferBroker,
        coordinator: AssignmentCoordinator,
        config: LongDistanceConfig,
        offer_config: OfferConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            trips,
            audit,
            ranker,
            offers,
            coordinator,
            config,
            offer_config,
            retry,
        }
    }

    pub fn is_long_distance(&self, trip: &Trip) -> bool {
        trip.distance_km >= self.config.request_km
    }

    async fn append(&self, trip_id: TripId, now: DateTime<Utc>, event: AuditEvent) -> Result<AuditRecord, StoreError> {
        with_backoff(self.retry, "append long-distance event", || {
            self.audit.append(AuditSubject::Trip(trip_id), now, event.clone())
        })
        .await
    }

    async fn latest(&self, trip_id: TripId, kind: AuditKind) -> Result<Option<AuditRecord>, StoreError> {
        self.audit
            .latest(&AuditQuery::for_trip(trip_id).kind(kind))
            .await
    }

    /// Flag, and above the lock threshold lock, a newly created trip.
    pub async fn on_trip_created(
        &self,
        trip: &Trip,
        weights: &ScoringWeights,
        now: DateTime<Utc>,
    ) -> Result<LongDistanceOutcome, StoreError> {
        if !self.is_long_distance(trip) {
            return Ok(LongDistanceOutcome::Normal);
        }
        self.append(
            trip.id,
            now,
            AuditEvent::LongDistanceRequest {
                distance_km: trip.distance_km,
            },
        )
        .await?;
        info!(trip_id = %trip.id, distance_km = trip.distance_km, "long-distance trip flagged");

        if trip.distance_km < self.config.lock_km {
            return Ok(LongDistanceOutcome::Flagged);
        }

        let request = RankRequest::for_trip(trip)
            .order(RankOrder::NearestUsable)
            .limit(1);
        let pool = self.ranker.rank(&request, weights, now).await?;
        let authorized_driver = pool.top().map(|candidate| candidate.driver_id);

        let lock_until = now + secs(self.config.lock_secs);
        let admin_until = lock_until + secs(self.config.admin_secs);
        self.append(
            trip.id,
            now,
            AuditEvent::PriorityLock {
                lock_until,
                admin_until,
                authorized_driver,
            },
        )
        .await?;
        if let Some(driver_id) = authorized_driver {
            self.offers
                .offer(trip, driver_id, self.config.lock_secs, now)
                .await?;
        }
        info!(trip_id = %trip.id, %lock_until, %admin_until, authorized = ?authorized_driver, "priority lock set");

        Ok(LongDistanceOutcome::Locked(PriorityLock {
            trip_id: trip.id,
            lock_until,
            admin_until,
            authorized_driver,
        }))
    }

    /// Operator decision for a flagged trip. Only affects trips at or above
    /// the request threshold.
    pub async fn decide(
        &self,
        trip_id: TripId,
        mode: LongDistanceMode,
        now: DateTime<Utc>,
    ) -> Result<(), DispatchError> {
        let trip = self
            .trips
            .get(trip_id)
            .await?
            .ok_or(DispatchError::TripNotFound(trip_id))?;
        if !self.is_long_distance(&trip) {
            debug!(trip_id = %trip_id, "decision recorded for a trip below the long-distance threshold");
        }
        self.append(trip_id, now, AuditEvent::LongDistanceHandle { mode })
            .await?;
        info!(trip_id = %trip_id, ?mode, "long-distance decision recorded");
        Ok(())
    }

    pub async fn sweep(&self, weights: &ScoringWeights, now: DateTime<Utc>) -> Result<LongDistanceReport, StoreError> {
        let mut report = LongDistanceReport::default();
        for trip in self.trips.list_by_status(TripStatus::Requested).await? {
            if !self.is_long_distance(&trip) {
                continue;
            }
            let Some(flagged) = self.latest(trip.id, AuditKind::LongDistanceRequest).await? else {
                continue;
            };
            let decision = self.latest(trip.id, AuditKind::LongDistanceHandle).await?;
            match decision.as_ref().map(|record| &record.event) {
                Some(AuditEvent::LongDistanceHandle {
                    mode: LongDistanceMode::Manual,
                }) => continue,
                Some(AuditEvent::LongDistanceHandle {
                    mode: LongDistanceMode::Auto,
                }) => {
                    let decided_at = decision.as_ref().map_or(now, |record| record.at);
                    match self.dispatch_auto(&trip, decided_at, weights, now).await? {
                        AutoStep::Dispatched => report.auto_dispatched.push(trip.id),
                        AutoStep::Broadcast => report.broadcast.push(trip.id),
                        AutoStep::Waiting => report.pending.push(trip.id),
                    }
                }
                _ => {
                    if self.broadcast_if_due(&trip, &flagged, weights, now).await? {
                        report.broadcast.push(trip.id);
                    } else {
                        report.pending.push(trip.id);
                    }
                }
            }
        }
        Ok(report)
    }

    /// Normal automatic offers after an `auto` decision, held until any
    /// priority lock has fully elapsed. The automatic round is attempted
    /// within one dispatch TTL of becoming due; if it binds nobody, the trip
    /// falls back to the long-distance broadcast once.
    async fn dispatch_auto(
        &self,
        trip: &Trip,
        decided_at: DateTime<Utc>,
        weights: &ScoringWeights,
        now: DateTime<Utc>,
    ) -> Result<AutoStep, StoreError> {
        let mut due_at = decided_at;
        if let Some(lock) = self.coordinator.priority_lock(trip.id).await? {
            due_at = due_at.max(lock.admin_until);
        }
        if now < due_at {
            return Ok(AutoStep::Waiting);
        }

        let offers = self
            .offers
            .offers_for(AuditSubject::Trip(trip.id), Some(due_at))
            .await?;
        if offers.iter().any(|offer| offer.is_live(now)) {
            return Ok(AutoStep::Waiting);
        }

        let ttl = secs(self.offer_config.dispatch_ttl_secs);
        let auto_until = due_at + ttl;
        let auto_round = offers
            .iter()
            .map(|offer| offer.issued_at)
            .filter(|issued_at| *issued_at < auto_until)
            .min();

        if auto_round.is_none() && now < auto_until {
            let rejected = self.offers.rejected_drivers(trip.id).await?;
            let request = RankRequest::for_trip(trip)
                .order(RankOrder::NearestUsable)
                .with_overlay()
                .excluding(rejected)
                .limit(self.offer_config.broadcast_fanout);
            let pool = self.ranker.rank(&request, weights, now).await?;
            let sent = self
                .offers
                .broadcast(trip, &pool.candidates, self.offer_config.dispatch_ttl_secs, now)
                .await?;
            debug!(trip_id = %trip.id, offers = sent.len(), "long-distance auto dispatch");
            return Ok(if sent.is_empty() {
                AutoStep::Waiting
            } else {
                AutoStep::Dispatched
            });
        }

        let fallback_at = auto_round.map_or(auto_until, |at| at + ttl);
        if now < fallback_at || offers.iter().any(|offer| offer.issued_at >= fallback_at) {
            return Ok(AutoStep::Waiting);
        }
        let sent = self.broadcast_nearest(trip, weights, now).await?;
        info!(trip_id = %trip.id, offers = sent, "automatic offers lapsed, broadcast sent");
        Ok(if sent == 0 {
            AutoStep::Waiting
        } else {
            AutoStep::Broadcast
        })
    }

    /// Broadcast once the decision window and any priority lock have passed.
    async fn broadcast_if_due(
        &self,
        trip: &Trip,
        flagged: &AuditRecord,
        weights: &ScoringWeights,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut due_at = flagged.at + secs(self.config.decision_window_secs);
        if let Some(lock) = self.coordinator.priority_lock(trip.id).await? {
            due_at = due_at.max(lock.admin_until);
        }
        if now < due_at {
            return Ok(false);
        }
        let already = self
            .offers
            .offers_for(AuditSubject::Trip(trip.id), Some(due_at))
            .await?;
        if !already.is_empty() {
            return Ok(false);
        }

        let sent = self.broadcast_nearest(trip, weights, now).await?;
        info!(trip_id = %trip.id, offers = sent, "decision window elapsed, broadcast sent");
        Ok(sent > 0)
    }

    /// Offer the trip to the nearest drivers with no radius limit.
    async fn broadcast_nearest(
        &self,
        trip: &Trip,
        weights: &ScoringWeights,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let rejected = self.offers.rejected_drivers(trip.id).await?;
        let request = RankRequest::for_trip(trip)
            .order(RankOrder::NearestUsable)
            .area(AreaLimit::Unbounded)
            .excluding(rejected)
            .limit(self.config.broadcast_count);
        let pool = self.ranker.rank(&request, weights, now).await?;
        let offers = self
            .offers
            .broadcast(trip, &pool.candidates, self.config.broadcast_ttl_secs, now)
            .await?;
        Ok(offers.len())
    }
}
