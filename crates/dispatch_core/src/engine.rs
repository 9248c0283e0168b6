//! Wiring of the engine components over one set of collaborators.
//!
//! `DispatchEngine` owns no state of its own: trips, drivers and the audit log
//! live behind the collaborator traits, and the components are cheap handles
//! onto them. Request-path operations (`submit_trip`, `accept_offer`, ...) read
//! the clock once and pass `now` down.

use std::sync::Arc;

use tracing::{debug, info};

use crate::assignment::{AssignmentCoordinator, BindRequest, Bound};
use crate::audit::{AuditLog, OfferTarget};
use crate::clock::Clock;
use crate::config::{DispatchConfig, ScoringWeights};
use crate::error::{BindError, ClaimError, Conflict, ConflictReason, DispatchError, Result};
use crate::eta::{build_eta_provider, FallbackEta};
use crate::lifecycle::TripLifecycle;
use crate::matching::{CandidatePoolSnapshot, CandidateRanker, RankOrder, RankRequest};
use crate::model::{Actor, DriverId, NewTrip, ScheduledRide, Trip, TripId, TripStatus};
use crate::offers::{Acceptance, DispatchOffer, OfferBroker, OfferKind};
use crate::retry::{with_backoff, RetryPolicy};
use crate::scheduler::DispatchScheduler;
use crate::store::{DriverRegistry, ScheduledRideStore, SettingsStore, TripStore};
use crate::sweeps::{LongDistanceHandler, LongDistanceOutcome, ReassignmentSweeper, ScheduledRideDispatcher};
use crate::weights::WeightsCache;

/// External stores the engine reads and writes.
#[derive(Clone)]
pub struct Collaborators {
    pub trips: Arc<dyn TripStore>,
    pub drivers: Arc<dyn DriverRegistry>,
    pub rides: Arc<dyn ScheduledRideStore>,
    pub audit: Arc<dyn AuditLog>,
    pub settings: Arc<dyn SettingsStore>,
}

/// Result of [`DispatchEngine::submit_trip`].
#[derive(Debug, Clone, PartialEq)]
pub struct Submitted {
    pub trip: Trip,
    pub long_distance: LongDistanceOutcome,
    /// Offers published for a normal trip. Empty for long-distance trips,
    /// whose offers come from the long-distance flow.
    pub offers: Vec<DispatchOffer>,
}

impl Submitted {
    /// A normal trip that found nobody to offer it to.
    pub fn no_candidates(&self) -> bool {
        !self.long_distance.is_long_distance() && self.offers.is_empty()
    }
}

/// Result of [`DispatchEngine::accept_offer`].
#[derive(Debug, Clone, PartialEq)]
pub enum AcceptedOffer {
    Trip(Bound),
    ScheduledRide(ScheduledRide),
}

#[derive(Clone)]
pub struct DispatchEngine {
    config: DispatchConfig,
    clock: Arc<dyn Clock>,
    collaborators: Collaborators,
    weights: Arc<WeightsCache>,
    ranker: CandidateRanker,
    offers: OfferBroker,
    coordinator: AssignmentCoordinator,
    lifecycle: TripLifecycle,
    long_distance: LongDistanceHandler,
    reassignment: ReassignmentSweeper,
    scheduled: ScheduledRideDispatcher,
    retry: RetryPolicy,
}

impl DispatchEngine {
    /// ETA provider chosen by `config.eta_provider`.
    pub fn new(config: DispatchConfig, collaborators: Collaborators, clock: Arc<dyn Clock>) -> Self {
        let eta = build_eta_provider(&config.eta_provider, config.ranking.assumed_speed_kmh);
        Self::with_eta(config, collaborators, clock, eta)
    }

    pub fn with_eta(
        config: DispatchConfig,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
        eta: FallbackEta,
    ) -> Self {
        let retry = RetryPolicy::from(config.retry.clone());
        let Collaborators {
            trips,
            drivers,
            rides,
            audit,
            settings,
        } = collaborators.clone();

        let weights = Arc::new(WeightsCache::new(
            settings,
            audit.clone(),
            config.weights_fallback_path.clone(),
            retry,
        ));
        let ranker = CandidateRanker::new(
            drivers.clone(),
            trips.clone(),
            audit.clone(),
            eta,
            config.ranking.clone(),
            retry,
        );
        let offers = OfferBroker::new(audit.clone(), config.offers.clone(), retry);
        let coordinator = AssignmentCoordinator::new(
            trips.clone(),
            drivers,
            audit.clone(),
            config.ranking.freshness_secs,
            retry,
        );
        let lifecycle = TripLifecycle::new(trips.clone(), audit.clone(), coordinator.clone(), retry);
        let long_distance = LongDistanceHandler::new(
            trips.clone(),
            audit.clone(),
            ranker.clone(),
            offers.clone(),
            coordinator.clone(),
            config.long_distance.clone(),
            config.offers.clone(),
            retry,
        );
        let reassignment = ReassignmentSweeper::new(
            trips,
            audit.clone(),
            ranker.clone(),
            coordinator.clone(),
            offers.clone(),
            config.reassignment.clone(),
            retry,
        );
        let scheduled = ScheduledRideDispatcher::new(
            rides,
            audit,
            ranker.clone(),
            offers.clone(),
            config.scheduled.clone(),
            config.offers.clone(),
            retry,
        );

        Self {
            config,
            clock,
            collaborators,
            weights,
            ranker,
            offers,
            coordinator,
            lifecycle,
            long_distance,
            reassignment,
            scheduled,
            retry,
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    pub fn weights(&self) -> &Arc<WeightsCache> {
        &self.weights
    }

    pub fn ranker(&self) -> &CandidateRanker {
        &self.ranker
    }

    pub fn offers(&self) -> &OfferBroker {
        &self.offers
    }

    pub fn coordinator(&self) -> &AssignmentCoordinator {
        &self.coordinator
    }

    pub fn lifecycle(&self) -> &TripLifecycle {
        &self.lifecycle
    }

    pub fn long_distance(&self) -> &LongDistanceHandler {
        &self.long_distance
    }

    pub fn reassignment(&self) -> &ReassignmentSweeper {
        &self.reassignment
    }

    pub fn scheduled(&self) -> &ScheduledRideDispatcher {
        &self.scheduled
    }

    /// The consolidated sweep scheduler over this engine's components.
    pub fn scheduler(&self) -> DispatchScheduler {
        DispatchScheduler::new(
            &self.config,
            self.weights.clone(),
            self.reassignment.clone(),
            self.long_distance.clone(),
            self.scheduled.clone(),
            self.clock.clone(),
        )
    }

    /// Store a new trip and start dispatching it. Long-distance trips go
    /// through the long-distance flow; everything else is offered to the
    /// nearest usable candidates right away.
    pub async fn submit_trip(&self, request: NewTrip) -> Result<Submitted> {
        let now = self.clock.now();
        let trip = Trip::from_request(request, now);
        with_backoff(self.retry, "insert trip", || self.collaborators.trips.insert(trip.clone())).await?;
        info!(trip_id = %trip.id, distance_km = trip.distance_km, "trip requested");

        let weights = self.weights.current();
        let long_distance = self.long_distance.on_trip_created(&trip, &weights, now).await?;
        if long_distance.is_long_distance() {
            return Ok(Submitted {
                trip,
                long_distance,
                offers: Vec::new(),
            });
        }

        let request = RankRequest::for_trip(&trip)
            .order(RankOrder::NearestUsable)
            .with_overlay()
            .limit(self.config.offers.broadcast_fanout);
        let pool = self.ranker.rank(&request, &weights, now).await?;
        let offers = self
            .offers
            .broadcast(&trip, &pool.candidates, self.config.offers.dispatch_ttl_secs, now)
            .await?;
        Ok(Submitted {
            trip,
            long_distance,
            offers,
        })
    }

    /// A driver accepts an offer. Offers addressed to someone else, or
    /// accepted at or after `expires_at`, change nothing.
    pub async fn accept_offer(&self, target: OfferTarget, driver_id: DriverId) -> Result<AcceptedOffer> {
        let now = self.clock.now();
        let acceptance = self.offers.check_acceptance(target, driver_id, now).await?;
        match target {
            OfferTarget::Trip { trip_id } => {
                let offer = match acceptance {
                    Acceptance::Live(offer) => offer,
                    Acceptance::Expired(_) => {
                        return Err(conflict(trip_id, ConflictReason::OfferExpired));
                    }
                    Acceptance::NotAddressed => {
                        return Err(conflict(trip_id, ConflictReason::OfferNotAddressed));
                    }
                };
                let request = BindRequest::new(trip_id, driver_id, Actor::Driver(driver_id))
                    .overlay(offer.kind == OfferKind::Overlay);
                let bound = self.coordinator.bind(request, now).await?;
                Ok(AcceptedOffer::Trip(bound))
            }
            OfferTarget::ScheduledRide { ride_id } => {
                match acceptance {
                    Acceptance::Live(_) => {}
                    Acceptance::Expired(_) => return Err(ClaimError::OfferExpired(ride_id).into()),
                    Acceptance::NotAddressed => return Err(ClaimError::NotOffered(ride_id).into()),
                }
                let ride = self.scheduled.claim(ride_id, driver_id, now).await?;
                Ok(AcceptedOffer::ScheduledRide(ride))
            }
        }
    }

    pub async fn reject_offer(&self, trip_id: TripId, driver_id: DriverId) -> Result<()> {
        Ok(self.offers.reject(trip_id, driver_id, self.clock.now()).await?)
    }

    /// Rank a stored trip with the current weights and record the pool.
    pub async fn rank_trip(&self, trip_id: TripId, limit: Option<usize>) -> Result<CandidatePoolSnapshot> {
        let trip = self.load_trip(trip_id).await?;
        let rejected = self.offers.rejected_drivers(trip_id).await?;
        let mut request = RankRequest::for_trip(&trip).excluding(rejected);
        if let Some(limit) = limit {
            request = request.limit(limit);
        }
        let weights = self.weights.current();
        Ok(self.ranker.rank(&request, &weights, self.clock.now()).await?)
    }

    /// Bind the best available candidate without an offer round.
    pub async fn auto_assign(&self, trip_id: TripId) -> Result<Bound> {
        let now = self.clock.now();
        let trip = self.load_trip(trip_id).await?;
        if trip.status != TripStatus::Requested {
            return Err(conflict(trip_id, ConflictReason::TripNotAssignable));
        }
        let rejected = self.offers.rejected_drivers(trip_id).await?;
        let request = RankRequest::for_trip(&trip)
            .order(RankOrder::NearestUsable)
            .with_overlay()
            .excluding(rejected);
        let pool = self.ranker.rank(&request, &self.weights.current(), now).await?;
        if pool.is_empty() {
            info!(trip_id = %trip_id, "no driver found");
            return Err(DispatchError::NoCandidates(trip_id));
        }

        let mut last_conflict = None;
        for candidate in &pool.candidates {
            let request = BindRequest::new(trip_id, candidate.driver_id, Actor::System)
                .overlay(candidate.is_overlay());
            match self.coordinator.bind(request, now).await {
                Ok(bound) => return Ok(bound),
                Err(BindError::Conflict(conflict)) => {
                    debug!(trip_id = %trip_id, driver_id = %candidate.driver_id, reason = conflict.reason.as_str(), "candidate lost");
                    let retryable = matches!(
                        conflict.reason,
                        ConflictReason::DriverUnavailable | ConflictReason::StaleDriverState
                    );
                    last_conflict = Some(conflict);
                    if !retryable {
                        break;
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(match last_conflict {
            Some(conflict) => BindError::Conflict(conflict).into(),
            None => DispatchError::NoCandidates(trip_id),
        })
    }

    /// Reload the weight set outside a scheduler cycle.
    pub async fn refresh_weights(&self) -> ScoringWeights {
        self.weights.refresh().await
    }

    pub async fn update_weights(&self, weights: ScoringWeights) -> Result<ScoringWeights> {
        self.weights.update(weights, self.clock.now()).await
    }

    async fn load_trip(&self, trip_id: TripId) -> Result<Trip> {
        self.collaborators
            .trips
            .get(trip_id)
            .await?
            .ok_or(DispatchError::TripNotFound(trip_id))
    }
}

fn conflict(trip_id: TripId, reason: ConflictReason) -> DispatchError {
    DispatchError::Bind(BindError::Conflict(Conflict::new(trip_id, reason)))
}
