//! Pre-booked rides: lookahead offers, the scheduled lobby, and first-writer
//! claims.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, AuditLog, AuditSubject};
use crate::config::{secs, OfferConfig, ScheduledConfig, ScoringWeights};
use crate::error::{ClaimError, StoreError};
use crate::matching::{AreaLimit, CandidateRanker, RankOrder, RankRequest};
use crate::model::{DriverId, DriverStatus, ScheduledRide, ScheduledRideId};
use crate::offers::{DispatchOffer, OfferBroker};
use crate::retry::{with_backoff, RetryPolicy};
use crate::store::{CasOutcome, ScheduledRideStore};

/// Any online driver may take a future booking.
const LOBBY_STATUSES: [DriverStatus; 4] = [
    DriverStatus::Idle,
    DriverStatus::Busy,
    DriverStatus::OnTrip,
    DriverStatus::BusyOverlay,
];

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ScheduledReport {
    /// (ride, number of offers published)
    pub offered: Vec<(ScheduledRideId, usize)>,
    /// Inside the lookahead but still covered by live offers.
    pub skipped_live: Vec<ScheduledRideId>,
}

#[derive(Clone)]
pub struct ScheduledRideDispatcher {
    rides: Arc<dyn ScheduledRideStore>,
    audit: Arc<dyn AuditLog>,
    ranker: CandidateRanker,
    offers: OfferBroker,
    config: ScheduledConfig,
    offer_config: OfferConfig,
    retry: RetryPolicy,
}

impl ScheduledRideDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rides: Arc<dyn ScheduledRideStore>,
        audit: Arc<dyn AuditLog>,
        ranker: CandidateRanker,
        offers: OfferBroker,
        config: ScheduledConfig,
        offer_config: OfferConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            rides,
            audit,
            ranker,
            offers,
            config,
            offer_config,
            retry,
        }
    }

    /// Offer every unclaimed ride due within the lookahead to the nearest
    /// online drivers. Rides with a live offer are left alone.
    pub async fn sweep(&self, weights: &ScoringWeights, now: DateTime<Utc>) -> Result<ScheduledReport, StoreError> {
        let horizon = now + secs(self.config.lookahead_secs);
        let mut report = ScheduledReport::default();
        for ride in self.rides.list_unprocessed().await? {
            if ride.is_claimed() || ride.scheduled_time > horizon {
                continue;
            }
            let subject = AuditSubject::ScheduledRide(ride.id);
            if self.offers.has_live_offer(subject, now).await? {
                report.skipped_live.push(ride.id);
                continue;
            }
            let request = RankRequest::for_scheduled_ride(&ride)
                .statuses(&LOBBY_STATUSES)
                .area(AreaLimit::Unbounded)
                .order(RankOrder::Nearest)
                .limit(self.config.fanout);
            let pool = self.ranker.rank(&request, weights, now).await?;
            let offers = self
                .offers
                .broadcast_scheduled(&ride, &pool.candidates, self.config.offer_ttl_secs, now)
                .await?;
            debug!(ride_id = %ride.id, offers = offers.len(), "scheduled ride offered");
            report.offered.push((ride.id, offers.len()));
        }
        Ok(report)
    }

    /// Unclaimed rides scheduled after `now`, soonest first.
    pub async fn lobby(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledRide>, StoreError> {
        Ok(self
            .rides
            .list_unprocessed()
            .await?
            .into_iter()
            .filter(|ride| !ride.is_claimed() && ride.scheduled_time > now)
            .collect())
    }

    /// Open a prebook bid window for one driver; `ttl_secs` defaults to the
    /// configured prebook TTL.
    pub async fn offer_prebook(
        &self,
        ride_id: ScheduledRideId,
        driver_id: DriverId,
        ttl_secs: Option<u64>,
        now: DateTime<Utc>,
    ) -> Result<DispatchOffer, ClaimError> {
        let ride = self
            .rides
            .get(ride_id)
            .await?
            .ok_or(ClaimError::NotFound(ride_id))?;
        if ride.is_claimed() {
            return Err(ClaimError::AlreadyClaimed(ride_id));
        }
        let ttl = ttl_secs.unwrap_or(self.offer_config.prebook_ttl_secs);
        Ok(self.offers.prebook_offer(&ride, driver_id, ttl, now).await?)
    }

    /// First-writer-wins claim. Every losing attempt gets
    /// [`ClaimError::AlreadyClaimed`].
    pub async fn claim(
        &self,
        ride_id: ScheduledRideId,
        driver_id: DriverId,
        now: DateTime<Utc>,
    ) -> Result<ScheduledRide, ClaimError> {
        let outcome = match self.rides.claim_if_unclaimed(ride_id, driver_id).await {
            Ok(outcome) => outcome,
            Err(StoreError::NotFound(_)) => return Err(ClaimError::NotFound(ride_id)),
            Err(err) => return Err(err.into()),
        };
        let ride = match outcome {
            CasOutcome::Applied(ride) => ride,
            CasOutcome::Mismatch(_) => {
                debug!(ride_id = %ride_id, driver_id = %driver_id, "scheduled ride already claimed");
                return Err(ClaimError::AlreadyClaimed(ride_id));
            }
        };
        let appended = with_backoff(self.retry, "append scheduled_accept", || {
            self.audit.append(
                AuditSubject::ScheduledRide(ride_id),
                now,
                AuditEvent::ScheduledAccept { driver_id },
            )
        })
        .await;
        if let Err(err) = appended {
            warn!(ride_id = %ride_id, error = %err, "scheduled_accept append failed after claim");
        }
        info!(ride_id = %ride_id, driver_id = %driver_id, "scheduled ride claimed");
        Ok(ride)
    }
}
