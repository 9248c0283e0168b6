//! Time-bounded offers to drivers.
//!
//! Offers are advisory: they exist only as audit records, are never retracted,
//! and several drivers may race to accept the same trip. Which driver wins is
//! decided by the conditional bind in [`crate::assignment`], not here. An
//! offer that expires without a bind is simply abandoned.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::audit::{AuditEvent, AuditKind, AuditLog, AuditQuery, AuditRecord, AuditSubject, OfferTarget};
use crate::config::{secs, OfferConfig};
use crate::error::StoreError;
use crate::matching::{OverlayInfo, RankedCandidate};
use crate::model::{DriverId, ScheduledRide, Trip, TripId};
use crate::pricing::estimate_fare;
use crate::retry::{with_backoff, RetryPolicy};

const OFFER_KINDS: [AuditKind; 3] = [
    AuditKind::DispatchOffer,
    AuditKind::OverlayOffer,
    AuditKind::PrebookOffer,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferKind {
    Dispatch,
    Overlay,
    Prebook,
}

/// An offer as rebuilt from its audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchOffer {
    pub seq: u64,
    pub kind: OfferKind,
    pub target: OfferTarget,
    pub driver_id: DriverId,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl DispatchOffer {
    pub fn from_record(record: &AuditRecord) -> Option<Self> {
        let (kind, target, driver_id, expires_at) = match &record.event {
            AuditEvent::DispatchOffer {
                driver_id,
                target,
                expires_at,
                ..
            } => (OfferKind::Dispatch, *target, *driver_id, *expires_at),
            AuditEvent::OverlayOffer {
                driver_id,
                trip_id,
                expires_at,
                ..
            } => (
                OfferKind::Overlay,
                OfferTarget::Trip { trip_id: *trip_id },
                *driver_id,
                *expires_at,
            ),
            AuditEvent::PrebookOffer {
                driver_id,
                ride_id,
                expires_at,
                ..
            } => (
                OfferKind::Prebook,
                OfferTarget::ScheduledRide { ride_id: *ride_id },
                *driver_id,
                *expires_at,
            ),
            _ => return None,
        };
        Some(Self {
            seq: record.seq,
            kind,
            target,
            driver_id,
            issued_at: record.at,
            expires_at,
        })
    }

    /// Acceptable strictly before `expires_at`.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Result of checking a driver's acceptance against the published offers.
#[derive(Debug, Clone, PartialEq)]
pub enum Acceptance {
    Live(DispatchOffer),
    /// Every offer to this driver for the target has expired.
    Expired(DispatchOffer),
    NotAddressed,
}

/// Publishes offers and answers questions about them.
#[derive(Clone)]
pub struct OfferBroker {
    audit: Arc<dyn AuditLog>,
    config: OfferConfig,
    retry: RetryPolicy,
}

impl OfferBroker {
    pub fn new(audit: Arc<dyn AuditLog>, config: OfferConfig, retry: RetryPolicy) -> Self {
        Self {
            audit,
            config,
            retry,
        }
    }

    pub fn config(&self) -> &OfferConfig {
        &self.config
    }

    async fn publish(
        &self,
        subject: AuditSubject,
        event: AuditEvent,
        now: DateTime<Utc>,
    ) -> Result<DispatchOffer, StoreError> {
        let record = with_backoff(self.retry, "append offer", || {
            self.audit.append(subject, now, event.clone())
        })
        .await?;
        DispatchOffer::from_record(&record)
            .ok_or_else(|| StoreError::Serialization("appended record is not an offer".into()))
    }

    /// Direct `dispatch_offer` for a trip.
    pub async fn offer(
        &self,
        trip: &Trip,
        driver_id: DriverId,
        ttl_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<DispatchOffer, StoreError> {
        let expires_at = now + secs(ttl_secs);
        let event = AuditEvent::DispatchOffer {
            driver_id,
            target: OfferTarget::Trip { trip_id: trip.id },
            pickup: trip.pickup.point,
            dropoff: trip.dropoff.point,
            dist_km: trip.distance_km,
            price: trip.price_estimate,
            expires_at,
        };
        let offer = self.publish(AuditSubject::Trip(trip.id), event, now).await?;
        debug!(trip_id = %trip.id, driver_id = %driver_id, %expires_at, "dispatch offer published");
        Ok(offer)
    }

    /// `dispatch_offer` for a pre-booked ride.
    pub async fn offer_scheduled(
        &self,
        ride: &ScheduledRide,
        driver_id: DriverId,
        ttl_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<DispatchOffer, StoreError> {
        let dist_km = ride.distance_km();
        let event = AuditEvent::DispatchOffer {
            driver_id,
            target: OfferTarget::ScheduledRide { ride_id: ride.id },
            pickup: ride.pickup.point,
            dropoff: ride.dropoff.point,
            dist_km,
            price: estimate_fare(dist_km, ride.car_class),
            expires_at: now + secs(ttl_secs),
        };
        self.publish(AuditSubject::ScheduledRide(ride.id), event, now)
            .await
    }

    /// `overlay_offer` to a driver finishing another trip near the pickup.
    pub async fn overlay_offer(
        &self,
        trip: &Trip,
        driver_id: DriverId,
        overlay: &OverlayInfo,
        ttl_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<DispatchOffer, StoreError> {
        let event = AuditEvent::OverlayOffer {
            driver_id,
            trip_id: trip.id,
            remain_min: overlay.remaining_min,
            distance_km: overlay.dropoff_to_pickup_km,
            pickup: trip.pickup.point,
            dropoff: trip.dropoff.point,
            expires_at: now + secs(ttl_secs),
        };
        self.publish(AuditSubject::Trip(trip.id), event, now).await
    }

    /// `prebook_offer` bid window for a scheduled ride.
    pub async fn prebook_offer(
        &self,
        ride: &ScheduledRide,
        driver_id: DriverId,
        ttl_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<DispatchOffer, StoreError> {
        let event = AuditEvent::PrebookOffer {
            driver_id,
            ride_id: ride.id,
            expires_in_sec: ttl_secs,
            expires_at: now + secs(ttl_secs),
        };
        self.publish(AuditSubject::ScheduledRide(ride.id), event, now)
            .await
    }

    /// Fan a trip out to ranked candidates. Overlay candidates get an
    /// `overlay_offer` with the overlay TTL, everyone else a `dispatch_offer`
    /// with `ttl_secs`.
    pub async fn broadcast(
        &self,
        trip: &Trip,
        candidates: &[RankedCandidate],
        ttl_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<Vec<DispatchOffer>, StoreError> {
        let mut offers = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let offer = match &candidate.overlay {
                Some(overlay) => {
                    self.overlay_offer(trip, candidate.driver_id, overlay, self.config.overlay_ttl_secs, now)
                        .await?
                }
                None => self.offer(trip, candidate.driver_id, ttl_secs, now).await?,
            };
            offers.push(offer);
        }
        Ok(offers)
    }

    pub async fn broadcast_scheduled(
        &self,
        ride: &ScheduledRide,
        candidates: &[RankedCandidate],
        ttl_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<Vec<DispatchOffer>, StoreError> {
        let mut offers = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            offers.push(
                self.offer_scheduled(ride, candidate.driver_id, ttl_secs, now)
                    .await?,
            );
        }
        Ok(offers)
    }

    /// Every offer ever published for `subject`, oldest first.
    pub async fn offers_for(
        &self,
        subject: AuditSubject,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<DispatchOffer>, StoreError> {
        let query = AuditQuery {
            kinds: OFFER_KINDS.to_vec(),
            since,
            ..AuditQuery::for_subject(subject)
        };
        let records = self.audit.query(&query).await?;
        Ok(records.iter().filter_map(DispatchOffer::from_record).collect())
    }

    pub async fn has_live_offer(&self, subject: AuditSubject, now: DateTime<Utc>) -> Result<bool, StoreError> {
        Ok(self
            .offers_for(subject, None)
            .await?
            .iter()
            .any(|offer| offer.is_live(now)))
    }

    /// Unexpired offers addressed to `driver_id`, excluding trips the driver
    /// has rejected.
    pub async fn live_offers_for(
        &self,
        driver_id: DriverId,
        now: DateTime<Utc>,
    ) -> Result<Vec<DispatchOffer>, StoreError> {
        let query = AuditQuery {
            kinds: OFFER_KINDS.to_vec(),
            ..AuditQuery::default()
        };
        let records = self.audit.query(&query).await?;
        let mut live = Vec::new();
        for offer in records.iter().filter_map(DispatchOffer::from_record) {
            if offer.driver_id != driver_id || !offer.is_live(now) {
                continue;
            }
            if let OfferTarget::Trip { trip_id } = offer.target {
                if self.rejected_drivers(trip_id).await?.contains(&driver_id) {
                    continue;
                }
            }
            live.push(offer);
        }
        Ok(live)
    }

    /// Check an acceptance attempt. The newest offer to the driver decides.
    pub async fn check_acceptance(
        &self,
        target: OfferTarget,
        driver_id: DriverId,
        now: DateTime<Utc>,
    ) -> Result<Acceptance, StoreError> {
        let addressed: Vec<DispatchOffer> = self
            .offers_for(target.subject(), None)
            .await?
            .into_iter()
            .filter(|offer| offer.driver_id == driver_id)
            .collect();
        if let Some(live) = addressed.iter().rev().find(|offer| offer.is_live(now)) {
            return Ok(Acceptance::Live(live.clone()));
        }
        Ok(match addressed.into_iter().last() {
            Some(expired) => Acceptance::Expired(expired),
            None => Acceptance::NotAddressed,
        })
    }

    /// Append `dispatch_reject`. The driver is left out of later automatic
    /// rankings of this trip.
    pub async fn reject(
        &self,
        trip_id: TripId,
        driver_id: DriverId,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        with_backoff(self.retry, "append dispatch_reject", || {
            self.audit.append(
                AuditSubject::Trip(trip_id),
                now,
                AuditEvent::DispatchReject { driver_id },
            )
        })
        .await?;
        debug!(trip_id = %trip_id, driver_id = %driver_id, "offer rejected");
        Ok(())
    }

    pub async fn rejected_drivers(&self, trip_id: TripId) -> Result<HashSet<DriverId>, StoreError> {
        let query = AuditQuery::for_trip(trip_id).kind(AuditKind::DispatchReject);
        Ok(self
            .audit
            .query(&query)
            .await?
            .into_iter()
            .filter_map(|record| match record.event {
                AuditEvent::DispatchReject { driver_id } => Some(driver_id),
                _ => None,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::GeoPoint;
    use crate::model::{CarClass, NewTrip, PassengerId, Place};
    use crate::store::InMemoryAuditLog;
    use chrono::Duration;

    fn trip(now: DateTime<Utc>) -> Trip {
        Trip::from_request(
            NewTrip {
                passenger_id: PassengerId::new(),
                pickup: Place::new(GeoPoint::new(25.033, 121.565), "A"),
                dropoff: Place::new(GeoPoint::new(25.047, 121.517), "B"),
                car_class: CarClass::Standard,
                price_estimate: Some(12.0),
            },
            now,
        )
    }

    fn broker() -> (OfferBroker, Arc<InMemoryAuditLog>) {
        let audit = Arc::new(InMemoryAuditLog::new());
        (
            OfferBroker::new(audit.clone(), OfferConfig::default(), RetryPolicy::none()),
            audit,
        )
    }

    #[tokio::test]
    async fn offer_expires_exactly_at_ttl() {
        let (broker, _) = broker();
        let now = Utc::now();
        let trip = trip(now);
        let driver = DriverId::new();
        let offer = broker.offer(&trip, driver, 30, now).await.expect("offer");

        assert_eq!(offer.expires_at, now + Duration::seconds(30));
        assert!(offer.is_live(now + Duration::seconds(29)));
        assert!(!offer.is_live(now + Duration::seconds(30)));

        let target = OfferTarget::Trip { trip_id: trip.id };
        let late = broker
            .check_acceptance(target, driver, now + Duration::seconds(30))
            .await
            .expect("check");
        assert!(matches!(late, Acceptance::Expired(_)));
        let stranger = broker
            .check_acceptance(target, DriverId::new(), now)
            .await
            .expect("check");
        assert_eq!(stranger, Acceptance::NotAddressed);
    }

    #[tokio::test]
    async fn live_offers_skip_rejected_and_foreign_offers() {
        let (broker, _) = broker();
        let now = Utc::now();
        let (first, second) = (trip(now), trip(now));
        let driver = DriverId::new();
        broker.offer(&first, driver, 30, now).await.expect("offer");
        broker.offer(&second, driver, 30, now).await.expect("offer");
        broker.offer(&second, DriverId::new(), 30, now).await.expect("offer");
        broker.reject(first.id, driver, now).await.expect("reject");

        let live = broker.live_offers_for(driver, now).await.expect("live");
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].target, OfferTarget::Trip { trip_id: second.id });
        assert!(broker
            .rejected_drivers(first.id)
            .await
            .expect("rejected")
            .contains(&driver));
    }

    #[tokio::test]
    async fn prebook_offer_records_window() {
        let (broker, audit) = broker();
        let now = Utc::now();
        let ride = ScheduledRide::new(
            PassengerId::new(),
            Place::new(GeoPoint::new(25.0, 121.5), "A"),
            Place::new(GeoPoint::new(25.1, 121.6), "B"),
            now + Duration::minutes(30),
        );
        let offer = broker
            .prebook_offer(&ride, DriverId::new(), 10, now)
            .await
            .expect("prebook");
        assert_eq!(offer.kind, OfferKind::Prebook);
        let record = audit
            .latest(&AuditQuery::for_subject(AuditSubject::ScheduledRide(ride.id)))
            .await
            .expect("latest")
            .expect("record");
        assert!(matches!(record.event, AuditEvent::PrebookOffer { expires_in_sec: 10, .. }));
    }
}
