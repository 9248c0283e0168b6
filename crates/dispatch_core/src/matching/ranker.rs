use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::{debug, info};

use crate::audit::{AuditLog, AuditSubject};
use crate::config::{RankingConfig, ScoringWeights};
use crate::error::StoreError;
use crate::eta::FallbackEta;
use crate::geo::{haversine_km, BoundingBox, GeoPoint, SearchArea};
use crate::model::{CarClass, Driver, DriverId, DriverStatus, ScheduledRide, Trip, TripStatus};
use crate::retry::{with_backoff, RetryPolicy};
use crate::store::{DriverFilter, DriverRegistry, TripStore};

use super::scoring::{score, ScoreComponents};
use super::types::{CandidatePoolSnapshot, OverlayInfo, RankOrder, RankedCandidate};

/// Spatial restriction on candidates.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum AreaLimit {
    /// `RankingConfig::search_radius_km` around the center.
    #[default]
    Default,
    Radius(f64),
    Bounds(BoundingBox),
    /// No spatial limit.
    Unbounded,
}

/// What to rank for and how.
#[derive(Debug, Clone, PartialEq)]
pub struct RankRequest {
    pub subject: AuditSubject,
    pub pickup: GeoPoint,
    pub car_class: CarClass,
    /// Center of the search area; the pickup when unset.
    pub center: Option<GeoPoint>,
    pub area: AreaLimit,
    pub exclude: HashSet<DriverId>,
    /// Also admit drivers finishing a trip close to the pickup.
    pub include_overlay: bool,
    /// Statuses admitted as regular candidates.
    pub statuses: Vec<DriverStatus>,
    pub order: RankOrder,
    /// Top-K; the config default for the order when unset.
    pub limit: Option<usize>,
}

impl RankRequest {
    pub fn new(subject: AuditSubject, pickup: GeoPoint, car_class: CarClass) -> Self {
        Self {
            subject,
            pickup,
            car_class,
            center: None,
            area: AreaLimit::Default,
            exclude: HashSet::new(),
            include_overlay: false,
            statuses: vec![DriverStatus::Idle],
            order: RankOrder::ByScore,
            limit: None,
        }
    }

    pub fn for_trip(trip: &Trip) -> Self {
        Self::new(AuditSubject::Trip(trip.id), trip.pickup.point, trip.car_class)
    }

    pub fn for_scheduled_ride(ride: &ScheduledRide) -> Self {
        Self::new(
            AuditSubject::ScheduledRide(ride.id),
            ride.pickup.point,
            ride.car_class,
        )
    }

    pub fn centered_at(mut self, center: GeoPoint) -> Self {
        self.center = Some(center);
        self
    }

    pub fn area(mut self, area: AreaLimit) -> Self {
        self.area = area;
        self
    }

    pub fn excluding(mut self, drivers: impl IntoIterator<Item = DriverId>) -> Self {
        self.exclude.extend(drivers);
        self
    }

    pub fn with_overlay(mut self) -> Self {
        self.include_overlay = true;
        self
    }

    pub fn statuses(mut self, statuses: &[DriverStatus]) -> Self {
        self.statuses = statuses.to_vec();
        self
    }

    pub fn order(mut self, order: RankOrder) -> Self {
        self.order = order;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn search_area(&self, config: &RankingConfig) -> Option<SearchArea> {
        let center = self.center.unwrap_or(self.pickup);
        match self.area {
            AreaLimit::Default => config
                .search_radius_km
                .map(|radius_km| SearchArea::Radius { center, radius_km }),
            AreaLimit::Radius(radius_km) => Some(SearchArea::Radius { center, radius_km }),
            AreaLimit::Bounds(bounds) => Some(SearchArea::Bounds(bounds)),
            AreaLimit::Unbounded => None,
        }
    }

    fn top_k(&self, config: &RankingConfig) -> usize {
        self.limit.unwrap_or(match self.order {
            RankOrder::ByScore => config.default_top_k,
            RankOrder::NearestUsable | RankOrder::Nearest => config.nearest_top_k,
        })
    }
}

/// Builds filtered, scored and sorted driver pools.
///
/// Ranking is read-only apart from the `candidate_pool` record written by
/// [`CandidateRanker::rank`]. The weight set is an argument so one scheduling
/// cycle scores every trip with the same weights.
#[derive(Clone)]
pub struct CandidateRanker {
    drivers: Arc<dyn DriverRegistry>,
    trips: Arc<dyn TripStore>,
    audit: Arc<dyn AuditLog>,
    eta: FallbackEta,
    config: RankingConfig,
    retry: RetryPolicy,
}

impl CandidateRanker {
    pub fn new(
        drivers: Arc<dyn DriverRegistry>,
        trips: Arc<dyn TripStore>,
        audit: Arc<dyn AuditLog>,
        eta: FallbackEta,
        config: RankingConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            drivers,
            trips,
            audit,
            eta,
            config,
            retry,
        }
    }

    pub fn config(&self) -> &RankingConfig {
        &self.config
    }

    /// Rank and persist the result as a `candidate_pool` record.
    pub async fn rank(
        &self,
        request: &RankRequest,
        weights: &ScoringWeights,
        now: DateTime<Utc>,
    ) -> Result<CandidatePoolSnapshot, StoreError> {
        let snapshot = self.compute(request, weights, now).await?;
        with_backoff(self.retry, "append candidate_pool", || {
            self.audit.append(snapshot.subject, now, snapshot.to_event())
        })
        .await?;
        if snapshot.is_empty() {
            info!(subject = ?snapshot.subject, "no eligible candidates");
        } else {
            debug!(subject = ?snapshot.subject, count = snapshot.len(), "candidate pool computed");
        }
        Ok(snapshot)
    }

    /// Rank without persisting anything.
    pub async fn compute(
        &self,
        request: &RankRequest,
        weights: &ScoringWeights,
        now: DateTime<Utc>,
    ) -> Result<CandidatePoolSnapshot, StoreError> {
        let mut statuses = request.statuses.clone();
        if request.include_overlay && !statuses.contains(&DriverStatus::OnTrip) {
            statuses.push(DriverStatus::OnTrip);
        }
        let mut filter = DriverFilter::online().with_statuses(&statuses);
        if let Some(area) = request.search_area(&self.config) {
            filter = filter.within(area);
        }

        let eligible: Vec<Driver> = self
            .drivers
            .list(&filter)
            .await?
            .into_iter()
            .filter(|driver| driver.is_fresh(now, self.config.freshness_secs))
            .filter(|driver| !request.exclude.contains(&driver.id))
            .collect();

        let active_trips = if request.include_overlay
            && eligible.iter().any(|d| d.status == DriverStatus::OnTrip)
        {
            self.active_trips_by_driver().await?
        } else {
            HashMap::new()
        };

        let scored = join_all(eligible.iter().map(|driver| {
            let overlay_trip = if request.statuses.contains(&driver.status) {
                None
            } else {
                active_trips.get(&driver.id)
            };
            self.score_driver(request, driver, overlay_trip, weights, now)
        }))
        .await;

        let mut candidates: Vec<RankedCandidate> = scored.into_iter().flatten().collect();
        sort_candidates(&mut candidates, request.order);
        candidates.truncate(request.top_k(&self.config));

        Ok(CandidatePoolSnapshot {
            subject: request.subject,
            candidates,
            computed_at: now,
        })
    }

    /// In-progress trips keyed by their bound driver.
    async fn active_trips_by_driver(&self) -> Result<HashMap<DriverId, Trip>, StoreError> {
        Ok(self
            .trips
            .list_by_status(TripStatus::InProgress)
            .await?
            .into_iter()
            .filter_map(|trip| trip.driver_id.map(|driver| (driver, trip)))
            .collect())
    }

    /// `None` when the driver does not qualify. A driver whose status is not
    /// in the request's regular statuses qualifies only as an overlay.
    async fn score_driver(
        &self,
        request: &RankRequest,
        driver: &Driver,
        overlay_trip: Option<&Trip>,
        weights: &ScoringWeights,
        now: DateTime<Utc>,
    ) -> Option<RankedCandidate> {
        let position = driver.position?;
        let regular = request.statuses.contains(&driver.status);
        let distance_km = haversine_km(position, request.pickup);

        let (eta_min, eta_source, overlay) = if regular {
            let estimate = self.eta.resolve(position, request.pickup).await;
            (estimate.minutes, estimate.source, None)
        } else {
            let active = overlay_trip?;
            let dropoff = active.dropoff.point;
            let dropoff_to_pickup_km = haversine_km(dropoff, request.pickup);
            if dropoff_to_pickup_km > self.config.overlay_max_dropoff_km {
                return None;
            }
            let remaining = self.eta.resolve(position, dropoff).await;
            if remaining.minutes > self.config.overlay_max_remaining_min {
                return None;
            }
            let onward = self.eta.resolve(dropoff, request.pickup).await;
            let overlay = OverlayInfo {
                active_trip: active.id,
                remaining_min: remaining.minutes,
                dropoff_to_pickup_km,
            };
            (remaining.minutes + onward.minutes, onward.source, Some(overlay))
        };

        let recency_sec = driver.heartbeat_age_secs(now) as f64;
        let components = ScoreComponents::new(
            distance_km,
            eta_min,
            recency_sec,
            request.car_class,
            driver.derived_class(),
            driver.rating,
            &self.config,
        );
        Some(RankedCandidate {
            driver_id: driver.id,
            score: score(&components, weights, self.config.recency_norm_secs),
            distance_km,
            eta_min,
            eta_source,
            recency_sec: components.recency_sec,
            components,
            overlay,
        })
    }
}

/// Sort in place; ties fall back to driver id so equal inputs rank identically.
pub fn sort_candidates(candidates: &mut [RankedCandidate], order: RankOrder) {
    candidates.sort_by(|a, b| {
        let primary = match order {
            RankOrder::ByScore => Ordering::Equal,
            RankOrder::NearestUsable => a.eta_min.total_cmp(&b.eta_min),
            RankOrder::Nearest => a.distance_km.total_cmp(&b.distance_km),
        };
        primary
            .then_with(|| a.score.total_cmp(&b.score))
            .then_with(|| a.driver_id.cmp(&b.driver_id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditEvent, AuditQuery};
    use crate::error::EtaError;
    use crate::eta::{EtaEstimate, EtaProvider, EtaSource};
    use crate::model::{NewTrip, PassengerId, Place, Vehicle};
    use crate::store::{InMemoryAuditLog, InMemoryDriverRegistry, InMemoryTripStore};
    use async_trait::async_trait;
    use chrono::Duration;

    const PICKUP: GeoPoint = GeoPoint::new(25.033, 121.565);
    const DROPOFF: GeoPoint = GeoPoint::new(25.047, 121.517);

    struct Fixture {
        drivers: Arc<InMemoryDriverRegistry>,
        trips: Arc<InMemoryTripStore>,
        audit: Arc<InMemoryAuditLog>,
        now: DateTime<Utc>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                drivers: Arc::new(InMemoryDriverRegistry::new()),
                trips: Arc::new(InMemoryTripStore::new()),
                audit: Arc::new(InMemoryAuditLog::new()),
                now: Utc::now(),
            }
        }

        fn ranker(&self, eta: FallbackEta) -> CandidateRanker {
            CandidateRanker::new(
                self.drivers.clone(),
                self.trips.clone(),
                self.audit.clone(),
                eta,
                RankingConfig::default(),
                RetryPolicy::none(),
            )
        }

        async fn driver(&self, at: GeoPoint, age_secs: i64, status: DriverStatus) -> DriverId {
            let driver = Driver {
                id: DriverId::new(),
                name: String::new(),
                position: Some(at),
                online: true,
                status,
                last_seen_at: self.now - Duration::seconds(age_secs),
                vehicle: Some(Vehicle {
                    class: CarClass::Standard,
                    plate: String::new(),
                }),
                rating: Some(5.0),
            };
            let id = driver.id;
            self.drivers.upsert(driver).await.expect("upsert");
            id
        }

        fn trip(&self, pickup: GeoPoint, dropoff: GeoPoint) -> Trip {
            Trip::from_request(
                NewTrip {
                    passenger_id: PassengerId::new(),
                    pickup: Place::new(pickup, "pickup"),
                    dropoff: Place::new(dropoff, "dropoff"),
                    car_class: CarClass::Standard,
                    price_estimate: None,
                },
                self.now,
            )
        }
    }

    /// Slow to one specific driver position, fast elsewhere.
    struct Congested {
        slow_origin: GeoPoint,
    }

    #[async_trait]
    impl EtaProvider for Congested {
        async fn eta(&self, origin: GeoPoint, dest: GeoPoint) -> Result<EtaEstimate, EtaError> {
            let distance_km = haversine_km(origin, dest);
            let minutes = if origin == self.slow_origin { 45.0 } else { distance_km * 2.0 };
            Ok(EtaEstimate {
                minutes,
                distance_km,
                source: EtaSource::Provider,
            })
        }
    }

    #[tokio::test]
    async fn stale_and_unpositioned_drivers_are_never_returned() {
        let fx = Fixture::new();
        let fresh = fx.driver(GeoPoint::new(25.034, 121.566), 30, DriverStatus::Idle).await;
        fx.driver(GeoPoint::new(25.035, 121.566), 600, DriverStatus::Idle).await;
        fx.driver(GeoPoint::new(25.035, 121.567), 601, DriverStatus::Idle).await;
        let mut ghost = fx.drivers.get(fresh).await.expect("get").expect("driver");
        ghost.id = DriverId::new();
        ghost.position = None;
        fx.drivers.upsert(ghost).await.expect("upsert");

        let trip = fx.trip(PICKUP, DROPOFF);
        let pool = fx
            .ranker(FallbackEta::haversine(30.0))
            .compute(&RankRequest::for_trip(&trip), &ScoringWeights::default(), fx.now)
            .await
            .expect("rank");

        assert_eq!(pool.driver_ids(), vec![fresh]);
    }

    #[tokio::test]
    async fn nearest_usable_prefers_eta_over_haversine_distance() {
        let fx = Fixture::new();
        let closest = GeoPoint::new(25.034, 121.566);
        let near = fx.driver(closest, 10, DriverStatus::Idle).await;
        let farther = fx.driver(GeoPoint::new(25.040, 121.575), 10, DriverStatus::Idle).await;

        let eta = FallbackEta::new(Arc::new(Congested { slow_origin: closest }), 30.0);
        let trip = fx.trip(PICKUP, DROPOFF);
        let request = RankRequest::for_trip(&trip).order(RankOrder::NearestUsable);
        let pool = fx
            .ranker(eta)
            .compute(&request, &ScoringWeights::default(), fx.now)
            .await
            .expect("rank");

        assert_eq!(pool.driver_ids(), vec![farther, near]);
        assert!(pool.candidates[0].distance_km > pool.candidates[1].distance_km);
    }

    #[tokio::test]
    async fn excluded_drivers_and_busy_drivers_are_skipped() {
        let fx = Fixture::new();
        let a = fx.driver(GeoPoint::new(25.034, 121.566), 10, DriverStatus::Idle).await;
        let b = fx.driver(GeoPoint::new(25.036, 121.566), 10, DriverStatus::Idle).await;
        fx.driver(GeoPoint::new(25.035, 121.566), 10, DriverStatus::Busy).await;

        let trip = fx.trip(PICKUP, DROPOFF);
        let request = RankRequest::for_trip(&trip).excluding([a]);
        let pool = fx
            .ranker(FallbackEta::haversine(30.0))
            .compute(&request, &ScoringWeights::default(), fx.now)
            .await
            .expect("rank");
        assert_eq!(pool.driver_ids(), vec![b]);
    }

    #[tokio::test]
    async fn overlay_admits_driver_finishing_nearby() {
        let fx = Fixture::new();
        let overlay_driver = fx.driver(GeoPoint::new(25.040, 121.560), 10, DriverStatus::OnTrip).await;
        let far_overlay = fx.driver(GeoPoint::new(25.200, 121.700), 10, DriverStatus::OnTrip).await;

        let mut active = fx.trip(GeoPoint::new(25.050, 121.550), GeoPoint::new(25.035, 121.563));
        active.status = TripStatus::InProgress;
        active.driver_id = Some(overlay_driver);
        fx.trips.insert(active.clone()).await.expect("insert");
        let mut far = fx.trip(GeoPoint::new(25.210, 121.710), GeoPoint::new(25.300, 121.800));
        far.status = TripStatus::InProgress;
        far.driver_id = Some(far_overlay);
        fx.trips.insert(far).await.expect("insert");

        let trip = fx.trip(PICKUP, DROPOFF);
        let request = RankRequest::for_trip(&trip).with_overlay().area(AreaLimit::Unbounded);
        let pool = fx
            .ranker(FallbackEta::haversine(30.0))
            .compute(&request, &ScoringWeights::default(), fx.now)
            .await
            .expect("rank");

        assert_eq!(pool.driver_ids(), vec![overlay_driver]);
        let overlay = pool.candidates[0].overlay.expect("overlay info");
        assert_eq!(overlay.active_trip, active.id);
        assert!(pool.candidates[0].eta_min > overlay.remaining_min);
    }

    #[tokio::test]
    async fn rank_persists_snapshot_even_when_empty() {
        let fx = Fixture::new();
        let trip = fx.trip(PICKUP, DROPOFF);
        let pool = fx
            .ranker(FallbackEta::haversine(30.0))
            .rank(&RankRequest::for_trip(&trip), &ScoringWeights::default(), fx.now)
            .await
            .expect("rank");
        assert!(pool.is_empty());

        let records = fx.audit.query(&AuditQuery::for_trip(trip.id)).await.expect("query");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event, AuditEvent::CandidatePool { candidates: vec![] });
    }

    #[tokio::test]
    async fn limit_truncates_pool() {
        let fx = Fixture::new();
        for i in 0..8 {
            let offset = 0.001 * i as f64;
            fx.driver(GeoPoint::new(25.034 + offset, 121.566), 10, DriverStatus::Idle).await;
        }
        let trip = fx.trip(PICKUP, DROPOFF);
        let ranker = fx.ranker(FallbackEta::haversine(30.0));
        let weights = ScoringWeights::default();

        let default_pool = ranker
            .compute(&RankRequest::for_trip(&trip), &weights, fx.now)
            .await
            .expect("rank");
        assert_eq!(default_pool.len(), 5);

        let limited = ranker
            .compute(&RankRequest::for_trip(&trip).limit(2), &weights, fx.now)
            .await
            .expect("rank");
        assert_eq!(limited.len(), 2);
        assert!(limited.candidates[0].score <= limited.candidates[1].score);
    }
}
