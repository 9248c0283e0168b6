mod support;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use dispatch_core::audit::{AuditEvent, AuditKind, AuditLog, AuditQuery, AuditSubject, OfferTarget, ReassignReason};
use dispatch_core::config::ScoringWeights;
use dispatch_core::engine::AcceptedOffer;
use dispatch_core::error::{ClaimError, DispatchError, EtaError};
use dispatch_core::eta::{EtaEstimate, EtaProvider, EtaSource};
use dispatch_core::geo::{haversine_km, GeoPoint};
use dispatch_core::matching::{RankOrder, RankRequest};
use dispatch_core::model::{DriverStatus, TripStatus};
use dispatch_core::offers::OfferKind;
use dispatch_core::store::ScheduledRideStore;
use dispatch_core::sweeps::LongDistanceOutcome;
use dispatch_core::test_helpers::test_epoch;
use support::entities::{dropoff_at_km, scheduled_ride, seeded_dropoff, trip_to, DriverBuilder};
use support::world::TestEngineBuilder;

/// Routing provider where one origin is stuck in traffic.
struct Congested {
    slow_origin: GeoPoint,
}

#[async_trait]
impl EtaProvider for Congested {
    async fn eta(&self, origin: GeoPoint, dest: GeoPoint) -> Result<EtaEstimate, EtaError> {
        let distance_km = haversine_km(origin, dest);
        let minutes = if origin == self.slow_origin {
            40.0
        } else {
            distance_km * 2.0
        };
        Ok(EtaEstimate {
            minutes,
            distance_km,
            source: EtaSource::Provider,
        })
    }
}

#[tokio::test]
async fn equal_weights_rank_by_ascending_score() {
    let world = TestEngineBuilder::new()
        .with_weights(ScoringWeights::default())
        .build();
    let now = world.now();
    let far = world.add_driver(DriverBuilder::new().km_from_pickup(3.0).build(now)).await;
    let near = world.add_driver(DriverBuilder::new().km_from_pickup(0.5).build(now)).await;
    let mid = world.add_driver(DriverBuilder::new().km_from_pickup(1.5).build(now)).await;

    let submitted = world.engine.submit_trip(trip_to(seeded_dropoff())).await.expect("submit");
    assert_eq!(submitted.long_distance, LongDistanceOutcome::Normal);

    let pool = world
        .engine
        .rank_trip(submitted.trip.id, None)
        .await
        .expect("rank");
    assert_eq!(pool.driver_ids(), vec![near, mid, far]);
    let scores: Vec<f64> = pool.candidates.iter().map(|c| c.score).collect();
    assert!(scores.windows(2).all(|pair| pair[0] <= pair[1]));

    let snapshots = world
        .stores
        .audit
        .query(&AuditQuery::for_trip(submitted.trip.id).kind(AuditKind::CandidatePool))
        .await
        .expect("query");
    assert_eq!(snapshots.len(), 2, "one snapshot from intake, one from rank_trip");
}

#[tokio::test]
async fn nearest_by_eta_can_differ_from_nearest_by_distance() {
    let now = test_epoch();
    let stuck = DriverBuilder::new().km_from_pickup(0.5).build(now);
    let clear = DriverBuilder::new().km_from_pickup(2.0).build(now);
    let world = TestEngineBuilder::new()
        .with_eta_provider(Arc::new(Congested {
            slow_origin: stuck.position.expect("position"),
        }))
        .build();
    let stuck_id = world.add_driver(stuck).await;
    let clear_id = world.add_driver(clear).await;

    let submitted = world.engine.submit_trip(trip_to(seeded_dropoff())).await.expect("submit");
    let offered: Vec<_> = submitted.offers.iter().map(|offer| offer.driver_id).collect();
    assert_eq!(offered, vec![clear_id, stuck_id]);

    let request = RankRequest::for_trip(&submitted.trip).order(RankOrder::NearestUsable);
    let pool = world
        .engine
        .ranker()
        .rank(&request, &ScoringWeights::default(), now)
        .await
        .expect("rank");
    assert_eq!(pool.candidates[0].driver_id, clear_id);
    assert!(pool.candidates[0].distance_km > pool.candidates[1].distance_km);
}

#[tokio::test]
async fn long_trip_broadcasts_after_silent_decision_window() {
    let world = TestEngineBuilder::new().build();
    let start = world.now();
    let mut drivers = Vec::new();
    for i in 1..=14 {
        let driver = DriverBuilder::new().km_from_pickup(2.0 * i as f64).build(start);
        drivers.push(world.add_driver(driver).await);
    }

    let submitted = world.engine.submit_trip(trip_to(dropoff_at_km(32.0))).await.expect("submit");
    let trip_id = submitted.trip.id;
    assert_eq!(submitted.long_distance, LongDistanceOutcome::Flagged);
    assert!(submitted.offers.is_empty());

    let flagged = world
        .stores
        .audit
        .latest(&AuditQuery::for_trip(trip_id).kind(AuditKind::LongDistanceRequest))
        .await
        .expect("query")
        .expect("long_distance_request recorded");
    match flagged.event {
        AuditEvent::LongDistanceRequest { distance_km } => assert!((distance_km - 32.0).abs() < 0.1),
        other => panic!("unexpected event {other:?}"),
    }

    let weights = ScoringWeights::default();
    world.advance_secs(89);
    let early = world
        .engine
        .long_distance()
        .sweep(&weights, world.now())
        .await
        .expect("sweep");
    assert_eq!(early.pending, vec![trip_id]);
    assert!(world
        .engine
        .offers()
        .offers_for(AuditSubject::Trip(trip_id), None)
        .await
        .expect("offers")
        .is_empty());

    world.advance_secs(1);
    let now = world.now();
    let due = world.engine.long_distance().sweep(&weights, now).await.expect("sweep");
    assert_eq!(due.broadcast, vec![trip_id]);

    let offers = world
        .engine
        .offers()
        .offers_for(AuditSubject::Trip(trip_id), None)
        .await
        .expect("offers");
    assert_eq!(offers.len(), 12);
    assert!(offers.iter().all(|offer| offer.expires_at == now + Duration::seconds(90)));
    let offered: Vec<_> = offers.iter().map(|offer| offer.driver_id).collect();
    assert_eq!(offered, drivers[..12].to_vec(), "nearest twelve, beyond the normal radius");

    let again = world.engine.long_distance().sweep(&weights, now).await.expect("sweep");
    assert!(again.broadcast.is_empty(), "broadcast happens once");
}

#[tokio::test]
async fn stalled_trip_is_rebound_to_a_different_driver() {
    let world = TestEngineBuilder::new().build();
    let start = world.now();
    let original = world.add_driver(DriverBuilder::new().km_from_pickup(0.5).build(start)).await;
    let backup = world.add_driver(DriverBuilder::new().km_from_pickup(2.0).build(start)).await;

    let submitted = world.engine.submit_trip(trip_to(seeded_dropoff())).await.expect("submit");
    let trip_id = submitted.trip.id;
    let accepted = world
        .engine
        .accept_offer(OfferTarget::Trip { trip_id }, original)
        .await
        .expect("accept");
    assert!(matches!(accepted, AcceptedOffer::Trip(_)));

    let weights = ScoringWeights::default();
    world.advance_secs(300);
    let on_the_boundary = world
        .engine
        .reassignment()
        .sweep(&weights, world.now())
        .await
        .expect("sweep");
    assert!(on_the_boundary.reassigned.is_empty());

    world.advance_secs(1);
    world.heartbeat(backup).await;
    let report = world
        .engine
        .reassignment()
        .sweep(&weights, world.now())
        .await
        .expect("sweep");
    assert_eq!(report.reassigned, vec![(trip_id, original, backup)]);

    let trip = world.trip(trip_id).await;
    assert_eq!(trip.status, TripStatus::Accepted);
    assert_eq!(trip.driver_id, Some(backup));
    assert_eq!(world.driver(original).await.status, DriverStatus::Idle);
    assert_eq!(world.driver(backup).await.status, DriverStatus::OnTrip);

    let reassigned = world
        .stores
        .audit
        .latest(&AuditQuery::for_trip(trip_id).kind(AuditKind::AutoReassign))
        .await
        .expect("query")
        .expect("auto_reassign recorded");
    assert_eq!(
        reassigned.event,
        AuditEvent::AutoReassign {
            reason: ReassignReason::TimeoutNoArrival,
            previous: original,
            assigned: Some(backup),
        }
    );
}

#[tokio::test]
async fn stalled_trip_without_replacement_stays_bound() {
    let world = TestEngineBuilder::new().build();
    let start = world.now();
    let only = world.add_driver(DriverBuilder::new().km_from_pickup(0.5).build(start)).await;
    let submitted = world.engine.submit_trip(trip_to(seeded_dropoff())).await.expect("submit");
    let trip_id = submitted.trip.id;
    world
        .engine
        .accept_offer(OfferTarget::Trip { trip_id }, only)
        .await
        .expect("accept");

    world.advance_secs(301);
    let report = world
        .engine
        .reassignment()
        .sweep(&ScoringWeights::default(), world.now())
        .await
        .expect("sweep");
    assert_eq!(report.no_candidates, vec![trip_id]);
    assert_eq!(world.trip(trip_id).await.driver_id, Some(only));

    let snapshot = world
        .stores
        .audit
        .latest(&AuditQuery::for_trip(trip_id).kind(AuditKind::CandidatePool))
        .await
        .expect("query")
        .expect("empty pool recorded for an operator");
    assert_eq!(snapshot.event, AuditEvent::CandidatePool { candidates: vec![] });
}

#[tokio::test]
async fn scheduled_ride_is_offered_then_claimed_once() {
    let world = TestEngineBuilder::new().build();
    let start = world.now();
    let statuses = [DriverStatus::Idle, DriverStatus::OnTrip, DriverStatus::Busy];
    let mut drivers = Vec::new();
    for i in 1..=14 {
        let driver = DriverBuilder::new()
            .km_from_pickup(i as f64)
            .status(statuses[i % statuses.len()])
            .build(start);
        drivers.push(world.add_driver(driver).await);
    }
    let ride = scheduled_ride(start, 10);
    let ride_id = ride.id;
    world.stores.rides.insert(ride).await.expect("insert ride");

    let weights = ScoringWeights::default();
    let report = world
        .engine
        .scheduled()
        .sweep(&weights, start)
        .await
        .expect("sweep");
    assert_eq!(report.offered, vec![(ride_id, 12)]);

    let offers = world
        .engine
        .offers()
        .offers_for(AuditSubject::ScheduledRide(ride_id), None)
        .await
        .expect("offers");
    assert_eq!(offers.len(), 12);
    assert!(offers.iter().all(|offer| offer.kind == OfferKind::Dispatch
        && offer.expires_at == start + Duration::seconds(60)));
    assert_eq!(
        offers.iter().map(|offer| offer.driver_id).collect::<Vec<_>>(),
        drivers[..12].to_vec()
    );

    let repeat = world.engine.scheduled().sweep(&weights, start).await.expect("sweep");
    assert_eq!(repeat.skipped_live, vec![ride_id]);

    let target = OfferTarget::ScheduledRide { ride_id };
    let claimed = match world.engine.accept_offer(target, drivers[0]).await.expect("claim") {
        AcceptedOffer::ScheduledRide(ride) => ride,
        other => panic!("unexpected acceptance {other:?}"),
    };
    assert!(claimed.processed);
    assert_eq!(claimed.accepted_driver_id, Some(drivers[0]));

    let late = world.engine.accept_offer(target, drivers[1]).await;
    assert!(matches!(
        late,
        Err(DispatchError::Claim(ClaimError::AlreadyClaimed(id))) if id == ride_id
    ));

    let outsider = world.engine.accept_offer(target, drivers[13]).await;
    assert!(matches!(
        outsider,
        Err(DispatchError::Claim(ClaimError::NotOffered(_)))
    ));

    assert!(world.engine.scheduled().lobby(start).await.expect("lobby").is_empty());
    let accepted = world
        .stores
        .audit
        .latest(&AuditQuery::for_subject(AuditSubject::ScheduledRide(ride_id)).kind(AuditKind::ScheduledAccept))
        .await
        .expect("query");
    assert!(accepted.is_some());
}
