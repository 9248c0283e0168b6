//! In-process collaborator implementations.
//!
//! Each conditional update runs inside one write-lock critical section with no
//! `.await`, which is what makes it a compare-and-swap. Poisoned locks surface
//! as [`StoreError::Unavailable`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    CasOutcome, DriverFilter, DriverRegistry, ScheduledRideStore, SettingsStore, TripStore,
};
use crate::audit::{AuditEvent, AuditLog, AuditQuery, AuditRecord, AuditSubject};
use crate::config::ScoringWeights;
use crate::error::StoreError;
use crate::geo::{DriverSpatialIndex, GeoPoint, SearchArea};
use crate::model::{
    Driver, DriverId, DriverStatus, ScheduledRide, ScheduledRideId, Trip, TripId, TripPatch,
    TripStamp, TripStatus,
};

/// Radius queries above this scan every driver instead of the H3 grid disk.
const MAX_INDEXED_RADIUS_KM: f64 = 50.0;

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>, StoreError> {
    lock.read()
        .map_err(|_| StoreError::Unavailable("store lock poisoned".into()))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>, StoreError> {
    lock.write()
        .map_err(|_| StoreError::Unavailable("store lock poisoned".into()))
}

/// Counts down injected transient failures.
#[derive(Debug, Default)]
struct FaultInjector {
    remaining: AtomicU32,
}

impl FaultInjector {
    fn arm(&self, failures: u32) {
        self.remaining.store(failures, Ordering::SeqCst);
    }

    fn check(&self, what: &str) -> Result<(), StoreError> {
        let took = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if took {
            Err(StoreError::Unavailable(format!("injected {what} failure")))
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryTripStore {
    trips: RwLock<HashMap<TripId, Trip>>,
    faults: FaultInjector,
}

impl InMemoryTripStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` writes fail with a transient error.
    pub fn fail_next_writes(&self, n: u32) {
        self.faults.arm(n);
    }
}

#[async_trait]
impl TripStore for InMemoryTripStore {
    async fn insert(&self, trip: Trip) -> Result<(), StoreError> {
        self.faults.check("trip insert")?;
        write(&self.trips)?.insert(trip.id, trip);
        Ok(())
    }

    async fn get(&self, id: TripId) -> Result<Option<Trip>, StoreError> {
        Ok(read(&self.trips)?.get(&id).cloned())
    }

    async fn list_by_status(&self, status: TripStatus) -> Result<Vec<Trip>, StoreError> {
        let mut trips: Vec<Trip> = read(&self.trips)?
            .values()
            .filter(|trip| trip.status == status)
            .cloned()
            .collect();
        trips.sort_by_key(|trip| trip.created_at);
        Ok(trips)
    }

    async fn update_if(
        &self,
        id: TripId,
        expected: TripStamp,
        patch: TripPatch,
    ) -> Result<CasOutcome<Trip>, StoreError> {
        self.faults.check("trip update")?;
        let mut trips = write(&self.trips)?;
        let trip = trips
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("trip {id}")))?;
        if trip.stamp() != expected {
            return Ok(CasOutcome::Mismatch(trip.clone()));
        }
        if let Some(next) = patch.status {
            if !trip.status.can_advance_to(next) {
                return Err(StoreError::InvalidTransition(format!(
                    "trip {id}: {} -> {next}",
                    trip.status
                )));
            }
        }
        patch.apply(trip);
        Ok(CasOutcome::Applied(trip.clone()))
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    drivers: HashMap<DriverId, Driver>,
    index: DriverSpatialIndex,
}

#[derive(Debug, Default)]
pub struct InMemoryDriverRegistry {
    state: RwLock<RegistryState>,
}

impl InMemoryDriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DriverRegistry for InMemoryDriverRegistry {
    async fn upsert(&self, driver: Driver) -> Result<(), StoreError> {
        let mut state = write(&self.state)?;
        state.index.upsert(driver.id, driver.position);
        state.drivers.insert(driver.id, driver);
        Ok(())
    }

    async fn get(&self, id: DriverId) -> Result<Option<Driver>, StoreError> {
        Ok(read(&self.state)?.drivers.get(&id).cloned())
    }

    async fn list(&self, filter: &DriverFilter) -> Result<Vec<Driver>, StoreError> {
        let state = read(&self.state)?;
        let mut drivers: Vec<Driver> = match filter.area {
            Some(SearchArea::Radius { center, radius_km }) if radius_km <= MAX_INDEXED_RADIUS_KM => {
                state
                    .index
                    .candidates_within(center, radius_km)
                    .into_iter()
                    .filter_map(|id| state.drivers.get(&id))
                    .filter(|driver| filter.matches(driver))
                    .cloned()
                    .collect()
            }
            _ => state
                .drivers
                .values()
                .filter(|driver| filter.matches(driver))
                .cloned()
                .collect(),
        };
        drivers.sort_by_key(|driver| driver.id);
        Ok(drivers)
    }

    async fn heartbeat(
        &self,
        id: DriverId,
        position: Option<GeoPoint>,
        online: bool,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = write(&self.state)?;
        let driver = state
            .drivers
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("driver {id}")))?;
        driver.position = position;
        driver.online = online;
        driver.last_seen_at = at;
        if !online {
            driver.status = DriverStatus::Offline;
        } else if driver.status == DriverStatus::Offline {
            driver.status = DriverStatus::Idle;
        }
        state.index.upsert(id, position);
        Ok(())
    }

    async fn update_status_if(
        &self,
        id: DriverId,
        expected: &[DriverStatus],
        next: DriverStatus,
    ) -> Result<CasOutcome<Driver>, StoreError> {
        let mut state = write(&self.state)?;
        let driver = state
            .drivers
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("driver {id}")))?;
        if !expected.contains(&driver.status) {
            return Ok(CasOutcome::Mismatch(driver.clone()));
        }
        driver.status = next;
        Ok(CasOutcome::Applied(driver.clone()))
    }
}

#[derive(Debug, Default)]
pub struct InMemoryScheduledRideStore {
    rides: RwLock<HashMap<ScheduledRideId, ScheduledRide>>,
}

impl InMemoryScheduledRideStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScheduledRideStore for InMemoryScheduledRideStore {
    async fn insert(&self, ride: ScheduledRide) -> Result<(), StoreError> {
        write(&self.rides)?.insert(ride.id, ride);
        Ok(())
    }

    async fn get(&self, id: ScheduledRideId) -> Result<Option<ScheduledRide>, StoreError> {
        Ok(read(&self.rides)?.get(&id).cloned())
    }

    async fn list_unprocessed(&self) -> Result<Vec<ScheduledRide>, StoreError> {
        let mut rides: Vec<ScheduledRide> = read(&self.rides)?
            .values()
            .filter(|ride| !ride.processed)
            .cloned()
            .collect();
        rides.sort_by_key(|ride| ride.scheduled_time);
        Ok(rides)
    }

    async fn claim_if_unclaimed(
        &self,
        id: ScheduledRideId,
        driver: DriverId,
    ) -> Result<CasOutcome<ScheduledRide>, StoreError> {
        let mut rides = write(&self.rides)?;
        let ride = rides
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("scheduled ride {id}")))?;
        if ride.is_claimed() {
            return Ok(CasOutcome::Mismatch(ride.clone()));
        }
        ride.processed = true;
        ride.accepted_driver_id = Some(driver);
        Ok(CasOutcome::Applied(ride.clone()))
    }
}

#[derive(Debug, Default)]
pub struct InMemoryAuditLog {
    records: RwLock<Vec<AuditRecord>>,
    next_seq: AtomicU64,
    faults: FaultInjector,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` appends fail with a transient error.
    pub fn fail_next_appends(&self, n: u32) {
        self.faults.arm(n);
    }

    pub fn len(&self) -> usize {
        read(&self.records).map(|records| records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AuditLog for InMemoryAuditLog {
    async fn append(
        &self,
        subject: AuditSubject,
        at: DateTime<Utc>,
        event: AuditEvent,
    ) -> Result<AuditRecord, StoreError> {
        self.faults.check("audit append")?;
        let mut records = write(&self.records)?;
        let record = AuditRecord {
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst) + 1,
            subject,
            at,
            event,
        };
        records.push(record.clone());
        Ok(record)
    }

    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditRecord>, StoreError> {
        Ok(read(&self.records)?
            .iter()
            .filter(|record| query.matches(record))
            .cloned()
            .collect())
    }
}

#[derive(Debug, Default)]
pub struct InMemorySettingsStore {
    weights: Mutex<Option<ScoringWeights>>,
    unavailable: std::sync::atomic::AtomicBool,
}

impl InMemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_weights(weights: ScoringWeights) -> Self {
        Self {
            weights: Mutex::new(Some(weights)),
            ..Self::default()
        }
    }

    /// Simulate the remote settings table being unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("settings store offline".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SettingsStore for InMemorySettingsStore {
    async fn load_weights(&self) -> Result<Option<ScoringWeights>, StoreError> {
        self.check()?;
        let weights = self
            .weights
            .lock()
            .map_err(|_| StoreError::Unavailable("settings lock poisoned".into()))?;
        Ok(*weights)
    }

    async fn save_weights(&self, weights: ScoringWeights) -> Result<(), StoreError> {
        self.check()?;
        let mut stored = self
            .weights
            .lock()
            .map_err(|_| StoreError::Unavailable("settings lock poisoned".into()))?;
        *stored = Some(weights);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CarClass, NewTrip, PassengerId, Place};

    fn trip() -> Trip {
        Trip::from_request(
            NewTrip {
                passenger_id: PassengerId::new(),
                pickup: Place::new(GeoPoint::new(25.033, 121.565), ""),
                dropoff: Place::new(GeoPoint::new(25.047, 121.517), ""),
                car_class: CarClass::Standard,
                price_estimate: None,
            },
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn conditional_update_rejects_stale_stamp() {
        let store = InMemoryTripStore::new();
        let trip = trip();
        let id = trip.id;
        let stamp = trip.stamp();
        store.insert(trip).await.expect("insert");

        let first = store
            .update_if(id, stamp, TripPatch::bind(DriverId::new(), Utc::now()))
            .await
            .expect("update");
        assert!(first.is_applied());

        let second = store
            .update_if(id, stamp, TripPatch::bind(DriverId::new(), Utc::now()))
            .await
            .expect("update");
        assert!(matches!(second, CasOutcome::Mismatch(current) if current.status == TripStatus::Accepted));
    }

    #[tokio::test]
    async fn conditional_update_refuses_regression() {
        let store = InMemoryTripStore::new();
        let mut trip = trip();
        trip.status = TripStatus::InProgress;
        trip.driver_id = Some(DriverId::new());
        let id = trip.id;
        let stamp = trip.stamp();
        store.insert(trip).await.expect("insert");

        let err = store
            .update_if(id, stamp, TripPatch::release())
            .await
            .expect_err("regression");
        assert!(matches!(err, StoreError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn claim_is_first_writer_wins() {
        let store = InMemoryScheduledRideStore::new();
        let ride = ScheduledRide::new(
            PassengerId::new(),
            Place::new(GeoPoint::new(25.0, 121.5), ""),
            Place::new(GeoPoint::new(25.1, 121.6), ""),
            Utc::now(),
        );
        let id = ride.id;
        store.insert(ride).await.expect("insert");

        let winner = DriverId::new();
        assert!(store.claim_if_unclaimed(id, winner).await.expect("claim").is_applied());
        match store.claim_if_unclaimed(id, DriverId::new()).await.expect("claim") {
            CasOutcome::Mismatch(current) => assert_eq!(current.accepted_driver_id, Some(winner)),
            CasOutcome::Applied(_) => panic!("second claim must not apply"),
        }
        assert!(store.list_unprocessed().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn injected_faults_are_transient_and_bounded() {
        let log = InMemoryAuditLog::new();
        log.fail_next_appends(1);
        let subject = AuditSubject::Settings;
        let event = AuditEvent::DispatchSettingsUpdate {
            weights: ScoringWeights::default(),
        };
        let err = log
            .append(subject, Utc::now(), event.clone())
            .await
            .expect_err("injected");
        assert!(err.is_transient());
        let record = log.append(subject, Utc::now(), event).await.expect("append");
        assert_eq!(record.seq, 1);
    }
}
