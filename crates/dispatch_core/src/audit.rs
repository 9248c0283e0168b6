//! Append-only audit/event stream.
//!
//! The log is both the audit trail and the publication channel: candidate
//! pools, offers and priority locks exist only as records here, and clients
//! observe them by querying. Each event kind has a fixed payload schema.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ScoringWeights;
use crate::error::StoreError;
use crate::geo::GeoPoint;
use crate::model::{DriverId, ScheduledRideId, TripId, TripStatus};

/// What an audit record is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum AuditSubject {
    Trip(TripId),
    ScheduledRide(ScheduledRideId),
    Settings,
    /// Operator actions spanning several trips.
    Batch,
}

/// One ranked candidate as persisted in a `candidate_pool` record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolEntry {
    pub id: DriverId,
    pub score: f64,
    pub distance_km: f64,
    pub eta_min: f64,
    #[serde(default)]
    pub overlay: bool,
}

/// Recipient target of an offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OfferTarget {
    Trip { trip_id: TripId },
    ScheduledRide { ride_id: ScheduledRideId },
}

impl OfferTarget {
    pub fn subject(self) -> AuditSubject {
        match self {
            OfferTarget::Trip { trip_id } => AuditSubject::Trip(trip_id),
            OfferTarget::ScheduledRide { ride_id } => AuditSubject::ScheduledRide(ride_id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReassignReason {
    TimeoutNoArrival,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LongDistanceMode {
    /// Operator allows normal automatic dispatch.
    Auto,
    /// Operator dispatches by hand; no automatic action.
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    CandidatePool {
        candidates: Vec<PoolEntry>,
    },
    AssignDriver {
        driver_id: DriverId,
    },
    AutoReassign {
        reason: ReassignReason,
        previous: DriverId,
        assigned: Option<DriverId>,
    },
    DispatchOffer {
        driver_id: DriverId,
        #[serde(flatten)]
        target: OfferTarget,
        pickup: GeoPoint,
        dropoff: GeoPoint,
        dist_km: f64,
        price: f64,
        expires_at: DateTime<Utc>,
    },
    OverlayOffer {
        driver_id: DriverId,
        trip_id: TripId,
        remain_min: f64,
        distance_km: f64,
        pickup: GeoPoint,
        dropoff: GeoPoint,
        expires_at: DateTime<Utc>,
    },
    PrebookOffer {
        driver_id: DriverId,
        ride_id: ScheduledRideId,
        expires_in_sec: u64,
        expires_at: DateTime<Utc>,
    },
    PriorityLock {
        lock_until: DateTime<Utc>,
        admin_until: DateTime<Utc>,
        authorized_driver: Option<DriverId>,
    },
    LongDistanceRequest {
        distance_km: f64,
    },
    LongDistanceHandle {
        mode: LongDistanceMode,
    },
    ScheduledAccept {
        driver_id: DriverId,
    },
    CandidateAssignBatch {
        count: usize,
        ids: Vec<TripId>,
    },
    DispatchReject {
        driver_id: DriverId,
    },
    DispatchSettingsUpdate {
        weights: ScoringWeights,
    },
    DriverArrived {
        driver_id: DriverId,
    },
    #[serde(rename = "trip_status")]
    TripStatusChange {
        from: TripStatus,
        to: TripStatus,
        driver_id: Option<DriverId>,
    },
}

/// Payload-free discriminant of [`AuditEvent`], used for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    CandidatePool,
    AssignDriver,
    AutoReassign,
    DispatchOffer,
    OverlayOffer,
    PrebookOffer,
    PriorityLock,
    LongDistanceRequest,
    LongDistanceHandle,
    ScheduledAccept,
    CandidateAssignBatch,
    DispatchReject,
    DispatchSettingsUpdate,
    DriverArrived,
    #[serde(rename = "trip_status")]
    TripStatusChange,
}

impl AuditEvent {
    pub fn kind(&self) -> AuditKind {
        match self {
            AuditEvent::CandidatePool { .. } => AuditKind::CandidatePool,
            AuditEvent::AssignDriver { .. } => AuditKind::AssignDriver,
            AuditEvent::AutoReassign { .. } => AuditKind::AutoReassign,
            AuditEvent::DispatchOffer { .. } => AuditKind::DispatchOffer,
            AuditEvent::OverlayOffer { .. } => AuditKind::OverlayOffer,
            AuditEvent::PrebookOffer { .. } => AuditKind::PrebookOffer,
            AuditEvent::PriorityLock { .. } => AuditKind::PriorityLock,
            AuditEvent::LongDistanceRequest { .. } => AuditKind::LongDistanceRequest,
            AuditEvent::LongDistanceHandle { .. } => AuditKind::LongDistanceHandle,
            AuditEvent::ScheduledAccept { .. } => AuditKind::ScheduledAccept,
            AuditEvent::CandidateAssignBatch { .. } => AuditKind::CandidateAssignBatch,
            AuditEvent::DispatchReject { .. } => AuditKind::DispatchReject,
            AuditEvent::DispatchSettingsUpdate { .. } => AuditKind::DispatchSettingsUpdate,
            AuditEvent::DriverArrived { .. } => AuditKind::DriverArrived,
            AuditEvent::TripStatusChange { .. } => AuditKind::TripStatusChange,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Monotonic sequence number assigned by the log.
    pub seq: u64,
    pub subject: AuditSubject,
    pub at: DateTime<Utc>,
    pub event: AuditEvent,
}

/// Record filter. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuditQuery {
    pub subject: Option<AuditSubject>,
    pub kinds: Vec<AuditKind>,
    /// Inclusive lower bound on `at`.
    pub since: Option<DateTime<Utc>>,
}

impl AuditQuery {
    pub fn for_trip(trip_id: TripId) -> Self {
        Self {
            subject: Some(AuditSubject::Trip(trip_id)),
            ..Self::default()
        }
    }

    pub fn for_subject(subject: AuditSubject) -> Self {
        Self {
            subject: Some(subject),
            ..Self::default()
        }
    }

    pub fn kind(mut self, kind: AuditKind) -> Self {
        self.kinds.push(kind);
        self
    }

    pub fn since(mut self, at: DateTime<Utc>) -> Self {
        self.since = Some(at);
        self
    }

    pub fn matches(&self, record: &AuditRecord) -> bool {
        self.subject.map_or(true, |subject| subject == record.subject)
            && (self.kinds.is_empty() || self.kinds.contains(&record.event.kind()))
            && self.since.map_or(true, |since| record.at >= since)
    }
}

#[async_trait]
pub trait AuditLog: Send + Sync {
    /// Append one event; returns the stored record with its sequence number.
    async fn append(
        &self,
        subject: AuditSubject,
        at: DateTime<Utc>,
        event: AuditEvent,
    ) -> Result<AuditRecord, StoreError>;

    /// Matching records in append order.
    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditRecord>, StoreError>;

    /// Most recent matching record.
    async fn latest(&self, query: &AuditQuery) -> Result<Option<AuditRecord>, StoreError> {
        Ok(self.query(query).await?.into_iter().next_back())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_snake_case_tags() {
        let driver_id = DriverId::new();
        let json = serde_json::to_value(AuditEvent::AssignDriver { driver_id }).expect("json");
        assert_eq!(json["type"], "assign_driver");
        assert_eq!(json["driver_id"], serde_json::json!(driver_id));

        let reassign = AuditEvent::AutoReassign {
            reason: ReassignReason::TimeoutNoArrival,
            previous: driver_id,
            assigned: None,
        };
        let json = serde_json::to_value(&reassign).expect("json");
        assert_eq!(json["reason"], "timeout_no_arrival");
    }

    #[test]
    fn dispatch_offer_flattens_target_and_round_trips() {
        let trip_id = TripId::new();
        let event = AuditEvent::DispatchOffer {
            driver_id: DriverId::new(),
            target: OfferTarget::Trip { trip_id },
            pickup: GeoPoint::new(25.0, 121.5),
            dropoff: GeoPoint::new(25.1, 121.6),
            dist_km: 12.5,
            price: 21.25,
            expires_at: Utc::now(),
        };
        let json = serde_json::to_value(&event).expect("json");
        assert_eq!(json["type"], "dispatch_offer");
        assert_eq!(json["trip_id"], serde_json::json!(trip_id));
        let back: AuditEvent = serde_json::from_value(json).expect("decode");
        assert_eq!(back, event);
    }

    #[test]
    fn query_filters_by_kind_and_time() {
        let trip_id = TripId::new();
        let at = Utc::now();
        let record = AuditRecord {
            seq: 1,
            subject: AuditSubject::Trip(trip_id),
            at,
            event: AuditEvent::DriverArrived {
                driver_id: DriverId::new(),
            },
        };
        assert!(AuditQuery::for_trip(trip_id).kind(AuditKind::DriverArrived).matches(&record));
        assert!(!AuditQuery::for_trip(trip_id).kind(AuditKind::AssignDriver).matches(&record));
        assert!(!AuditQuery::for_trip(trip_id)
            .since(at + chrono::Duration::seconds(1))
            .matches(&record));
        assert!(!AuditQuery::for_trip(TripId::new()).matches(&record));
    }
}
