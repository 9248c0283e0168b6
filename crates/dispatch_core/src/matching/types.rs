use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::{AuditEvent, AuditSubject, PoolEntry};
use crate::eta::EtaSource;
use crate::model::{DriverId, TripId};

use super::scoring::ScoreComponents;

/// Sort order of a ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankOrder {
    /// Ascending score only.
    #[default]
    ByScore,
    /// Ascending ETA, then ascending score.
    NearestUsable,
    /// Ascending great-circle distance to the pickup, then ascending score.
    Nearest,
}

/// Back-to-back context for a driver still on another trip.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OverlayInfo {
    pub active_trip: TripId,
    /// Minutes until the driver reaches the active trip's dropoff.
    pub remaining_min: f64,
    /// Great-circle distance from the active dropoff to the new pickup.
    pub dropoff_to_pickup_km: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RankedCandidate {
    pub driver_id: DriverId,
    pub score: f64,
    pub distance_km: f64,
    pub eta_min: f64,
    pub eta_source: EtaSource,
    pub recency_sec: f64,
    pub components: ScoreComponents,
    pub overlay: Option<OverlayInfo>,
}

impl RankedCandidate {
    pub fn is_overlay(&self) -> bool {
        self.overlay.is_some()
    }

    pub fn to_pool_entry(&self) -> PoolEntry {
        PoolEntry {
            id: self.driver_id,
            score: self.score,
            distance_km: self.distance_km,
            eta_min: self.eta_min,
            overlay: self.is_overlay(),
        }
    }
}

/// A ranking at one point in time. Written once as a `candidate_pool` record.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidatePoolSnapshot {
    pub subject: AuditSubject,
    pub candidates: Vec<RankedCandidate>,
    pub computed_at: DateTime<Utc>,
}

impl CandidatePoolSnapshot {
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn top(&self) -> Option<&RankedCandidate> {
        self.candidates.first()
    }

    pub fn driver_ids(&self) -> Vec<DriverId> {
        self.candidates.iter().map(|c| c.driver_id).collect()
    }

    pub fn to_event(&self) -> AuditEvent {
        AuditEvent::CandidatePool {
            candidates: self.candidates.iter().map(RankedCandidate::to_pool_entry).collect(),
        }
    }
}
