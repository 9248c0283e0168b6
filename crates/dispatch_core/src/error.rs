//! Error taxonomy for the dispatch engine.
//!
//! Lost compare-and-swap races are not failures: they surface as [`Conflict`]
//! and the caller re-ranks. Only [`StoreError::Unavailable`] is transient and
//! eligible for [`crate::retry::with_backoff`].

use thiserror::Error;

use crate::model::{DriverId, ScheduledRideId, TripId};

/// Failure reported by a storage collaborator (trip store, driver registry,
/// audit log, scheduled-ride store, settings store).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("invalid status transition: {0}")]
    InvalidTransition(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(String),
}

impl StoreError {
    /// Whether a retry with backoff may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

/// Routing/ETA provider failure. Never leaves [`crate::eta::FallbackEta`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EtaError {
    #[error("eta provider unavailable: {0}")]
    Unavailable(String),

    #[error("no route between the given points")]
    NoRoute,

    #[error("eta provider http error: {0}")]
    Http(String),
}

/// Why a conditional write (bind, release, claim) did not apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    /// Trip is no longer in an assignable state (cancelled, completed, bound).
    TripNotAssignable,
    /// Trip changed between read and conditional write.
    LostRace,
    /// Driver is not idle (or not on a trip for an overlay bind).
    DriverUnavailable,
    /// Driver went offline, lost its position, or stopped sending heartbeats.
    StaleDriverState,
    /// A long-distance priority window excludes this actor.
    PriorityLocked,
    /// The offer's `expires_at` has passed.
    OfferExpired,
    /// The offer is addressed to another driver.
    OfferNotAddressed,
    /// A scheduled ride was claimed by someone else first.
    AlreadyClaimed,
    /// The acting driver is not the one bound to the trip.
    NotAssignedDriver,
}

impl ConflictReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictReason::TripNotAssignable => "trip_not_assignable",
            ConflictReason::LostRace => "lost_race",
            ConflictReason::DriverUnavailable => "driver_unavailable",
            ConflictReason::StaleDriverState => "stale_driver_state",
            ConflictReason::PriorityLocked => "priority_locked",
            ConflictReason::OfferExpired => "offer_expired",
            ConflictReason::OfferNotAddressed => "offer_not_addressed",
            ConflictReason::AlreadyClaimed => "already_claimed",
            ConflictReason::NotAssignedDriver => "not_assigned_driver",
        }
    }
}

/// A lost race. Expected under concurrent sweeps; callers re-rank instead of
/// retrying the same write.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("conflict on trip {trip_id}: {}", reason.as_str())]
pub struct Conflict {
    pub trip_id: TripId,
    pub reason: ConflictReason,
}

impl Conflict {
    pub fn new(trip_id: TripId, reason: ConflictReason) -> Self {
        Self { trip_id, reason }
    }
}

/// Outcome error of [`crate::assignment::AssignmentCoordinator::bind`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BindError {
    #[error(transparent)]
    Conflict(#[from] Conflict),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl BindError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, BindError::Conflict(_))
    }

    pub fn conflict_reason(&self) -> Option<ConflictReason> {
        match self {
            BindError::Conflict(conflict) => Some(conflict.reason),
            BindError::Store(_) => None,
        }
    }
}

/// Outcome error of a scheduled-ride claim.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClaimError {
    #[error("scheduled ride {0} was already claimed")]
    AlreadyClaimed(ScheduledRideId),

    #[error("scheduled ride {0} not found")]
    NotFound(ScheduledRideId),

    #[error("offer for scheduled ride {0} has expired")]
    OfferExpired(ScheduledRideId),

    #[error("scheduled ride {0} was not offered to this driver")]
    NotOffered(ScheduledRideId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Invalid configuration or weight set.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(pub String);

/// Engine-level error union.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Bind(#[from] BindError),

    #[error(transparent)]
    Claim(#[from] ClaimError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("no driver found for trip {0}")]
    NoCandidates(TripId),

    #[error("trip {0} not found")]
    TripNotFound(TripId),

    #[error("driver {0} not found")]
    DriverNotFound(DriverId),
}

impl DispatchError {
    /// Message suitable for an operator or driver client.
    pub fn user_message(&self) -> &'static str {
        match self {
            DispatchError::NoCandidates(_) => "no driver found",
            DispatchError::Bind(BindError::Conflict(conflict))
                if conflict.reason == ConflictReason::PriorityLocked =>
            {
                "reassignment in progress"
            }
            DispatchError::Claim(ClaimError::AlreadyClaimed(_)) => "this booking is no longer available",
            _ => "action failed, please retry",
        }
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_unavailable_is_transient() {
        assert!(StoreError::Unavailable("timeout".into()).is_transient());
        assert!(!StoreError::NotFound("trip".into()).is_transient());
        assert!(!StoreError::InvalidTransition("x".into()).is_transient());
    }

    #[test]
    fn no_candidates_maps_to_operator_message() {
        let err = DispatchError::NoCandidates(TripId::new());
        assert_eq!(err.user_message(), "no driver found");
    }
}
