use crate::config::{RankingConfig, ScoringWeights};
use crate::model::CarClass;

/// Highest rating a driver can hold.
const MAX_RATING: f64 = 5.0;

/// Raw cost inputs for one driver-trip pairing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreComponents {
    pub distance_km: f64,
    pub eta_min: f64,
    pub recency_sec: f64,
    pub mismatch_penalty: f64,
    pub rating_penalty: f64,
}

impl ScoreComponents {
    pub fn new(
        distance_km: f64,
        eta_min: f64,
        recency_sec: f64,
        requested: CarClass,
        candidate: CarClass,
        rating: Option<f64>,
        config: &RankingConfig,
    ) -> Self {
        Self {
            distance_km,
            eta_min,
            recency_sec: recency_sec.max(0.0),
            mismatch_penalty: mismatch_penalty(requested, candidate, config.vehicle_mismatch_penalty),
            rating_penalty: rating_penalty(rating, config.default_rating),
        }
    }
}

pub fn mismatch_penalty(requested: CarClass, candidate: CarClass, penalty: f64) -> f64 {
    if requested == candidate {
        0.0
    } else {
        penalty
    }
}

/// `max(0, 5 - rating)`, with `default_rating` for unrated drivers.
pub fn rating_penalty(rating: Option<f64>, default_rating: f64) -> f64 {
    let rating = rating.filter(|r| r.is_finite()).unwrap_or(default_rating);
    (MAX_RATING - rating).max(0.0)
}

/// Weighted cost; lower is better.
///
/// `wDist·distanceKm + wEta·etaMin + wRecency·(recencySec/norm) + wVehicle·mismatch + wRating·ratingPenalty`
pub fn score(components: &ScoreComponents, weights: &ScoringWeights, recency_norm_secs: f64) -> f64 {
    weights.distance * components.distance_km
        + weights.eta * components.eta_min
        + weights.recency * (components.recency_sec / recency_norm_secs)
        + weights.vehicle_mismatch * components.mismatch_penalty
        + weights.rating * components.rating_penalty
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ScoreComponents {
        ScoreComponents {
            distance_km: 2.0,
            eta_min: 5.0,
            recency_sec: 60.0,
            mismatch_penalty: 0.0,
            rating_penalty: 0.5,
        }
    }

    #[test]
    fn score_is_monotone_in_every_component() {
        let weights = ScoringWeights {
            distance: 0.7,
            eta: 0.3,
            recency: 1.1,
            vehicle_mismatch: 0.0,
            rating: 2.0,
        };
        let bumps: [fn(&mut ScoreComponents, f64); 5] = [
            |c, d| c.distance_km += d,
            |c, d| c.eta_min += d,
            |c, d| c.recency_sec += d,
            |c, d| c.mismatch_penalty += d,
            |c, d| c.rating_penalty += d,
        ];
        for bump in bumps {
            let mut previous = score(&base(), &weights, 300.0);
            for step in 1..20 {
                let mut components = base();
                bump(&mut components, step as f64 * 0.75);
                let current = score(&components, &weights, 300.0);
                assert!(current >= previous, "score decreased: {previous} -> {current}");
                previous = current;
            }
        }
    }

    #[test]
    fn equal_weights_sum_components() {
        let weights = ScoringWeights::default();
        let total = score(&base(), &weights, 300.0);
        let expected = 0.2 * 2.0 + 0.2 * 5.0 + 0.2 * (60.0 / 300.0) + 0.0 + 0.2 * 0.5;
        assert!((total - expected).abs() < 1e-12);
    }

    #[test]
    fn unrated_driver_uses_default_rating() {
        assert_eq!(rating_penalty(None, 4.0), 1.0);
        assert_eq!(rating_penalty(Some(5.0), 4.0), 0.0);
        assert_eq!(rating_penalty(Some(5.5), 4.0), 0.0);
    }

    #[test]
    fn mismatch_only_when_class_differs() {
        assert_eq!(mismatch_penalty(CarClass::Van, CarClass::Van, 3.0), 0.0);
        assert_eq!(mismatch_penalty(CarClass::Van, CarClass::Standard, 3.0), 3.0);
    }
}
