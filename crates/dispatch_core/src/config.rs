//! Engine configuration: thresholds, TTLs, windows and sweep periods.
//!
//! Every section deserializes with defaults, so a config file only needs the
//! values it overrides.

use std::path::{Path, PathBuf};

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::eta::EtaProviderKind;

/// Weights of the candidate cost function. Lower total cost ranks higher.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringWeights {
    #[serde(rename = "wDist")]
    pub distance: f64,
    #[serde(rename = "wEta")]
    pub eta: f64,
    #[serde(rename = "wRecency")]
    pub recency: f64,
    #[serde(rename = "wVehicle")]
    pub vehicle_mismatch: f64,
    #[serde(rename = "wRating")]
    pub rating: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            distance: 0.2,
            eta: 0.2,
            recency: 0.2,
            vehicle_mismatch: 0.2,
            rating: 0.2,
        }
    }
}

impl ScoringWeights {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let named = [
            ("wDist", self.distance),
            ("wEta", self.eta),
            ("wRecency", self.recency),
            ("wVehicle", self.vehicle_mismatch),
            ("wRating", self.rating),
        ];
        for (name, value) in named {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError(format!("{name} must be a non-negative number, got {value}")));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RankingConfig {
    /// Drivers whose heartbeat is this old or older are never candidates.
    pub freshness_secs: u64,
    /// Speed assumed by the haversine ETA fallback.
    pub assumed_speed_kmh: f64,
    /// Heartbeat age is divided by this before weighting.
    pub recency_norm_secs: f64,
    pub vehicle_mismatch_penalty: f64,
    /// Rating assumed for drivers without one.
    pub default_rating: f64,
    /// Pool size for generic (score-ordered) rankings.
    pub default_top_k: usize,
    /// Pool size for nearest-usable selections (broadcasts).
    pub nearest_top_k: usize,
    /// Default search radius around the pickup; `None` searches everywhere.
    pub search_radius_km: Option<f64>,
    pub overlay_max_remaining_min: f64,
    pub overlay_max_dropoff_km: f64,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            freshness_secs: 600,
            assumed_speed_kmh: 30.0,
            recency_norm_secs: 300.0,
            vehicle_mismatch_penalty: 3.0,
            default_rating: 4.0,
            default_top_k: 5,
            nearest_top_k: 12,
            search_radius_km: Some(10.0),
            overlay_max_remaining_min: 10.0,
            overlay_max_dropoff_km: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OfferConfig {
    pub dispatch_ttl_secs: u64,
    pub overlay_ttl_secs: u64,
    pub prebook_ttl_secs: u64,
    /// Number of drivers offered a newly requested trip.
    pub broadcast_fanout: usize,
}

impl Default for OfferConfig {
    fn default() -> Self {
        Self {
            dispatch_ttl_secs: 30,
            overlay_ttl_secs: 20,
            prebook_ttl_secs: 10,
            broadcast_fanout: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReassignmentConfig {
    /// Accepted trips without an arrival this long after assignment are stalled.
    pub timeout_secs: u64,
    pub period_secs: u64,
}

impl Default for ReassignmentConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            period_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LongDistanceConfig {
    pub request_km: f64,
    pub lock_km: f64,
    pub decision_window_secs: u64,
    pub lock_secs: u64,
    pub admin_secs: u64,
    pub broadcast_count: usize,
    pub broadcast_ttl_secs: u64,
    pub period_secs: u64,
}

impl Default for LongDistanceConfig {
    fn default() -> Self {
        Self {
            request_km: 30.0,
            lock_km: 40.0,
            decision_window_secs: 90,
            lock_secs: 15,
            admin_secs: 90,
            broadcast_count: 12,
            broadcast_ttl_secs: 90,
            period_secs: 15,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduledConfig {
    pub lookahead_secs: u64,
    pub period_secs: u64,
    pub offer_ttl_secs: u64,
    pub fanout: usize,
}

impl Default for ScheduledConfig {
    fn default() -> Self {
        Self {
            lookahead_secs: 15 * 60,
            period_secs: 60,
            offer_ttl_secs: 60,
            fanout: 12,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub ranking: RankingConfig,
    pub offers: OfferConfig,
    pub reassignment: ReassignmentConfig,
    pub long_distance: LongDistanceConfig,
    pub scheduled: ScheduledConfig,
    pub retry: RetryConfig,
    pub eta_provider: EtaProviderKind,
    /// Durable copy of the last known weight set.
    pub weights_fallback_path: Option<PathBuf>,
}

impl DispatchConfig {
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|error| {
            ConfigError(format!("failed to read config '{}': {error}", path.display()))
        })?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|error| ConfigError(format!("failed to parse config: {error}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let ranking = &self.ranking;
        if !(ranking.assumed_speed_kmh.is_finite() && ranking.assumed_speed_kmh > 0.0) {
            return Err(ConfigError("ranking.assumed_speed_kmh must be positive".into()));
        }
        if !(ranking.recency_norm_secs.is_finite() && ranking.recency_norm_secs > 0.0) {
            return Err(ConfigError("ranking.recency_norm_secs must be positive".into()));
        }
        if ranking.vehicle_mismatch_penalty < 0.0 {
            return Err(ConfigError("ranking.vehicle_mismatch_penalty must be >= 0".into()));
        }
        if ranking.freshness_secs == 0 {
            return Err(ConfigError("ranking.freshness_secs must be > 0".into()));
        }
        if ranking.default_top_k == 0 || ranking.nearest_top_k == 0 {
            return Err(ConfigError("ranking top-k sizes must be > 0".into()));
        }
        let ld = &self.long_distance;
        if ld.lock_km < ld.request_km {
            return Err(ConfigError(
                "long_distance.lock_km must be >= long_distance.request_km".into(),
            ));
        }
        let periods = [
            ("reassignment.period_secs", self.reassignment.period_secs),
            ("long_distance.period_secs", ld.period_secs),
            ("scheduled.period_secs", self.scheduled.period_secs),
        ];
        for (name, value) in periods {
            if value == 0 {
                return Err(ConfigError(format!("{name} must be > 0")));
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError("retry.max_attempts must be > 0".into()));
        }
        Ok(())
    }
}

/// `u64` seconds as a chrono duration.
pub(crate) fn secs(value: u64) -> Duration {
    Duration::seconds(i64::try_from(value).unwrap_or(i64::MAX / 1_000))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config = DispatchConfig::from_json_str(r#"{"long_distance": {"request_km": 25.0}}"#)
            .expect("config");
        assert_eq!(config.long_distance.request_km, 25.0);
        assert_eq!(config.long_distance.lock_km, 40.0);
        assert_eq!(config.ranking.freshness_secs, 600);
        assert_eq!(config.scheduled.lookahead_secs, 900);
    }

    #[test]
    fn rejects_inverted_long_distance_thresholds() {
        let err = DispatchConfig::from_json_str(
            r#"{"long_distance": {"request_km": 50.0, "lock_km": 40.0}}"#,
        )
        .expect_err("inverted thresholds");
        assert!(err.0.contains("lock_km"));
    }

    #[test]
    fn weights_use_wire_names() {
        let json = serde_json::to_value(ScoringWeights::default()).expect("json");
        assert_eq!(json["wDist"], 0.2);
        assert_eq!(json["wRating"], 0.2);
    }

    #[test]
    fn negative_weight_is_invalid() {
        let weights = ScoringWeights {
            eta: -1.0,
            ..ScoringWeights::default()
        };
        assert!(weights.validate().is_err());
    }
}
