//! Admin-editable scoring weights with a durable local fallback copy.
//!
//! The scheduler calls [`WeightsCache::refresh`] once per cycle and passes the
//! returned value into every ranking call of that cycle.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, AuditLog, AuditSubject};
use crate::config::ScoringWeights;
use crate::error::{ConfigError, DispatchError, StoreError};
use crate::retry::{with_backoff, RetryPolicy};
use crate::store::SettingsStore;

/// Where the weights of the current cycle came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightsOrigin {
    Remote,
    DurableCopy,
    Defaults,
}

/// Versioned on-disk format of the durable copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct DurableWeightsV1 {
    version: u32,
    saved_at: DateTime<Utc>,
    weights: ScoringWeights,
}

const DURABLE_FORMAT_VERSION: u32 = 1;

pub struct WeightsCache {
    remote: Arc<dyn SettingsStore>,
    audit: Arc<dyn AuditLog>,
    fallback_path: Option<PathBuf>,
    retry: RetryPolicy,
    current: RwLock<(ScoringWeights, WeightsOrigin)>,
}

impl WeightsCache {
    pub fn new(
        remote: Arc<dyn SettingsStore>,
        audit: Arc<dyn AuditLog>,
        fallback_path: Option<PathBuf>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            remote,
            audit,
            fallback_path,
            retry,
            current: RwLock::new((ScoringWeights::default(), WeightsOrigin::Defaults)),
        }
    }

    /// Last loaded weights without touching any store.
    pub fn current(&self) -> ScoringWeights {
        self.current
            .read()
            .map(|guard| guard.0)
            .unwrap_or_default()
    }

    pub fn origin(&self) -> WeightsOrigin {
        self.current
            .read()
            .map(|guard| guard.1)
            .unwrap_or(WeightsOrigin::Defaults)
    }

    fn set_current(&self, weights: ScoringWeights, origin: WeightsOrigin) {
        if let Ok(mut guard) = self.current.write() {
            *guard = (weights, origin);
        }
    }

    /// Reload from the settings store; on failure use the durable copy, then
    /// the defaults. Never fails.
    pub async fn refresh(&self) -> ScoringWeights {
        match self.remote.load_weights().await {
            Ok(Some(weights)) if weights.validate().is_ok() => {
                self.set_current(weights, WeightsOrigin::Remote);
                if let Some(path) = &self.fallback_path {
                    if let Err(err) = save_durable_copy(path, weights) {
                        warn!(path = %path.display(), error = %err, "failed to refresh durable weights copy");
                    }
                }
                return weights;
            }
            Ok(Some(weights)) => {
                warn!(?weights, "remote weights invalid, ignoring");
            }
            Ok(None) => debug!("no remote weights stored"),
            Err(err) => warn!(error = %err, "settings store unavailable, using durable weights copy"),
        }

        if let Some(path) = &self.fallback_path {
            match load_durable_copy(path) {
                Ok(Some(weights)) => {
                    self.set_current(weights, WeightsOrigin::DurableCopy);
                    return weights;
                }
                Ok(None) => {}
                Err(err) => warn!(path = %path.display(), error = %err, "durable weights copy unreadable"),
            }
        }

        let weights = ScoringWeights::default();
        self.set_current(weights, WeightsOrigin::Defaults);
        weights
    }

    /// Admin update: validate, persist remotely and locally, audit.
    pub async fn update(
        &self,
        weights: ScoringWeights,
        now: DateTime<Utc>,
    ) -> Result<ScoringWeights, DispatchError> {
        weights.validate()?;
        with_backoff(self.retry, "save weights", || self.remote.save_weights(weights)).await?;
        if let Some(path) = &self.fallback_path {
            save_durable_copy(path, weights)?;
        }
        self.set_current(weights, WeightsOrigin::Remote);
        with_backoff(self.retry, "audit settings update", || {
            self.audit.append(
                AuditSubject::Settings,
                now,
                AuditEvent::DispatchSettingsUpdate { weights },
            )
        })
        .await?;
        info!(?weights, "dispatch weights updated");
        Ok(weights)
    }
}

/// Read the durable copy. `Ok(None)` when no file exists yet.
pub fn load_durable_copy(path: &Path) -> Result<Option<ScoringWeights>, StoreError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)?;
    let stored: DurableWeightsV1 = serde_json::from_str(&raw)?;
    if stored.version != DURABLE_FORMAT_VERSION {
        return Err(StoreError::Serialization(format!(
            "unsupported weights file version {}",
            stored.version
        )));
    }
    stored
        .weights
        .validate()
        .map_err(|ConfigError(message)| StoreError::Serialization(message))?;
    Ok(Some(stored.weights))
}

/// Write the durable copy atomically (temp file + rename).
pub fn save_durable_copy(path: &Path, weights: ScoringWeights) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let stored = DurableWeightsV1 {
        version: DURABLE_FORMAT_VERSION,
        saved_at: Utc::now(),
        weights,
    };
    let serialized = serde_json::to_string_pretty(&stored)?;
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or(0);
    let temp_path = path.with_extension(format!("json.tmp.{nanos}"));
    let mut temp_file = File::create(&temp_path)?;
    temp_file.write_all(serialized.as_bytes())?;
    temp_file.sync_all()?;
    fs::rename(&temp_path, path)?;
    Ok(())
}
