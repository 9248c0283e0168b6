//! Travel-time providers behind one trait.
//!
//! - **`HaversineEta`**: great-circle distance at an assumed speed. Deterministic, never fails.
//! - **`OsrmEta`** (feature `osrm`): driving duration from an OSRM HTTP endpoint.
//! - **`CachedEta`**: LRU wrapper around any provider.
//! - **`FallbackEta`**: wraps any provider and degrades to haversine on error;
//!   this is what the ranker holds, so provider outages never reach callers.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::EtaError;
use crate::geo::{haversine_km, GeoPoint};

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EtaSource {
    Provider,
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EtaEstimate {
    pub minutes: f64,
    /// Road (or great-circle, for the fallback) distance in kilometres.
    pub distance_km: f64,
    pub source: EtaSource,
}

/// Which routing backend to use.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EtaProviderKind {
    #[default]
    Haversine,
    /// OSRM HTTP endpoint (e.g. `"http://localhost:5000"`).
    #[cfg(feature = "osrm")]
    Osrm { endpoint: String },
}

#[async_trait]
pub trait EtaProvider: Send + Sync {
    async fn eta(&self, origin: GeoPoint, dest: GeoPoint) -> Result<EtaEstimate, EtaError>;
}

// ---------------------------------------------------------------------------
// Haversine provider (always available)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct HaversineEta {
    pub speed_kmh: f64,
}

impl HaversineEta {
    pub fn new(speed_kmh: f64) -> Self {
        Self { speed_kmh }
    }

    pub fn estimate(&self, origin: GeoPoint, dest: GeoPoint) -> EtaEstimate {
        let distance_km = haversine_km(origin, dest);
        let minutes = if self.speed_kmh > 0.0 {
            distance_km / self.speed_kmh * 60.0
        } else {
            f64::INFINITY
        };
        EtaEstimate {
            minutes,
            distance_km,
            source: EtaSource::Fallback,
        }
    }
}

impl Default for HaversineEta {
    fn default() -> Self {
        Self::new(30.0)
    }
}

#[async_trait]
impl EtaProvider for HaversineEta {
    async fn eta(&self, origin: GeoPoint, dest: GeoPoint) -> Result<EtaEstimate, EtaError> {
        Ok(self.estimate(origin, dest))
    }
}

// ---------------------------------------------------------------------------
// OSRM provider (behind `osrm` feature)
// ---------------------------------------------------------------------------

#[cfg(feature = "osrm")]
pub mod osrm {
    use super::*;
    use reqwest::Client;
    use std::time::Duration;

    /// Driving ETA via an OSRM HTTP endpoint.
    pub struct OsrmEta {
        client: Client,
        endpoint: String,
    }

    impl OsrmEta {
        pub fn new(endpoint: &str) -> Result<Self, EtaError> {
            let client = Client::builder()
                .timeout(Duration::from_secs(3))
                .build()
                .map_err(|err| EtaError::Http(err.to_string()))?;
            Ok(Self {
                client,
                endpoint: endpoint.trim_end_matches('/').to_string(),
            })
        }
    }

    /// Minimal OSRM JSON response structures.
    #[derive(Deserialize)]
    struct OsrmResponse {
        code: String,
        routes: Option<Vec<OsrmRoute>>,
    }

    #[derive(Deserialize)]
    struct OsrmRoute {
        distance: f64, // metres
        duration: f64, // seconds
    }

    #[async_trait]
    impl EtaProvider for OsrmEta {
        async fn eta(&self, origin: GeoPoint, dest: GeoPoint) -> Result<EtaEstimate, EtaError> {
            let url = format!(
                "{}/route/v1/driving/{},{};{},{}?overview=false",
                self.endpoint, origin.lng, origin.lat, dest.lng, dest.lat,
            );
            let resp: OsrmResponse = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|err| EtaError::Unavailable(err.to_string()))?
                .json()
                .await
                .map_err(|err| EtaError::Http(err.to_string()))?;

            if resp.code != "Ok" {
                return Err(EtaError::NoRoute);
            }
            let route = resp
                .routes
                .and_then(|routes| routes.into_iter().next())
                .ok_or(EtaError::NoRoute)?;
            Ok(EtaEstimate {
                minutes: route.duration / 60.0,
                distance_km: route.distance / 1000.0,
                source: EtaSource::Provider,
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Caching wrapper
// ---------------------------------------------------------------------------

/// Coordinates rounded to 1e-4 degrees (~11 m), directional.
type EtaKey = (i64, i64, i64, i64);

fn eta_key(origin: GeoPoint, dest: GeoPoint) -> EtaKey {
    let q = |v: f64| (v * 10_000.0).round() as i64;
    (q(origin.lat), q(origin.lng), q(dest.lat), q(dest.lng))
}

/// LRU-cached wrapper around any [`EtaProvider`]. Only successes are cached.
pub struct CachedEta {
    inner: Arc<dyn EtaProvider>,
    cache: Mutex<LruCache<EtaKey, EtaEstimate>>,
}

impl CachedEta {
    pub fn new(inner: Arc<dyn EtaProvider>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }
}

#[async_trait]
impl EtaProvider for CachedEta {
    async fn eta(&self, origin: GeoPoint, dest: GeoPoint) -> Result<EtaEstimate, EtaError> {
        let key = eta_key(origin, dest);

        // Fast path: cache hit
        if let Ok(mut cache) = self.cache.lock() {
            if let Some(cached) = cache.get(&key) {
                return Ok(*cached);
            }
        }

        let estimate = self.inner.eta(origin, dest).await?;
        if let Ok(mut cache) = self.cache.lock() {
            cache.put(key, estimate);
        }
        Ok(estimate)
    }
}

// ---------------------------------------------------------------------------
// Fallback wrapper
// ---------------------------------------------------------------------------

/// Provider plus deterministic haversine fallback. [`FallbackEta::resolve`]
/// cannot fail.
#[derive(Clone)]
pub struct FallbackEta {
    inner: Arc<dyn EtaProvider>,
    fallback: HaversineEta,
}

impl FallbackEta {
    pub fn new(inner: Arc<dyn EtaProvider>, assumed_speed_kmh: f64) -> Self {
        Self {
            inner,
            fallback: HaversineEta::new(assumed_speed_kmh),
        }
    }

    /// Haversine only; no provider.
    pub fn haversine(assumed_speed_kmh: f64) -> Self {
        let fallback = HaversineEta::new(assumed_speed_kmh);
        Self {
            inner: Arc::new(fallback),
            fallback,
        }
    }

    pub async fn resolve(&self, origin: GeoPoint, dest: GeoPoint) -> EtaEstimate {
        match self.inner.eta(origin, dest).await {
            Ok(estimate) if estimate.minutes.is_finite() && estimate.minutes >= 0.0 => estimate,
            Ok(_) => self.fallback.estimate(origin, dest),
            Err(err) => {
                debug!(error = %err, "eta provider failed, using haversine fallback");
                self.fallback.estimate(origin, dest)
            }
        }
    }
}

#[async_trait]
impl EtaProvider for FallbackEta {
    async fn eta(&self, origin: GeoPoint, dest: GeoPoint) -> Result<EtaEstimate, EtaError> {
        Ok(self.resolve(origin, dest).await)
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Default ETA cache capacity for network-backed providers.
#[cfg(feature = "osrm")]
const DEFAULT_ETA_CACHE_CAPACITY: usize = 20_000;

/// Build the provider described by `kind`, wrapped with the haversine fallback.
pub fn build_eta_provider(kind: &EtaProviderKind, assumed_speed_kmh: f64) -> FallbackEta {
    match kind {
        EtaProviderKind::Haversine => FallbackEta::haversine(assumed_speed_kmh),

        #[cfg(feature = "osrm")]
        EtaProviderKind::Osrm { endpoint } => match osrm::OsrmEta::new(endpoint) {
            Ok(provider) => {
                let cached = CachedEta::new(Arc::new(provider), DEFAULT_ETA_CACHE_CAPACITY);
                FallbackEta::new(Arc::new(cached), assumed_speed_kmh)
            }
            Err(err) => {
                tracing::warn!(endpoint = %endpoint, error = %err, "failed to build OSRM client, using haversine");
                FallbackEta::haversine(assumed_speed_kmh)
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Failing;

    #[async_trait]
    impl EtaProvider for Failing {
        async fn eta(&self, _: GeoPoint, _: GeoPoint) -> Result<EtaEstimate, EtaError> {
            Err(EtaError::Unavailable("down".into()))
        }
    }

    struct Counting(AtomicU32);

    #[async_trait]
    impl EtaProvider for Counting {
        async fn eta(&self, origin: GeoPoint, dest: GeoPoint) -> Result<EtaEstimate, EtaError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(EtaEstimate {
                minutes: 7.0,
                distance_km: haversine_km(origin, dest),
                source: EtaSource::Provider,
            })
        }
    }

    const A: GeoPoint = GeoPoint::new(25.033, 121.565);
    const B: GeoPoint = GeoPoint::new(25.047, 121.517);

    #[tokio::test]
    async fn failing_provider_degrades_to_haversine_at_assumed_speed() {
        let eta = FallbackEta::new(Arc::new(Failing), 30.0);
        let estimate = eta.resolve(A, B).await;
        assert_eq!(estimate.source, EtaSource::Fallback);
        let expected = haversine_km(A, B) / 30.0 * 60.0;
        assert!((estimate.minutes - expected).abs() < 1e-9);
    }

    #[tokio::test]
    async fn cache_serves_repeated_lookups() {
        let counting = Arc::new(Counting(AtomicU32::new(0)));
        let cached = CachedEta::new(counting.clone(), 16);
        cached.eta(A, B).await.expect("eta");
        cached.eta(A, B).await.expect("eta");
        assert_eq!(counting.0.load(Ordering::SeqCst), 1);
        cached.eta(B, A).await.expect("eta");
        assert_eq!(counting.0.load(Ordering::SeqCst), 2, "cache key is directional");
    }

    #[test]
    fn default_kind_is_haversine() {
        assert_eq!(EtaProviderKind::default(), EtaProviderKind::Haversine);
    }
}
