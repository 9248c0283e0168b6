#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dispatch_core::clock::{Clock, ManualClock};
use dispatch_core::config::{DispatchConfig, RetryConfig, ScoringWeights};
use dispatch_core::engine::DispatchEngine;
use dispatch_core::eta::{EtaProvider, FallbackEta};
use dispatch_core::model::{Driver, DriverId, Trip, TripId};
use dispatch_core::store::{DriverRegistry, InMemorySettingsStore, TripStore};
use dispatch_core::test_helpers::{test_epoch, InMemoryCollaborators};

/// Builder configuration for reproducible test engines.
#[derive(Clone)]
pub struct TestEngineConfig {
    pub start: DateTime<Utc>,
    pub dispatch: DispatchConfig,
    pub weights: Option<ScoringWeights>,
    pub eta_provider: Option<Arc<dyn EtaProvider>>,
}

impl Default for TestEngineConfig {
    fn default() -> Self {
        let dispatch = DispatchConfig {
            retry: RetryConfig {
                max_attempts: 3,
                base_delay_ms: 1,
                max_delay_ms: 5,
            },
            ..DispatchConfig::default()
        };
        Self {
            start: test_epoch(),
            dispatch,
            weights: None,
            eta_provider: None,
        }
    }
}

/// Engine over in-memory stores and a manual clock.
pub struct TestEngine {
    pub engine: DispatchEngine,
    pub clock: Arc<ManualClock>,
    pub stores: InMemoryCollaborators,
}

impl TestEngine {
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn advance_secs(&self, secs: i64) {
        self.clock.advance(Duration::seconds(secs));
    }

    pub async fn add_driver(&self, driver: Driver) -> DriverId {
        let id = driver.id;
        self.stores
            .drivers
            .upsert(driver)
            .await
            .expect("upsert driver");
        id
    }

    pub async fn driver(&self, id: DriverId) -> Driver {
        self.stores
            .drivers
            .get(id)
            .await
            .expect("driver lookup")
            .expect("driver exists")
    }

    pub async fn trip(&self, id: TripId) -> Trip {
        self.stores
            .trips
            .get(id)
            .await
            .expect("trip lookup")
            .expect("trip exists")
    }

    /// Re-send a heartbeat at the current time so the driver stays fresh.
    pub async fn heartbeat(&self, id: DriverId) {
        let driver = self.driver(id).await;
        self.stores
            .drivers
            .heartbeat(id, driver.position, driver.online, self.now())
            .await
            .expect("heartbeat");
    }
}

/// Helper that wires a dispatch engine over fresh in-memory collaborators.
#[derive(Default)]
pub struct TestEngineBuilder {
    config: TestEngineConfig,
}

impl TestEngineBuilder {
    /// Create a new builder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the instant the manual clock starts at.
    pub fn with_start(mut self, start: DateTime<Utc>) -> Self {
        self.config.start = start;
        self
    }

    /// Adjust the dispatch configuration in place.
    pub fn with_config(mut self, edit: impl FnOnce(&mut DispatchConfig)) -> Self {
        edit(&mut self.config.dispatch);
        self
    }

    /// Seed the settings store with a weight set.
    pub fn with_weights(mut self, weights: ScoringWeights) -> Self {
        self.config.weights = Some(weights);
        self
    }

    /// Route ETAs through a custom provider (haversine fallback still applies).
    pub fn with_eta_provider(mut self, provider: Arc<dyn EtaProvider>) -> Self {
        self.config.eta_provider = Some(provider);
        self
    }

    pub fn build(self) -> TestEngine {
        let TestEngineConfig {
            start,
            dispatch,
            weights,
            eta_provider,
        } = self.config;

        let mut stores = InMemoryCollaborators::new();
        if let Some(weights) = weights {
            stores.settings = Arc::new(InMemorySettingsStore::with_weights(weights));
        }
        let clock = Arc::new(ManualClock::new(start));
        let speed = dispatch.ranking.assumed_speed_kmh;
        let eta = match eta_provider {
            Some(provider) => FallbackEta::new(provider, speed),
            None => FallbackEta::haversine(speed),
        };
        let engine =
            DispatchEngine::with_eta(dispatch, stores.as_collaborators(), clock.clone(), eta);
        TestEngine {
            engine,
            clock,
            stores,
        }
    }
}
