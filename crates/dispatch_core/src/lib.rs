pub mod assignment;
pub mod audit;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod eta;
pub mod geo;
pub mod lifecycle;
pub mod matching;
pub mod model;
pub mod offers;
pub mod pricing;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod sweeps;
pub mod weights;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;
