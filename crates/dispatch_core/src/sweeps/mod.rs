//! Periodic reconciliation sweeps.
//!
//! Each sweep re-reads stored timestamps on every run and compares them with
//! `now`; nothing here keeps timers between runs. Sweeps are safe to run
//! concurrently with each other and with a second scheduler because every
//! state change goes through a conditional write.

pub mod long_distance;
pub mod reassignment;
pub mod scheduled;

pub use long_distance::{LongDistanceHandler, LongDistanceOutcome, LongDistanceReport};
pub use reassignment::{ReassignReport, ReassignmentSweeper};
pub use scheduled::{ScheduledReport, ScheduledRideDispatcher};
