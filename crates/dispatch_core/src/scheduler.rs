//! The single authoritative sweep scheduler.
//!
//! One time-ordered queue holds the next tick of each sweep. [`DispatchScheduler::tick`]
//! loads the weight set once, runs every sweep that is due, and re-queues it
//! one period later. A second scheduler replica is still safe: every write a
//! sweep makes is conditional.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SweepKind, SweepQueue};
use crate::config::{secs, DispatchConfig, ScoringWeights};
use crate::sweeps::{
    LongDistanceHandler, LongDistanceReport, ReassignReport, ReassignmentSweeper, ScheduledReport,
    ScheduledRideDispatcher,
};
use crate::weights::WeightsCache;

/// Idle wait when nothing is queued.
const IDLE_POLL: std::time::Duration = std::time::Duration::from_secs(1);

#[derive(Debug, Default, Clone, PartialEq)]
pub struct TickReport {
    pub at: Option<DateTime<Utc>>,
    pub weights: Option<ScoringWeights>,
    pub ran: Vec<SweepKind>,
    pub reassignment: Option<ReassignReport>,
    pub long_distance: Option<LongDistanceReport>,
    pub scheduled: Option<ScheduledReport>,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        self.ran.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Periods {
    reassignment: u64,
    long_distance: u64,
    scheduled: u64,
}

impl Periods {
    fn of(&self, kind: SweepKind) -> u64 {
        match kind {
            SweepKind::Reassignment => self.reassignment,
            SweepKind::LongDistance => self.long_distance,
            SweepKind::ScheduledRides => self.scheduled,
        }
    }
}

pub struct DispatchScheduler {
    weights: Arc<WeightsCache>,
    reassignment: ReassignmentSweeper,
    long_distance: LongDistanceHandler,
    scheduled: ScheduledRideDispatcher,
    clock: Arc<dyn Clock>,
    periods: Periods,
    queue: Mutex<SweepQueue>,
}

impl DispatchScheduler {
    /// Every sweep is due immediately at `clock.now()`.
    pub fn new(
        config: &DispatchConfig,
        weights: Arc<WeightsCache>,
        reassignment: ReassignmentSweeper,
        long_distance: LongDistanceHandler,
        scheduled: ScheduledRideDispatcher,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let start = clock.now();
        let mut queue = SweepQueue::default();
        for kind in [
            SweepKind::LongDistance,
            SweepKind::Reassignment,
            SweepKind::ScheduledRides,
        ] {
            queue.schedule(kind, start);
        }
        Self {
            weights,
            reassignment,
            long_distance,
            scheduled,
            clock,
            periods: Periods {
                reassignment: config.reassignment.period_secs,
                long_distance: config.long_distance.period_secs,
                scheduled: config.scheduled.period_secs,
            },
            queue: Mutex::new(queue),
        }
    }

    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.queue.lock().ok().and_then(|queue| queue.next_due())
    }

    /// Pop every due tick and queue its successor.
    fn take_due(&self, now: DateTime<Utc>) -> Vec<SweepKind> {
        let Ok(mut queue) = self.queue.lock() else {
            return Vec::new();
        };
        let mut due = Vec::new();
        while let Some(tick) = queue.pop_due(now) {
            if due.contains(&tick.kind) {
                continue;
            }
            let period = secs(self.periods.of(tick.kind));
            let mut next = tick.due_at + period;
            if next <= now {
                // Skip missed ticks instead of replaying them.
                next = now + period;
            }
            queue.schedule(tick.kind, next);
            due.push(tick.kind);
        }
        due
    }

    /// Run every sweep due at `now`. Sweep failures are logged and do not stop
    /// the other sweeps.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let due = self.take_due(now);
        if due.is_empty() {
            return TickReport::default();
        }
        let weights = self.weights.refresh().await;
        let mut report = TickReport {
            at: Some(now),
            weights: Some(weights),
            ran: due.clone(),
            ..TickReport::default()
        };

        for kind in due {
            debug!(?kind, %now, "running sweep");
            match kind {
                SweepKind::LongDistance => match self.long_distance.sweep(&weights, now).await {
                    Ok(sweep) => report.long_distance = Some(sweep),
                    Err(err) => warn!(?kind, error = %err, "sweep failed"),
                },
                SweepKind::Reassignment => match self.reassignment.sweep(&weights, now).await {
                    Ok(sweep) => report.reassignment = Some(sweep),
                    Err(err) => warn!(?kind, error = %err, "sweep failed"),
                },
                SweepKind::ScheduledRides => match self.scheduled.sweep(&weights, now).await {
                    Ok(sweep) => report.scheduled = Some(sweep),
                    Err(err) => warn!(?kind, error = %err, "sweep failed"),
                },
            }
        }
        report
    }

    /// Drive ticks on the tokio clock until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        info!("dispatch scheduler started");
        loop {
            self.tick(self.clock.now()).await;

            let wait = self
                .next_due()
                .map(|due| {
                    (due - self.clock.now())
                        .to_std()
                        .unwrap_or(std::time::Duration::ZERO)
                })
                .unwrap_or(IDLE_POLL);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        info!("dispatch scheduler stopped");
    }
}
