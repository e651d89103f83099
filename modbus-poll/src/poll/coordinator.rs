use futures_util::future::join_all;
use std::{collections::BTreeMap, sync::Arc, time::Duration, time::SystemTime};
use tokio::{
    select,
    task::JoinHandle,
    time::{self, Instant},
};
use tracing::{debug, info, warn};

use super::worker::WorkerLink;
use super::{Outcome, Snapshot, SnapshotSink};
use crate::shutdown::{Shutdown, Stop};

/// Paces cycles for one session and folds worker reports into snapshots.
struct Coordinator {
    links: Vec<WorkerLink>,
    interval: Duration,
    sink: Arc<dyn SnapshotSink>,
    shutdown: Shutdown,
}

#[derive(Debug)]
pub(super) struct CoordinatorHandle {
    stop: Stop,
    task: JoinHandle<()>,
}

/// Start a session over `links`; the first cycle begins immediately.
pub(super) fn spawn(
    links: Vec<WorkerLink>,
    interval: Duration,
    sink: Arc<dyn SnapshotSink>,
) -> CoordinatorHandle {
    let (stop, shutdown) = Stop::new();
    let coordinator = Coordinator {
        links,
        interval,
        sink,
        shutdown,
    };
    CoordinatorHandle {
        stop,
        task: tokio::spawn(coordinator.run()),
    }
}

impl CoordinatorHandle {
    /// Cancel the pending timer; no further cycles are triggered.
    pub fn request_stop(&self) {
        self.stop.request();
    }

    pub fn join(self) -> JoinHandle<()> {
        self.task
    }
}

impl Coordinator {
    #[tracing::instrument(level = "debug", name = "coordinator", skip(self), fields(workers = self.links.len()))]
    async fn run(self) {
        let Coordinator {
            links,
            interval,
            sink,
            mut shutdown,
        } = self;
        info!(?interval, "Polling started");

        let mut cycle = 0u64;
        loop {
            let started = Instant::now();

            // Stopping mid-cycle drops the pending reports; the workers still finish their reads.
            let snapshot = select! {
                biased;
                _ = shutdown.recv() => break,
                snapshot = run_cycle(&links, cycle, started) => snapshot,
            };
            debug!(
                cycle,
                devices = snapshot.values.len(),
                failed = snapshot.errors.len(),
                elapsed = ?started.elapsed(),
                "Cycle complete",
            );
            sink.accept(snapshot);
            cycle += 1;

            // Next cycle starts `interval` after this one did, or right away if we overran.
            select! {
                biased;
                _ = shutdown.recv() => break,
                _ = time::sleep_until(started + interval) => {},
            }
        }

        info!(cycles = cycle, "Polling stopped");
    }
}

/// Trigger every worker at once and wait until all of them have reported.
async fn run_cycle(links: &[WorkerLink], cycle: u64, started: Instant) -> Snapshot {
    let reports = join_all(links.iter().map(|link| link.trigger(cycle))).await;

    let mut values = BTreeMap::new();
    let mut errors = BTreeMap::new();
    for report in reports {
        match report.outcome {
            Outcome::Values(v) => {
                values.insert(report.device, v);
            }
            Outcome::Failed {
                message,
                disconnected,
            } => {
                if disconnected {
                    warn!(device = report.device, cycle, "Device dropped out of the session");
                }
                errors.insert(report.device, message);
            }
            Outcome::Skipped => {}
        }
    }

    Snapshot {
        cycle,
        started,
        timestamp: SystemTime::now(),
        values,
        errors,
    }
}
