use tokio::{
    select,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, warn};

use super::{Outcome, Report};
use crate::modbus::{DeviceConnection, DeviceId};
use crate::shutdown::{Shutdown, Stop};

/// Request for one read cycle. The report goes back through `reply`.
#[derive(Debug)]
pub(super) struct Trigger {
    pub cycle: u64,
    pub reply: oneshot::Sender<Report>,
}

/// Per-device task for one polling session.
///
/// Owns the device connection for the lifetime of the session and hands it back when it stops.
struct Worker {
    connection: DeviceConnection,
    triggers: mpsc::Receiver<Trigger>,
    shutdown: Shutdown,
}

/// Control-plane side of a worker: stop it and collect its connection.
#[derive(Debug)]
pub(super) struct WorkerHandle {
    pub device: DeviceId,
    stop: Stop,
    task: JoinHandle<DeviceConnection>,
}

/// Coordinator side of a worker: trigger cycles.
#[derive(Debug, Clone)]
pub(super) struct WorkerLink {
    device: DeviceId,
    triggers: mpsc::Sender<Trigger>,
}

pub(super) fn spawn(connection: DeviceConnection) -> (WorkerHandle, WorkerLink) {
    let device = connection.id();
    // The coordinator waits for every report before the next trigger, so one slot is enough.
    let (tx, rx) = mpsc::channel(1);
    let (stop, shutdown) = Stop::new();

    let worker = Worker {
        connection,
        triggers: rx,
        shutdown,
    };
    let task = tokio::spawn(worker.run());

    (
        WorkerHandle { device, stop, task },
        WorkerLink {
            device,
            triggers: tx,
        },
    )
}

impl WorkerHandle {
    /// Ask the worker to stop. A read in flight is allowed to finish.
    pub fn request_stop(&self) {
        self.stop.request();
    }

    /// Wait for the worker to finish and return its connection.
    pub fn join(self) -> JoinHandle<DeviceConnection> {
        self.task
    }
}

impl WorkerLink {
    /// Trigger one cycle and wait for its report.
    ///
    /// A worker that has already stopped counts as completed with nothing to report.
    pub async fn trigger(&self, cycle: u64) -> Report {
        let (reply, rx) = oneshot::channel();
        if self.triggers.send(Trigger { cycle, reply }).await.is_err() {
            return self.skipped();
        }
        rx.await.unwrap_or_else(|_| self.skipped())
    }

    fn skipped(&self) -> Report {
        Report {
            device: self.device,
            outcome: Outcome::Skipped,
        }
    }
}

impl Worker {
    async fn run(mut self) -> DeviceConnection {
        let device = self.connection.id();
        debug!(device, "Worker started");

        loop {
            // Only waiting for the next trigger races against the stop signal. Once a cycle has
            // started it runs to completion so the transport is never cut mid-request.
            let trigger = select! {
                biased;
                _ = self.shutdown.recv() => break,
                trigger = self.triggers.recv() => match trigger {
                    Some(trigger) => trigger,
                    None => break,
                },
            };

            let outcome = self.cycle(trigger.cycle).await;
            // The coordinator may have given up on this cycle already.
            let _ = trigger.reply.send(Report { device, outcome });
        }

        debug!(device, "Worker stopped");
        self.connection
    }

    async fn cycle(&mut self, cycle: u64) -> Outcome {
        let device = self.connection.id();
        if !self.connection.is_connected() {
            return Outcome::Skipped;
        }

        match self.connection.read_all().await {
            Ok(values) => Outcome::Values(values),
            Err(error) => {
                if error.is_connection_lost() {
                    warn!(device, cycle, %error, "Connection lost");
                    self.connection.disconnect().await;
                } else {
                    warn!(device, cycle, %error, "Read failed");
                }
                Outcome::Failed {
                    message: error.to_string(),
                    // A timed out read may also have failed to reopen its transport.
                    disconnected: !self.connection.is_connected(),
                }
            }
        }
    }
}
