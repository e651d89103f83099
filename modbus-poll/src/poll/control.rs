use futures_util::future::join_all;
use itertools::Itertools;
use std::{collections::BTreeMap, sync::Arc};
use tokio::{
    sync::watch,
    time::{self, Instant},
};
use tracing::{debug, error, info, warn};

use super::coordinator::{self, CoordinatorHandle};
use super::worker::{self, WorkerHandle};
use super::SnapshotSink;
use crate::config::PollSettings;
use crate::modbus::{ConnectState, Connector, Device, DeviceConnection, DeviceId};
use crate::Error;

/// Start/stop surface of the poll engine and owner of every device connection.
///
/// Between sessions connections sit here idle. `start_polling` moves each connected one into its
/// own worker task and `stop_polling` moves them back, so at most one task can ever read from a
/// device. Dropping a `Poller` with a session running asks all of its tasks to stop.
pub struct Poller {
    connector: Arc<dyn Connector>,
    settings: PollSettings,
    sink: Arc<dyn SnapshotSink>,

    /// Latest configuration of every known device.
    devices: BTreeMap<DeviceId, Arc<Device>>,
    /// Connections not lent to the running session.
    idle: BTreeMap<DeviceId, DeviceConnection>,
    status: BTreeMap<DeviceId, watch::Receiver<ConnectState>>,

    session: Option<Session>,
}

#[derive(Debug)]
struct Session {
    workers: Vec<WorkerHandle>,
    coordinator: CoordinatorHandle,
}

impl Session {
    fn owns(&self, id: DeviceId) -> bool {
        self.workers.iter().any(|w| w.device == id)
    }
}

impl Poller {
    pub fn new<S: SnapshotSink>(
        connector: Arc<dyn Connector>,
        settings: PollSettings,
        sink: S,
    ) -> Self {
        Self {
            connector,
            settings,
            sink: Arc::new(sink),
            devices: BTreeMap::new(),
            idle: BTreeMap::new(),
            status: BTreeMap::new(),
            session: None,
        }
    }

    pub fn settings(&self) -> &PollSettings {
        &self.settings
    }

    pub fn device(&self, id: DeviceId) -> Option<&Arc<Device>> {
        self.devices.get(&id)
    }

    pub fn device_ids(&self) -> impl Iterator<Item = DeviceId> + '_ {
        self.devices.keys().copied()
    }

    fn is_lent(&self, id: DeviceId) -> bool {
        self.session.as_ref().map_or(false, |s| s.owns(id))
    }

    /// Add a device, or replace the configuration of a known one.
    ///
    /// An idle connection is rebuilt straight away and reconnected if it was connected. One that
    /// the running session owns keeps its old configuration until the session stops or resumes.
    pub async fn update_device(&mut self, device: Device) {
        let id = device.id;
        self.devices.insert(id, Arc::new(device));

        if let Some(mut old) = self.idle.remove(&id) {
            let reconnect = old.is_connected();
            old.disconnect().await;
            self.install(id, reconnect).await;
        } else if self.is_lent(id) {
            debug!(device = id, "Configuration change deferred until the session restarts");
        } else {
            self.install(id, false).await;
        }
    }

    /// Forget a device, closing its connection once nobody is reading from it.
    pub async fn remove_device(&mut self, id: DeviceId) -> crate::Result<()> {
        self.devices.remove(&id).ok_or(Error::UnknownDevice(id))?;
        self.status.remove(&id);
        if let Some(mut connection) = self.idle.remove(&id) {
            connection.disconnect().await;
        }
        Ok(())
    }

    pub async fn connect(&mut self, id: DeviceId) -> crate::Result<()> {
        self.idle_connection(id)?.connect().await
    }

    pub async fn disconnect(&mut self, id: DeviceId) -> crate::Result<()> {
        self.idle_connection(id)?.disconnect().await;
        Ok(())
    }

    fn idle_connection(&mut self, id: DeviceId) -> crate::Result<&mut DeviceConnection> {
        if self.is_lent(id) {
            return Err(Error::DeviceBusy(id));
        }
        self.idle.get_mut(&id).ok_or(Error::UnknownDevice(id))
    }

    /// Try to connect every idle, disconnected device at once. Returns the failures.
    pub async fn connect_all(&mut self) -> Vec<(DeviceId, Error)> {
        let attempts = self
            .idle
            .values_mut()
            .filter(|connection| !connection.is_connected())
            .map(|connection| async move {
                let id = connection.id();
                connection.connect().await.err().map(|error| (id, error))
            });
        join_all(attempts).await.into_iter().flatten().collect()
    }

    /// Live connection state, also while the session owns the connection.
    pub fn is_connected(&self, id: DeviceId) -> bool {
        self.status
            .get(&id)
            .map_or(false, |status| *status.borrow() == ConnectState::Connected)
    }

    pub fn status(&self, id: DeviceId) -> Option<watch::Receiver<ConnectState>> {
        self.status.get(&id).cloned()
    }

    pub fn disconnected_devices(&self) -> Vec<DeviceId> {
        self.device_ids()
            .filter(|id| !self.is_connected(*id))
            .collect()
    }

    /// Whether any disconnected device is owned by the running session, i.e. only a restart can
    /// bring it back.
    pub fn session_has_lost_devices(&self) -> bool {
        self.session.as_ref().map_or(false, |session| {
            session
                .workers
                .iter()
                .any(|w| !self.is_connected(w.device))
        })
    }

    pub fn is_polling(&self) -> bool {
        self.session.is_some()
    }

    /// Start a session over every currently connected device. The first cycle runs immediately.
    pub fn start_polling(&mut self) -> crate::Result<()> {
        if self.session.is_some() {
            return Err(Error::AlreadyPolling);
        }

        let ids = self
            .idle
            .iter()
            .filter(|(_, connection)| connection.is_connected())
            .map(|(id, _)| *id)
            .collect_vec();
        if ids.is_empty() {
            warn!("No connected devices, not polling");
            return Err(Error::NoConnectedDevices);
        }

        let (workers, links): (Vec<_>, Vec<_>) = ids
            .iter()
            .filter_map(|id| self.idle.remove(id))
            .map(worker::spawn)
            .unzip();
        let coordinator = coordinator::spawn(links, self.settings.interval, self.sink.clone());

        info!(devices = %ids.iter().join(","), "Session started");
        self.session = Some(Session {
            workers,
            coordinator,
        });
        Ok(())
    }

    /// Stop the running session and take the connections back. Does nothing when idle.
    ///
    /// Workers finish the read they are in; any that have not stopped by the shutdown timeout are
    /// abandoned and their device gets a fresh, disconnected connection.
    pub async fn stop_polling(&mut self) {
        let Some(Session {
            workers,
            coordinator,
        }) = self.session.take()
        else {
            return;
        };

        for worker in &workers {
            worker.request_stop();
        }
        coordinator.request_stop();

        let timeout = self.settings.shutdown_timeout;
        let deadline = Instant::now() + timeout;
        for worker in workers {
            let device = worker.device;
            match time::timeout_at(deadline, worker.join()).await {
                Ok(Ok(connection)) => self.restore(connection).await,
                Ok(Err(cause)) => {
                    error!(device, %cause, "Worker task failed");
                    self.install(device, false).await;
                }
                Err(_) => {
                    error!(device, ?timeout, "Worker did not stop in time, abandoning it");
                    self.install(device, false).await;
                }
            }
        }

        match time::timeout_at(deadline, coordinator.join()).await {
            Ok(Ok(())) => {}
            Ok(Err(cause)) => error!(%cause, "Coordinator task failed"),
            Err(_) => error!(?timeout, "Coordinator did not stop in time, abandoning it"),
        }

        info!("Session stopped");
    }

    /// Stop and start again, picking up devices that connected and configuration that changed
    /// since the session began.
    pub async fn resume_polling(&mut self) -> crate::Result<()> {
        self.stop_polling().await;
        self.start_polling()
    }

    /// Take back a connection from a finished worker.
    async fn restore(&mut self, mut connection: DeviceConnection) {
        let id = connection.id();
        let unchanged = self
            .devices
            .get(&id)
            .map(|device| Arc::ptr_eq(device, connection.device()));
        match unchanged {
            Some(true) => {
                self.idle.insert(id, connection);
            }
            Some(false) => {
                let reconnect = connection.is_connected();
                connection.disconnect().await;
                self.install(id, reconnect).await;
            }
            None => {
                connection.disconnect().await;
                debug!(device = id, "Closed connection of removed device");
            }
        }
    }

    /// Build a new connection from the stored configuration of `id`.
    async fn install(&mut self, id: DeviceId, reconnect: bool) {
        let Some(device) = self.devices.get(&id) else {
            return;
        };
        let mut connection = DeviceConnection::new(device.clone(), self.connector.clone());
        self.status.insert(id, connection.status());
        if reconnect {
            // Failures are logged by the connection and leave it disconnected.
            let _ = connection.connect().await;
        }
        self.idle.insert(id, connection);
    }
}
