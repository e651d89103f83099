use std::future::Future;
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::modbus::Device;
use crate::poll::Poller;
use crate::Error;

struct Server {
    poller: Poller,
}

/// Poll `devices` until `shutdown` resolves.
///
/// Devices that fail to connect, or drop out later, are retried every reconnect interval and the
/// session is resumed whenever one comes back.
pub async fn run(
    mut poller: Poller,
    devices: impl IntoIterator<Item = Device>,
    shutdown: impl Future,
) -> crate::Result<()> {
    for device in devices {
        poller.update_device(device).await;
    }
    if poller.device_ids().next().is_none() {
        return Err(Error::config("no devices to poll"));
    }

    let mut server = Server { poller };

    let mut ret = Ok(());

    tokio::select! {
        res = server.run() => {
            if let Err(err) = res {
                error!(cause = %err, "server error");
                ret = Err(err)
            }
        }

        _ = shutdown => {
            info!("shutting down");
        }
    }

    let Server { mut poller } = server;
    poller.stop_polling().await;
    for id in poller.device_ids().collect::<Vec<_>>() {
        // Only fails for unknown or lent devices, and there are neither left.
        let _ = poller.disconnect(id).await;
    }

    ret
}

impl Server {
    async fn run(&mut self) -> crate::Result<()> {
        info!("Starting up");

        self.connect_all().await;
        self.start()?;

        let mut reconnect = time::interval(self.poller.settings().reconnect_interval);
        reconnect.set_missed_tick_behavior(MissedTickBehavior::Delay);
        reconnect.tick().await;

        loop {
            reconnect.tick().await;
            self.reconnect().await?;
        }
    }

    /// Bring back devices that are down, restarting the session if any of them was in it.
    async fn reconnect(&mut self) -> crate::Result<()> {
        let before = self.poller.disconnected_devices();
        if before.is_empty() {
            return Ok(());
        }

        // A device that dropped out mid-session is owned by its worker until the session stops.
        let stopped = self.poller.session_has_lost_devices();
        if stopped {
            self.poller.stop_polling().await;
        }

        self.connect_all().await;
        let recovered = before
            .iter()
            .filter(|id| self.poller.is_connected(**id))
            .count();
        if recovered > 0 {
            info!(recovered, "Devices reconnected, resuming");
            self.poller.stop_polling().await;
            self.start()
        } else if stopped || !self.poller.is_polling() {
            self.start()
        } else {
            Ok(())
        }
    }

    async fn connect_all(&mut self) {
        for (device, error) in self.poller.connect_all().await {
            warn!(device, %error, "Could not connect");
        }
    }

    fn start(&mut self) -> crate::Result<()> {
        match self.poller.start_polling() {
            Ok(()) | Err(Error::NoConnectedDevices) => Ok(()),
            Err(err) => Err(err),
        }
    }
}
