use clap::Parser;
use humantime_serde::re::humantime::parse_duration;
use modbus_poll::{
    config::DeviceStore,
    modbus::{DeviceId, ModbusConnector},
    poll::{Poller, Snapshot},
    server, Error, Result,
};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[clap(
    name = "modbus-poll",
    version,
    author,
    about = "Polls many Modbus devices in lock-step and prints one JSON snapshot per cycle"
)]
struct Cli {
    /// Device configuration store
    #[clap(env = "MODBUS_POLL_CONFIG", value_hint = clap::ValueHint::FilePath)]
    config: PathBuf,

    /// Time between the starts of consecutive cycles
    #[clap(short, long, env = "MODBUS_POLL_INTERVAL", value_parser = parse_duration)]
    interval: Option<Duration>,

    #[clap(long, env = "MODBUS_POLL_SHUTDOWN_TIMEOUT", value_parser = parse_duration)]
    shutdown_timeout: Option<Duration>,

    #[clap(long, env = "MODBUS_POLL_RECONNECT_INTERVAL", value_parser = parse_duration)]
    reconnect_interval: Option<Duration>,

    /// Only poll these device numbers. Hidden devices are polled only when listed here.
    #[clap(short, long = "device", value_name = "N")]
    devices: Vec<DeviceId>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Cli::parse();

    let store = DeviceStore::load(&args.config)?;

    let mut settings = store.poll.clone().unwrap_or_default();
    if let Some(interval) = args.interval {
        settings.interval = interval;
    }
    if let Some(timeout) = args.shutdown_timeout {
        settings.shutdown_timeout = timeout;
    }
    if let Some(interval) = args.reconnect_interval {
        settings.reconnect_interval = interval;
    }

    if let Some(id) = args.devices.iter().find(|id| store.get(**id).is_none()) {
        return Err(Error::UnknownDevice(*id));
    }
    let devices = store
        .into_devices()
        .filter(|device| {
            if args.devices.is_empty() {
                !device.hidden
            } else {
                args.devices.contains(&device.id)
            }
        })
        .collect::<Vec<_>>();
    info!(devices = devices.len(), ?settings, "Loaded configuration");

    let (tx, mut rx) = mpsc::unbounded_channel::<Snapshot>();
    let printer = tokio::spawn(async move {
        while let Some(snapshot) = rx.recv().await {
            match serde_json::to_string(&snapshot) {
                Ok(line) => println!("{line}"),
                Err(error) => warn!(cycle = snapshot.cycle, %error, "Could not encode snapshot"),
            }
        }
    });

    let poller = Poller::new(Arc::new(ModbusConnector), settings, tx);
    server::run(poller, devices, tokio::signal::ctrl_c()).await?;

    // The poller and with it the sender are gone, so this drains and ends.
    let _ = printer.await;

    Ok(())
}
