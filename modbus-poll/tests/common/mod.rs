//! Scripted devices for driving a `Poller` without real hardware.
#![allow(dead_code)]

use async_trait::async_trait;
use modbus_poll::{
    config::PollSettings,
    modbus::{Connector, Device, DeviceId, FunctionKind, ModbusProto, RegisterRead, Transport, Value},
    poll::{Poller, Snapshot},
};
use std::{
    collections::BTreeMap,
    io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{sync::mpsc, time};

/// How a scripted device answers from now on.
#[derive(Clone, Debug, Default)]
pub struct Behaviour {
    pub refuse: bool,
    /// Time every request takes.
    pub delay: Duration,
    /// Requests never answer.
    pub stuck: bool,
    /// Fail the next request only.
    pub fail_once: Option<io::ErrorKind>,
    /// Fail every request.
    pub fail: Option<io::ErrorKind>,
}

/// One scripted device. Replies to a read with its consecutive addresses.
#[derive(Debug, Default)]
pub struct Script {
    pub connects: AtomicUsize,
    pub closes: AtomicUsize,
    pub requests: AtomicUsize,
    pub completed: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    in_flight: AtomicUsize,
    behaviour: Mutex<Behaviour>,
}

impl Script {
    pub fn set(&self, change: impl FnOnce(&mut Behaviour)) {
        change(&mut self.behaviour.lock().unwrap());
    }

    fn next_request(&self) -> Behaviour {
        let mut behaviour = self.behaviour.lock().unwrap();
        let current = behaviour.clone();
        behaviour.fail_once = None;
        current
    }
}

/// Every scripted device, looked up by device number on connect.
#[derive(Debug, Default)]
pub struct Bench {
    scripts: Mutex<BTreeMap<DeviceId, Arc<Script>>>,
}

impl Bench {
    pub fn script(&self, id: DeviceId) -> Arc<Script> {
        self.scripts.lock().unwrap().entry(id).or_default().clone()
    }
}

#[async_trait]
impl Connector for Bench {
    async fn connect(&self, device: &Device) -> modbus_poll::Result<Box<dyn Transport>> {
        let script = self.script(device.id);
        script.connects.fetch_add(1, Ordering::SeqCst);
        let refuse = script.behaviour.lock().unwrap().refuse;
        if refuse {
            return Err(io::Error::from(io::ErrorKind::ConnectionRefused).into());
        }
        Ok(Box::new(ScriptTransport(script)))
    }
}

struct ScriptTransport(Arc<Script>);

struct InFlight(Arc<Script>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for ScriptTransport {
    async fn read(
        &mut self,
        _kind: FunctionKind,
        address: u16,
        quantity: u16,
    ) -> io::Result<Vec<Value>> {
        let script = self.0.clone();
        script.requests.fetch_add(1, Ordering::SeqCst);
        let now = script.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        script.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _in_flight = InFlight(script.clone());

        let behaviour = script.next_request();
        if behaviour.stuck {
            std::future::pending::<()>().await;
        }
        if !behaviour.delay.is_zero() {
            time::sleep(behaviour.delay).await;
        }
        if let Some(kind) = behaviour.fail_once.or(behaviour.fail) {
            return Err(kind.into());
        }

        script.completed.fetch_add(1, Ordering::SeqCst);
        Ok((0..quantity).map(|i| address + i).collect())
    }

    async fn close(&mut self) -> io::Result<()> {
        self.0.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Device `id` with `registers` single-word reads at `id * 100`, `id * 100 + 10`, ...
pub fn device(id: DeviceId, registers: u16) -> Device {
    let base = id as u16 * 100;
    (0..registers).fold(
        Device::new(
            id,
            ModbusProto::Tcp {
                host: format!("10.0.0.{id}"),
                port: 502,
            },
        ),
        |device, n| {
            device.with_register(RegisterRead::new(
                FunctionKind::HoldingRegisters,
                base + n * 10,
                1,
            ))
        },
    )
}

/// The values `device(id, registers)` reads.
pub fn values(id: DeviceId, registers: u16) -> Vec<Value> {
    let base = id as u16 * 100;
    (0..registers).map(|n| base + n * 10).collect()
}

pub fn settings() -> PollSettings {
    PollSettings {
        interval: Duration::from_secs(1),
        ..PollSettings::default()
    }
}

pub async fn poller(
    bench: &Arc<Bench>,
    settings: PollSettings,
    devices: impl IntoIterator<Item = Device>,
) -> (Poller, mpsc::UnboundedReceiver<Snapshot>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut poller = Poller::new(bench.clone(), settings, tx);
    for device in devices {
        poller.update_device(device).await;
    }
    (poller, rx)
}

/// Wait for the next snapshot, failing the test instead of hanging.
pub async fn next(rx: &mut mpsc::UnboundedReceiver<Snapshot>) -> Snapshot {
    time::timeout(Duration::from_secs(120), rx.recv())
        .await
        .expect("no snapshot within two minutes")
        .expect("sink closed")
}

pub fn count(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::SeqCst)
}

pub fn ids<V>(map: &BTreeMap<DeviceId, V>) -> Vec<DeviceId> {
    map.keys().copied().collect()
}
