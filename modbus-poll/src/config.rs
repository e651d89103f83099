//! Read side of the device configuration store.
//!
//! The store is one JSON document keyed by `device_<n>`:
//!
//! ```json
//! {
//!   "poll": { "interval": "500ms" },
//!   "device_1": {
//!     "device_name": "Boiler room",
//!     "slave_address": 1,
//!     "default_method": "tcp",
//!     "connection_params": {
//!       "tcp": { "host": "10.0.0.12", "port": 502 },
//!       "rtu": { "serial_port": "/dev/ttyUSB0", "baudrate": 9600, "parity": "Even" }
//!     },
//!     "registers": {
//!       "register_1": { "address": 0, "quantity": 2, "function_code": 3, "register_name": "temp" }
//!     }
//!   }
//! }
//! ```

use humantime_serde::re::humantime;
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_aux::field_attributes::{
    deserialize_number_from_string, deserialize_option_number_from_string,
};
use std::{collections::BTreeMap, path::Path, time::Duration};
use tracing::debug;

use crate::modbus::device::default_modbus_port;
use crate::modbus::{
    DataBits, Device, DeviceId, ModbusProto, Parity, RegisterKey, RegisterRead, StopBits, UnitId,
};
use crate::Error;

const DEVICE_PREFIX: &str = "device_";
const POLL_KEY: &str = "poll";

/// Timing of the poll engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollSettings {
    /// Spacing between the starts of consecutive cycles.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// How long `stop_polling` waits for tasks before giving up on them.
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// How often the runner retries disconnected devices.
    #[serde(with = "humantime_serde")]
    pub reconnect_interval: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(3),
            reconnect_interval: Duration::from_secs(10),
        }
    }
}

/// Every device found in a configuration store.
#[derive(Clone, Debug, Default)]
pub struct DeviceStore {
    pub poll: Option<PollSettings>,
    devices: BTreeMap<DeviceId, Device>,
}

impl DeviceStore {
    pub fn load<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Loading device store");
        let bytes = std::fs::read(path)?;
        Self::from_slice(&bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> crate::Result<Self> {
        let document: BTreeMap<String, serde_json::Value> = serde_json::from_slice(bytes)?;

        let mut store = DeviceStore::default();
        for (key, value) in document {
            if key == POLL_KEY {
                store.poll = Some(serde_json::from_value(value)?);
                continue;
            }
            let Some(id) = key
                .strip_prefix(DEVICE_PREFIX)
                .and_then(|n| n.parse::<DeviceId>().ok())
            else {
                debug!(%key, "Ignoring unknown store entry");
                continue;
            };
            if id == 0 {
                return Err(Error::config(format!("{key}: device numbers start at 1")));
            }

            let entry: DeviceEntry = serde_json::from_value(value)
                .map_err(|e| Error::config(format!("{key}: {e}")))?;
            let device = entry
                .into_device(id)
                .map_err(|e| Error::config(format!("{key}: {e}")))?;
            store.devices.insert(id, device);
        }

        Ok(store)
    }

    pub fn get(&self, id: DeviceId) -> Option<&Device> {
        self.devices.get(&id)
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn into_devices(self) -> impl Iterator<Item = Device> {
        self.devices.into_values()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Method {
    Tcp,
    Rtu,
}

#[derive(Debug, Deserialize)]
struct DeviceEntry {
    #[serde(default)]
    device_name: Option<String>,

    #[serde(
        alias = "unit",
        default = "default_unit",
        deserialize_with = "deserialize_number_from_string"
    )]
    slave_address: UnitId,

    #[serde(default)]
    default_method: Option<Method>,

    #[serde(default)]
    connection_params: ConnectionParams,

    #[serde(default)]
    hidden: bool,

    /// Overrides the serial link's own timeout.
    #[serde(default, deserialize_with = "deserialize_timeout")]
    timeout: Option<Duration>,

    #[serde(default)]
    registers: BTreeMap<RegisterKey, RegisterRead>,
}

fn default_unit() -> UnitId {
    1
}

#[derive(Debug, Default, Deserialize)]
struct ConnectionParams {
    #[serde(default)]
    tcp: Option<TcpParams>,
    #[serde(default)]
    rtu: Option<RtuParams>,
}

#[derive(Debug, Deserialize)]
struct TcpParams {
    host: String,

    #[serde(
        default = "default_modbus_port",
        deserialize_with = "deserialize_number_from_string"
    )]
    port: u16,
}

#[derive(Debug, Deserialize)]
struct RtuParams {
    #[serde(alias = "tty")]
    serial_port: String,

    #[serde(alias = "baud_rate", deserialize_with = "deserialize_number_from_string")]
    baudrate: u32,

    #[serde(default)]
    parity: Parity,

    #[serde(
        alias = "stop_bits",
        default = "default_stop_bits",
        deserialize_with = "deserialize_number_from_string"
    )]
    stopbits: u8,

    #[serde(
        alias = "data_bits",
        default = "default_bytesize",
        deserialize_with = "deserialize_number_from_string"
    )]
    bytesize: u8,

    /// Seconds.
    #[serde(default, deserialize_with = "deserialize_option_number_from_string")]
    timeout: Option<f64>,
}

fn default_stop_bits() -> u8 {
    1
}

fn default_bytesize() -> u8 {
    8
}

fn seconds(secs: f64) -> Result<Duration, String> {
    Duration::try_from_secs_f64(secs)
        .ok()
        .filter(|timeout| !timeout.is_zero())
        .ok_or_else(|| format!("invalid timeout {secs}"))
}

/// A humantime string (`"1500ms"`), or a number of seconds as a number or numeric string.
fn deserialize_timeout<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Duration>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Timeout {
        Seconds(f64),
        Text(String),
    }

    let timeout = match Option::<Timeout>::deserialize(deserializer)? {
        None => return Ok(None),
        Some(Timeout::Seconds(secs)) => seconds(secs),
        Some(Timeout::Text(text)) => match text.trim().parse::<f64>() {
            Ok(secs) => seconds(secs),
            Err(_) => humantime::parse_duration(&text).map_err(|e| e.to_string()),
        },
    };
    timeout.map(Some).map_err(de::Error::custom)
}

impl DeviceEntry {
    fn into_device(self, id: DeviceId) -> Result<Device, String> {
        let ConnectionParams { tcp, rtu } = self.connection_params;

        // Without an explicit choice the only configured method wins, TCP if both are.
        let method = match (self.default_method, &tcp, &rtu) {
            (Some(method), _, _) => method,
            (None, Some(_), _) => Method::Tcp,
            (None, None, Some(_)) => Method::Rtu,
            (None, None, None) => return Err("no connection parameters".to_owned()),
        };

        let mut link_timeout = None;
        let proto = match method {
            Method::Tcp => {
                let TcpParams { host, port } =
                    tcp.ok_or("default method is tcp but no tcp parameters are set")?;
                ModbusProto::Tcp { host, port }
            }
            Method::Rtu => {
                let params = rtu.ok_or("default method is rtu but no rtu parameters are set")?;
                link_timeout = params.timeout.map(seconds).transpose()?;
                ModbusProto::Rtu {
                    tty: params.serial_port,
                    baud_rate: params.baudrate,
                    data_bits: DataBits::try_from(params.bytesize)?,
                    stop_bits: StopBits::try_from(params.stopbits)?,
                    parity: params.parity,
                }
            }
        };

        for (key, read) in &self.registers {
            read.validate().map_err(|e| format!("{key}: {e}"))?;
        }

        let mut device = Device::new(id, proto).with_unit(self.slave_address);
        if let Some(timeout) = self.timeout.or(link_timeout) {
            device = device.with_timeout(timeout);
        }
        if let Some(name) = self.device_name.filter(|n| !n.is_empty()) {
            device.name = name;
        }
        device.hidden = self.hidden;
        device.registers = self.registers;
        Ok(device)
    }
}

#[cfg(test)]
use pretty_assertions::assert_eq;

#[cfg(test)]
use crate::modbus::FunctionKind;

#[test]
fn parse_minimal_tcp_device() {
    let store = DeviceStore::from_slice(
        br#"{
            "device_1": {
                "slave_address": "3",
                "connection_params": { "tcp": { "host": "1.1.1.1" } }
            }
        }"#,
    )
    .unwrap();

    let device = store.get(1).unwrap();
    assert_eq!(device.name, "Device 1");
    assert_eq!(device.unit, 3);
    assert_eq!(
        device.proto,
        ModbusProto::Tcp {
            host: "1.1.1.1".into(),
            port: 502
        }
    );
    assert_eq!(device.timeout, Duration::from_secs(1));
    assert!(device.registers.is_empty());
    assert_eq!(store.poll, None);
}

#[test]
fn parse_full_store() {
    let store = DeviceStore::from_slice(
        br#"{
            "poll": { "interval": "250ms", "shutdown_timeout": "5s" },
            "device_2": {
                "device_name": "Chiller",
                "slave_address": 17,
                "default_method": "rtu",
                "hidden": true,
                "timeout": "2s",
                "connection_params": {
                    "tcp": { "host": "10.10.10.219", "port": "1502" },
                    "rtu": {
                        "serial_port": "/dev/ttyUSB0",
                        "baudrate": "19200",
                        "parity": "Even",
                        "stopbits": "2",
                        "bytesize": "7",
                        "timeout": "3"
                    }
                },
                "registers": {
                    "register_10": { "address": 30, "function_code": 4, "quantity": "1" },
                    "register_2": { "address": 20, "function_code": 3, "quantity": 2, "register_name": "supply" },
                    "register_1": { "address": 5, "function_code": 1 }
                }
            },
            "device_1": {
                "connection_params": { "rtu": { "serial_port": "COM1", "baudrate": 9600, "timeout": "3" } }
            },
            "last_saved": "yesterday"
        }"#,
    )
    .unwrap();

    assert_eq!(
        store.poll,
        Some(PollSettings {
            interval: Duration::from_millis(250),
            shutdown_timeout: Duration::from_secs(5),
            reconnect_interval: Duration::from_secs(10),
        })
    );
    assert_eq!(store.len(), 2);
    assert_eq!(store.devices().map(|d| d.id).collect::<Vec<_>>(), vec![1, 2]);

    let chiller = store.get(2).unwrap();
    assert_eq!(chiller.name, "Chiller");
    assert_eq!(chiller.unit, 17);
    assert!(chiller.hidden);
    assert_eq!(chiller.timeout, Duration::from_secs(2));
    assert_eq!(
        chiller.proto,
        ModbusProto::Rtu {
            tty: "/dev/ttyUSB0".into(),
            baud_rate: 19200,
            data_bits: DataBits::Seven,
            stop_bits: StopBits::Two,
            parity: Parity::Even,
        }
    );
    assert_eq!(
        chiller.registers.values().cloned().collect::<Vec<_>>(),
        vec![
            RegisterRead::new(FunctionKind::Coils, 5, 1),
            RegisterRead::new(FunctionKind::HoldingRegisters, 20, 2).named("supply"),
            RegisterRead::new(FunctionKind::InputRegisters, 30, 1),
        ]
    );

    // Only RTU configured, so RTU is picked without a default method.
    assert!(matches!(
        store.get(1).unwrap().proto,
        ModbusProto::Rtu {
            ref tty,
            baud_rate: 9600,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            parity: Parity::None,
        } if tty == "COM1"
    ));
    // The serial link's own timeout, in seconds, unless the device overrides it.
    assert_eq!(store.get(1).unwrap().timeout, Duration::from_secs(3));
}

#[test]
fn timeouts_accept_plain_seconds() {
    let store = DeviceStore::from_slice(
        br#"{
            "device_1": { "timeout": "3", "connection_params": { "tcp": { "host": "a" } } },
            "device_2": { "timeout": 0.5, "connection_params": { "tcp": { "host": "b" } } },
            "device_3": { "timeout": "1500ms", "connection_params": { "tcp": { "host": "c" } } },
            "device_4": { "connection_params": { "rtu": { "serial_port": "COM1", "baudrate": 9600, "timeout": 2 } } }
        }"#,
    )
    .unwrap();

    let timeouts = store.devices().map(|d| d.timeout).collect::<Vec<_>>();
    assert_eq!(
        timeouts,
        vec![
            Duration::from_secs(3),
            Duration::from_millis(500),
            Duration::from_millis(1500),
            Duration::from_secs(2),
        ]
    );
}

#[test]
fn tcp_wins_when_both_methods_are_configured() {
    let store = DeviceStore::from_slice(
        br#"{
            "device_5": {
                "connection_params": {
                    "tcp": { "host": "plc.local" },
                    "rtu": { "serial_port": "COM3", "baudrate": 9600 }
                }
            }
        }"#,
    )
    .unwrap();

    assert!(matches!(store.get(5).unwrap().proto, ModbusProto::Tcp { .. }));
}

#[test]
fn reject_unusable_devices() {
    let cases: [&[u8]; 9] = [
        br#"{ "device_1": { "connection_params": {} } }"#,
        br#"{ "device_1": { "default_method": "tcp", "connection_params": { "rtu": { "serial_port": "COM1", "baudrate": 9600 } } } }"#,
        br#"{ "device_1": { "connection_params": { "rtu": { "serial_port": "COM1", "baudrate": 9600, "parity": "Mark" } } } }"#,
        br#"{ "device_1": { "connection_params": { "rtu": { "serial_port": "COM1", "baudrate": 9600, "stopbits": "1.5" } } } }"#,
        br#"{ "device_1": { "connection_params": { "tcp": { "host": "a" } }, "registers": { "register_1": { "address": 0, "function_code": 3, "quantity": 0 } } } }"#,
        br#"{ "device_0": { "connection_params": { "tcp": { "host": "a" } } } }"#,
        br#"{ "device_1": { "timeout": "soon", "connection_params": { "tcp": { "host": "a" } } } }"#,
        br#"{ "device_1": { "connection_params": { "rtu": { "serial_port": "COM1", "baudrate": 9600, "timeout": "0" } } } }"#,
        br#"{ "device_1": { "connection_params": { "tcp": { "host": "a" } }, "registers": { "register_4294967295": { "address": 0, "function_code": 3 } } } }"#,
    ];

    for case in cases {
        let result = DeviceStore::from_slice(case);
        assert!(
            matches!(result, Err(Error::Config(_))),
            "{} -> {:?}",
            String::from_utf8_lossy(case),
            result
        );
    }
}
