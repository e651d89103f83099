use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, time::Duration};

use super::register::{RegisterKey, RegisterRead};
use super::{DeviceId, UnitId};

/// One configured field device and the reads to perform on it every cycle.
///
/// Treated as read-only by the poll engine. A changed configuration is a new `Device`, and the
/// connection built from the old one is replaced rather than edited.
#[derive(Clone, Debug, PartialEq)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    pub unit: UnitId,
    pub proto: ModbusProto,
    /// Bound on each connect attempt and each request.
    pub timeout: Duration,
    pub hidden: bool,
    pub registers: BTreeMap<RegisterKey, RegisterRead>,
}

impl Device {
    pub fn new(id: DeviceId, proto: ModbusProto) -> Self {
        Self {
            id,
            name: format!("Device {id}"),
            unit: 1,
            proto,
            timeout: default_timeout(),
            hidden: false,
            registers: BTreeMap::new(),
        }
    }

    pub fn with_unit(mut self, unit: UnitId) -> Self {
        self.unit = unit;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Append a read after the existing ones.
    ///
    /// If the highest key is already `u32::MAX` the read takes the lowest free key instead.
    pub fn with_register(mut self, read: RegisterRead) -> Self {
        let next = match self.registers.keys().next_back() {
            None => Some(1),
            Some(RegisterKey(n)) => n.checked_add(1),
        };
        let key = next
            .or_else(|| (1..u32::MAX).find(|n| !self.registers.contains_key(&RegisterKey(*n))))
            .unwrap_or(0);
        self.registers.insert(RegisterKey(key), read);
        self
    }

    /// Number of values a successful `read_all` yields.
    pub fn value_count(&self) -> usize {
        self.registers.values().map(|r| usize::from(r.quantity)).sum()
    }

    /// One `(name, address)` label per value, aligned with the flat list a read produces.
    pub fn value_labels(&self) -> Vec<(String, u16)> {
        self.registers
            .values()
            .flat_map(|read| {
                (0..read.quantity).map(move |offset| {
                    let address = read.address.wrapping_add(offset);
                    let name = match (&read.name, read.quantity) {
                        (Some(name), 1) => name.clone(),
                        (Some(name), _) => format!("{name}[{offset}]"),
                        (None, _) => format!("{}@{}", read.kind.code(), address),
                    };
                    (name, address)
                })
            })
            .collect()
    }
}

pub(crate) fn default_timeout() -> Duration {
    Duration::from_secs(1)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModbusProto {
    Tcp {
        host: String,
        port: u16,
    },
    Rtu {
        tty: String,
        baud_rate: u32,
        data_bits: DataBits,
        stop_bits: StopBits,
        parity: Parity,
    },
}

impl fmt::Display for ModbusProto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModbusProto::Tcp { host, port } => write!(f, "{host}:{port}"),
            ModbusProto::Rtu {
                tty,
                baud_rate,
                data_bits,
                stop_bits,
                parity,
            } => write!(
                f,
                "{}, {}, {}, {}, {}",
                baud_rate,
                tty,
                u8::from(*data_bits),
                parity.initial(),
                u8::from(*stop_bits)
            ),
        }
    }
}

pub(crate) fn default_modbus_port() -> u16 {
    502
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DataBits {
    Five,
    Six,
    Seven,
    #[default]
    Eight,
}

impl TryFrom<u8> for DataBits {
    type Error = String;

    fn try_from(bits: u8) -> Result<Self, Self::Error> {
        match bits {
            5 => Ok(DataBits::Five),
            6 => Ok(DataBits::Six),
            7 => Ok(DataBits::Seven),
            8 => Ok(DataBits::Eight),
            other => Err(format!("unsupported byte size {other}")),
        }
    }
}

impl From<DataBits> for u8 {
    fn from(bits: DataBits) -> u8 {
        match bits {
            DataBits::Five => 5,
            DataBits::Six => 6,
            DataBits::Seven => 7,
            DataBits::Eight => 8,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StopBits {
    #[default]
    One,
    Two,
}

impl TryFrom<u8> for StopBits {
    type Error = String;

    fn try_from(bits: u8) -> Result<Self, Self::Error> {
        match bits {
            1 => Ok(StopBits::One),
            2 => Ok(StopBits::Two),
            other => Err(format!("unsupported stop bits {other}")),
        }
    }
}

impl From<StopBits> for u8 {
    fn from(bits: StopBits) -> u8 {
        match bits {
            StopBits::One => 1,
            StopBits::Two => 2,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parity {
    #[default]
    #[serde(alias = "none", alias = "N")]
    None,
    #[serde(alias = "even", alias = "E")]
    Even,
    #[serde(alias = "odd", alias = "O")]
    Odd,
}

impl Parity {
    fn initial(self) -> char {
        match self {
            Parity::None => 'N',
            Parity::Even => 'E',
            Parity::Odd => 'O',
        }
    }
}

#[cfg(feature = "rtu")]
impl From<DataBits> for tokio_serial::DataBits {
    fn from(bits: DataBits) -> Self {
        match bits {
            DataBits::Five => tokio_serial::DataBits::Five,
            DataBits::Six => tokio_serial::DataBits::Six,
            DataBits::Seven => tokio_serial::DataBits::Seven,
            DataBits::Eight => tokio_serial::DataBits::Eight,
        }
    }
}

#[cfg(feature = "rtu")]
impl From<StopBits> for tokio_serial::StopBits {
    fn from(bits: StopBits) -> Self {
        match bits {
            StopBits::One => tokio_serial::StopBits::One,
            StopBits::Two => tokio_serial::StopBits::Two,
        }
    }
}

#[cfg(feature = "rtu")]
impl From<Parity> for tokio_serial::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        }
    }
}

#[cfg(test)]
use pretty_assertions::assert_eq;

#[cfg(test)]
use super::register::FunctionKind;

#[test]
fn connection_labels() {
    let tcp = ModbusProto::Tcp {
        host: "127.0.0.1".into(),
        port: 502,
    };
    assert_eq!(tcp.to_string(), "127.0.0.1:502");

    let rtu = ModbusProto::Rtu {
        tty: "/dev/ttyUSB0".into(),
        baud_rate: 9600,
        data_bits: DataBits::Eight,
        stop_bits: StopBits::One,
        parity: Parity::Even,
    };
    assert_eq!(rtu.to_string(), "9600, /dev/ttyUSB0, 8, E, 1");
}

#[test]
fn value_labels_follow_flat_value_order() {
    let device = Device::new(
        4,
        ModbusProto::Tcp {
            host: "plc".into(),
            port: default_modbus_port(),
        },
    )
    .with_register(RegisterRead::new(FunctionKind::HoldingRegisters, 100, 2).named("setpoint"))
    .with_register(RegisterRead::new(FunctionKind::Coils, 8, 1).named("pump"))
    .with_register(RegisterRead::new(FunctionKind::InputRegisters, 30, 1));

    assert_eq!(device.name, "Device 4");
    assert_eq!(device.value_count(), 4);
    assert_eq!(
        device.value_labels(),
        vec![
            ("setpoint[0]".to_owned(), 100),
            ("setpoint[1]".to_owned(), 101),
            ("pump".to_owned(), 8),
            ("4@30".to_owned(), 30),
        ]
    );
}

#[test]
fn with_register_appends_after_highest_key() {
    let mut device = Device::new(
        1,
        ModbusProto::Tcp {
            host: "plc".into(),
            port: 502,
        },
    );
    device.registers.insert(
        RegisterKey(7),
        RegisterRead::new(FunctionKind::Coils, 0, 1),
    );
    let device = device.with_register(RegisterRead::new(FunctionKind::Coils, 1, 1));

    assert_eq!(
        device.registers.keys().copied().collect::<Vec<_>>(),
        vec![RegisterKey(7), RegisterKey(8)]
    );
}

#[test]
fn with_register_never_overflows_the_key() {
    let mut device = Device::new(
        1,
        ModbusProto::Tcp {
            host: "plc".into(),
            port: 502,
        },
    );
    device.registers.insert(
        RegisterKey(u32::MAX),
        RegisterRead::new(FunctionKind::Coils, 0, 1),
    );
    let device = device.with_register(RegisterRead::new(FunctionKind::Coils, 1, 1));

    assert_eq!(
        device.registers.keys().copied().collect::<Vec<_>>(),
        vec![RegisterKey(1), RegisterKey(u32::MAX)]
    );
}
