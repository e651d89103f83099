use serde::Serialize;

pub mod connection;
pub mod connector;
pub mod device;
pub mod register;

pub use self::connection::DeviceConnection;
pub use self::connector::{Connector, ModbusConnector, Transport};
pub use self::device::{DataBits, Device, ModbusProto, Parity, StopBits};
pub use self::register::{FunctionKind, RegisterKey, RegisterRead};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectState {
    Connected,
    Disconnected,
    /// The last connect attempt failed.
    Errored,
}

/// Configuration-level device number, unique within a store.
pub type DeviceId = u32;

pub type UnitId = tokio_modbus::prelude::SlaveId;
pub type Unit = tokio_modbus::prelude::Slave;

/// A single polled value. Bit reads yield `0` or `1`.
pub type Value = u16;
