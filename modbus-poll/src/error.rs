use std::{io::ErrorKind, time::Duration};

use thiserror::Error;

use crate::modbus::DeviceId;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    JSONError(#[from] serde_json::Error),

    #[error("device {0} is not connected")]
    NotConnected(DeviceId),

    #[error("device {0} did not answer within {1:?}")]
    Timeout(DeviceId, Duration),

    #[error("device {device} returned {got} values for a read of {expected} at address {address}")]
    ShortRead {
        device: DeviceId,
        address: u16,
        expected: u16,
        got: usize,
    },

    #[error("unknown device {0}")]
    UnknownDevice(DeviceId),

    #[error("device {0} is owned by the running poll session")]
    DeviceBusy(DeviceId),

    #[error("no connected devices")]
    NoConnectedDevices,

    #[error("polling is already running")]
    AlreadyPolling,

    #[error("invalid configuration: {0}")]
    Config(std::borrow::Cow<'static, str>),

    #[error("Unrecognised modbus protocol")]
    UnrecognisedModbusProtocol,

    #[error("{0}")]
    Other(std::borrow::Cow<'static, str>),
}

impl Error {
    /// Whether the link to the device is gone, as opposed to a single request failing.
    ///
    /// A lost connection is skipped by later cycles until it is reconnected. Anything else
    /// (timeouts, exception replies, short reads) is retried on the next cycle. A timed out
    /// request additionally gets its transport replaced by `DeviceConnection::read_all`.
    pub fn is_connection_lost(&self) -> bool {
        match self {
            Error::NotConnected(_) => true,
            Error::IOError(error) => matches!(
                error.kind(),
                ErrorKind::BrokenPipe
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::NotConnected
                    | ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }

    pub(crate) fn config<S: Into<std::borrow::Cow<'static, str>>>(message: S) -> Self {
        Self::Config(message.into())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Self::Other(s.into())
    }
}
impl From<&'static str> for Error {
    fn from(s: &'static str) -> Self {
        Self::Other(s.into())
    }
}

#[test]
fn classifies_lost_connections() {
    use std::io;

    let lost = [
        ErrorKind::BrokenPipe,
        ErrorKind::ConnectionReset,
        ErrorKind::ConnectionAborted,
        ErrorKind::NotConnected,
        ErrorKind::UnexpectedEof,
    ];
    for kind in lost {
        assert!(Error::from(io::Error::from(kind)).is_connection_lost(), "{kind:?}");
    }
    assert!(Error::NotConnected(1).is_connection_lost());

    assert!(!Error::from(io::Error::new(ErrorKind::InvalidData, "bad crc")).is_connection_lost());
    assert!(!Error::Timeout(1, Duration::from_secs(1)).is_connection_lost());
    assert!(!Error::ShortRead {
        device: 1,
        address: 0,
        expected: 2,
        got: 1
    }
    .is_connection_lost());
}
