use crate::modbus::{Device, FunctionKind, ModbusProto, Unit, Value};
use crate::Error;
use async_trait::async_trait;
use std::io;
use tokio_modbus::client::Context as ModbusClient;
use tokio_modbus::prelude::*;
use tracing::{debug, error};

/// An established link to one device, able to issue one read request at a time.
///
/// Takes `&mut self` so a transport can never be driven by two reads at once.
#[async_trait]
pub trait Transport: Send {
    /// Read `quantity` values of `kind` starting at `address`.
    async fn read(&mut self, kind: FunctionKind, address: u16, quantity: u16)
        -> io::Result<Vec<Value>>;

    /// Close the underlying socket or port.
    async fn close(&mut self) -> io::Result<()>;
}

/// Opens transports for devices.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, device: &Device) -> crate::Result<Box<dyn Transport>>;
}

/// Connects over Modbus TCP or RTU using `tokio-modbus`.
#[derive(Clone, Copy, Debug, Default)]
pub struct ModbusConnector;

#[async_trait]
impl Connector for ModbusConnector {
    async fn connect(&self, device: &Device) -> crate::Result<Box<dyn Transport>> {
        let context = device
            .proto
            .connect(Slave(device.unit), device.timeout)
            .await?;
        Ok(Box::new(ModbusTransport(context)))
    }
}

struct ModbusTransport(ModbusClient);

#[async_trait]
impl Transport for ModbusTransport {
    async fn read(
        &mut self,
        kind: FunctionKind,
        address: u16,
        quantity: u16,
    ) -> io::Result<Vec<Value>> {
        let context = &mut self.0;
        match kind {
            FunctionKind::Coils => context
                .read_coils(address, quantity)
                .await
                .map(bits_to_values),
            FunctionKind::DiscreteInputs => context
                .read_discrete_inputs(address, quantity)
                .await
                .map(bits_to_values),
            FunctionKind::HoldingRegisters => {
                context.read_holding_registers(address, quantity).await
            }
            FunctionKind::InputRegisters => context.read_input_registers(address, quantity).await,
        }
    }

    async fn close(&mut self) -> io::Result<()> {
        self.0.disconnect().await
    }
}

fn bits_to_values(bits: Vec<bool>) -> Vec<Value> {
    bits.into_iter().map(Value::from).collect()
}

impl ModbusProto {
    #[tracing::instrument(level = "debug", skip(timeout))]
    pub async fn connect(
        &self,
        unit: Unit,
        timeout: std::time::Duration,
    ) -> crate::Result<ModbusClient> {
        let client = match *self {
            #[cfg(feature = "tcp")]
            ModbusProto::Tcp { ref host, port } => {
                let socket_addr = tokio::net::lookup_host((host.as_str(), port))
                    .await?
                    .next()
                    .ok_or_else(|| format!("no address found for {}", host))?;
                debug!(%socket_addr, "resolved");
                tcp::connect_slave(socket_addr, unit).await?
            }

            #[cfg(feature = "rtu")]
            ModbusProto::Rtu {
                ref tty,
                baud_rate,
                data_bits,
                stop_bits,
                parity,
            } => {
                let builder = tokio_serial::new(tty, baud_rate)
                    .data_bits(data_bits.into())
                    .parity(parity.into())
                    .stop_bits(stop_bits.into())
                    .flow_control(tokio_serial::FlowControl::None)
                    .timeout(timeout);
                let port = tokio_serial::SerialStream::open(&builder).map_err(io::Error::from)?;
                rtu::connect_slave(port, unit).await?
            }

            #[allow(unreachable_patterns)]
            _ => {
                error!("Unrecognised protocol");
                Err(Error::UnrecognisedModbusProtocol)?
            }
        };
        Ok(client)
    }
}

#[tokio::test]
async fn refused_tcp_connection_is_an_io_error() {
    // Bind then drop a listener so the port is very likely closed.
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let proto = ModbusProto::Tcp {
        host: "127.0.0.1".into(),
        port,
    };

    let result = proto
        .connect(Slave(1), std::time::Duration::from_secs(1))
        .await;
    assert!(matches!(result, Err(Error::IOError(_))));
}
