use crate::modbus::{ConnectState, Connector, Device, DeviceId, Transport, Value};
use crate::Error;
use std::{fmt, sync::Arc};
use tokio::{sync::watch, time};
use tracing::{debug, info, warn};

/// The live link to one configured device plus the reads to run on it.
///
/// Owns at most one transport. Every operation takes `&mut self`, so whoever holds the
/// connection is the only one able to read from it.
pub struct DeviceConnection {
    device: Arc<Device>,
    connector: Arc<dyn Connector>,
    transport: Option<Box<dyn Transport>>,
    state: watch::Sender<ConnectState>,
}

impl fmt::Debug for DeviceConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceConnection")
            .field("device", &self.device.id)
            .field("proto", &self.device.proto.to_string())
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl DeviceConnection {
    /// Build a disconnected connection for `device`.
    pub fn new(device: Arc<Device>, connector: Arc<dyn Connector>) -> Self {
        let (state, _) = watch::channel(ConnectState::Disconnected);
        Self {
            device,
            connector,
            transport: None,
            state,
        }
    }

    pub fn id(&self) -> DeviceId {
        self.device.id
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Follow the connection state from elsewhere, including while a worker owns the connection.
    pub fn status(&self) -> watch::Receiver<ConnectState> {
        self.state.subscribe()
    }

    /// Whether a transport is open.
    ///
    /// Neither `tokio-modbus` nor the serial stack reports liveness on its own, so a peer that goes
    /// away while the connection is idle is only noticed by the next request. That request fails
    /// as connection-lost and the worker disconnects the device.
    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    /// Open the transport. Does nothing if it is already open.
    #[tracing::instrument(level = "debug", skip(self), fields(device = self.device.id))]
    pub async fn connect(&mut self) -> crate::Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        let attempt = self.connector.connect(&self.device);
        match time::timeout(self.device.timeout, attempt).await {
            Ok(Ok(transport)) => {
                info!(device = self.device.id, proto = %self.device.proto, "Connected");
                self.transport = Some(transport);
                self.state.send_replace(ConnectState::Connected);
                Ok(())
            }
            Ok(Err(error)) => {
                warn!(device = self.device.id, %error, "Connection failed");
                self.state.send_replace(ConnectState::Errored);
                Err(error)
            }
            Err(_) => {
                warn!(device = self.device.id, "Connection attempt timed out");
                self.state.send_replace(ConnectState::Errored);
                Err(Error::Timeout(self.device.id, self.device.timeout))
            }
        }
    }

    /// Close the transport. Safe to call when already disconnected.
    pub async fn disconnect(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(error) = transport.close().await {
                debug!(device = self.device.id, %error, "Error while closing transport");
            }
            info!(device = self.device.id, "Disconnected");
        }
        self.state.send_replace(ConnectState::Disconnected);
    }

    /// Run every configured read in ascending register key order and return the concatenated
    /// values.
    ///
    /// All or nothing: the first failing request aborts the read and the values gathered so far
    /// are dropped. One request per entry and no retries.
    ///
    /// A request that times out leaves its reply unread on the link, so the transport is replaced
    /// before returning the timeout. If the reopen fails the connection is left disconnected.
    pub async fn read_all(&mut self) -> crate::Result<Vec<Value>> {
        match self.read_registers().await {
            Err(error @ Error::Timeout(..)) => {
                self.reopen().await;
                Err(error)
            }
            result => result,
        }
    }

    async fn reopen(&mut self) {
        debug!(device = self.device.id, "Reopening transport after a timed out request");
        self.disconnect().await;
        // Failures are logged and leave the connection disconnected.
        let _ = self.connect().await;
    }

    async fn read_registers(&mut self) -> crate::Result<Vec<Value>> {
        let id = self.device.id;
        let transport = self.transport.as_mut().ok_or(Error::NotConnected(id))?;

        let mut values = Vec::with_capacity(self.device.value_count());
        for (key, read) in &self.device.registers {
            debug!(
                device = id,
                %key,
                address = read.address,
                quantity = read.quantity,
                kind = %read.kind,
                "Polling register",
            );

            let request = transport.read(read.kind, read.address, read.quantity);
            let words = time::timeout(self.device.timeout, request)
                .await
                .map_err(|_| Error::Timeout(id, self.device.timeout))??;

            if words.len() < usize::from(read.quantity) {
                return Err(Error::ShortRead {
                    device: id,
                    address: read.address,
                    expected: read.quantity,
                    got: words.len(),
                });
            }
            values.extend_from_slice(&words[..usize::from(read.quantity)]);
        }

        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::{FunctionKind, ModbusProto, RegisterRead};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::{
        io,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
        time::Duration,
    };

    /// Answers every read with `address + offset`, optionally failing the n-th request.
    #[derive(Default)]
    struct Script {
        connects: AtomicUsize,
        requests: AtomicUsize,
        fail_request: Mutex<Option<(usize, io::ErrorKind)>>,
        refuse: Mutex<bool>,
        short: Mutex<bool>,
        stall: Mutex<bool>,
        /// This request answers only after its timeout, leaving the reply queued on the link.
        late_request: Mutex<Option<usize>>,
    }

    struct ScriptConnector(Arc<Script>);

    struct ScriptTransport {
        script: Arc<Script>,
        /// A reply that arrived after its request gave up, read by whoever asks next.
        unread: Option<Vec<Value>>,
    }

    #[async_trait]
    impl Connector for ScriptConnector {
        async fn connect(&self, _device: &Device) -> crate::Result<Box<dyn Transport>> {
            self.0.connects.fetch_add(1, Ordering::SeqCst);
            if *self.0.refuse.lock().unwrap() {
                return Err(io::Error::from(io::ErrorKind::ConnectionRefused).into());
            }
            Ok(Box::new(ScriptTransport {
                script: self.0.clone(),
                unread: None,
            }))
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
            let script = self.script.clone();
            let n = script.requests.fetch_add(1, Ordering::SeqCst);
            if let Some(stale) = self.unread.take() {
                return Ok(stale);
            }
            let stall = *script.stall.lock().unwrap();
            if stall {
                std::future::pending::<()>().await;
            }
            let fail = *script.fail_request.lock().unwrap();
            if let Some((at, kind)) = fail {
                if at == n {
                    return Err(kind.into());
                }
            }
            let short = *script.short.lock().unwrap();
            let quantity = if short { quantity - 1 } else { quantity };
            let reply: Vec<Value> = (0..quantity).map(|i| address + i).collect();

            let late = *script.late_request.lock().unwrap();
            if late == Some(n) {
                self.unread = Some(reply.clone());
                std::future::pending::<()>().await;
            }
            Ok(reply)
        }

        async fn close(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn device() -> Arc<Device> {
        let device = Device::new(
            7,
            ModbusProto::Tcp {
                host: "plc".into(),
                port: 502,
            },
        )
        .with_register(RegisterRead::new(FunctionKind::HoldingRegisters, 100, 2))
        .with_register(RegisterRead::new(FunctionKind::InputRegisters, 10, 1))
        .with_register(RegisterRead::new(FunctionKind::Coils, 0, 3));
        Arc::new(device)
    }

    fn connection() -> (DeviceConnection, Arc<Script>) {
        let script = Arc::new(Script::default());
        let connection = DeviceConnection::new(device(), Arc::new(ScriptConnector(script.clone())));
        (connection, script)
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let (mut connection, script) = connection();
        let status = connection.status();
        assert!(!connection.is_connected());

        connection.connect().await.unwrap();
        connection.connect().await.unwrap();

        assert!(connection.is_connected());
        assert_eq!(script.connects.load(Ordering::SeqCst), 1);
        assert_eq!(*status.borrow(), ConnectState::Connected);
    }

    #[tokio::test]
    async fn refused_connection_stays_disconnected() {
        let (mut connection, script) = connection();
        *script.refuse.lock().unwrap() = true;

        let result = connection.connect().await;

        assert!(matches!(result, Err(Error::IOError(_))));
        assert!(!connection.is_connected());
        assert_eq!(*connection.status().borrow(), ConnectState::Errored);
    }

    #[tokio::test]
    async fn disconnect_is_safe_twice() {
        let (mut connection, _) = connection();
        connection.connect().await.unwrap();

        connection.disconnect().await;
        connection.disconnect().await;

        assert!(!connection.is_connected());
        assert_eq!(*connection.status().borrow(), ConnectState::Disconnected);
    }

    #[tokio::test]
    async fn read_all_concatenates_in_key_order() {
        let (mut connection, script) = connection();
        connection.connect().await.unwrap();

        let values = connection.read_all().await.unwrap();

        assert_eq!(values, vec![100, 101, 10, 0, 1, 2]);
        assert_eq!(script.requests.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn read_all_discards_partial_results() {
        let (mut connection, script) = connection();
        connection.connect().await.unwrap();
        *script.fail_request.lock().unwrap() = Some((1, io::ErrorKind::InvalidData));

        let result = connection.read_all().await;

        assert!(matches!(result, Err(Error::IOError(ref e)) if e.kind() == io::ErrorKind::InvalidData));
        // Stops at the first failure, no retry.
        assert_eq!(script.requests.load(Ordering::SeqCst), 2);
        assert!(connection.is_connected());
    }

    #[tokio::test]
    async fn read_all_requires_connection() {
        let (mut connection, script) = connection();

        let result = connection.read_all().await;

        assert!(matches!(result, Err(Error::NotConnected(7))));
        assert_eq!(script.requests.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn short_reply_is_an_error() {
        let (mut connection, script) = connection();
        connection.connect().await.unwrap();
        *script.short.lock().unwrap() = true;

        let result = connection.read_all().await;

        assert!(matches!(
            result,
            Err(Error::ShortRead {
                device: 7,
                address: 100,
                expected: 2,
                got: 1
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_request_times_out() {
        let (mut connection, script) = connection();
        connection.connect().await.unwrap();
        *script.stall.lock().unwrap() = true;

        let started = time::Instant::now();
        let result = connection.read_all().await;

        assert!(matches!(result, Err(Error::Timeout(7, _))));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(1), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(1100), "{elapsed:?}");
        // The stalled transport is replaced, not reused.
        assert_eq!(script.connects.load(Ordering::SeqCst), 2);
        assert!(connection.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn late_reply_is_not_read_by_the_next_request() {
        let (mut connection, script) = connection();
        connection.connect().await.unwrap();
        // The second request (address 10) answers after its timeout.
        *script.late_request.lock().unwrap() = Some(1);

        let result = connection.read_all().await;
        assert!(matches!(result, Err(Error::Timeout(7, _))));
        assert!(connection.is_connected());

        // On the old transport this would read [10] as the reply to address 100.
        let values = connection.read_all().await.unwrap();
        assert_eq!(values, vec![100, 101, 10, 0, 1, 2]);
        assert_eq!(script.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reopen_after_timeout_leaves_it_disconnected() {
        let (mut connection, script) = connection();
        connection.connect().await.unwrap();
        *script.stall.lock().unwrap() = true;
        *script.refuse.lock().unwrap() = true;

        let result = connection.read_all().await;

        assert!(matches!(result, Err(Error::Timeout(7, _))));
        assert!(!connection.is_connected());
        assert_eq!(*connection.status().borrow(), ConnectState::Errored);
    }

    #[tokio::test]
    async fn empty_register_list_reads_nothing() {
        let script = Arc::new(Script::default());
        let device = Device::new(
            2,
            ModbusProto::Tcp {
                host: "plc".into(),
                port: 502,
            },
        );
        let mut connection =
            DeviceConnection::new(Arc::new(device), Arc::new(ScriptConnector(script.clone())));
        connection.connect().await.unwrap();

        assert_eq!(connection.read_all().await.unwrap(), Vec::<Value>::new());
        assert_eq!(script.requests.load(Ordering::SeqCst), 0);
    }
}
