//! Monocle Session Module
//!
//! Main coordinator: scans, connects, discovers the UART pair and gates every
//! read/write on the connection state. All state lives behind one lock that the
//! foreground operations and the transport's connect events share.

use crate::domain::models::{DeviceAddress, ScanResult};
use crate::error::{MonocleError, Result};
use crate::infrastructure::bluetooth::{
    connection::{discover_uart, ConnectionConfig, UartCharacteristics},
    protocol,
    scanner::ScanFilter,
    transport::{
        CharacteristicOf, ConnectionParams, Device, GattCharacteristic, ScanCallback, ScanEvent,
        Transport, TransportError,
    },
    writer::ChunkedWriter,
};
use std::future;
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

type ScanSlot = StdMutex<Option<oneshot::Sender<Result<ScanResult, TransportError>>>>;

struct ConnectEvent<D> {
    device: D,
    connected: bool,
}

struct SessionState<T: Transport> {
    connected: bool,
    device: Option<T::Device>,
    rx: Option<CharacteristicOf<T>>,
    tx: Option<CharacteristicOf<T>>,
}

impl<T: Transport> SessionState<T> {
    fn empty() -> Self {
        Self {
            connected: false,
            device: None,
            rx: None,
            tx: None,
        }
    }

    /// Start tracking `device`. Handles from any earlier discovery are dropped.
    fn track(&mut self, device: T::Device) {
        self.device = Some(device);
        self.rx = None;
        self.tx = None;
        self.connected = false;
    }

    fn attach(&mut self, uart: UartCharacteristics<CharacteristicOf<T>>) {
        self.rx = Some(uart.rx);
        self.tx = Some(uart.tx);
        self.connected = true;
    }

    fn rx(&self) -> Result<&CharacteristicOf<T>> {
        match (&self.rx, self.connected) {
            (Some(rx), true) => Ok(rx),
            _ => Err(MonocleError::NotConnected),
        }
    }

    fn tx(&self) -> Result<&CharacteristicOf<T>> {
        match (&self.tx, self.connected) {
            (Some(tx), true) => Ok(tx),
            _ => Err(MonocleError::NotConnected),
        }
    }
}

struct Shared<T: Transport> {
    transport: Arc<T>,
    config: ConnectionConfig,
    state: Mutex<SessionState<T>>,
}

/// A session with one Monocle over an injected transport.
pub struct Session<T: Transport> {
    shared: Arc<Shared<T>>,
    events: JoinHandle<()>,
}

impl<T: Transport> Session<T> {
    /// Register for connect events and bring up the radio stack.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn new(transport: Arc<T>, config: ConnectionConfig) -> Result<Self> {
        let shared = Arc::new(Shared {
            transport: transport.clone(),
            config,
            state: Mutex::new(SessionState::empty()),
        });

        let (event_sender, event_receiver) = mpsc::unbounded_channel();
        transport.set_connect_handler(Box::new(move |device: T::Device, connected: bool| {
            let _ = event_sender.send(ConnectEvent { device, connected });
        }));
        let events = tokio::spawn(run_connect_events(
            Arc::downgrade(&shared),
            event_receiver,
        ));

        if let Err(e) = transport.enable().await {
            events.abort();
            return Err(MonocleError::StackUnavailable(e));
        }

        Ok(Self { shared, events })
    }

    /// Connect to the first device advertising the UART service under the
    /// configured name. A zero `timeout` waits forever.
    pub async fn connect_to_any(&self, timeout: Duration) -> Result<()> {
        let filter = ScanFilter::named(
            self.shared.config.service_uuid,
            self.shared.config.device_name.clone(),
        );
        self.connect(filter, timeout).await
    }

    /// Connect to the device with this address once it is seen advertising
    pub async fn connect_to_address(&self, address: DeviceAddress, timeout: Duration) -> Result<()> {
        let filter = ScanFilter::address(self.shared.config.service_uuid, address);
        self.connect(filter, timeout).await
    }

    /// Scan until `filter` accepts an advertisement, then connect and discover.
    ///
    /// The session lock is held throughout, so only one attempt runs at a time.
    /// If discovery fails the device stays tracked but the session is not
    /// marked connected.
    pub async fn connect(&self, filter: ScanFilter, timeout: Duration) -> Result<()> {
        let mut state = self.shared.state.lock().await;

        let found = self.shared.scan_for(filter, timeout).await?;
        match found.local_name.as_deref() {
            Some(name) if !name.is_empty() => {
                info!("Connecting to {} ({})...", name, found.address)
            }
            _ => info!("Connecting to {}...", found.address),
        }

        let params = ConnectionParams {
            connection_timeout: self.shared.config.connection_timeout,
        };
        let device = self
            .shared
            .transport
            .connect(&found.address, params)
            .await
            .map_err(MonocleError::ConnectFailed)?;

        if let Some(previous) = state.device.take() {
            if previous.address() != device.address() {
                debug!("Dropping previous device {}", previous.address());
                if let Err(e) = previous.disconnect().await {
                    warn!("Failed to disconnect {}: {}", previous.address(), e);
                }
            }
        }
        state.track(device.clone());

        let uart = discover_uart(&device, &self.shared.config).await?;
        state.attach(uart);
        info!("Connected to {}", found.address);

        Ok(())
    }

    /// Deliver every TX notification to `callback`.
    ///
    /// The callback runs on the transport's context, concurrently with other
    /// session calls.
    pub async fn enable_tx_notifications<F>(&self, callback: F) -> Result<()>
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        let state = self.shared.state.lock().await;
        let tx = state.tx()?;

        tx.enable_notifications(Arc::new(callback))
            .await
            .map_err(MonocleError::SubscribeFailed)?;
        info!("TX notifications enabled");

        Ok(())
    }

    /// Send a text command, newlines rewritten to carriage returns.
    ///
    /// On error a prefix of the command may already have reached the device.
    pub async fn send_command(&self, command: &str) -> Result<()> {
        self.send_raw(&protocol::encode_command(command)).await
    }

    /// Send bytes as-is, chunked to the write limit
    pub async fn send_raw(&self, payload: &[u8]) -> Result<()> {
        let state = self.shared.state.lock().await;
        let rx = state.rx()?;

        let writer = match self.shared.config.max_chunk_size {
            Some(size) => ChunkedWriter::with_chunk_size(rx, size),
            None => ChunkedWriter::new(rx),
        };
        let writes = writer.write_all(payload).await?;
        debug!("Sent {} bytes in {} writes", payload.len(), writes);

        Ok(())
    }

    /// Disconnect from the current device and forget it
    pub async fn disconnect(&self) {
        let mut state = self.shared.state.lock().await;
        let Some(device) = state.device.take() else {
            return;
        };
        *state = SessionState::empty();

        if let Err(e) = device.disconnect().await {
            warn!("Failed to disconnect {}: {}", device.address(), e);
        }
        info!("Disconnected from {}", device.address());
    }

    pub async fn is_connected(&self) -> bool {
        self.shared.state.lock().await.connected
    }

    /// Address of the device the session is tracking, connected or not
    pub async fn tracked_address(&self) -> Option<DeviceAddress> {
        self.shared
            .state
            .lock()
            .await
            .device
            .as_ref()
            .map(|d| d.address())
    }
}

impl<T: Transport> Drop for Session<T> {
    fn drop(&mut self) {
        self.events.abort();
    }
}

impl<T: Transport> Shared<T> {
    /// Run one scan until `filter` accepts a result or `timeout` elapses.
    async fn scan_for(&self, filter: ScanFilter, timeout: Duration) -> Result<ScanResult> {
        let (found_sender, mut found) = oneshot::channel();
        // The callback owns the slot. If the transport drops the callback the
        // sender goes with it and `found` resolves with an error.
        let slot: Arc<ScanSlot> = Arc::new(StdMutex::new(Some(found_sender)));
        let watch = Arc::downgrade(&slot);

        let callback: ScanCallback = Arc::new(move |event: ScanEvent| {
            let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_none() {
                return;
            }
            let outcome = match event {
                ScanEvent::Advertisement(result) => {
                    trace!(
                        "Scan found {:?} at {} (rssi {:?})",
                        result.local_name,
                        result.address,
                        result.rssi
                    );
                    if !filter.matches(&result) {
                        return;
                    }
                    Ok(result)
                }
                ScanEvent::Failed(e) => Err(e),
            };
            if let Some(sender) = slot.take() {
                let _ = sender.send(outcome);
            }
        });

        info!("Starting scan");
        self.transport
            .scan(callback)
            .await
            .map_err(MonocleError::ScanFailed)?;

        let deadline = async {
            if timeout.is_zero() {
                future::pending::<()>().await
            } else {
                tokio::time::sleep(timeout).await
            }
        };

        let outcome = tokio::select! {
            biased;
            outcome = &mut found => outcome,
            _ = deadline => {
                let pending = match watch.upgrade() {
                    Some(slot) => slot.lock().unwrap_or_else(PoisonError::into_inner).take(),
                    None => None,
                };
                if pending.is_some() {
                    self.stop_scan().await;
                    return Err(MonocleError::Timeout(timeout));
                }
                // accepted in the same instant the deadline fired
                found.await
            }
        };
        self.stop_scan().await;

        match outcome {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(MonocleError::ScanFailed(e)),
            Err(_) => Err(MonocleError::ScanFailed(TransportError::Gatt(
                "scan stopped before a matching device was found".to_string(),
            ))),
        }
    }

    async fn stop_scan(&self) {
        if let Err(e) = self.transport.stop_scan().await {
            warn!("Failed to stop the scan: {}", e);
        }
    }

    /// Apply a connect/disconnect reported by the transport.
    ///
    /// Only events for the tracked device count. Events are applied after any
    /// in-flight foreground operation releases the lock, so a rediscovery here
    /// replaces whatever handles that operation stored.
    async fn handle_connect_event(&self, device: T::Device, connected: bool) {
        let address = device.address();
        debug!("Connect event for {}: connected={}", address, connected);

        let mut state = self.state.lock().await;
        let Some(tracked) = state.device.as_ref() else {
            return;
        };
        if tracked.address() != address {
            return;
        }

        if connected {
            state.track(device.clone());
            match discover_uart(&device, &self.config).await {
                Ok(uart) => {
                    state.attach(uart);
                    info!("Device {} reconnected", address);
                }
                Err(e) => warn!("Rediscovery on {} failed: {}", address, e),
            }
        } else {
            state.connected = false;
            info!("Device {} disconnected", address);
        }
    }
}

async fn run_connect_events<T: Transport>(
    shared: Weak<Shared<T>>,
    mut events: mpsc::UnboundedReceiver<ConnectEvent<T::Device>>,
) {
    while let Some(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared
            .handle_connect_event(event.device, event.connected)
            .await;
    }
}
