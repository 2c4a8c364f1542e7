//! In-memory transport used by the unit tests.
//!
//! Records every scan, connect, discovery and write so tests can assert on the
//! traffic a session produced, and lets tests inject advertisements, connect
//! events, notifications and failures.

use crate::domain::models::{DeviceAddress, ScanResult};
use crate::infrastructure::bluetooth::protocol::{RX_CHAR_UUID, SERVICE_UUID, TX_CHAR_UUID};
use crate::infrastructure::bluetooth::transport::{
    ConnectHandler, ConnectionParams, Device, GattCharacteristic, GattService,
    NotificationCallback, ScanCallback, ScanEvent, Transport, TransportError,
};
use async_trait::async_trait;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Default)]
struct FakeState {
    enable_fails: bool,
    scan_fails: bool,
    connect_fails: bool,
    missing_service: bool,
    missing_characteristics: Vec<Uuid>,
    fail_write_at: Option<usize>,

    scanning: bool,
    scan_callback: Option<ScanCallback>,
    scans_started: usize,
    stop_scan_calls: usize,
    connect_calls: Vec<DeviceAddress>,
    connect_handler: Option<ConnectHandler<FakeDevice>>,
    discover_calls: usize,
    write_attempts: usize,
    writes: Vec<Vec<u8>>,
    notification_callback: Option<NotificationCallback>,
    disconnect_calls: usize,
}

#[derive(Clone, Default)]
pub(crate) struct FakeTransport {
    state: Arc<Mutex<FakeState>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn monocle_advert(address: &str) -> ScanResult {
        ScanResult::new(DeviceAddress::new(address))
            .with_local_name("monocle")
            .with_service(SERVICE_UUID)
    }

    /// Deliver an advertisement to the active scan. Returns false if no scan is running.
    pub fn advertise(&self, result: ScanResult) -> bool {
        let callback = {
            let state = self.lock();
            if !state.scanning {
                return false;
            }
            state.scan_callback.clone()
        };
        match callback {
            Some(callback) => {
                callback(ScanEvent::Advertisement(result));
                true
            }
            None => false,
        }
    }

    pub fn fail_active_scan(&self, err: TransportError) {
        let callback = self.lock().scan_callback.clone();
        if let Some(callback) = callback {
            callback(ScanEvent::Failed(err));
        }
    }

    pub fn emit_connection(&self, address: &str, connected: bool) {
        let device = FakeDevice {
            address: DeviceAddress::new(address),
            state: self.state.clone(),
        };
        let state = self.lock();
        if let Some(handler) = state.connect_handler.as_ref() {
            handler(device, connected);
        }
    }

    pub fn notify(&self, payload: &[u8]) -> bool {
        let callback = self.lock().notification_callback.clone();
        match callback {
            Some(callback) => {
                callback(payload);
                true
            }
            None => false,
        }
    }

    pub fn rx_characteristic(&self) -> FakeCharacteristic {
        FakeCharacteristic {
            uuid: RX_CHAR_UUID,
            state: self.state.clone(),
        }
    }

    pub fn set_enable_fails(&self) {
        self.lock().enable_fails = true;
    }

    pub fn set_scan_fails(&self) {
        self.lock().scan_fails = true;
    }

    pub fn set_connect_fails(&self) {
        self.lock().connect_fails = true;
    }

    pub fn set_missing_service(&self, missing: bool) {
        self.lock().missing_service = missing;
    }

    pub fn remove_characteristic(&self, uuid: Uuid) {
        self.lock().missing_characteristics.push(uuid);
    }

    /// Fail the write attempt with this zero-based index
    pub fn fail_write_at(&self, attempt: usize) {
        self.lock().fail_write_at = Some(attempt);
    }

    pub fn is_scanning(&self) -> bool {
        self.lock().scanning
    }

    pub fn scans_started(&self) -> usize {
        self.lock().scans_started
    }

    pub fn stop_scan_calls(&self) -> usize {
        self.lock().stop_scan_calls
    }

    pub fn connect_calls(&self) -> Vec<DeviceAddress> {
        self.lock().connect_calls.clone()
    }

    pub fn discover_calls(&self) -> usize {
        self.lock().discover_calls
    }

    pub fn disconnect_calls(&self) -> usize {
        self.lock().disconnect_calls
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.lock().writes.clone()
    }

    pub fn clear_writes(&self) {
        let mut state = self.lock();
        state.writes.clear();
        state.write_attempts = 0;
    }
}

#[async_trait]
impl Transport for FakeTransport {
    type Device = FakeDevice;

    async fn enable(&self) -> Result<(), TransportError> {
        if self.lock().enable_fails {
            return Err(TransportError::NoAdapter);
        }
        Ok(())
    }

    async fn scan(&self, callback: ScanCallback) -> Result<(), TransportError> {
        let mut state = self.lock();
        if state.scan_fails {
            return Err(TransportError::Gatt("scan refused".to_string()));
        }
        state.scanning = true;
        state.scans_started += 1;
        state.scan_callback = Some(callback);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.scanning = false;
        state.scan_callback = None;
        state.stop_scan_calls += 1;
        Ok(())
    }

    async fn connect(
        &self,
        address: &DeviceAddress,
        _params: ConnectionParams,
    ) -> Result<FakeDevice, TransportError> {
        let mut state = self.lock();
        state.connect_calls.push(address.clone());
        if state.connect_fails {
            return Err(TransportError::Gatt("connection refused".to_string()));
        }
        Ok(FakeDevice {
            address: address.clone(),
            state: self.state.clone(),
        })
    }

    fn set_connect_handler(&self, handler: ConnectHandler<FakeDevice>) {
        self.lock().connect_handler = Some(handler);
    }
}

#[derive(Clone)]
pub(crate) struct FakeDevice {
    address: DeviceAddress,
    state: Arc<Mutex<FakeState>>,
}

impl fmt::Debug for FakeDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeDevice")
            .field("address", &self.address)
            .finish()
    }
}

#[async_trait]
impl Device for FakeDevice {
    type Service = FakeService;
    type Characteristic = FakeCharacteristic;

    fn address(&self) -> DeviceAddress {
        self.address.clone()
    }

    async fn discover_services(&self, uuids: &[Uuid]) -> Result<Vec<FakeService>, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.discover_calls += 1;
        if state.missing_service || !uuids.contains(&SERVICE_UUID) {
            return Ok(Vec::new());
        }
        Ok(vec![FakeService {
            state: self.state.clone(),
        }])
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.state.lock().unwrap().disconnect_calls += 1;
        Ok(())
    }
}

pub(crate) struct FakeService {
    state: Arc<Mutex<FakeState>>,
}

#[async_trait]
impl GattService for FakeService {
    type Characteristic = FakeCharacteristic;

    fn uuid(&self) -> Uuid {
        SERVICE_UUID
    }

    async fn discover_characteristics(
        &self,
        uuids: &[Uuid],
    ) -> Result<Vec<FakeCharacteristic>, TransportError> {
        let state = self.state.lock().unwrap();
        // TX first: callers must match on UUID, not position
        Ok([TX_CHAR_UUID, RX_CHAR_UUID]
            .into_iter()
            .filter(|uuid| uuids.contains(uuid))
            .filter(|uuid| !state.missing_characteristics.contains(uuid))
            .map(|uuid| FakeCharacteristic {
                uuid,
                state: self.state.clone(),
            })
            .collect())
    }
}

#[derive(Clone)]
pub(crate) struct FakeCharacteristic {
    uuid: Uuid,
    state: Arc<Mutex<FakeState>>,
}

impl fmt::Debug for FakeCharacteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeCharacteristic")
            .field("uuid", &self.uuid)
            .finish()
    }
}

#[async_trait]
impl GattCharacteristic for FakeCharacteristic {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    async fn write_without_response(&self, data: &[u8]) -> Result<usize, TransportError> {
        let mut state = self.state.lock().unwrap();
        let attempt = state.write_attempts;
        state.write_attempts += 1;
        if state.fail_write_at == Some(attempt) {
            return Err(TransportError::Disconnected);
        }
        state.writes.push(data.to_vec());
        Ok(data.len())
    }

    async fn enable_notifications(
        &self,
        callback: NotificationCallback,
    ) -> Result<(), TransportError> {
        self.state.lock().unwrap().notification_callback = Some(callback);
        Ok(())
    }
}
