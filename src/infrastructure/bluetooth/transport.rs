//! BLE Transport Module
//!
//! The seam between the session logic and a platform BLE stack. A backend
//! implements [`Transport`] plus the handle traits for devices, services and
//! characteristics it hands out.

use crate::domain::models::{DeviceAddress, ScanResult};
use crate::infrastructure::bluetooth::protocol;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised by a BLE backend.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("no bluetooth adapter available")]
    NoAdapter,

    #[error("device {0} is not known to the adapter")]
    UnknownDevice(DeviceAddress),

    #[error("device is not connected")]
    Disconnected,

    #[error("operation timed out after {0:?}")]
    TimedOut(Duration),

    #[error("gatt operation failed: {0}")]
    Gatt(String),

    #[error(transparent)]
    Backend(Box<dyn std::error::Error + Send + Sync>),
}

impl TransportError {
    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Backend(Box::new(err))
    }
}

/// Something the scanner reports while a scan is active
#[derive(Debug)]
pub enum ScanEvent {
    Advertisement(ScanResult),
    /// The scan died after it was started
    Failed(TransportError),
}

/// Invoked once per [`ScanEvent`] until the scan is stopped
pub type ScanCallback = Arc<dyn Fn(ScanEvent) + Send + Sync>;

/// Invoked with the raw payload of each inbound notification
pub type NotificationCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Invoked whenever any device connects (`true`) or disconnects (`false`)
pub type ConnectHandler<D> = Box<dyn Fn(D, bool) + Send + Sync>;

/// Parameters handed to [`Transport::connect`]
#[derive(Debug, Clone, Default)]
pub struct ConnectionParams {
    /// Give up on the link if it is not up within this window
    pub connection_timeout: Option<Duration>,
}

/// Platform BLE adapter.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Device: Device;

    /// Bring up the radio stack
    async fn enable(&self) -> Result<(), TransportError>;

    /// Start scanning. Returns once the scan is running; results arrive
    /// through `callback` on the backend's own task.
    async fn scan(&self, callback: ScanCallback) -> Result<(), TransportError>;

    /// Stop an active scan. Stopping when idle is not an error.
    async fn stop_scan(&self) -> Result<(), TransportError>;

    async fn connect(
        &self,
        address: &DeviceAddress,
        params: ConnectionParams,
    ) -> Result<Self::Device, TransportError>;

    /// Register the connect/disconnect observer, replacing any previous one
    fn set_connect_handler(&self, handler: ConnectHandler<Self::Device>);
}

/// A connected (or previously connected) peripheral.
#[async_trait]
pub trait Device: Clone + fmt::Debug + Send + Sync + 'static {
    type Service: GattService<Characteristic = Self::Characteristic>;
    type Characteristic: GattCharacteristic;

    fn address(&self) -> DeviceAddress;

    /// Services whose UUID is in `uuids`, in no particular order
    async fn discover_services(&self, uuids: &[Uuid]) -> Result<Vec<Self::Service>, TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait GattService: Send + Sync + 'static {
    type Characteristic: GattCharacteristic;

    fn uuid(&self) -> Uuid;

    /// Characteristics whose UUID is in `uuids`, in no particular order
    async fn discover_characteristics(
        &self,
        uuids: &[Uuid],
    ) -> Result<Vec<Self::Characteristic>, TransportError>;
}

#[async_trait]
pub trait GattCharacteristic: Clone + fmt::Debug + Send + Sync + 'static {
    fn uuid(&self) -> Uuid;

    /// Largest payload accepted by [`GattCharacteristic::write_without_response`]
    fn max_write_size(&self) -> usize {
        protocol::MAX_WRITE_SIZE
    }

    /// Best-effort write; returns the number of bytes handed to the stack
    async fn write_without_response(&self, data: &[u8]) -> Result<usize, TransportError>;

    async fn enable_notifications(
        &self,
        callback: NotificationCallback,
    ) -> Result<(), TransportError>;
}

/// Characteristic handle type produced by a transport's devices
pub type CharacteristicOf<T> = <<T as Transport>::Device as Device>::Characteristic;
