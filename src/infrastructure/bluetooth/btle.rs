//! btleplug Backend
//!
//! [`Transport`] implementation over `btleplug`, used on Linux (BlueZ) and
//! macOS (CoreBluetooth).

use crate::domain::models::{DeviceAddress, ScanResult};
use crate::infrastructure::bluetooth::subscriptions::Subscriptions;
use crate::infrastructure::bluetooth::transport::{
    ConnectHandler, ConnectionParams, Device, GattCharacteristic, GattService,
    NotificationCallback, ScanCallback, ScanEvent, Transport, TransportError,
};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, PeripheralProperties,
    ScanFilter as AdapterScanFilter, Service, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

impl From<btleplug::Error> for TransportError {
    fn from(err: btleplug::Error) -> Self {
        match err {
            btleplug::Error::NotConnected => Self::Disconnected,
            btleplug::Error::TimedOut(duration) => Self::TimedOut(duration),
            other => Self::backend(other),
        }
    }
}

type SharedConnectHandler = Arc<RwLock<Option<ConnectHandler<BtleplugDevice>>>>;
/// Notification forwarding tasks per peripheral characteristic
type NotificationTasks = Subscriptions<(PeripheralId, Uuid), JoinHandle<()>>;

/// BLE backend backed by `btleplug`.
#[derive(Default)]
pub struct BtleplugTransport {
    adapter: OnceLock<Adapter>,
    connect_handler: SharedConnectHandler,
    scan_task: Mutex<Option<JoinHandle<()>>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
    notifications: NotificationTasks,
}

impl BtleplugTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn adapter(&self) -> Result<&Adapter, TransportError> {
        self.adapter.get().ok_or(TransportError::NoAdapter)
    }

    /// Forward adapter connect/disconnect events to the registered handler
    async fn watch_connections(&self, adapter: &Adapter) -> Result<(), TransportError> {
        let mut events = adapter.events().await?;
        let adapter = adapter.clone();
        let handler = self.connect_handler.clone();
        let notifications = self.notifications.clone();

        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let (id, connected) = match event {
                    CentralEvent::DeviceConnected(id) => (id, true),
                    CentralEvent::DeviceDisconnected(id) => (id, false),
                    _ => continue,
                };
                let peripheral = match adapter.peripheral(&id).await {
                    Ok(peripheral) => peripheral,
                    Err(e) => {
                        debug!("Connect event for unknown peripheral {:?}: {}", id, e);
                        continue;
                    }
                };
                let device = BtleplugDevice::new(peripheral, notifications.clone());
                let guard = handler.read().unwrap_or_else(PoisonError::into_inner);
                if let Some(handler) = guard.as_ref() {
                    handler(device, connected);
                }
            }
        });

        if let Some(previous) = self
            .event_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task)
        {
            previous.abort();
        }
        Ok(())
    }

    async fn find_peripheral(&self, address: &DeviceAddress) -> Result<Peripheral, TransportError> {
        let peripherals = self.adapter()?.peripherals().await?;
        peripherals
            .into_iter()
            .find(|p| &device_address(p) == address)
            .ok_or_else(|| TransportError::UnknownDevice(address.clone()))
    }
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        for slot in [&self.scan_task, &self.event_task] {
            if let Some(task) = slot.lock().unwrap_or_else(PoisonError::into_inner).take() {
                task.abort();
            }
        }
        self.notifications.cancel_all();
    }
}

#[async_trait]
impl Transport for BtleplugTransport {
    type Device = BtleplugDevice;

    async fn enable(&self) -> Result<(), TransportError> {
        if self.adapter.get().is_some() {
            return Ok(());
        }

        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(TransportError::NoAdapter)?;
        info!("Using adapter {}", adapter.adapter_info().await?);

        self.watch_connections(&adapter).await?;
        // a concurrent enable may have won; either adapter is fine
        let _ = self.adapter.set(adapter);
        Ok(())
    }

    async fn scan(&self, callback: ScanCallback) -> Result<(), TransportError> {
        let adapter = self.adapter()?.clone();
        let mut events = adapter.events().await?;
        adapter.start_scan(AdapterScanFilter::default()).await?;
        debug!("Adapter scan started");

        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id)
                    | CentralEvent::DeviceUpdated(id)
                    | CentralEvent::ServicesAdvertisement { id, .. } => id,
                    _ => continue,
                };
                match scan_result(&adapter, &id).await {
                    Ok(Some(result)) => callback(ScanEvent::Advertisement(result)),
                    Ok(None) => trace!("No properties yet for {:?}", id),
                    Err(e) => debug!("Skipping {:?}: {}", id, e),
                }
            }
            // stop_scan aborts this task, so getting here means the adapter went away
            callback(ScanEvent::Failed(TransportError::Gatt(
                "adapter event stream closed".to_string(),
            )));
        });

        if let Some(previous) = self
            .scan_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task)
        {
            previous.abort();
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        let task = self
            .scan_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(task) = task else {
            return Ok(());
        };
        task.abort();
        self.adapter()?.stop_scan().await?;
        debug!("Adapter scan stopped");
        Ok(())
    }

    async fn connect(
        &self,
        address: &DeviceAddress,
        params: ConnectionParams,
    ) -> Result<BtleplugDevice, TransportError> {
        let peripheral = self.find_peripheral(address).await?;

        if !peripheral.is_connected().await? {
            match params.connection_timeout {
                Some(limit) => tokio::time::timeout(limit, peripheral.connect())
                    .await
                    .map_err(|_| TransportError::TimedOut(limit))??,
                None => peripheral.connect().await?,
            }
        }

        Ok(BtleplugDevice::new(peripheral, self.notifications.clone()))
    }

    fn set_connect_handler(&self, handler: ConnectHandler<BtleplugDevice>) {
        *self
            .connect_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }
}

async fn scan_result(
    adapter: &Adapter,
    id: &PeripheralId,
) -> Result<Option<ScanResult>, TransportError> {
    let peripheral = adapter.peripheral(id).await?;
    let Some(properties) = peripheral.properties().await? else {
        return Ok(None);
    };
    Ok(Some(to_scan_result(device_address(&peripheral), properties)))
}

fn to_scan_result(address: DeviceAddress, properties: PeripheralProperties) -> ScanResult {
    ScanResult {
        address,
        local_name: properties.local_name,
        service_uuids: properties.services,
        rssi: properties.rssi,
    }
}

/// MAC address where the platform reports one, the peripheral id otherwise
fn device_address(peripheral: &Peripheral) -> DeviceAddress {
    let mac = peripheral.address();
    if mac.into_inner() == [0; 6] {
        DeviceAddress::new(peripheral.id().to_string())
    } else {
        DeviceAddress::new(mac.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct BtleplugDevice {
    peripheral: Peripheral,
    address: DeviceAddress,
    notifications: NotificationTasks,
}

impl BtleplugDevice {
    fn new(peripheral: Peripheral, notifications: NotificationTasks) -> Self {
        let address = device_address(&peripheral);
        Self {
            peripheral,
            address,
            notifications,
        }
    }
}

#[async_trait]
impl Device for BtleplugDevice {
    type Service = BtleplugService;
    type Characteristic = BtleplugCharacteristic;

    fn address(&self) -> DeviceAddress {
        self.address.clone()
    }

    async fn discover_services(
        &self,
        uuids: &[Uuid],
    ) -> Result<Vec<BtleplugService>, TransportError> {
        self.peripheral.discover_services().await?;
        Ok(self
            .peripheral
            .services()
            .into_iter()
            .filter(|s| uuids.contains(&s.uuid))
            .map(|service| BtleplugService {
                peripheral: self.peripheral.clone(),
                service,
                notifications: self.notifications.clone(),
            })
            .collect())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let id = self.peripheral.id();
        self.notifications.cancel_where(|(peripheral, _)| *peripheral == id);
        if self.peripheral.is_connected().await? {
            self.peripheral.disconnect().await?;
        }
        Ok(())
    }
}

pub struct BtleplugService {
    peripheral: Peripheral,
    service: Service,
    notifications: NotificationTasks,
}

#[async_trait]
impl GattService for BtleplugService {
    type Characteristic = BtleplugCharacteristic;

    fn uuid(&self) -> Uuid {
        self.service.uuid
    }

    async fn discover_characteristics(
        &self,
        uuids: &[Uuid],
    ) -> Result<Vec<BtleplugCharacteristic>, TransportError> {
        // btleplug resolves characteristics together with the services
        Ok(self
            .service
            .characteristics
            .iter()
            .filter(|c| uuids.contains(&c.uuid))
            .map(|characteristic| BtleplugCharacteristic {
                peripheral: self.peripheral.clone(),
                characteristic: characteristic.clone(),
                notifications: self.notifications.clone(),
            })
            .collect())
    }
}

#[derive(Debug, Clone)]
pub struct BtleplugCharacteristic {
    peripheral: Peripheral,
    characteristic: Characteristic,
    notifications: NotificationTasks,
}

#[async_trait]
impl GattCharacteristic for BtleplugCharacteristic {
    fn uuid(&self) -> Uuid {
        self.characteristic.uuid
    }

    async fn write_without_response(&self, data: &[u8]) -> Result<usize, TransportError> {
        self.peripheral
            .write(&self.characteristic, data, WriteType::WithoutResponse)
            .await?;
        Ok(data.len())
    }

    async fn enable_notifications(
        &self,
        callback: NotificationCallback,
    ) -> Result<(), TransportError> {
        let mut notifications = self.peripheral.notifications().await?;
        self.peripheral.subscribe(&self.characteristic).await?;

        let uuid = self.characteristic.uuid;
        let task = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != uuid {
                    continue;
                }
                callback(&notification.value);
            }
            warn!("Notification stream for {} closed", uuid);
        });
        // the peripheral's stream outlives a reconnect; only one forwarder may feed the callback
        self.notifications.replace((self.peripheral.id(), uuid), task);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::protocol::SERVICE_UUID;

    #[test]
    fn test_properties_map_to_scan_result() {
        let properties = PeripheralProperties {
            local_name: Some("monocle".to_string()),
            services: vec![SERVICE_UUID],
            rssi: Some(-48),
            ..Default::default()
        };

        let result = to_scan_result(DeviceAddress::new("c0:ff:ee:00:00:01"), properties);
        assert_eq!(result.address.as_str(), "C0:FF:EE:00:00:01");
        assert_eq!(result.local_name(), "monocle");
        assert!(result.has_service_uuid(&SERVICE_UUID));
        assert_eq!(result.rssi, Some(-48));
    }

    #[test]
    fn test_transport_errors_map() {
        assert!(matches!(
            TransportError::from(btleplug::Error::NotConnected),
            TransportError::Disconnected
        ));
        assert!(matches!(
            TransportError::from(btleplug::Error::DeviceNotFound),
            TransportError::Backend(_)
        ));
    }

    #[tokio::test]
    async fn test_unenabled_transport_has_no_adapter() {
        let transport = BtleplugTransport::new();
        let err = transport.scan(Arc::new(|_: ScanEvent| {})).await.unwrap_err();
        assert!(matches!(err, TransportError::NoAdapter));
        // stopping an idle scan is not an error
        transport.stop_scan().await.unwrap();
    }
}
