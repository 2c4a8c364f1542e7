//! WinRT Backend
//!
//! [`Transport`] implementation over the Windows Runtime Bluetooth APIs.

use crate::domain::models::{DeviceAddress, ScanResult};
use crate::infrastructure::bluetooth::subscriptions::{Subscription, Subscriptions};
use crate::infrastructure::bluetooth::transport::{
    ConnectHandler, ConnectionParams, Device, GattCharacteristic, GattService,
    NotificationCallback, ScanCallback, ScanEvent, Transport, TransportError,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;
use windows::core::{Ref, GUID};
use windows::Devices::Bluetooth::Advertisement::{
    BluetoothLEAdvertisementReceivedEventArgs, BluetoothLEAdvertisementWatcher,
    BluetoothLEAdvertisementWatcherStoppedEventArgs, BluetoothLEScanningMode,
};
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic as WinGattCharacteristic,
    GattClientCharacteristicConfigurationDescriptorValue, GattCommunicationStatus,
    GattDeviceService, GattSession, GattValueChangedEventArgs, GattWriteOption,
};
use windows::Devices::Bluetooth::{
    BluetoothAdapter, BluetoothConnectionStatus, BluetoothError, BluetoothLEDevice,
};
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::{DataReader, DataWriter};

impl From<windows::core::Error> for TransportError {
    fn from(err: windows::core::Error) -> Self {
        Self::backend(err)
    }
}

fn to_guid(uuid: Uuid) -> GUID {
    GUID::from_u128(uuid.as_u128())
}

fn to_uuid(guid: GUID) -> Uuid {
    Uuid::from_u128(guid.to_u128())
}

fn check_status(status: GattCommunicationStatus, what: &str) -> Result<(), TransportError> {
    if status == GattCommunicationStatus::Success {
        Ok(())
    } else {
        Err(TransportError::Gatt(format!("{} failed: {:?}", what, status)))
    }
}

type SharedConnectHandler = Arc<RwLock<Option<ConnectHandler<WinRtDevice>>>>;
type GattSessions = Arc<Mutex<HashMap<DeviceAddress, GattSession>>>;
type ValueChangedHandlers = Subscriptions<(DeviceAddress, Uuid), ValueChangedToken>;

/// A registered `ValueChanged` handler
pub struct ValueChangedToken {
    characteristic: WinGattCharacteristic,
    token: i64,
}

impl Subscription for ValueChangedToken {
    fn cancel(self) {
        if let Err(e) = self.characteristic.RemoveValueChanged(self.token) {
            debug!("Failed to remove ValueChanged handler: {}", e);
        }
    }
}

/// BLE backend backed by the WinRT `Windows.Devices.Bluetooth` namespace.
#[derive(Default)]
pub struct WinRtTransport {
    watcher: Mutex<Option<BluetoothLEAdvertisementWatcher>>,
    connect_handler: SharedConnectHandler,
    // Keeps MaintainConnection sessions alive until the device is disconnected
    sessions: GattSessions,
    notifications: ValueChangedHandlers,
}

impl WinRtTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn take_watcher(&self) -> Option<BluetoothLEAdvertisementWatcher> {
        self.watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    async fn open_device(&self, mac: u64) -> Result<BluetoothLEDevice, TransportError> {
        Ok(BluetoothLEDevice::FromBluetoothAddressAsync(mac)?.await?)
    }

    /// Ask Windows to keep the link up while the session is held
    async fn maintain_connection(&self, device: &BluetoothLEDevice) -> Result<GattSession, TransportError> {
        let device_id = device.BluetoothDeviceId()?;
        let session = GattSession::FromDeviceIdAsync(&device_id)?.await?;
        session.SetMaintainConnection(true)?;
        Ok(session)
    }

    fn watch_connection_status(&self, device: &BluetoothLEDevice) -> Result<(), TransportError> {
        let handler = self.connect_handler.clone();
        let sessions = self.sessions.clone();
        let notifications = self.notifications.clone();

        device.ConnectionStatusChanged(&TypedEventHandler::new(
            move |dev: Ref<BluetoothLEDevice>, _| {
                if let Some(dev) = dev.as_ref() {
                    let connected = dev.ConnectionStatus()? == BluetoothConnectionStatus::Connected;
                    let device =
                        WinRtDevice::new(dev.clone(), sessions.clone(), notifications.clone())?;
                    let guard = handler.read().unwrap_or_else(PoisonError::into_inner);
                    if let Some(handler) = guard.as_ref() {
                        handler(device, connected);
                    }
                }
                Ok(())
            },
        ))?;
        Ok(())
    }
}

impl Drop for WinRtTransport {
    fn drop(&mut self) {
        if let Some(watcher) = self.take_watcher() {
            let _ = watcher.Stop();
        }
        self.notifications.cancel_all();
    }
}

#[async_trait]
impl Transport for WinRtTransport {
    type Device = WinRtDevice;

    async fn enable(&self) -> Result<(), TransportError> {
        let adapter = BluetoothAdapter::GetDefaultAsync()?.await?;
        if !adapter.IsLowEnergySupported()? {
            return Err(TransportError::NoAdapter);
        }
        info!(
            "Using adapter {}",
            DeviceAddress::from_mac(adapter.BluetoothAddress()?)
        );
        Ok(())
    }

    async fn scan(&self, callback: ScanCallback) -> Result<(), TransportError> {
        if let Some(previous) = self.take_watcher() {
            previous.Stop()?;
        }

        let watcher = BluetoothLEAdvertisementWatcher::new()?;
        watcher.SetScanningMode(BluetoothLEScanningMode::Active)?;

        let on_advert = callback.clone();
        watcher.Received(&TypedEventHandler::new(
            move |_: Ref<BluetoothLEAdvertisementWatcher>,
                  args: Ref<BluetoothLEAdvertisementReceivedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    on_advert(ScanEvent::Advertisement(scan_result(args)?));
                }
                Ok(())
            },
        ))?;

        watcher.Stopped(&TypedEventHandler::new(
            move |_: Ref<BluetoothLEAdvertisementWatcher>,
                  args: Ref<BluetoothLEAdvertisementWatcherStoppedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let error = args.Error()?;
                    // a stop we asked for reports Success
                    if error != BluetoothError::Success {
                        callback(ScanEvent::Failed(TransportError::Gatt(format!(
                            "advertisement watcher stopped: {:?}",
                            error
                        ))));
                    }
                }
                Ok(())
            },
        ))?;

        watcher.Start()?;
        debug!("Advertisement watcher started");

        *self.watcher.lock().unwrap_or_else(PoisonError::into_inner) = Some(watcher);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        if let Some(watcher) = self.take_watcher() {
            watcher.Stop()?;
            debug!("Advertisement watcher stopped");
        }
        Ok(())
    }

    async fn connect(
        &self,
        address: &DeviceAddress,
        params: ConnectionParams,
    ) -> Result<WinRtDevice, TransportError> {
        let mac = address
            .to_mac()
            .ok_or_else(|| TransportError::UnknownDevice(address.clone()))?;

        let device = match params.connection_timeout {
            Some(limit) => tokio::time::timeout(limit, self.open_device(mac))
                .await
                .map_err(|_| TransportError::TimedOut(limit))??,
            None => self.open_device(mac).await?,
        };

        match self.maintain_connection(&device).await {
            Ok(session) => {
                self.sessions
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(address.clone(), session);
            }
            Err(e) => warn!("Failed to create GattSession for {}: {}", address, e),
        }

        self.watch_connection_status(&device)?;
        Ok(WinRtDevice::new(
            device,
            self.sessions.clone(),
            self.notifications.clone(),
        )?)
    }

    fn set_connect_handler(&self, handler: ConnectHandler<WinRtDevice>) {
        *self
            .connect_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }
}

fn scan_result(
    args: &BluetoothLEAdvertisementReceivedEventArgs,
) -> windows::core::Result<ScanResult> {
    let advertisement = args.Advertisement()?;
    let uuids = advertisement.ServiceUuids()?;

    let mut service_uuids = Vec::with_capacity(uuids.Size()? as usize);
    for i in 0..uuids.Size()? {
        service_uuids.push(to_uuid(uuids.GetAt(i)?));
    }

    let mut result = ScanResult::new(DeviceAddress::from_mac(args.BluetoothAddress()?))
        .with_rssi(args.RawSignalStrengthInDBm()?);
    result.service_uuids = service_uuids;

    let name = advertisement.LocalName()?.to_string();
    if !name.is_empty() {
        result = result.with_local_name(name);
    }
    Ok(result)
}

#[derive(Debug, Clone)]
pub struct WinRtDevice {
    device: BluetoothLEDevice,
    address: DeviceAddress,
    sessions: GattSessions,
    notifications: ValueChangedHandlers,
}

impl WinRtDevice {
    fn new(
        device: BluetoothLEDevice,
        sessions: GattSessions,
        notifications: ValueChangedHandlers,
    ) -> windows::core::Result<Self> {
        let address = DeviceAddress::from_mac(device.BluetoothAddress()?);
        Ok(Self {
            device,
            address,
            sessions,
            notifications,
        })
    }
}

#[async_trait]
impl Device for WinRtDevice {
    type Service = WinRtService;
    type Characteristic = WinRtCharacteristic;

    fn address(&self) -> DeviceAddress {
        self.address.clone()
    }

    async fn discover_services(&self, uuids: &[Uuid]) -> Result<Vec<WinRtService>, TransportError> {
        let mut found = Vec::new();
        for uuid in uuids {
            let result = self
                .device
                .GetGattServicesForUuidAsync(to_guid(*uuid))?
                .await?;
            check_status(result.Status()?, "service discovery")?;

            let services = result.Services()?;
            for i in 0..services.Size()? {
                found.push(WinRtService {
                    service: services.GetAt(i)?,
                    address: self.address.clone(),
                    notifications: self.notifications.clone(),
                });
            }
        }
        Ok(found)
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.notifications
            .cancel_where(|(address, _)| *address == self.address);
        let session = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.address);
        if let Some(session) = session {
            session.Close()?;
        }
        // WinRT drops the link once no handle holds it open
        self.device.Close()?;
        Ok(())
    }
}

pub struct WinRtService {
    service: GattDeviceService,
    address: DeviceAddress,
    notifications: ValueChangedHandlers,
}

#[async_trait]
impl GattService for WinRtService {
    type Characteristic = WinRtCharacteristic;

    fn uuid(&self) -> Uuid {
        self.service.Uuid().map(to_uuid).unwrap_or_default()
    }

    async fn discover_characteristics(
        &self,
        uuids: &[Uuid],
    ) -> Result<Vec<WinRtCharacteristic>, TransportError> {
        let access = self.service.RequestAccessAsync()?.await?;
        debug!("Service access status: {:?}", access);

        let mut found = Vec::new();
        for uuid in uuids {
            let result = self
                .service
                .GetCharacteristicsForUuidAsync(to_guid(*uuid))?
                .await?;
            check_status(result.Status()?, "characteristic discovery")?;

            let characteristics = result.Characteristics()?;
            for i in 0..characteristics.Size()? {
                found.push(WinRtCharacteristic {
                    characteristic: characteristics.GetAt(i)?,
                    uuid: *uuid,
                    address: self.address.clone(),
                    notifications: self.notifications.clone(),
                });
            }
        }
        Ok(found)
    }
}

#[derive(Debug, Clone)]
pub struct WinRtCharacteristic {
    characteristic: WinGattCharacteristic,
    uuid: Uuid,
    address: DeviceAddress,
    notifications: ValueChangedHandlers,
}

#[async_trait]
impl GattCharacteristic for WinRtCharacteristic {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    async fn write_without_response(&self, data: &[u8]) -> Result<usize, TransportError> {
        let writer = DataWriter::new()?;
        writer.WriteBytes(data)?;
        let buffer = writer.DetachBuffer()?;

        let status = self
            .characteristic
            .WriteValueWithOptionAsync(&buffer, GattWriteOption::WriteWithoutResponse)?
            .await?;
        check_status(status, "write")?;
        Ok(data.len())
    }

    async fn enable_notifications(
        &self,
        callback: NotificationCallback,
    ) -> Result<(), TransportError> {
        let token = self.characteristic.ValueChanged(&TypedEventHandler::new(
            move |_: Ref<WinGattCharacteristic>,
                  args: Ref<GattValueChangedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let value = args.CharacteristicValue()?;
                    let reader = DataReader::FromBuffer(&value)?;
                    let mut bytes = vec![0u8; reader.UnconsumedBufferLength()? as usize];
                    reader.ReadBytes(&mut bytes)?;
                    callback(&bytes);
                }
                Ok(())
            },
        ))?;
        self.notifications.replace(
            (self.address.clone(), self.uuid),
            ValueChangedToken {
                characteristic: self.characteristic.clone(),
                token,
            },
        );

        let status = self
            .characteristic
            .WriteClientCharacteristicConfigurationDescriptorAsync(
                GattClientCharacteristicConfigurationDescriptorValue::Notify,
            )?
            .await?;
        check_status(status, "notification subscription")
    }
}
