//! BLE Connection Module
//!
//! Connection settings and GATT discovery of the UART characteristic pair.

use crate::domain::settings::BleSettings;
use crate::error::{MonocleError, Result};
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::transport::{Device, GattCharacteristic, GattService};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Service UUID to look for
    pub service_uuid: Uuid,
    /// Host to device characteristic UUID
    pub rx_char_uuid: Uuid,
    /// Device to host characteristic UUID
    pub tx_char_uuid: Uuid,
    /// Advertised name required by `connect_to_any`
    pub device_name: String,
    /// Overrides the characteristic's own write limit
    pub max_chunk_size: Option<usize>,
    /// Passed down to the transport connect call
    pub connection_timeout: Option<Duration>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            service_uuid: protocol::SERVICE_UUID,
            rx_char_uuid: protocol::RX_CHAR_UUID,
            tx_char_uuid: protocol::TX_CHAR_UUID,
            device_name: protocol::DEVICE_NAME.to_string(),
            max_chunk_size: None,
            connection_timeout: None,
        }
    }
}

impl From<&BleSettings> for ConnectionConfig {
    fn from(settings: &BleSettings) -> Self {
        Self {
            service_uuid: settings.service_uuid,
            rx_char_uuid: settings.rx_char_uuid,
            tx_char_uuid: settings.tx_char_uuid,
            device_name: settings.device_name.clone(),
            max_chunk_size: Some(settings.max_chunk_size),
            connection_timeout: settings.connection_timeout_secs.map(Duration::from_secs),
        }
    }
}

/// The RX/TX pair of a discovered UART service
#[derive(Debug, Clone)]
pub struct UartCharacteristics<C> {
    pub rx: C,
    pub tx: C,
}

/// Find the UART service on `device` and both of its characteristics.
pub async fn discover_uart<D: Device>(
    device: &D,
    config: &ConnectionConfig,
) -> Result<UartCharacteristics<D::Characteristic>> {
    info!("Discovering service on {}...", device.address());

    let services = device
        .discover_services(&[config.service_uuid])
        .await
        .map_err(MonocleError::DiscoveryFailed)?;

    let service = services
        .into_iter()
        .find(|s| s.uuid() == config.service_uuid)
        .ok_or(MonocleError::ServiceNotFound(config.service_uuid))?;
    debug!("Found UART service");

    let characteristics = service
        .discover_characteristics(&[config.rx_char_uuid, config.tx_char_uuid])
        .await
        .map_err(MonocleError::DiscoveryFailed)?;
    debug!("Found {} characteristics", characteristics.len());

    let mut rx = None;
    let mut tx = None;

    for c in characteristics {
        let uuid = c.uuid();

        if uuid == config.rx_char_uuid {
            rx = Some(c);
            debug!("Found RX characteristic");
        } else if uuid == config.tx_char_uuid {
            tx = Some(c);
            debug!("Found TX characteristic");
        }
    }

    let rx = rx.ok_or(MonocleError::CharacteristicNotFound(config.rx_char_uuid))?;
    let tx = tx.ok_or(MonocleError::CharacteristicNotFound(config.tx_char_uuid))?;

    Ok(UartCharacteristics { rx, tx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::fake::FakeTransport;
    use crate::infrastructure::bluetooth::transport::{ConnectionParams, Transport};
    use crate::DeviceAddress;

    async fn connected_device(fake: &FakeTransport) -> <FakeTransport as Transport>::Device {
        fake.connect(
            &DeviceAddress::new("AA:BB:CC:DD:EE:FF"),
            ConnectionParams::default(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_discovers_pair_by_uuid() {
        let fake = FakeTransport::new();
        let device = connected_device(&fake).await;

        let uart = discover_uart(&device, &ConnectionConfig::default())
            .await
            .unwrap();
        assert_eq!(uart.rx.uuid(), protocol::RX_CHAR_UUID);
        assert_eq!(uart.tx.uuid(), protocol::TX_CHAR_UUID);
        assert_eq!(fake.discover_calls(), 1);
    }

    #[tokio::test]
    async fn test_missing_service() {
        let fake = FakeTransport::new();
        fake.set_missing_service(true);
        let device = connected_device(&fake).await;

        let err = discover_uart(&device, &ConnectionConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MonocleError::ServiceNotFound(uuid) if uuid == protocol::SERVICE_UUID));
    }

    #[tokio::test]
    async fn test_missing_characteristic() {
        let fake = FakeTransport::new();
        fake.remove_characteristic(protocol::RX_CHAR_UUID);
        let device = connected_device(&fake).await;

        let err = discover_uart(&device, &ConnectionConfig::default())
            .await
            .unwrap_err();
        assert!(
            matches!(err, MonocleError::CharacteristicNotFound(uuid) if uuid == protocol::RX_CHAR_UUID)
        );
    }

    #[test]
    fn test_config_from_settings() {
        let settings = BleSettings {
            device_name: "frame".to_string(),
            max_chunk_size: 100,
            connection_timeout_secs: Some(7),
            ..Default::default()
        };

        let config = ConnectionConfig::from(&settings);
        assert_eq!(config.device_name, "frame");
        assert_eq!(config.service_uuid, protocol::SERVICE_UUID);
        assert_eq!(config.max_chunk_size, Some(100));
        assert_eq!(config.connection_timeout, Some(Duration::from_secs(7)));
    }
}
