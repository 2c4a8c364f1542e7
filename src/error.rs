use crate::infrastructure::bluetooth::transport::TransportError;
use crate::infrastructure::bluetooth::writer::ChunkWriteError;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Errors returned by session operations.
#[derive(Error, Debug)]
pub enum MonocleError {
    #[error("could not enable the BLE stack: {0}")]
    StackUnavailable(#[source] TransportError),

    #[error("scan failed: {0}")]
    ScanFailed(#[source] TransportError),

    #[error("no matching device found within {0:?}")]
    Timeout(Duration),

    #[error("failed to connect: {0}")]
    ConnectFailed(#[source] TransportError),

    #[error("service discovery failed: {0}")]
    DiscoveryFailed(#[source] TransportError),

    #[error("service {0} not found on device")]
    ServiceNotFound(Uuid),

    #[error("characteristic {0} not found on device")]
    CharacteristicNotFound(Uuid),

    #[error("not connected")]
    NotConnected,

    #[error("failed to enable notifications: {0}")]
    SubscribeFailed(#[source] TransportError),

    #[error("write failed after {written} bytes: {source}")]
    WriteFailed {
        written: usize,
        #[source]
        source: TransportError,
    },
}

impl From<ChunkWriteError> for MonocleError {
    fn from(err: ChunkWriteError) -> Self {
        Self::WriteFailed {
            written: err.written,
            source: err.source,
        }
    }
}

pub type Result<T, E = MonocleError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MonocleError::Timeout(Duration::from_secs(5));
        assert_eq!(err.to_string(), "no matching device found within 5s");

        let err = MonocleError::NotConnected;
        assert_eq!(err.to_string(), "not connected");

        let err = MonocleError::WriteFailed {
            written: 40,
            source: TransportError::Disconnected,
        };
        assert_eq!(
            err.to_string(),
            "write failed after 40 bytes: device is not connected"
        );

        let err = MonocleError::ServiceNotFound(Uuid::nil());
        assert_eq!(
            err.to_string(),
            "service 00000000-0000-0000-0000-000000000000 not found on device"
        );
    }
}
