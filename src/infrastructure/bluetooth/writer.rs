//! Chunked writes over a characteristic with a fixed per-write limit.

use crate::infrastructure::bluetooth::transport::{GattCharacteristic, TransportError};
use thiserror::Error;
use tracing::trace;

/// A chunk write failed part way through a payload
#[derive(Error, Debug)]
#[error("write failed after {written} bytes: {source}")]
pub struct ChunkWriteError {
    /// Bytes already handed to the transport before the failure
    pub written: usize,
    #[source]
    pub source: TransportError,
}

/// Splits a payload into `max_chunk` sized writes without response.
pub struct ChunkedWriter<'a, C> {
    characteristic: &'a C,
    max_chunk: usize,
}

impl<'a, C: GattCharacteristic> ChunkedWriter<'a, C> {
    /// Writer bounded by the characteristic's own write limit
    pub fn new(characteristic: &'a C) -> Self {
        Self::with_chunk_size(characteristic, characteristic.max_write_size())
    }

    /// Writer with a smaller limit. Never exceeds the characteristic's own.
    pub fn with_chunk_size(characteristic: &'a C, max_chunk: usize) -> Self {
        let limit = characteristic.max_write_size().max(1);
        Self {
            characteristic,
            max_chunk: max_chunk.clamp(1, limit),
        }
    }

    /// Write the whole payload front to back, stopping at the first failure.
    ///
    /// Returns the number of writes issued. Nothing is retried, so on error the
    /// remote side may have received a prefix of `payload`.
    pub async fn write_all(&self, payload: &[u8]) -> Result<usize, ChunkWriteError> {
        let mut written = 0;
        let mut writes = 0;
        for chunk in payload.chunks(self.max_chunk) {
            trace!("Writing chunk of {} bytes at offset {}", chunk.len(), written);
            self.characteristic
                .write_without_response(chunk)
                .await
                .map_err(|source| ChunkWriteError { written, source })?;
            written += chunk.len();
            writes += 1;
        }
        Ok(writes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::fake::FakeTransport;

    #[tokio::test]
    async fn test_chunks_reconstruct_payload() {
        let fake = FakeTransport::new();
        let rx = fake.rx_characteristic();

        for len in [0usize, 1, 19, 20, 21, 40, 41, 137] {
            fake.clear_writes();
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let writes = ChunkedWriter::new(&rx).write_all(&payload).await.unwrap();

            let chunks = fake.writes();
            assert_eq!(writes, len.div_ceil(20));
            assert_eq!(chunks.len(), writes);
            assert!(chunks.iter().all(|c| !c.is_empty() && c.len() <= 20));
            assert_eq!(chunks.concat(), payload);
        }
    }

    #[tokio::test]
    async fn test_custom_chunk_size() {
        let fake = FakeTransport::new();
        let rx = fake.rx_characteristic();

        let writes = ChunkedWriter::with_chunk_size(&rx, 7)
            .write_all(b"hello monocle")
            .await
            .unwrap();
        assert_eq!(writes, 2);
        assert_eq!(fake.writes(), vec![b"hello m".to_vec(), b"onocle".to_vec()]);
    }

    #[tokio::test]
    async fn test_chunk_size_capped_by_characteristic() {
        let fake = FakeTransport::new();
        let rx = fake.rx_characteristic();

        let writes = ChunkedWriter::with_chunk_size(&rx, 64)
            .write_all(&[b'x'; 100])
            .await
            .unwrap();
        assert_eq!(writes, 5);
        assert!(fake.writes().iter().all(|c| c.len() <= rx.max_write_size()));
    }

    #[tokio::test]
    async fn test_stops_at_first_failure() {
        let fake = FakeTransport::new();
        fake.fail_write_at(1);
        let rx = fake.rx_characteristic();

        let payload = [0xAAu8; 50];
        let err = ChunkedWriter::new(&rx).write_all(&payload).await.unwrap_err();
        assert_eq!(err.written, 20);
        // only the first chunk made it out, the failed one is not retried
        assert_eq!(fake.writes(), vec![vec![0xAA; 20]]);
    }
}
