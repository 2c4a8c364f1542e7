//! Monocle UART Protocol
//!
//! This module contains the identifiers and byte-level conventions for talking
//! to the Monocle over the Nordic UART Service.

use uuid::Uuid;

/// Nordic UART Service UUID
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);

/// RX Characteristic UUID - host writes here, the device reads it as serial input
pub const RX_CHAR_UUID: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);

/// TX Characteristic UUID - the device notifies here with its serial output
pub const TX_CHAR_UUID: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

/// Local name the Monocle advertises
pub const DEVICE_NAME: &str = "monocle";

/// Largest payload a single write without response may carry
pub const MAX_WRITE_SIZE: usize = 20;

/// Ctrl-C followed by a carriage return: interrupts whatever the firmware is running
pub const INTERRUPT_SEQUENCE: &[u8] = &[0x03, 0x0d];

/// Rewrite a text command into the bytes the firmware expects.
///
/// The firmware terminates lines with carriage returns, so every `\n` becomes `\r`.
/// Nothing else is touched.
pub fn encode_command(command: &str) -> Vec<u8> {
    command.replace('\n', "\r").into_bytes()
}
