//! Bluetooth Module
//!
//! Provides BLE communication with the Monocle over the Nordic UART Service.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                        Session                           │
//! │  (Main coordinator - public API for the application)     │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼─────────────┬──────────────┐
//!         │             │             │              │
//!         ▼             ▼             ▼              ▼
//! ┌───────────┐  ┌────────────┐  ┌──────────┐  ┌───────────┐
//! │  Scanner  │  │ Connection │  │  Writer  │  │ Transport │
//! │           │  │            │  │          │  │           │
//! │ - Scan    │  │ - GATT     │  │ - MTU    │  │ - btleplug│
//! │   filter  │  │   discovery│  │   chunks │  │ - WinRT   │
//! └───────────┘  └────────────┘  └──────────┘  └───────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - UUIDs, device name and command encoding
//! - [`scanner`] - Advertisement filtering
//! - [`connection`] - Connection settings and UART service discovery
//! - [`writer`] - Chunked writes without response
//! - [`transport`] - Traits a platform BLE backend implements
//! - [`session`] - Main session coordinator
//! - [`subscriptions`] - Notification subscriptions a backend cancels on resubscribe or disconnect

pub mod connection;
pub mod protocol;
pub mod scanner;
pub mod session;
pub mod subscriptions;
pub mod transport;
pub mod writer;

#[cfg(not(windows))]
pub mod btle;
#[cfg(windows)]
pub mod winrt;

#[cfg(test)]
pub(crate) mod fake;

// Re-export main session for convenience
pub use session::Session;

/// BLE backend for the current platform
#[cfg(not(windows))]
pub type PlatformTransport = btle::BtleplugTransport;
/// BLE backend for the current platform
#[cfg(windows)]
pub type PlatformTransport = winrt::WinRtTransport;
