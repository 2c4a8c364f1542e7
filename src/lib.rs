//! Scan for, connect to and script a Monocle display over the Nordic UART
//! Service.
//!
//! [`Session`] owns the link and is generic over a [`Transport`] backend;
//! [`PlatformTransport`] is the one for the current OS. [`Driver`] layers the
//! interrupt/upload/liveness flow of the `monocle` binary on top.

pub mod domain;
pub mod driver;
pub mod error;
pub mod infrastructure;

pub use domain::models::{DeviceAddress, ScanResult};
pub use domain::settings::{LivenessPolicy, Settings, SettingsService};
pub use driver::{Driver, DriverOptions, LineAssembler};
pub use error::{MonocleError, Result};
pub use infrastructure::bluetooth::connection::ConnectionConfig;
pub use infrastructure::bluetooth::scanner::{ScanFilter, ScanMode};
pub use infrastructure::bluetooth::transport::Transport;
pub use infrastructure::bluetooth::{PlatformTransport, Session};
