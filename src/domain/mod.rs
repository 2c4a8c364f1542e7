//! Domain types: addresses and scan results, persisted settings, and the
//! scripts uploaded to the device.

pub mod models;
pub mod scripts;
pub mod settings;
