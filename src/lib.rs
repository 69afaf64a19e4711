//! Firmware updates for Nordic nRF51/nRF52 peripherals over the Legacy DFU
//! BLE service.
//!
//! The [`dfu`] module holds the package loader, device scanner, protocol
//! engine and the [`DfuUpdater`] that sequences them. [`settings`] provides
//! the configuration surface and its JSON persistence.

pub mod dfu;
pub mod settings;

#[cfg(test)]
mod test_helpers;

pub use dfu::{DfuEvent, DfuFailure, DfuObserver, DfuUpdater, SessionReport, TargetSpec};
pub use settings::{DfuConfig, SettingsManager};
