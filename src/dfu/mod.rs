//! Nordic Legacy DFU over BLE for nRF51/nRF52 peripherals.
//!
//! This module implements the legacy (SDK 11 and earlier) DFU service,
//! including the buttonless jump from application firmware into the
//! bootloader.
//!
//! # Protocol Overview
//!
//! An update consists of:
//! 1. **Discovery** - Resolve the target from BLE advertisements (or connect
//!    directly by address)
//! 2. **Buttonless Jump** - If the device runs the application, ask it to
//!    reboot into the bootloader and find it again
//! 3. **Start DFU** - Announce the image type and the `[sd, bl, app]` sizes
//! 4. **Init Transfer** - Send the init packet (`.dat`)
//! 5. **Firmware Transfer** - Stream the binary (`.bin`) under packet
//!    receipt flow control
//! 6. **Validation** - The bootloader checks the received image
//! 7. **Activation** - The bootloader applies the image and resets
//!
//! # Example
//!
//! ```ignore
//! use nrf_legacy_dfu::dfu::{BtleplugTransport, DfuUpdater, TargetSpec};
//! use nrf_legacy_dfu::settings::DfuConfig;
//!
//! let config = DfuConfig::default();
//! let transport = BtleplugTransport::new(Some("hci0")).await?;
//! let updater = DfuUpdater::new(transport, config.clone());
//!
//! let target = TargetSpec::from_config(["MyDevice"], &config);
//! let report = updater.update_from_file("firmware.zip", &[target]).await?;
//! println!("Updated {} in {}s", report.device.display_label(), report.duration().num_seconds());
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod firmware_reader;
pub mod packet;
pub mod protocol;
pub mod session;
pub mod transport;

#[cfg(feature = "btleplug")]
pub mod ble;

// Discovery
pub use device::{DeviceScanner, ResolvedDevice, TargetSpec};

// Errors
pub use error::{DfuError, DfuFailure, DfuResult, ErrorKind};

// Progress events
pub use events::{ChannelObserver, DfuEvent, DfuObserver, DfuState, NullObserver, TracingObserver};

// Firmware reading
pub use firmware_reader::{load_package, read_firmware_zip, FirmwareImage, FirmwarePackage};

// Engine and orchestration
pub use protocol::DfuEngine;
pub use session::{DfuUpdater, ImageReport, SessionReport};

// Transport boundary
pub use transport::{Advertisement, BleConnection, BleTransport};

#[cfg(feature = "btleplug")]
pub use ble::{BtleplugConnection, BtleplugTransport};
