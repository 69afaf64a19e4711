//! Configuration constants for the Nordic Legacy DFU protocol over BLE.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// GATT Identifiers
// ============================================================================

/// Legacy DFU service, advertised by both the buttonless application and the bootloader.
pub const DFU_SERVICE_UUID: Uuid = Uuid::from_u128(0x00001530_1212_efde_1523_785feabcd123);

/// Control point characteristic (write with response, notify).
pub const DFU_CONTROL_POINT_UUID: Uuid = Uuid::from_u128(0x00001531_1212_efde_1523_785feabcd123);

/// Packet characteristic (write without response).
pub const DFU_PACKET_UUID: Uuid = Uuid::from_u128(0x00001532_1212_efde_1523_785feabcd123);

/// DFU version characteristic (read, u16 little-endian).
pub const DFU_VERSION_UUID: Uuid = Uuid::from_u128(0x00001534_1212_efde_1523_785feabcd123);

/// DFU version reported by an application exposing the buttonless jump.
/// Bootloaders report 0x0005 and above.
pub const APPLICATION_MODE_DFU_VERSION: u16 = 0x0001;

/// Name the SDK bootloader advertises with by default.
pub const DEFAULT_BOOTLOADER_NAME: &str = "DfuTarg";

// ============================================================================
// Engine Defaults
// ============================================================================

/// Packets between receipt notifications.
pub const DEFAULT_PRN: u16 = 8;

/// Pause between the Start DFU opcode and the image size packet.
pub const DEFAULT_START_DELAY: Duration = Duration::from_millis(400);

/// Additional attempts after the first one.
pub const DEFAULT_RETRY_COUNT: u32 = 3;

/// Length of one advertisement scan window.
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for a control point response.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(20);

/// Timeout for a packet receipt notification while streaming.
pub const DEFAULT_RECEIPT_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for the Validate response (the bootloader checks the whole image).
pub const DEFAULT_VALIDATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeout for finding the bootloader after the buttonless jump.
pub const DEFAULT_RECONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause between retry attempts.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(3);

/// Time given to the application to drop the link after the jump command.
pub const JUMP_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Bound for a connect attempt to an address without scanning first.
pub const DIRECT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Packet Configuration
// ============================================================================

/// Data packet size that fits the default ATT MTU of 23.
pub const DEFAULT_PACKET_SIZE: usize = 20;

/// Largest data packet with the maximum negotiated ATT MTU of 247.
pub const MAX_PACKET_SIZE: usize = 244;

/// Bytes between two progress events while streaming.
pub const PROGRESS_REPORT_INTERVAL: u32 = 4096;

/// Advertisements buffered between the platform stack and the scanner.
pub const ADVERTISEMENT_QUEUE_DEPTH: usize = 64;

// ============================================================================
// DFU Opcodes (Legacy DFU Protocol)
// ============================================================================

/// Legacy DFU control point opcodes.
///
/// Commands are written to the control point as the opcode byte followed by
/// an optional argument; responses arrive as notifications on the same
/// characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DfuOpcode {
    /// Start DFU with image type (followed by the size packet).
    /// In application mode the same opcode requests the buttonless jump.
    StartDfu = 0x01,
    /// Initialize DFU parameters (init packet start/complete)
    InitDfuParams = 0x02,
    /// Receive firmware image (data packets follow)
    ReceiveFirmwareImage = 0x03,
    /// Validate the received firmware
    ValidateFirmware = 0x04,
    /// Activate firmware and reset device
    ActivateAndReset = 0x05,
    /// System reset
    SystemReset = 0x06,
    /// Request packet receipt notification interval
    PacketReceiptNotificationRequest = 0x08,
    /// Response from bootloader
    Response = 0x10,
    /// Packet receipt notification from bootloader
    PacketReceiptNotification = 0x11,
}

impl DfuOpcode {
    /// Parse a request opcode echoed back inside a response.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(DfuOpcode::StartDfu),
            0x02 => Some(DfuOpcode::InitDfuParams),
            0x03 => Some(DfuOpcode::ReceiveFirmwareImage),
            0x04 => Some(DfuOpcode::ValidateFirmware),
            0x05 => Some(DfuOpcode::ActivateAndReset),
            0x06 => Some(DfuOpcode::SystemReset),
            0x08 => Some(DfuOpcode::PacketReceiptNotificationRequest),
            0x10 => Some(DfuOpcode::Response),
            0x11 => Some(DfuOpcode::PacketReceiptNotification),
            _ => None,
        }
    }

    /// Short name used in logs and timeout errors.
    pub fn name(&self) -> &'static str {
        match self {
            DfuOpcode::StartDfu => "Start DFU",
            DfuOpcode::InitDfuParams => "Init DFU Params",
            DfuOpcode::ReceiveFirmwareImage => "Receive Firmware Image",
            DfuOpcode::ValidateFirmware => "Validate Firmware",
            DfuOpcode::ActivateAndReset => "Activate and Reset",
            DfuOpcode::SystemReset => "System Reset",
            DfuOpcode::PacketReceiptNotificationRequest => "PRN Request",
            DfuOpcode::Response => "Response",
            DfuOpcode::PacketReceiptNotification => "Packet Receipt Notification",
        }
    }
}

/// DFU image type (what firmware component is being updated).
///
/// Sent as a single byte in the StartDfu command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum DfuImageType {
    SoftDevice = 0x01,
    Bootloader = 0x02,
    SoftDeviceBootloader = 0x03,
    Application = 0x04,
}

impl DfuImageType {
    /// Whether this image updates the SoftDevice and/or the bootloader.
    pub fn is_system_image(&self) -> bool {
        !matches!(self, DfuImageType::Application)
    }

    pub fn label(&self) -> &'static str {
        match self {
            DfuImageType::SoftDevice => "SoftDevice",
            DfuImageType::Bootloader => "Bootloader",
            DfuImageType::SoftDeviceBootloader => "SoftDevice+Bootloader",
            DfuImageType::Application => "Application",
        }
    }
}

/// DFU response status codes from the bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DfuResponseStatus {
    Success = 0x01,
    InvalidState = 0x02,
    NotSupported = 0x03,
    DataSizeExceedsLimit = 0x04,
    CrcError = 0x05,
    OperationFailed = 0x06,
}

impl DfuResponseStatus {
    /// Parse a status code from a byte value.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(DfuResponseStatus::Success),
            0x02 => Some(DfuResponseStatus::InvalidState),
            0x03 => Some(DfuResponseStatus::NotSupported),
            0x04 => Some(DfuResponseStatus::DataSizeExceedsLimit),
            0x05 => Some(DfuResponseStatus::CrcError),
            0x06 => Some(DfuResponseStatus::OperationFailed),
            _ => None,
        }
    }

    /// Get a human-readable description.
    pub fn description(&self) -> &'static str {
        match self {
            DfuResponseStatus::Success => "Operation successful",
            DfuResponseStatus::InvalidState => "Invalid state for this operation",
            DfuResponseStatus::NotSupported => "Operation not supported",
            DfuResponseStatus::DataSizeExceedsLimit => "Data size exceeds limit",
            DfuResponseStatus::CrcError => "CRC validation failed",
            DfuResponseStatus::OperationFailed => "Operation failed",
        }
    }
}

/// Name of a raw opcode byte, or its hex value when unknown.
pub fn describe_opcode(byte: u8) -> String {
    DfuOpcode::from_byte(byte)
        .map(|opcode| opcode.name().to_string())
        .unwrap_or_else(|| format!("opcode 0x{:02X}", byte))
}

/// Describe a raw status byte, including codes outside the known set.
pub fn describe_status(byte: u8) -> &'static str {
    DfuResponseStatus::from_byte(byte)
        .map(|status| status.description())
        .unwrap_or("Unknown status")
}
