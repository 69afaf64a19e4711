//! DFU error types for the Nordic Legacy DFU implementation.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use super::config::{describe_status, DfuImageType};
use super::events::DfuState;

/// Result type alias for DFU operations.
pub type DfuResult<T> = Result<T, DfuError>;

/// Errors raised while reading a firmware package.
#[derive(Debug, Error)]
pub enum PackageError {
    /// The archive or its manifest cannot be parsed.
    #[error("Malformed firmware package: {reason}")]
    Malformed { reason: String },

    /// A file named by the manifest is absent from the archive.
    #[error("Missing file in firmware package: {filename}")]
    MissingFile { filename: String },

    /// A firmware binary has zero length.
    #[error("Firmware image '{filename}' is empty")]
    EmptyImage { filename: String },

    /// The binary does not match the CRC16 declared in the manifest.
    #[error("CRC16 mismatch for '{filename}': manifest 0x{expected:04X}, binary 0x{actual:04X}")]
    ChecksumMismatch {
        filename: String,
        expected: u16,
        actual: u16,
    },

    /// The archive could not be read from disk.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the BLE transport boundary.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Error from the platform BLE stack.
    #[cfg(feature = "btleplug")]
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// No Bluetooth adapter is available.
    #[error("No Bluetooth adapter found")]
    NoAdapter,

    /// The stack has no peripheral with this address.
    #[error("Peripheral '{address}' not known to the adapter")]
    PeripheralNotFound { address: String },

    /// A required GATT characteristic is missing on the peripheral.
    #[error("Characteristic {uuid} not found")]
    CharacteristicNotFound { uuid: Uuid },

    /// The link dropped.
    #[error("Peripheral disconnected")]
    Disconnected,

    /// Any other failure reported by a transport implementation.
    #[error("{0}")]
    Other(String),
}

/// Errors raised while resolving a target from advertisements.
#[derive(Debug, Error)]
pub enum ScannerError {
    /// No advertisement matched within the scan deadline.
    #[error("No device matching [{identifiers}] found")]
    NotFound { identifiers: String },

    /// The scan was aborted by the caller.
    #[error("Scan cancelled")]
    Cancelled,

    /// The platform refused to start or stop scanning.
    #[error("Scan failed: {0}")]
    Transport(#[source] TransportError),
}

/// Errors raised by the DFU protocol engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The bootloader was not found again after the buttonless jump or a dropped link.
    #[error("Bootloader for '{address}' not found after reboot")]
    ReconnectTimeout { address: String },

    /// The device found after the buttonless jump still runs the application.
    #[error("Device '{address}' still in application mode after bootloader jump")]
    BootloaderNotEntered { address: String },

    /// No notification arrived while waiting for a response.
    #[error("Timeout after {timeout:?} waiting for {operation}")]
    ResponseTimeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// The device sent something the protocol does not allow.
    #[error("Protocol violation: {reason}")]
    ProtocolViolation { reason: String },

    /// The bootloader rejected the transferred image.
    #[error("Validation rejected: status {status} ({})", describe_status(*.status))]
    ValidationRejected { status: u8 },

    /// A command was answered with an error status.
    #[error("{operation} rejected: status {status} ({})", describe_status(*.status))]
    CommandRejected { operation: &'static str, status: u8 },

    /// A receipt notification reported fewer bytes than were sent.
    #[error("Receipt reports {reported} bytes, {expected} sent")]
    ReceiptMismatch { expected: u32, reported: u32 },

    /// Writing a characteristic failed.
    #[error("Write failed: {0}")]
    TransportWriteFailure(#[source] TransportError),

    /// Connecting or subscribing to the peripheral failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(#[source] TransportError),

    /// The notification stream closed mid-session.
    #[error("Device disconnected during {operation}")]
    Disconnected { operation: &'static str },

    /// Operation was cancelled by the caller.
    #[error("Operation cancelled")]
    Cancelled,
}

/// Errors that can occur during DFU operations.
#[derive(Debug, Error)]
pub enum DfuError {
    #[error(transparent)]
    Package(#[from] PackageError),

    #[error(transparent)]
    Scanner(#[from] ScannerError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Configuration values out of range.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

/// Classified error kind reported alongside failure events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    PackageMalformed,
    PackageMissingFile,
    PackageEmptyImage,
    PackageChecksumMismatch,
    PackageIo,
    ScannerNotFound,
    ScannerCancelled,
    ScannerTransport,
    ReconnectTimeout,
    BootloaderNotEntered,
    ResponseTimeout,
    ProtocolViolation,
    ValidationRejected,
    CommandRejected,
    ReceiptMismatch,
    TransportWriteFailure,
    ConnectionFailed,
    Disconnected,
    Cancelled,
    InvalidConfig,
}

impl DfuError {
    /// Check if this error is retriable (transient errors that may succeed on retry).
    pub fn is_retriable(&self) -> bool {
        match self {
            DfuError::Package(_) | DfuError::InvalidConfig { .. } => false,
            DfuError::Scanner(e) => matches!(
                e,
                ScannerError::NotFound { .. } | ScannerError::Transport(_)
            ),
            DfuError::Engine(e) => matches!(
                e,
                EngineError::ReconnectTimeout { .. }
                    | EngineError::BootloaderNotEntered { .. }
                    | EngineError::ResponseTimeout { .. }
                    | EngineError::CommandRejected { .. }
                    | EngineError::ReceiptMismatch { .. }
                    | EngineError::TransportWriteFailure(_)
                    | EngineError::ConnectionFailed(_)
                    | EngineError::Disconnected { .. }
            ),
        }
    }

    /// Whether this error came from the caller aborting the run.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            DfuError::Scanner(ScannerError::Cancelled) | DfuError::Engine(EngineError::Cancelled)
        )
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            DfuError::Package(e) => match e {
                PackageError::Malformed { .. } => ErrorKind::PackageMalformed,
                PackageError::MissingFile { .. } => ErrorKind::PackageMissingFile,
                PackageError::EmptyImage { .. } => ErrorKind::PackageEmptyImage,
                PackageError::ChecksumMismatch { .. } => ErrorKind::PackageChecksumMismatch,
                PackageError::Io(_) => ErrorKind::PackageIo,
            },
            DfuError::Scanner(e) => match e {
                ScannerError::NotFound { .. } => ErrorKind::ScannerNotFound,
                ScannerError::Cancelled => ErrorKind::ScannerCancelled,
                ScannerError::Transport(_) => ErrorKind::ScannerTransport,
            },
            DfuError::Engine(e) => match e {
                EngineError::ReconnectTimeout { .. } => ErrorKind::ReconnectTimeout,
                EngineError::BootloaderNotEntered { .. } => ErrorKind::BootloaderNotEntered,
                EngineError::ResponseTimeout { .. } => ErrorKind::ResponseTimeout,
                EngineError::ProtocolViolation { .. } => ErrorKind::ProtocolViolation,
                EngineError::ValidationRejected { .. } => ErrorKind::ValidationRejected,
                EngineError::CommandRejected { .. } => ErrorKind::CommandRejected,
                EngineError::ReceiptMismatch { .. } => ErrorKind::ReceiptMismatch,
                EngineError::TransportWriteFailure(_) => ErrorKind::TransportWriteFailure,
                EngineError::ConnectionFailed(_) => ErrorKind::ConnectionFailed,
                EngineError::Disconnected { .. } => ErrorKind::Disconnected,
                EngineError::Cancelled => ErrorKind::Cancelled,
            },
            DfuError::InvalidConfig { .. } => ErrorKind::InvalidConfig,
        }
    }

    /// Get a user-friendly error code for support purposes.
    pub fn error_code(&self) -> &'static str {
        match self.kind() {
            ErrorKind::PackageIo => "DFU-002",
            ErrorKind::PackageMalformed => "DFU-041",
            ErrorKind::PackageMissingFile => "DFU-040",
            ErrorKind::PackageEmptyImage => "DFU-042",
            ErrorKind::PackageChecksumMismatch => "DFU-043",
            ErrorKind::ResponseTimeout => "DFU-021",
            ErrorKind::ReconnectTimeout => "DFU-022",
            ErrorKind::BootloaderNotEntered => "DFU-023",
            ErrorKind::CommandRejected => "DFU-030",
            ErrorKind::ValidationRejected => "DFU-031",
            ErrorKind::ScannerNotFound => "DFU-050",
            ErrorKind::Disconnected => "DFU-051",
            ErrorKind::ConnectionFailed => "DFU-052",
            ErrorKind::ScannerTransport => "DFU-053",
            ErrorKind::ProtocolViolation => "DFU-060",
            ErrorKind::ReceiptMismatch => "DFU-061",
            ErrorKind::TransportWriteFailure => "DFU-062",
            ErrorKind::InvalidConfig => "DFU-070",
            ErrorKind::ScannerCancelled | ErrorKind::Cancelled => "DFU-099",
        }
    }
}

/// Failure report for one update run.
///
/// Carries enough context for a caller to decide whether tuning the start
/// delay or the PRN interval is worth another try.
#[derive(Debug, Error)]
#[error("{error} (image {}, state {state}, {attempts} attempt(s))", image_label(*.image_index, *.image_type))]
pub struct DfuFailure {
    #[source]
    pub error: DfuError,
    /// Index of the image in progress, if the transfer had begun.
    pub image_index: Option<usize>,
    pub image_type: Option<DfuImageType>,
    /// Engine state when the failure surfaced.
    pub state: DfuState,
    /// Attempts made, including the first one.
    pub attempts: u32,
}

fn image_label(index: Option<usize>, image_type: Option<DfuImageType>) -> String {
    match (index, image_type) {
        (Some(index), Some(image_type)) => format!("#{} {}", index, image_type.label()),
        (Some(index), None) => format!("#{}", index),
        _ => "none".to_string(),
    }
}

impl DfuFailure {
    /// Failure that happened before any image was started.
    pub fn before_transfer(error: impl Into<DfuError>, state: DfuState, attempts: u32) -> Self {
        Self {
            error: error.into(),
            image_index: None,
            image_type: None,
            state,
            attempts,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }

    /// Troubleshooting suggestion for this failure, if one applies.
    pub fn hint(&self) -> Option<&'static str> {
        match (self.error.kind(), self.state) {
            (ErrorKind::ResponseTimeout, DfuState::SendingFirmware)
            | (ErrorKind::ReceiptMismatch, _) => {
                Some("Transfer stalled; try a lower PRN interval")
            }
            (ErrorKind::ResponseTimeout, _) | (ErrorKind::CommandRejected, DfuState::SendingInit) => {
                Some("Bootloader did not keep up; try a longer start delay")
            }
            (ErrorKind::ReconnectTimeout, _) | (ErrorKind::ScannerNotFound, _) => {
                Some("Device not advertising; check the identifier or enable wait mode")
            }
            (ErrorKind::BootloaderNotEntered, _) => {
                Some("Application ignored the jump request; check that it exposes buttonless DFU")
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_is_retriable() {
        assert!(DfuError::from(EngineError::ResponseTimeout {
            operation: "Start DFU",
            timeout: Duration::from_secs(1),
        })
        .is_retriable());
        assert!(DfuError::from(EngineError::ReconnectTimeout {
            address: "AA:BB:CC:DD:EE:FF".into()
        })
        .is_retriable());
        assert!(DfuError::from(ScannerError::NotFound {
            identifiers: "MyDevice".into()
        })
        .is_retriable());
        assert!(DfuError::from(EngineError::BootloaderNotEntered {
            address: "AA:BB:CC:DD:EE:FF".into()
        })
        .is_retriable());
        assert!(!DfuError::from(EngineError::ValidationRejected { status: 5 }).is_retriable());
        assert!(!DfuError::from(EngineError::ProtocolViolation {
            reason: "bad".into()
        })
        .is_retriable());
        assert!(!DfuError::from(ScannerError::Cancelled).is_retriable());
        assert!(!DfuError::from(PackageError::Malformed {
            reason: "bad".into()
        })
        .is_retriable());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            DfuError::from(EngineError::ValidationRejected { status: 5 }).error_code(),
            "DFU-031"
        );
        assert_eq!(DfuError::from(ScannerError::Cancelled).error_code(), "DFU-099");
    }

    #[test]
    fn test_rejection_message_describes_status() {
        let err = EngineError::ValidationRejected { status: 5 };
        assert_eq!(err.to_string(), "Validation rejected: status 5 (CRC validation failed)");
    }

    #[test]
    fn test_failure_hints() {
        let timeout = || EngineError::ResponseTimeout {
            operation: "Start DFU",
            timeout: Duration::from_secs(20),
        };

        let starting = DfuFailure {
            error: timeout().into(),
            image_index: Some(0),
            image_type: Some(DfuImageType::Application),
            state: DfuState::SendingInit,
            attempts: 4,
        };
        assert!(starting.hint().unwrap().contains("start delay"));

        let streaming = DfuFailure {
            state: DfuState::SendingFirmware,
            error: timeout().into(),
            ..starting
        };
        assert!(streaming.hint().unwrap().contains("PRN"));
        assert!(streaming.to_string().contains("#0 Application"));
    }
}
