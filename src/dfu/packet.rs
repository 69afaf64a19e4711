//! Legacy DFU control point framing.
//!
//! Commands are written to the control point characteristic as an opcode
//! byte plus a small argument. The bootloader answers on the same
//! characteristic with notifications: a response (`0x10`, request opcode,
//! status) or a packet receipt notification (`0x11`, cumulative bytes
//! received as u32 little-endian).

use super::config::{DfuImageType, DfuOpcode};
use super::firmware_reader::FirmwareImage;

/// Init packet phase argument for `InitDfuParams`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InitPhase {
    /// Init packet bytes follow on the packet characteristic.
    Start = 0x00,
    /// All init packet bytes were written.
    Complete = 0x01,
}

/// Commands written to the control point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Ask a buttonless application to reboot into its bootloader.
    EnterBootloader,
    StartDfu(DfuImageType),
    InitDfuParams(InitPhase),
    PacketReceiptRequest(u16),
    ReceiveFirmwareImage,
    ValidateFirmware,
    ActivateAndReset,
    SystemReset,
}

impl ControlCommand {
    pub fn opcode(&self) -> DfuOpcode {
        match self {
            ControlCommand::EnterBootloader | ControlCommand::StartDfu(_) => DfuOpcode::StartDfu,
            ControlCommand::InitDfuParams(_) => DfuOpcode::InitDfuParams,
            ControlCommand::PacketReceiptRequest(_) => {
                DfuOpcode::PacketReceiptNotificationRequest
            }
            ControlCommand::ReceiveFirmwareImage => DfuOpcode::ReceiveFirmwareImage,
            ControlCommand::ValidateFirmware => DfuOpcode::ValidateFirmware,
            ControlCommand::ActivateAndReset => DfuOpcode::ActivateAndReset,
            ControlCommand::SystemReset => DfuOpcode::SystemReset,
        }
    }

    /// Encode the command as written to the control point.
    pub fn encode(&self) -> Vec<u8> {
        let opcode = self.opcode() as u8;
        match self {
            // The application expects the mode it should prepare the bootloader for.
            ControlCommand::EnterBootloader => {
                vec![opcode, DfuImageType::Application as u8]
            }
            ControlCommand::StartDfu(image_type) => vec![opcode, *image_type as u8],
            ControlCommand::InitDfuParams(phase) => vec![opcode, *phase as u8],
            ControlCommand::PacketReceiptRequest(prn) => {
                let mut bytes = vec![opcode];
                bytes.extend_from_slice(&prn.to_le_bytes());
                bytes
            }
            _ => vec![opcode],
        }
    }
}

/// Build the 12-byte image size packet sent after Start DFU.
///
/// Format: softdevice size, bootloader size, application size, each u32
/// little-endian. Slots the image does not update are zero.
pub fn build_image_size_packet(image: &FirmwareImage) -> [u8; 12] {
    let sizes = image.size_vector();
    let mut packet = [0u8; 12];
    for (slot, size) in packet.chunks_exact_mut(4).zip(sizes) {
        slot.copy_from_slice(&size.to_le_bytes());
    }
    packet
}

/// Notification received on the control point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    /// Response to a request opcode.
    Response { request: u8, status: u8 },
    /// Cumulative bytes received by the bootloader.
    PacketReceipt { bytes_received: u32 },
}

impl Notification {
    /// Parse a control point notification.
    ///
    /// Returns a description of the problem for anything that is not a
    /// well-formed response or receipt notification.
    pub fn parse(data: &[u8]) -> Result<Self, String> {
        match data {
            [0x10, request, status, ..] => Ok(Notification::Response {
                request: *request,
                status: *status,
            }),
            [0x11, b0, b1, b2, b3, ..] => Ok(Notification::PacketReceipt {
                bytes_received: u32::from_le_bytes([*b0, *b1, *b2, *b3]),
            }),
            [] => Err("empty notification".to_string()),
            [opcode, ..] => Err(format!(
                "unexpected notification opcode 0x{:02X} ({} bytes)",
                opcode,
                data.len()
            )),
        }
    }
}

/// Parse the DFU version characteristic into (major, minor).
pub fn parse_dfu_version(data: &[u8]) -> Option<(u8, u8)> {
    match data {
        [lo, hi, ..] => {
            let version = u16::from_le_bytes([*lo, *hi]);
            Some(((version >> 8) as u8, (version & 0xFF) as u8))
        }
        _ => None,
    }
}
