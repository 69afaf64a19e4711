//! Firmware package reader for Nordic Legacy DFU.
//!
//! Reads and parses the firmware.zip package produced by nrfutil:
//! - manifest.json - Package metadata mapping image roles to files
//! - *.bin - Firmware binaries
//! - *.dat - Init packets
//!
//! Images come out in transfer order: a SoftDevice and/or bootloader image
//! before the application.

use std::io::{Cursor, Read, Seek};
use std::path::Path;

use serde::Deserialize;
use sha2::{Digest, Sha256};

use super::config::DfuImageType;
use super::error::PackageError;

const MANIFEST_FILENAME: &str = "manifest.json";

/// One image ready for transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct FirmwareImage {
    pub image_type: DfuImageType,
    /// Init packet (the .dat file), sent with the Init DFU Params command.
    pub init_packet: Vec<u8>,
    /// Firmware payload (the .bin file).
    pub binary: Vec<u8>,
    /// SoftDevice part of a combined image, zero otherwise.
    pub softdevice_size: u32,
    /// Bootloader part of a combined image, zero otherwise.
    pub bootloader_size: u32,
}

impl FirmwareImage {
    /// Byte length of the binary.
    pub fn size(&self) -> u32 {
        self.binary.len() as u32
    }

    /// Sizes announced after Start DFU: softdevice, bootloader, application.
    pub fn size_vector(&self) -> [u32; 3] {
        match self.image_type {
            DfuImageType::SoftDevice => [self.size(), 0, 0],
            DfuImageType::Bootloader => [0, self.size(), 0],
            DfuImageType::SoftDeviceBootloader => [self.softdevice_size, self.bootloader_size, 0],
            DfuImageType::Application => [0, 0, self.size()],
        }
    }
}

/// Contents of a DFU firmware package.
#[derive(Debug, Clone)]
pub struct FirmwarePackage {
    images: Vec<FirmwareImage>,
    /// DFU version from the manifest, if present.
    pub dfu_version: Option<f32>,
    /// SHA-256 of the archive bytes, hex encoded.
    pub sha256: String,
}

impl FirmwarePackage {
    /// Images in transfer order.
    pub fn images(&self) -> &[FirmwareImage] {
        &self.images
    }

    /// Total payload bytes across all images.
    pub fn total_bytes(&self) -> u64 {
        self.images.iter().map(|image| image.binary.len() as u64).sum()
    }
}

/// Raw manifest.json structure for deserialization.
#[derive(Debug, Deserialize)]
struct RawManifest {
    manifest: ManifestInner,
}

#[derive(Debug, Deserialize)]
struct ManifestInner {
    application: Option<ManifestImage>,
    bootloader: Option<ManifestImage>,
    softdevice: Option<ManifestImage>,
    softdevice_bootloader: Option<ManifestImage>,
    dfu_version: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct ManifestImage {
    bin_file: String,
    dat_file: String,
    init_packet_data: Option<InitPacketData>,
    sd_size: Option<u32>,
    bl_size: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct InitPacketData {
    firmware_crc16: Option<u16>,
}

/// Read and parse a firmware.zip package from disk.
pub fn read_firmware_zip<P: AsRef<Path>>(path: P) -> Result<FirmwarePackage, PackageError> {
    let bytes = std::fs::read(path.as_ref())?;
    load_package(&bytes)
}

/// Parse a firmware package from archive bytes.
///
/// Pure over its input: nothing besides the supplied bytes is read.
pub fn load_package(archive_bytes: &[u8]) -> Result<FirmwarePackage, PackageError> {
    let mut archive =
        zip::ZipArchive::new(Cursor::new(archive_bytes)).map_err(|e| PackageError::Malformed {
            reason: format!("not a zip archive: {}", e),
        })?;

    let (images, dfu_version) = if archive.file_names().any(|name| name == MANIFEST_FILENAME) {
        read_manifest_images(&mut archive)?
    } else {
        (vec![read_legacy_application(&mut archive)?], None)
    };

    Ok(FirmwarePackage {
        images,
        dfu_version,
        sha256: format!("{:x}", Sha256::digest(archive_bytes)),
    })
}

/// Read every image the manifest declares, system image first.
fn read_manifest_images<R: Read + Seek>(
    archive: &mut zip::ZipArchive<R>,
) -> Result<(Vec<FirmwareImage>, Option<f32>), PackageError> {
    let contents = read_file_from_zip(archive, MANIFEST_FILENAME)?;
    let raw: RawManifest =
        serde_json::from_slice(&contents).map_err(|e| PackageError::Malformed {
            reason: format!("{}: {}", MANIFEST_FILENAME, e),
        })?;
    let manifest = raw.manifest;

    let roles = [
        (manifest.softdevice_bootloader, DfuImageType::SoftDeviceBootloader),
        (manifest.softdevice, DfuImageType::SoftDevice),
        (manifest.bootloader, DfuImageType::Bootloader),
        (manifest.application, DfuImageType::Application),
    ];

    let mut images: Vec<FirmwareImage> = Vec::with_capacity(2);
    for (entry, image_type) in roles {
        let Some(entry) = entry else { continue };
        if image_type.is_system_image()
            && images.iter().any(|image| image.image_type.is_system_image())
        {
            return Err(PackageError::Malformed {
                reason: "more than one SoftDevice/bootloader image".to_string(),
            });
        }
        images.push(read_image(archive, &entry, image_type)?);
    }

    if images.is_empty() {
        return Err(PackageError::Malformed {
            reason: "manifest declares no images".to_string(),
        });
    }

    Ok((images, manifest.dfu_version))
}

/// Read one image pair and check it against its manifest entry.
fn read_image<R: Read + Seek>(
    archive: &mut zip::ZipArchive<R>,
    entry: &ManifestImage,
    image_type: DfuImageType,
) -> Result<FirmwareImage, PackageError> {
    let init_packet = read_file_from_zip(archive, &entry.dat_file)?;
    let binary = read_file_from_zip(archive, &entry.bin_file)?;

    if binary.is_empty() {
        return Err(PackageError::EmptyImage {
            filename: entry.bin_file.clone(),
        });
    }
    if init_packet.is_empty() {
        return Err(PackageError::Malformed {
            reason: format!("init packet '{}' is empty", entry.dat_file),
        });
    }

    if let Some(expected) = entry.init_packet_data.as_ref().and_then(|d| d.firmware_crc16) {
        let actual = firmware_crc16(&binary);
        if actual != expected {
            return Err(PackageError::ChecksumMismatch {
                filename: entry.bin_file.clone(),
                expected,
                actual,
            });
        }
    }

    let (softdevice_size, bootloader_size) = match image_type {
        DfuImageType::SoftDeviceBootloader => {
            let (Some(sd_size), Some(bl_size)) = (entry.sd_size, entry.bl_size) else {
                return Err(PackageError::Malformed {
                    reason: "softdevice_bootloader entry lacks sd_size/bl_size".to_string(),
                });
            };
            if sd_size as u64 + bl_size as u64 != binary.len() as u64 {
                return Err(PackageError::Malformed {
                    reason: format!(
                        "sd_size {} + bl_size {} does not match '{}' ({} bytes)",
                        sd_size,
                        bl_size,
                        entry.bin_file,
                        binary.len()
                    ),
                });
            }
            (sd_size, bl_size)
        }
        _ => (0, 0),
    };

    Ok(FirmwareImage {
        image_type,
        init_packet,
        binary,
        softdevice_size,
        bootloader_size,
    })
}

/// Archives without a manifest: pick the application .bin/.dat pair by name.
fn read_legacy_application<R: Read + Seek>(
    archive: &mut zip::ZipArchive<R>,
) -> Result<FirmwareImage, PackageError> {
    let find = |archive: &zip::ZipArchive<R>, extension: &str| {
        archive
            .file_names()
            .find(|name| name.ends_with(extension) && name.to_lowercase().contains("application"))
            .map(str::to_string)
    };

    let (Some(bin_file), Some(dat_file)) = (find(&*archive, ".bin"), find(&*archive, ".dat")) else {
        return Err(PackageError::MissingFile {
            filename: MANIFEST_FILENAME.to_string(),
        });
    };

    let entry = ManifestImage {
        bin_file,
        dat_file,
        init_packet_data: None,
        sd_size: None,
        bl_size: None,
    };
    read_image(archive, &entry, DfuImageType::Application)
}

/// Read a file from the zip archive by name.
fn read_file_from_zip<R: Read + Seek>(
    archive: &mut zip::ZipArchive<R>,
    name: &str,
) -> Result<Vec<u8>, PackageError> {
    let mut file = archive.by_name(name).map_err(|_| PackageError::MissingFile {
        filename: name.to_string(),
    })?;

    let mut data = Vec::with_capacity(file.size() as usize);
    file.read_to_end(&mut data)
        .map_err(|e| PackageError::Malformed {
            reason: format!("cannot read '{}': {}", name, e),
        })?;

    Ok(data)
}

/// CRC16 the bootloader computes over an image (CRC-16/CCITT-FALSE).
pub fn firmware_crc16(data: &[u8]) -> u16 {
    crc16::State::<crc16::CCITT_FALSE>::calculate(data)
}
