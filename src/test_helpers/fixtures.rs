use std::io::{Cursor, Write};
use std::sync::Mutex;

use serde_json::{json, Map, Value};
use zip::write::FileOptions;
use zip::ZipWriter;

use crate::dfu::config::DfuImageType;
use crate::dfu::events::{DfuEvent, DfuObserver, DfuState};
use crate::dfu::firmware_reader::FirmwareImage;

/// Manifest naming `application.bin` and `application.dat`.
pub const APPLICATION_MANIFEST: &str = r#"{
    "manifest": {
        "application": {
            "bin_file": "application.bin",
            "dat_file": "application.dat"
        },
        "dfu_version": 0.5
    }
}"#;

/// Image with a dummy init packet and a `size` byte binary.
pub fn image(image_type: DfuImageType, size: usize) -> FirmwareImage {
    FirmwareImage {
        image_type,
        init_packet: vec![0x01; 14],
        binary: vec![0xAB; size],
        softdevice_size: 0,
        bootloader_size: 0,
    }
}

/// Builder for in-memory firmware.zip archives
pub struct PackageBuilder {
    roles: Map<String, Value>,
    files: Vec<(String, Vec<u8>)>,
    excluded: Vec<String>,
    manifest: Option<String>,
}

impl PackageBuilder {
    pub fn new() -> Self {
        Self {
            roles: Map::new(),
            files: Vec::new(),
            excluded: Vec::new(),
            manifest: None,
        }
    }

    pub fn application(self, dat: &[u8], bin: &[u8]) -> Self {
        self.role("application", "application.dat", "application.bin", dat, bin)
    }

    pub fn softdevice_bootloader(mut self, dat: &[u8], bin: &[u8], sd_size: u32, bl_size: u32) -> Self {
        self = self.role("softdevice_bootloader", "sd_bl.dat", "sd_bl.bin", dat, bin);
        if let Some(Value::Object(entry)) = self.roles.get_mut("softdevice_bootloader") {
            entry.insert("sd_size".into(), json!(sd_size));
            entry.insert("bl_size".into(), json!(bl_size));
        }
        self
    }

    /// Any manifest role with its file pair.
    pub fn role(mut self, name: &str, dat_file: &str, bin_file: &str, dat: &[u8], bin: &[u8]) -> Self {
        self.roles.insert(
            name.to_string(),
            json!({ "bin_file": bin_file, "dat_file": dat_file }),
        );
        self.files.push((dat_file.to_string(), dat.to_vec()));
        self.files.push((bin_file.to_string(), bin.to_vec()));
        self
    }

    /// Declare a CRC16 for the application binary.
    pub fn with_crc16(mut self, crc: u16) -> Self {
        if let Some(Value::Object(entry)) = self.roles.get_mut("application") {
            entry.insert("init_packet_data".into(), json!({ "firmware_crc16": crc }));
        }
        self
    }

    /// Extra archive member, outside the manifest.
    pub fn file(mut self, name: &str, content: &[u8]) -> Self {
        self.files.push((name.to_string(), content.to_vec()));
        self
    }

    /// Leave a file out of the archive even though the manifest names it.
    pub fn without_file(mut self, name: &str) -> Self {
        self.excluded.push(name.to_string());
        self
    }

    pub fn manifest_override(mut self, manifest: &str) -> Self {
        self.manifest = Some(manifest.to_string());
        self
    }

    pub fn build(self) -> Vec<u8> {
        let manifest = self.manifest.or_else(|| {
            if self.roles.is_empty() {
                return None;
            }
            let mut inner = self.roles.clone();
            inner.insert("dfu_version".into(), json!(0.5));
            Some(json!({ "manifest": inner }).to_string())
        });

        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let options = FileOptions::default().compression_method(zip::CompressionMethod::Stored);

        if let Some(manifest) = manifest {
            zip.start_file("manifest.json", options).unwrap();
            zip.write_all(manifest.as_bytes()).unwrap();
        }
        for (name, content) in &self.files {
            if self.excluded.contains(name) {
                continue;
            }
            zip.start_file(name.as_str(), options).unwrap();
            zip.write_all(content).unwrap();
        }

        zip.finish().unwrap().into_inner()
    }
}

impl Default for PackageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer that keeps every event for later assertions
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<DfuEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DfuEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn contains(&self, predicate: impl Fn(&DfuEvent) -> bool) -> bool {
        self.events.lock().unwrap().iter().any(predicate)
    }

    pub fn count(&self, predicate: impl Fn(&DfuEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| predicate(e)).count()
    }

    /// Target states of every transition, in order.
    pub fn states(&self) -> Vec<DfuState> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                DfuEvent::StateChanged { to, .. } => Some(*to),
                _ => None,
            })
            .collect()
    }
}

impl DfuObserver for RecordingObserver {
    fn on_event(&self, event: &DfuEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}
