//! In-memory BLE transport with a simulated Legacy DFU bootloader.

use std::collections::{HashMap, VecDeque};
use std::future::{ready, Future};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::dfu::config::{
    DfuImageType, ADVERTISEMENT_QUEUE_DEPTH, DFU_CONTROL_POINT_UUID, DFU_PACKET_UUID,
    DFU_SERVICE_UUID, DFU_VERSION_UUID,
};
use crate::dfu::error::TransportError;
use crate::dfu::transport::{Advertisement, BleConnection, BleTransport};

/// Advertisement without service UUIDs.
pub fn adv(name: Option<&str>, address: &str, rssi: i16) -> Advertisement {
    Advertisement {
        name: name.map(str::to_string),
        address: address.to_string(),
        rssi: Some(rssi),
        services: Vec::new(),
    }
}

/// Advertisement carrying the DFU service.
pub fn dfu_adv(name: Option<&str>, address: &str, rssi: i16) -> Advertisement {
    Advertisement {
        services: vec![DFU_SERVICE_UUID],
        ..adv(name, address, rssi)
    }
}

/// Maps (receipt index, true byte count) to the count the device reports.
pub type ReceiptCounts = fn(usize, u32) -> u32;

/// Behaviour of one simulated peripheral.
#[derive(Clone)]
pub struct FakeDevice {
    version: Option<u16>,
    start_statuses: VecDeque<u8>,
    silent_starts: u32,
    init_response_opcode: u8,
    validate_status: u8,
    receipt_latency: Duration,
    receipt_counts: Option<ReceiptCounts>,
    drop_link_after: Option<usize>,
    connect_failures: u32,
    ignores_jump: bool,
}

impl FakeDevice {
    /// Bootloader reporting DFU version 0.8.
    pub fn bootloader() -> Self {
        Self {
            version: Some(0x0008),
            start_statuses: VecDeque::new(),
            silent_starts: 0,
            init_response_opcode: 0x02,
            validate_status: 0x01,
            receipt_latency: Duration::ZERO,
            receipt_counts: None,
            drop_link_after: None,
            connect_failures: 0,
            ignores_jump: false,
        }
    }

    /// Application exposing the buttonless jump.
    pub fn application() -> Self {
        Self::bootloader().version(Some(0x0001))
    }

    /// `None` makes reading the version characteristic fail.
    pub fn version(mut self, version: Option<u16>) -> Self {
        self.version = version;
        self
    }

    /// Statuses for successive Start DFU commands; success once exhausted.
    pub fn start_statuses(mut self, statuses: &[u8]) -> Self {
        self.start_statuses = statuses.iter().copied().collect();
        self
    }

    /// Number of Start DFU commands left unanswered.
    pub fn silent_starts(mut self, count: u32) -> Self {
        self.silent_starts = count;
        self
    }

    /// Request opcode echoed in the init response.
    pub fn init_response_opcode(mut self, opcode: u8) -> Self {
        self.init_response_opcode = opcode;
        self
    }

    pub fn validate_status(mut self, status: u8) -> Self {
        self.validate_status = status;
        self
    }

    /// Delay before each receipt notification reaches the central.
    pub fn receipt_latency(mut self, latency: Duration) -> Self {
        self.receipt_latency = latency;
        self
    }

    pub fn receipt_counts(mut self, counts: ReceiptCounts) -> Self {
        self.receipt_counts = Some(counts);
        self
    }

    /// Drop the link once, after this many firmware bytes arrived.
    pub fn drop_link_after(mut self, bytes: usize) -> Self {
        self.drop_link_after = Some(bytes);
        self
    }

    pub fn connect_failures(mut self, count: u32) -> Self {
        self.connect_failures = count;
        self
    }

    /// Application that keeps running and advertising after a jump request.
    pub fn ignores_jump(mut self) -> Self {
        self.ignores_jump = true;
        self
    }
}

/// What a simulated device received.
#[derive(Debug, Default)]
pub struct DeviceLog {
    pub control_writes: Vec<Vec<u8>>,
    pub init_packet: Vec<u8>,
    /// Firmware bytes of the latest transfer.
    pub firmware: Vec<u8>,
    pub size_vector: [u32; 3],
    pub prn: u16,
    /// Most packets received while a receipt was still undelivered.
    pub max_in_flight: u32,
    pub receipts_sent: u32,
    pub start_commands: u32,
    pub resets: u32,
    pub activated: bool,
    pub validated: Vec<(DfuImageType, usize)>,
}

struct DeviceEntry {
    device: FakeDevice,
    log: Arc<Mutex<DeviceLog>>,
    /// Rebooted into its bootloader under another address.
    offline: bool,
}

#[derive(Default)]
struct TransportState {
    devices: HashMap<String, Arc<Mutex<DeviceEntry>>>,
    scripts: VecDeque<Vec<(Duration, Advertisement)>>,
    repeat_script: Option<Vec<(Duration, Advertisement)>>,
    scan_task: Option<JoinHandle<()>>,
    scan_starts: u32,
    scan_stops: u32,
    connect_attempts: u32,
    connects: u32,
    disconnects: u32,
}

/// Transport whose peripherals and advertisements are scripted by the test.
#[derive(Clone, Default)]
pub struct FakeTransport {
    state: Arc<Mutex<TransportState>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connectable peripheral and return what it will record.
    pub fn add_device(&self, address: &str, device: FakeDevice) -> Arc<Mutex<DeviceLog>> {
        let log = Arc::new(Mutex::new(DeviceLog::default()));
        let entry = DeviceEntry {
            device,
            log: log.clone(),
            offline: false,
        };
        self.state
            .lock()
            .unwrap()
            .devices
            .insert(address.to_string(), Arc::new(Mutex::new(entry)));
        log
    }

    /// Advertisements for the next scan, as offsets from its start.
    pub fn script_scan(&self, script: Vec<(Duration, Advertisement)>) {
        self.state.lock().unwrap().scripts.push_back(script);
    }

    /// Advertisements for every scan once the queued scripts ran out.
    pub fn script_scans_forever(&self, script: Vec<(Duration, Advertisement)>) {
        self.state.lock().unwrap().repeat_script = Some(script);
    }

    pub fn scan_starts(&self) -> u32 {
        self.state.lock().unwrap().scan_starts
    }

    pub fn scan_stops(&self) -> u32 {
        self.state.lock().unwrap().scan_stops
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state.lock().unwrap().connect_attempts
    }

    /// Successful connections.
    pub fn connects(&self) -> u32 {
        self.state.lock().unwrap().connects
    }

    pub fn disconnects(&self) -> u32 {
        self.state.lock().unwrap().disconnects
    }

    fn begin_scan(&self) -> mpsc::Receiver<Advertisement> {
        let mut state = self.state.lock().unwrap();
        state.scan_starts += 1;
        let script = state
            .scripts
            .pop_front()
            .or_else(|| state.repeat_script.clone())
            .unwrap_or_default();

        let (tx, rx) = mpsc::channel(ADVERTISEMENT_QUEUE_DEPTH);
        let task = tokio::spawn(async move {
            let start = Instant::now();
            for (offset, advertisement) in script {
                tokio::time::sleep_until(start + offset).await;
                if tx.send(advertisement).await.is_err() {
                    return;
                }
            }
            tx.closed().await;
        });
        if let Some(previous) = state.scan_task.replace(task) {
            previous.abort();
        }
        rx
    }

    fn end_scan(&self) {
        let mut state = self.state.lock().unwrap();
        state.scan_stops += 1;
        if let Some(task) = state.scan_task.take() {
            task.abort();
        }
    }

    fn open(&self, address: &str) -> Result<FakeConnection, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.connect_attempts += 1;

        let entry = state
            .devices
            .get(address)
            .cloned()
            .ok_or_else(|| TransportError::PeripheralNotFound {
                address: address.to_string(),
            })?;
        {
            let mut device = entry.lock().unwrap();
            if device.offline {
                return Err(TransportError::PeripheralNotFound {
                    address: address.to_string(),
                });
            }
            if device.device.connect_failures > 0 {
                device.device.connect_failures -= 1;
                return Err(TransportError::Other("connection refused".to_string()));
            }
        }

        state.connects += 1;
        Ok(FakeConnection {
            entry,
            transport: self.state.clone(),
            link: Arc::new(Mutex::new(LinkState::default())),
        })
    }
}

impl BleTransport for FakeTransport {
    type Connection = FakeConnection;

    fn start_scan(
        &self,
    ) -> impl Future<Output = Result<mpsc::Receiver<Advertisement>, TransportError>> + Send {
        ready(Ok(self.begin_scan()))
    }

    fn stop_scan(&self) -> impl Future<Output = Result<(), TransportError>> + Send {
        self.end_scan();
        ready(Ok(()))
    }

    fn connect(
        &self,
        address: &str,
    ) -> impl Future<Output = Result<Self::Connection, TransportError>> + Send {
        ready(self.open(address))
    }
}

#[derive(Debug, Clone, Copy, Default)]
enum Phase {
    #[default]
    Idle,
    AwaitSize(u8),
    Init,
    Firmware,
}

struct Delivery {
    delay: Duration,
    data: Vec<u8>,
    receipt: bool,
}

#[derive(Default)]
struct LinkState {
    closed: bool,
    queue: Option<mpsc::UnboundedSender<Delivery>>,
    phase: Phase,
    image_type: Option<DfuImageType>,
    expected: usize,
    packets: u32,
    receipt_index: usize,
    in_flight: u32,
}

impl LinkState {
    fn notify(&self, data: Vec<u8>) {
        self.push(Delivery {
            delay: Duration::ZERO,
            data,
            receipt: false,
        });
    }

    fn push(&self, delivery: Delivery) {
        if let Some(queue) = &self.queue {
            let _ = queue.send(delivery);
        }
    }

    /// Pending notifications are still delivered, then the stream ends.
    fn close(&mut self) {
        self.closed = true;
        self.queue = None;
    }
}

/// Link to a simulated peripheral.
pub struct FakeConnection {
    entry: Arc<Mutex<DeviceEntry>>,
    transport: Arc<Mutex<TransportState>>,
    link: Arc<Mutex<LinkState>>,
}

impl FakeConnection {
    fn handle_write(&self, characteristic: Uuid, data: &[u8]) -> Result<(), TransportError> {
        let mut link = self.link.lock().unwrap();
        if link.closed {
            return Err(TransportError::Disconnected);
        }
        let mut entry = self.entry.lock().unwrap();

        if characteristic == DFU_CONTROL_POINT_UUID {
            on_control(&mut link, &mut entry, data);
            Ok(())
        } else if characteristic == DFU_PACKET_UUID {
            on_packet(&mut link, &mut entry, data);
            Ok(())
        } else {
            Err(TransportError::CharacteristicNotFound {
                uuid: characteristic,
            })
        }
    }

    fn open_notifications(&self) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, TransportError> {
        let mut link = self.link.lock().unwrap();
        if link.closed {
            return Err(TransportError::Disconnected);
        }

        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let (queue_tx, mut queue_rx) = mpsc::unbounded_channel::<Delivery>();
        link.queue = Some(queue_tx);

        let shared = self.link.clone();
        tokio::spawn(async move {
            while let Some(delivery) = queue_rx.recv().await {
                if !delivery.delay.is_zero() {
                    tokio::time::sleep(delivery.delay).await;
                }
                if delivery.receipt {
                    shared.lock().unwrap().in_flight = 0;
                }
                if notify_tx.send(delivery.data).is_err() {
                    return;
                }
            }
        });
        Ok(notify_rx)
    }
}

fn image_type_from_byte(byte: u8) -> Option<DfuImageType> {
    match byte {
        0x01 => Some(DfuImageType::SoftDevice),
        0x02 => Some(DfuImageType::Bootloader),
        0x03 => Some(DfuImageType::SoftDeviceBootloader),
        0x04 => Some(DfuImageType::Application),
        _ => None,
    }
}

fn on_control(link: &mut LinkState, entry: &mut DeviceEntry, data: &[u8]) {
    let mut guard = entry.log.lock().unwrap();
    let log = &mut *guard;
    log.control_writes.push(data.to_vec());

    if entry.device.version == Some(0x0001) {
        if data == [0x01, 0x04] && !entry.device.ignores_jump {
            entry.offline = true;
            link.close();
        }
        return;
    }

    match data {
        [0x01, image_type] => {
            log.start_commands += 1;
            link.phase = Phase::AwaitSize(*image_type);
        }
        [0x02, 0x00] => {
            log.init_packet.clear();
            link.phase = Phase::Init;
        }
        [0x02, 0x01] => {
            link.phase = Phase::Idle;
            link.notify(vec![0x10, entry.device.init_response_opcode, 0x01]);
        }
        [0x08, lo, hi] => log.prn = u16::from_le_bytes([*lo, *hi]),
        [0x03] => {
            log.firmware.clear();
            link.phase = Phase::Firmware;
            link.packets = 0;
            link.receipt_index = 0;
            link.in_flight = 0;
        }
        [0x04] => {
            let status = entry.device.validate_status;
            if status == 0x01 {
                if let Some(image_type) = link.image_type {
                    log.validated.push((image_type, log.firmware.len()));
                }
            }
            link.notify(vec![0x10, 0x04, status]);
        }
        [0x05] => {
            log.activated = true;
            link.close();
        }
        [0x06] => {
            log.resets += 1;
            link.close();
        }
        _ => {}
    }
}

fn on_packet(link: &mut LinkState, entry: &mut DeviceEntry, data: &[u8]) {
    let mut guard = entry.log.lock().unwrap();
    let log = &mut *guard;

    match link.phase {
        Phase::AwaitSize(image_type) => {
            for (slot, bytes) in log.size_vector.iter_mut().zip(data.chunks_exact(4)) {
                *slot = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            }
            link.expected = log.size_vector.iter().map(|size| *size as usize).sum();
            link.image_type = image_type_from_byte(image_type);
            link.phase = Phase::Idle;

            if entry.device.silent_starts > 0 {
                entry.device.silent_starts -= 1;
                return;
            }
            let status = entry.device.start_statuses.pop_front().unwrap_or(0x01);
            link.notify(vec![0x10, 0x01, status]);
        }
        Phase::Init => log.init_packet.extend_from_slice(data),
        Phase::Firmware => {
            log.firmware.extend_from_slice(data);
            link.packets += 1;
            link.in_flight += 1;
            log.max_in_flight = log.max_in_flight.max(link.in_flight);

            if entry
                .device
                .drop_link_after
                .is_some_and(|limit| log.firmware.len() >= limit)
            {
                entry.device.drop_link_after = None;
                link.close();
                return;
            }

            let received = log.firmware.len() as u32;
            if log.prn > 0 && link.packets % u32::from(log.prn) == 0 {
                let reported = entry
                    .device
                    .receipt_counts
                    .map_or(received, |counts| counts(link.receipt_index, received));
                link.receipt_index += 1;
                log.receipts_sent += 1;

                let mut notification = vec![0x11];
                notification.extend_from_slice(&reported.to_le_bytes());
                link.push(Delivery {
                    delay: entry.device.receipt_latency,
                    data: notification,
                    receipt: true,
                });
            }

            if log.firmware.len() >= link.expected {
                link.phase = Phase::Idle;
                link.notify(vec![0x10, 0x03, 0x01]);
            }
        }
        Phase::Idle => {}
    }
}

impl BleConnection for FakeConnection {
    fn write(
        &self,
        characteristic: Uuid,
        data: &[u8],
        _with_response: bool,
    ) -> impl Future<Output = Result<(), TransportError>> + Send {
        ready(self.handle_write(characteristic, data))
    }

    fn read(&self, characteristic: Uuid) -> impl Future<Output = Result<Vec<u8>, TransportError>> + Send {
        let result = if self.link.lock().unwrap().closed {
            Err(TransportError::Disconnected)
        } else if characteristic != DFU_VERSION_UUID {
            Err(TransportError::CharacteristicNotFound {
                uuid: characteristic,
            })
        } else {
            self.entry
                .lock()
                .unwrap()
                .device
                .version
                .map(|version| version.to_le_bytes().to_vec())
                .ok_or(TransportError::CharacteristicNotFound {
                    uuid: characteristic,
                })
        };
        ready(result)
    }

    fn subscribe(
        &self,
        _characteristic: Uuid,
    ) -> impl Future<Output = Result<mpsc::UnboundedReceiver<Vec<u8>>, TransportError>> + Send {
        ready(self.open_notifications())
    }

    fn disconnect(&self) -> impl Future<Output = Result<(), TransportError>> + Send {
        self.transport.lock().unwrap().disconnects += 1;
        self.link.lock().unwrap().close();
        ready(Ok(()))
    }
}
