//! Legacy DFU protocol engine.
//!
//! Drives one device through the Legacy DFU state machine:
//!
//! 1. **Mode detection** - read the DFU version to tell application from bootloader
//! 2. **Buttonless jump** - ask the application to reboot into its bootloader
//! 3. **Reconnect** - find the bootloader again by address, address hint or name
//! 4. **Start / Init** - announce the image sizes, send the init packet
//! 5. **Firmware transfer** - stream the binary, paced by receipt notifications
//! 6. **Validation** - the bootloader checks the received image
//! 7. **Activation** - the device resets into the new firmware
//!
//! Steps 4 to 6 repeat for every image of the package on the same link.
//! Retryable failures restart the current image from Start after a fresh
//! connection; fatal ones end the run.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::config::{
    describe_opcode, DfuImageType, DfuOpcode, DfuResponseStatus, APPLICATION_MODE_DFU_VERSION,
    DFU_CONTROL_POINT_UUID, DFU_PACKET_UUID, DFU_VERSION_UUID, JUMP_SETTLE_DELAY,
    PROGRESS_REPORT_INTERVAL,
};
use super::device::{DeviceScanner, ResolvedDevice, TargetSpec};
use super::error::{DfuError, DfuFailure, EngineError, ScannerError};
use super::events::{DfuEvent, DfuObserver, DfuState, LogLevel};
use super::firmware_reader::{FirmwareImage, FirmwarePackage};
use super::packet::{
    build_image_size_packet, parse_dfu_version, ControlCommand, InitPhase, Notification,
};
use super::session::ImageReport;
use super::transport::{BleConnection, BleTransport};
use crate::settings::DfuConfig;

const SUCCESS: u8 = DfuResponseStatus::Success as u8;

/// Packet receipt bookkeeping.
///
/// Counts data packets written since the last receipt notification. With a
/// non-zero `prn` the sender must stop once `prn` packets are outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferWindow {
    prn: u16,
    packets_since_ack: u16,
}

impl TransferWindow {
    pub fn new(prn: u16) -> Self {
        Self {
            prn,
            packets_since_ack: 0,
        }
    }

    pub fn record_packet(&mut self) {
        self.packets_since_ack = self.packets_since_ack.saturating_add(1);
    }

    /// Whether a receipt must arrive before the next packet.
    pub fn is_full(&self) -> bool {
        self.prn > 0 && self.packets_since_ack >= self.prn
    }

    pub fn acknowledge(&mut self) {
        self.packets_since_ack = 0;
    }

    /// Packets written since the last acknowledgment.
    pub fn outstanding(&self) -> u16 {
        self.packets_since_ack
    }
}

/// Mutable state of one update run.
#[derive(Debug, Clone)]
pub struct DfuSession {
    pub state: DfuState,
    pub current_image_index: usize,
    /// Firmware bytes written for the current image.
    pub bytes_sent: u32,
    /// Highest cumulative count reported by a receipt notification.
    pub bytes_acked_high_water: u32,
    pub window: TransferWindow,
    /// Attempts made on the current image.
    pub attempts: u32,
}

impl DfuSession {
    fn new(prn: u16) -> Self {
        Self {
            state: DfuState::Idle,
            current_image_index: 0,
            bytes_sent: 0,
            bytes_acked_high_water: 0,
            window: TransferWindow::new(prn),
            attempts: 0,
        }
    }

    fn reset_transfer(&mut self) {
        self.bytes_sent = 0;
        self.bytes_acked_high_water = 0;
        self.window.acknowledge();
    }
}

struct Link<C> {
    connection: C,
    notifications: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// Protocol engine bound to one resolved device.
pub struct DfuEngine<'a, T: BleTransport> {
    transport: &'a T,
    config: &'a DfuConfig,
    observer: &'a dyn DfuObserver,
    cancel: CancellationToken,
    session: DfuSession,
    device: ResolvedDevice,
    link: Option<Link<T::Connection>>,
    active_image: Option<(usize, DfuImageType)>,
    in_bootloader: bool,
    /// Set once a link was torn down; the next connect scans first.
    rediscover: bool,
}

impl<'a, T: BleTransport> DfuEngine<'a, T> {
    pub fn new(
        transport: &'a T,
        config: &'a DfuConfig,
        observer: &'a dyn DfuObserver,
        cancel: CancellationToken,
        device: ResolvedDevice,
    ) -> Self {
        Self {
            transport,
            config,
            observer,
            cancel,
            session: DfuSession::new(config.prn),
            device,
            link: None,
            active_image: None,
            in_bootloader: false,
            rediscover: false,
        }
    }

    /// Hand over a connection the caller already opened to the device.
    pub async fn attach(&mut self, connection: T::Connection) -> Result<(), EngineError> {
        match connection.subscribe(DFU_CONTROL_POINT_UUID).await {
            Ok(notifications) => {
                self.link = Some(Link {
                    connection,
                    notifications,
                });
                Ok(())
            }
            Err(e) => {
                if let Err(e) = connection.disconnect().await {
                    tracing::debug!("Disconnect after failed subscribe: {}", e);
                }
                Err(EngineError::ConnectionFailed(e))
            }
        }
    }

    pub fn session(&self) -> &DfuSession {
        &self.session
    }

    /// Device the engine is currently talking to (the bootloader after a jump).
    pub fn device(&self) -> &ResolvedDevice {
        &self.device
    }

    /// Transfer every image of the package, then activate.
    ///
    /// The connection is closed on every exit path.
    pub async fn run(&mut self, package: &FirmwarePackage) -> Result<Vec<ImageReport>, DfuFailure> {
        let mut reports = Vec::with_capacity(package.images().len());
        let result = self.run_images(package, &mut reports).await;
        self.teardown().await;

        match result {
            Ok(()) => {
                self.transition(DfuState::Complete);
                Ok(reports)
            }
            Err(error) => {
                let failure = DfuFailure {
                    error,
                    image_index: self.active_image.map(|(index, _)| index),
                    image_type: self.active_image.map(|(_, image_type)| image_type),
                    state: self.session.state,
                    attempts: self.session.attempts,
                };
                self.transition(DfuState::Failed);
                Err(failure)
            }
        }
    }

    async fn run_images(
        &mut self,
        package: &FirmwarePackage,
        reports: &mut Vec<ImageReport>,
    ) -> Result<(), DfuError> {
        let max_attempts = self.config.max_attempts();

        for (index, image) in package.images().iter().enumerate() {
            self.session.current_image_index = index;
            self.session.attempts = 0;

            loop {
                self.session.attempts += 1;
                let error = match self.transfer_image(index, image).await {
                    Ok(()) => break,
                    Err(e) => DfuError::from(e),
                };

                if !error.is_retriable() || self.session.attempts >= max_attempts {
                    return Err(error);
                }

                self.observer.on_event(&DfuEvent::RetryScheduled {
                    attempt: self.session.attempts,
                    max_attempts,
                    error_code: error.error_code(),
                    message: error.to_string(),
                });
                self.teardown().await;
                self.pause(self.config.retry_backoff).await?;
            }

            reports.push(ImageReport {
                index,
                image_type: image.image_type,
                bytes: image.size(),
                attempts: self.session.attempts,
            });
        }

        self.activate().await?;
        Ok(())
    }

    async fn transfer_image(&mut self, index: usize, image: &FirmwareImage) -> Result<(), EngineError> {
        self.acquire_link().await?;

        self.active_image = Some((index, image.image_type));
        self.session.reset_transfer();
        self.transition(DfuState::SendingInit);
        self.log(
            LogLevel::Info,
            format!("Starting {} image ({} bytes)", image.image_type.label(), image.size()),
        );

        self.start_dfu(image).await?;
        self.send_init_packet(image).await?;

        self.transition(DfuState::SendingFirmware);
        self.send_firmware(index, image).await?;

        self.transition(DfuState::AwaitingValidation);
        self.validate().await?;

        self.observer.on_event(&DfuEvent::ImageComplete {
            image_index: index,
            image_type: image.image_type,
        });
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Link management
    // ------------------------------------------------------------------------

    /// Make sure a link to the bootloader is open.
    async fn acquire_link(&mut self) -> Result<(), EngineError> {
        if self.link.is_none() {
            if self.rediscover {
                self.transition(DfuState::Reconnecting);
                let target = self.device.bootloader_target(self.config, true);
                self.device = self.find_again(&target).await?;
            }
            self.connect().await?;
        }

        if !self.in_bootloader {
            if self.is_application_mode().await {
                self.buttonless_jump().await?;
                self.connect().await?;
                // Only a version read tells a bootloader on the same address apart
                if self.read_dfu_version().await == Some(APPLICATION_MODE_DFU_VERSION) {
                    self.log(
                        LogLevel::Warn,
                        format!("{} still runs the application", self.device.address),
                    );
                    return Err(EngineError::BootloaderNotEntered {
                        address: self.device.address.clone(),
                    });
                }
            }
            self.in_bootloader = true;
        }
        Ok(())
    }

    async fn connect(&mut self) -> Result<(), EngineError> {
        tracing::debug!(address = %self.device.address, "Connecting");

        let connecting = tokio::time::timeout(
            self.config.response_timeout,
            self.transport.connect(&self.device.address),
        );
        let connection = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(EngineError::Cancelled),
            result = connecting => match result {
                Ok(connection) => connection.map_err(EngineError::ConnectionFailed)?,
                Err(_) => {
                    return Err(EngineError::ResponseTimeout {
                        operation: "connect",
                        timeout: self.config.response_timeout,
                    })
                }
            },
        };

        self.attach(connection).await
    }

    /// Whether the connected device runs the application rather than the bootloader.
    ///
    /// Reads the DFU version; when that fails, compares the advertised name
    /// with the bootloader name.
    async fn is_application_mode(&self) -> bool {
        if self.link.is_none() {
            return false;
        }
        match self.read_dfu_version().await {
            Some(version) => version == APPLICATION_MODE_DFU_VERSION,
            None => self
                .device
                .name
                .as_deref()
                .is_some_and(|name| name != self.config.bootloader_name),
        }
    }

    /// DFU version of the connected device as `major << 8 | minor`.
    async fn read_dfu_version(&self) -> Option<u16> {
        let link = self.link.as_ref()?;
        match link.connection.read(DFU_VERSION_UUID).await.as_deref().map(parse_dfu_version) {
            Ok(Some((major, minor))) => {
                self.observer.on_event(&DfuEvent::DfuVersion { major, minor });
                Some(u16::from_be_bytes([major, minor]))
            }
            Ok(None) => {
                tracing::warn!("DFU version characteristic too short");
                None
            }
            Err(e) => {
                tracing::debug!("Could not read DFU version: {}", e);
                None
            }
        }
    }

    /// Reboot the application into its bootloader and find the bootloader.
    async fn buttonless_jump(&mut self) -> Result<(), EngineError> {
        self.transition(DfuState::AwaitingButtonlessJump);
        self.log(LogLevel::Info, "Requesting bootloader jump".to_string());

        // The application resets while answering, so a failed write is expected
        if let Err(e) = self.write_control(ControlCommand::EnterBootloader).await {
            tracing::debug!("Jump write failed (normal if the device reset): {}", e);
        }
        self.pause(JUMP_SETTLE_DELAY).await?;
        self.teardown().await;

        self.transition(DfuState::Reconnecting);
        let target = self.device.bootloader_target(self.config, false);
        self.device = self.find_again(&target).await?;
        Ok(())
    }

    async fn find_again(&self, target: &TargetSpec) -> Result<ResolvedDevice, EngineError> {
        let deadline = if self.config.wait {
            None
        } else {
            Some(self.config.reconnect_timeout)
        };

        let scanner = DeviceScanner::new(self.transport, self.observer, self.cancel.clone());
        scanner
            .resolve_one(target, deadline)
            .await
            .map_err(|e| match e {
                ScannerError::NotFound { .. } => EngineError::ReconnectTimeout {
                    address: self.device.address.clone(),
                },
                ScannerError::Cancelled => EngineError::Cancelled,
                ScannerError::Transport(e) => EngineError::ConnectionFailed(e),
            })
    }

    async fn teardown(&mut self) {
        if let Some(link) = self.link.take() {
            if let Err(e) = link.connection.disconnect().await {
                tracing::debug!("Disconnect failed: {}", e);
            }
            self.rediscover = true;
        }
    }

    // ------------------------------------------------------------------------
    // Protocol steps
    // ------------------------------------------------------------------------

    async fn start_dfu(&mut self, image: &FirmwareImage) -> Result<(), EngineError> {
        self.write_control(ControlCommand::StartDfu(image.image_type)).await?;
        // Fixed pacing: the bootloader gives no ack before the size packet
        self.pause(self.config.start_delay).await?;
        self.write_packet(&build_image_size_packet(image)).await?;

        let status = self
            .await_response(DfuOpcode::StartDfu, self.config.response_timeout).await?;
        if status != SUCCESS {
            self.log(
                LogLevel::Warn,
                format!("Start DFU failed with status {}, resetting", status),
            );
            if let Err(e) = self.write_control(ControlCommand::SystemReset).await {
                tracing::debug!("System reset write failed: {}", e);
            }
            return Err(EngineError::CommandRejected {
                operation: DfuOpcode::StartDfu.name(),
                status,
            });
        }
        Ok(())
    }

    async fn send_init_packet(&mut self, image: &FirmwareImage) -> Result<(), EngineError> {
        self.write_control(ControlCommand::InitDfuParams(InitPhase::Start)).await?;
        for chunk in image.init_packet.chunks(self.config.packet_size) {
            self.write_packet(chunk).await?;
        }
        self.write_control(ControlCommand::InitDfuParams(InitPhase::Complete)).await?;

        let status = self
            .await_response(DfuOpcode::InitDfuParams, self.config.response_timeout).await?;
        if status != SUCCESS {
            return Err(EngineError::CommandRejected {
                operation: DfuOpcode::InitDfuParams.name(),
                status,
            });
        }
        Ok(())
    }

    async fn send_firmware(&mut self, index: usize, image: &FirmwareImage) -> Result<(), EngineError> {
        if self.config.prn > 0 {
            self.write_control(ControlCommand::PacketReceiptRequest(self.config.prn)).await?;
        }
        self.write_control(ControlCommand::ReceiveFirmwareImage).await?;

        let total = image.size();
        let packets = image.binary.chunks(self.config.packet_size);
        let count = packets.len();

        for (i, chunk) in packets.enumerate() {
            if self.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            self.write_packet(chunk).await?;
            let before = self.session.bytes_sent;
            self.session.bytes_sent += chunk.len() as u32;
            self.session.window.record_packet();

            let sent = self.session.bytes_sent;
            if sent == total || sent / PROGRESS_REPORT_INTERVAL > before / PROGRESS_REPORT_INTERVAL {
                self.observer.on_event(&DfuEvent::Progress {
                    image_index: index,
                    image_type: image.image_type,
                    sent,
                    total,
                });
            }

            // The Receive Firmware Image response acknowledges the final window
            let last = i + 1 == count;
            if self.session.window.is_full() && !last {
                self.await_receipt().await?;
            }
        }

        let status = self
            .await_response(DfuOpcode::ReceiveFirmwareImage, self.config.response_timeout).await?;
        if status != SUCCESS {
            return Err(EngineError::CommandRejected {
                operation: DfuOpcode::ReceiveFirmwareImage.name(),
                status,
            });
        }
        self.session.window.acknowledge();
        self.session.bytes_acked_high_water = self.session.bytes_sent;
        Ok(())
    }

    async fn validate(&mut self) -> Result<(), EngineError> {
        self.write_control(ControlCommand::ValidateFirmware).await?;
        let status = self
            .await_response(DfuOpcode::ValidateFirmware, self.config.validation_timeout).await?;
        if status != SUCCESS {
            return Err(EngineError::ValidationRejected { status });
        }
        Ok(())
    }

    async fn activate(&mut self) -> Result<(), EngineError> {
        self.transition(DfuState::Activating);
        // The device resets as part of activation; the write may not complete
        if let Err(e) = self.write_control(ControlCommand::ActivateAndReset).await {
            tracing::debug!("Activate write failed (normal if the device reset): {}", e);
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------------

    async fn next_notification(
        &mut self,
        operation: &'static str,
        timeout: Duration,
        deadline: Instant,
    ) -> Result<Notification, EngineError> {
        let link = self
            .link
            .as_mut()
            .ok_or(EngineError::Disconnected { operation })?;

        let received = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(EngineError::Cancelled),
            received = tokio::time::timeout_at(deadline, link.notifications.recv()) => received,
        };

        match received {
            Err(_) => Err(EngineError::ResponseTimeout { operation, timeout }),
            Ok(None) => Err(EngineError::Disconnected { operation }),
            Ok(Some(data)) => {
                tracing::trace!(data = ?data, "<< control point");
                Notification::parse(&data).map_err(|reason| EngineError::ProtocolViolation { reason })
            }
        }
    }

    /// Wait for the response to `request` and return its status.
    async fn await_response(&mut self, request: DfuOpcode, timeout: Duration) -> Result<u8, EngineError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.next_notification(request.name(), timeout, deadline).await? {
                Notification::Response {
                    request: echoed,
                    status,
                } => {
                    if echoed != request as u8 {
                        return Err(EngineError::ProtocolViolation {
                            reason: format!(
                                "response to {} while waiting for {}",
                                describe_opcode(echoed),
                                request.name()
                            ),
                        });
                    }
                    tracing::debug!(status, "{} acknowledged", request.name());
                    return Ok(status);
                }
                // A receipt for the last window may precede the response
                Notification::PacketReceipt { bytes_received } => {
                    self.record_receipt(bytes_received)?;
                }
            }
        }
    }

    /// Block until the bootloader confirms every byte sent so far.
    async fn await_receipt(&mut self) -> Result<(), EngineError> {
        const OPERATION: &str = "packet receipt";
        let timeout = self.config.receipt_timeout;
        let deadline = Instant::now() + timeout;

        match self.next_notification(OPERATION, timeout, deadline).await? {
            Notification::PacketReceipt { bytes_received } => {
                self.record_receipt(bytes_received)?;
                if bytes_received != self.session.bytes_sent {
                    return Err(EngineError::ReceiptMismatch {
                        expected: self.session.bytes_sent,
                        reported: bytes_received,
                    });
                }
                self.session.window.acknowledge();
                Ok(())
            }
            Notification::Response { request, status }
                if request == DfuOpcode::ReceiveFirmwareImage as u8 && status != SUCCESS =>
            {
                Err(EngineError::CommandRejected {
                    operation: DfuOpcode::ReceiveFirmwareImage.name(),
                    status,
                })
            }
            Notification::Response { request, .. } => Err(EngineError::ProtocolViolation {
                reason: format!("response to {} during transfer", describe_opcode(request)),
            }),
        }
    }

    /// Check a cumulative receipt count against what was sent and seen before.
    fn record_receipt(&mut self, bytes_received: u32) -> Result<(), EngineError> {
        let session = &mut self.session;
        if bytes_received < session.bytes_acked_high_water {
            return Err(EngineError::ProtocolViolation {
                reason: format!(
                    "receipt count went backwards: {} after {}",
                    bytes_received, session.bytes_acked_high_water
                ),
            });
        }
        if bytes_received > session.bytes_sent {
            return Err(EngineError::ProtocolViolation {
                reason: format!(
                    "receipt reports {} bytes but only {} were sent",
                    bytes_received, session.bytes_sent
                ),
            });
        }
        session.bytes_acked_high_water = bytes_received;
        tracing::trace!(bytes_received, "Packet receipt");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    async fn write_control(&self, command: ControlCommand) -> Result<(), EngineError> {
        let link = self.link.as_ref().ok_or(EngineError::Disconnected {
            operation: command.opcode().name(),
        })?;
        let bytes = command.encode();
        tracing::trace!(data = ?bytes, ">> control point");
        link.connection
            .write(DFU_CONTROL_POINT_UUID, &bytes, true)
            .await
            .map_err(EngineError::TransportWriteFailure)
    }

    async fn write_packet(&self, data: &[u8]) -> Result<(), EngineError> {
        let link = self.link.as_ref().ok_or(EngineError::Disconnected {
            operation: "packet write",
        })?;
        link.connection
            .write(DFU_PACKET_UUID, data, false)
            .await
            .map_err(EngineError::TransportWriteFailure)
    }

    async fn pause(&self, duration: Duration) -> Result<(), EngineError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(EngineError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    fn transition(&mut self, to: DfuState) {
        let from = self.session.state;
        if from == to {
            return;
        }
        self.session.state = to;
        tracing::debug!(from = %from, to = %to, "DFU state");
        self.observer.on_event(&DfuEvent::StateChanged { from, to });
    }

    fn log(&self, level: LogLevel, message: String) {
        self.observer.on_event(&DfuEvent::Log { level, message });
    }
}
