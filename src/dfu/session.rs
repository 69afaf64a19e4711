//! Session orchestration: package, target, engine.
//!
//! `DfuUpdater` is the entry point for CLI and GUI callers. It loads the
//! package, resolves one of the given targets (directly by address or by
//! scanning), runs the protocol engine over every image and reports the
//! outcome. It holds no protocol state of its own.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::config::{DfuImageType, DIRECT_CONNECT_TIMEOUT};
use super::device::{DeviceScanner, ResolvedDevice, TargetSpec};
use super::error::{DfuError, DfuFailure, ScannerError};
use super::events::{DfuEvent, DfuObserver, DfuState, TracingObserver};
use super::firmware_reader::{load_package, read_firmware_zip, FirmwarePackage};
use super::protocol::DfuEngine;
use super::transport::BleTransport;
use crate::settings::DfuConfig;

/// Outcome of one transferred image.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageReport {
    pub index: usize,
    pub image_type: DfuImageType,
    pub bytes: u32,
    /// Attempts it took, including the successful one.
    pub attempts: u32,
}

/// Summary of a successful update run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionReport {
    /// Device that was updated (the bootloader identity after a jump).
    pub device: ResolvedDevice,
    /// Index of the `TargetSpec` that matched.
    pub target_index: usize,
    pub images: Vec<ImageReport>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SessionReport {
    pub fn total_bytes(&self) -> u64 {
        self.images.iter().map(|image| image.bytes as u64).sum()
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

/// Firmware updater over a BLE transport.
pub struct DfuUpdater<T: BleTransport> {
    transport: T,
    config: DfuConfig,
    observer: Arc<dyn DfuObserver>,
    cancel: CancellationToken,
}

impl<T: BleTransport> DfuUpdater<T> {
    /// Create an updater that logs its events through `tracing`.
    pub fn new(transport: T, config: DfuConfig) -> Self {
        let observer: Arc<dyn DfuObserver> =
            Arc::new(TracingObserver::new(config.verbose_logging));
        Self {
            transport,
            config,
            observer,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn DfuObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Token that aborts scanning, transfers and retry pauses when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &DfuConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Update from a firmware package on disk.
    pub async fn update_from_file<P: AsRef<Path>>(
        &self,
        path: P,
        targets: &[TargetSpec],
    ) -> Result<SessionReport, DfuFailure> {
        let package = read_firmware_zip(path)
            .map_err(|e| self.fail(DfuFailure::before_transfer(e, DfuState::Idle, 0)))?;
        self.update(&package, targets).await
    }

    /// Update from firmware package bytes.
    ///
    /// A package that does not load fails before any device interaction.
    pub async fn update_from_archive(
        &self,
        archive: &[u8],
        targets: &[TargetSpec],
    ) -> Result<SessionReport, DfuFailure> {
        let package = load_package(archive)
            .map_err(|e| self.fail(DfuFailure::before_transfer(e, DfuState::Idle, 0)))?;
        self.update(&package, targets).await
    }

    /// Resolve the first matching target and transfer every image to it.
    pub async fn update(
        &self,
        package: &FirmwarePackage,
        targets: &[TargetSpec],
    ) -> Result<SessionReport, DfuFailure> {
        let started_at = Utc::now();

        self.config
            .validate()
            .map_err(|e| self.fail(DfuFailure::before_transfer(e, DfuState::Idle, 0)))?;
        if targets.is_empty() {
            let error = DfuError::InvalidConfig {
                reason: "no target given".to_string(),
            };
            return Err(self.fail(DfuFailure::before_transfer(error, DfuState::Idle, 0)));
        }

        self.observer.on_event(&DfuEvent::PackageLoaded {
            images: package.images().len(),
            total_bytes: package.total_bytes(),
            sha256: package.sha256.clone(),
        });

        let (target_index, device, connection) = self
            .resolve_target(targets)
            .await
            .map_err(|(error, attempts)| {
                self.fail(DfuFailure::before_transfer(error, DfuState::Idle, attempts))
            })?;

        let mut engine = DfuEngine::new(
            &self.transport,
            &self.config,
            &*self.observer,
            self.cancel.clone(),
            device,
        );
        if let Some(connection) = connection {
            // The engine connects on its own if the handover fails
            if let Err(e) = engine.attach(connection).await {
                tracing::warn!("Could not use direct connection: {}", e);
            }
        }

        let images = engine.run(package).await.map_err(|failure| self.fail(failure))?;

        let report = SessionReport {
            device: engine.device().clone(),
            target_index,
            images,
            started_at,
            finished_at: Utc::now(),
        };
        tracing::info!(
            address = %report.device.address,
            bytes = report.total_bytes(),
            elapsed_ms = report.duration().num_milliseconds(),
            "DFU session complete"
        );
        self.observer.on_event(&DfuEvent::Complete);
        Ok(report)
    }

    /// Pick a device, connecting directly when an identifier is an address.
    async fn resolve_target(
        &self,
        targets: &[TargetSpec],
    ) -> Result<(usize, ResolvedDevice, Option<T::Connection>), (DfuError, u32)> {
        for (index, target) in targets.iter().enumerate() {
            for address in target.direct_addresses() {
                let device = ResolvedDevice::from_address(address);
                if let Some(connection) = self
                    .connect_direct(&device.address)
                    .await
                    .map_err(|e| (e, 0))?
                {
                    self.observer.on_event(&DfuEvent::DeviceResolved {
                        device: device.clone(),
                    });
                    return Ok((index, device, Some(connection)));
                }
            }
        }

        let scanner = DeviceScanner::new(&self.transport, &*self.observer, self.cancel.clone());
        let max_attempts = self.config.max_attempts();
        let mut attempts = 0;

        loop {
            attempts += 1;
            let error = match scanner.resolve_any(targets).await {
                Ok((index, device)) => return Ok((index, device, None)),
                Err(e) => DfuError::from(e),
            };

            if !error.is_retriable() || attempts >= max_attempts {
                return Err((error, attempts));
            }

            self.observer.on_event(&DfuEvent::RetryScheduled {
                attempt: attempts,
                max_attempts,
                error_code: error.error_code(),
                message: error.to_string(),
            });

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return Err((ScannerError::Cancelled.into(), attempts));
                }
                _ = tokio::time::sleep(self.config.retry_backoff) => {}
            }
        }
    }

    /// Try one connect without scanning. `None` means fall back to a scan.
    async fn connect_direct(&self, address: &str) -> Result<Option<T::Connection>, DfuError> {
        tracing::debug!(address, "Trying direct connection");
        let connecting = tokio::time::timeout(DIRECT_CONNECT_TIMEOUT, self.transport.connect(address));

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(ScannerError::Cancelled.into()),
            result = connecting => result,
        };

        match result {
            Ok(Ok(connection)) => Ok(Some(connection)),
            Ok(Err(e)) => {
                tracing::debug!(address, "Direct connection failed: {}", e);
                Ok(None)
            }
            Err(_) => {
                tracing::debug!(address, "Direct connection timed out");
                Ok(None)
            }
        }
    }

    /// Report a failure to the observer and hand it back.
    fn fail(&self, failure: DfuFailure) -> DfuFailure {
        if let Some(hint) = failure.hint() {
            tracing::info!("Hint: {}", hint);
        }
        self.observer.on_event(&DfuEvent::Failed {
            kind: failure.kind(),
            image_index: failure.image_index,
            attempts: failure.attempts,
            message: failure.to_string(),
        });
        failure
    }
}
