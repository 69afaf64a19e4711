//! Progress events for UI decoupling.
//!
//! The engine, scanner and orchestrator report what they do as `DfuEvent`s
//! handed to a `DfuObserver`. Consumers (CLI, GUI) subscribe by supplying an
//! observer; nothing in the core needs to be polled.

use std::fmt;

use serde::Serialize;
use tokio::sync::mpsc;

#[cfg(test)]
use mockall::automock;

use super::config::DfuImageType;
use super::device::ResolvedDevice;
use super::error::ErrorKind;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Protocol engine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DfuState {
    Idle,
    AwaitingButtonlessJump,
    Reconnecting,
    SendingInit,
    SendingFirmware,
    AwaitingValidation,
    Activating,
    Complete,
    Failed,
}

impl DfuState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DfuState::Complete | DfuState::Failed)
    }
}

impl fmt::Display for DfuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DfuState::Idle => write!(f, "Idle"),
            DfuState::AwaitingButtonlessJump => write!(f, "Awaiting Buttonless Jump"),
            DfuState::Reconnecting => write!(f, "Reconnecting"),
            DfuState::SendingInit => write!(f, "Sending Init"),
            DfuState::SendingFirmware => write!(f, "Sending Firmware"),
            DfuState::AwaitingValidation => write!(f, "Awaiting Validation"),
            DfuState::Activating => write!(f, "Activating"),
            DfuState::Complete => write!(f, "Complete"),
            DfuState::Failed => write!(f, "Failed"),
        }
    }
}

/// Events emitted during an update run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum DfuEvent {
    /// Firmware package parsed.
    PackageLoaded {
        images: usize,
        total_bytes: u64,
        sha256: String,
    },
    /// Advertisement scan started for these identifiers.
    ScanStarted { identifiers: Vec<String> },
    /// A scan window closed without a usable match.
    ScanWindowElapsed { window: u32 },
    /// A target was picked from advertisements (or connected directly).
    DeviceResolved { device: ResolvedDevice },
    /// Engine state changed.
    StateChanged { from: DfuState, to: DfuState },
    /// DFU version read from the device.
    DfuVersion { major: u8, minor: u8 },
    /// Bytes of the current image written to the packet characteristic.
    Progress {
        image_index: usize,
        image_type: DfuImageType,
        sent: u32,
        total: u32,
    },
    /// An image was validated by the bootloader.
    ImageComplete {
        image_index: usize,
        image_type: DfuImageType,
    },
    /// A retryable failure; another attempt follows.
    RetryScheduled {
        attempt: u32,
        max_attempts: u32,
        error_code: &'static str,
        message: String,
    },
    /// Debug log message.
    Log { level: LogLevel, message: String },
    /// All images transferred and activated.
    Complete,
    /// The run ended in failure.
    Failed {
        kind: ErrorKind,
        image_index: Option<usize>,
        attempts: u32,
        message: String,
    },
}

impl DfuEvent {
    /// Transfer percentage for progress events.
    pub fn percent(&self) -> Option<f32> {
        match self {
            DfuEvent::Progress { sent, total, .. } if *total > 0 => {
                Some(*sent as f32 / *total as f32 * 100.0)
            }
            DfuEvent::Progress { .. } => Some(0.0),
            _ => None,
        }
    }

    /// Get a human-readable message for this event.
    pub fn message(&self) -> String {
        match self {
            DfuEvent::PackageLoaded {
                images,
                total_bytes,
                ..
            } => format!("Firmware package: {} image(s), {} bytes", images, total_bytes),
            DfuEvent::ScanStarted { identifiers } => {
                format!("Scanning for {}...", identifiers.join(", "))
            }
            DfuEvent::ScanWindowElapsed { window } => {
                format!("No match in scan window {}", window)
            }
            DfuEvent::DeviceResolved { device } => format!("Found {}", device.display_label()),
            DfuEvent::StateChanged { to, .. } => format!("{}", to),
            DfuEvent::DfuVersion { major, minor } => format!("DFU version {}.{}", major, minor),
            DfuEvent::Progress {
                image_type,
                sent,
                total,
                ..
            } => {
                let percent = if *total == 0 {
                    0
                } else {
                    (*sent as u64 * 100) / *total as u64
                };
                format!("Uploading {}... {}%", image_type.label(), percent)
            }
            DfuEvent::ImageComplete { image_type, .. } => {
                format!("{} image validated", image_type.label())
            }
            DfuEvent::RetryScheduled {
                attempt,
                max_attempts,
                message,
                ..
            } => format!("Attempt {}/{} failed: {}", attempt, max_attempts, message),
            DfuEvent::Log { message, .. } => message.clone(),
            DfuEvent::Complete => "Update complete!".into(),
            DfuEvent::Failed { message, .. } => format!("Update failed: {}", message),
        }
    }
}

/// Observer trait for receiving DFU events.
///
/// Implement this trait in your UI layer to receive updates.
#[cfg_attr(test, automock)]
pub trait DfuObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &DfuEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl DfuObserver for NullObserver {
    fn on_event(&self, _event: &DfuEvent) {}
}

/// Observer that logs events using tracing.
///
/// Debug-level log events and per-packet progress are only forwarded when
/// `verbose` is set.
#[derive(Debug, Default)]
pub struct TracingObserver {
    verbose: bool,
}

impl TracingObserver {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl DfuObserver for TracingObserver {
    fn on_event(&self, event: &DfuEvent) {
        match event {
            DfuEvent::StateChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "State changed");
            }
            DfuEvent::Progress { .. } => {
                if self.verbose {
                    tracing::debug!("{}", event.message());
                }
            }
            DfuEvent::Log { level, message } => match level {
                LogLevel::Trace | LogLevel::Debug if !self.verbose => {}
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            DfuEvent::RetryScheduled { error_code, .. } => {
                tracing::warn!(code = %error_code, "{}", event.message());
            }
            DfuEvent::Failed { kind, .. } => {
                tracing::error!(kind = ?kind, "{}", event.message());
            }
            _ => tracing::info!("{}", event.message()),
        }
    }
}

/// Observer that forwards events into a channel: the passive event stream.
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<DfuEvent>,
}

impl ChannelObserver {
    /// Create an observer and the receiving end of its stream.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DfuEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl DfuObserver for ChannelObserver {
    fn on_event(&self, event: &DfuEvent) {
        // A dropped receiver only means nobody is listening any more
        let _ = self.tx.send(event.clone());
    }
}
