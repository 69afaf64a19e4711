//! Device discovery for DFU targets.
//!
//! Resolves peripherals from BLE advertisements by name, address or
//! advertised service. A device's stable identity is its address, kept in
//! uppercase for MACs; names and services only decide whether an
//! advertisement is included while scanning, since the bootloader usually
//! advertises under a different name than the application.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::config::{DEFAULT_SCAN_TIMEOUT, DFU_SERVICE_UUID};
use super::error::ScannerError;
use super::events::{DfuEvent, DfuObserver};
use super::transport::{Advertisement, BleTransport};
use crate::settings::DfuConfig;

/// A peripheral picked from advertisements, keyed by address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedDevice {
    pub address: String,
    /// Name the device advertised when it was resolved.
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

impl ResolvedDevice {
    /// Device known only by address (direct connection without a scan).
    pub fn from_address(address: &str) -> Self {
        Self {
            address: canonical_address(address),
            name: None,
            rssi: None,
        }
    }

    /// Get a display label for this device.
    pub fn display_label(&self) -> String {
        match (&self.name, self.rssi) {
            (Some(name), Some(rssi)) => format!("{} ({}, {} dBm)", name, self.address, rssi),
            (Some(name), None) => format!("{} ({})", name, self.address),
            (None, _) => self.address.clone(),
        }
    }

    /// Identifiers under which this device shows up in bootloader mode.
    ///
    /// The address stays the reliable key; SDK bootloaders also commonly
    /// advertise on the application address plus one. Any device
    /// advertising the DFU service matches as well.
    pub fn bootloader_target(&self, config: &DfuConfig, include_name: bool) -> TargetSpec {
        let mut identifiers = vec![self.address.clone(), config.bootloader_name.clone()];
        if let Some(hint) = bootloader_address_hint(&self.address) {
            identifiers.push(hint);
        }
        if include_name {
            identifiers.extend(self.name.clone());
        }
        TargetSpec::new(identifiers)
            .scan_timeout(config.scan_timeout)
            .force_scan(true)
            .wait(config.wait)
            .service(DFU_SERVICE_UUID)
    }
}

impl From<Advertisement> for ResolvedDevice {
    fn from(advertisement: Advertisement) -> Self {
        Self {
            address: canonical_address(&advertisement.address),
            name: advertisement.name,
            rssi: advertisement.rssi,
        }
    }
}

/// One scan request: which devices count as the target and how long to look.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetSpec {
    /// Advertised names and/or addresses, matched exactly.
    pub identifiers: BTreeSet<String>,
    /// Advertised service UUIDs that also identify the target.
    pub services: BTreeSet<Uuid>,
    /// Always scan, even when an identifier is an address.
    pub force_scan: bool,
    /// Length of one scan window.
    pub scan_timeout: Duration,
    /// Keep scanning window after window until found or cancelled.
    pub wait: bool,
}

impl TargetSpec {
    pub fn new<I, S>(identifiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            identifiers: identifiers.into_iter().map(Into::into).collect(),
            services: BTreeSet::new(),
            force_scan: false,
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
            wait: false,
        }
    }

    /// Target with scan behaviour taken from the engine configuration.
    pub fn from_config<I, S>(identifiers: I, config: &DfuConfig) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(identifiers)
            .force_scan(config.force_scan)
            .scan_timeout(config.scan_timeout)
            .wait(config.wait)
    }

    pub fn force_scan(mut self, force_scan: bool) -> Self {
        self.force_scan = force_scan;
        self
    }

    pub fn scan_timeout(mut self, scan_timeout: Duration) -> Self {
        self.scan_timeout = scan_timeout;
        self
    }

    pub fn wait(mut self, wait: bool) -> Self {
        self.wait = wait;
        self
    }

    /// Also match any device advertising `uuid`.
    pub fn service(mut self, uuid: Uuid) -> Self {
        self.services.insert(uuid);
        self
    }

    /// Whether an advertisement's address or name is one of the identifiers,
    /// or it advertises one of the target services.
    pub fn matches(&self, advertisement: &Advertisement) -> bool {
        self.identifiers.contains(&advertisement.address)
            || advertisement
                .name
                .as_ref()
                .is_some_and(|name| self.identifiers.contains(name))
            || advertisement
                .services
                .iter()
                .any(|uuid| self.services.contains(uuid))
    }

    /// Identifiers that can be connected to without scanning first.
    pub fn direct_addresses(&self) -> Vec<&str> {
        if self.force_scan {
            return Vec::new();
        }
        self.identifiers
            .iter()
            .map(String::as_str)
            .filter(|identifier| is_address_like(identifier))
            .collect()
    }
}

/// Whether an identifier looks like a MAC address or a platform UUID.
pub fn is_address_like(identifier: &str) -> bool {
    is_mac_address(identifier) || Uuid::parse_str(identifier).is_ok()
}

fn is_mac_address(identifier: &str) -> bool {
    let octets: Vec<&str> = identifier.split(':').collect();
    octets.len() == 6
        && octets
            .iter()
            .all(|octet| octet.len() == 2 && octet.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Uppercase form of a MAC address; platform UUIDs are returned unchanged.
pub fn canonical_address(address: &str) -> String {
    if is_mac_address(address) {
        address.to_ascii_uppercase()
    } else {
        address.to_string()
    }
}

/// Uppercase MAC address with the last octet incremented (wrapping).
pub fn bootloader_address_hint(address: &str) -> Option<String> {
    if !is_mac_address(address) {
        return None;
    }
    let (prefix, last) = address.split_at(address.len() - 2);
    let last = u8::from_str_radix(last, 16).ok()?;
    Some(format!("{}{:02X}", prefix.to_ascii_uppercase(), last.wrapping_add(1)))
}

/// How a scan decides it is done.
struct ScanPlan<'s> {
    targets: &'s [TargetSpec],
    window: Duration,
    /// Return on the first match instead of ranking a whole window.
    first_match: bool,
    /// Start another window when one closes empty.
    repeat: bool,
    /// Upper bound over all windows.
    deadline: Option<Duration>,
}

impl ScanPlan<'_> {
    fn match_index(&self, advertisement: &Advertisement) -> Option<usize> {
        self.targets
            .iter()
            .position(|target| target.matches(advertisement))
    }

    fn identifiers(&self) -> Vec<String> {
        self.targets
            .iter()
            .flat_map(|target| {
                let services = target.services.iter().map(|uuid| format!("service {}", uuid));
                target.identifiers.iter().cloned().chain(services)
            })
            .collect()
    }
}

/// Resolves targets from advertisement reports.
pub struct DeviceScanner<'a, T: BleTransport> {
    transport: &'a T,
    observer: &'a dyn DfuObserver,
    cancel: CancellationToken,
}

impl<'a, T: BleTransport> DeviceScanner<'a, T> {
    pub fn new(transport: &'a T, observer: &'a dyn DfuObserver, cancel: CancellationToken) -> Self {
        Self {
            transport,
            observer,
            cancel,
        }
    }

    /// Resolve one target.
    ///
    /// In wait mode the first matching advertisement wins and windows repeat
    /// until cancelled. Otherwise one window of `scan_timeout` is observed
    /// and the strongest match is picked.
    pub async fn resolve(&self, target: &TargetSpec) -> Result<ResolvedDevice, ScannerError> {
        self.resolve_any(std::slice::from_ref(target))
            .await
            .map(|(_, device)| device)
    }

    /// Resolve whichever of several targets is advertising.
    ///
    /// The lowest-index target with any match wins, the strongest RSSI
    /// within it. Returns the index of the winning target.
    pub async fn resolve_any(
        &self,
        targets: &[TargetSpec],
    ) -> Result<(usize, ResolvedDevice), ScannerError> {
        let wait = targets.iter().any(|target| target.wait);
        let window = targets
            .iter()
            .map(|target| target.scan_timeout)
            .max()
            .unwrap_or(DEFAULT_SCAN_TIMEOUT);

        self.scan(ScanPlan {
            targets,
            window,
            first_match: wait,
            repeat: wait,
            deadline: None,
        })
        .await
    }

    /// Find one specific device, taking the first matching advertisement.
    ///
    /// Windows of `target.scan_timeout` repeat until `deadline` passes, or
    /// until cancelled when there is no deadline.
    pub async fn resolve_one(
        &self,
        target: &TargetSpec,
        deadline: Option<Duration>,
    ) -> Result<ResolvedDevice, ScannerError> {
        self.scan(ScanPlan {
            targets: std::slice::from_ref(target),
            window: target.scan_timeout,
            first_match: true,
            repeat: true,
            deadline,
        })
        .await
        .map(|(_, device)| device)
    }

    async fn scan(&self, plan: ScanPlan<'_>) -> Result<(usize, ResolvedDevice), ScannerError> {
        if self.cancel.is_cancelled() {
            return Err(ScannerError::Cancelled);
        }

        self.observer.on_event(&DfuEvent::ScanStarted {
            identifiers: plan.identifiers(),
        });

        let mut adverts = self
            .transport
            .start_scan()
            .await
            .map_err(ScannerError::Transport)?;

        let result = self.observe(&mut adverts, &plan).await;

        // Scan activity is torn down on every exit path
        drop(adverts);
        if let Err(e) = self.transport.stop_scan().await {
            tracing::warn!("Failed to stop scan: {}", e);
        }

        let (index, device) = result?;
        tracing::debug!(address = %device.address, rssi = ?device.rssi, "Resolved device");
        self.observer.on_event(&DfuEvent::DeviceResolved {
            device: device.clone(),
        });
        Ok((index, device))
    }

    async fn observe(
        &self,
        adverts: &mut mpsc::Receiver<Advertisement>,
        plan: &ScanPlan<'_>,
    ) -> Result<(usize, ResolvedDevice), ScannerError> {
        let overall_deadline = plan.deadline.map(|deadline| Instant::now() + deadline);
        let mut open = true;
        let mut window = 0u32;

        loop {
            window += 1;
            let mut window_end = Instant::now() + plan.window;
            if let Some(overall) = overall_deadline {
                window_end = window_end.min(overall);
            }

            // Last advertisement per address within this window
            let mut seen: HashMap<String, (usize, Advertisement)> = HashMap::new();

            loop {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(ScannerError::Cancelled),
                    _ = tokio::time::sleep_until(window_end) => break,
                    report = adverts.recv(), if open => match report {
                        Some(advertisement) => {
                            let Some(index) = plan.match_index(&advertisement) else {
                                continue;
                            };
                            tracing::trace!(
                                address = %advertisement.address,
                                name = ?advertisement.name,
                                rssi = ?advertisement.rssi,
                                "Matching advertisement"
                            );
                            if plan.first_match {
                                return Ok((index, advertisement.into()));
                            }
                            seen.insert(advertisement.address.clone(), (index, advertisement));
                        }
                        None => open = false,
                    },
                }
            }

            if let Some((index, advertisement)) = pick_best(seen) {
                return Ok((index, advertisement.into()));
            }

            self.observer
                .on_event(&DfuEvent::ScanWindowElapsed { window });

            let expired = overall_deadline.is_some_and(|overall| Instant::now() >= overall);
            if !plan.repeat || expired {
                return Err(ScannerError::NotFound {
                    identifiers: plan.identifiers().join(", "),
                });
            }
        }
    }
}

/// Lowest target index first, then strongest signal. Missing RSSI ranks last.
fn pick_best(seen: HashMap<String, (usize, Advertisement)>) -> Option<(usize, Advertisement)> {
    seen.into_values()
        .min_by(|(a_index, a), (b_index, b)| a_index.cmp(b_index).then_with(|| b.rssi.cmp(&a.rssi)))
}
