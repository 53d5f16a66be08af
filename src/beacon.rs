//! Beacon records: the per-device state tracked while scanning and connected.

use crate::device_id::DeviceId;
use crate::signal::{self, RSSI_UNAVAILABLE, Rssi};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Length of a manufacturer payload that carries a manufacturer identifier.
const MANUFACTURER_PAYLOAD_LEN: usize = 8;

/// Advertisement fields reported alongside a discovery sample.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Advertisement {
    /// Local name, if advertised.
    pub name: Option<String>,
    /// Manufacturer-specific payload including the company identifier bytes.
    pub manufacturer_data: Option<Vec<u8>>,
}

/// Terminal classification reported by the beacon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TerminalKind {
    Remote,
    Kiosk,
    CardReader,
    #[default]
    Unknown,
}

impl TerminalKind {
    /// Classify a device-reported string by its prefix.
    pub fn from_reported(value: &str) -> Self {
        if value.starts_with("REMOTE") {
            TerminalKind::Remote
        } else if value.starts_with("KIOSK") {
            TerminalKind::Kiosk
        } else if value.starts_with("CARDREADER") {
            TerminalKind::CardReader
        } else {
            TerminalKind::Unknown
        }
    }
}

impl fmt::Display for TerminalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminalKind::Remote => write!(f, "remote"),
            TerminalKind::Kiosk => write!(f, "kiosk"),
            TerminalKind::CardReader => write!(f, "card_reader"),
            TerminalKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// One observed beacon.
///
/// Records are owned by exactly one of the manager's sets at a time; values
/// handed to listeners are snapshots.
#[derive(Debug, Clone)]
pub struct BeaconRecord {
    id: DeviceId,
    /// Latest raw signal sample.
    pub raw_signal: Rssi,
    /// Smoothed signal used for threshold decisions.
    pub filtered_signal: Rssi,
    pub first_seen_at: Instant,
    pub last_seen_at: Instant,
    /// Gap between the two most recent discovery samples.
    pub elapsed_since_last_seen: Duration,
    pub advertised_name: Option<String>,
    pub manufacturer_payload: Option<Vec<u8>>,
    /// Bytes 1..7 of an 8-byte manufacturer payload.
    pub manufacturer_id: Option<[u8; 6]>,
    pub terminal_kind: TerminalKind,
    pub wants_sticky_connection: bool,
    pub attribute_discovery_complete: bool,
    /// Set while the beacon sits below the auto-disconnect threshold.
    pub auto_disconnect_deadline: Option<Instant>,
}

impl BeaconRecord {
    /// Create a record for a device observed for the first time at `now`.
    pub fn new(id: DeviceId, now: Instant) -> Self {
        Self {
            id,
            raw_signal: RSSI_UNAVAILABLE,
            filtered_signal: RSSI_UNAVAILABLE,
            first_seen_at: now,
            last_seen_at: now,
            elapsed_since_last_seen: Duration::ZERO,
            advertised_name: None,
            manufacturer_payload: None,
            manufacturer_id: None,
            terminal_kind: TerminalKind::Unknown,
            wants_sticky_connection: false,
            attribute_discovery_complete: false,
            auto_disconnect_deadline: None,
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// Fold a discovery sample into the record.
    pub fn on_discovered(&mut self, raw: Rssi, advertisement: &Advertisement, now: Instant) {
        if self.raw_signal != RSSI_UNAVAILABLE {
            self.elapsed_since_last_seen = now.saturating_duration_since(self.last_seen_at);
        }
        self.last_seen_at = now;
        self.filtered_signal =
            signal::filter(self.filtered_signal, raw, self.elapsed_since_last_seen);
        self.raw_signal = raw;

        self.advertised_name = advertisement.name.clone();
        self.manufacturer_payload = advertisement.manufacturer_data.clone();
        self.manufacturer_id = match advertisement.manufacturer_data.as_deref() {
            Some(data) if data.len() == MANUFACTURER_PAYLOAD_LEN => {
                let mut id = [0u8; 6];
                id.copy_from_slice(&data[1..7]);
                Some(id)
            }
            Some(data) => {
                debug!(
                    device = %self.id,
                    len = data.len(),
                    "manufacturer payload length mismatch"
                );
                None
            }
            None => None,
        };
    }

    /// Record a signal sample polled while connected.
    ///
    /// Polled samples arrive at a fixed interval and are not filtered.
    pub fn on_connected_signal_sample(&mut self, raw: Rssi) {
        self.raw_signal = raw;
        self.filtered_signal = raw;
    }
}

impl PartialEq for BeaconRecord {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for BeaconRecord {}
