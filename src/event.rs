//! Notifications fanned out to listeners.

use crate::attribute::{Attribute, AttributeValue};
use crate::beacon::BeaconRecord;
use crate::device_id::DeviceId;
use crate::signal::Rssi;
use std::fmt;

/// Global scan posture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiscoveryState {
    /// The radio is off or unavailable.
    #[default]
    NotReady,
    Inactive,
    Scanning,
}

impl fmt::Display for DiscoveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryState::NotReady => write!(f, "not_ready"),
            DiscoveryState::Inactive => write!(f, "inactive"),
            DiscoveryState::Scanning => write!(f, "scanning"),
        }
    }
}

/// A connection transition of one beacon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Attribute discovery finished; the beacon is ready for use.
    Connect,
    /// The beacon acknowledged a user disconnect and the link is being torn down.
    PendingUserDisconnect,
    Disconnect,
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionEvent::Connect => write!(f, "connect"),
            ConnectionEvent::PendingUserDisconnect => write!(f, "pending_user_disconnect"),
            ConnectionEvent::Disconnect => write!(f, "disconnect"),
        }
    }
}

/// Everything a listener can observe, in the order it happened.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    DiscoveryStateChanged {
        old: DiscoveryState,
        new: DiscoveryState,
    },
    Connection {
        event: ConnectionEvent,
        /// Snapshot of the record at the time of the transition.
        beacon: BeaconRecord,
    },
    /// Polled signal strength of a connected beacon.
    SignalStrength { device: DeviceId, signal: Rssi },
    Value {
        device: DeviceId,
        value: AttributeValue,
    },
    WriteCompleted {
        device: DeviceId,
        attribute: Attribute,
        error: Option<String>,
    },
    /// A sticky beacon did not come back within the reconnect window.
    ReconnectTimedOut { device: DeviceId },
}

impl Event {
    /// The beacon this event concerns, if any.
    pub fn device(&self) -> Option<DeviceId> {
        match self {
            Event::DiscoveryStateChanged { .. } => None,
            Event::Connection { beacon, .. } => Some(beacon.id()),
            Event::SignalStrength { device, .. }
            | Event::Value { device, .. }
            | Event::WriteCompleted { device, .. }
            | Event::ReconnectTimedOut { device } => Some(*device),
        }
    }
}
