//! `beacon-link` library.
//!
//! Discovers card-reader beacons over Bluetooth LE, connects to them when
//! they come close, tracks their signal while connected and disconnects or
//! reconnects them according to persisted thresholds.
//!
//! The binary (`src/main.rs`) is responsible for CLI parsing and process exit codes.
//! Everything stateful lives behind [`BeaconManager`], which runs as a single
//! task fed by a [`Transport`](transport::Transport) so it can be tested
//! deterministically with an injected fake radio.

pub mod app;
pub mod attribute;
pub mod beacon;
pub mod card_data;
pub mod connection;
pub mod device_id;
pub mod discovery;
pub mod event;
pub mod listener;
pub mod manager;
pub mod output;
pub mod scheduler;
pub mod settings;
pub mod signal;
pub mod transport;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types at the crate root
pub use attribute::{Attribute, AttributeValue, RfPowerLevel};
pub use beacon::{Advertisement, BeaconRecord, TerminalKind};
pub use card_data::{CardDataError, SentinelMode};
pub use connection::WriteError;
pub use device_id::DeviceId;
pub use event::{ConnectionEvent, DiscoveryState, Event};
pub use listener::{ChannelListener, Listener, SubscriptionId};
pub use manager::{BeaconManager, ManagerError};
pub use output::OutputFormatter;
pub use output::logfmt::LogfmtFormatter;
pub use settings::{FileSettings, MemorySettings, Settings, SettingsStore, parse_duration};
pub use signal::Rssi;
