//! Wireless transport abstraction.
//!
//! The manager drives a [`Transport`] with fire-and-forget calls and learns
//! about every outcome through [`TransportEvent`]s pushed into an
//! [`EventSink`]. Providers run their I/O on their own tasks; the manager
//! never awaits a transport call.

#[cfg(feature = "bluer")]
pub mod bluer;

use crate::beacon::Advertisement;
use crate::device_id::DeviceId;
use crate::signal::Rssi;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Error type for transport setup.
///
/// Failures of individual operations are reported as events, never as errors.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Bluetooth/adapter related error
    #[error("Bluetooth error: {0}")]
    Bluetooth(String),
    /// Backend not compiled in
    #[error("Backend '{0}' not available (not compiled in)")]
    BackendNotAvailable(String),
}

/// Why a link went down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The link was closed through [`Transport::cancel_connection`].
    Requested,
    /// The peer went away or the link dropped.
    LinkLost,
    /// A connect attempt did not succeed.
    ConnectionFailed,
}

/// A characteristic reported during service discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub uuid: Uuid,
    pub characteristics: Vec<Uuid>,
}

/// Everything a transport reports back to the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    PowerStateChanged {
        ready: bool,
    },
    DeviceDiscovered {
        id: DeviceId,
        raw_signal: Rssi,
        advertisement: Advertisement,
    },
    DeviceConnected {
        id: DeviceId,
    },
    DeviceDisconnected {
        id: DeviceId,
        reason: DisconnectReason,
    },
    ServicesDiscovered {
        id: DeviceId,
        services: Vec<ServiceInfo>,
    },
    AttributeValueUpdated {
        id: DeviceId,
        attribute: Uuid,
        value: Vec<u8>,
    },
    WriteAcknowledged {
        id: DeviceId,
        attribute: Uuid,
        error: Option<String>,
    },
    SignalStrengthRead {
        id: DeviceId,
        signal: Rssi,
    },
}

/// Receiving half of a transport event channel.
pub type EventStream = mpsc::UnboundedReceiver<TransportEvent>;

/// Sending half of a transport event channel, held by the provider.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl EventSink {
    /// Push an event. Returns `false` once the manager has gone away.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Create a connected sink/stream pair.
pub fn channel() -> (EventSink, EventStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSink { tx }, rx)
}

/// Operations the manager issues against the radio.
///
/// All calls return immediately. Results, including failures, arrive later
/// as [`TransportEvent`]s.
pub trait Transport: Send {
    /// Scan for devices advertising `service`.
    fn start_scan(&mut self, service: Uuid);

    fn stop_scan(&mut self);

    /// Connect to a device. Reports `DeviceConnected`, or `DeviceDisconnected`
    /// with [`DisconnectReason::ConnectionFailed`].
    fn connect(&mut self, device: DeviceId);

    /// Abort a pending connect or close an open link. Reports
    /// `DeviceDisconnected` with [`DisconnectReason::Requested`].
    fn cancel_connection(&mut self, device: DeviceId);

    /// Enumerate services and their characteristics.
    fn discover_services(&mut self, device: DeviceId);

    fn read_value(&mut self, device: DeviceId, attribute: Uuid);

    fn write_value(&mut self, device: DeviceId, attribute: Uuid, value: Vec<u8>);

    /// Enable notifications. Each notification arrives as `AttributeValueUpdated`.
    fn subscribe(&mut self, device: DeviceId, attribute: Uuid);

    fn read_signal_strength(&mut self, device: DeviceId);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TEST_ID;

    #[tokio::test]
    async fn test_sink_delivers_in_order() {
        let (sink, mut stream) = channel();
        assert!(sink.emit(TransportEvent::PowerStateChanged { ready: true }));
        assert!(sink.emit(TransportEvent::DeviceConnected { id: TEST_ID }));

        assert_eq!(
            stream.recv().await,
            Some(TransportEvent::PowerStateChanged { ready: true })
        );
        assert_eq!(
            stream.recv().await,
            Some(TransportEvent::DeviceConnected { id: TEST_ID })
        );
    }

    #[test]
    fn test_sink_reports_closed_stream() {
        let (sink, stream) = channel();
        drop(stream);
        assert!(sink.is_closed());
        assert!(!sink.emit(TransportEvent::PowerStateChanged { ready: false }));
    }
}
