use crate::attribute::{Attribute, BEACON_SERVICE};
use crate::device_id::DeviceId;
use crate::event::Event;
use crate::listener::Listener;
use crate::transport::{DisconnectReason, EventSink, ServiceInfo, Transport, TransportEvent};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI16, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// A stable device id for unit tests.
pub const TEST_ID: DeviceId = DeviceId([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

/// A second device id for multi-beacon tests.
pub const OTHER_ID: DeviceId = DeviceId([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);

/// A transport operation recorded by [`FakeTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    StartScan(Uuid),
    StopScan,
    Connect(DeviceId),
    CancelConnection(DeviceId),
    DiscoverServices(DeviceId),
    ReadValue(DeviceId, Attribute),
    WriteValue(DeviceId, Attribute, Vec<u8>),
    Subscribe(DeviceId, Attribute),
    ReadSignalStrength(DeviceId),
}

/// Shared view of the calls a [`FakeTransport`] received.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<Call>>>);

impl CallLog {
    fn push(&self, call: Call) {
        self.0.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.0.lock().unwrap().clone()
    }

    /// Return the recorded calls and forget them.
    pub fn take(&self) -> Vec<Call> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }

    pub fn count(&self, call: &Call) -> usize {
        self.0.lock().unwrap().iter().filter(|c| *c == call).count()
    }

    pub fn contains(&self, call: &Call) -> bool {
        self.count(call) > 0
    }
}

/// Answers transport calls the way a well-behaved beacon would.
pub struct SimulatedBeacon {
    sink: EventSink,
    values: HashMap<Attribute, Vec<u8>>,
    /// Signal strength returned by signal reads; tests may change it.
    pub signal: Arc<AtomicI16>,
}

impl SimulatedBeacon {
    pub fn new(sink: EventSink) -> Self {
        let values = HashMap::from([
            (Attribute::CardData, b"%B4111^DOE/J?\0".to_vec()),
            (Attribute::StickyConnect, vec![0]),
            (Attribute::TerminalKind, b"KIOSK-12".to_vec()),
            (Attribute::SerialNumber, b"SN-0001\0".to_vec()),
            (Attribute::Location, b"Bank 4\0".to_vec()),
            (Attribute::AssetNumber, 4242u32.to_le_bytes().to_vec()),
            (Attribute::Denomination, 25u32.to_le_bytes().to_vec()),
            (Attribute::LinkActive, vec![1]),
            (Attribute::RfPowerLevel, vec![2]),
        ]);
        Self {
            sink,
            values,
            signal: Arc::new(AtomicI16::new(-50)),
        }
    }

    pub fn with_value(mut self, attribute: Attribute, value: Vec<u8>) -> Self {
        self.values.insert(attribute, value);
        self
    }

    fn respond(&self, call: &Call) {
        let event = match call {
            Call::Connect(id) => TransportEvent::DeviceConnected { id: *id },
            Call::CancelConnection(id) => TransportEvent::DeviceDisconnected {
                id: *id,
                reason: DisconnectReason::Requested,
            },
            Call::DiscoverServices(id) => TransportEvent::ServicesDiscovered {
                id: *id,
                services: vec![catalogue_service()],
            },
            Call::ReadValue(id, attribute) => match self.values.get(attribute) {
                Some(value) => TransportEvent::AttributeValueUpdated {
                    id: *id,
                    attribute: attribute.uuid(),
                    value: value.clone(),
                },
                None => return,
            },
            Call::WriteValue(id, attribute, _) => TransportEvent::WriteAcknowledged {
                id: *id,
                attribute: attribute.uuid(),
                error: None,
            },
            Call::ReadSignalStrength(id) => TransportEvent::SignalStrengthRead {
                id: *id,
                signal: self.signal.load(Ordering::SeqCst),
            },
            Call::StartScan(_) | Call::StopScan | Call::Subscribe(..) => return,
        };
        self.sink.emit(event);
    }
}

/// The beacon service with every catalogued characteristic.
pub fn catalogue_service() -> ServiceInfo {
    ServiceInfo {
        uuid: BEACON_SERVICE,
        characteristics: Attribute::ALL.iter().map(|a| a.uuid()).collect(),
    }
}

/// A [`Transport`] that records every call and optionally answers it.
pub struct FakeTransport {
    log: CallLog,
    beacon: Option<SimulatedBeacon>,
}

impl FakeTransport {
    /// A transport that only records calls.
    pub fn new() -> (Self, CallLog) {
        let log = CallLog::default();
        (
            Self {
                log: log.clone(),
                beacon: None,
            },
            log,
        )
    }

    /// A transport whose calls are answered by `beacon`.
    pub fn responding(beacon: SimulatedBeacon) -> (Self, CallLog) {
        let (mut transport, log) = Self::new();
        transport.beacon = Some(beacon);
        (transport, log)
    }

    fn record(&mut self, call: Call) {
        if let Some(beacon) = &self.beacon {
            beacon.respond(&call);
        }
        self.log.push(call);
    }
}

fn attribute(uuid: Uuid) -> Attribute {
    Attribute::from_uuid(uuid).expect("fake transport used with uncatalogued attribute")
}

impl Transport for FakeTransport {
    fn start_scan(&mut self, service: Uuid) {
        self.record(Call::StartScan(service));
    }

    fn stop_scan(&mut self) {
        self.record(Call::StopScan);
    }

    fn connect(&mut self, device: DeviceId) {
        self.record(Call::Connect(device));
    }

    fn cancel_connection(&mut self, device: DeviceId) {
        self.record(Call::CancelConnection(device));
    }

    fn discover_services(&mut self, device: DeviceId) {
        self.record(Call::DiscoverServices(device));
    }

    fn read_value(&mut self, device: DeviceId, uuid: Uuid) {
        self.record(Call::ReadValue(device, attribute(uuid)));
    }

    fn write_value(&mut self, device: DeviceId, uuid: Uuid, value: Vec<u8>) {
        self.record(Call::WriteValue(device, attribute(uuid), value));
    }

    fn subscribe(&mut self, device: DeviceId, uuid: Uuid) {
        self.record(Call::Subscribe(device, attribute(uuid)));
    }

    fn read_signal_strength(&mut self, device: DeviceId) {
        self.record(Call::ReadSignalStrength(device));
    }
}

/// A listener that keeps every event it receives.
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<Event>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    /// Number of recorded events matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| predicate(e)).count()
    }
}

impl Listener for RecordingListener {
    fn on_event(&self, event: &Event) {
        self.events.lock().unwrap().push(event.clone());
    }
}
