//! BlueZ D-Bus transport.
//!
//! This backend uses the `bluer` crate to communicate with the BlueZ daemon
//! via D-Bus. It requires the `bluetoothd` daemon to be running.
//!
//! Every operation runs on its own task and reports through the
//! [`EventSink`]. GATT characteristics found during service discovery are
//! cached per device until the link goes down.

use super::{DisconnectReason, EventSink, ServiceInfo, Transport, TransportError, TransportEvent};
use crate::beacon::Advertisement;
use crate::device_id::DeviceId;
use crate::signal::RSSI_UNAVAILABLE;
use bluer::gatt::remote::Characteristic;
use bluer::{
    Adapter, AdapterEvent, AdapterProperty, Address, Device, DeviceEvent, DeviceProperty,
    DiscoveryFilter, DiscoveryTransport, Session,
};
use futures::{StreamExt, pin_mut};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How often to check whether BlueZ has resolved a device's services.
const SERVICES_RESOLVED_POLL: Duration = Duration::from_millis(100);
/// Give up on service resolution after this many polls.
const SERVICES_RESOLVED_ATTEMPTS: u32 = 100;

impl From<bluer::Error> for TransportError {
    fn from(err: bluer::Error) -> Self {
        TransportError::Bluetooth(err.to_string())
    }
}

type CharacteristicCache = Arc<Mutex<HashMap<(DeviceId, Uuid), Characteristic>>>;

/// [`Transport`] over the default BlueZ adapter.
pub struct BluerTransport {
    _session: Session,
    adapter: Adapter,
    sink: EventSink,
    power_task: JoinHandle<()>,
    scan_task: Option<JoinHandle<()>>,
    link_tasks: HashMap<DeviceId, JoinHandle<()>>,
    notify_tasks: HashMap<(DeviceId, Uuid), JoinHandle<()>>,
    characteristics: CharacteristicCache,
}

impl BluerTransport {
    /// Open the default adapter and power it on.
    ///
    /// The current power state is reported immediately and every later
    /// change is forwarded as `PowerStateChanged`.
    pub async fn start(sink: EventSink) -> Result<Self, TransportError> {
        let session = Session::new().await?;
        let adapter = session.default_adapter().await?;
        adapter.set_powered(true).await?;
        info!(adapter = adapter.name(), "bluetooth adapter opened");

        let powered = adapter.is_powered().await?;
        sink.emit(TransportEvent::PowerStateChanged { ready: powered });

        let events = adapter.events().await?;
        let power_sink = sink.clone();
        let power_task = tokio::spawn(async move {
            pin_mut!(events);
            while let Some(event) = events.next().await {
                if let AdapterEvent::PropertyChanged(AdapterProperty::Powered(ready)) = event {
                    debug!(ready, "adapter power changed");
                    if !power_sink.emit(TransportEvent::PowerStateChanged { ready }) {
                        break;
                    }
                }
            }
        });

        Ok(Self {
            _session: session,
            adapter,
            sink,
            power_task,
            scan_task: None,
            link_tasks: HashMap::new(),
            notify_tasks: HashMap::new(),
            characteristics: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn device(&self, id: DeviceId) -> Result<Device, bluer::Error> {
        self.adapter.device(Address::from(id))
    }

    fn characteristic(&self, id: DeviceId, uuid: Uuid) -> Option<Characteristic> {
        lock(&self.characteristics).get(&(id, uuid)).cloned()
    }

    fn drop_device_state(&mut self, id: DeviceId) {
        if let Some(task) = self.link_tasks.remove(&id) {
            task.abort();
        }
        self.notify_tasks.retain(|(device, _), task| {
            if *device == id {
                task.abort();
                false
            } else {
                true
            }
        });
        forget_characteristics(&self.characteristics, id);
    }
}

fn lock(
    cache: &CharacteristicCache,
) -> std::sync::MutexGuard<'_, HashMap<(DeviceId, Uuid), Characteristic>> {
    cache.lock().unwrap_or_else(|e| e.into_inner())
}

fn forget_characteristics(cache: &CharacteristicCache, id: DeviceId) {
    lock(cache).retain(|(device, _), _| *device != id);
}

impl Transport for BluerTransport {
    fn start_scan(&mut self, service: Uuid) {
        self.stop_scan();
        let adapter = self.adapter.clone();
        let sink = self.sink.clone();
        self.scan_task = Some(tokio::spawn(async move {
            if let Err(e) = scan(adapter, service, sink).await {
                warn!(error = %e, "scan failed");
            }
        }));
    }

    fn stop_scan(&mut self) {
        // Dropping the discovery stream inside the task ends the BlueZ session.
        if let Some(task) = self.scan_task.take() {
            task.abort();
        }
    }

    fn connect(&mut self, id: DeviceId) {
        self.drop_device_state(id);
        let device = match self.device(id) {
            Ok(device) => device,
            Err(e) => {
                warn!(device = %id, error = %e, "unknown device");
                self.sink.emit(TransportEvent::DeviceDisconnected {
                    id,
                    reason: DisconnectReason::ConnectionFailed,
                });
                return;
            }
        };
        let sink = self.sink.clone();
        let cache = Arc::clone(&self.characteristics);
        let task = tokio::spawn(async move {
            if let Err(e) = device.connect().await {
                debug!(device = %id, error = %e, "connect failed");
                sink.emit(TransportEvent::DeviceDisconnected {
                    id,
                    reason: DisconnectReason::ConnectionFailed,
                });
                return;
            }
            sink.emit(TransportEvent::DeviceConnected { id });

            match device.events().await {
                Ok(events) => {
                    pin_mut!(events);
                    while let Some(event) = events.next().await {
                        if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event
                        {
                            break;
                        }
                    }
                }
                Err(e) => warn!(device = %id, error = %e, "cannot watch link state"),
            }
            forget_characteristics(&cache, id);
            sink.emit(TransportEvent::DeviceDisconnected {
                id,
                reason: DisconnectReason::LinkLost,
            });
        });
        self.link_tasks.insert(id, task);
    }

    fn cancel_connection(&mut self, id: DeviceId) {
        self.drop_device_state(id);
        let device = self.device(id);
        let sink = self.sink.clone();
        tokio::spawn(async move {
            match device {
                Ok(device) => {
                    if let Err(e) = device.disconnect().await {
                        debug!(device = %id, error = %e, "disconnect failed");
                    }
                }
                Err(e) => debug!(device = %id, error = %e, "unknown device"),
            }
            sink.emit(TransportEvent::DeviceDisconnected {
                id,
                reason: DisconnectReason::Requested,
            });
        });
    }

    fn discover_services(&mut self, id: DeviceId) {
        let device = match self.device(id) {
            Ok(device) => device,
            Err(e) => {
                warn!(device = %id, error = %e, "unknown device");
                return;
            }
        };
        let sink = self.sink.clone();
        let cache = Arc::clone(&self.characteristics);
        tokio::spawn(async move {
            match discover(&device, id, &cache).await {
                Ok(services) => {
                    sink.emit(TransportEvent::ServicesDiscovered { id, services });
                }
                Err(e) => warn!(device = %id, error = %e, "service discovery failed"),
            }
        });
    }

    fn read_value(&mut self, id: DeviceId, attribute: Uuid) {
        let Some(characteristic) = self.characteristic(id, attribute) else {
            warn!(device = %id, %attribute, "read of undiscovered characteristic");
            return;
        };
        let sink = self.sink.clone();
        tokio::spawn(async move {
            match characteristic.read().await {
                Ok(value) => {
                    sink.emit(TransportEvent::AttributeValueUpdated {
                        id,
                        attribute,
                        value,
                    });
                }
                Err(e) => warn!(device = %id, %attribute, error = %e, "read failed"),
            }
        });
    }

    fn write_value(&mut self, id: DeviceId, attribute: Uuid, value: Vec<u8>) {
        let Some(characteristic) = self.characteristic(id, attribute) else {
            self.sink.emit(TransportEvent::WriteAcknowledged {
                id,
                attribute,
                error: Some("characteristic not discovered".to_string()),
            });
            return;
        };
        let sink = self.sink.clone();
        tokio::spawn(async move {
            let error = characteristic.write(&value).await.err().map(|e| e.to_string());
            sink.emit(TransportEvent::WriteAcknowledged {
                id,
                attribute,
                error,
            });
        });
    }

    fn subscribe(&mut self, id: DeviceId, attribute: Uuid) {
        let Some(characteristic) = self.characteristic(id, attribute) else {
            warn!(device = %id, %attribute, "subscribe to undiscovered characteristic");
            return;
        };
        let sink = self.sink.clone();
        let task = tokio::spawn(async move {
            let values = match characteristic.notify().await {
                Ok(values) => values,
                Err(e) => {
                    warn!(device = %id, %attribute, error = %e, "subscribe failed");
                    return;
                }
            };
            pin_mut!(values);
            while let Some(value) = values.next().await {
                if !sink.emit(TransportEvent::AttributeValueUpdated {
                    id,
                    attribute,
                    value,
                }) {
                    break;
                }
            }
        });
        if let Some(previous) = self.notify_tasks.insert((id, attribute), task) {
            previous.abort();
        }
    }

    fn read_signal_strength(&mut self, id: DeviceId) {
        let device = match self.device(id) {
            Ok(device) => device,
            Err(e) => {
                debug!(device = %id, error = %e, "unknown device");
                return;
            }
        };
        let sink = self.sink.clone();
        tokio::spawn(async move {
            match device.rssi().await {
                Ok(Some(signal)) => {
                    sink.emit(TransportEvent::SignalStrengthRead { id, signal });
                }
                Ok(None) => {}
                Err(e) => debug!(device = %id, error = %e, "signal read failed"),
            }
        });
    }
}

impl Drop for BluerTransport {
    fn drop(&mut self) {
        self.power_task.abort();
        self.stop_scan();
        for (_, task) in self.link_tasks.drain() {
            task.abort();
        }
        for (_, task) in self.notify_tasks.drain() {
            task.abort();
        }
    }
}

async fn scan(adapter: Adapter, service: Uuid, sink: EventSink) -> Result<(), bluer::Error> {
    let filter = DiscoveryFilter {
        uuids: HashSet::from([service]),
        transport: DiscoveryTransport::Le,
        duplicate_data: true,
        ..Default::default()
    };
    adapter.set_discovery_filter(filter).await?;

    let events = adapter.discover_devices_with_changes().await?;
    pin_mut!(events);
    while let Some(event) = events.next().await {
        let AdapterEvent::DeviceAdded(address) = event else {
            continue;
        };
        let id = DeviceId::from(address);
        match advertisement(&adapter.device(address)?).await {
            Ok((raw_signal, advertisement)) => {
                if !sink.emit(TransportEvent::DeviceDiscovered {
                    id,
                    raw_signal,
                    advertisement,
                }) {
                    break;
                }
            }
            Err(e) => debug!(device = %id, error = %e, "cannot read advertisement"),
        }
    }
    Ok(())
}

/// Read the advertised properties of a device.
///
/// BlueZ splits manufacturer data by company identifier; the payload is
/// rebuilt as it appeared on air, with the identifier in little-endian order.
async fn advertisement(device: &Device) -> Result<(i16, Advertisement), bluer::Error> {
    let raw_signal = device.rssi().await?.unwrap_or(RSSI_UNAVAILABLE);
    let name = device.name().await?;
    let manufacturer_data = device.manufacturer_data().await?.and_then(|data| {
        data.into_iter().min_by_key(|(company, _)| *company).map(|(company, bytes)| {
            let mut payload = company.to_le_bytes().to_vec();
            payload.extend_from_slice(&bytes);
            payload
        })
    });
    Ok((
        raw_signal,
        Advertisement {
            name,
            manufacturer_data,
        },
    ))
}

async fn discover(
    device: &Device,
    id: DeviceId,
    cache: &CharacteristicCache,
) -> Result<Vec<ServiceInfo>, bluer::Error> {
    for _ in 0..SERVICES_RESOLVED_ATTEMPTS {
        if device.is_services_resolved().await? {
            break;
        }
        tokio::time::sleep(SERVICES_RESOLVED_POLL).await;
    }

    let mut services = Vec::new();
    for service in device.services().await? {
        let mut characteristics = Vec::new();
        for characteristic in service.characteristics().await? {
            let uuid = characteristic.uuid().await?;
            lock(cache).insert((id, uuid), characteristic);
            characteristics.push(uuid);
        }
        services.push(ServiceInfo {
            uuid: service.uuid().await?,
            characteristics,
        });
    }
    debug!(device = %id, services = services.len(), "services discovered");
    Ok(services)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_to_device_id() {
        let addr = Address([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        let id: DeviceId = addr.into();
        assert_eq!(id, DeviceId([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]));
        assert_eq!(Address::from(id), addr);
    }
}
