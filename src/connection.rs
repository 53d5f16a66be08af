//! Connected beacons: attribute discovery, auto-disconnect and reconnects.
//!
//! A beacon handed over by discovery becomes a link that moves through
//! three phases:
//!
//! - `Connecting`: a transport connect is outstanding.
//! - `Connected`: the link is up. The beacon is announced with
//!   [`ConnectionEvent::Connect`] once every required attribute is satisfied.
//! - `Reconnecting`: a sticky beacon dropped unexpectedly and a reconnect is
//!   outstanding under a bounded timeout.
//!
//! Listeners only ever see announced beacons. A link that fails before being
//! announced disappears without a notification.

use crate::attribute::{
    self, Attribute, AttributeValue, BEACON_SERVICE, RfPowerLevel, USER_DISCONNECT_VALUE,
};
use crate::beacon::BeaconRecord;
use crate::card_data::{self, CARD_DATA_MAX_CHARS, CardDataError};
use crate::device_id::DeviceId;
use crate::event::{ConnectionEvent, Event};
use crate::manager::Context;
use crate::scheduler::TimerKey;
use crate::signal::Rssi;
use crate::transport::{DisconnectReason, ServiceInfo};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Period of the signal poll while any beacon is connected.
pub const SIGNAL_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// How long a sticky beacon may take to come back.
pub const RECONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors returned by outbound beacon operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WriteError {
    /// Preconditions for the operation are not met.
    #[error("write failed: {0}")]
    WriteFailure(String),
    #[error(transparent)]
    InvalidCardData(#[from] CardDataError),
    #[error("{0} cannot be read")]
    NotReadable(Attribute),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug)]
struct Link {
    record: BeaconRecord,
    phase: Phase,
    /// Required attributes not yet satisfied.
    pending: BTreeSet<Attribute>,
    /// Attributes found during service discovery.
    available: HashSet<Attribute>,
}

impl Link {
    fn new(record: BeaconRecord) -> Self {
        Self {
            record,
            phase: Phase::Connecting,
            pending: BTreeSet::new(),
            available: HashSet::new(),
        }
    }

    fn is_announced(&self) -> bool {
        self.record.attribute_discovery_complete
    }
}

/// Owns every link the manager holds.
#[derive(Debug, Default)]
pub struct ConnectionCoordinator {
    links: BTreeMap<DeviceId, Link>,
    /// Devices whose next disconnect was asked for and must not reconnect.
    requested_disconnects: HashSet<DeviceId>,
}

impl ConnectionCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the device is held in any phase.
    pub fn is_tracked(&self, id: DeviceId) -> bool {
        self.links.contains_key(&id)
    }

    /// Snapshots of announced beacons, ordered by id.
    pub fn connected(&self) -> Vec<BeaconRecord> {
        self.links
            .values()
            .filter(|l| l.phase == Phase::Connected && l.is_announced())
            .map(|l| l.record.clone())
            .collect()
    }

    fn has_connected_links(&self) -> bool {
        self.links.values().any(|l| l.phase == Phase::Connected)
    }

    /// Take ownership of a discovered beacon and start connecting.
    pub(crate) fn initiate(&mut self, record: BeaconRecord, ctx: &mut Context) {
        let id = record.id();
        if self.is_tracked(id) {
            debug!(device = %id, "connect already in progress");
            return;
        }
        info!(device = %id, signal = record.filtered_signal, "connecting");
        self.links.insert(id, Link::new(record));
        ctx.transport.connect(id);
    }

    /// The transport reports a link up.
    ///
    /// # Returns
    /// `true` if this established a new link.
    pub(crate) fn on_connected(&mut self, id: DeviceId, ctx: &mut Context) -> bool {
        let Some(link) = self.links.get_mut(&id) else {
            debug!(device = %id, "connect reported for untracked device");
            return false;
        };
        match link.phase {
            Phase::Connected => {
                debug!(device = %id, "device already connected");
                return false;
            }
            Phase::Reconnecting => {
                ctx.scheduler.cancel(TimerKey::ReconnectTimeout(id));
                info!(device = %id, "reconnected");
            }
            Phase::Connecting => debug!(device = %id, "link up"),
        }

        link.phase = Phase::Connected;
        link.record.attribute_discovery_complete = false;
        link.pending = Attribute::REQUIRED.into_iter().collect();
        link.available.clear();
        ctx.transport.discover_services(id);

        if !ctx.scheduler.is_scheduled(TimerKey::SignalPoll) {
            ctx.scheduler.repeating(TimerKey::SignalPoll, SIGNAL_POLL_INTERVAL);
        }
        true
    }

    pub(crate) fn on_services_discovered(
        &mut self,
        id: DeviceId,
        services: &[ServiceInfo],
        ctx: &mut Context,
    ) {
        let Some(link) = self.links.get_mut(&id).filter(|l| l.phase == Phase::Connected) else {
            debug!(device = %id, "services reported for unconnected device");
            return;
        };
        let Some(service) = services.iter().find(|s| s.uuid == BEACON_SERVICE) else {
            warn!(device = %id, "beacon service not found");
            return;
        };

        for uuid in &service.characteristics {
            let Some(attribute) = Attribute::from_uuid(*uuid) else {
                debug!(device = %id, %uuid, "ignoring unknown characteristic");
                continue;
            };
            link.available.insert(attribute);
            if attribute.is_readable() {
                ctx.transport.read_value(id, *uuid);
            } else if attribute.is_required() {
                link.pending.remove(&attribute);
            }
            if attribute.supports_notify() {
                ctx.transport.subscribe(id, *uuid);
            }
        }
        debug!(device = %id, available = link.available.len(), "attributes discovered");
        complete_discovery_if_ready(link, ctx);
    }

    pub(crate) fn on_value(&mut self, id: DeviceId, uuid: Uuid, bytes: &[u8], ctx: &mut Context) {
        let Some(link) = self.links.get_mut(&id).filter(|l| l.phase == Phase::Connected) else {
            debug!(device = %id, %uuid, "value for unconnected device dropped");
            return;
        };
        let Some(attribute) = Attribute::from_uuid(uuid) else {
            debug!(device = %id, %uuid, "value for unknown attribute dropped");
            return;
        };
        // A read satisfies the requirement even when its bytes are unusable.
        link.pending.remove(&attribute);

        match attribute::decode(attribute, bytes) {
            Ok(value) => {
                match &value {
                    AttributeValue::StickyConnect(sticky) => {
                        link.record.wants_sticky_connection = *sticky;
                    }
                    AttributeValue::TerminalKind(kind) => {
                        link.record.terminal_kind = *kind;
                    }
                    _ => {}
                }
                ctx.notify(Event::Value { device: id, value });
            }
            Err(e) => warn!(device = %id, error = %e, "attribute value dropped"),
        }
        complete_discovery_if_ready(link, ctx);
    }

    pub(crate) fn on_disconnected(
        &mut self,
        id: DeviceId,
        reason: DisconnectReason,
        ctx: &mut Context,
    ) {
        let requested =
            self.requested_disconnects.remove(&id) || reason == DisconnectReason::Requested;
        let Some(mut link) = self.links.remove(&id) else {
            debug!(device = %id, ?reason, "disconnect reported for untracked device");
            return;
        };

        let phase = link.phase;
        match phase {
            Phase::Connecting => {
                debug!(device = %id, ?reason, "connect attempt ended");
            }
            Phase::Reconnecting
                if !requested && ctx.scheduler.is_scheduled(TimerKey::ReconnectTimeout(id)) =>
            {
                debug!(device = %id, ?reason, "reconnect attempt failed, retrying");
                ctx.transport.connect(id);
                self.links.insert(id, link);
            }
            Phase::Reconnecting => {
                ctx.scheduler.cancel(TimerKey::ReconnectTimeout(id));
                debug!(device = %id, "reconnect abandoned");
            }
            Phase::Connected => {
                ctx.scheduler.cancel(TimerKey::AutoDisconnect(id));
                link.record.auto_disconnect_deadline = None;

                let announced = link.is_announced();
                if announced {
                    info!(device = %id, ?reason, "beacon disconnected");
                    ctx.notify(Event::Connection {
                        event: ConnectionEvent::Disconnect,
                        beacon: link.record.clone(),
                    });
                } else {
                    debug!(device = %id, ?reason, "link dropped before announcement");
                }

                if announced && !requested && link.record.wants_sticky_connection {
                    info!(device = %id, "sticky beacon lost, reconnecting");
                    link.phase = Phase::Reconnecting;
                    ctx.transport.connect(id);
                    ctx.scheduler.once(TimerKey::ReconnectTimeout(id), RECONNECT_TIMEOUT);
                    self.links.insert(id, link);
                }
            }
        }

        if !self.has_connected_links() {
            ctx.scheduler.cancel(TimerKey::SignalPoll);
        }
    }

    pub(crate) fn on_reconnect_timeout(&mut self, id: DeviceId, ctx: &mut Context) {
        if !self
            .links
            .get(&id)
            .is_some_and(|l| l.phase == Phase::Reconnecting)
        {
            return;
        }
        self.links.remove(&id);
        info!(device = %id, "reconnect timed out");
        ctx.transport.cancel_connection(id);
        ctx.notify(Event::ReconnectTimedOut { device: id });
    }

    /// Ask every connected beacon for its current signal strength.
    pub(crate) fn poll_signal(&mut self, ctx: &mut Context) {
        for (id, link) in &self.links {
            if link.phase == Phase::Connected {
                ctx.transport.read_signal_strength(*id);
            }
        }
    }

    pub(crate) fn on_signal_strength(
        &mut self,
        id: DeviceId,
        signal: Rssi,
        now: Instant,
        ctx: &mut Context,
    ) {
        let Some(link) = self.links.get_mut(&id).filter(|l| l.phase == Phase::Connected) else {
            return;
        };
        link.record.on_connected_signal_sample(signal);
        ctx.notify(Event::SignalStrength { device: id, signal });
        evaluate_auto_disconnect(&mut link.record, now, ctx);
    }

    pub(crate) fn on_auto_disconnect(&mut self, id: DeviceId, ctx: &mut Context) {
        let Some(link) = self.links.get_mut(&id).filter(|l| l.phase == Phase::Connected) else {
            return;
        };
        link.record.auto_disconnect_deadline = None;
        info!(device = %id, signal = link.record.filtered_signal, "auto-disconnecting");
        self.requested_disconnects.insert(id);
        ctx.transport.cancel_connection(id);
    }

    fn connected_link(&self, id: DeviceId, attribute: Attribute) -> Result<&Link, WriteError> {
        let link = self
            .links
            .get(&id)
            .filter(|l| l.phase == Phase::Connected)
            .ok_or_else(|| {
                warn!(device = %id, %attribute, "no connected beacon");
                WriteError::WriteFailure(format!("no connected beacon {}", id))
            })?;
        if !link.available.contains(&attribute) {
            warn!(device = %id, %attribute, "attribute not found");
            return Err(WriteError::WriteFailure(format!(
                "attribute {} not found on {}",
                attribute, id
            )));
        }
        Ok(link)
    }

    /// Ask the beacon to end the connection.
    ///
    /// The link is torn down once the beacon acknowledges the request.
    pub(crate) fn disconnect(&mut self, id: DeviceId, ctx: &mut Context) -> Result<(), WriteError> {
        self.connected_link(id, Attribute::UserDisconnect)?;
        debug!(device = %id, "requesting user disconnect");
        ctx.transport.write_value(
            id,
            Attribute::UserDisconnect.uuid(),
            USER_DISCONNECT_VALUE.to_vec(),
        );
        Ok(())
    }

    pub(crate) fn write_card_data(
        &mut self,
        id: DeviceId,
        text: &str,
        ctx: &mut Context,
    ) -> Result<(), WriteError> {
        self.connected_link(id, Attribute::CardData)?;
        let bytes = card_data::encode(text, ctx.settings.sentinel_mode(), CARD_DATA_MAX_CHARS)?;
        debug!(device = %id, payload = %hex::encode(&bytes), "writing card data");
        ctx.transport.write_value(id, Attribute::CardData.uuid(), bytes);
        Ok(())
    }

    pub(crate) fn write_rf_power_level(
        &mut self,
        id: DeviceId,
        level: RfPowerLevel,
        ctx: &mut Context,
    ) -> Result<(), WriteError> {
        self.connected_link(id, Attribute::RfPowerLevel)?;
        debug!(device = %id, %level, "writing RF power level");
        ctx.transport.write_value(id, Attribute::RfPowerLevel.uuid(), vec![level.value()]);
        Ok(())
    }

    /// Re-read an attribute. The value arrives as an [`Event::Value`].
    pub(crate) fn request_value(
        &mut self,
        id: DeviceId,
        attribute: Attribute,
        ctx: &mut Context,
    ) -> Result<(), WriteError> {
        if !attribute.is_readable() {
            return Err(WriteError::NotReadable(attribute));
        }
        self.connected_link(id, attribute)?;
        ctx.transport.read_value(id, attribute.uuid());
        Ok(())
    }

    pub(crate) fn on_write_acknowledged(
        &mut self,
        id: DeviceId,
        uuid: Uuid,
        error: Option<String>,
        ctx: &mut Context,
    ) {
        let Some(attribute) = Attribute::from_uuid(uuid) else {
            debug!(device = %id, %uuid, "write acknowledged for unknown attribute");
            return;
        };
        if let Some(e) = &error {
            warn!(device = %id, %attribute, error = %e, "write failed");
        }
        ctx.notify(Event::WriteCompleted {
            device: id,
            attribute,
            error,
        });

        if attribute != Attribute::UserDisconnect {
            return;
        }
        let Some(link) = self.links.get(&id).filter(|l| l.phase == Phase::Connected) else {
            return;
        };
        self.requested_disconnects.insert(id);
        ctx.transport.cancel_connection(id);
        if link.is_announced() {
            ctx.notify(Event::Connection {
                event: ConnectionEvent::PendingUserDisconnect,
                beacon: link.record.clone(),
            });
        }
    }

    /// Close every link without notifying listeners.
    pub(crate) fn shutdown(&mut self, ctx: &mut Context) {
        for id in self.links.keys() {
            ctx.transport.cancel_connection(*id);
        }
        self.links.clear();
        self.requested_disconnects.clear();
    }
}

fn complete_discovery_if_ready(link: &mut Link, ctx: &mut Context) {
    if !link.pending.is_empty() || link.record.attribute_discovery_complete {
        return;
    }
    link.record.attribute_discovery_complete = true;
    info!(
        device = %link.record.id(),
        terminal = %link.record.terminal_kind,
        sticky = link.record.wants_sticky_connection,
        "beacon connected"
    );
    ctx.notify(Event::Connection {
        event: ConnectionEvent::Connect,
        beacon: link.record.clone(),
    });
}

/// Start or cancel the delayed disconnect of a weak beacon.
fn evaluate_auto_disconnect(record: &mut BeaconRecord, now: Instant, ctx: &mut Context) {
    let threshold = ctx.settings.auto_disconnect_threshold();
    if threshold == 0 {
        return;
    }
    let id = record.id();
    if record.filtered_signal < threshold {
        if record.auto_disconnect_deadline.is_none() {
            let interval = ctx.settings.auto_disconnect_interval();
            debug!(
                device = %id,
                signal = record.filtered_signal,
                threshold,
                "below disconnect threshold"
            );
            ctx.scheduler.once(TimerKey::AutoDisconnect(id), interval);
            record.auto_disconnect_deadline = Some(now + interval);
        }
    } else if record.auto_disconnect_deadline.take().is_some() {
        debug!(device = %id, signal = record.filtered_signal, "signal recovered");
        ctx.scheduler.cancel(TimerKey::AutoDisconnect(id));
    }
}
