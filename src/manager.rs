//! The beacon manager: one task owning all discovery and connection state.
//!
//! [`BeaconManager::spawn`] starts an actor task that serializes transport
//! events, timer firings and caller commands. The returned handle is cheap
//! to clone; every query and operation is a message to that task.
//!
//! # Example
//! ```no_run
//! use beacon_link::listener::ChannelListener;
//! use beacon_link::manager::BeaconManager;
//! use beacon_link::settings::Settings;
//! use beacon_link::transport::{self, bluer::BluerTransport};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (sink, events) = transport::channel();
//! let radio = BluerTransport::start(sink).await?;
//! let manager = BeaconManager::spawn(Box::new(radio), events, Settings::in_memory());
//!
//! let (listener, mut rx) = ChannelListener::new();
//! manager.subscribe(listener);
//! manager.start_scanning().await?;
//! while let Some(event) = rx.recv().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

use crate::attribute::{Attribute, RfPowerLevel};
use crate::beacon::BeaconRecord;
use crate::card_data::SentinelMode;
use crate::connection::{ConnectionCoordinator, WriteError};
use crate::device_id::DeviceId;
use crate::discovery::DiscoveryEngine;
use crate::event::{DiscoveryState, Event};
use crate::listener::{Listener, ListenerHub, SubscriptionId};
use crate::scheduler::{Scheduler, TimerFired, TimerKey};
use crate::settings::{Settings, SettingsError};
use crate::signal::Rssi;
use crate::transport::{EventStream, Transport, TransportEvent};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info};

/// Errors returned by [`BeaconManager`] operations.
#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("beacon manager has shut down")]
    Closed,
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
}

/// Collaborators shared by the discovery engine and the connection coordinator.
pub(crate) struct Context {
    pub transport: Box<dyn Transport>,
    pub scheduler: Scheduler,
    pub hub: Arc<ListenerHub>,
    pub settings: Settings,
}

impl Context {
    pub fn notify(&self, event: Event) {
        self.hub.notify(&event);
    }
}

/// All mutable state, touched only from the manager task.
pub(crate) struct Core {
    ctx: Context,
    discovery: DiscoveryEngine,
    connections: ConnectionCoordinator,
}

impl Core {
    pub fn new(ctx: Context) -> Self {
        Self {
            ctx,
            discovery: DiscoveryEngine::new(),
            connections: ConnectionCoordinator::new(),
        }
    }

    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        let ctx = &mut self.ctx;
        match event {
            TransportEvent::PowerStateChanged { ready } => {
                self.discovery.on_power_state(ready, ctx);
            }
            TransportEvent::DeviceDiscovered {
                id,
                raw_signal,
                advertisement,
            } => {
                let owned = self.connections.is_tracked(id);
                if let Some(record) = self.discovery.on_device_discovered(
                    id,
                    raw_signal,
                    &advertisement,
                    Instant::now(),
                    owned,
                    ctx,
                ) {
                    self.connections.initiate(record, ctx);
                }
            }
            TransportEvent::DeviceConnected { id } => {
                if self.connections.on_connected(id, ctx) {
                    self.discovery.on_link_established(ctx);
                }
            }
            TransportEvent::DeviceDisconnected { id, reason } => {
                self.connections.on_disconnected(id, reason, ctx);
            }
            TransportEvent::ServicesDiscovered { id, services } => {
                self.connections.on_services_discovered(id, &services, ctx);
            }
            TransportEvent::AttributeValueUpdated {
                id,
                attribute,
                value,
            } => {
                self.connections.on_value(id, attribute, &value, ctx);
            }
            TransportEvent::WriteAcknowledged {
                id,
                attribute,
                error,
            } => {
                self.connections.on_write_acknowledged(id, attribute, error, ctx);
            }
            TransportEvent::SignalStrengthRead { id, signal } => {
                self.connections.on_signal_strength(id, signal, Instant::now(), ctx);
            }
        }
    }

    pub fn handle_timer(&mut self, fired: TimerFired) {
        if self.ctx.scheduler.accept(&fired) {
            self.on_timer(fired.key);
        }
    }

    pub fn on_timer(&mut self, key: TimerKey) {
        let ctx = &mut self.ctx;
        match key {
            TimerKey::ScanRefresh => self.discovery.on_scan_refresh(ctx),
            TimerKey::ScanTimeout => self.discovery.on_scan_timeout(ctx),
            TimerKey::Expiration => {
                self.discovery.expire(Instant::now());
            }
            TimerKey::SignalPoll => self.connections.poll_signal(ctx),
            TimerKey::AutoDisconnect(id) => self.connections.on_auto_disconnect(id, ctx),
            TimerKey::ReconnectTimeout(id) => self.connections.on_reconnect_timeout(id, ctx),
        }
    }

    /// Handle a caller command. Returns `false` once the manager should stop.
    fn handle_command(&mut self, command: Command) -> bool {
        let ctx = &mut self.ctx;
        match command {
            Command::StartScanning(reply) => {
                let _ = reply.send(self.discovery.start_scanning(ctx));
            }
            Command::StopScanning(reply) => {
                let _ = reply.send(self.discovery.stop_scanning(ctx));
            }
            Command::DiscoveryState(reply) => {
                let _ = reply.send(self.discovery.state());
            }
            Command::Discovered(reply) => {
                let _ = reply.send(self.discovery.discovered().to_vec());
            }
            Command::Connected(reply) => {
                let _ = reply.send(self.connections.connected());
            }
            Command::Disconnect { device, reply } => {
                let _ = reply.send(self.connections.disconnect(device, ctx));
            }
            Command::WriteCardData {
                device,
                text,
                reply,
            } => {
                let _ = reply.send(self.connections.write_card_data(device, &text, ctx));
            }
            Command::WriteRfPowerLevel {
                device,
                level,
                reply,
            } => {
                let _ = reply.send(self.connections.write_rf_power_level(device, level, ctx));
            }
            Command::RequestValue {
                device,
                attribute,
                reply,
            } => {
                let _ = reply.send(self.connections.request_value(device, attribute, ctx));
            }
            Command::Configure { change, reply } => {
                let _ = reply.send(change.apply(&mut ctx.settings));
            }
            Command::Shutdown(reply) => {
                self.shutdown();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn shutdown(&mut self) {
        let ctx = &mut self.ctx;
        self.connections.shutdown(ctx);
        self.discovery.shutdown(ctx);
        ctx.scheduler.cancel_all();
    }
}

/// A settings update requested through the handle.
#[derive(Debug, Clone, Copy)]
enum SettingChange {
    AutoConnectThreshold(i64),
    AutoDisconnectThreshold(i64),
    AutoDisconnectInterval(Duration),
    ScanTimeout(Duration),
    SentinelMode(SentinelMode),
}

impl SettingChange {
    /// Apply the change and return the stored threshold, if it was one.
    fn apply(self, settings: &mut Settings) -> Result<Option<Rssi>, SettingsError> {
        match self {
            SettingChange::AutoConnectThreshold(value) => {
                settings.set_auto_connect_threshold(value).map(Some)
            }
            SettingChange::AutoDisconnectThreshold(value) => {
                settings.set_auto_disconnect_threshold(value).map(Some)
            }
            SettingChange::AutoDisconnectInterval(interval) => settings
                .set_auto_disconnect_interval(interval)
                .map(|_| None),
            SettingChange::ScanTimeout(timeout) => settings.set_scan_timeout(timeout).map(|_| None),
            SettingChange::SentinelMode(mode) => settings.set_sentinel_mode(mode).map(|_| None),
        }
    }
}

type Reply<T> = oneshot::Sender<T>;

enum Command {
    StartScanning(Reply<DiscoveryState>),
    StopScanning(Reply<DiscoveryState>),
    DiscoveryState(Reply<DiscoveryState>),
    Discovered(Reply<Vec<BeaconRecord>>),
    Connected(Reply<Vec<BeaconRecord>>),
    Disconnect {
        device: DeviceId,
        reply: Reply<Result<(), WriteError>>,
    },
    WriteCardData {
        device: DeviceId,
        text: String,
        reply: Reply<Result<(), WriteError>>,
    },
    WriteRfPowerLevel {
        device: DeviceId,
        level: RfPowerLevel,
        reply: Reply<Result<(), WriteError>>,
    },
    RequestValue {
        device: DeviceId,
        attribute: Attribute,
        reply: Reply<Result<(), WriteError>>,
    },
    Configure {
        change: SettingChange,
        reply: Reply<Result<Option<Rssi>, SettingsError>>,
    },
    Shutdown(Reply<()>),
}

/// Handle to a running beacon manager.
///
/// Dropping every handle stops the manager task.
#[derive(Clone)]
pub struct BeaconManager {
    commands: mpsc::UnboundedSender<Command>,
    hub: Arc<ListenerHub>,
}

impl BeaconManager {
    /// Start the manager task.
    ///
    /// # Arguments
    /// * `transport` - Radio operations issued by the manager
    /// * `events` - Stream the transport reports into
    /// * `settings` - Threshold and timer configuration
    pub fn spawn(transport: Box<dyn Transport>, events: EventStream, settings: Settings) -> Self {
        let hub = Arc::new(ListenerHub::new());
        let (scheduler, timers) = Scheduler::new();
        let core = Core::new(Context {
            transport,
            scheduler,
            hub: Arc::clone(&hub),
            settings,
        });
        let (commands, command_rx) = mpsc::unbounded_channel();
        tokio::spawn(run(core, command_rx, events, timers));
        Self { commands, hub }
    }

    /// Register a listener. Events are delivered on the manager task.
    pub fn subscribe(&self, listener: Arc<dyn Listener>) -> SubscriptionId {
        self.hub.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.hub.unsubscribe(id)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, ManagerError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| ManagerError::Closed)?;
        response.await.map_err(|_| ManagerError::Closed)
    }

    /// Begin scanning.
    ///
    /// # Returns
    /// The resulting state: `NotReady` if the radio is unavailable.
    pub async fn start_scanning(&self) -> Result<DiscoveryState, ManagerError> {
        self.request(Command::StartScanning).await
    }

    pub async fn stop_scanning(&self) -> Result<DiscoveryState, ManagerError> {
        self.request(Command::StopScanning).await
    }

    pub async fn discovery_state(&self) -> Result<DiscoveryState, ManagerError> {
        self.request(Command::DiscoveryState).await
    }

    /// Snapshots of discovered beacons, oldest first.
    pub async fn discovered(&self) -> Result<Vec<BeaconRecord>, ManagerError> {
        self.request(Command::Discovered).await
    }

    /// Snapshots of connected beacons whose attribute discovery completed.
    pub async fn connected(&self) -> Result<Vec<BeaconRecord>, ManagerError> {
        self.request(Command::Connected).await
    }

    /// Ask a connected beacon to disconnect.
    ///
    /// `PendingUserDisconnect` and then `Disconnect` follow once the beacon
    /// acknowledges.
    pub async fn disconnect(&self, device: DeviceId) -> Result<(), ManagerError> {
        Ok(self
            .request(|reply| Command::Disconnect { device, reply })
            .await??)
    }

    /// Encode `text` with the configured sentinel mode and write it as card data.
    pub async fn write_card_data(
        &self,
        device: DeviceId,
        text: impl Into<String>,
    ) -> Result<(), ManagerError> {
        let text = text.into();
        Ok(self
            .request(|reply| Command::WriteCardData {
                device,
                text,
                reply,
            })
            .await??)
    }

    pub async fn write_rf_power_level(
        &self,
        device: DeviceId,
        level: RfPowerLevel,
    ) -> Result<(), ManagerError> {
        Ok(self
            .request(|reply| Command::WriteRfPowerLevel {
                device,
                level,
                reply,
            })
            .await??)
    }

    /// Re-read an attribute; the value is delivered as an [`Event::Value`].
    pub async fn request_value(
        &self,
        device: DeviceId,
        attribute: Attribute,
    ) -> Result<(), ManagerError> {
        Ok(self
            .request(|reply| Command::RequestValue {
                device,
                attribute,
                reply,
            })
            .await??)
    }

    async fn configure(&self, change: SettingChange) -> Result<Option<Rssi>, ManagerError> {
        Ok(self
            .request(|reply| Command::Configure { change, reply })
            .await??)
    }

    /// Store a new auto-connect threshold.
    ///
    /// # Returns
    /// The stored value after clamping to `[-100, 0]`.
    pub async fn set_auto_connect_threshold(&self, value: i64) -> Result<Rssi, ManagerError> {
        let stored = self
            .configure(SettingChange::AutoConnectThreshold(value))
            .await?;
        Ok(stored.unwrap_or_default())
    }

    /// Store a new auto-disconnect threshold, clamped like the auto-connect one.
    pub async fn set_auto_disconnect_threshold(&self, value: i64) -> Result<Rssi, ManagerError> {
        let stored = self
            .configure(SettingChange::AutoDisconnectThreshold(value))
            .await?;
        Ok(stored.unwrap_or_default())
    }

    pub async fn set_auto_disconnect_interval(
        &self,
        interval: Duration,
    ) -> Result<(), ManagerError> {
        self.configure(SettingChange::AutoDisconnectInterval(interval))
            .await
            .map(|_| ())
    }

    /// Takes effect the next time scanning starts.
    pub async fn set_scan_timeout(&self, timeout: Duration) -> Result<(), ManagerError> {
        self.configure(SettingChange::ScanTimeout(timeout))
            .await
            .map(|_| ())
    }

    pub async fn set_sentinel_mode(&self, mode: SentinelMode) -> Result<(), ManagerError> {
        self.configure(SettingChange::SentinelMode(mode))
            .await
            .map(|_| ())
    }

    /// Stop scanning, close every link and end the manager task.
    pub async fn shutdown(&self) -> Result<(), ManagerError> {
        self.request(Command::Shutdown).await
    }
}

async fn run(
    mut core: Core,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut events: EventStream,
    mut timers: mpsc::UnboundedReceiver<TimerFired>,
) {
    debug!("beacon manager started");
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(command) => {
                    if !core.handle_command(command) {
                        break;
                    }
                }
                None => {
                    core.shutdown();
                    break;
                }
            },
            event = events.recv() => match event {
                Some(event) => core.handle_transport_event(event),
                None => {
                    info!("transport closed");
                    core.shutdown();
                    break;
                }
            },
            Some(fired) = timers.recv() => core.handle_timer(fired),
        }
    }
    core.ctx.hub.clear();
    debug!("beacon manager stopped");
}

#[cfg(test)]
pub(crate) fn test_context() -> (Context, crate::test_utils::CallLog) {
    let (transport, log) = crate::test_utils::FakeTransport::new();
    let (scheduler, _timers) = Scheduler::new();
    (
        Context {
            transport: Box::new(transport),
            scheduler,
            hub: Arc::new(ListenerHub::new()),
            settings: Settings::in_memory(),
        },
        log,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beacon::{Advertisement, TerminalKind};
    use crate::event::ConnectionEvent;
    use crate::listener::ChannelListener;
    use crate::test_utils::{Call, FakeTransport, SimulatedBeacon, TEST_ID};
    use crate::transport::{self, EventSink};
    use std::sync::atomic::{AtomicI16, Ordering};

    struct Rig {
        manager: BeaconManager,
        sink: EventSink,
        events: mpsc::UnboundedReceiver<Event>,
        log: crate::test_utils::CallLog,
        signal: Arc<AtomicI16>,
    }

    /// A manager wired to a simulated beacon, with the radio already powered.
    async fn rig() -> Rig {
        rig_with(|beacon| beacon).await
    }

    async fn rig_with(configure: impl FnOnce(SimulatedBeacon) -> SimulatedBeacon) -> Rig {
        let (sink, stream) = transport::channel();
        let beacon = configure(SimulatedBeacon::new(sink.clone()));
        let signal = Arc::clone(&beacon.signal);
        let (radio, log) = FakeTransport::responding(beacon);
        let manager = BeaconManager::spawn(Box::new(radio), stream, Settings::in_memory());
        let (listener, events) = ChannelListener::new();
        manager.subscribe(listener);

        sink.emit(TransportEvent::PowerStateChanged { ready: true });
        settle().await;
        Rig {
            manager,
            sink,
            events,
            log,
            signal,
        }
    }

    /// Let the manager task drain everything queued so far.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Event>) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn connection_events(events: &[Event]) -> Vec<ConnectionEvent> {
        events
            .iter()
            .filter_map(|e| match e {
                Event::Connection { event, .. } => Some(*event),
                _ => None,
            })
            .collect()
    }

    fn sighting(sink: &EventSink, raw_signal: Rssi) {
        sink.emit(TransportEvent::DeviceDiscovered {
            id: TEST_ID,
            raw_signal,
            advertisement: Advertisement::default(),
        });
    }

    /// Scan and let the beacon auto-connect.
    async fn connect(rig: &mut Rig) {
        rig.manager.start_scanning().await.unwrap();
        sighting(&rig.sink, -40);
        settle().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_up_and_scan() {
        let mut rig = rig().await;
        assert_eq!(
            rig.manager.discovery_state().await.unwrap(),
            DiscoveryState::Inactive
        );
        assert_eq!(
            rig.manager.start_scanning().await.unwrap(),
            DiscoveryState::Scanning
        );
        assert_eq!(
            rig.manager.stop_scanning().await.unwrap(),
            DiscoveryState::Inactive
        );

        let states: Vec<_> = drain(&mut rig.events)
            .into_iter()
            .filter_map(|e| match e {
                Event::DiscoveryStateChanged { new, .. } => Some(new),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                DiscoveryState::Inactive,
                DiscoveryState::Scanning,
                DiscoveryState::Inactive
            ]
        );
        assert_eq!(rig.log.count(&Call::StopScan), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_connect_announces_beacon() {
        let mut rig = rig().await;
        connect(&mut rig).await;

        let events = drain(&mut rig.events);
        assert_eq!(connection_events(&events), vec![ConnectionEvent::Connect]);
        let connected = rig.manager.connected().await.unwrap();
        assert_eq!(connected.len(), 1);
        assert_eq!(connected[0].id(), TEST_ID);
        assert_eq!(connected[0].terminal_kind, TerminalKind::Kiosk);
        assert!(!connected[0].wants_sticky_connection);

        // The link stops the scan and forgets scan results.
        assert!(rig.manager.discovered().await.unwrap().is_empty());
        assert!(rig.log.contains(&Call::StopScan));
        assert_eq!(
            rig.manager.discovery_state().await.unwrap(),
            DiscoveryState::Scanning
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_weak_sightings_expire() {
        let rig = rig().await;
        rig.manager.start_scanning().await.unwrap();
        sighting(&rig.sink, -90);
        settle().await;
        assert_eq!(rig.manager.discovered().await.unwrap().len(), 1);
        assert!(!rig.log.contains(&Call::Connect(TEST_ID)));

        tokio::time::sleep(Duration::from_secs(7)).await;
        assert!(rig.manager.discovered().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_signal_poll_and_auto_disconnect() {
        let mut rig = rig().await;
        connect(&mut rig).await;
        drain(&mut rig.events);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        let events = drain(&mut rig.events);
        assert!(events.contains(&Event::SignalStrength {
            device: TEST_ID,
            signal: -50
        }));

        rig.signal.store(-80, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(3000)).await;

        let events = drain(&mut rig.events);
        assert_eq!(connection_events(&events), vec![ConnectionEvent::Disconnect]);
        assert!(rig.log.contains(&Call::CancelConnection(TEST_ID)));
        assert!(rig.manager.connected().await.unwrap().is_empty());
        // Not sticky: no reconnect.
        assert_eq!(rig.log.count(&Call::Connect(TEST_ID)), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovered_signal_keeps_link() {
        let mut rig = rig().await;
        rig.manager
            .set_auto_disconnect_interval(Duration::from_secs(3))
            .await
            .unwrap();
        connect(&mut rig).await;

        // Weak at the first poll, recovered by the second.
        rig.signal.store(-75, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(1000)).await;
        rig.signal.store(-60, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(3000)).await;

        assert_eq!(rig.manager.connected().await.unwrap().len(), 1);
        assert!(!rig.log.contains(&Call::CancelConnection(TEST_ID)));
        let events = drain(&mut rig.events);
        assert!(!connection_events(&events).contains(&ConnectionEvent::Disconnect));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sticky_beacon_reconnects_after_link_loss() {
        let mut rig =
            rig_with(|beacon| beacon.with_value(Attribute::StickyConnect, vec![1])).await;
        connect(&mut rig).await;
        drain(&mut rig.events);

        rig.sink.emit(TransportEvent::DeviceDisconnected {
            id: TEST_ID,
            reason: crate::transport::DisconnectReason::LinkLost,
        });
        settle().await;

        let events = drain(&mut rig.events);
        assert_eq!(
            connection_events(&events),
            vec![ConnectionEvent::Disconnect, ConnectionEvent::Connect]
        );
        assert_eq!(rig.log.count(&Call::Connect(TEST_ID)), 2);
        let connected = rig.manager.connected().await.unwrap();
        assert!(connected[0].wants_sticky_connection);

        // The reconnect window closed with the link back up.
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(
            !drain(&mut rig.events)
                .iter()
                .any(|e| matches!(e, Event::ReconnectTimedOut { .. }))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_disconnect_through_handle() {
        let mut rig = rig().await;
        connect(&mut rig).await;
        drain(&mut rig.events);

        rig.manager.write_card_data(TEST_ID, "4111=25").await.unwrap();
        rig.manager.disconnect(TEST_ID).await.unwrap();
        settle().await;

        let events = drain(&mut rig.events);
        let writes: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                Event::WriteCompleted {
                    attribute, error, ..
                } => Some((*attribute, error.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(
            writes,
            vec![
                (Attribute::CardData, None),
                (Attribute::UserDisconnect, None)
            ]
        );
        assert_eq!(
            connection_events(&events),
            vec![
                ConnectionEvent::PendingUserDisconnect,
                ConnectionEvent::Disconnect
            ]
        );
        assert!(matches!(
            rig.manager.disconnect(TEST_ID).await,
            Err(ManagerError::Write(WriteError::WriteFailure(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_setters_clamp_thresholds() {
        let rig = rig().await;
        assert_eq!(
            rig.manager.set_auto_connect_threshold(-150).await.unwrap(),
            -100
        );
        assert_eq!(rig.manager.set_auto_disconnect_threshold(12).await.unwrap(), 0);
        rig.manager
            .set_scan_timeout(Duration::from_secs(2))
            .await
            .unwrap();

        rig.manager.start_scanning().await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(
            rig.manager.discovery_state().await.unwrap(),
            DiscoveryState::Inactive
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_loss_while_scanning() {
        let rig = rig().await;
        rig.manager.start_scanning().await.unwrap();
        rig.sink.emit(TransportEvent::PowerStateChanged { ready: false });
        settle().await;
        assert_eq!(
            rig.manager.discovery_state().await.unwrap(),
            DiscoveryState::NotReady
        );
        assert_eq!(
            rig.manager.start_scanning().await.unwrap(),
            DiscoveryState::NotReady
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_handle() {
        let mut rig = rig().await;
        connect(&mut rig).await;
        drain(&mut rig.events);

        rig.manager.shutdown().await.unwrap();
        settle().await;
        assert!(rig.log.contains(&Call::CancelConnection(TEST_ID)));
        assert!(matches!(
            rig.manager.discovery_state().await,
            Err(ManagerError::Closed)
        ));
        assert!(rig.sink.is_closed());
        assert!(connection_events(&drain(&mut rig.events)).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handles_stops_task() {
        let rig = rig().await;
        let clone = rig.manager.clone();
        drop(rig.manager);
        settle().await;
        assert!(!rig.sink.is_closed());

        drop(clone);
        settle().await;
        assert!(rig.sink.is_closed());
    }
}
