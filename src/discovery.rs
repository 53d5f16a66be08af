//! Scan lifecycle and the set of discovered beacons.

use crate::attribute::BEACON_SERVICE;
use crate::beacon::{Advertisement, BeaconRecord};
use crate::device_id::DeviceId;
use crate::event::{DiscoveryState, Event};
use crate::manager::Context;
use crate::scheduler::TimerKey;
use crate::signal::{RSSI_UNAVAILABLE, Rssi};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Period of the scan stop/restart cycle while scanning.
pub const SCAN_REFRESH_INTERVAL: Duration = Duration::from_secs(5);
/// Period of the stale-record sweep.
pub const EXPIRATION_INTERVAL: Duration = Duration::from_secs(1);
/// A discovered record unseen for longer than this is dropped.
pub const STALE_AFTER: Duration = Duration::from_secs(5);

/// Owns the scan state machine and the discovered set.
///
/// The discovered set is kept ordered by `first_seen_at`, oldest first.
#[derive(Debug, Default)]
pub struct DiscoveryEngine {
    state: DiscoveryState,
    radio_ready: bool,
    discovered: Vec<BeaconRecord>,
}

impl DiscoveryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> DiscoveryState {
        self.state
    }

    pub fn discovered(&self) -> &[BeaconRecord] {
        &self.discovered
    }

    pub fn get(&self, id: DeviceId) -> Option<&BeaconRecord> {
        self.discovered.iter().find(|r| r.id() == id)
    }

    pub(crate) fn on_power_state(&mut self, ready: bool, ctx: &mut Context) {
        self.radio_ready = ready;
        if !ready {
            self.transition(DiscoveryState::NotReady, ctx);
        } else if self.state == DiscoveryState::NotReady {
            self.transition(DiscoveryState::Inactive, ctx);
        }
    }

    pub(crate) fn start_scanning(&mut self, ctx: &mut Context) -> DiscoveryState {
        self.transition(DiscoveryState::Scanning, ctx);
        self.state
    }

    pub(crate) fn stop_scanning(&mut self, ctx: &mut Context) -> DiscoveryState {
        if self.state == DiscoveryState::Scanning {
            self.transition(DiscoveryState::Inactive, ctx);
        }
        self.state
    }

    fn transition(&mut self, requested: DiscoveryState, ctx: &mut Context) {
        let new = match requested {
            DiscoveryState::Scanning if !self.radio_ready => {
                debug!("radio not ready, cannot scan");
                DiscoveryState::NotReady
            }
            other => other,
        };
        if new == self.state {
            return;
        }

        let old = self.state;
        if old == DiscoveryState::Scanning {
            self.leave_scanning(ctx);
        }
        self.state = new;
        if new == DiscoveryState::Scanning {
            self.enter_scanning(ctx);
        }

        info!(%old, %new, "discovery state changed");
        ctx.notify(Event::DiscoveryStateChanged { old, new });
    }

    fn enter_scanning(&mut self, ctx: &mut Context) {
        ctx.transport.start_scan(BEACON_SERVICE);
        ctx.scheduler.repeating(TimerKey::ScanRefresh, SCAN_REFRESH_INTERVAL);
        let timeout = ctx.settings.scan_timeout();
        if !timeout.is_zero() {
            ctx.scheduler.once(TimerKey::ScanTimeout, timeout);
        }
        ctx.scheduler.repeating(TimerKey::Expiration, EXPIRATION_INTERVAL);
    }

    fn leave_scanning(&mut self, ctx: &mut Context) {
        ctx.transport.stop_scan();
        ctx.scheduler.cancel(TimerKey::ScanRefresh);
        ctx.scheduler.cancel(TimerKey::Expiration);
        ctx.scheduler.cancel(TimerKey::ScanTimeout);
    }

    /// Restart the platform scan so it keeps reporting duplicates.
    pub(crate) fn on_scan_refresh(&mut self, ctx: &mut Context) {
        if self.state == DiscoveryState::Scanning {
            ctx.transport.stop_scan();
            ctx.transport.start_scan(BEACON_SERVICE);
        }
    }

    pub(crate) fn on_scan_timeout(&mut self, ctx: &mut Context) {
        if self.state == DiscoveryState::Scanning {
            debug!("scan timed out");
            self.transition(DiscoveryState::Inactive, ctx);
        }
    }

    /// Drop every record unseen for longer than [`STALE_AFTER`].
    ///
    /// # Returns
    /// The number of records removed.
    pub fn expire(&mut self, now: Instant) -> usize {
        let before = self.discovered.len();
        self.discovered.retain(|record| {
            let stale = now.saturating_duration_since(record.last_seen_at) > STALE_AFTER;
            if stale {
                debug!(device = %record.id(), "discovered beacon expired");
            }
            !stale
        });
        before - self.discovered.len()
    }

    /// Fold a discovery sample into the discovered set.
    ///
    /// Samples are ignored unless scanning, when they carry no signal, or
    /// when `owned` reports the device as already held by a connection.
    ///
    /// # Returns
    /// The record, removed from the discovered set, when its filtered signal
    /// crossed the auto-connect threshold.
    pub(crate) fn on_device_discovered(
        &mut self,
        id: DeviceId,
        raw_signal: Rssi,
        advertisement: &Advertisement,
        now: Instant,
        owned: bool,
        ctx: &Context,
    ) -> Option<BeaconRecord> {
        if self.state != DiscoveryState::Scanning || raw_signal == RSSI_UNAVAILABLE || owned {
            return None;
        }

        let index = match self.discovered.iter().position(|r| r.id() == id) {
            Some(index) => index,
            None => {
                debug!(device = %id, raw_signal, "beacon discovered");
                self.discovered.push(BeaconRecord::new(id, now));
                self.discovered.len() - 1
            }
        };
        self.discovered[index].on_discovered(raw_signal, advertisement, now);
        let filtered = self.discovered[index].filtered_signal;
        self.discovered.sort_by_key(|r| r.first_seen_at);

        let threshold = ctx.settings.auto_connect_threshold();
        if threshold == 0 || filtered <= threshold {
            return None;
        }
        let index = self.discovered.iter().position(|r| r.id() == id)?;
        debug!(device = %id, filtered, threshold, "auto-connect threshold crossed");
        Some(self.discovered.remove(index))
    }

    /// A link came up: stop the scan and forget stale scan results.
    pub(crate) fn on_link_established(&mut self, ctx: &mut Context) {
        if self.state == DiscoveryState::Scanning {
            ctx.transport.stop_scan();
        }
        self.discovered.clear();
    }

    pub(crate) fn shutdown(&mut self, ctx: &mut Context) {
        self.stop_scanning(ctx);
        self.discovered.clear();
    }
}
