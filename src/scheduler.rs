//! Named, cancelable timers delivered into the manager's event loop.
//!
//! Each timer runs as a small tokio task that sends a [`TimerFired`] message
//! back to the owner instead of calling into shared state. Firings are
//! therefore ordered with every other event the manager handles.
//!
//! A cancelled timer's task is aborted, but a firing may already be queued in
//! the channel. Every firing carries the generation it was scheduled with and
//! [`Scheduler::accept`] rejects any that no longer match, so a cancelled
//! timer never reaches its handler.

use crate::device_id::DeviceId;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::trace;

/// Identifies a timer. Scheduling a key that is already active replaces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKey {
    /// Periodic stop and restart of the scan.
    ScanRefresh,
    /// Demotes scanning to inactive after the configured timeout.
    ScanTimeout,
    /// Periodic sweep of stale discovered beacons.
    Expiration,
    /// Periodic signal read of connected beacons.
    SignalPoll,
    AutoDisconnect(DeviceId),
    ReconnectTimeout(DeviceId),
}

/// Message sent when a timer elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub key: TimerKey,
    generation: u64,
}

#[derive(Debug)]
struct Scheduled {
    generation: u64,
    repeating: bool,
    task: JoinHandle<()>,
}

/// Owner of all active timers.
#[derive(Debug)]
pub struct Scheduler {
    tx: mpsc::UnboundedSender<TimerFired>,
    timers: HashMap<TimerKey, Scheduled>,
    next_generation: u64,
}

impl Scheduler {
    /// Create a scheduler and the receiver its firings arrive on.
    ///
    /// Timers are tokio tasks, so scheduling requires a running runtime.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TimerFired>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                timers: HashMap::new(),
                next_generation: 0,
            },
            rx,
        )
    }

    /// Fire `key` once after `delay`.
    pub fn once(&mut self, key: TimerKey, delay: Duration) {
        let fired = self.prepare(key);
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(fired);
        });
        self.insert(fired, false, task);
    }

    /// Fire `key` every `period`, starting one period from now.
    pub fn repeating(&mut self, key: TimerKey, period: Duration) {
        let fired = self.prepare(key);
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if tx.send(fired).is_err() {
                    break;
                }
            }
        });
        self.insert(fired, true, task);
    }

    fn prepare(&mut self, key: TimerKey) -> TimerFired {
        self.cancel(key);
        self.next_generation += 1;
        TimerFired {
            key,
            generation: self.next_generation,
        }
    }

    fn insert(&mut self, fired: TimerFired, repeating: bool, task: JoinHandle<()>) {
        trace!(key = ?fired.key, repeating, "timer scheduled");
        self.timers.insert(
            fired.key,
            Scheduled {
                generation: fired.generation,
                repeating,
                task,
            },
        );
    }

    /// Cancel a timer. Returns `false` if it was not active.
    pub fn cancel(&mut self, key: TimerKey) -> bool {
        match self.timers.remove(&key) {
            Some(scheduled) => {
                scheduled.task.abort();
                trace!(?key, "timer cancelled");
                true
            }
            None => false,
        }
    }

    pub fn is_scheduled(&self, key: TimerKey) -> bool {
        self.timers.contains_key(&key)
    }

    /// Check a received firing against the active timers.
    ///
    /// Returns `true` if the firing belongs to the timer currently scheduled
    /// under its key. A one-shot timer is retired by its accepted firing.
    pub fn accept(&mut self, fired: &TimerFired) -> bool {
        match self.timers.get(&fired.key) {
            Some(scheduled) if scheduled.generation == fired.generation => {
                if !scheduled.repeating {
                    self.timers.remove(&fired.key);
                }
                true
            }
            _ => {
                trace!(key = ?fired.key, "stale timer firing ignored");
                false
            }
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, scheduled) in self.timers.drain() {
            scheduled.task.abort();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
