//! Sync trigger scheduler.
//!
//! Turns trigger events into sync passes. Each provider has its own worker
//! task, so at most one pass per provider is in flight while passes of
//! different providers run concurrently.
//!
//! - Immediate triggers (startup, connectivity back after a long offline
//!   window, focus after long inactivity, timer, manual) run as soon as the
//!   provider is idle.
//! - Routine triggers (local edits, short interruptions) wait for a quiet
//!   period of `debounce`, but never longer than `max_wait` after the first
//!   one.
//! - Any number of triggers arriving while a pass runs collapse into one
//!   trailing pass.

use crate::retry::millis;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use strata_core::{LocalChange, ProviderId};
use tokio::sync::{Notify, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Quiet period after the last routine trigger
    #[serde(with = "millis")]
    pub debounce: Duration,
    /// Upper bound on how long a routine trigger may be deferred
    #[serde(with = "millis")]
    pub max_wait: Duration,
    /// Periodic sync; zero disables the timer
    #[serde(with = "millis")]
    pub interval: Duration,
    /// Focus after at least this much inactivity syncs immediately
    #[serde(with = "millis")]
    pub long_inactivity: Duration,
    /// Reconnecting after at least this much time offline syncs immediately
    #[serde(with = "millis")]
    pub offline_threshold: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(2),
            max_wait: Duration::from_secs(20),
            interval: Duration::from_secs(300),
            long_inactivity: Duration::from_secs(5 * 60),
            offline_threshold: Duration::from_secs(60),
        }
    }
}

/// Why a sync pass was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    /// First sync after startup
    InitialSync,
    ConnectivityRegained { offline_for: Duration },
    AppFocused { inactive_for: Duration },
    /// A save went through the persistence gateway
    LocalDataChanged,
    Timer,
    /// Explicitly requested by the user
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TriggerClass {
    Routine,
    Immediate,
}

impl SyncTrigger {
    pub fn class(&self, settings: &SchedulerSettings) -> TriggerClass {
        match self {
            SyncTrigger::InitialSync | SyncTrigger::Timer | SyncTrigger::Manual => TriggerClass::Immediate,
            SyncTrigger::ConnectivityRegained { offline_for } if *offline_for >= settings.offline_threshold => {
                TriggerClass::Immediate
            }
            SyncTrigger::AppFocused { inactive_for } if *inactive_for >= settings.long_inactivity => {
                TriggerClass::Immediate
            }
            _ => TriggerClass::Routine,
        }
    }
}

/// Runs one sync pass. Errors are the runner's business.
#[async_trait]
pub trait SyncRunner: Send + Sync {
    async fn run(&self, provider: &ProviderId, trigger: SyncTrigger);
}

// ─────────────────────────────────────────────────────
// Per-provider trigger state
// ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Pending {
    /// Strongest trigger seen, the latest one among equals
    trigger: SyncTrigger,
    class: TriggerClass,
    first_at: Instant,
    last_at: Instant,
}

#[derive(Default)]
struct Slot {
    pending: Mutex<Option<Pending>>,
    notify: Notify,
}

impl Slot {
    fn push(&self, trigger: SyncTrigger, class: TriggerClass) {
        let now = Instant::now();
        {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            match pending.as_mut() {
                Some(p) => {
                    if class >= p.class {
                        p.trigger = trigger;
                        p.class = class;
                    }
                    p.last_at = now;
                }
                None => {
                    *pending = Some(Pending {
                        trigger,
                        class,
                        first_at: now,
                        last_at: now,
                    })
                }
            }
        }
        self.notify.notify_one();
    }

    fn take(&self) -> Option<Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    fn deadline(&self, settings: &SchedulerSettings) -> Option<Instant> {
        let pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.as_ref().map(|p| match p.class {
            TriggerClass::Immediate => p.last_at,
            TriggerClass::Routine => (p.last_at + settings.debounce).min(p.first_at + settings.max_wait),
        })
    }
}

struct Shared {
    slots: BTreeMap<ProviderId, Slot>,
    settings: SchedulerSettings,
}

impl Shared {
    fn trigger(&self, trigger: SyncTrigger) {
        let class = trigger.class(&self.settings);
        for slot in self.slots.values() {
            slot.push(trigger, class);
        }
    }
}

// ─────────────────────────────────────────────────────
// Scheduler
// ─────────────────────────────────────────────────────

pub struct SyncTriggerScheduler {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl SyncTriggerScheduler {
    /// Spawns one worker per provider. Must be called within a tokio runtime.
    pub fn start(
        runner: Arc<dyn SyncRunner>,
        providers: impl IntoIterator<Item = ProviderId>,
        settings: SchedulerSettings,
    ) -> Self {
        let slots = providers.into_iter().map(|id| (id, Slot::default())).collect();
        let shared = Arc::new(Shared { slots, settings });
        let (shutdown, _) = watch::channel(false);
        let workers = shared
            .slots
            .keys()
            .map(|id| {
                tokio::spawn(worker(
                    id.clone(),
                    Arc::clone(&shared),
                    Arc::clone(&runner),
                    shutdown.subscribe(),
                ))
            })
            .collect();
        tracing::debug!("Sync scheduler started for {} provider(s)", shared.slots.len());
        Self {
            shared,
            shutdown,
            workers,
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.shared.settings
    }

    pub fn providers(&self) -> impl Iterator<Item = &ProviderId> {
        self.shared.slots.keys()
    }

    /// Requests a pass for every provider.
    pub fn trigger(&self, trigger: SyncTrigger) {
        self.shared.trigger(trigger);
    }

    /// Requests a pass for one provider. Returns false if it is unknown.
    pub fn trigger_provider(&self, provider: &ProviderId, trigger: SyncTrigger) -> bool {
        match self.shared.slots.get(provider) {
            Some(slot) => {
                slot.push(trigger, trigger.class(&self.shared.settings));
                true
            }
            None => false,
        }
    }

    /// Forwards local change notifications as [`SyncTrigger::LocalDataChanged`]
    /// until the channel closes or the scheduler shuts down.
    pub fn attach(&self, mut changes: broadcast::Receiver<LocalChange>) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    change = changes.recv() => match change {
                        Ok(_) => shared.trigger(SyncTrigger::LocalDataChanged),
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            tracing::debug!("Missed {} local change notifications", missed);
                            shared.trigger(SyncTrigger::LocalDataChanged);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        })
    }

    /// Stops accepting work. Passes already running are awaited, pending
    /// triggers are dropped.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for worker in self.workers {
            if let Err(e) = worker.await {
                tracing::error!("Sync worker failed: {}", e);
            }
        }
        tracing::debug!("Sync scheduler stopped");
    }
}

async fn worker(
    provider: ProviderId,
    shared: Arc<Shared>,
    runner: Arc<dyn SyncRunner>,
    mut shutdown: watch::Receiver<bool>,
) {
    let Some(slot) = shared.slots.get(&provider) else {
        return;
    };
    let settings = &shared.settings;
    let mut timer = (!settings.interval.is_zero()).then(|| {
        let mut t = tokio::time::interval_at(Instant::now() + settings.interval, settings.interval);
        t.set_missed_tick_behavior(MissedTickBehavior::Delay);
        t
    });

    loop {
        if *shutdown.borrow() {
            break;
        }
        let deadline = slot.deadline(settings);
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = slot.notify.notified() => {}
            _ = sleep_until(deadline) => {
                if let Some(pending) = slot.take() {
                    // Triggers arriving meanwhile accumulate in the slot
                    runner.run(&provider, pending.trigger).await;
                }
            }
            _ = tick(&mut timer) => slot.push(SyncTrigger::Timer, TriggerClass::Immediate),
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}
