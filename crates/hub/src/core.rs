//! Composition root for one monitored greenhouse: device channels, sensor
//! feeds, their poll schedules, and the snapshot published to subscribers.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::api::Backend;
use crate::channel::{Command, DesiredState, DeviceChannel, DeviceId};
use crate::config::{Config, MonitoredContext};
use crate::error::SyncError;
use crate::feed::{FeedMode, SensorFeed, SensorReading};
use crate::health::{compute, device_probes, sensor_probes};
use crate::scheduler::PollingScheduler;
use crate::state::{Change, EventKind, EventLog, Notifier, Snapshot};
use crate::thresholds::{evaluate, Thresholds};
use crate::timestamp::Timestamp;

/// How often staleness counters are republished.
const STALENESS_TICK: Duration = Duration::from_secs(1);

pub type Listener = Arc<dyn Fn(&Snapshot) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub struct SyncCore {
    context: MonitoredContext,
    sensor_keys: Vec<String>,
    thresholds: Thresholds,
    channels: Vec<Arc<DeviceChannel>>,
    latest: Arc<SensorFeed>,
    history: Arc<SensorFeed>,
    scheduler: PollingScheduler,
    events: Mutex<EventLog>,
    /// Guards revision assignment so snapshots are published in order.
    revision: Mutex<u64>,
    snapshot_tx: watch::Sender<Arc<Snapshot>>,
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    next_listener: AtomicU64,
    runtime: Handle,
    disposed: AtomicBool,
}

impl SyncCore {
    /// Build every channel and feed for `context` and start polling. Must be
    /// called from within a tokio runtime.
    pub fn start(
        config: &Config,
        context: MonitoredContext,
        backend: Arc<dyn Backend>,
    ) -> Arc<Self> {
        let core = Arc::new_cyclic(|weak: &Weak<SyncCore>| {
            let notify: Notifier = {
                let weak = weak.clone();
                Arc::new(move |change| {
                    if let Some(core) = weak.upgrade() {
                        core.on_change(change);
                    }
                })
            };

            let channels = config
                .devices
                .iter()
                .map(|id| {
                    Arc::new(DeviceChannel::new(
                        DeviceId::new(id.as_str()),
                        backend.clone(),
                        config.sync.confirm_delay(),
                        notify.clone(),
                    ))
                })
                .collect();
            let latest = Arc::new(SensorFeed::new(
                "latest",
                FeedMode::Latest,
                backend.clone(),
                notify.clone(),
            ));
            let history = Arc::new(SensorFeed::new(
                "history",
                FeedMode::History {
                    capacity: config.sync.history_capacity,
                },
                backend.clone(),
                notify,
            ));

            let (snapshot_tx, _) = watch::channel(Arc::new(Snapshot {
                revision: 0,
                context: context.clone(),
                health: compute(&[], 0),
                devices: Vec::new(),
                sensors: latest.state(),
                history: history.state(),
                alerts: Vec::new(),
                events: Vec::new(),
            }));

            SyncCore {
                context,
                sensor_keys: config.sensor_keys.clone(),
                thresholds: config.thresholds.clone(),
                channels,
                latest,
                history,
                scheduler: PollingScheduler::new(),
                events: Mutex::new(EventLog::default()),
                revision: Mutex::new(0),
                snapshot_tx,
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(1),
                runtime: Handle::current(),
                disposed: AtomicBool::new(false),
            }
        });

        core.schedule_polls(config.sync.poll_interval());
        info!(
            greenhouse = %core.context.greenhouse_id,
            devices = core.channels.len(),
            "sync started"
        );
        core.on_change(Change::Event(
            EventKind::System,
            format!("monitoring {} ({})", core.context.greenhouse_name, core.context.farm_name),
        ));
        core
    }

    fn schedule_polls(self: &Arc<Self>, every: Duration) {
        for channel in &self.channels {
            let channel = channel.clone();
            self.scheduler
                .schedule(&format!("device:{}", channel.device_id()), every, move || {
                    let channel = channel.clone();
                    async move { channel.poll().await }
                });
        }
        for feed in [&self.latest, &self.history] {
            let feed = feed.clone();
            self.scheduler
                .schedule(&format!("sensors:{}", feed.name()), every, move || {
                    let feed = feed.clone();
                    async move { feed.poll().await }
                });
        }

        let weak = Arc::downgrade(self);
        self.scheduler.schedule("staleness", STALENESS_TICK, move || {
            if let Some(core) = weak.upgrade() {
                core.recompute();
            }
            std::future::ready(Ok::<_, SyncError>(()))
        });
    }

    // -- Reads ---------------------------------------------------------------

    /// Latest published snapshot. Never blocks on I/O.
    pub fn get_snapshot(&self) -> Arc<Snapshot> {
        self.snapshot_tx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.snapshot_tx.subscribe()
    }

    pub fn subscribe(&self, listener: impl Fn(&Snapshot) + Send + Sync + 'static) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        lock(&self.listeners).push((id, Arc::new(listener)));
        id
    }

    /// Returns false when `id` was not subscribed.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = lock(&self.listeners);
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// History readings within `window` of now, ascending.
    pub fn history_window(&self, window: Duration) -> Vec<SensorReading> {
        self.history.history_window(Timestamp::now(), window)
    }

    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.channels.iter().map(|c| c.device_id().clone()).collect()
    }

    // -- Commands ------------------------------------------------------------

    /// Validate and apply optimistically, then write and reconcile in the
    /// background. Only `InvalidState` and `UnknownDevice` are returned.
    pub fn send_command(&self, device: &str, desired: DesiredState) -> Result<Command, SyncError> {
        if self.is_disposed() {
            return Err(SyncError::InvalidState("sync core disposed".into()));
        }
        let channel = self
            .channels
            .iter()
            .find(|c| c.device_id().as_str() == device)
            .ok_or_else(|| SyncError::UnknownDevice(device.to_string()))?
            .clone();

        let command = channel.begin_command(desired)?;
        let pending = command.clone();
        self.runtime.spawn(async move {
            channel.execute_command(pending).await;
        });
        Ok(command)
    }

    // -- Lifecycle -----------------------------------------------------------

    /// Cancel every task and stop acting on in-flight results. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.scheduler.cancel_all();
        for channel in &self.channels {
            channel.dispose();
        }
        self.latest.dispose();
        self.history.dispose();
        lock(&self.listeners).clear();
        info!(greenhouse = %self.context.greenhouse_id, "sync disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    // -- Recompute -----------------------------------------------------------

    fn on_change(&self, change: Change) {
        if self.is_disposed() {
            return;
        }
        if let Change::Event(kind, detail) = change {
            lock(&self.events).push(kind, detail);
        }
        self.recompute();
    }

    fn recompute(&self) {
        if self.is_disposed() {
            return;
        }

        let snapshot = {
            let mut revision = lock(&self.revision);

            let devices: Vec<_> = self.channels.iter().map(|c| c.state()).collect();
            let sensors = self.latest.state();
            let history = self.history.state();

            let mut probes = sensor_probes(&sensors, &self.sensor_keys);
            probes.extend(device_probes(&devices));
            let health = compute(&probes, self.sensor_keys.len() + devices.len());

            let alerts = sensors
                .latest
                .as_ref()
                .map(|r| evaluate(r, &self.thresholds))
                .unwrap_or_default();
            let events = lock(&self.events).recent();

            *revision += 1;
            let snapshot = Arc::new(Snapshot {
                revision: *revision,
                context: self.context.clone(),
                health,
                devices,
                sensors,
                history,
                alerts,
                events,
            });
            self.snapshot_tx.send_replace(snapshot.clone());
            snapshot
        };

        let listeners: Vec<Listener> = lock(&self.listeners)
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener(&snapshot);
        }
        debug!(revision = snapshot.revision, status = ?snapshot.health.status, "snapshot published");
    }
}

impl Drop for SyncCore {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ===========================================================================
// Tests
// ===========================================================================
