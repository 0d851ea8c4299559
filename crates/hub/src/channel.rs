//! Actuator synchronization. One [`DeviceChannel`] per controllable device
//! (fan, pump, light) owns the hub's belief about that device and the
//! lifecycle of the command currently in flight.
//!
//! ## State machine
//!
//! ```text
//!                    poll: on/off
//! Disconnected ─────────────────────────▶ Known(On|Off)
//!      ▲                                     │
//!      └──── poll failed / "unknown" ◀───────┤ send_command
//!                                            ▼
//!                              Pending(Optimistic, write in flight)
//!                                │                    │
//!                          write failed           write ok
//!                                │                    ▼
//!                                ▼           Pending(awaiting read)
//!                    RolledBack (restore)       │              │
//!                                          read == desired  read != desired
//!                                               ▼              ▼
//!                                           Confirmed   RolledBack (server wins)
//! ```
//!
//! Poll results are tagged with the channel's command generation at request
//! time. The generation moves when a command is issued and again when its
//! write completes, so a read that left before the write landed can never
//! overwrite the optimistic value.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::api::{reported_power, Backend};
use crate::error::{ErrorKind, SyncError};
use crate::state::{Change, EventKind, Notifier};
use crate::timestamp::{normalize, RawTimestamp, Timestamp};

// ---------------------------------------------------------------------------
// Identity & values
// ---------------------------------------------------------------------------

/// Internal actuator id, lowercase (`"fan"`). The backend knows it by its
/// capitalized name (`"Fan"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn backend_name(&self) -> String {
        let mut chars = self.0.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect(),
            None => String::new(),
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `Unknown` means no authoritative value. It is never the same as `Off`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    On,
    Off,
    Unknown,
}

impl PowerState {
    pub fn is_known(self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    On,
    Off,
}

impl DesiredState {
    pub fn as_wire(self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
        }
    }
}

impl From<DesiredState> for PowerState {
    fn from(d: DesiredState) -> Self {
        match d {
            DesiredState::On => Self::On,
            DesiredState::Off => Self::Off,
        }
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    Optimistic,
    Confirmed,
    RolledBack,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Command {
    pub device_id: DeviceId,
    pub desired: DesiredState,
    pub issued_at: Timestamp,
    pub attempt_state: AttemptState,
}

/// What the channel believed before an optimistic update.
#[derive(Debug, Clone, Copy)]
struct Belief {
    reported: PowerState,
    reported_at: Option<Timestamp>,
}

/// The one outstanding command. Always `Optimistic`; it leaves this slot
/// only by being consumed into a `Confirmed` or `RolledBack` [`Command`].
#[derive(Debug)]
struct PendingCommand {
    command: Command,
    before: Belief,
    write_in_flight: bool,
}

impl PendingCommand {
    fn confirm(self) -> Command {
        Command {
            attempt_state: AttemptState::Confirmed,
            ..self.command
        }
    }

    fn roll_back(self) -> (Command, Belief) {
        (
            Command {
                attempt_state: AttemptState::RolledBack,
                ..self.command
            },
            self.before,
        )
    }
}

// ---------------------------------------------------------------------------
// Channel state
// ---------------------------------------------------------------------------

/// Read-only view of a channel, as handed to snapshots.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceChannelState {
    pub device_id: DeviceId,
    pub reported: PowerState,
    pub reported_at: Option<Timestamp>,
    pub pending: Option<Command>,
    pub last_command: Option<Command>,
    pub last_error: Option<ErrorKind>,
}

#[derive(Debug)]
struct Inner {
    reported: PowerState,
    reported_at: Option<Timestamp>,
    last_error: Option<ErrorKind>,
    pending: Option<PendingCommand>,
    last_command: Option<Command>,
    generation: u64,
}

/// Outcome of applying a read, for logging once the lock is released.
enum Reconciled {
    Nothing,
    Confirmed(Command),
    Overridden(Command, PowerState),
}

impl Inner {
    fn apply_read(
        &mut self,
        result: Result<(PowerState, Option<&RawTimestamp>), &SyncError>,
        called_at: Timestamp,
    ) -> Reconciled {
        match result {
            Ok((state, time)) => {
                self.reported = state;
                self.reported_at = state
                    .is_known()
                    .then(|| normalize(time).unwrap_or(called_at));
                self.last_error = None;
            }
            Err(e) => {
                self.reported = PowerState::Unknown;
                self.reported_at = None;
                self.last_error = Some(e.kind());
            }
        }

        let Some(pending) = self.pending.take() else {
            return Reconciled::Nothing;
        };
        if self.reported == pending.command.desired.into() {
            let cmd = pending.confirm();
            self.last_command = Some(cmd.clone());
            Reconciled::Confirmed(cmd)
        } else {
            // The server is authoritative; the optimistic value was a hint.
            let (cmd, _) = pending.roll_back();
            self.last_command = Some(cmd.clone());
            Reconciled::Overridden(cmd, self.reported)
        }
    }
}

pub struct DeviceChannel {
    device_id: DeviceId,
    backend: Arc<dyn Backend>,
    confirm_delay: Duration,
    inner: Mutex<Inner>,
    notify: Notifier,
    disposed: AtomicBool,
}

impl DeviceChannel {
    pub fn new(
        device_id: DeviceId,
        backend: Arc<dyn Backend>,
        confirm_delay: Duration,
        notify: Notifier,
    ) -> Self {
        Self {
            device_id,
            backend,
            confirm_delay,
            inner: Mutex::new(Inner {
                reported: PowerState::Unknown,
                reported_at: None,
                last_error: None,
                pending: None,
                last_command: None,
                generation: 0,
            }),
            notify,
            disposed: AtomicBool::new(false),
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn state(&self) -> DeviceChannelState {
        let inner = self.lock();
        DeviceChannelState {
            device_id: self.device_id.clone(),
            reported: inner.reported,
            reported_at: inner.reported_at,
            pending: inner.pending.as_ref().map(|p| p.command.clone()),
            last_command: inner.last_command.clone(),
            last_error: inner.last_error,
        }
    }

    /// Stop acting on network results. Idempotent.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    // -- Reads ---------------------------------------------------------------

    /// Read the device status and fold it into the channel. Failures are
    /// recorded on the channel (Disconnected + `last_error`) and also
    /// returned so the scheduler can report the tick.
    pub async fn poll(&self) -> Result<PowerState, SyncError> {
        if self.is_disposed() {
            return Err(SyncError::InvalidState(format!(
                "{} channel disposed",
                self.device_id
            )));
        }

        let issued_generation = self.lock().generation;
        let called_at = Timestamp::now();

        let result = self
            .backend
            .actuator_status(&self.device_id)
            .await
            .and_then(|p| reported_power(&p, &self.device_id).map(|s| (s, p.time)));

        if self.is_disposed() {
            return result.map(|(s, _)| s);
        }

        let (reconciled, newly_failed) = {
            let mut inner = self.lock();
            let write_in_flight = inner.pending.as_ref().is_some_and(|p| p.write_in_flight);
            if inner.generation != issued_generation || write_in_flight {
                debug!(
                    device = %self.device_id,
                    "discarding poll issued before the latest command landed"
                );
                return result.map(|(s, _)| s);
            }
            let previous_error = inner.last_error;
            let applied = result.as_ref().map(|(s, time)| (*s, time.as_ref()));
            let reconciled = inner.apply_read(applied, called_at);
            let newly_failed = inner.last_error.is_some() && inner.last_error != previous_error;
            (reconciled, newly_failed)
        };

        match (&result, reconciled) {
            (_, Reconciled::Confirmed(cmd)) => {
                info!(device = %self.device_id, desired = cmd.desired.as_wire(), "command confirmed");
                (self.notify)(Change::Event(
                    EventKind::Reconcile,
                    format!("{} confirmed {}", self.device_id, cmd.desired.as_wire()),
                ));
            }
            (_, Reconciled::Overridden(cmd, actual)) => {
                warn!(
                    device = %self.device_id,
                    desired = cmd.desired.as_wire(),
                    actual = ?actual,
                    "server contradicted command; trusting server"
                );
                (self.notify)(Change::Event(
                    EventKind::Reconcile,
                    format!(
                        "{} rolled back {} (server reports {actual:?})",
                        self.device_id,
                        cmd.desired.as_wire()
                    ),
                ));
            }
            (Err(e), Reconciled::Nothing) if newly_failed => {
                warn!(device = %self.device_id, error = %e, "status poll failed");
                (self.notify)(Change::Event(
                    EventKind::Poll,
                    format!("{} unavailable: {e}", self.device_id),
                ));
            }
            (_, Reconciled::Nothing) => (self.notify)(Change::State),
        }

        result.map(|(s, _)| s)
    }

    // -- Commands ------------------------------------------------------------

    /// Validate and apply a command optimistically. No network I/O happens
    /// here; follow with [`execute_command`](Self::execute_command).
    pub fn begin_command(&self, desired: DesiredState) -> Result<Command, SyncError> {
        let command = {
            let mut inner = self.lock();
            if self.is_disposed() {
                return Err(SyncError::InvalidState(format!(
                    "{} channel disposed",
                    self.device_id
                )));
            }
            if !inner.reported.is_known() {
                return Err(SyncError::InvalidState(format!(
                    "{} state is unknown",
                    self.device_id
                )));
            }
            if let Some(p) = &inner.pending {
                return Err(SyncError::InvalidState(format!(
                    "{} already has a pending command ({})",
                    self.device_id,
                    p.command.desired.as_wire()
                )));
            }

            let command = Command {
                device_id: self.device_id.clone(),
                desired,
                issued_at: Timestamp::now(),
                attempt_state: AttemptState::Optimistic,
            };
            inner.pending = Some(PendingCommand {
                command: command.clone(),
                before: Belief {
                    reported: inner.reported,
                    reported_at: inner.reported_at,
                },
                write_in_flight: true,
            });
            inner.reported = desired.into();
            inner.reported_at = Some(command.issued_at);
            inner.generation += 1;
            command
        };

        info!(device = %self.device_id, desired = desired.as_wire(), "command issued");
        (self.notify)(Change::Event(
            EventKind::Command,
            format!("{} set {}", self.device_id, desired.as_wire()),
        ));
        Ok(command)
    }

    /// Send the write for a command from [`begin_command`](Self::begin_command),
    /// then reconcile: roll back on failure, or confirm with a read after the
    /// configured delay.
    pub async fn execute_command(&self, command: Command) {
        let result = self
            .backend
            .control_actuator(&self.device_id, command.desired, command.issued_at)
            .await;

        if self.is_disposed() {
            return;
        }

        match result {
            Ok(()) => {
                {
                    let mut guard = self.lock();
                    let inner = &mut *guard;
                    match inner.pending.as_mut() {
                        Some(p) if p.command == command => {
                            p.write_in_flight = false;
                            inner.generation += 1;
                        }
                        _ => return,
                    }
                }
                debug!(
                    device = %self.device_id,
                    delay_ms = self.confirm_delay.as_millis() as u64,
                    "write accepted; scheduling confirmation read"
                );
                tokio::time::sleep(self.confirm_delay).await;
                if !self.is_disposed() {
                    // Failure is already recorded on the channel.
                    let _ = self.poll().await;
                }
            }
            Err(e) => {
                let rolled_back = {
                    let mut inner = self.lock();
                    match inner.pending.take() {
                        Some(p) if p.command == command => {
                            let (cmd, before) = p.roll_back();
                            inner.reported = before.reported;
                            inner.reported_at = before.reported_at;
                            inner.last_error = Some(e.kind());
                            inner.last_command = Some(cmd);
                            inner.generation += 1;
                            true
                        }
                        other => {
                            inner.pending = other;
                            false
                        }
                    }
                };
                if rolled_back {
                    warn!(device = %self.device_id, error = %e, "command write failed; rolled back");
                    (self.notify)(Change::Event(
                        EventKind::Error,
                        format!(
                            "{} set {} failed: {e}",
                            self.device_id,
                            command.desired.as_wire()
                        ),
                    ));
                }
            }
        }
    }

    /// [`begin_command`](Self::begin_command) + [`execute_command`](Self::execute_command).
    pub async fn send_command(&self, desired: DesiredState) -> Result<Command, SyncError> {
        let command = self.begin_command(desired)?;
        self.execute_command(command.clone()).await;
        Ok(command)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
