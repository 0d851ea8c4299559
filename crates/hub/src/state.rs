use std::collections::VecDeque;
use std::sync::Arc;

use serde::Serialize;

use crate::channel::DeviceChannelState;
use crate::config::MonitoredContext;
use crate::feed::SensorFeedState;
use crate::health::SystemHealth;
use crate::thresholds::ThresholdAlert;
use crate::timestamp::Timestamp;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Change notification
// ---------------------------------------------------------------------------

/// What a channel or feed reports upward after mutating its state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// State changed; nothing worth logging.
    State,
    /// State changed and the event log should record why.
    Event(EventKind, String),
}

pub type Notifier = Arc<dyn Fn(Change) + Send + Sync>;

pub fn noop_notifier() -> Notifier {
    Arc::new(|_| {})
}

// ---------------------------------------------------------------------------
// Event log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct SyncEvent {
    pub ts: Timestamp,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Command,
    Reconcile,
    Poll,
    Error,
    System,
}

#[derive(Debug)]
pub struct EventLog {
    events: VecDeque<SyncEvent>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self {
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }
}

impl EventLog {
    pub fn push(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SyncEvent {
            ts: Timestamp::now(),
            kind,
            detail,
        });
    }

    /// Newest first.
    pub fn recent(&self) -> Vec<SyncEvent> {
        self.events.iter().rev().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Snapshot (what subscribers and the API see)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    /// Strictly increasing per SyncCore.
    pub revision: u64,
    pub context: MonitoredContext,
    pub health: SystemHealth,
    pub devices: Vec<DeviceChannelState>,
    pub sensors: SensorFeedState,
    pub history: SensorFeedState,
    pub alerts: Vec<ThresholdAlert>,
    pub events: Vec<SyncEvent>,
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recent_is_newest_first() {
        let mut log = EventLog::default();
        log.push(EventKind::System, "started".into());
        log.push(EventKind::Command, "fan set on".into());

        let recent = log.recent();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].detail, "fan set on");
        assert_eq!(recent[1].kind, EventKind::System);
    }

    #[test]
    fn ring_buffer_drops_oldest() {
        let mut log = EventLog::default();
        for i in 0..MAX_EVENTS + 5 {
            log.push(EventKind::Poll, format!("e{i}"));
        }
        assert_eq!(log.len(), MAX_EVENTS);

        let recent = log.recent();
        assert_eq!(recent[0].detail, format!("e{}", MAX_EVENTS + 4));
        assert_eq!(recent.last().unwrap().detail, "e5");
    }

    #[test]
    fn event_kind_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(EventKind::Reconcile).unwrap(),
            "reconcile"
        );
    }
}
