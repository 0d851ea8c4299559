//! Scripted in-memory backend shared by the channel, feed and core tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::api::{Backend, RawReading, StatusPayload};
use crate::channel::{DesiredState, DeviceId};
use crate::error::SyncError;
use crate::timestamp::{RawTimestamp, Timestamp};

/// Responses are served in push order; once the queue drains, the last
/// served response repeats.
struct Script<T> {
    queue: VecDeque<T>,
    last: Option<T>,
}

impl<T: Clone> Script<T> {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            last: None,
        }
    }

    fn push(&mut self, item: T) {
        self.queue.push_back(item);
    }

    fn next(&mut self) -> Option<T> {
        if let Some(item) = self.queue.pop_front() {
            self.last = Some(item);
        }
        self.last.clone()
    }
}

pub(crate) struct FakeBackend {
    statuses: Mutex<HashMap<String, Script<Result<StatusPayload, SyncError>>>>,
    controls: Mutex<Script<Result<(), SyncError>>>,
    latest: Mutex<Script<Result<Option<RawReading>, SyncError>>>,
    all: Mutex<Script<Result<Vec<RawReading>, SyncError>>>,
    status_delay: Mutex<Duration>,
    control_delay: Mutex<Duration>,
    control_calls: Mutex<Vec<(String, DesiredState)>>,
    status_calls: AtomicUsize,
    latest_calls: AtomicUsize,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            statuses: Mutex::new(HashMap::new()),
            controls: Mutex::new(Script::new()),
            latest: Mutex::new(Script::new()),
            all: Mutex::new(Script::new()),
            status_delay: Mutex::new(Duration::ZERO),
            control_delay: Mutex::new(Duration::ZERO),
            control_calls: Mutex::new(Vec::new()),
            status_calls: AtomicUsize::new(0),
            latest_calls: AtomicUsize::new(0),
        }
    }

    pub fn push_status(&self, device: &str, r: Result<StatusPayload, SyncError>) {
        self.statuses
            .lock()
            .unwrap()
            .entry(device.to_string())
            .or_insert_with(Script::new)
            .push(r);
    }

    pub fn push_control(&self, r: Result<(), SyncError>) {
        self.controls.lock().unwrap().push(r);
    }

    pub fn push_latest(&self, r: Result<Option<RawReading>, SyncError>) {
        self.latest.lock().unwrap().push(r);
    }

    pub fn push_all(&self, r: Result<Vec<RawReading>, SyncError>) {
        self.all.lock().unwrap().push(r);
    }

    pub fn set_status_delay(&self, d: Duration) {
        *self.status_delay.lock().unwrap() = d;
    }

    pub fn set_control_delay(&self, d: Duration) {
        *self.control_delay.lock().unwrap() = d;
    }

    pub fn control_calls(&self) -> Vec<(String, DesiredState)> {
        self.control_calls.lock().unwrap().clone()
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn latest_calls(&self) -> usize {
        self.latest_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn latest_reading(&self) -> Result<Option<RawReading>, SyncError> {
        self.latest_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.latest.lock().unwrap().next();
        next.unwrap_or(Ok(None))
    }

    async fn all_readings(&self) -> Result<Vec<RawReading>, SyncError> {
        let next = self.all.lock().unwrap().next();
        next.unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn actuator_status(&self, device: &DeviceId) -> Result<StatusPayload, SyncError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.status_delay.lock().unwrap();
        let next = self
            .statuses
            .lock()
            .unwrap()
            .get_mut(device.as_str())
            .and_then(Script::next);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        next.unwrap_or_else(|| Err(SyncError::Network("no scripted response".into())))
    }

    async fn control_actuator(
        &self,
        device: &DeviceId,
        desired: DesiredState,
        _updated_at: Timestamp,
    ) -> Result<(), SyncError> {
        self.control_calls
            .lock()
            .unwrap()
            .push((device.as_str().to_string(), desired));
        let delay = *self.control_delay.lock().unwrap();
        let next = self.controls.lock().unwrap().next();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        next.unwrap_or(Ok(()))
    }
}

pub(crate) fn status(device: &str, status: Option<&str>, time: Option<&str>) -> StatusPayload {
    StatusPayload {
        device: device.to_string(),
        status: status.map(str::to_string),
        time: time.map(|t| RawTimestamp::Text(t.to_string())),
    }
}

/// Build a backend record from a `serde_json::json!` object literal.
pub(crate) fn raw_reading(value: Value) -> RawReading {
    match value {
        Value::Object(map) => RawReading(map),
        other => panic!("raw_reading needs an object, got {other}"),
    }
}
