//! Sensor feeds: polling, history accumulation and staleness for the
//! `sensors/latest` and `sensors/all` endpoints.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::api::{Backend, RawReading};
use crate::error::{ErrorKind, SyncError};
use crate::state::{Change, EventKind, Notifier};
use crate::timestamp::{normalize, RawTimestamp, Timestamp};

// ---------------------------------------------------------------------------
// Readings
// ---------------------------------------------------------------------------

/// One sensor record. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorReading {
    /// Backend record id, when the backend sent one.
    pub id: Option<String>,
    pub values: BTreeMap<String, Option<f64>>,
    pub captured_at: Timestamp,
}

impl SensorReading {
    /// Fields other than `id` and `timestamp` are sensor values. Numbers and
    /// numeric strings are kept, `null` is recorded as a missing value, and
    /// anything else is ignored. A missing or unreadable `timestamp` takes
    /// `fallback`.
    pub fn from_raw(raw: &RawReading, fallback: Timestamp) -> Self {
        let id = record_id(raw);

        let captured_at = raw
            .0
            .get("timestamp")
            .and_then(|v| serde_json::from_value::<RawTimestamp>(v.clone()).ok())
            .and_then(|t| normalize(Some(&t)))
            .unwrap_or(fallback);

        let values = raw
            .0
            .iter()
            .filter(|(k, _)| !matches!(k.as_str(), "id" | "timestamp"))
            .filter_map(|(k, v)| {
                let value = match v {
                    Value::Null => None,
                    Value::Number(n) => Some(n.as_f64()?),
                    Value::String(s) => Some(s.trim().parse::<f64>().ok()?),
                    _ => return None,
                };
                Some((k.clone(), value))
            })
            .collect();

        Self {
            id,
            values,
            captured_at,
        }
    }

    /// A finite value for `key`, if present.
    pub fn value(&self, key: &str) -> Option<f64> {
        self.values
            .get(key)
            .copied()
            .flatten()
            .filter(|v| v.is_finite())
    }
}

fn record_id(raw: &RawReading) -> Option<String> {
    match raw.0.get("id") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

/// Identity of a backend record across polls of `/api/sensors/all`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum RecordKey {
    Id(String),
    /// Id-less records are identified by their full serialized content.
    Content(String),
}

impl RecordKey {
    fn of(raw: &RawReading) -> Self {
        match record_id(raw) {
            Some(id) => Self::Id(id),
            None => Self::Content(Value::Object(raw.0.clone()).to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Pure queries
// ---------------------------------------------------------------------------

/// Readings with `captured_at >= now - window`, ascending. No upper bound:
/// readings stamped in the future are kept.
pub fn filter_window(
    history: &[SensorReading],
    now: Timestamp,
    window: Duration,
) -> Vec<SensorReading> {
    let cutoff = now.saturating_sub(window);
    let mut out: Vec<SensorReading> = history
        .iter()
        .filter(|r| r.captured_at >= cutoff)
        .cloned()
        .collect();
    out.sort_by_key(|r| r.captured_at);
    out
}

// ---------------------------------------------------------------------------
// Feed
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedMode {
    /// `GET /api/sensors/latest`.
    Latest,
    /// `GET /api/sensors/all`; `capacity: None` keeps everything.
    History { capacity: Option<usize> },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorFeedState {
    pub latest: Option<SensorReading>,
    pub history_len: usize,
    pub last_poll_error: Option<ErrorKind>,
    pub seconds_since_success: Option<u64>,
}

#[derive(Debug)]
struct Held {
    key: RecordKey,
    reading: SensorReading,
}

/// History dedup policy: `seen` counts the keys of readings currently held,
/// so it never outgrows `history`. Once a bounded feed has evicted anything,
/// `evicted_through` is the newest `captured_at` evicted so far, and unseen
/// readings at or before it are dropped.
#[derive(Debug, Default)]
struct FeedInner {
    latest: Option<SensorReading>,
    history: VecDeque<Held>,
    seen: HashMap<RecordKey, usize>,
    evicted_through: Option<Timestamp>,
    last_poll_error: Option<ErrorKind>,
    last_success: Option<Instant>,
}

pub struct SensorFeed {
    name: &'static str,
    mode: FeedMode,
    backend: Arc<dyn Backend>,
    inner: Mutex<FeedInner>,
    notify: Notifier,
    disposed: AtomicBool,
}

impl SensorFeed {
    pub fn new(
        name: &'static str,
        mode: FeedMode,
        backend: Arc<dyn Backend>,
        notify: Notifier,
    ) -> Self {
        Self {
            name,
            mode,
            backend,
            inner: Mutex::new(FeedInner::default()),
            notify,
            disposed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> SensorFeedState {
        let inner = self.lock();
        SensorFeedState {
            latest: inner.latest.clone(),
            history_len: inner.history.len(),
            last_poll_error: inner.last_poll_error,
            seconds_since_success: inner.last_success.map(|t| t.elapsed().as_secs()),
        }
    }

    pub fn sorted_history(&self) -> Vec<SensorReading> {
        let mut out = self.lock().readings();
        out.sort_by_key(|r| r.captured_at);
        out
    }

    pub fn history_window(&self, now: Timestamp, window: Duration) -> Vec<SensorReading> {
        let history = self.lock().readings();
        filter_window(&history, now, window)
    }

    /// Configured keys with a finite value in the latest reading.
    pub fn active_sensor_count(&self, keys: &[String]) -> usize {
        let inner = self.lock();
        match &inner.latest {
            Some(r) => keys.iter().filter(|k| r.value(k).is_some()).count(),
            None => 0,
        }
    }

    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Fetch and fold in new data. Returns the number of readings added
    /// (always 0 or 1 for a latest feed). On failure the previous data is
    /// left untouched.
    pub async fn poll(&self) -> Result<usize, SyncError> {
        if self.is_disposed() {
            return Err(SyncError::InvalidState(format!("{} feed disposed", self.name)));
        }

        let called_at = Timestamp::now();
        let fetched = match self.mode {
            FeedMode::Latest => self
                .backend
                .latest_reading()
                .await
                .and_then(|r| r.ok_or_else(empty_payload).map(|r| vec![r])),
            FeedMode::History { .. } => self.backend.all_readings().await.and_then(|rs| {
                if rs.is_empty() {
                    Err(empty_payload())
                } else {
                    Ok(rs)
                }
            }),
        };

        if self.is_disposed() {
            return fetched.map(|_| 0);
        }

        let (outcome, newly_failed) = {
            let mut inner = self.lock();
            match fetched {
                Ok(raw) => {
                    let readings: Vec<(RecordKey, SensorReading)> = raw
                        .iter()
                        .map(|r| (RecordKey::of(r), SensorReading::from_raw(r, called_at)))
                        .collect();
                    let added = inner.absorb(self.mode, readings);
                    inner.last_poll_error = None;
                    inner.last_success = Some(Instant::now());
                    (Ok(added), false)
                }
                Err(e) => {
                    let newly_failed = inner.last_poll_error != Some(e.kind());
                    inner.last_poll_error = Some(e.kind());
                    (Err(e), newly_failed)
                }
            }
        };

        match &outcome {
            Ok(added) => {
                debug!(feed = self.name, added, "sensor poll ok");
                (self.notify)(Change::State);
            }
            Err(e) if newly_failed => {
                warn!(feed = self.name, error = %e, "sensor poll failed");
                (self.notify)(Change::Event(
                    EventKind::Poll,
                    format!("{} sensors unavailable: {e}", self.name),
                ));
            }
            Err(_) => (self.notify)(Change::State),
        }
        outcome
    }

    fn lock(&self) -> MutexGuard<'_, FeedInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl FeedInner {
    fn readings(&self) -> Vec<SensorReading> {
        self.history.iter().map(|h| h.reading.clone()).collect()
    }

    fn absorb(&mut self, mode: FeedMode, readings: Vec<(RecordKey, SensorReading)>) -> usize {
        let capacity = match mode {
            FeedMode::Latest => {
                self.latest = readings.into_iter().next().map(|(_, r)| r);
                return usize::from(self.latest.is_some());
            }
            FeedMode::History { capacity } => capacity,
        };

        // Keys are matched against earlier polls only; distinct id-less
        // records in one payload may share content and are all kept.
        let mut batch_ids = HashSet::new();
        let mut fresh = Vec::new();
        for (key, reading) in readings {
            if self.seen.contains_key(&key) {
                continue;
            }
            if let RecordKey::Id(id) = &key {
                if !batch_ids.insert(id.clone()) {
                    continue;
                }
            }
            if self.evicted_through.is_some_and(|t| reading.captured_at <= t) {
                continue;
            }
            fresh.push(Held { key, reading });
        }

        let added = fresh.len();
        for held in fresh {
            *self.seen.entry(held.key.clone()).or_insert(0) += 1;
            self.history.push_back(held);
            if capacity.is_some_and(|cap| self.history.len() > cap) {
                self.evict_oldest();
            }
        }
        self.latest = self
            .history
            .iter()
            .map(|h| &h.reading)
            .max_by_key(|r| r.captured_at)
            .cloned();
        added
    }

    fn evict_oldest(&mut self) {
        let Some(Held { key, reading }) = self.history.pop_front() else {
            return;
        };
        if let Some(count) = self.seen.get_mut(&key) {
            *count -= 1;
            if *count == 0 {
                self.seen.remove(&key);
            }
        }
        self.evicted_through = Some(
            self.evicted_through
                .map_or(reading.captured_at, |t| t.max(reading.captured_at)),
        );
    }
}

fn empty_payload() -> SyncError {
    SyncError::MalformedPayload("empty sensor payload".into())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::noop_notifier;
    use crate::testing::{raw_reading, FakeBackend};
    use serde_json::json;

    const HOUR: Duration = Duration::from_secs(3600);

    fn at(ms: i64) -> Timestamp {
        Timestamp::from_millis(ms)
    }

    fn reading(id: &str, captured_at: Timestamp) -> SensorReading {
        SensorReading {
            id: Some(id.to_string()),
            values: BTreeMap::new(),
            captured_at,
        }
    }

    fn feed(backend: &Arc<FakeBackend>, mode: FeedMode) -> SensorFeed {
        SensorFeed::new("test", mode, backend.clone(), noop_notifier())
    }

    // -- Parsing --------------------------------------------------------------

    #[test]
    fn from_raw_extracts_values_and_time() {
        let raw = raw_reading(json!({
            "id": 42,
            "timestamp": "2025-07-11T09:23:35",
            "temperature": 24.5,
            "humidity": "61.2",
            "lightIntensity": null,
            "soilMoisture": "n/a",
            "greenhouse": { "id": 1 }
        }));
        let r = SensorReading::from_raw(&raw, at(0));

        assert_eq!(r.id.as_deref(), Some("42"));
        assert_eq!(
            r.captured_at,
            normalize(Some(&RawTimestamp::Text("2025-07-11T09:23:35Z".into()))).unwrap()
        );
        assert_eq!(r.value("temperature"), Some(24.5));
        assert_eq!(r.value("humidity"), Some(61.2));
        assert_eq!(r.values.get("lightIntensity"), Some(&None));
        assert!(!r.values.contains_key("soilMoisture"));
        assert!(!r.values.contains_key("greenhouse"));
    }

    #[test]
    fn from_raw_accepts_array_timestamp() {
        let raw = raw_reading(json!({ "timestamp": [2025, 7, 11, 22, 13, 36, 123000000] }));
        let r = SensorReading::from_raw(&raw, at(0));
        assert_eq!(r.captured_at.to_datetime().unwrap().millisecond(), 123);
    }

    #[test]
    fn from_raw_unreadable_time_uses_fallback() {
        let raw = raw_reading(json!({ "timestamp": "last tuesday", "temperature": 20 }));
        assert_eq!(SensorReading::from_raw(&raw, at(77)).captured_at, at(77));

        let raw = raw_reading(json!({ "temperature": 20 }));
        assert_eq!(SensorReading::from_raw(&raw, at(78)).captured_at, at(78));
    }

    // -- Window filtering -----------------------------------------------------

    #[test]
    fn window_bounds_and_ordering() {
        let now = at(1_000 * 3600 * 1000);
        let history = vec![
            reading("recent", now.saturating_sub(HOUR)),
            reading("too-old", now.saturating_sub(HOUR * 25)),
            reading("edge", now.saturating_sub(HOUR * 23 + Duration::from_secs(59 * 60))),
            reading("future", now.saturating_add(Duration::from_secs(60))),
        ];

        let out = filter_window(&history, now, HOUR * 24);
        let ids: Vec<_> = out.iter().map(|r| r.id.as_deref().unwrap()).collect();
        assert_eq!(ids, vec!["edge", "recent", "future"]);
    }

    #[test]
    fn window_lower_bound_is_inclusive() {
        let now = at(100 * 3600 * 1000);
        let history = vec![reading("exact", now.saturating_sub(HOUR * 24))];
        assert_eq!(filter_window(&history, now, HOUR * 24).len(), 1);
    }

    #[test]
    fn window_of_empty_history_is_empty() {
        assert!(filter_window(&[], at(0), HOUR).is_empty());
    }

    // -- Latest feed ----------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn latest_poll_replaces_reading_and_resets_staleness() {
        let backend = Arc::new(FakeBackend::new());
        backend.push_latest(Ok(Some(raw_reading(json!({ "id": 1, "temperature": 21.0 })))));
        backend.push_latest(Ok(Some(raw_reading(json!({ "id": 2, "temperature": 22.0 })))));
        let feed = feed(&backend, FeedMode::Latest);

        assert_eq!(feed.state().seconds_since_success, None);

        assert_eq!(feed.poll().await.unwrap(), 1);
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(feed.state().seconds_since_success, Some(3));

        feed.poll().await.unwrap();
        let st = feed.state();
        assert_eq!(st.seconds_since_success, Some(0));
        assert_eq!(st.latest.unwrap().value("temperature"), Some(22.0));
        assert_eq!(st.history_len, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_poll_keeps_previous_data() {
        let backend = Arc::new(FakeBackend::new());
        backend.push_latest(Ok(Some(raw_reading(json!({ "temperature": 21.0 })))));
        backend.push_latest(Err(SyncError::Http(500)));
        let feed = feed(&backend, FeedMode::Latest);

        feed.poll().await.unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(feed.poll().await, Err(SyncError::Http(500)));

        let st = feed.state();
        assert_eq!(st.last_poll_error, Some(ErrorKind::Http(500)));
        assert_eq!(st.latest.unwrap().value("temperature"), Some(21.0));
        assert_eq!(st.seconds_since_success, Some(5));
    }

    #[tokio::test]
    async fn null_latest_is_an_error() {
        let backend = Arc::new(FakeBackend::new());
        backend.push_latest(Ok(None));
        let feed = feed(&backend, FeedMode::Latest);

        assert!(matches!(feed.poll().await, Err(SyncError::MalformedPayload(_))));
        assert_eq!(feed.state().last_poll_error, Some(ErrorKind::MalformedPayload));
        assert_eq!(feed.state().latest, None);
    }

    #[tokio::test]
    async fn active_sensor_count_uses_configured_keys() {
        let backend = Arc::new(FakeBackend::new());
        backend.push_latest(Ok(Some(raw_reading(json!({
            "temperature": 21.0,
            "humidity": null,
            "lightIntensity": 900,
            "co2": 400
        })))));
        let feed = feed(&backend, FeedMode::Latest);
        let keys: Vec<String> = ["temperature", "humidity", "lightIntensity", "soilMoisture"]
            .map(String::from)
            .to_vec();

        assert_eq!(feed.active_sensor_count(&keys), 0);
        feed.poll().await.unwrap();
        assert_eq!(feed.active_sensor_count(&keys), 2);
    }

    // -- History feed ---------------------------------------------------------

    #[tokio::test]
    async fn history_deduplicates_by_id_and_tracks_newest() {
        let backend = Arc::new(FakeBackend::new());
        backend.push_all(Ok(vec![
            raw_reading(json!({ "id": 2, "timestamp": "2025-07-11T10:00:00", "temperature": 20 })),
            raw_reading(json!({ "id": 1, "timestamp": "2025-07-11T09:00:00", "temperature": 19 })),
        ]));
        backend.push_all(Ok(vec![
            raw_reading(json!({ "id": 1, "timestamp": "2025-07-11T09:00:00", "temperature": 19 })),
            raw_reading(json!({ "id": 2, "timestamp": "2025-07-11T10:00:00", "temperature": 20 })),
            raw_reading(json!({ "id": 3, "timestamp": "2025-07-11T11:00:00", "temperature": 21 })),
        ]));
        let feed = feed(&backend, FeedMode::History { capacity: None });

        assert_eq!(feed.poll().await.unwrap(), 2);
        assert_eq!(feed.poll().await.unwrap(), 1);

        let st = feed.state();
        assert_eq!(st.history_len, 3);
        assert_eq!(st.latest.unwrap().id.as_deref(), Some("3"));

        let ids: Vec<_> = feed
            .sorted_history()
            .into_iter()
            .map(|r| r.id.unwrap())
            .collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn bounded_history_evicts_oldest_arrival() {
        let backend = Arc::new(FakeBackend::new());
        backend.push_all(Ok((1..=5)
            .map(|i| raw_reading(json!({ "id": i, "timestamp": [2025, 7, 11, i, 0, 0] })))
            .collect()));
        let feed = feed(&backend, FeedMode::History { capacity: Some(3) });

        assert_eq!(feed.poll().await.unwrap(), 5);
        let ids: Vec<_> = feed
            .sorted_history()
            .into_iter()
            .map(|r| r.id.unwrap())
            .collect();
        assert_eq!(ids, vec!["3", "4", "5"]);

        // Same payload again: nothing re-enters.
        assert_eq!(feed.poll().await.unwrap(), 0);
        assert_eq!(feed.state().history_len, 3);
    }

    #[tokio::test]
    async fn id_less_readings_are_all_kept() {
        let payload = vec![
            raw_reading(json!({ "timestamp": "2025-07-11T09:00:00", "temperature": 20 })),
            raw_reading(json!({ "timestamp": "2025-07-11T09:00:00", "temperature": 21 })),
            raw_reading(json!({ "humidity": 55 })),
            raw_reading(json!({ "humidity": 55 })),
        ];
        let backend = Arc::new(FakeBackend::new());
        backend.push_all(Ok(payload.clone()));
        backend.push_all(Ok(payload));
        let feed = feed(&backend, FeedMode::History { capacity: None });

        assert_eq!(feed.poll().await.unwrap(), 4);
        assert_eq!(feed.state().history_len, 4);

        // A re-fetch of the same records adds nothing.
        assert_eq!(feed.poll().await.unwrap(), 0);
        assert_eq!(feed.state().history_len, 4);
    }

    #[tokio::test]
    async fn repeated_id_in_one_payload_is_appended_once() {
        let backend = Arc::new(FakeBackend::new());
        backend.push_all(Ok(vec![
            raw_reading(json!({ "id": 7, "temperature": 20 })),
            raw_reading(json!({ "id": 7, "temperature": 20 })),
        ]));
        let feed = feed(&backend, FeedMode::History { capacity: None });

        assert_eq!(feed.poll().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn dedup_set_stays_within_capacity() {
        let backend = Arc::new(FakeBackend::new());
        let base = 1_750_000_000_000;
        for poll in 0..100i64 {
            backend.push_all(Ok((0..50i64)
                .map(|i| {
                    let n = poll * 50 + i;
                    let stamp = crate::timestamp::format_local(at(base + n * 1000));
                    raw_reading(json!({ "id": n, "timestamp": stamp }))
                })
                .collect()));
        }
        let feed = feed(&backend, FeedMode::History { capacity: Some(10) });

        for _ in 0..100 {
            assert_eq!(feed.poll().await.unwrap(), 50);
        }

        assert_eq!(feed.state().history_len, 10);
        assert_eq!(feed.lock().seen.len(), 10);
        assert_eq!(feed.state().latest.unwrap().id.as_deref(), Some("4999"));
    }

    #[tokio::test]
    async fn evicted_records_do_not_cycle_back() {
        let backend = Arc::new(FakeBackend::new());
        let all: Vec<_> = (1..=6)
            .map(|i| raw_reading(json!({ "id": i, "timestamp": [2025, 7, 11, i, 0, 0] })))
            .collect();
        backend.push_all(Ok(all.clone()));
        backend.push_all(Ok(all));
        let feed = feed(&backend, FeedMode::History { capacity: Some(2) });

        assert_eq!(feed.poll().await.unwrap(), 6);
        assert_eq!(feed.poll().await.unwrap(), 0);

        let ids: Vec<_> = feed
            .sorted_history()
            .into_iter()
            .map(|r| r.id.unwrap())
            .collect();
        assert_eq!(ids, vec!["5", "6"]);
        assert_eq!(feed.lock().seen.len(), 2);
    }

    #[tokio::test]
    async fn history_window_on_feed_is_sorted() {
        let backend = Arc::new(FakeBackend::new());
        let now = Timestamp::now();
        let stamp = |back: Duration| {
            crate::timestamp::format_local(now.saturating_sub(back))
        };
        backend.push_all(Ok(vec![
            raw_reading(json!({ "id": "b", "timestamp": stamp(HOUR) })),
            raw_reading(json!({ "id": "old", "timestamp": stamp(HOUR * 25) })),
            raw_reading(json!({ "id": "a", "timestamp": stamp(HOUR * 2) })),
        ]));
        let feed = feed(&backend, FeedMode::History { capacity: None });
        feed.poll().await.unwrap();

        let ids: Vec<_> = feed
            .history_window(now, HOUR * 24)
            .into_iter()
            .map(|r| r.id.unwrap())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn disposed_feed_does_not_poll() {
        let backend = Arc::new(FakeBackend::new());
        let feed = feed(&backend, FeedMode::Latest);
        feed.dispose();
        assert!(matches!(feed.poll().await, Err(SyncError::InvalidState(_))));
        assert_eq!(backend.latest_calls(), 0);
    }
}
