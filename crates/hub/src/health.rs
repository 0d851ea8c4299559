//! Tri-state system health from independent probes.
//!
//! Rules, applied in order:
//! 1. every expected probe ok and none failed at the transport level → `Online`
//! 2. no probe ok → `Offline`
//! 3. anything else → `Partial`

use serde::Serialize;

use crate::channel::DeviceChannelState;
use crate::feed::SensorFeedState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    Sensor,
    Device,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    pub source_id: String,
    pub kind: ProbeKind,
    pub ok: bool,
    /// The source's last request failed at the transport/HTTP level.
    pub transport_failure: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Online,
    Partial,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SystemHealth {
    pub status: HealthStatus,
    pub active_sensor_count: usize,
    pub online_device_count: usize,
}

/// Pure and order-independent.
pub fn compute(probes: &[ProbeResult], expected_total: usize) -> SystemHealth {
    let ok_count = probes.iter().filter(|p| p.ok).count();
    let any_transport_failure = probes.iter().any(|p| p.transport_failure);
    let ok_of = |kind: ProbeKind| probes.iter().filter(|p| p.ok && p.kind == kind).count();

    let status = if ok_count == expected_total && !any_transport_failure {
        HealthStatus::Online
    } else if ok_count == 0 {
        HealthStatus::Offline
    } else {
        HealthStatus::Partial
    };

    SystemHealth {
        status,
        active_sensor_count: ok_of(ProbeKind::Sensor),
        online_device_count: ok_of(ProbeKind::Device),
    }
}

/// One probe per configured sensor key.
pub fn sensor_probes(feed: &SensorFeedState, keys: &[String]) -> Vec<ProbeResult> {
    let transport_failure = feed.last_poll_error.is_some_and(|e| e.is_transport());
    keys.iter()
        .map(|key| ProbeResult {
            source_id: key.clone(),
            kind: ProbeKind::Sensor,
            ok: feed
                .latest
                .as_ref()
                .is_some_and(|r| r.value(key).is_some()),
            transport_failure,
        })
        .collect()
}

/// One probe per device channel.
pub fn device_probes(devices: &[DeviceChannelState]) -> Vec<ProbeResult> {
    devices
        .iter()
        .map(|d| ProbeResult {
            source_id: d.device_id.to_string(),
            kind: ProbeKind::Device,
            ok: d.reported.is_known(),
            transport_failure: d.last_error.is_some_and(|e| e.is_transport()),
        })
        .collect()
}

// ===========================================================================
// Tests
// ===========================================================================
