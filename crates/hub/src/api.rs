//! Backend HTTP client: wire payloads, parse helpers and the [`Backend`]
//! seam the channels and feeds talk through.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::channel::{DesiredState, DeviceId, PowerState};
use crate::error::SyncError;
use crate::timestamp::{format_local, RawTimestamp, Timestamp};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Body of `GET /api/actuators/status`.
///
/// Canonical shape is `{ device, status, time }`. An older backend variant
/// answered `{ device, action }`; that shape has no `status` key and is
/// rejected as malformed rather than guessed at.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusPayload {
    pub device: String,
    pub status: Option<String>,
    pub time: Option<RawTimestamp>,
}

/// One sensor record as the backend sends it: `id`, `timestamp`, and a flat
/// set of sensor fields (`temperature`, `humidity`, ...).
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(transparent)]
pub struct RawReading(pub Map<String, Value>);

/// Body of `POST /api/actuators/control`.
#[derive(Debug, Serialize)]
struct ControlRequest<'a> {
    device: &'a str,
    status: &'static str,
    #[serde(rename = "updatedAt")]
    updated_at: String,
}

// ---------------------------------------------------------------------------
// Payload helpers
// ---------------------------------------------------------------------------

/// Validate an actuator status body. `device` must be a string and `status`
/// must be present as a string or `null`; `time` is best-effort.
pub(crate) fn parse_status_payload(body: &[u8]) -> Result<StatusPayload, SyncError> {
    let value: Value = serde_json::from_slice(body)?;
    let obj = value
        .as_object()
        .ok_or_else(|| SyncError::MalformedPayload("status response is not an object".into()))?;

    let device = obj
        .get("device")
        .and_then(Value::as_str)
        .ok_or_else(|| SyncError::MalformedPayload("missing or non-string 'device'".into()))?
        .to_string();

    let status = match obj.get("status") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Null) => None,
        Some(other) => {
            return Err(SyncError::MalformedPayload(format!(
                "'status' has unexpected type: {other}"
            )))
        }
        None => return Err(SyncError::MalformedPayload("missing 'status'".into())),
    };

    let time = match obj.get("time") {
        None | Some(Value::Null) => None,
        Some(v) => serde_json::from_value::<RawTimestamp>(v.clone()).ok(),
    };

    Ok(StatusPayload {
        device,
        status,
        time,
    })
}

/// Power state from a status body answering a query for `device`. A body
/// naming some other device is malformed.
pub(crate) fn reported_power(
    payload: &StatusPayload,
    device: &DeviceId,
) -> Result<PowerState, SyncError> {
    let named = payload.device.trim();
    if !named.eq_ignore_ascii_case(&device.backend_name()) {
        return Err(SyncError::MalformedPayload(format!(
            "status for '{named}' returned for device '{device}'"
        )));
    }
    parse_power_status(payload.status.as_deref())
}

/// Map a reported status onto [`PowerState`] (case-insensitive, trims
/// whitespace). `null` and `"unknown"` are the backend saying it has no
/// value; anything else unrecognized is a schema violation.
fn parse_power_status(status: Option<&str>) -> Result<PowerState, SyncError> {
    let Some(raw) = status else {
        return Ok(PowerState::Unknown);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "on" => Ok(PowerState::On),
        "off" => Ok(PowerState::Off),
        "unknown" => Ok(PowerState::Unknown),
        _ => Err(SyncError::MalformedPayload(format!(
            "unknown actuator status '{raw}'"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Backend seam
// ---------------------------------------------------------------------------

/// Everything the sync engine needs from the greenhouse backend.
#[async_trait]
pub trait Backend: Send + Sync {
    /// `GET /api/sensors/latest`. `Ok(None)` when the body is empty or `null`.
    async fn latest_reading(&self) -> Result<Option<RawReading>, SyncError>;

    /// `GET /api/sensors/all`, in whatever order the backend chose.
    async fn all_readings(&self) -> Result<Vec<RawReading>, SyncError>;

    /// `GET /api/actuators/status?device={Name}`.
    async fn actuator_status(&self, device: &DeviceId) -> Result<StatusPayload, SyncError>;

    /// `POST /api/actuators/control`. Any 2xx is success.
    async fn control_actuator(
        &self,
        device: &DeviceId,
        desired: DesiredState,
        updated_at: Timestamp,
    ) -> Result<(), SyncError>;
}

// ---------------------------------------------------------------------------
// reqwest implementation
// ---------------------------------------------------------------------------

pub struct HttpBackend {
    http: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    /// Build a client whose every request carries a JSON content type and
    /// the given timeout.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, SyncError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()?;
        Ok(Self::with_client(http, base_url))
    }

    pub fn with_client(http: reqwest::Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/{path}", self.base_url)
    }

    async fn get_body(&self, url: &str) -> Result<Vec<u8>, SyncError> {
        debug!(%url, "GET");
        let resp = self.http.get(url).send().await?.error_for_status()?;
        Ok(resp.bytes().await?.to_vec())
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn latest_reading(&self) -> Result<Option<RawReading>, SyncError> {
        let body = self.get_body(&self.url("sensors/latest")).await?;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        Ok(serde_json::from_slice(&body)?)
    }

    async fn all_readings(&self) -> Result<Vec<RawReading>, SyncError> {
        let body = self.get_body(&self.url("sensors/all")).await?;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        let readings: Option<Vec<RawReading>> = serde_json::from_slice(&body)?;
        Ok(readings.unwrap_or_default())
    }

    async fn actuator_status(&self, device: &DeviceId) -> Result<StatusPayload, SyncError> {
        let url = self.url(&format!(
            "actuators/status?device={}",
            device.backend_name()
        ));
        let body = self.get_body(&url).await?;
        parse_status_payload(&body)
    }

    async fn control_actuator(
        &self,
        device: &DeviceId,
        desired: DesiredState,
        updated_at: Timestamp,
    ) -> Result<(), SyncError> {
        let url = self.url("actuators/control");
        let name = device.backend_name();
        let body = ControlRequest {
            device: &name,
            status: desired.as_wire(),
            updated_at: format_local(updated_at),
        };
        debug!(%url, device = %name, status = body.status, "POST");
        self.http
            .post(&url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
