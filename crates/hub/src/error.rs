//! Error taxonomy shared by the backend client, device channels and sensor
//! feeds.

use serde::Serialize;
use thiserror::Error;

/// Everything that can go wrong talking to the backend or driving a channel.
///
/// Poll and write failures are absorbed into channel/feed state as an
/// [`ErrorKind`]; only [`SyncError::InvalidState`] and
/// [`SyncError::UnknownDevice`] ever reach a command caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    // ── Transport ───────────────────────────────────────────────────
    /// Backend unreachable (DNS failure, connection refused, reset).
    #[error("network error: {0}")]
    Network(String),

    /// The per-request timeout elapsed.
    #[error("request timed out")]
    Timeout,

    /// Backend answered with a non-2xx status.
    #[error("backend returned HTTP {0}")]
    Http(u16),

    // ── Data ────────────────────────────────────────────────────────
    /// Body did not match the expected schema.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    // ── Caller misuse ───────────────────────────────────────────────
    /// Command rejected: device state unknown, command already pending, or
    /// the channel has been disposed.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// No channel exists for the requested device id.
    #[error("unknown device '{0}'")]
    UnknownDevice(String),
}

/// Compact, copyable classification stored as `last_error` on channels and
/// feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "status", rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Timeout,
    Http(u16),
    MalformedPayload,
    InvalidState,
}

impl ErrorKind {
    /// True for failures of the request itself rather than of its content.
    pub fn is_transport(self) -> bool {
        matches!(self, Self::Network | Self::Timeout | Self::Http(_))
    }
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network(_) => ErrorKind::Network,
            Self::Timeout => ErrorKind::Timeout,
            Self::Http(status) => ErrorKind::Http(*status),
            Self::MalformedPayload(_) => ErrorKind::MalformedPayload,
            Self::InvalidState(_) | Self::UnknownDevice(_) => ErrorKind::InvalidState,
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if let Some(status) = e.status() {
            Self::Http(status.as_u16())
        } else if e.is_decode() {
            Self::MalformedPayload(e.to_string())
        } else {
            Self::Network(e.to_string())
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        Self::MalformedPayload(e.to_string())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_maps_every_variant() {
        assert_eq!(SyncError::Network("refused".into()).kind(), ErrorKind::Network);
        assert_eq!(SyncError::Timeout.kind(), ErrorKind::Timeout);
        assert_eq!(SyncError::Http(503).kind(), ErrorKind::Http(503));
        assert_eq!(
            SyncError::MalformedPayload("x".into()).kind(),
            ErrorKind::MalformedPayload
        );
        assert_eq!(
            SyncError::InvalidState("pending".into()).kind(),
            ErrorKind::InvalidState
        );
        assert_eq!(
            SyncError::UnknownDevice("heater".into()).kind(),
            ErrorKind::InvalidState
        );
    }

    #[test]
    fn transport_classification() {
        assert!(ErrorKind::Network.is_transport());
        assert!(ErrorKind::Timeout.is_transport());
        assert!(ErrorKind::Http(500).is_transport());
        assert!(!ErrorKind::MalformedPayload.is_transport());
        assert!(!ErrorKind::InvalidState.is_transport());
    }

    #[test]
    fn json_error_becomes_malformed_payload() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        assert!(matches!(SyncError::from(err), SyncError::MalformedPayload(_)));
    }

    #[test]
    fn error_kind_serializes_with_status() {
        let json = serde_json::to_value(ErrorKind::Http(404)).unwrap();
        assert_eq!(json["kind"], "http");
        assert_eq!(json["status"], 404);

        let json = serde_json::to_value(ErrorKind::Timeout).unwrap();
        assert_eq!(json["kind"], "timeout");
    }
}
