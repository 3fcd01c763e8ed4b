//! Configuration, connection state, and the wire envelope.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use lyceum_common::events;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Configuration for the realtime push connection.
///
/// The bearer token is not part of the configuration; it is supplied per
/// [`connect`](crate::RealtimeClient::connect) call and retained only while
/// automatic reconnection may need it.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Base WS/WSS endpoint, without the token query parameter.
    pub endpoint: String,
    /// How often a `ping` envelope is sent while connected (default: 30s).
    pub heartbeat_interval: Duration,
    /// Base delay for exponential reconnect backoff (default: 1s).
    pub reconnect_base_delay: Duration,
    /// Maximum consecutive reconnect attempts before giving up (default: 5).
    pub max_reconnect_attempts: u32,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            heartbeat_interval: Duration::from_secs(30),
            reconnect_base_delay: Duration::from_secs(1),
            max_reconnect_attempts: 5,
        }
    }
}

impl RealtimeConfig {
    /// Create a configuration for the given endpoint with default timings.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    /// Build the connection URL with the bearer token appended as a query
    /// parameter. The handshake carries no custom header channel, so the
    /// token travels in the URL.
    pub(crate) fn url_with_token(&self, token: &str) -> String {
        let sep = if self.endpoint.contains('?') { '&' } else { '?' };
        format!("{}{}token={}", self.endpoint, sep, token)
    }
}

// ---------------------------------------------------------------------------
// Connection State
// ---------------------------------------------------------------------------

/// Lifecycle state of the realtime connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, never connected.
    Idle,
    /// A transport handshake is in flight.
    Connecting,
    /// Connected; envelopes flow and heartbeats are sent.
    Open,
    /// An intentional disconnect is in progress.
    Closing,
    /// Not connected. Terminal unless `connect` is called again or a
    /// scheduled retry is pending.
    Closed,
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The JSON envelope exchanged over the connection.
///
/// `type` selects the dispatch route. Unknown fields are kept in `extra` so
/// wildcard subscribers see the raw envelope losslessly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Envelope {
    /// The outbound liveness envelope: `{"type":"ping"}`.
    pub(crate) fn ping() -> Self {
        Self {
            event: events::PING.to_string(),
            data: None,
            message: None,
            extra: serde_json::Map::new(),
        }
    }

    /// The full envelope as a raw JSON value.
    pub fn to_raw(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// What a type-specific handler receives: `data` if present, otherwise
    /// the whole envelope.
    pub(crate) fn handler_payload(&self) -> Value {
        match &self.data {
            Some(data) => data.clone(),
            None => self.to_raw(),
        }
    }
}
