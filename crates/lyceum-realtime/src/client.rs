//! Public handle for the realtime push connection.

use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use crate::connection::{self, ConnectAction, Shared};
use crate::dispatch::{Dispatcher, Subscription};
use crate::error::RealtimeError;
use crate::types::{ConnectionState, RealtimeConfig};

/// Client for the school-management realtime push gateway.
///
/// One instance owns one connection. Construct it at application startup and
/// share it (it is cheap to clone); UI code subscribes with [`on`](Self::on)
/// and never manages the connection lifecycle itself.
#[derive(Clone)]
pub struct RealtimeClient {
    config: RealtimeConfig,
    shared: Arc<Shared>,
    dispatcher: Arc<Dispatcher>,
}

impl RealtimeClient {
    /// Create a client. No network activity happens until
    /// [`connect`](Self::connect) is called.
    pub fn new(config: RealtimeConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared::new()),
            dispatcher: Arc::new(Dispatcher::default()),
        }
    }

    /// Connect with the given bearer token, resolving once the connection is
    /// open.
    ///
    /// Idempotent under concurrency: if already open this resolves
    /// immediately, and a call made while another attempt is in flight waits
    /// for that attempt instead of opening a second transport. The token is
    /// retained for automatic reconnection until [`disconnect`](Self::disconnect).
    pub async fn connect(&self, token: impl Into<String>) -> Result<(), RealtimeError> {
        match self.shared.begin_connect(token.into()) {
            ConnectAction::AlreadyOpen => Ok(()),
            ConnectAction::Join(rx) => rx.await.unwrap_or(Err(RealtimeError::ConnectionClosed)),
            ConnectAction::Start {
                generation,
                token,
                rx,
            } => {
                tokio::spawn(connection::run(
                    self.config.clone(),
                    Arc::clone(&self.shared),
                    Arc::clone(&self.dispatcher),
                    generation,
                    token,
                ));
                rx.await.unwrap_or(Err(RealtimeError::ConnectionClosed))
            }
        }
    }

    /// Disconnect intentionally: clears the retained token (suppressing any
    /// scheduled reconnect) and closes the transport with the normal code.
    /// Safe to call when not connected.
    pub fn disconnect(&self) {
        info!("realtime client disconnecting");
        self.shared.disconnect();
    }

    /// Subscribe `handler` to envelopes of the given type.
    ///
    /// The handler receives the envelope's `data` field, or the whole
    /// envelope when `data` is absent. Subscribing to
    /// [`lyceum_common::events::WILDCARD`] observes every envelope.
    pub fn on(
        &self,
        event: &str,
        handler: impl Fn(Value) + Send + Sync + 'static,
    ) -> Subscription {
        self.dispatcher.subscribe(event, handler)
    }

    /// Send an envelope of the given type, merging `fields` (a JSON object)
    /// into it.
    ///
    /// A no-op with a logged warning when the connection is not open;
    /// nothing is queued for later delivery.
    pub fn send(&self, event: &str, fields: Option<Value>) {
        let mut envelope = serde_json::Map::new();
        envelope.insert("type".to_string(), Value::String(event.to_string()));
        match fields {
            Some(Value::Object(extra)) => envelope.extend(extra),
            Some(_) => {
                warn!(event = %event, "send fields must be a JSON object; ignoring them");
            }
            None => {}
        }

        let text = Value::Object(envelope).to_string();
        if !self.shared.send_text(text) {
            warn!(event = %event, "send while not connected; message dropped");
        }
    }

    /// Whether the connection is currently open.
    pub fn is_connected(&self) -> bool {
        self.shared.is_open()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Consecutive failed reconnect attempts since the last successful open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.attempts()
    }
}

impl std::fmt::Debug for RealtimeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeClient")
            .field("endpoint", &self.config.endpoint)
            .field("state", &self.state())
            .finish()
    }
}
