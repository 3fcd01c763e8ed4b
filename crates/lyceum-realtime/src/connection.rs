//! Connection state machine, session loop, and reconnect driver.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::dispatch::Dispatcher;
use crate::error::RealtimeError;
use crate::types::{ConnectionState, Envelope, RealtimeConfig};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close reason sent on intentional disconnect.
const CLOSE_REASON: &str = "User disconnected";

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Commands forwarded from the client handle into the session loop.
pub(crate) enum Command {
    SendText(String),
    Close,
}

// ---------------------------------------------------------------------------
// Shared State
// ---------------------------------------------------------------------------

struct Inner {
    phase: ConnectionState,
    /// Bearer token, retained only so scheduled retries can reconnect.
    /// Cleared on intentional disconnect, which suppresses any pending retry.
    credential: Option<String>,
    /// Consecutive failed reconnect attempts since the last successful open.
    attempts: u32,
    /// Bumped on every manual `connect` that starts a driver. A driver whose
    /// generation no longer matches has been superseded and must not touch
    /// shared state.
    epoch: u64,
    command_tx: Option<mpsc::UnboundedSender<Command>>,
    waiters: Vec<oneshot::Sender<Result<(), RealtimeError>>>,
}

/// State shared between the client handle and the connection driver task.
pub(crate) struct Shared {
    inner: Mutex<Inner>,
}

/// What `begin_connect` decided for a caller.
pub(crate) enum ConnectAction {
    /// Already open; resolve immediately.
    AlreadyOpen,
    /// An attempt is in flight; wait for its outcome.
    Join(oneshot::Receiver<Result<(), RealtimeError>>),
    /// This caller starts a new driver task.
    Start {
        generation: u64,
        token: String,
        rx: oneshot::Receiver<Result<(), RealtimeError>>,
    },
}

impl Shared {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                phase: ConnectionState::Idle,
                credential: None,
                attempts: 0,
                epoch: 0,
                command_tx: None,
                waiters: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.lock().phase
    }

    pub(crate) fn is_open(&self) -> bool {
        self.lock().phase == ConnectionState::Open
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.lock().attempts
    }

    /// Resolve a `connect` call against the current phase. Concurrent calls
    /// while an attempt is in flight converge on that attempt instead of
    /// opening a second transport.
    pub(crate) fn begin_connect(&self, token: String) -> ConnectAction {
        let mut inner = self.lock();
        match inner.phase {
            ConnectionState::Open => ConnectAction::AlreadyOpen,
            ConnectionState::Connecting => {
                let (tx, rx) = oneshot::channel();
                inner.waiters.push(tx);
                ConnectAction::Join(rx)
            }
            ConnectionState::Idle | ConnectionState::Closing | ConnectionState::Closed => {
                inner.phase = ConnectionState::Connecting;
                inner.credential = Some(token.clone());
                inner.epoch += 1;
                let generation = inner.epoch;
                let (tx, rx) = oneshot::channel();
                inner.waiters.push(tx);
                ConnectAction::Start {
                    generation,
                    token,
                    rx,
                }
            }
        }
    }

    /// Notify everyone awaiting the in-flight attempt. No-op for superseded
    /// drivers so a stale task cannot resolve a newer attempt's waiters.
    fn settle_waiters(&self, generation: u64, result: &Result<(), RealtimeError>) {
        let waiters = {
            let mut inner = self.lock();
            if inner.epoch != generation {
                return;
            }
            std::mem::take(&mut inner.waiters)
        };
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }

    /// Transition to `Open`: reset the retry counter and install the command
    /// channel for the new session. Fails if the driver was superseded or
    /// the credential was cleared during the handshake.
    fn begin_session(&self, generation: u64, tx: mpsc::UnboundedSender<Command>) -> bool {
        let mut inner = self.lock();
        if inner.epoch != generation || inner.credential.is_none() {
            return false;
        }
        inner.phase = ConnectionState::Open;
        inner.attempts = 0;
        inner.command_tx = Some(tx);
        true
    }

    /// Tear down after a session ends, whatever the cause.
    fn end_session(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.epoch != generation {
            return;
        }
        inner.command_tx = None;
        inner.phase = ConnectionState::Closed;
    }

    /// Compute the next retry, or `None` when retrying must stop: credential
    /// cleared, attempt budget exhausted, or driver superseded.
    ///
    /// The delay doubles per consecutive failure: `base * 2^attempts`, with
    /// the counter incremented after the delay is computed.
    fn next_retry(&self, generation: u64, config: &RealtimeConfig) -> Option<(String, Duration)> {
        let mut inner = self.lock();
        if inner.epoch != generation {
            return None;
        }
        let token = inner.credential.clone()?;
        if inner.attempts >= config.max_reconnect_attempts {
            warn!(
                attempts = inner.attempts,
                "reconnect budget exhausted; staying disconnected"
            );
            return None;
        }
        let delay = backoff_delay(config.reconnect_base_delay, inner.attempts);
        inner.attempts += 1;
        Some((token, delay))
    }

    /// Mark a retry handshake in flight. Fails if disconnected or superseded
    /// while the driver was sleeping.
    fn mark_connecting(&self, generation: u64) -> bool {
        let mut inner = self.lock();
        if inner.epoch != generation || inner.credential.is_none() {
            return false;
        }
        inner.phase = ConnectionState::Connecting;
        true
    }

    /// Intentional disconnect: clear the credential (suppressing any pending
    /// retry), and ask the live session, if any, to close normally.
    pub(crate) fn disconnect(&self) {
        let tx = {
            let mut inner = self.lock();
            inner.credential = None;
            match inner.phase {
                ConnectionState::Open | ConnectionState::Connecting => {
                    inner.phase = ConnectionState::Closing;
                    inner.command_tx.clone()
                }
                ConnectionState::Closing => inner.command_tx.clone(),
                ConnectionState::Idle | ConnectionState::Closed => {
                    inner.phase = ConnectionState::Closed;
                    None
                }
            }
        };
        if let Some(tx) = tx {
            let _ = tx.send(Command::Close);
        }
    }

    /// Hand an outbound frame to the session. Returns `false` when there is
    /// no open session to send on.
    pub(crate) fn send_text(&self, text: String) -> bool {
        let inner = self.lock();
        if inner.phase != ConnectionState::Open {
            return false;
        }
        match &inner.command_tx {
            Some(tx) => tx.send(Command::SendText(text)).is_ok(),
            None => false,
        }
    }
}

fn backoff_delay(base: Duration, attempts: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempts))
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Driver task for one manual `connect`: initial handshake, then the
/// session/retry loop until the connection ends for good.
pub(crate) async fn run(
    config: RealtimeConfig,
    shared: Arc<Shared>,
    dispatcher: Arc<Dispatcher>,
    generation: u64,
    token: String,
) {
    match open_transport(&config, &token).await {
        Ok(ws) => {
            let (tx, rx) = mpsc::unbounded_channel();
            if !shared.begin_session(generation, tx) {
                // Disconnected (or superseded) while the handshake ran.
                close_quietly(ws).await;
                shared.end_session(generation);
                shared.settle_waiters(generation, &Err(RealtimeError::ConnectionClosed));
                return;
            }
            info!(endpoint = %config.endpoint, "realtime connection established");
            shared.settle_waiters(generation, &Ok(()));
            drive(config, shared, dispatcher, generation, ws, rx).await;
        }
        Err(e) => {
            warn!(error = %e, "realtime connect failed");
            shared.end_session(generation);
            shared.settle_waiters(generation, &Err(e));
        }
    }
}

/// Session/retry loop: runs sessions back to back, reconnecting with
/// exponential backoff after unexpected closes.
async fn drive(
    config: RealtimeConfig,
    shared: Arc<Shared>,
    dispatcher: Arc<Dispatcher>,
    generation: u64,
    mut ws: WsStream,
    mut command_rx: mpsc::UnboundedReceiver<Command>,
) {
    loop {
        let end = session(&config, &dispatcher, ws, &mut command_rx).await;
        shared.end_session(generation);

        match end {
            SessionEnd::Intentional => {
                info!("realtime connection closed");
                shared.settle_waiters(generation, &Err(RealtimeError::ConnectionClosed));
                return;
            }
            SessionEnd::Unexpected(err) => {
                warn!(error = %err, "realtime connection lost");
            }
        }

        // Reconnect with exponential backoff, bounded by the attempt budget.
        loop {
            let Some((token, delay)) = shared.next_retry(generation, &config) else {
                shared.settle_waiters(generation, &Err(RealtimeError::ConnectionClosed));
                return;
            };
            info!(
                delay_ms = delay.as_millis() as u64,
                attempt = shared.attempts(),
                "scheduling reconnect"
            );
            tokio::time::sleep(delay).await;

            if !shared.mark_connecting(generation) {
                shared.settle_waiters(generation, &Err(RealtimeError::ConnectionClosed));
                return;
            }
            match open_transport(&config, &token).await {
                Ok(new_ws) => {
                    let (tx, rx) = mpsc::unbounded_channel();
                    if !shared.begin_session(generation, tx) {
                        close_quietly(new_ws).await;
                        shared.end_session(generation);
                        shared.settle_waiters(generation, &Err(RealtimeError::ConnectionClosed));
                        return;
                    }
                    info!(endpoint = %config.endpoint, "realtime connection re-established");
                    shared.settle_waiters(generation, &Ok(()));
                    ws = new_ws;
                    command_rx = rx;
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "reconnect attempt failed");
                    shared.end_session(generation);
                }
            }
        }
    }
}

/// How a session ended. A received close frame with the normal code, or our
/// own `Close` command, is intentional; everything else triggers recovery.
enum SessionEnd {
    Intentional,
    Unexpected(RealtimeError),
}

/// One connected session: forward commands out, parse and dispatch inbound
/// frames, and send a `ping` envelope on every heartbeat tick. Heartbeats
/// live inside this loop, so none can fire once the session has ended.
async fn session(
    config: &RealtimeConfig,
    dispatcher: &Dispatcher,
    ws: WsStream,
    command_rx: &mut mpsc::UnboundedReceiver<Command>,
) -> SessionEnd {
    let (mut sink, mut stream) = ws.split();
    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                let frame = match serde_json::to_string(&Envelope::ping()) {
                    Ok(json) => json,
                    Err(e) => {
                        error!(error = %e, "failed to serialize ping");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(frame.into())).await {
                    return SessionEnd::Unexpected(RealtimeError::Transport(e.to_string()));
                }
                debug!("heartbeat sent");
            }

            cmd = command_rx.recv() => match cmd {
                Some(Command::SendText(text)) => {
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        return SessionEnd::Unexpected(RealtimeError::Transport(e.to_string()));
                    }
                }
                Some(Command::Close) | None => {
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: CLOSE_REASON.into(),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    return SessionEnd::Intentional;
                }
            },

            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    handle_frame(text.as_str(), dispatcher);
                }
                Some(Ok(Message::Close(frame))) => {
                    let normal = frame
                        .as_ref()
                        .is_some_and(|f| f.code == CloseCode::Normal);
                    if normal {
                        return SessionEnd::Intentional;
                    }
                    let detail = frame
                        .map(|f| format!("close code {}: {}", u16::from(f.code), f.reason))
                        .unwrap_or_else(|| "close without frame".to_string());
                    return SessionEnd::Unexpected(RealtimeError::Transport(detail));
                }
                // Transport-level pings are answered by tungstenite.
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    return SessionEnd::Unexpected(RealtimeError::Transport(e.to_string()));
                }
                None => {
                    return SessionEnd::Unexpected(RealtimeError::Transport(
                        "stream ended".to_string(),
                    ));
                }
            }
        }
    }
}

/// Parse one inbound text frame and hand it to the dispatcher. Malformed
/// frames are dropped; they never close the connection.
fn handle_frame(text: &str, dispatcher: &Dispatcher) {
    match serde_json::from_str::<Envelope>(text) {
        Ok(envelope) => {
            debug!(event = %envelope.event, "envelope received");
            dispatcher.publish(&envelope);
        }
        Err(e) => {
            error!(error = %e, "dropping malformed frame");
        }
    }
}

/// Open the transport with the token appended as a query parameter.
async fn open_transport(config: &RealtimeConfig, token: &str) -> Result<WsStream, RealtimeError> {
    let url = config.url_with_token(token);
    debug!(endpoint = %config.endpoint, "opening realtime transport");
    let (ws, _response) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .map_err(|e| RealtimeError::Handshake(e.to_string()))?;
    Ok(ws)
}

/// Close a transport we no longer want with the normal code.
async fn close_quietly(ws: WsStream) {
    let (mut sink, _stream) = ws.split();
    let frame = CloseFrame {
        code: CloseCode::Normal,
        reason: CLOSE_REASON.into(),
    };
    let _ = sink.send(Message::Close(Some(frame))).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(base: Duration, max_attempts: u32) -> RealtimeConfig {
        RealtimeConfig {
            reconnect_base_delay: base,
            max_reconnect_attempts: max_attempts,
            ..RealtimeConfig::new("ws://push.local/ws")
        }
    }

    fn started(shared: &Shared, token: &str) -> u64 {
        match shared.begin_connect(token.to_string()) {
            ConnectAction::Start { generation, .. } => generation,
            _ => panic!("expected a fresh attempt"),
        }
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let base = Duration::from_millis(250);
        assert_eq!(backoff_delay(base, 0), Duration::from_millis(250));
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(500));
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(2));
    }

    #[test]
    fn retry_sequence_counts_and_delays() {
        let shared = Shared::new();
        let config = config_with(Duration::from_millis(100), 5);
        let generation = started(&shared, "abc");

        let (token, d1) = shared.next_retry(generation, &config).unwrap();
        assert_eq!(token, "abc");
        assert_eq!(d1, Duration::from_millis(100));
        assert_eq!(shared.attempts(), 1);

        let (_, d2) = shared.next_retry(generation, &config).unwrap();
        assert_eq!(d2, Duration::from_millis(200));
        let (_, d3) = shared.next_retry(generation, &config).unwrap();
        assert_eq!(d3, Duration::from_millis(400));
        assert_eq!(shared.attempts(), 3);
    }

    #[test]
    fn retry_stops_at_budget() {
        let shared = Shared::new();
        let config = config_with(Duration::from_millis(10), 2);
        let generation = started(&shared, "abc");

        assert!(shared.next_retry(generation, &config).is_some());
        assert!(shared.next_retry(generation, &config).is_some());
        assert!(shared.next_retry(generation, &config).is_none());
        assert_eq!(shared.attempts(), 2);
    }

    #[test]
    fn retry_suppressed_after_disconnect() {
        let shared = Shared::new();
        let config = config_with(Duration::from_millis(10), 5);
        let generation = started(&shared, "abc");

        shared.disconnect();
        assert!(shared.next_retry(generation, &config).is_none());
        assert!(!shared.mark_connecting(generation));
    }

    #[test]
    fn successful_open_resets_counter() {
        let shared = Shared::new();
        let config = config_with(Duration::from_millis(10), 5);
        let generation = started(&shared, "abc");

        let _ = shared.next_retry(generation, &config);
        let _ = shared.next_retry(generation, &config);
        assert_eq!(shared.attempts(), 2);

        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(shared.begin_session(generation, tx));
        assert_eq!(shared.attempts(), 0);
        assert!(shared.is_open());

        // Backoff starts over on the next failure.
        let (_, delay) = shared.next_retry(generation, &config).unwrap();
        assert_eq!(delay, Duration::from_millis(10));
    }

    #[test]
    fn concurrent_connect_joins_in_flight_attempt() {
        let shared = Shared::new();
        let first = shared.begin_connect("abc".to_string());
        assert!(matches!(first, ConnectAction::Start { .. }));
        assert_eq!(shared.state(), ConnectionState::Connecting);

        let second = shared.begin_connect("abc".to_string());
        assert!(matches!(second, ConnectAction::Join(_)));
    }

    #[test]
    fn connect_while_open_resolves_immediately() {
        let shared = Shared::new();
        let generation = started(&shared, "abc");
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(shared.begin_session(generation, tx));

        assert!(matches!(
            shared.begin_connect("abc".to_string()),
            ConnectAction::AlreadyOpen
        ));
    }

    #[test]
    fn superseded_driver_cannot_touch_state() {
        let shared = Shared::new();
        let config = config_with(Duration::from_millis(10), 5);
        let stale = started(&shared, "abc");
        shared.end_session(stale);

        // A fresh manual connect supersedes the stale driver.
        let fresh = started(&shared, "def");
        assert!(shared.next_retry(stale, &config).is_none());
        assert!(!shared.mark_connecting(stale));
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(!shared.begin_session(stale, tx));

        shared.end_session(stale);
        assert_eq!(shared.state(), ConnectionState::Connecting);

        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(shared.begin_session(fresh, tx));
    }

    #[test]
    fn stale_close_after_disconnect_stays_closed() {
        let shared = Shared::new();
        let config = config_with(Duration::from_millis(10), 5);
        let generation = started(&shared, "abc");
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(shared.begin_session(generation, tx));

        // Disconnect first, then the stale transport reports its close.
        shared.disconnect();
        shared.end_session(generation);
        assert_eq!(shared.state(), ConnectionState::Closed);
        assert!(shared.next_retry(generation, &config).is_none());
    }

    #[test]
    fn send_text_requires_open_session() {
        let shared = Shared::new();
        assert!(!shared.send_text("{}".to_string()));

        let generation = started(&shared, "abc");
        assert!(!shared.send_text("{}".to_string()));

        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(shared.begin_session(generation, tx));
        assert!(shared.send_text(r#"{"type":"ping"}"#.to_string()));
        assert!(matches!(rx.try_recv(), Ok(Command::SendText(_))));
    }

    #[test]
    fn disconnect_is_safe_when_idle() {
        let shared = Shared::new();
        shared.disconnect();
        assert_eq!(shared.state(), ConnectionState::Closed);
        shared.disconnect();
        assert_eq!(shared.state(), ConnectionState::Closed);
    }
}
