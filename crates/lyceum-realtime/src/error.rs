//! Error type for the realtime client.

/// Errors surfaced by the realtime client.
///
/// `Clone` because a single connect attempt can have several concurrent
/// waiters, each of which receives the outcome.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RealtimeError {
    #[error("websocket handshake failed: {0}")]
    Handshake(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection closed")]
    ConnectionClosed,
}
