//! Realtime notification client for the lyceum school-management platform.
//!
//! Maintains one long-lived, token-authenticated WebSocket to the push
//! gateway and routes typed envelopes (notifications, attendance, homework,
//! announcement updates) to subscribers. The client owns the whole
//! connection lifecycle: heartbeats while open, exponential-backoff
//! reconnection with a bounded attempt budget on unexpected closes, and a
//! type-keyed dispatch registry with wildcard observation.
//!
//! ```no_run
//! use lyceum_realtime::{RealtimeClient, RealtimeConfig};
//!
//! # async fn example() -> Result<(), lyceum_realtime::RealtimeError> {
//! let client = RealtimeClient::new(RealtimeConfig::new("wss://push.lyceum.app/ws"));
//!
//! let sub = client.on(lyceum_common::events::NOTIFICATION, |data| {
//!     println!("notification: {data}");
//! });
//!
//! client.connect("bearer-token").await?;
//! client.send("mark_read", Some(serde_json::json!({ "id": 12 })));
//!
//! sub.unsubscribe();
//! client.disconnect();
//! # Ok(())
//! # }
//! ```

mod client;
mod connection;
mod dispatch;
mod error;
mod types;

pub use client::RealtimeClient;
pub use dispatch::{Dispatcher, Subscription};
pub use error::RealtimeError;
pub use types::{ConnectionState, Envelope, RealtimeConfig};
