//! Well-known event type names used on the realtime connection.
//!
//! The server routes every envelope by its `type` field; these constants are
//! the types the school UI subscribes to. Subscribing to [`WILDCARD`]
//! observes every envelope regardless of type.

/// Outbound liveness message, sent periodically while connected.
pub const PING: &str = "ping";

/// A new push notification for the current user.
pub const NOTIFICATION: &str = "notification";

/// Attendance was recorded or changed for a student.
pub const ATTENDANCE_UPDATE: &str = "attendance_update";

/// Homework was assigned, edited, or removed.
pub const HOMEWORK_UPDATE: &str = "homework_update";

/// A school-wide or class announcement changed.
pub const ANNOUNCEMENT_UPDATE: &str = "announcement_update";

/// Matches every inbound envelope, independent of type-specific routing.
pub const WILDCARD: &str = "*";
