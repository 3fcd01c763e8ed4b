//! Shared domain types for the lyceum school-management platform.
//!
//! This crate carries the event-name constants and the typed payloads that
//! application code deserializes out of realtime envelopes. The realtime
//! client core does not depend on these types; they exist for consumers.

pub mod events;
pub mod notifications;

pub use notifications::{
    AnnouncementUpdate, AttendanceStatus, AttendanceUpdate, HomeworkUpdate, PushNotification,
    UpdateAction,
};
