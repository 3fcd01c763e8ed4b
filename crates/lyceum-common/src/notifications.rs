//! Typed payloads carried in the `data` field of realtime envelopes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A push notification delivered to the current user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushNotification {
    pub id: u64,
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Attendance status recorded for a student.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceStatus {
    Present,
    Absent,
    Late,
    Excused,
}

/// What happened to a mutable record (homework, announcement).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateAction {
    Created,
    Updated,
    Deleted,
}

/// Attendance recorded or changed for a student in a class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttendanceUpdate {
    pub student_id: u64,
    pub class_id: u64,
    pub date: String,
    pub status: AttendanceStatus,
}

/// Homework assigned, edited, or removed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HomeworkUpdate {
    pub id: u64,
    pub class_id: u64,
    pub title: String,
    #[serde(default)]
    pub due_date: Option<String>,
    pub action: UpdateAction,
}

/// A school-wide or class announcement changed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnouncementUpdate {
    pub id: u64,
    pub title: String,
    #[serde(default)]
    pub audience: Option<String>,
    pub action: UpdateAction,
}
