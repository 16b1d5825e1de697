//! Broker destinations used by the Rollcall backend and their payloads
//!
//! The multiplexer treats destinations as opaque strings; these helpers only
//! keep the naming convention in one place.

use serde::{Deserialize, Serialize};

/// Broadcast topic for attendance changes across all events
pub const ATTENDANCE_EVENTS: &str = "/topic/attendance-events";

/// Per-user notification feed
pub fn user_notifications(user_id: u64) -> String {
    format!("/topic/notifications/{}", user_id)
}

/// Live attendance for one event
pub fn event_attendance(event_id: u64) -> String {
    format!("/topic/attendance/{}", event_id)
}

/// Payload pushed on a user's notification feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: u64,
    pub is_read: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

/// Payload pushed when an event's attendance changes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceUpdate {
    pub event_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checked_in_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}
