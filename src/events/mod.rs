//! Event schemas carried on the task bus.
//!
//! The task service produces the control events (`task.created`,
//! `task.paused`, `task.resumed`, `task.cancelled`); the worker produces the
//! telemetry events. Payloads are JSON; every message additionally carries
//! `eventType` and `taskID` metadata so consumers can route without
//! deserializing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::source::SourceType;

/// Control topics consumed by the worker.
pub const TOPIC_TASK_CREATED: &str = "task.created";
pub const TOPIC_TASK_PAUSED: &str = "task.paused";
pub const TOPIC_TASK_RESUMED: &str = "task.resumed";
pub const TOPIC_TASK_CANCELLED: &str = "task.cancelled";

/// Telemetry topics produced by the worker.
pub const TOPIC_STATUS_UPDATED: &str = "task.status.updated";
pub const TOPIC_PROGRESS_UPDATED: &str = "task.progress.updated";
pub const TOPIC_TASK_COMPLETED: &str = "task.completed";
pub const TOPIC_TASK_FAILED: &str = "task.failed";

/// Task lifecycle status as published on `task.status.updated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Downloading,
    Storing,
    Paused,
    Cancelled,
    Completed,
    Failed,
}

/// Credential bag for authenticated sources.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(rename = "type", default)]
    pub kind: AuthKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthKind {
    Basic,
    Bearer,
    Token,
    #[default]
    Unspecified,
}

// Unknown kinds degrade to `Unspecified` (the adapter then infers from the
// fields present) instead of failing the whole event decode.
impl<'de> Deserialize<'de> for AuthKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Ok(match value.trim().to_ascii_lowercase().as_str() {
            "basic" => AuthKind::Basic,
            "bearer" => AuthKind::Bearer,
            "token" => AuthKind::Token,
            _ => AuthKind::Unspecified,
        })
    }
}

/// Download tuning knobs as they appear on the wire. Absent fields fall back
/// to worker defaults when the request is admitted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DownloadOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u32>,
    /// Bytes per second; zero or absent means unlimited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_speed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// Per-task wall clock in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumInfo {
    #[serde(rename = "type")]
    pub checksum_type: String,
    #[serde(rename = "value")]
    pub checksum_value: String,
}

/// Published by the task service when a user submits a URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCreatedEvent {
    pub task_id: u64,
    pub of_account_id: u64,
    #[serde(default)]
    pub file_name: String,
    pub source_url: String,
    pub source_type: SourceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_auth: Option<AuthConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_options: Option<DownloadOptions>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<ChecksumInfo>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPausedEvent {
    pub task_id: u64,
    pub paused_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResumedEvent {
    pub task_id: u64,
    pub resumed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCancelledEvent {
    pub task_id: u64,
    pub cancelled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusUpdatedEvent {
    pub task_id: u64,
    pub status: TaskStatus,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskProgressUpdatedEvent {
    pub task_id: u64,
    /// Percentage in `0..=100`; zero when the total size is unknown.
    pub progress: f64,
    pub downloaded_bytes: u64,
    /// -1 when the source did not report a size.
    pub total_bytes: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCompletedEvent {
    pub task_id: u64,
    pub file_name: String,
    pub file_size: i64,
    pub content_type: String,
    pub checksum: ChecksumInfo,
    pub storage_key: String,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFailedEvent {
    pub task_id: u64,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_screaming() {
        let json = serde_json::to_string(&TaskStatus::Downloading).unwrap();
        assert_eq!(json, "\"DOWNLOADING\"");
        let back: TaskStatus = serde_json::from_str("\"STORING\"").unwrap();
        assert_eq!(back, TaskStatus::Storing);
    }

    #[test]
    fn created_event_tolerates_missing_optionals() {
        let json = r#"{
            "task_id": 7,
            "of_account_id": 42,
            "source_url": "https://example.com/a.bin",
            "source_type": "https",
            "created_at": "2025-01-01T00:00:00Z"
        }"#;
        let event: TaskCreatedEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.task_id, 7);
        assert!(event.source_auth.is_none());
        assert!(event.download_options.is_none());
        assert!(event.metadata.is_empty());
        assert_eq!(event.file_name, "");
    }

    #[test]
    fn auth_kind_defaults_to_unspecified() {
        let auth: AuthConfig =
            serde_json::from_str(r#"{"username": "u", "password": "p"}"#).unwrap();
        assert_eq!(auth.kind, AuthKind::Unspecified);

        let auth: AuthConfig = serde_json::from_str(r#"{"type": "bearer", "token": "t"}"#).unwrap();
        assert_eq!(auth.kind, AuthKind::Bearer);

        // Unknown auth kinds degrade to unspecified rather than failing decode.
        let auth: AuthConfig = serde_json::from_str(r#"{"type": "mtls"}"#).unwrap();
        assert_eq!(auth.kind, AuthKind::Unspecified);
    }

    #[test]
    fn checksum_wire_field_names() {
        let info = ChecksumInfo {
            checksum_type: "md5".into(),
            checksum_value: "abc".into(),
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["type"], "md5");
        assert_eq!(json["value"], "abc");
    }
}
