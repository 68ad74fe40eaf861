use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::ProcessError;
use crate::store::Task;

pub const TASK_CREATED: &str = "task.created";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in-progress",
            TaskStatus::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(TaskStatus::Pending),
            "in-progress" => Some(TaskStatus::InProgress),
            "completed" => Some(TaskStatus::Completed),
            _ => None,
        }
    }
}

/// Fact published to the queue after a task has been persisted.
///
/// Only `event`, `taskId` and `title` are required on the way in; everything
/// else falls back to a default so older or sloppier producers still decode.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCreatedEvent {
    pub event: String,
    pub task_id: String,
    pub title: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub description: String,
    #[serde(default, deserialize_with = "lenient_status")]
    pub status: TaskStatus,
    #[serde(default, deserialize_with = "lenient_text")]
    pub user_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_time")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient_time")]
    pub timestamp: Option<DateTime<Utc>>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

// The optional fields below never fail a decode: a value of the wrong shape
// is treated as absent.

fn lenient_status<'de, D: Deserializer<'de>>(deserializer: D) -> Result<TaskStatus, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value
        .as_ref()
        .and_then(Value::as_str)
        .and_then(TaskStatus::parse)
        .unwrap_or_default())
}

fn lenient_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(text)) => Some(text),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn lenient_time<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<DateTime<Utc>>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value
        .as_ref()
        .and_then(Value::as_str)
        .and_then(|text| DateTime::parse_from_rfc3339(text).ok())
        .map(|at| at.with_timezone(&Utc)))
}

impl TaskCreatedEvent {
    pub fn new(task: &Task, published_at: DateTime<Utc>) -> Self {
        Self {
            event: TASK_CREATED.to_string(),
            task_id: task.id.clone(),
            title: task.title.clone(),
            description: task.description.clone(),
            status: task.status,
            user_id: task.user_id.clone(),
            created_at: Some(task.created_at),
            timestamp: Some(published_at),
        }
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProcessError> {
        Ok(serde_json::from_slice(payload)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    TaskCreated,
}

/// What the consumer keeps (and streams) for each processed event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub data: TaskCreatedEvent,
    pub processed_at: DateTime<Utc>,
}

impl NotificationRecord {
    pub fn task_created(id: i64, data: TaskCreatedEvent, at: DateTime<Utc>) -> Self {
        Self {
            id,
            timestamp: at,
            kind: NotificationKind::TaskCreated,
            data,
            processed_at: at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_minimal_payload_with_defaults() {
        let event = TaskCreatedEvent::decode(
            br#"{"event":"task.created","taskId":"t-1","title":"Fix bug"}"#,
        )
        .unwrap();

        assert_eq!(event.task_id, "t-1");
        assert_eq!(event.description, "");
        assert_eq!(event.status, TaskStatus::Pending);
        assert_eq!(event.user_id, None);
        assert!(event.created_at.is_none());
    }

    #[test]
    fn decodes_full_payload() {
        let event = TaskCreatedEvent::decode(
            br#"{"event":"task.created","taskId":"t-2","title":"Ship","description":"v1",
                "status":"in-progress","userId":null,
                "createdAt":"2026-01-02T03:04:05Z","timestamp":"2026-01-02T03:04:06Z"}"#,
        )
        .unwrap();

        assert_eq!(event.status, TaskStatus::InProgress);
        assert_eq!(event.created_at.unwrap().to_rfc3339(), "2026-01-02T03:04:05+00:00");
    }

    #[test]
    fn rejects_garbage_and_missing_title() {
        assert!(matches!(
            TaskCreatedEvent::decode(b"not json"),
            Err(ProcessError::Decode(_))
        ));
        assert!(matches!(
            TaskCreatedEvent::decode(br#"{"event":"task.created","taskId":"t-3"}"#),
            Err(ProcessError::Decode(_))
        ));
    }

    #[test]
    fn null_and_unfamiliar_optional_fields_fall_back_to_defaults() {
        let event = TaskCreatedEvent::decode(
            br#"{"event":"task.created","taskId":"t-5","title":"Triage",
                "description":null,"status":"archived","userId":17,
                "createdAt":"yesterday","timestamp":null}"#,
        )
        .unwrap();

        assert_eq!(event.description, "");
        assert_eq!(event.status, TaskStatus::Pending);
        assert_eq!(event.user_id.as_deref(), Some("17"));
        assert!(event.created_at.is_none());
        assert!(event.timestamp.is_none());
    }

    #[test]
    fn status_of_the_wrong_type_is_ignored() {
        let event = TaskCreatedEvent::decode(
            br#"{"event":"task.created","taskId":"t-6","title":"Odd","status":3}"#,
        )
        .unwrap();
        assert_eq!(event.status, TaskStatus::Pending);
    }

    #[test]
    fn record_serializes_with_wire_names() {
        let data = TaskCreatedEvent::decode(
            br#"{"event":"task.created","taskId":"t-4","title":"Docs"}"#,
        )
        .unwrap();
        let record = NotificationRecord::task_created(7, data, Utc::now());
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["type"], "TASK_CREATED");
        assert_eq!(json["data"]["taskId"], "t-4");
        assert!(json.get("processedAt").is_some());
    }
}
