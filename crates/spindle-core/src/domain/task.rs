use serde::{Deserialize, Serialize};
use std::fmt;

/// Handler-interpreted task payload: string keys mapped to JSON values.
pub type Payload = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskType(String);

impl TaskType {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for TaskType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// The producer/handler view of a unit of work: TaskType + Payload.
///
/// Everything the broker tracks on top of this (id, queue, retry counters)
/// lives in [`super::TaskMessage`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub payload: Payload,
}

impl Task {
    pub fn new(task_type: impl Into<TaskType>, payload: Payload) -> Self {
        Self {
            task_type: task_type.into(),
            payload,
        }
    }

    /// Build a task from any JSON object. Non-object values are wrapped under
    /// a `"value"` key so the payload stays a string-keyed map.
    pub fn from_json(task_type: impl Into<TaskType>, value: serde_json::Value) -> Self {
        let payload = match value {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => Payload::new(),
            other => {
                let mut map = Payload::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Self::new(task_type, payload)
    }

    pub fn task_type(&self) -> &TaskType {
        &self.task_type
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }
}

impl From<String> for TaskType {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_json_keeps_objects() {
        let task = Task::from_json("send_email", json!({"to": "a@example.com"}));
        assert_eq!(task.task_type().as_str(), "send_email");
        assert_eq!(task.payload()["to"], "a@example.com");
    }

    #[test]
    fn from_json_wraps_scalars_and_drops_null() {
        let task = Task::from_json("count", json!(3));
        assert_eq!(task.payload()["value"], 3);

        let task = Task::from_json("noop", serde_json::Value::Null);
        assert!(task.payload().is_empty());
    }

    #[test]
    fn task_serializes_type_field() {
        let task = Task::from_json("gen_export", json!({"id": 1}));
        let v = serde_json::to_value(&task).unwrap();
        assert_eq!(v["type"], "gen_export");
        assert_eq!(v["payload"]["id"], 1);
    }
}
