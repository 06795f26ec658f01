//! TaskMessage: the record the broker moves between containers.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ids::TaskId;
use super::task::{Payload, Task, TaskType};

/// The canonical task record.
///
/// A stored message is never updated in place. Every transition writes a new
/// serialized copy (for example with `retried + 1`) and removes the old one
/// in the same store transaction, so the encoded string doubles as the
/// identity of the entry inside a container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMessage {
    pub id: TaskId,

    #[serde(rename = "type")]
    pub task_type: TaskType,

    pub payload: Payload,

    /// Logical queue name; partitions the ready containers.
    pub queue: String,

    /// Failed attempts that were rescheduled so far.
    pub retried: u32,

    /// Ceiling on `retried` before the task is dead-lettered.
    pub max_retry: u32,

    /// Wall-clock limit for a single attempt. Zero means no limit.
    #[serde(rename = "timeout_ms", with = "crate::config::duration_ms")]
    pub timeout: Duration,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_key: Option<String>,

    /// Reason of the most recent failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,

    /// Exact string this message was decoded from.
    #[serde(skip)]
    stored: Option<String>,
}

impl PartialEq for TaskMessage {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.task_type == other.task_type
            && self.payload == other.payload
            && self.queue == other.queue
            && self.retried == other.retried
            && self.max_retry == other.max_retry
            && self.timeout == other.timeout
            && self.unique_key == other.unique_key
            && self.error_msg == other.error_msg
    }
}

impl TaskMessage {
    pub fn new(id: TaskId, task: Task, queue: impl Into<String>) -> Self {
        Self {
            id,
            task_type: task.task_type,
            payload: task.payload,
            queue: queue.into(),
            retried: 0,
            max_retry: crate::client::DEFAULT_MAX_RETRY,
            timeout: crate::client::DEFAULT_TIMEOUT,
            unique_key: None,
            error_msg: None,
            stored: None,
        }
    }

    pub fn with_max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_unique_key(mut self, key: impl Into<String>) -> Self {
        self.unique_key = Some(key.into());
        self
    }

    /// Handler-facing view (type + payload).
    pub fn task(&self) -> Task {
        Task::new(self.task_type.clone(), self.payload.clone())
    }

    /// Has this task used up its retry budget?
    pub fn is_exhausted(&self) -> bool {
        self.retried >= self.max_retry
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode a stored record. The message remembers `raw` as its
    /// [`stored_form`](Self::stored_form).
    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        let mut msg: Self = serde_json::from_str(raw)?;
        msg.stored = Some(raw.to_string());
        Ok(msg)
    }

    /// The member string identifying this message inside its container.
    ///
    /// For a decoded message this is the string it was read from, never a
    /// re-encoding: JSON numbers do not always survive a parse/print cycle
    /// byte for byte.
    pub fn stored_form(&self) -> Result<String, serde_json::Error> {
        match &self.stored {
            Some(raw) => Ok(raw.clone()),
            None => self.encode(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use ulid::Ulid;

    fn sample() -> TaskMessage {
        let task = Task::from_json(
            "send_email",
            json!({"to": "user@example.com", "attempt": 1, "tags": ["a", "b"], "ratio": 0.25}),
        );
        TaskMessage::new(TaskId::from_ulid(Ulid::new()), task, "default")
            .with_max_retry(3)
            .with_timeout(Duration::from_millis(1500))
    }

    #[test]
    fn decoded_message_keeps_its_stored_form() {
        let fresh = TaskMessage::new(
            TaskId::from_ulid(Ulid::new()),
            Task::from_json("t", json!({"v": 0.5})),
            "default",
        );
        // same record, number printed differently by another producer
        let raw = fresh.encode().unwrap().replace("0.5", "0.50");
        let decoded = TaskMessage::decode(&raw).unwrap();

        assert_eq!(decoded, fresh);
        assert_ne!(decoded.encode().unwrap(), raw);
        assert_eq!(decoded.stored_form().unwrap(), raw);
        assert_eq!(fresh.stored_form().unwrap(), fresh.encode().unwrap());
    }

    #[test]
    fn optional_fields_are_omitted() {
        let v: serde_json::Value = serde_json::from_str(&sample().encode().unwrap()).unwrap();
        assert!(v.get("unique_key").is_none());
        assert!(v.get("error_msg").is_none());
        assert_eq!(v["timeout_ms"], 1500);
        assert_eq!(v["type"], "send_email");
    }

    #[test]
    fn exhaustion_follows_retry_budget() {
        let mut msg = sample();
        assert!(!msg.is_exhausted());
        msg.retried = 3;
        assert!(msg.is_exhausted());
    }

    #[test]
    fn task_view_drops_broker_fields() {
        let msg = sample().with_unique_key("k");
        let task = msg.task();
        assert_eq!(task.task_type.as_str(), "send_email");
        assert_eq!(task.payload["to"], "user@example.com");
    }
}
