//! Task trait: binds a payload type to its task type name.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain;

/// A payload type with a fixed task type name.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct SendEmail {
///     to: String,
/// }
///
/// impl Task for SendEmail {
///     const TYPE: &'static str = "email.send";
/// }
/// ```
///
/// The payload must serialize to a JSON object.
pub trait Task: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TYPE: &'static str;

    /// Untyped form, ready to enqueue.
    fn to_task(&self) -> Result<domain::Task, serde_json::Error> {
        let value = serde_json::to_value(self)?;
        Ok(domain::Task::from_json(Self::TYPE, value))
    }

    /// Decode from an untyped task's payload.
    fn from_task(task: &domain::Task) -> Result<Self, serde_json::Error> {
        serde_json::from_value(serde_json::Value::Object(task.payload().clone()))
    }
}
