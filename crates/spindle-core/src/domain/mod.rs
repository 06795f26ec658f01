//! Domain model: ids, tasks, and the broker's task record.

pub mod ids;
pub mod message;
pub mod task;

pub use ids::TaskId;
pub use message::TaskMessage;
pub use task::{Payload, Task, TaskType};
