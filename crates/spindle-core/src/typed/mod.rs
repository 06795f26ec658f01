//! Typed task API.
//!
//! - **`Task`** binds a serde payload type to its task type name
//! - **`Handler<T>`** receives the decoded payload
//! - **`TypedHandler`** erases `Handler<T>` into a plain `TaskHandler`

pub mod handler;
pub mod registry;
pub mod task;

pub use self::handler::{Handler, TypedHandler};
pub use self::task::Task;
