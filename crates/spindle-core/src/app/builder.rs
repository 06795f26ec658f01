//! AppBuilder: handler wiring with a start-up check.

use std::sync::Arc;

use crate::domain::TaskType;
use crate::runtime::{HandlerRegistry, RegistryError, Runtime, TaskHandler};
use crate::typed::{Handler, Task};

/// Collects handlers and builds a [`Runtime`].
///
/// ```ignore
/// let runtime = AppBuilder::new()
///     .register::<SendEmail, _>(EmailHandler)?
///     .expect_tasks(&["email.send"])
///     .build()?;
/// ```
///
/// `build()` fails when a task type listed in `expect_tasks()` has no
/// handler, so a worker never starts unable to process its own producers'
/// tasks.
pub struct AppBuilder {
    registry: HandlerRegistry,
    expected_tasks: Option<Vec<TaskType>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing task types: {0:?}; these were expected but not registered")]
    MissingTaskTypes(Vec<String>),
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            registry: HandlerRegistry::new(),
            expected_tasks: None,
        }
    }

    /// Register a typed handler under `T::TYPE`.
    pub fn register<T: Task, H: Handler<T> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, RegistryError> {
        self.registry.register_typed::<T, H>(handler)?;
        Ok(self)
    }

    /// Register an untyped handler.
    pub fn handle(
        mut self,
        task_type: impl Into<TaskType>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<Self, RegistryError> {
        self.registry.register(task_type, handler)?;
        Ok(self)
    }

    pub fn expect_tasks(mut self, task_types: &[&str]) -> Self {
        self.expected_tasks = Some(task_types.iter().map(|&t| TaskType::new(t)).collect());
        self
    }

    pub fn build(self) -> Result<Runtime, BuildError> {
        if let Some(expected_tasks) = &self.expected_tasks {
            let missing: Vec<String> = expected_tasks
                .iter()
                .filter(|t| !self.registry.contains(t))
                .map(|t| t.to_string())
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingTaskTypes(missing));
            }
        }
        Ok(Runtime::new(Arc::new(self.registry)))
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}
