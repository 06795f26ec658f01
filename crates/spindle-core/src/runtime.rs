use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{Task, TaskType};
use crate::error::HandlerError;

/// A handler for a specific task type.
///
/// Handlers see the task type and the raw payload map and decode it however
/// they like. See [`crate::typed`] for a typed layer on top.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task) -> Result<(), HandlerError>;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("handler for task_type={0} is already registered")]
    AlreadyRegistered(TaskType),
}

/// Adapts an async closure into a [`TaskHandler`].
pub struct FnHandler<F> {
    f: F,
}

/// Wrap `f` as a handler. The closure gets its own copy of the task.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Task) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(Task) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, task: &Task) -> Result<(), HandlerError> {
        (self.f)(task.clone()).await
    }
}

/// Registry of handlers (task_type -> handler).
///
/// Built during initialization, then shared read-only by every worker, so
/// no locks are needed.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for a task type. A second registration for the same
    /// type is rejected.
    pub fn register(
        &mut self,
        task_type: impl Into<TaskType>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), RegistryError> {
        let task_type = task_type.into();
        if self.handlers.contains_key(&task_type) {
            return Err(RegistryError::AlreadyRegistered(task_type));
        }
        self.handlers.insert(task_type, handler);
        Ok(())
    }

    pub fn get(&self, task_type: &TaskType) -> Option<&Arc<dyn TaskHandler>> {
        self.handlers.get(task_type)
    }

    pub fn contains(&self, task_type: &TaskType) -> bool {
        self.handlers.contains_key(task_type)
    }

    /// Registered types, sorted.
    pub fn registered_types(&self) -> Vec<TaskType> {
        let mut types: Vec<TaskType> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Runtime dispatches a task to its registered handler.
#[derive(Clone)]
pub struct Runtime {
    registry: Arc<HandlerRegistry>,
}

impl Runtime {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Look up the handler for `task_type`.
    pub fn resolve(&self, task_type: &TaskType) -> Result<Arc<dyn TaskHandler>, HandlerError> {
        self.registry
            .get(task_type)
            .cloned()
            .ok_or_else(|| HandlerError::UnknownTaskType(task_type.clone()))
    }

    /// Execute one task.
    pub async fn execute(&self, task: &Task) -> Result<(), HandlerError> {
        self.resolve(task.task_type())?.handle(task).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Payload;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct OkHandler;

    #[async_trait]
    impl TaskHandler for OkHandler {
        async fn handle(&self, _task: &Task) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn runtime_executes_registered_handler() {
        let mut reg = HandlerRegistry::new();
        reg.register("ok", Arc::new(OkHandler)).unwrap();

        let rt = Runtime::new(Arc::new(reg));
        rt.execute(&Task::new("ok", Payload::new())).await.unwrap();
    }

    #[tokio::test]
    async fn runtime_errors_when_handler_missing() {
        let rt = Runtime::new(Arc::new(HandlerRegistry::new()));

        let err = rt
            .execute(&Task::new("missing", Payload::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::UnknownTaskType(t) if t.as_str() == "missing"));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut reg = HandlerRegistry::new();
        reg.register("ok", Arc::new(OkHandler)).unwrap();
        assert_eq!(
            reg.register("ok", Arc::new(OkHandler)),
            Err(RegistryError::AlreadyRegistered(TaskType::new("ok")))
        );
        assert_eq!(reg.len(), 1);
    }

    #[tokio::test]
    async fn closures_can_be_handlers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();

        let mut reg = HandlerRegistry::new();
        reg.register(
            "count",
            Arc::new(handler_fn(move |task: Task| {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    if task.payload().contains_key("fail") {
                        Err(HandlerError::failed("asked to fail"))
                    } else {
                        Ok(())
                    }
                }
            })),
        )
        .unwrap();
        let rt = Runtime::new(Arc::new(reg));

        rt.execute(&Task::new("count", Payload::new())).await.unwrap();
        let failing = Task::from_json("count", serde_json::json!({"fail": true}));
        assert!(matches!(
            rt.execute(&failing).await,
            Err(HandlerError::Failed(_))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(rt.registry().registered_types(), vec![TaskType::new("count")]);
    }
}
