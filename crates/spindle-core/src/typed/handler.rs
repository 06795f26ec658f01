//! Handler<T>: typed handlers, erased into `TaskHandler`.

use std::marker::PhantomData;

use async_trait::async_trait;

use super::task::Task;
use crate::domain;
use crate::error::HandlerError;
use crate::runtime::TaskHandler;

/// Handles one concrete task type.
///
/// `Handler<SendEmail>` only ever receives a decoded `SendEmail`; a payload
/// that does not decode fails the attempt with [`HandlerError::Decode`].
#[async_trait]
pub trait Handler<T: Task>: Send + Sync {
    async fn handle(&self, task: T) -> Result<(), HandlerError>;
}

/// Type-erasing adapter from `Handler<T>` to [`TaskHandler`].
pub struct TypedHandler<T: Task, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Task, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Task, H: Handler<T>> TaskHandler for TypedHandler<T, H> {
    async fn handle(&self, task: &domain::Task) -> Result<(), HandlerError> {
        let decoded = T::from_task(task)?;
        self.handler.handle(decoded).await
    }
}
