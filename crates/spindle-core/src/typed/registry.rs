//! Typed registration on top of `HandlerRegistry`.

use std::sync::Arc;

use super::handler::{Handler, TypedHandler};
use super::task::Task;
use crate::runtime::{HandlerRegistry, RegistryError};

impl HandlerRegistry {
    /// Register `handler` under `T::TYPE`.
    pub fn register_typed<T: Task, H: Handler<T> + 'static>(
        &mut self,
        handler: H,
    ) -> Result<(), RegistryError> {
        self.register(T::TYPE, Arc::new(TypedHandler::new(handler)))
    }
}
