//! spindle-core
//!
//! A persistent background task queue. Producers enqueue tasks through a
//! [`client::Client`]; a [`app::Processor`] pool runs them; failed tasks are
//! retried with backoff by way of the [`app::Scheduler`] and end up in a
//! dead set once their retries are spent.
//!
//! # Modules
//! - **domain**: task ids, tasks, and the stored task message
//! - **ports**: the store, clock, and id generator seams
//! - **impls**: in-memory and Redis stores
//! - **broker**: every state transition, each one atomic in the store
//! - **runtime** / **typed**: handler registry, untyped and typed
//! - **app**: processor, scheduler, and their wiring
//! - **inspector**: read-only stats and listings
//! - **config**: runtime settings, loadable from JSON

pub mod app;
pub mod broker;
pub mod client;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod inspector;
pub mod ports;
pub mod runtime;
pub mod typed;

#[cfg(test)]
pub(crate) mod testing;

pub use crate::broker::{Broker, RetryPolicy};
pub use crate::client::{Client, EnqueueOptions};
pub use crate::error::{BrokerError, HandlerError};
pub use crate::inspector::{Inspector, Stats};
