//! Background: processor and scheduler started and stopped together.

use std::future::Future;

use tracing::info;

use super::processor::{Processor, WorkerGroup};
use super::scheduler::{Scheduler, SchedulerHandle};
use crate::broker::Broker;
use crate::config::{ProcessorConfig, SchedulerConfig};
use crate::error::BrokerError;
use crate::runtime::Runtime;

pub struct Background {
    broker: Broker,
    runtime: Runtime,
    processor: ProcessorConfig,
    scheduler: SchedulerConfig,
}

impl Background {
    pub fn new(broker: Broker, runtime: Runtime) -> Self {
        Self {
            broker,
            runtime,
            processor: ProcessorConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }

    pub fn with_processor_config(mut self, config: ProcessorConfig) -> Self {
        self.processor = config;
        self
    }

    pub fn with_scheduler_config(mut self, config: SchedulerConfig) -> Self {
        self.scheduler = config;
        self
    }

    pub async fn start(self) -> Result<BackgroundHandle, BrokerError> {
        let workers = Processor::new(self.broker.clone(), self.runtime, self.processor)
            .start()
            .await?;
        let scheduler = Scheduler::new(self.broker, self.scheduler).spawn();
        Ok(BackgroundHandle { workers, scheduler })
    }

    /// Start, wait for `signal`, then shut down.
    pub async fn run_until<F: Future>(self, signal: F) -> Result<(), BrokerError> {
        let handle = self.start().await?;
        signal.await;
        info!("shutdown requested");
        handle.shutdown().await;
        Ok(())
    }
}

pub struct BackgroundHandle {
    workers: WorkerGroup,
    scheduler: SchedulerHandle,
}

impl BackgroundHandle {
    /// Stop forwarding, then drain (and if needed cancel) the workers.
    pub async fn shutdown(self) {
        self.scheduler.shutdown_and_join().await;
        self.workers.shutdown_and_join().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::RetryPolicy;
    use crate::domain::{Task, TaskId, TaskMessage};
    use crate::error::HandlerError;
    use crate::runtime::{HandlerRegistry, handler_fn};
    use crate::testing::{Harness, eventually};
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use ulid::Ulid;

    #[tokio::test]
    async fn failed_task_is_retried_until_it_succeeds() {
        let h = &Harness::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&attempts);

        let mut registry = HandlerRegistry::new();
        registry
            .register(
                "flaky",
                Arc::new(handler_fn(move |_task: Task| {
                    let seen = Arc::clone(&seen);
                    async move {
                        if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                            Err(HandlerError::failed("first attempt fails"))
                        } else {
                            Ok(())
                        }
                    }
                })),
            )
            .unwrap();

        let handle = Background::new(h.broker.clone(), Runtime::new(Arc::new(registry)))
            .with_processor_config(
                ProcessorConfig::new(1)
                    .with_idle_interval(Duration::from_millis(5), Duration::from_millis(20))
                    .with_retry_policy(RetryPolicy::deterministic(Duration::from_secs(30), 2.0)),
            )
            .with_scheduler_config(SchedulerConfig::default().with_interval(Duration::from_millis(10)))
            .start()
            .await
            .unwrap();

        let msg = TaskMessage::new(
            TaskId::from_ulid(Ulid::new()),
            Task::from_json("flaky", json!({})),
            "default",
        );
        h.broker.enqueue(&msg).await.unwrap();
        eventually("first attempt failed", || async move { h.retry_set().await.len() == 1 }).await;

        h.clock.advance(Duration::from_secs(30));
        let attempts_ref = &attempts;
        eventually("second attempt succeeded", || async move {
            attempts_ref.load(Ordering::SeqCst) == 2
                && h.retry_set().await.is_empty()
                && h.in_progress_len().await == 0
                && h.ready_len("default").await == 0
        })
        .await;

        handle.shutdown().await;
        assert!(h.dead_set().await.is_empty());
    }

    #[tokio::test]
    async fn run_until_stops_on_signal() {
        let h = Harness::new();
        let background = Background::new(h.broker.clone(), Runtime::new(Arc::new(HandlerRegistry::new())))
            .with_processor_config(ProcessorConfig::new(1));
        background
            .run_until(tokio::time::sleep(Duration::from_millis(20)))
            .await
            .unwrap();
    }
}
