//! Processor: a fixed pool of workers pulling tasks from the broker.
//!
//! Each worker loops: dequeue (queues tried in priority order), run the
//! handler in its own tokio task under the message's timeout, then report
//! `done` or `retry` back to the broker. Handler panics stay inside that
//! task and count as a failed attempt.

use std::any::Any;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::broker::Broker;
use crate::config::ProcessorConfig;
use crate::domain::TaskMessage;
use crate::error::{BrokerError, HandlerError};
use crate::runtime::Runtime;

pub struct Processor {
    broker: Broker,
    runtime: Runtime,
    config: ProcessorConfig,
}

impl Processor {
    pub fn new(broker: Broker, runtime: Runtime, config: ProcessorConfig) -> Self {
        Self {
            broker,
            runtime,
            config,
        }
    }

    /// Restore leftovers (if configured) and spawn the workers.
    pub async fn start(self) -> Result<WorkerGroup, BrokerError> {
        if self.config.restore_on_start {
            self.broker.restore_unfinished().await?;
        }
        Ok(WorkerGroup::spawn(self.broker, self.runtime, self.config))
    }
}

/// Worker group handle.
/// - `request_shutdown()` stops dequeuing
/// - `shutdown_and_join()` also waits for in-flight handlers, canceling the
///   ones still running once the grace period is over
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    cancel_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
    grace: Duration,
}

impl WorkerGroup {
    fn spawn(broker: Broker, runtime: Runtime, config: ProcessorConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let grace = config.shutdown_grace;
        let config = Arc::new(config);

        let mut joins = Vec::with_capacity(config.concurrency);
        for id in 0..config.concurrency {
            let worker = Worker {
                id,
                broker: broker.clone(),
                runtime: runtime.clone(),
                config: Arc::clone(&config),
            };
            let shutdown_rx = shutdown_rx.clone();
            let cancel_rx = cancel_rx.clone();
            joins.push(tokio::spawn(worker.run(shutdown_rx, cancel_rx)));
        }

        info!(
            concurrency = config.concurrency,
            queues = ?config.queues,
            "processor started"
        );
        Self {
            shutdown_tx,
            cancel_tx,
            joins,
            grace,
        }
    }

    /// Stop taking new tasks. In-flight handlers keep running.
    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    /// Shutdown and wait for all workers.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();

        let mut pending: VecDeque<JoinHandle<()>> = self.joins.into();
        let drained = tokio::time::timeout(self.grace, async {
            while let Some(join) = pending.front_mut() {
                let _ = join.await;
                pending.pop_front();
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = pending.len(),
                grace = ?self.grace,
                "grace period over, canceling in-flight tasks"
            );
            let _ = self.cancel_tx.send(true);
            for join in pending {
                let _ = join.await;
            }
        }
        info!("processor stopped");
    }
}

#[derive(Clone)]
struct Worker {
    id: usize,
    broker: Broker,
    runtime: Runtime,
    config: Arc<ProcessorConfig>,
}

impl Worker {
    async fn run(self, mut shutdown_rx: watch::Receiver<bool>, cancel_rx: watch::Receiver<bool>) {
        let mut idle = self.config.min_idle_interval;
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            match self.broker.dequeue(&self.config.queues).await {
                Ok(msg) => {
                    idle = self.config.min_idle_interval;
                    self.process(msg, cancel_rx.clone()).await;
                    continue;
                }
                Err(BrokerError::NoTaskAvailable) => {}
                Err(e @ BrokerError::Codec(_)) => {
                    warn!(worker = self.id, error = %e, "dropped undecodable task");
                    continue;
                }
                Err(e) => {
                    error!(worker = self.id, error = %e, "dequeue failed");
                }
            }

            let stop = tokio::select! {
                changed = shutdown_rx.changed() => changed.is_err() || *shutdown_rx.borrow(),
                _ = tokio::time::sleep(idle) => false,
            };
            if stop {
                break;
            }
            idle = (idle * 2).min(self.config.max_idle_interval);
        }
        debug!(worker = self.id, "worker stopped");
    }

    async fn process(&self, msg: TaskMessage, mut cancel_rx: watch::Receiver<bool>) {
        debug!(worker = self.id, task_id = %msg.id, task_type = %msg.task_type, "processing");

        let outcome = match self.runtime.resolve(&msg.task_type) {
            Ok(handler) => {
                let task = msg.task();
                let mut join = tokio::spawn(async move { handler.handle(&task).await });
                tokio::select! {
                    res = &mut join => res.unwrap_or_else(|e| Err(join_failure(e))),
                    _ = expire(msg.timeout) => {
                        join.abort();
                        Err(HandlerError::Timeout(msg.timeout))
                    }
                    _ = canceled(&mut cancel_rx) => {
                        join.abort();
                        Err(HandlerError::Canceled)
                    }
                }
            }
            Err(e) => Err(e),
        };

        let broker = &self.broker;
        let current = &msg;
        match outcome {
            Ok(()) => {
                self.report(current, "done", &mut cancel_rx, move || broker.done(current))
                    .await;
            }
            Err(e) => {
                let reason = e.to_string();
                let reason = reason.as_str();
                let delay = self.config.retry.next_delay(msg.retried);
                warn!(worker = self.id, task_id = %msg.id, error = %reason, "task failed");
                self.report(current, "retry", &mut cancel_rx, move || {
                    broker.retry(current, reason, delay)
                })
                .await;
            }
        }
    }

    /// Deliver a result to the broker, retrying with capped backoff for as
    /// long as the store is unavailable.
    ///
    /// Only cancellation stops the retries. The message then stays in
    /// progress until a processor started with `restore_on_start` puts it
    /// back on its queue.
    async fn report<F, Fut, T>(
        &self,
        msg: &TaskMessage,
        what: &str,
        cancel_rx: &mut watch::Receiver<bool>,
        op: F,
    ) where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, BrokerError>>,
    {
        let mut backoff = self.config.min_idle_interval;
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            match op().await {
                Ok(_) => return,
                Err(BrokerError::TaskNotFound(_)) => {
                    debug!(task_id = %msg.id, what, "task already gone, ignoring report");
                    return;
                }
                Err(BrokerError::BrokerUnavailable(e)) => {
                    warn!(task_id = %msg.id, what, attempt, error = %e, "report failed, retrying");
                }
                Err(e) => {
                    error!(task_id = %msg.id, what, error = %e, "could not report task result");
                    return;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = canceled(cancel_rx) => {
                    error!(
                        task_id = %msg.id,
                        what,
                        attempt,
                        "store still unavailable at shutdown, task left in progress"
                    );
                    return;
                }
            }
            backoff = (backoff * 2).min(self.config.max_idle_interval);
        }
    }
}

/// Resolves once `timeout` has passed; never for a zero timeout.
async fn expire(timeout: Duration) {
    if timeout.is_zero() {
        std::future::pending::<()>().await;
    } else {
        tokio::time::sleep(timeout).await;
    }
}

/// Resolves once cancellation is requested.
async fn canceled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn join_failure(e: JoinError) -> HandlerError {
    if e.is_panic() {
        HandlerError::Panicked(panic_message(e.into_panic()))
    } else {
        HandlerError::Canceled
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::RetryPolicy;
    use crate::domain::{Task, TaskId};
    use crate::impls::InMemoryStore;
    use crate::ports::{Store, StoreError, Transaction};
    use crate::runtime::{HandlerRegistry, TaskHandler, handler_fn};
    use crate::testing::{Harness, eventually};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use ulid::Ulid;

    fn config() -> ProcessorConfig {
        ProcessorConfig::new(2)
            .with_idle_interval(Duration::from_millis(5), Duration::from_millis(20))
            .with_shutdown_grace(Duration::from_millis(200))
            .with_retry_policy(RetryPolicy::deterministic(Duration::from_secs(10), 2.0))
    }

    fn handler<F, Fut>(f: F) -> Arc<dyn TaskHandler>
    where
        F: Fn(Task) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        Arc::new(handler_fn(f))
    }

    fn runtime(handlers: Vec<(&str, Arc<dyn TaskHandler>)>) -> Runtime {
        let mut registry = HandlerRegistry::new();
        for (task_type, handler) in handlers {
            registry.register(task_type, handler).unwrap();
        }
        Runtime::new(Arc::new(registry))
    }

    fn message(task_type: &str, queue: &str) -> TaskMessage {
        TaskMessage::new(
            TaskId::from_ulid(Ulid::new()),
            Task::from_json(task_type, json!({"n": 1})),
            queue,
        )
    }

    fn failing(reason: &'static str) -> Arc<dyn TaskHandler> {
        handler(move |_task| async move { Err(HandlerError::failed(reason)) })
    }

    /// Counts calls, then sleeps for `d`.
    fn counting(calls: &Arc<AtomicUsize>, d: Duration) -> Arc<dyn TaskHandler> {
        let calls = Arc::clone(calls);
        handler(move |_task| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(d).await;
                Ok(())
            }
        })
    }

    async fn start(h: &Harness, rt: Runtime, config: ProcessorConfig) -> WorkerGroup {
        Processor::new(h.broker.clone(), rt, config)
            .start()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn successful_tasks_are_done() {
        let h = &Harness::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let rt = runtime(vec![("count", counting(&calls, Duration::ZERO))]);
        for _ in 0..5 {
            h.broker.enqueue(&message("count", "default")).await.unwrap();
        }

        let workers = start(h, rt, config()).await;
        assert_eq!(workers.len(), 2);
        let calls = &calls;
        eventually("all tasks done", || async move {
            calls.load(Ordering::SeqCst) == 5 && h.in_progress_len().await == 0
        })
        .await;
        workers.shutdown_and_join().await;

        assert_eq!(h.ready_len("default").await, 0);
        assert!(h.retry_set().await.is_empty());
    }

    #[tokio::test]
    async fn failed_task_goes_to_retry_with_backoff() {
        let h = &Harness::new();
        let msg = message("bad", "default");
        h.broker.enqueue(&msg).await.unwrap();

        let workers = start(h, runtime(vec![("bad", failing("boom"))]), config()).await;
        eventually("task in retry", || async move { h.retry_set().await.len() == 1 }).await;
        workers.shutdown_and_join().await;

        let retried = &h.retry_set().await[0];
        assert_eq!(retried.id, msg.id);
        assert_eq!(retried.retried, 1);
        assert_eq!(retried.error_msg.as_deref(), Some("boom"));

        let retry_key = h.broker.keys().retry();
        let now = h.broker.now().timestamp();
        assert!(h.store.range_by_score(&retry_key, now + 9).await.unwrap().is_empty());
        assert_eq!(h.store.range_by_score(&retry_key, now + 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_task_type_is_a_failure() {
        let h = &Harness::new();
        h.broker.enqueue(&message("nobody", "default")).await.unwrap();

        let workers = start(h, runtime(vec![]), config()).await;
        eventually("task in retry", || async move { h.retry_set().await.len() == 1 }).await;
        workers.shutdown_and_join().await;

        let err = h.retry_set().await[0].error_msg.clone().unwrap();
        assert_eq!(err, "no handler registered for task_type=nobody");
    }

    #[tokio::test]
    async fn panicking_handler_does_not_kill_the_worker() {
        let h = &Harness::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let rt = runtime(vec![
            (
                "panic",
                handler(|task| async move {
                    if task.payload().contains_key("n") {
                        panic!("handler exploded");
                    }
                    Ok(())
                }),
            ),
            ("ok", counting(&calls, Duration::ZERO)),
        ]);
        h.broker.enqueue(&message("panic", "default")).await.unwrap();
        h.broker.enqueue(&message("ok", "default")).await.unwrap();

        let workers = start(h, rt, config().with_concurrency(1)).await;
        let calls = &calls;
        eventually("both tasks handled", || async move {
            calls.load(Ordering::SeqCst) == 1 && h.retry_set().await.len() == 1 && h.in_progress_len().await == 0
        })
        .await;
        workers.shutdown_and_join().await;

        let err = h.retry_set().await[0].error_msg.clone().unwrap();
        assert_eq!(err, "handler panicked: handler exploded");
    }

    #[tokio::test]
    async fn slow_handler_times_out() {
        let h = &Harness::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let rt = runtime(vec![("slow", counting(&calls, Duration::from_secs(30)))]);
        h.broker
            .enqueue(&message("slow", "default").with_timeout(Duration::from_millis(20)))
            .await
            .unwrap();

        let workers = start(h, rt, config()).await;
        eventually("task in retry", || async move { h.retry_set().await.len() == 1 }).await;
        workers.shutdown_and_join().await;

        let err = h.retry_set().await[0].error_msg.clone().unwrap();
        assert!(err.starts_with("timed out"), "{err}");
    }

    #[tokio::test]
    async fn exhausted_task_is_dead_lettered() {
        let h = &Harness::new();
        h.broker
            .enqueue(&message("bad", "default").with_max_retry(0))
            .await
            .unwrap();

        let workers = start(h, runtime(vec![("bad", failing("still broken"))]), config()).await;
        eventually("task dead", || async move { h.dead_set().await.len() == 1 }).await;
        workers.shutdown_and_join().await;

        let dead = &h.dead_set().await[0];
        assert_eq!(dead.retried, 0);
        assert_eq!(dead.error_msg.as_deref(), Some("still broken"));
    }

    #[tokio::test]
    async fn shutdown_waits_for_short_handlers() {
        let h = &Harness::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let rt = runtime(vec![("short", counting(&calls, Duration::from_millis(50)))]);
        h.broker.enqueue(&message("short", "default")).await.unwrap();

        let workers = start(h, rt, config().with_shutdown_grace(Duration::from_secs(2))).await;
        let calls = &calls;
        eventually("handler started", || async move { calls.load(Ordering::SeqCst) == 1 }).await;
        workers.shutdown_and_join().await;

        assert_eq!(h.in_progress_len().await, 0);
        assert!(h.retry_set().await.is_empty());
    }

    #[tokio::test]
    async fn shutdown_cancels_long_handlers_after_grace() {
        let h = &Harness::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let rt = runtime(vec![("long", counting(&calls, Duration::from_secs(60)))]);
        h.broker.enqueue(&message("long", "default")).await.unwrap();

        let workers = start(h, rt, config()).await;
        let calls = &calls;
        eventually("handler started", || async move { calls.load(Ordering::SeqCst) == 1 }).await;

        let begun = tokio::time::Instant::now();
        workers.shutdown_and_join().await;
        assert!(begun.elapsed() < Duration::from_secs(5));

        assert_eq!(h.in_progress_len().await, 0);
        let retried = h.retry_set().await;
        assert_eq!(retried.len(), 1);
        assert_eq!(retried[0].error_msg.as_deref(), Some("canceled by shutdown"));
    }

    #[tokio::test]
    async fn leftovers_are_restored_on_start() {
        let h = &Harness::new();
        h.broker.enqueue(&message("ok", "default")).await.unwrap();
        h.broker.dequeue(&["default"]).await.unwrap();
        assert_eq!(h.in_progress_len().await, 1);

        let calls = Arc::new(AtomicUsize::new(0));
        let rt = runtime(vec![("ok", counting(&calls, Duration::ZERO))]);
        let workers = start(h, rt, config().with_restore_on_start(true)).await;
        let calls = &calls;
        eventually("restored task done", || async move {
            calls.load(Ordering::SeqCst) == 1 && h.in_progress_len().await == 0
        })
        .await;
        workers.shutdown_and_join().await;
        assert!(h.retry_set().await.is_empty());
    }

    #[tokio::test]
    async fn higher_priority_queues_drain_first() {
        let h = &Harness::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&order);
        let rt = runtime(vec![(
            "record",
            handler(move |task| {
                let seen = Arc::clone(&seen);
                async move {
                    let queue = task.payload()["queue"].as_str().unwrap_or_default().to_string();
                    seen.lock().unwrap().push(queue);
                    Ok(())
                }
            }),
        )]);
        for queue in ["low", "high", "low", "high"] {
            let msg = TaskMessage::new(
                TaskId::from_ulid(Ulid::new()),
                Task::from_json("record", json!({ "queue": queue })),
                queue,
            );
            h.broker.enqueue(&msg).await.unwrap();
        }

        let workers = start(h, rt, config().with_concurrency(1).with_queues(["high", "low"])).await;
        let order_ref = &order;
        eventually("all recorded", || async move { order_ref.lock().unwrap().len() == 4 }).await;
        workers.shutdown_and_join().await;

        assert_eq!(*order.lock().unwrap(), vec!["high", "high", "low", "low"]);
    }

    #[tokio::test]
    async fn leftovers_stay_put_unless_restore_is_enabled() {
        let h = &Harness::new();
        h.broker.enqueue(&message("ok", "default")).await.unwrap();
        h.broker.dequeue(&["default"]).await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let rt = runtime(vec![("ok", counting(&calls, Duration::ZERO))]);
        let workers = start(h, rt, config()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        workers.shutdown_and_join().await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.in_progress_len().await, 1);
    }

    /// Fails the next `outages` transactions, then behaves like `inner`.
    struct UnreliableStore {
        inner: Arc<InMemoryStore>,
        outages: AtomicUsize,
    }

    impl UnreliableStore {
        fn new(inner: Arc<InMemoryStore>) -> Self {
            Self {
                inner,
                outages: AtomicUsize::new(0),
            }
        }

        fn fail_next(&self, n: usize) {
            self.outages.store(n, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Store for UnreliableStore {
        async fn execute(&self, tx: Transaction) -> Result<bool, StoreError> {
            let down = self
                .outages
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if down {
                return Err(StoreError::Connection("connection refused".into()));
            }
            self.inner.execute(tx).await
        }

        async fn pop_head_push_tail(
            &self,
            src: &str,
            dst: &str,
        ) -> Result<Option<String>, StoreError> {
            self.inner.pop_head_push_tail(src, dst).await
        }

        async fn range_by_score(&self, key: &str, max_score: i64) -> Result<Vec<String>, StoreError> {
            self.inner.range_by_score(key, max_score).await
        }

        async fn list_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
            self.inner.list_members(key).await
        }

        async fn sorted_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
            self.inner.sorted_members(key).await
        }

        async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
            self.inner.set_members(key).await
        }

        async fn list_len(&self, key: &str) -> Result<usize, StoreError> {
            self.inner.list_len(key).await
        }

        async fn sorted_len(&self, key: &str) -> Result<usize, StoreError> {
            self.inner.sorted_len(key).await
        }

        async fn exists(&self, key: &str) -> Result<bool, StoreError> {
            self.inner.exists(key).await
        }
    }

    fn unreliable(h: &Harness) -> (Broker, Arc<UnreliableStore>) {
        let store = Arc::new(UnreliableStore::new(h.store.clone()));
        let broker = Broker::new(store.clone()).with_clock(h.clock.clone());
        (broker, store)
    }

    #[tokio::test]
    async fn done_is_reported_once_the_store_comes_back() {
        let h = &Harness::new();
        let (broker, store) = unreliable(h);
        broker.enqueue(&message("ok", "default")).await.unwrap();
        store.fail_next(12);

        let calls = Arc::new(AtomicUsize::new(0));
        let rt = runtime(vec![("ok", counting(&calls, Duration::ZERO))]);
        let workers = Processor::new(broker, rt, config()).start().await.unwrap();
        eventually("task done after outage", || async move {
            h.in_progress_len().await == 0 && h.ready_len("default").await == 0
        })
        .await;
        workers.shutdown_and_join().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(h.retry_set().await.is_empty());
    }

    #[tokio::test]
    async fn failure_is_recorded_once_the_store_comes_back() {
        let h = &Harness::new();
        let (broker, store) = unreliable(h);
        broker.enqueue(&message("bad", "default")).await.unwrap();
        store.fail_next(12);

        let rt = runtime(vec![("bad", failing("boom"))]);
        let workers = Processor::new(broker, rt, config()).start().await.unwrap();
        eventually("task in retry after outage", || async move {
            h.retry_set().await.len() == 1
        })
        .await;
        workers.shutdown_and_join().await;

        assert_eq!(h.in_progress_len().await, 0);
        assert_eq!(h.retry_set().await[0].error_msg.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn shutdown_during_an_outage_leaves_the_task_in_progress() {
        let h = &Harness::new();
        let (broker, store) = unreliable(h);
        broker.enqueue(&message("ok", "default")).await.unwrap();
        store.fail_next(usize::MAX);

        let calls = Arc::new(AtomicUsize::new(0));
        let rt = runtime(vec![("ok", counting(&calls, Duration::ZERO))]);
        let workers = Processor::new(broker.clone(), rt, config()).start().await.unwrap();
        let calls_ref = &calls;
        eventually("handler ran", || async move { calls_ref.load(Ordering::SeqCst) == 1 }).await;

        let begun = tokio::time::Instant::now();
        workers.shutdown_and_join().await;
        assert!(begun.elapsed() < Duration::from_secs(5));
        assert_eq!(h.in_progress_len().await, 1);

        store.fail_next(0);
        assert_eq!(broker.restore_unfinished().await.unwrap(), 1);
        assert_eq!(h.ready_len("default").await, 1);
    }
}
