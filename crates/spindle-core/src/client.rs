//! Producer API.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::broker::{transition::to_chrono, Broker};
use crate::domain::{Task, TaskId, TaskMessage};
use crate::error::BrokerError;
use crate::ports::{IdGenerator, SystemClock, UlidGenerator};
use crate::typed;

pub const DEFAULT_QUEUE: &str = "default";
pub const DEFAULT_MAX_RETRY: u32 = 25;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
enum ProcessAt {
    Now,
    At(DateTime<Utc>),
    In(Duration),
}

/// Per-task enqueue options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueOptions {
    queue: String,
    max_retry: u32,
    timeout: Duration,
    process_at: ProcessAt,
    unique: Option<(String, Duration)>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            max_retry: DEFAULT_MAX_RETRY,
            timeout: DEFAULT_TIMEOUT,
            process_at: ProcessAt::Now,
            unique: None,
        }
    }
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    /// Per-attempt limit. Zero disables it.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn process_at(mut self, at: DateTime<Utc>) -> Self {
        self.process_at = ProcessAt::At(at);
        self
    }

    pub fn process_in(mut self, delay: Duration) -> Self {
        self.process_at = ProcessAt::In(delay);
        self
    }

    /// Reject the enqueue while another live task holds `key`. The lock
    /// expires after `ttl` even if the task is still around.
    pub fn unique(mut self, key: impl Into<String>, ttl: Duration) -> Self {
        self.unique = Some((key.into(), ttl));
        self
    }
}

/// Enqueues tasks through a [`Broker`].
#[derive(Clone)]
pub struct Client {
    broker: Broker,
    ids: Arc<dyn IdGenerator>,
}

impl Client {
    pub fn new(broker: Broker) -> Self {
        Self {
            broker,
            ids: Arc::new(UlidGenerator::new(SystemClock)),
        }
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    /// Enqueue `task`, or schedule it when the options ask for a future
    /// start time.
    pub async fn enqueue(&self, task: Task, opts: EnqueueOptions) -> Result<TaskId, BrokerError> {
        let mut msg = TaskMessage::new(self.ids.generate_task_id(), task, opts.queue)
            .with_max_retry(opts.max_retry)
            .with_timeout(opts.timeout);

        let now = self.broker.now();
        let process_at = match opts.process_at {
            ProcessAt::Now => None,
            ProcessAt::At(at) => Some(at),
            ProcessAt::In(delay) => Some(now + to_chrono(delay)),
        }
        .filter(|at| *at > now);

        match opts.unique {
            Some((key, ttl)) => {
                msg.unique_key = Some(key);
                self.broker.enqueue_unique(&msg, process_at, ttl).await
            }
            None => match process_at {
                Some(at) => self.broker.schedule(&msg, at).await,
                None => self.broker.enqueue(&msg).await,
            },
        }
    }

    /// Enqueue a typed payload under `T::TYPE`.
    pub async fn enqueue_typed<T: typed::Task>(
        &self,
        payload: &T,
        opts: EnqueueOptions,
    ) -> Result<TaskId, BrokerError> {
        self.enqueue(payload.to_task()?, opts).await
    }
}
