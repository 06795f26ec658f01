//! Inspector: read-only views over the broker's containers.
//!
//! Every call reads the store afresh; nothing is cached.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::broker::{Broker, Keys};
use crate::client::DEFAULT_QUEUE;
use crate::domain::{Task, TaskMessage};
use crate::error::BrokerError;
use crate::ports::{Clock, Store, SystemClock};

/// Container sizes at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stats {
    /// Ready tasks summed over every known queue.
    pub queued: usize,
    pub in_progress: usize,
    pub scheduled: usize,
    pub retry: usize,
    pub dead: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerKind {
    Enqueued,
    InProgress,
    Scheduled,
    Retry,
    Dead,
}

impl ContainerKind {
    pub const ALL: [ContainerKind; 5] = [
        ContainerKind::Enqueued,
        ContainerKind::InProgress,
        ContainerKind::Scheduled,
        ContainerKind::Retry,
        ContainerKind::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerKind::Enqueued => "enqueued",
            ContainerKind::InProgress => "in_progress",
            ContainerKind::Scheduled => "scheduled",
            ContainerKind::Retry => "retry",
            ContainerKind::Dead => "dead",
        }
    }
}

impl fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown container {0:?}; expected one of enqueued, in_progress, scheduled, retry, dead")]
pub struct UnknownContainer(String);

impl FromStr for ContainerKind {
    type Err = UnknownContainer;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enqueued" | "queued" | "ready" => Ok(ContainerKind::Enqueued),
            "in_progress" | "in-progress" | "active" => Ok(ContainerKind::InProgress),
            "scheduled" => Ok(ContainerKind::Scheduled),
            "retry" => Ok(ContainerKind::Retry),
            "dead" => Ok(ContainerKind::Dead),
            other => Err(UnknownContainer(other.to_string())),
        }
    }
}

pub struct Inspector {
    store: Arc<dyn Store>,
    keys: Keys,
    clock: Arc<dyn Clock>,
}

impl Inspector {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            keys: Keys::default(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Inspect the same store and namespace a broker writes to.
    pub fn for_broker(broker: &Broker) -> Self {
        Self::new(Arc::clone(broker.store())).with_namespace(broker.keys().namespace())
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.keys = Keys::new(namespace);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Every queue that has received a task, plus the default queue.
    pub async fn queue_names(&self) -> Result<Vec<String>, BrokerError> {
        let mut names: BTreeSet<String> = self
            .store
            .set_members(&self.keys.all_queues())
            .await?
            .into_iter()
            .collect();
        names.insert(DEFAULT_QUEUE.to_string());
        Ok(names.into_iter().collect())
    }

    pub async fn current_stats(&self) -> Result<Stats, BrokerError> {
        let mut queued = 0;
        for queue in self.queue_names().await? {
            queued += self.store.list_len(&self.keys.queue(&queue)).await?;
        }

        Ok(Stats {
            queued,
            in_progress: self.store.list_len(&self.keys.in_progress()).await?,
            scheduled: self.store.sorted_len(&self.keys.scheduled()).await?,
            retry: self.store.sorted_len(&self.keys.retry()).await?,
            dead: self.store.sorted_len(&self.keys.dead()).await?,
            timestamp: self.clock.now(),
        })
    }

    /// Full messages held by one container. Records that fail to decode are
    /// skipped.
    pub async fn list_messages(&self, kind: ContainerKind) -> Result<Vec<TaskMessage>, BrokerError> {
        let raw = match kind {
            ContainerKind::Enqueued => {
                let mut all = Vec::new();
                for queue in self.queue_names().await? {
                    all.extend(self.store.list_members(&self.keys.queue(&queue)).await?);
                }
                all
            }
            ContainerKind::InProgress => self.store.list_members(&self.keys.in_progress()).await?,
            ContainerKind::Scheduled => self.store.sorted_members(&self.keys.scheduled()).await?,
            ContainerKind::Retry => self.store.sorted_members(&self.keys.retry()).await?,
            ContainerKind::Dead => self.store.sorted_members(&self.keys.dead()).await?,
        };

        Ok(raw
            .iter()
            .filter_map(|r| match TaskMessage::decode(r) {
                Ok(msg) => Some(msg),
                Err(e) => {
                    warn!(container = %kind, error = %e, "skipping undecodable record");
                    None
                }
            })
            .collect())
    }

    pub async fn list_tasks(&self, kind: ContainerKind) -> Result<Vec<Task>, BrokerError> {
        Ok(self
            .list_messages(kind)
            .await?
            .iter()
            .map(TaskMessage::task)
            .collect())
    }

    pub async fn list_enqueued_tasks(&self) -> Result<Vec<Task>, BrokerError> {
        self.list_tasks(ContainerKind::Enqueued).await
    }

    pub async fn list_in_progress_tasks(&self) -> Result<Vec<Task>, BrokerError> {
        self.list_tasks(ContainerKind::InProgress).await
    }

    pub async fn list_scheduled_tasks(&self) -> Result<Vec<Task>, BrokerError> {
        self.list_tasks(ContainerKind::Scheduled).await
    }

    pub async fn list_retry_tasks(&self) -> Result<Vec<Task>, BrokerError> {
        self.list_tasks(ContainerKind::Retry).await
    }

    pub async fn list_dead_tasks(&self) -> Result<Vec<Task>, BrokerError> {
        self.list_tasks(ContainerKind::Dead).await
    }
}
