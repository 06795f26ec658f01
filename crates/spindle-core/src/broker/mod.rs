//! Broker: every state transition of a task message.
//!
//! Containers (under the namespace prefix, see [`Keys`]):
//! - ready lists per queue, FIFO
//! - one in-progress list
//! - scheduled / retry / dead sorted sets scored by Unix seconds
//!
//! Each "remove from A, add to B" is a single guarded store transaction, so
//! a message is observed in exactly one container, and two brokers racing
//! over the same entry move it only once.

pub mod keys;
pub mod retry;
pub mod transition;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::domain::{TaskId, TaskMessage};
use crate::error::BrokerError;
use crate::ports::{Clock, Command, Guard, Store, SystemClock, Transaction};

pub use self::keys::Keys;
pub use self::retry::RetryPolicy;
pub use self::transition::{Disposition, Transition};

use self::transition::{score, to_chrono};

/// Cap on the dead set. Oldest entries go first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadRetention {
    pub max_tasks: usize,

    #[serde(rename = "max_age_ms", with = "crate::config::duration_ms")]
    pub max_age: Duration,
}

impl Default for DeadRetention {
    fn default() -> Self {
        Self {
            max_tasks: 10_000,
            max_age: Duration::from_secs(90 * 24 * 3600),
        }
    }
}

/// The two time-ordered containers whose due entries get forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SortedKind {
    Scheduled,
    Retry,
}

impl SortedKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortedKind::Scheduled => "scheduled",
            SortedKind::Retry => "retry",
        }
    }
}

#[derive(Clone)]
pub struct Broker {
    store: Arc<dyn Store>,
    keys: Keys,
    clock: Arc<dyn Clock>,
    retention: DeadRetention,
    unique_ttl: Duration,
}

impl Broker {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            keys: Keys::default(),
            clock: Arc::new(SystemClock),
            retention: DeadRetention::default(),
            unique_ttl: Duration::from_secs(24 * 3600),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.keys = Keys::new(namespace);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_retention(mut self, retention: DeadRetention) -> Self {
        self.retention = retention;
        self
    }

    /// Lifetime of a unique lock taken by [`Broker::enqueue`] and
    /// [`Broker::schedule`].
    pub fn with_unique_ttl(mut self, ttl: Duration) -> Self {
        self.unique_ttl = ttl;
        self
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Append to the tail of the message's ready queue.
    pub async fn enqueue(&self, msg: &TaskMessage) -> Result<TaskId, BrokerError> {
        self.enqueue_unique(msg, None, self.unique_ttl).await
    }

    /// Park the message in the scheduled set until `process_at`.
    pub async fn schedule(
        &self,
        msg: &TaskMessage,
        process_at: DateTime<Utc>,
    ) -> Result<TaskId, BrokerError> {
        self.enqueue_unique(msg, Some(process_at), self.unique_ttl).await
    }

    /// Enqueue (or schedule, when `process_at` is given) holding the
    /// message's unique lock for `ttl`. Messages without a unique key take
    /// no lock.
    pub async fn enqueue_unique(
        &self,
        msg: &TaskMessage,
        process_at: Option<DateTime<Utc>>,
        ttl: Duration,
    ) -> Result<TaskId, BrokerError> {
        let encoded = msg.encode()?;
        let guard = match &msg.unique_key {
            Some(key) => Guard::Lock {
                key: self.keys.unique(key),
                value: msg.id.to_string(),
                ttl,
            },
            None => Guard::Always,
        };

        let tx = match process_at {
            Some(at) => Transaction::new(guard).then(Command::AddScored {
                key: self.keys.scheduled(),
                score: score(at),
                member: encoded,
            }),
            None => self.push_ready(Transaction::new(guard), &msg.queue, encoded),
        };

        if !self.store.execute(tx).await? {
            let key = msg.unique_key.clone().unwrap_or_default();
            debug!(task_id = %msg.id, unique_key = %key, "duplicate task rejected");
            return Err(BrokerError::DuplicateTask(key));
        }

        match process_at {
            Some(at) => debug!(task_id = %msg.id, queue = %msg.queue, process_at = %at, "task scheduled"),
            None => debug!(task_id = %msg.id, queue = %msg.queue, "task enqueued"),
        }
        Ok(msg.id)
    }

    /// Move the head of the first non-empty queue into in-progress.
    ///
    /// Queues are tried in the given order. Never blocks; returns
    /// [`BrokerError::NoTaskAvailable`] when all of them are empty.
    pub async fn dequeue<S: AsRef<str>>(&self, queues: &[S]) -> Result<TaskMessage, BrokerError> {
        let in_progress = self.keys.in_progress();
        for queue in queues {
            let queue = queue.as_ref();
            let Some(raw) = self
                .store
                .pop_head_push_tail(&self.keys.queue(queue), &in_progress)
                .await?
            else {
                continue;
            };

            return match TaskMessage::decode(&raw) {
                Ok(msg) => {
                    debug!(task_id = %msg.id, queue = %queue, "task dequeued");
                    Ok(msg)
                }
                Err(e) => {
                    warn!(queue = %queue, error = %e, "corrupted record moved to dead");
                    let guard = Guard::RemoveFromList {
                        key: in_progress.clone(),
                        member: raw.clone(),
                    };
                    self.bury(guard, raw).await?;
                    Err(BrokerError::Codec(e))
                }
            };
        }
        Err(BrokerError::NoTaskAvailable)
    }

    /// Drop a finished message and release its unique lock.
    pub async fn done(&self, msg: &TaskMessage) -> Result<(), BrokerError> {
        let tx = Transaction::new(Guard::RemoveFromList {
            key: self.keys.in_progress(),
            member: msg.stored_form()?,
        })
        .then_maybe(self.release(msg));

        if !self.store.execute(tx).await? {
            return Err(BrokerError::TaskNotFound(msg.id));
        }
        debug!(task_id = %msg.id, "task done");
        Ok(())
    }

    /// Report a failed attempt. The message goes to the retry set `delay`
    /// from now, or to the dead set once its retry budget is spent.
    pub async fn retry(
        &self,
        msg: &TaskMessage,
        error: &str,
        delay: Duration,
    ) -> Result<Disposition, BrokerError> {
        let Transition { next, disposition } =
            transition::on_failure(msg, error, delay, self.now());
        let guard = Guard::RemoveFromList {
            key: self.keys.in_progress(),
            member: msg.stored_form()?,
        };

        match disposition {
            Disposition::Dead => {
                self.move_to_dead(guard, msg, &next).await?;
                warn!(task_id = %msg.id, retried = next.retried, error = %error, "retries exhausted, task is dead");
            }
            Disposition::Retry { at } => {
                let tx = Transaction::new(guard).then(Command::AddScored {
                    key: self.keys.retry(),
                    score: score(at),
                    member: next.encode()?,
                });
                if !self.store.execute(tx).await? {
                    return Err(BrokerError::TaskNotFound(msg.id));
                }
                info!(task_id = %msg.id, retried = next.retried, retry_at = %at, error = %error, "task scheduled for retry");
            }
        }
        Ok(disposition)
    }

    /// Dead-letter an in-progress message right away.
    pub async fn kill(&self, msg: &TaskMessage, error: &str) -> Result<(), BrokerError> {
        let Transition { next, .. } = transition::on_kill(msg, error);
        let guard = Guard::RemoveFromList {
            key: self.keys.in_progress(),
            member: msg.stored_form()?,
        };
        self.move_to_dead(guard, msg, &next).await?;
        warn!(task_id = %msg.id, error = %error, "task killed");
        Ok(())
    }

    /// Dead-letter a message that is waiting in the retry set.
    pub async fn kill_retry(&self, msg: &TaskMessage) -> Result<(), BrokerError> {
        let guard = Guard::RemoveFromSorted {
            key: self.keys.retry(),
            member: msg.stored_form()?,
        };
        self.move_to_dead(guard, msg, msg).await?;
        info!(task_id = %msg.id, "retry task killed");
        Ok(())
    }

    /// Move every entry of `kind` whose time has come to its ready queue.
    /// Returns how many this call moved; entries taken by a concurrent
    /// caller are not counted.
    pub async fn forward_due_tasks(&self, kind: SortedKind) -> Result<usize, BrokerError> {
        let key = match kind {
            SortedKind::Scheduled => self.keys.scheduled(),
            SortedKind::Retry => self.keys.retry(),
        };
        let due = self.store.range_by_score(&key, score(self.now())).await?;

        let mut moved = 0;
        for raw in due {
            let queue = match TaskMessage::decode(&raw) {
                Ok(msg) => msg.queue,
                Err(e) => {
                    warn!(set = kind.as_str(), error = %e, "skipping corrupted record");
                    continue;
                }
            };
            let tx = Transaction::new(Guard::RemoveFromSorted {
                key: key.clone(),
                member: raw.clone(),
            });
            if self.store.execute(self.push_ready(tx, &queue, raw)).await? {
                moved += 1;
            }
        }

        if moved > 0 {
            debug!(set = kind.as_str(), moved, "forwarded due tasks");
        }
        Ok(moved)
    }

    /// Push everything left in progress back onto its ready queue.
    ///
    /// Meant for processor start-up after a crash. Running it while another
    /// processor shares the namespace would re-deliver that processor's
    /// active tasks.
    pub async fn restore_unfinished(&self) -> Result<usize, BrokerError> {
        let in_progress = self.keys.in_progress();
        let mut restored = 0;
        for raw in self.store.list_members(&in_progress).await? {
            let queue = match TaskMessage::decode(&raw) {
                Ok(msg) => msg.queue,
                Err(e) => {
                    warn!(error = %e, "corrupted in-progress record moved to dead");
                    let guard = Guard::RemoveFromList {
                        key: in_progress.clone(),
                        member: raw.clone(),
                    };
                    self.bury(guard, raw).await?;
                    continue;
                }
            };
            let tx = Transaction::new(Guard::RemoveFromList {
                key: in_progress.clone(),
                member: raw.clone(),
            });
            if self.store.execute(self.push_ready(tx, &queue, raw)).await? {
                restored += 1;
            }
        }

        if restored > 0 {
            info!(restored, "restored unfinished tasks");
        }
        Ok(restored)
    }

    fn push_ready(&self, tx: Transaction, queue: &str, member: String) -> Transaction {
        tx.then(Command::PushTail {
            key: self.keys.queue(queue),
            member,
        })
        .then(Command::AddToSet {
            key: self.keys.all_queues(),
            member: queue.to_string(),
        })
    }

    fn release(&self, msg: &TaskMessage) -> Option<Command> {
        msg.unique_key.as_ref().map(|key| Command::DeleteIfEquals {
            key: self.keys.unique(key),
            value: msg.id.to_string(),
        })
    }

    async fn move_to_dead(
        &self,
        guard: Guard,
        msg: &TaskMessage,
        next: &TaskMessage,
    ) -> Result<(), BrokerError> {
        let tx = self.dead_tx(guard, next.encode()?).then_maybe(self.release(msg));
        if !self.store.execute(tx).await? {
            return Err(BrokerError::TaskNotFound(msg.id));
        }
        Ok(())
    }

    /// Dead-letter a record that could not be decoded.
    async fn bury(&self, guard: Guard, raw: String) -> Result<(), BrokerError> {
        self.store.execute(self.dead_tx(guard, raw)).await?;
        Ok(())
    }

    fn dead_tx(&self, guard: Guard, member: String) -> Transaction {
        let now = self.now();
        let key = self.keys.dead();
        Transaction::new(guard)
            .then(Command::AddScored {
                key: key.clone(),
                score: score(now),
                member,
            })
            .then(Command::TrimScored {
                key,
                min_score: score(now - to_chrono(self.retention.max_age)),
                max_len: self.retention.max_tasks,
            })
    }
}
