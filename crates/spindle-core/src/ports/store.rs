//! Store port: the persistent key/value + sorted-set engine behind the broker.
//!
//! The store knows nothing about tasks. It offers lists (appended at the
//! tail, popped at the head), sorted sets scored by Unix seconds, plain sets,
//! expiring lock keys, and one compound primitive: a guarded [`Transaction`].
//! Every broker state transition is exactly one `execute` call, so a crash
//! can never leave a message in two containers or in none.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store connection failed: {0}")]
    Connection(String),

    #[error("store command failed: {0}")]
    Command(String),

    #[error("key {0} holds a value of the wrong kind")]
    WrongType(String),
}

/// Precondition of a transaction. When it does not hold, nothing is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Guard {
    /// Unconditional.
    Always,

    /// Remove one occurrence of `member` from the list at `key`.
    RemoveFromList { key: String, member: String },

    /// Remove `member` from the sorted set at `key`.
    RemoveFromSorted { key: String, member: String },

    /// Create `key` holding `value`, expiring after `ttl`, if it does not exist.
    Lock {
        key: String,
        value: String,
        ttl: Duration,
    },
}

/// A mutation applied once the guard holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Append to the tail of a list.
    PushTail { key: String, member: String },

    /// Insert into (or rescore inside) a sorted set.
    AddScored {
        key: String,
        score: i64,
        member: String,
    },

    /// Insert into a plain set.
    AddToSet { key: String, member: String },

    /// Drop entries scored below `min_score`, then keep only the `max_len`
    /// highest scored ones.
    TrimScored {
        key: String,
        min_score: i64,
        max_len: usize,
    },

    /// Delete `key` only while it still holds `value`.
    DeleteIfEquals { key: String, value: String },
}

/// Guard plus commands, applied atomically as one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub guard: Guard,
    pub commands: Vec<Command>,
}

impl Transaction {
    pub fn new(guard: Guard) -> Self {
        Self {
            guard,
            commands: Vec::new(),
        }
    }

    pub fn then(mut self, command: Command) -> Self {
        self.commands.push(command);
        self
    }

    pub fn then_maybe(self, command: Option<Command>) -> Self {
        match command {
            Some(command) => self.then(command),
            None => self,
        }
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Apply a transaction. Returns `false` (and changes nothing) when the
    /// guard did not hold.
    async fn execute(&self, tx: Transaction) -> Result<bool, StoreError>;

    /// Atomically pop the head of `src` and append it to the tail of `dst`.
    async fn pop_head_push_tail(&self, src: &str, dst: &str)
    -> Result<Option<String>, StoreError>;

    /// Members of a sorted set with `score <= max_score`, lowest score first.
    async fn range_by_score(&self, key: &str, max_score: i64) -> Result<Vec<String>, StoreError>;

    /// All list members, head first.
    async fn list_members(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// All sorted-set members, lowest score first.
    async fn sorted_members(&self, key: &str) -> Result<Vec<String>, StoreError>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;

    async fn list_len(&self, key: &str) -> Result<usize, StoreError>;

    async fn sorted_len(&self, key: &str) -> Result<usize, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;
}
