//! Runtime configuration.
//!
//! Every section has sensible defaults and `with_*` builders. The whole tree
//! can also be loaded from JSON; durations are written in milliseconds
//! (`*_ms` keys) and missing fields fall back to their defaults.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::broker::{DeadRetention, RetryPolicy};
use crate::client::DEFAULT_QUEUE;

/// Serde adapter storing a `Duration` as whole milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let ms = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(ms)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Where the store lives and how keys are laid out in it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub redis_url: String,

    /// Prefix of every key the broker touches.
    pub namespace: String,

    #[serde(rename = "unique_ttl_ms", with = "duration_ms")]
    pub unique_ttl: Duration,

    pub dead_retention: DeadRetention,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            namespace: "spindle".to_string(),
            unique_ttl: Duration::from_secs(24 * 3600),
            dead_retention: DeadRetention::default(),
        }
    }
}

impl StoreConfig {
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_unique_ttl(mut self, ttl: Duration) -> Self {
        self.unique_ttl = ttl;
        self
    }

    pub fn with_dead_retention(mut self, retention: DeadRetention) -> Self {
        self.dead_retention = retention;
        self
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Number of worker tasks.
    pub concurrency: usize,

    /// Queues polled by every worker, highest priority first.
    pub queues: Vec<String>,

    /// How long shutdown waits for in-flight handlers before canceling them.
    #[serde(rename = "shutdown_grace_ms", with = "duration_ms")]
    pub shutdown_grace: Duration,

    /// First sleep after an empty poll.
    #[serde(rename = "min_idle_interval_ms", with = "duration_ms")]
    pub min_idle_interval: Duration,

    /// Idle sleeps double up to this.
    #[serde(rename = "max_idle_interval_ms", with = "duration_ms")]
    pub max_idle_interval: Duration,

    /// Move leftover in-progress tasks back to their queues on start.
    ///
    /// Off by default. Enable it on one processor per namespace only: a
    /// processor starting with it re-queues every task the others are
    /// running at that moment.
    pub restore_on_start: bool,

    pub retry: RetryPolicy,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            queues: vec![DEFAULT_QUEUE.to_string()],
            shutdown_grace: Duration::from_secs(8),
            min_idle_interval: Duration::from_millis(100),
            max_idle_interval: Duration::from_secs(1),
            restore_on_start: false,
            retry: RetryPolicy::default(),
        }
    }
}

impl ProcessorConfig {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency,
            ..Default::default()
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_queues<I, S>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queues = queues.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_idle_interval(mut self, min: Duration, max: Duration) -> Self {
        self.min_idle_interval = min;
        self.max_idle_interval = max.max(min);
        self
    }

    pub fn with_restore_on_start(mut self, restore: bool) -> Self {
        self.restore_on_start = restore;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    #[serde(rename = "interval_ms", with = "duration_ms")]
    pub interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
        }
    }
}

impl SchedulerConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpindleConfig {
    pub store: StoreConfig,
    pub processor: ProcessorConfig,
    pub scheduler: SchedulerConfig,
}

impl SpindleConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&raw)
    }
}
