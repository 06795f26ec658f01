//! Shared test helpers.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tokio::time::Instant;

use crate::broker::Broker;
use crate::domain::TaskMessage;
use crate::impls::InMemoryStore;
use crate::ports::{ManualClock, Store};

/// Poll `check` until it holds, failing the test after five seconds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if check().await {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for: {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub struct Harness {
    pub broker: Broker,
    pub store: Arc<InMemoryStore>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new() -> Self {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let store = Arc::new(InMemoryStore::with_clock(clock.clone()));
        let broker = Broker::new(store.clone()).with_clock(clock.clone());
        Self {
            broker,
            store,
            clock,
        }
    }

    pub async fn sorted(&self, key: &str) -> Vec<TaskMessage> {
        self.store
            .sorted_members(key)
            .await
            .unwrap()
            .iter()
            .map(|raw| TaskMessage::decode(raw).unwrap())
            .collect()
    }

    pub async fn retry_set(&self) -> Vec<TaskMessage> {
        self.sorted(&self.broker.keys().retry()).await
    }

    pub async fn dead_set(&self) -> Vec<TaskMessage> {
        self.sorted(&self.broker.keys().dead()).await
    }

    pub async fn ready_len(&self, queue: &str) -> usize {
        self.store
            .list_len(&self.broker.keys().queue(queue))
            .await
            .unwrap()
    }

    pub async fn in_progress_len(&self) -> usize {
        self.store
            .list_len(&self.broker.keys().in_progress())
            .await
            .unwrap()
    }
}
