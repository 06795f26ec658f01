//! Scheduler: periodically forwards due scheduled/retry entries to their
//! ready queues.
//!
//! Several schedulers may run against one store. The broker moves each entry
//! in its own guarded transaction, so an entry is forwarded once no matter
//! how many of them race for it.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::broker::{Broker, SortedKind};
use crate::config::SchedulerConfig;
use crate::error::BrokerError;

pub struct Scheduler {
    broker: Broker,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(broker: Broker, config: SchedulerConfig) -> Self {
        Self { broker, config }
    }

    /// One pass over both sets. Returns how many entries were forwarded.
    pub async fn tick(&self) -> Result<usize, BrokerError> {
        let scheduled = self.broker.forward_due_tasks(SortedKind::Scheduled).await?;
        let retry = self.broker.forward_due_tasks(SortedKind::Retry).await?;
        Ok(scheduled + retry)
    }

    /// Run [`Scheduler::tick`] every `interval` until shut down.
    pub fn spawn(self) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let period = self.config.interval.max(Duration::from_millis(1));

        let join = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval = ?period, "scheduler started");

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match self.tick().await {
                            Ok(0) => {}
                            Ok(forwarded) => debug!(forwarded, "forwarded due tasks"),
                            Err(e) => warn!(error = %e, "scheduler tick failed"),
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("scheduler stopped");
        });

        SchedulerHandle { shutdown_tx, join }
    }
}

pub struct SchedulerHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Stop the loop. A tick already running finishes first.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        let _ = self.join.await;
    }
}
