//! Pure transition rules for failed attempts.
//!
//! Given a message and what happened to it, compute the message to store
//! next and the container it goes to. No I/O here; the broker applies the
//! result in one store transaction.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::domain::TaskMessage;

/// Where a failed message ends up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Back-off in the retry set until `at`.
    Retry { at: DateTime<Utc> },
    /// Dead-lettered.
    Dead,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub next: TaskMessage,
    pub disposition: Disposition,
}

/// A failed attempt: retry with `retried + 1` unless the budget is spent.
pub fn on_failure(
    msg: &TaskMessage,
    error: &str,
    delay: Duration,
    now: DateTime<Utc>,
) -> Transition {
    if msg.is_exhausted() {
        return on_kill(msg, error);
    }

    let mut next = msg.clone();
    next.retried = msg.retried.saturating_add(1);
    next.error_msg = Some(error.to_string());

    Transition {
        next,
        disposition: Disposition::Retry {
            at: now + to_chrono(delay),
        },
    }
}

/// Dead-letter with the counter left as it is.
pub fn on_kill(msg: &TaskMessage, error: &str) -> Transition {
    let mut next = msg.clone();
    next.error_msg = Some(error.to_string());
    Transition {
        next,
        disposition: Disposition::Dead,
    }
}

/// Sorted-set score for an instant: Unix seconds.
pub fn score(at: DateTime<Utc>) -> i64 {
    at.timestamp()
}

pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}
