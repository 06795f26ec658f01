//! In-memory store implementation.
//!
//! Every call runs under one mutex, which makes each `execute` trivially
//! atomic. Empty containers are removed like Redis removes empty keys.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::ports::{Clock, Command, Guard, Store, StoreError, SystemClock, Transaction};

/// Sorted set ordered by (score, member), like a Redis zset.
#[derive(Debug, Default)]
struct SortedSet {
    scores: HashMap<String, i64>,
    ordered: BTreeSet<(i64, String)>,
}

impl SortedSet {
    fn insert(&mut self, score: i64, member: String) {
        if let Some(old) = self.scores.insert(member.clone(), score) {
            self.ordered.remove(&(old, member.clone()));
        }
        self.ordered.insert((score, member));
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                self.ordered.remove(&(score, member.to_string()));
                true
            }
            None => false,
        }
    }

    fn range_to(&self, max_score: i64) -> Vec<String> {
        self.ordered
            .iter()
            .take_while(|(score, _)| *score <= max_score)
            .map(|(_, member)| member.clone())
            .collect()
    }

    fn members(&self) -> Vec<String> {
        self.ordered.iter().map(|(_, member)| member.clone()).collect()
    }

    fn trim(&mut self, min_score: i64, max_len: usize) {
        let expired: Vec<String> = self.range_to(min_score.saturating_sub(1));
        for member in expired {
            self.remove(&member);
        }
        while self.ordered.len() > max_len {
            let Some((_, oldest)) = self.ordered.pop_first() else {
                break;
            };
            self.scores.remove(&oldest);
        }
    }

    fn len(&self) -> usize {
        self.ordered.len()
    }
}

#[derive(Debug)]
enum Entry {
    List(VecDeque<String>),
    Sorted(SortedSet),
    Set(BTreeSet<String>),
    Lock {
        value: String,
        expires_at: DateTime<Utc>,
    },
}

impl Entry {
    fn is_empty(&self) -> bool {
        match self {
            Entry::List(list) => list.is_empty(),
            Entry::Sorted(set) => set.len() == 0,
            Entry::Set(set) => set.is_empty(),
            Entry::Lock { .. } => false,
        }
    }
}

struct InMemoryStoreState {
    entries: HashMap<String, Entry>,
}

impl InMemoryStoreState {
    fn purge_expired(&mut self, now: DateTime<Utc>) {
        self.entries
            .retain(|_, entry| !matches!(entry, Entry::Lock { expires_at, .. } if *expires_at <= now));
    }

    fn drop_if_empty(&mut self, key: &str) {
        if self.entries.get(key).is_some_and(Entry::is_empty) {
            self.entries.remove(key);
        }
    }

    fn list(&self, key: &str) -> Result<Option<&VecDeque<String>>, StoreError> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(Entry::List(list)) => Ok(Some(list)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn list_mut(&mut self, key: &str) -> Result<&mut VecDeque<String>, StoreError> {
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::List(VecDeque::new()));
        match entry {
            Entry::List(list) => Ok(list),
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn sorted(&self, key: &str) -> Result<Option<&SortedSet>, StoreError> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(Entry::Sorted(set)) => Ok(Some(set)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn sorted_mut(&mut self, key: &str) -> Result<&mut SortedSet, StoreError> {
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::Sorted(SortedSet::default()));
        match entry {
            Entry::Sorted(set) => Ok(set),
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    /// Type-check every key the transaction touches so a failure can never
    /// happen halfway through applying it.
    fn check_kinds(&self, tx: &Transaction) -> Result<(), StoreError> {
        let expect = |key: &str, ok: fn(&Entry) -> bool| match self.entries.get(key) {
            Some(entry) if !ok(entry) => Err(StoreError::WrongType(key.to_string())),
            _ => Ok(()),
        };
        let is_list: fn(&Entry) -> bool = |e| matches!(e, Entry::List(_));
        let is_sorted: fn(&Entry) -> bool = |e| matches!(e, Entry::Sorted(_));
        let is_set: fn(&Entry) -> bool = |e| matches!(e, Entry::Set(_));
        let is_lock: fn(&Entry) -> bool = |e| matches!(e, Entry::Lock { .. });

        match &tx.guard {
            Guard::Always => {}
            Guard::RemoveFromList { key, .. } => expect(key, is_list)?,
            Guard::RemoveFromSorted { key, .. } => expect(key, is_sorted)?,
            Guard::Lock { key, .. } => expect(key, is_lock)?,
        }
        for command in &tx.commands {
            match command {
                Command::PushTail { key, .. } => expect(key, is_list)?,
                Command::AddScored { key, .. } | Command::TrimScored { key, .. } => {
                    expect(key, is_sorted)?
                }
                Command::AddToSet { key, .. } => expect(key, is_set)?,
                Command::DeleteIfEquals { key, .. } => expect(key, is_lock)?,
            }
        }
        Ok(())
    }

    fn check_guard(&mut self, guard: &Guard, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let held = match guard {
            Guard::Always => true,
            Guard::RemoveFromList { key, member } => {
                let removed = match self.entries.get_mut(key) {
                    Some(Entry::List(list)) => match list.iter().position(|m| m == member) {
                        Some(index) => list.remove(index).is_some(),
                        None => false,
                    },
                    _ => false,
                };
                self.drop_if_empty(key);
                removed
            }
            Guard::RemoveFromSorted { key, member } => {
                let removed = match self.entries.get_mut(key) {
                    Some(Entry::Sorted(set)) => set.remove(member),
                    _ => false,
                };
                self.drop_if_empty(key);
                removed
            }
            Guard::Lock { key, value, ttl } => {
                if self.entries.contains_key(key) {
                    false
                } else {
                    let ttl = chrono::Duration::from_std(*ttl)
                        .unwrap_or_else(|_| chrono::Duration::days(36_500));
                    self.entries.insert(
                        key.clone(),
                        Entry::Lock {
                            value: value.clone(),
                            expires_at: now + ttl,
                        },
                    );
                    true
                }
            }
        };
        Ok(held)
    }

    fn apply(&mut self, command: Command) -> Result<(), StoreError> {
        match command {
            Command::PushTail { key, member } => self.list_mut(&key)?.push_back(member),
            Command::AddScored { key, score, member } => {
                self.sorted_mut(&key)?.insert(score, member)
            }
            Command::AddToSet { key, member } => {
                let entry = self
                    .entries
                    .entry(key.clone())
                    .or_insert_with(|| Entry::Set(BTreeSet::new()));
                match entry {
                    Entry::Set(set) => {
                        set.insert(member);
                    }
                    _ => return Err(StoreError::WrongType(key)),
                }
            }
            Command::TrimScored {
                key,
                min_score,
                max_len,
            } => {
                if let Some(Entry::Sorted(set)) = self.entries.get_mut(&key) {
                    set.trim(min_score, max_len);
                }
                self.drop_if_empty(&key);
            }
            Command::DeleteIfEquals { key, value } => {
                let owned = matches!(
                    self.entries.get(&key),
                    Some(Entry::Lock { value: held, .. }) if *held == value
                );
                if owned {
                    self.entries.remove(&key);
                }
            }
        }
        Ok(())
    }
}

/// In-memory [`Store`]. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct InMemoryStore {
    state: Arc<Mutex<InMemoryStoreState>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Lock expiry is judged against `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(InMemoryStoreState {
                entries: HashMap::new(),
            })),
            clock,
        }
    }

    /// Remove everything.
    pub async fn flush(&self) {
        self.state.lock().await.entries.clear();
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn execute(&self, tx: Transaction) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.purge_expired(now);
        state.check_kinds(&tx)?;

        if !state.check_guard(&tx.guard, now)? {
            return Ok(false);
        }
        for command in tx.commands {
            state.apply(command)?;
        }
        Ok(true)
    }

    async fn pop_head_push_tail(
        &self,
        src: &str,
        dst: &str,
    ) -> Result<Option<String>, StoreError> {
        let mut state = self.state.lock().await;
        if state.list(src)?.is_none_or(VecDeque::is_empty) {
            return Ok(None);
        }
        if let Some(entry) = state.entries.get(dst) {
            if !matches!(entry, Entry::List(_)) {
                return Err(StoreError::WrongType(dst.to_string()));
            }
        }

        let member = state.list_mut(src)?.pop_front();
        state.drop_if_empty(src);
        if let Some(member) = &member {
            state.list_mut(dst)?.push_back(member.clone());
        }
        Ok(member)
    }

    async fn range_by_score(&self, key: &str, max_score: i64) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .sorted(key)?
            .map(|set| set.range_to(max_score))
            .unwrap_or_default())
    }

    async fn list_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .list(key)?
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn sorted_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.sorted(key)?.map(SortedSet::members).unwrap_or_default())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().await;
        match state.entries.get(key) {
            None => Ok(Vec::new()),
            Some(Entry::Set(set)) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn list_len(&self, key: &str) -> Result<usize, StoreError> {
        let state = self.state.lock().await;
        Ok(state.list(key)?.map_or(0, VecDeque::len))
    }

    async fn sorted_len(&self, key: &str) -> Result<usize, StoreError> {
        let state = self.state.lock().await;
        Ok(state.sorted(key)?.map_or(0, SortedSet::len))
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.purge_expired(now);
        Ok(state.entries.contains_key(key))
    }
}
