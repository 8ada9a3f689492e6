//! In-process [`KeyStore`] for tests and single-node deployments.
//!
//! One lock guards the whole keyspace, so every method, the scripted
//! dual-index operations included, is indivisible. Expiry is evaluated
//! lazily against [`tokio::time::Instant`], which lets paused-clock tests
//! drive TTLs.

use super::{KeyStore, SessionIndex, SessionMap, StoreResult};
use crate::error::StoreError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn persistent(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn remaining(&self, now: Instant) -> Option<Duration> {
        self.expires_at.map(|at| at.saturating_duration_since(now))
    }
}

#[derive(Debug, Default)]
struct Keys {
    entries: HashMap<String, Entry>,
}

impl Keys {
    /// Live entry at `key`; expired entries are dropped on the way.
    fn live(&mut self, key: &str, now: Instant) -> Option<&mut Entry> {
        if self.entries.get(key).is_some_and(|e| e.is_expired(now)) {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn string(&mut self, key: &str, now: Instant) -> StoreResult<Option<&String>> {
        match self.live(key, now) {
            None => Ok(None),
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn hash_mut(
        &mut self,
        key: &str,
        now: Instant,
    ) -> StoreResult<Option<&mut HashMap<String, String>>> {
        match self.live(key, now) {
            None => Ok(None),
            Some(Entry {
                value: Value::Hash(h),
                ..
            }) => Ok(Some(h)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn set_mut(&mut self, key: &str, now: Instant) -> StoreResult<Option<&mut HashSet<String>>> {
        match self.live(key, now) {
            None => Ok(None),
            Some(Entry {
                value: Value::Set(s),
                ..
            }) => Ok(Some(s)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    /// Extend the TTL of `key` to at least `ttl`; never shortens it.
    fn extend_to(&mut self, key: &str, ttl: Duration, now: Instant) {
        if let Some(entry) = self.live(key, now) {
            if entry.remaining(now).map_or(true, |left| left < ttl) {
                entry.expires_at = Some(now + ttl);
            }
        }
    }

    /// Remove a hash field, dropping the hash when it empties.
    fn hdel(&mut self, key: &str, field: &str, now: Instant) -> StoreResult<bool> {
        let Some(hash) = self.hash_mut(key, now)? else {
            return Ok(false);
        };
        let removed = hash.remove(field).is_some();
        if hash.is_empty() {
            self.entries.remove(key);
        }
        Ok(removed)
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Internal(format!("wrong value type at key {key}"))
}

/// In-memory key-value store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    keys: Mutex<Keys>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.keys
            .lock()
            .entries
            .values()
            .filter(|e| !e.is_expired(now))
            .count()
    }

    /// Whether the store holds no live keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining TTL of a key, `None` if absent or persistent.
    #[must_use]
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let mut keys = self.keys.lock();
        keys.live(key, now).and_then(|e| e.remaining(now))
    }
}

#[async_trait]
impl KeyStore for MemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let now = Instant::now();
        Ok(self.keys.lock().string(key, now)?.cloned())
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let now = Instant::now();
        self.keys.lock().entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let now = Instant::now();
        match self.keys.lock().live(key, now) {
            Some(entry) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let now = Instant::now();
        let mut keys = self.keys.lock();
        let existed = keys.live(key, now).is_some();
        keys.entries.remove(key);
        Ok(existed)
    }

    async fn mget(&self, keys: &[String]) -> StoreResult<Vec<Option<String>>> {
        let now = Instant::now();
        let mut guard = self.keys.lock();
        keys.iter()
            .map(|key| guard.string(key, now).map(|v| v.cloned()))
            .collect()
    }

    async fn incr(&self, key: &str) -> StoreResult<u64> {
        let now = Instant::now();
        let mut keys = self.keys.lock();
        let current = match keys.string(key, now)? {
            Some(raw) => raw
                .parse::<u64>()
                .map_err(|_| StoreError::Internal(format!("value at {key} is not an integer")))?,
            None => 0,
        };
        let next = current
            .checked_add(1)
            .ok_or_else(|| StoreError::Internal(format!("increment at {key} would overflow")))?;
        match keys.live(key, now) {
            Some(entry) => entry.value = Value::Str(next.to_string()),
            None => {
                keys.entries
                    .insert(key.to_string(), Entry::persistent(Value::Str(next.to_string())));
            }
        }
        Ok(next)
    }

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool> {
        let now = Instant::now();
        let mut keys = self.keys.lock();
        if let Some(set) = keys.set_mut(key, now)? {
            return Ok(set.insert(member.to_string()));
        }
        let set = HashSet::from([member.to_string()]);
        keys.entries
            .insert(key.to_string(), Entry::persistent(Value::Set(set)));
        Ok(true)
    }

    async fn srem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let now = Instant::now();
        let mut keys = self.keys.lock();
        let Some(set) = keys.set_mut(key, now)? else {
            return Ok(false);
        };
        let removed = set.remove(member);
        if set.is_empty() {
            keys.entries.remove(key);
        }
        Ok(removed)
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        let now = Instant::now();
        let mut keys = self.keys.lock();
        Ok(keys
            .set_mut(key, now)?
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn sismember(&self, key: &str, member: &str) -> StoreResult<bool> {
        let now = Instant::now();
        let mut keys = self.keys.lock();
        Ok(keys
            .set_mut(key, now)?
            .is_some_and(|set| set.contains(member)))
    }

    async fn bind_session(
        &self,
        index: &SessionIndex,
        node: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let now = Instant::now();
        let mut keys = self.keys.lock();

        if keys.live(&index.session_key, now).is_some() {
            return Ok(false);
        }
        // Type check before any write so a failure leaves nothing behind.
        let has_hash = keys.hash_mut(&index.user_key, now)?.is_some();

        keys.entries.insert(
            index.session_key.clone(),
            Entry {
                value: Value::Str(node.to_string()),
                expires_at: Some(now + ttl),
            },
        );
        if has_hash {
            if let Some(hash) = keys.hash_mut(&index.user_key, now)? {
                hash.insert(index.session_id.clone(), node.to_string());
            }
            keys.extend_to(&index.user_key, ttl, now);
        } else {
            let hash = HashMap::from([(index.session_id.clone(), node.to_string())]);
            keys.entries.insert(
                index.user_key.clone(),
                Entry {
                    value: Value::Hash(hash),
                    expires_at: Some(now + ttl),
                },
            );
        }
        Ok(true)
    }

    async fn renew_session(&self, index: &SessionIndex, ttl: Duration) -> StoreResult<bool> {
        let now = Instant::now();
        let mut keys = self.keys.lock();

        let Some(node) = keys.string(&index.session_key, now)?.cloned() else {
            keys.hdel(&index.user_key, &index.session_id, now)?;
            return Ok(false);
        };
        let listed = keys
            .hash_mut(&index.user_key, now)?
            .is_some_and(|hash| hash.get(&index.session_id) == Some(&node));
        if !listed {
            return Ok(false);
        }

        if let Some(entry) = keys.live(&index.session_key, now) {
            entry.expires_at = Some(now + ttl);
        }
        keys.extend_to(&index.user_key, ttl, now);
        Ok(true)
    }

    async fn unbind_session(&self, index: &SessionIndex) -> StoreResult<bool> {
        let now = Instant::now();
        let mut keys = self.keys.lock();

        if !keys.hdel(&index.user_key, &index.session_id, now)? {
            return Ok(false);
        }
        keys.entries.remove(&index.session_key);
        Ok(true)
    }

    async fn live_sessions(
        &self,
        user_keys: &[String],
        session_prefix: &str,
    ) -> StoreResult<Vec<SessionMap>> {
        let now = Instant::now();
        let mut keys = self.keys.lock();
        let mut out = Vec::with_capacity(user_keys.len());

        for user_key in user_keys {
            let fields: Vec<(String, String)> = match keys.hash_mut(user_key, now)? {
                Some(hash) => hash.iter().map(|(s, n)| (s.clone(), n.clone())).collect(),
                None => {
                    out.push(SessionMap::new());
                    continue;
                }
            };

            let mut live = SessionMap::with_capacity(fields.len());
            for (session_id, node) in fields {
                let session_key = format!("{session_prefix}{session_id}");
                if keys.string(&session_key, now)? == Some(&node) {
                    live.insert(session_id, node);
                } else {
                    keys.hdel(user_key, &session_id, now)?;
                }
            }
            out.push(live);
        }
        Ok(out)
    }
}
