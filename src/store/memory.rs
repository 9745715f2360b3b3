//! In-process key-value store.
//!
//! One async mutex guards the whole map, so every trait method (including the
//! compound sliding-window and token-bucket steps) runs as a single atomic
//! unit. Expired keys are purged lazily when touched.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::{KeyValueStore, SlidingWindowOutcome, TokenBucketOutcome};
use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Set(HashSet<String>),
    /// (score, member), kept sorted by score
    Sorted(Vec<(i64, String)>),
    Bucket { tokens: f64, updated_ms: i64 },
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at_ms: Option<i64>,
}

impl Entry {
    fn new(value: Value, ttl: Option<Duration>, now_ms: i64) -> Self {
        Self {
            value,
            expires_at_ms: ttl.map(|ttl| now_ms.saturating_add(millis(ttl))),
        }
    }

    fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at_ms.map_or(false, |at| at <= now_ms)
    }
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

type Map = HashMap<String, Entry>;

fn purge(map: &mut Map, key: &str, now_ms: i64) {
    if map.get(key).map_or(false, |e| e.is_expired(now_ms)) {
        map.remove(key);
    }
}

/// Drop `key` if it has expired, then hand back the live entry (if any).
fn live<'a>(map: &'a mut Map, key: &str, now_ms: i64) -> Option<&'a mut Entry> {
    purge(map, key, now_ms);
    map.get_mut(key)
}

/// Live entry for `key`, created with `empty` when absent.
fn live_or_insert<'a>(
    map: &'a mut Map,
    key: &str,
    now_ms: i64,
    empty: impl FnOnce() -> Value,
) -> &'a mut Entry {
    purge(map, key, now_ms);
    map.entry(key.to_string())
        .or_insert_with(|| Entry::new(empty(), None, now_ms))
}

/// Thread-safe in-memory store with TTL support.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    data: Arc<Mutex<Map>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Store whose TTLs are measured against `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            data: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }

    /// Number of live keys.
    pub async fn len(&self) -> usize {
        let now = self.clock.now_millis();
        let mut map = self.data.lock().await;
        map.retain(|_, e| !e.is_expired(now));
        map.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = self.clock.now_millis();
        let mut map = self.data.lock().await;
        match live(&mut map, key, now) {
            None => Ok(None),
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let now = self.clock.now_millis();
        let mut map = self.data.lock().await;
        map.insert(key.to_string(), Entry::new(Value::Str(value.to_string()), ttl, now));
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = self.clock.now_millis();
        let mut map = self.data.lock().await;
        if live(&mut map, key, now).is_some() {
            return Ok(false);
        }
        map.insert(
            key.to_string(),
            Entry::new(Value::Str(value.to_string()), Some(ttl), now),
        );
        Ok(true)
    }

    async fn set_xx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = self.clock.now_millis();
        let mut map = self.data.lock().await;
        match live(&mut map, key, now) {
            Some(entry) => {
                *entry = Entry::new(Value::Str(value.to_string()), Some(ttl), now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let now = self.clock.now_millis();
        let mut map = self.data.lock().await;
        Ok(map.remove(key).map_or(false, |e| !e.is_expired(now)))
    }

    async fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let now = self.clock.now_millis();
        let mut map = self.data.lock().await;
        let holds = matches!(
            live(&mut map, key, now),
            Some(Entry { value: Value::Str(current), .. }) if current.as_str() == expected
        );
        if holds {
            map.remove(key);
        }
        Ok(holds)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let now = self.clock.now_millis();
        let mut map = self.data.lock().await;
        Ok(live(&mut map, key, now).is_some())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let now = self.clock.now_millis();
        let mut map = self.data.lock().await;
        Ok(live(&mut map, key, now)
            .and_then(|e| e.expires_at_ms)
            .map(|at| Duration::from_millis(u64::try_from(at - now).unwrap_or(0))))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = self.clock.now_millis();
        let mut map = self.data.lock().await;
        match live(&mut map, key, now) {
            Some(entry) => {
                entry.expires_at_ms = Some(now.saturating_add(millis(ttl)));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn incr(&self, key: &str, ttl_on_create: Duration) -> Result<i64, StoreError> {
        let now = self.clock.now_millis();
        let mut map = self.data.lock().await;
        match live(&mut map, key, now) {
            Some(entry) => {
                let Value::Str(raw) = &entry.value else {
                    return Err(StoreError::WrongType(key.to_string()));
                };
                let next = raw.parse::<i64>().map_err(|_| StoreError::WrongType(key.to_string()))? + 1;
                entry.value = Value::Str(next.to_string());
                Ok(next)
            }
            None => {
                map.insert(
                    key.to_string(),
                    Entry::new(Value::Str("1".to_string()), Some(ttl_on_create), now),
                );
                Ok(1)
            }
        }
    }

    async fn sadd(&self, key: &str, member: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let now = self.clock.now_millis();
        let mut map = self.data.lock().await;
        let entry = live_or_insert(&mut map, key, now, || Value::Set(HashSet::new()));
        let Value::Set(members) = &mut entry.value else {
            return Err(StoreError::WrongType(key.to_string()));
        };
        members.insert(member.to_string());
        if let Some(ttl) = ttl {
            entry.expires_at_ms = Some(now.saturating_add(millis(ttl)));
        }
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let now = self.clock.now_millis();
        let mut map = self.data.lock().await;
        let Some(entry) = live(&mut map, key, now) else {
            return Ok(false);
        };
        let Value::Set(members) = &mut entry.value else {
            return Err(StoreError::WrongType(key.to_string()));
        };
        let removed = members.remove(member);
        if members.is_empty() {
            map.remove(key);
        }
        Ok(removed)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let now = self.clock.now_millis();
        let mut map = self.data.lock().await;
        match live(&mut map, key, now) {
            None => Ok(Vec::new()),
            Some(Entry {
                value: Value::Set(members),
                ..
            }) => Ok(members.iter().cloned().collect()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn zadd(&self, key: &str, score: i64, member: &str) -> Result<(), StoreError> {
        let now = self.clock.now_millis();
        let mut map = self.data.lock().await;
        let entry = live_or_insert(&mut map, key, now, || Value::Sorted(Vec::new()));
        let Value::Sorted(items) = &mut entry.value else {
            return Err(StoreError::WrongType(key.to_string()));
        };
        items.retain(|(_, m)| m != member);
        let at = items.partition_point(|(s, _)| *s <= score);
        items.insert(at, (score, member.to_string()));
        Ok(())
    }

    async fn zrem_range_by_score(&self, key: &str, min: i64, max: i64) -> Result<u64, StoreError> {
        let now = self.clock.now_millis();
        let mut map = self.data.lock().await;
        let Some(entry) = live(&mut map, key, now) else {
            return Ok(0);
        };
        let Value::Sorted(items) = &mut entry.value else {
            return Err(StoreError::WrongType(key.to_string()));
        };
        let before = items.len();
        items.retain(|(s, _)| *s < min || *s > max);
        let removed = (before - items.len()) as u64;
        if items.is_empty() {
            map.remove(key);
        }
        Ok(removed)
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        let now = self.clock.now_millis();
        let mut map = self.data.lock().await;
        match live(&mut map, key, now) {
            None => Ok(0),
            Some(Entry {
                value: Value::Sorted(items),
                ..
            }) => Ok(items.len() as u64),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn sliding_window(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: i64,
        limit: u64,
        member: &str,
    ) -> Result<SlidingWindowOutcome, StoreError> {
        let now = self.clock.now_millis();
        let mut map = self.data.lock().await;
        let entry = live_or_insert(&mut map, key, now, || Value::Sorted(Vec::new()));
        let Value::Sorted(items) = &mut entry.value else {
            return Err(StoreError::WrongType(key.to_string()));
        };

        let cutoff = now_ms.saturating_sub(window_ms);
        items.retain(|(s, _)| *s > cutoff);

        let allowed = (items.len() as u64) < limit;
        if allowed {
            let at = items.partition_point(|(s, _)| *s <= now_ms);
            items.insert(at, (now_ms, member.to_string()));
        }

        let count = items.len() as u64;
        let oldest_ms = items.first().map_or(now_ms, |(s, _)| *s);
        entry.expires_at_ms = Some(now.saturating_add(window_ms));

        Ok(SlidingWindowOutcome {
            allowed,
            count,
            oldest_ms,
        })
    }

    async fn token_bucket(
        &self,
        key: &str,
        capacity: f64,
        refill_tokens: f64,
        refill_interval_ms: i64,
        now_ms: i64,
        ttl: Duration,
    ) -> Result<TokenBucketOutcome, StoreError> {
        let now = self.clock.now_millis();
        let mut map = self.data.lock().await;

        let (stored, updated_ms) = match live(&mut map, key, now) {
            None => (capacity, now_ms),
            Some(Entry {
                value: Value::Bucket { tokens, updated_ms },
                ..
            }) => (*tokens, *updated_ms),
            Some(_) => return Err(StoreError::WrongType(key.to_string())),
        };

        let elapsed = (now_ms - updated_ms).max(0) as f64;
        let refill = elapsed * refill_tokens / refill_interval_ms.max(1) as f64;
        let mut tokens = (stored + refill).min(capacity);
        let allowed = tokens >= 1.0;
        if allowed {
            tokens -= 1.0;
        }

        map.insert(
            key.to_string(),
            Entry::new(
                Value::Bucket {
                    tokens,
                    updated_ms: now_ms,
                },
                Some(ttl),
                now,
            ),
        );

        Ok(TokenBucketOutcome { allowed, tokens })
    }
}
