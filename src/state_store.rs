//! Shared key/value state with compare-and-set and pub/sub.
//!
//! The [`StateStore`] is the only mutable state shared between core
//! instances: match snapshots (CAS-guarded by version), matchmaking queues
//! (sorted sets), presence sets and the custom-lobby directory. The
//! in-process [`MemoryStateStore`] is the default implementation; a
//! network-backed store plugs in behind the same trait.
//!
//! Key layout:
//!
//! - `match:{match_id}` — snapshot JSON, CAS by version
//! - `match:{match_id}:owner` — owning process instance id
//! - `queue:{mode}:{bucket}` — sorted set of `(enqueue_ms, player_id)`
//! - `lobby:custom:{match_id}` — lobby metadata
//! - `presence:{player_id}` — last-seen record

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::StateStoreError;

/// Predicate deciding whether the oldest member of a sorted set may be
/// popped; receives `(score, member)`.
pub type PopPredicate = Box<dyn Fn(u64, &str) -> bool + Send + Sync>;

/// Key/value store with CAS, pub/sub, sorted sets and plain sets.
///
/// All calls may fail transiently; callers wrap them in
/// [`retry_with_backoff`](crate::error::retry_with_backoff). A
/// [`StateStoreError::Conflict`] from [`cas_set`](StateStore::cas_set)
/// means another writer holds a newer version and is never retried.
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    /// Reads a key; `None` when absent.
    async fn get(&self, key: &str) -> Result<Option<(Value, u64)>, StateStoreError>;

    /// Conditionally writes a key. `expected = 0` creates the key only if
    /// absent; otherwise the stored version must equal `expected`. Returns
    /// the new version.
    async fn cas_set(&self, key: &str, expected: u64, value: Value)
        -> Result<u64, StateStoreError>;

    /// Deletes a key (and any set stored under it).
    async fn del(&self, key: &str) -> Result<(), StateStoreError>;

    /// Publishes an event to a topic; lost if nobody is subscribed.
    async fn publish(&self, topic: &str, event: Value) -> Result<(), StateStoreError>;

    /// Subscribes to a topic.
    async fn subscribe(&self, topic: &str)
        -> Result<broadcast::Receiver<Value>, StateStoreError>;

    /// Adds `member` with `score` to a sorted set, replacing its previous
    /// score if present.
    async fn zadd(&self, key: &str, score: u64, member: &str) -> Result<(), StateStoreError>;

    /// Removes `member` from a sorted set; `true` if it was present.
    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StateStoreError>;

    /// All members of a sorted set, ascending by `(score, member)`.
    async fn zrange(&self, key: &str) -> Result<Vec<(u64, String)>, StateStoreError>;

    /// Atomically pops the lowest-scored member satisfying `pred`.
    async fn zpop_min_if(
        &self,
        key: &str,
        pred: PopPredicate,
    ) -> Result<Option<(u64, String)>, StateStoreError>;

    /// Adds a member to a plain set.
    async fn sadd(&self, key: &str, member: &str) -> Result<(), StateStoreError>;

    /// Removes a member from a plain set; `true` if it was present.
    async fn srem(&self, key: &str, member: &str) -> Result<bool, StateStoreError>;

    /// All members of a plain set, unordered.
    async fn smembers(&self, key: &str) -> Result<Vec<String>, StateStoreError>;
}

const TOPIC_CAPACITY: usize = 256;

#[derive(Default)]
struct StoreInner {
    kv: HashMap<String, (Value, u64)>,
    zsets: HashMap<String, BTreeSet<(u64, String)>>,
    sets: HashMap<String, HashSet<String>>,
    topics: HashMap<String, broadcast::Sender<Value>>,
}

/// In-process [`StateStore`] backed by mutexed maps and broadcast topics.
#[derive(Clone, Default)]
pub struct MemoryStateStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl MemoryStateStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &str) -> Result<Option<(Value, u64)>, StateStoreError> {
        Ok(self.inner.lock().kv.get(key).cloned())
    }

    async fn cas_set(
        &self,
        key: &str,
        expected: u64,
        value: Value,
    ) -> Result<u64, StateStoreError> {
        let mut inner = self.inner.lock();
        let found = inner.kv.get(key).map(|(_, v)| *v).unwrap_or(0);
        if found != expected {
            return Err(StateStoreError::Conflict {
                key: key.to_string(),
                expected,
                found,
            });
        }
        let next = found + 1;
        inner.kv.insert(key.to_string(), (value, next));
        Ok(next)
    }

    async fn del(&self, key: &str) -> Result<(), StateStoreError> {
        let mut inner = self.inner.lock();
        inner.kv.remove(key);
        inner.zsets.remove(key);
        inner.sets.remove(key);
        Ok(())
    }

    async fn publish(&self, topic: &str, event: Value) -> Result<(), StateStoreError> {
        let sender = self.inner.lock().topics.get(topic).cloned();
        if let Some(sender) = sender {
            let _ = sender.send(event);
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
    ) -> Result<broadcast::Receiver<Value>, StateStoreError> {
        let mut inner = self.inner.lock();
        let sender = inner
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0);
        Ok(sender.subscribe())
    }

    async fn zadd(&self, key: &str, score: u64, member: &str) -> Result<(), StateStoreError> {
        let mut inner = self.inner.lock();
        let zset = inner.zsets.entry(key.to_string()).or_default();
        zset.retain(|(_, m)| m != member);
        zset.insert((score, member.to_string()));
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StateStoreError> {
        let mut inner = self.inner.lock();
        let Some(zset) = inner.zsets.get_mut(key) else {
            return Ok(false);
        };
        let before = zset.len();
        zset.retain(|(_, m)| m != member);
        Ok(zset.len() != before)
    }

    async fn zrange(&self, key: &str) -> Result<Vec<(u64, String)>, StateStoreError> {
        Ok(self
            .inner
            .lock()
            .zsets
            .get(key)
            .map(|z| z.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn zpop_min_if(
        &self,
        key: &str,
        pred: PopPredicate,
    ) -> Result<Option<(u64, String)>, StateStoreError> {
        let mut inner = self.inner.lock();
        let Some(zset) = inner.zsets.get_mut(key) else {
            return Ok(None);
        };
        let hit = zset
            .iter()
            .find(|(score, member)| pred(*score, member))
            .cloned();
        if let Some(entry) = &hit {
            zset.remove(entry);
        }
        Ok(hit)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), StateStoreError> {
        self.inner
            .lock()
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, StateStoreError> {
        Ok(self
            .inner
            .lock()
            .sets
            .get_mut(key)
            .map(|s| s.remove(member))
            .unwrap_or(false))
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StateStoreError> {
        Ok(self
            .inner
            .lock()
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }
}

/// Key of a match snapshot.
pub fn match_key(match_id: impl std::fmt::Display) -> String {
    format!("match:{match_id}")
}

/// Key of a match's owning-instance marker.
pub fn match_owner_key(match_id: impl std::fmt::Display) -> String {
    format!("match:{match_id}:owner")
}

/// Key of one matchmaking queue bucket.
pub fn queue_key(mode: &str, bucket: i32) -> String {
    format!("queue:{mode}:{bucket}")
}

/// Key of a custom lobby's directory entry.
pub fn lobby_key(match_id: impl std::fmt::Display) -> String {
    format!("lobby:custom:{match_id}")
}

/// Key of a player's presence record.
pub fn presence_key(player_id: impl std::fmt::Display) -> String {
    format!("presence:{player_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn cas_create_and_conflict() {
        let store = MemoryStateStore::new();
        let v1 = store.cas_set("match:a", 0, json!({"n": 1})).await.unwrap();
        assert_eq!(v1, 1);

        // Stale writer loses.
        let err = store.cas_set("match:a", 0, json!({"n": 2})).await;
        assert!(matches!(
            err,
            Err(StateStoreError::Conflict {
                expected: 0,
                found: 1,
                ..
            })
        ));

        let v2 = store.cas_set("match:a", 1, json!({"n": 2})).await.unwrap();
        assert_eq!(v2, 2);
        let (value, version) = store.get("match:a").await.unwrap().unwrap();
        assert_eq!(value, json!({"n": 2}));
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn zset_orders_by_score_then_member() {
        let store = MemoryStateStore::new();
        store.zadd("q", 20, "b").await.unwrap();
        store.zadd("q", 10, "c").await.unwrap();
        store.zadd("q", 10, "a").await.unwrap();

        let range = store.zrange("q").await.unwrap();
        assert_eq!(
            range,
            vec![(10, "a".into()), (10, "c".into()), (20, "b".into())]
        );

        // Re-adding replaces the score.
        store.zadd("q", 5, "b").await.unwrap();
        assert_eq!(store.zrange("q").await.unwrap()[0].1, "b");
    }

    #[tokio::test]
    async fn zpop_min_if_honors_predicate() {
        let store = MemoryStateStore::new();
        store.zadd("q", 1, "skip").await.unwrap();
        store.zadd("q", 2, "take").await.unwrap();

        let popped = store
            .zpop_min_if("q", Box::new(|_, m| m != "skip"))
            .await
            .unwrap();
        assert_eq!(popped, Some((2, "take".into())));
        // The skipped member is untouched.
        assert_eq!(store.zrange("q").await.unwrap().len(), 1);

        let none = store
            .zpop_min_if("q", Box::new(|_, _| false))
            .await
            .unwrap();
        assert_eq!(none, None);
    }

    #[tokio::test]
    async fn publish_reaches_subscribers() {
        let store = MemoryStateStore::new();
        let mut rx = store.subscribe("inbox:p1").await.unwrap();
        store.publish("inbox:p1", json!("hello")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), json!("hello"));
    }
}
