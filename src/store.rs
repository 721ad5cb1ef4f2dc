//! Key-value state shared between workers.
//!
//! Middleware keeps rate-limit buckets, overlap locks, and exception counters
//! here, and chains keep their continuations here. A [`MemoryStore`] is only
//! shared within a process; use a [`DatabaseStore`] when several worker
//! processes need to see the same state.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use jiff::{Span, Timestamp};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use self::database::DatabaseStore;

mod database;

/// A type alias for store results.
pub type Result<T = ()> = std::result::Result<T, Error>;

/// Store errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error returned by the `sqlx` crate during database operations.
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// Error returned by the `serde_json` crate when encoding a value.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Error returned by the `jiff` crate when computing expiry.
    #[error(transparent)]
    Jiff(#[from] jiff::Error),
}

/// Atomic key-value operations with optional expiry.
#[async_trait]
pub trait Store: Send + Sync {
    /// Returns the value under `key`, unless it is missing or expired.
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Writes `value` under `key`, replacing anything already there.
    async fn put(&self, key: &str, value: Value, ttl: Option<Span>) -> Result;

    /// Writes `value` only if `key` is missing or expired. Returns `true` when
    /// the value was written.
    async fn add(&self, key: &str, value: Value, ttl: Option<Span>) -> Result<bool>;

    /// Replaces the value under `key` only if it currently equals `current`.
    /// Returns `true` when the value was replaced.
    async fn compare_and_swap(
        &self,
        key: &str,
        current: &Value,
        new: Value,
        ttl: Option<Span>,
    ) -> Result<bool>;

    /// Removes `key`. Returns `true` if it existed.
    async fn forget(&self, key: &str) -> Result<bool>;

    /// Removes `key` only if its live value equals `current`. Returns `true`
    /// when it was removed.
    async fn forget_if(&self, key: &str, current: &Value) -> Result<bool>;
}

fn expires_at(now: Timestamp, ttl: Option<Span>) -> Result<Option<Timestamp>> {
    Ok(ttl.map(|ttl| now.checked_add(ttl)).transpose()?)
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Timestamp>,
}

impl Entry {
    fn is_live(&self, now: Timestamp) -> bool {
        self.expires_at.map_or(true, |expires_at| expires_at > now)
    }
}

/// A [`Store`] living in process memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes expired entries, returning how many were removed.
    ///
    /// Writes sweep expired entries on their own; this is only needed to
    /// reclaim memory from a store which is no longer written to.
    pub fn prune(&self) -> usize {
        sweep(&mut self.entries.lock(), Timestamp::now())
    }
}

fn sweep(entries: &mut HashMap<String, Entry>, now: Timestamp) -> usize {
    let before = entries.len();
    entries.retain(|_, entry| entry.is_live(now));
    before - entries.len()
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let now = Timestamp::now();
        let entries = self.entries.lock();
        Ok(entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone()))
    }

    async fn put(&self, key: &str, value: Value, ttl: Option<Span>) -> Result {
        let now = Timestamp::now();
        let expires_at = expires_at(now, ttl)?;
        let mut entries = self.entries.lock();
        sweep(&mut entries, now);
        entries.insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn add(&self, key: &str, value: Value, ttl: Option<Span>) -> Result<bool> {
        let now = Timestamp::now();
        let expires_at = expires_at(now, ttl)?;
        let mut entries = self.entries.lock();
        sweep(&mut entries, now);
        if entries.contains_key(key) {
            return Ok(false);
        }

        entries.insert(key.to_string(), Entry { value, expires_at });
        Ok(true)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        current: &Value,
        new: Value,
        ttl: Option<Span>,
    ) -> Result<bool> {
        let now = Timestamp::now();
        let expires_at = expires_at(now, ttl)?;
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if entry.is_live(now) && entry.value == *current => {
                *entry = Entry {
                    value: new,
                    expires_at,
                };
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn forget(&self, key: &str) -> Result<bool> {
        let now = Timestamp::now();
        Ok(self
            .entries
            .lock()
            .remove(key)
            .is_some_and(|entry| entry.is_live(now)))
    }

    async fn forget_if(&self, key: &str, current: &Value) -> Result<bool> {
        let now = Timestamp::now();
        let mut entries = self.entries.lock();
        if !entries
            .get(key)
            .is_some_and(|entry| entry.is_live(now) && entry.value == *current)
        {
            return Ok(false);
        }

        entries.remove(key);
        Ok(true)
    }
}

/// Attempts counted within a fixed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct Bucket {
    attempts: u32,
    reset_at: i64,
}

/// Result of [`RateLimiter::attempt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    /// The attempt was counted.
    Allowed {
        /// Attempts in the current window, including this one.
        attempts: u32,
    },

    /// The window is full.
    Limited {
        /// Seconds until the window resets.
        retry_in: u64,
    },
}

/// Fixed-window counters on top of a [`Store`].
///
/// Every update is a compare-and-swap, so concurrent workers sharing a store
/// never lose a hit.
pub struct RateLimiter<'a> {
    store: &'a dyn Store,
}

impl<'a> RateLimiter<'a> {
    /// Creates a limiter counting in `store`.
    pub fn new(store: &'a dyn Store) -> Self {
        Self { store }
    }

    /// Seconds until the window for `key` resets, if `max_attempts` have
    /// already been made in it.
    pub async fn too_many_attempts(&self, key: &str, max_attempts: u32) -> Result<Option<u64>> {
        let now = Timestamp::now().as_second();
        Ok(self
            .bucket(key, now)
            .await?
            .1
            .filter(|bucket| bucket.attempts >= max_attempts)
            .map(|bucket| retry_in(bucket, now)))
    }

    /// Counts a hit against `key`, opening a window of `decay_seconds` if none
    /// is open. Returns the hits in the current window.
    pub async fn hit(&self, key: &str, decay_seconds: u64) -> Result<u32> {
        match self.update(key, decay_seconds, None).await? {
            Attempt::Allowed { attempts } => Ok(attempts),
            Attempt::Limited { .. } => Ok(0),
        }
    }

    /// Counts a hit against `key` unless `max_attempts` have already been made
    /// in the current window.
    pub async fn attempt(&self, key: &str, max_attempts: u32, decay_seconds: u64) -> Result<Attempt> {
        self.update(key, decay_seconds, Some(max_attempts)).await
    }

    /// Resets the window for `key`.
    pub async fn clear(&self, key: &str) -> Result {
        self.store.forget(key).await?;
        Ok(())
    }

    /// Returns the raw stored value along with the bucket it holds, if that
    /// bucket's window is still open.
    async fn bucket(&self, key: &str, now: i64) -> Result<(Option<Value>, Option<Bucket>)> {
        let Some(raw) = self.store.get(key).await? else {
            return Ok((None, None));
        };

        // Unreadable state is treated as an empty window.
        let bucket = match serde_json::from_value::<Bucket>(raw.clone()) {
            Ok(bucket) if bucket.reset_at > now => Some(bucket),
            _ => None,
        };

        Ok((Some(raw), bucket))
    }

    async fn update(
        &self,
        key: &str,
        decay_seconds: u64,
        max_attempts: Option<u32>,
    ) -> Result<Attempt> {
        // A zero-second window would expire as soon as it is written.
        let decay_seconds = decay_seconds.max(1);
        loop {
            let now = Timestamp::now().as_second();
            let (raw, current) = self.bucket(key, now).await?;

            if let (Some(bucket), Some(max_attempts)) = (current, max_attempts) {
                if bucket.attempts >= max_attempts {
                    return Ok(Attempt::Limited {
                        retry_in: retry_in(bucket, now),
                    });
                }
            }

            let next = match current {
                Some(bucket) => Bucket {
                    attempts: bucket.attempts.saturating_add(1),
                    reset_at: bucket.reset_at,
                },
                None => Bucket {
                    attempts: 1,
                    reset_at: now.saturating_add(i64::try_from(decay_seconds).unwrap_or(i64::MAX)),
                },
            };
            let ttl = crate::job::seconds(retry_in(next, now));
            let value = serde_json::to_value(next)?;

            let written = match raw {
                Some(raw) => {
                    self.store
                        .compare_and_swap(key, &raw, value, Some(ttl))
                        .await?
                }
                None => self.store.add(key, value, Some(ttl)).await?,
            };

            if written {
                return Ok(Attempt::Allowed {
                    attempts: next.attempts,
                });
            }
        }
    }
}

fn retry_in(bucket: Bucket, now: i64) -> u64 {
    u64::try_from(bucket.reset_at.saturating_sub(now)).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use jiff::ToSpan;
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn add_only_writes_missing_keys() -> Result {
        let store = MemoryStore::new();
        assert!(store.add("lock", json!("a"), None).await?);
        assert!(!store.add("lock", json!("b"), None).await?);
        assert_eq!(store.get("lock").await?, Some(json!("a")));

        assert!(store.forget("lock").await?);
        assert!(store.add("lock", json!("b"), None).await?);
        Ok(())
    }

    #[tokio::test]
    async fn expired_entries_are_invisible() -> Result {
        let store = MemoryStore::new();
        store.put("gone", json!(1), Some((-1).seconds())).await?;
        assert_eq!(store.get("gone").await?, None);
        assert!(store.add("gone", json!(2), None).await?);
        assert_eq!(store.get("gone").await?, Some(json!(2)));
        Ok(())
    }

    #[tokio::test]
    async fn writes_sweep_expired_entries() -> Result {
        let store = MemoryStore::new();
        store.put("stale", json!(1), Some((-1).seconds())).await?;
        store.put("also-stale", json!(2), Some((-1).seconds())).await?;
        assert_eq!(store.entries.lock().len(), 1);

        store.add("fresh", json!(3), Some(1.minute())).await?;
        assert_eq!(store.entries.lock().len(), 1);
        assert_eq!(store.prune(), 0);

        store.entries.lock().insert(
            "expired".to_string(),
            Entry {
                value: json!(4),
                expires_at: Some(Timestamp::now() - 1.second()),
            },
        );
        assert_eq!(store.prune(), 1);
        assert_eq!(store.get("fresh").await?, Some(json!(3)));
        Ok(())
    }

    #[tokio::test]
    async fn compare_and_swap_requires_current_value() -> Result {
        let store = MemoryStore::new();
        store.put("n", json!(1), None).await?;
        assert!(!store.compare_and_swap("n", &json!(2), json!(3), None).await?);
        assert!(store.compare_and_swap("n", &json!(1), json!(3), None).await?);
        assert_eq!(store.get("n").await?, Some(json!(3)));
        assert!(!store.compare_and_swap("missing", &json!(1), json!(2), None).await?);
        Ok(())
    }

    #[tokio::test]
    async fn forget_if_requires_current_value() -> Result {
        let store = MemoryStore::new();
        store.put("lock", json!({ "job": 1 }), None).await?;
        assert!(!store.forget_if("lock", &json!({ "job": 2 })).await?);
        assert_eq!(store.get("lock").await?, Some(json!({ "job": 1 })));

        assert!(store.forget_if("lock", &json!({ "job": 1 })).await?);
        assert_eq!(store.get("lock").await?, None);
        assert!(!store.forget_if("lock", &json!({ "job": 1 })).await?);
        Ok(())
    }

    #[tokio::test]
    async fn limiter_counts_within_window() -> Result {
        let store = MemoryStore::new();
        let limiter = RateLimiter::new(&store);

        assert_eq!(limiter.attempt("k", 2, 60).await?, Attempt::Allowed { attempts: 1 });
        assert_eq!(limiter.attempt("k", 2, 60).await?, Attempt::Allowed { attempts: 2 });
        assert!(matches!(
            limiter.attempt("k", 2, 60).await?,
            Attempt::Limited { retry_in } if retry_in > 0 && retry_in <= 60
        ));
        assert!(limiter.too_many_attempts("k", 2).await?.is_some());

        limiter.clear("k").await?;
        assert_eq!(limiter.too_many_attempts("k", 2).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn limiter_windows_last_at_least_a_second() -> Result {
        let store = MemoryStore::new();
        let limiter = RateLimiter::new(&store);

        assert_eq!(limiter.attempt("k", 1, 0).await?, Attempt::Allowed { attempts: 1 });
        let bucket: Bucket = serde_json::from_value(store.get("k").await?.expect("a bucket"))?;
        assert_eq!(bucket.attempts, 1);
        assert!(bucket.reset_at >= Timestamp::now().as_second());
        Ok(())
    }

    #[tokio::test]
    async fn limiter_resets_after_window() -> Result {
        let store = MemoryStore::new();
        let expired = Bucket {
            attempts: 10,
            reset_at: Timestamp::now().as_second() - 1,
        };
        store.put("k", serde_json::to_value(expired)?, None).await?;

        let limiter = RateLimiter::new(&store);
        assert_eq!(limiter.too_many_attempts("k", 1).await?, None);
        assert_eq!(limiter.hit("k", 60).await?, 1);
        Ok(())
    }
}
