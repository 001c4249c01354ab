//! Registry store backends for the SelfStart control plane.
//!
//! [`RegistryStore`] is the opaque key/value seam shared by all control
//! loops: TTL'd JSON blobs, a set index, capped lists, and a shared counter.
//! [`RedisStore`] backs it with Redis in production; [`MemoryStore`] is the
//! in-process implementation used in tests and as the degraded mode when the
//! store is unreachable. [`JsonTable`] covers the small relational tier
//! (shutdown rules and logs) with a JSON file per table.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use parking_lot::RwLock;
use selfstart_proto::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

// ─── Store trait ──────────────────────────────────────────────────────────────

/// Opaque key/value registry store.
///
/// Values are JSON blobs; schemas live with the callers. All failures
/// surface as [`Error::Store`] so control loops can degrade to their
/// in-memory view.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// Cheap liveness probe.
    async fn ping(&self) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Set with a time-to-live.
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn set_add(&self, key: &str, member: &str) -> Result<()>;

    async fn set_remove(&self, key: &str, member: &str) -> Result<()>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>>;

    /// Push to the front of a list, trim to `cap`, refresh the TTL.
    async fn list_push(&self, key: &str, value: &str, cap: usize, ttl_secs: u64) -> Result<()>;

    /// Newest-first read of up to `limit` entries.
    async fn list_range(&self, key: &str, limit: usize) -> Result<Vec<String>>;

    /// Atomically increment a shared counter, refreshing its TTL.
    async fn counter_incr(&self, key: &str, ttl_secs: u64) -> Result<u64>;
}

// ─── Memory store ─────────────────────────────────────────────────────────────

enum Value {
    Str(String),
    Set(HashSet<String>),
    List(VecDeque<String>),
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// In-process [`RegistryStore`] with lazy TTL eviction.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn live_entry<'a>(
        entries: &'a mut HashMap<String, Entry>,
        key: &str,
    ) -> Option<&'a mut Entry> {
        if entries.get(key).is_some_and(Entry::expired) {
            entries.remove(key);
            return None;
        }
        entries.get_mut(key)
    }

    fn ttl_deadline(ttl_secs: u64) -> Option<Instant> {
        Some(Instant::now() + Duration::from_secs(ttl_secs))
    }

    /// Number of live keys, for tests and diagnostics.
    pub fn len(&self) -> usize {
        self.entries.read().values().filter(|e| !e.expired()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RegistryStore for MemoryStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.write();
        match Self::live_entry(&mut entries, key) {
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(Error::Store(format!("key '{key}' holds a non-string value"))),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries.write().insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        self.entries.write().insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Self::ttl_deadline(ttl_secs),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<()> {
        let mut entries = self.entries.write();
        match Self::live_entry(&mut entries, key) {
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => {
                set.insert(member.to_string());
            }
            Some(_) => {
                return Err(Error::Store(format!("key '{key}' holds a non-set value")));
            }
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::Set(HashSet::from([member.to_string()])),
                        expires_at: None,
                    },
                );
            }
        }
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<()> {
        let mut entries = self.entries.write();
        if let Some(Entry {
            value: Value::Set(set),
            ..
        }) = Self::live_entry(&mut entries, key)
        {
            set.remove(member);
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let mut entries = self.entries.write();
        match Self::live_entry(&mut entries, key) {
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => {
                let mut members: Vec<String> = set.iter().cloned().collect();
                members.sort();
                Ok(members)
            }
            Some(_) => Err(Error::Store(format!("key '{key}' holds a non-set value"))),
            None => Ok(Vec::new()),
        }
    }

    async fn list_push(&self, key: &str, value: &str, cap: usize, ttl_secs: u64) -> Result<()> {
        let mut entries = self.entries.write();
        let deadline = Self::ttl_deadline(ttl_secs);
        match Self::live_entry(&mut entries, key) {
            Some(entry) => {
                let Value::List(list) = &mut entry.value else {
                    return Err(Error::Store(format!("key '{key}' holds a non-list value")));
                };
                list.push_front(value.to_string());
                list.truncate(cap);
                entry.expires_at = deadline;
            }
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::List(VecDeque::from([value.to_string()])),
                        expires_at: deadline,
                    },
                );
            }
        }
        Ok(())
    }

    async fn list_range(&self, key: &str, limit: usize) -> Result<Vec<String>> {
        let mut entries = self.entries.write();
        match Self::live_entry(&mut entries, key) {
            Some(Entry {
                value: Value::List(list),
                ..
            }) => Ok(list.iter().take(limit).cloned().collect()),
            Some(_) => Err(Error::Store(format!("key '{key}' holds a non-list value"))),
            None => Ok(Vec::new()),
        }
    }

    async fn counter_incr(&self, key: &str, ttl_secs: u64) -> Result<u64> {
        let mut entries = self.entries.write();
        let deadline = Self::ttl_deadline(ttl_secs);
        match Self::live_entry(&mut entries, key) {
            Some(entry) => {
                let Value::Str(raw) = &mut entry.value else {
                    return Err(Error::Store(format!("key '{key}' holds a non-string value")));
                };
                let next = raw
                    .parse::<u64>()
                    .map_err(|_| Error::Store(format!("counter '{key}' is not numeric")))?
                    + 1;
                *raw = next.to_string();
                entry.expires_at = deadline;
                Ok(next)
            }
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::Str("1".to_string()),
                        expires_at: deadline,
                    },
                );
                Ok(1)
            }
        }
    }
}

// ─── Redis store ──────────────────────────────────────────────────────────────

/// Redis-backed [`RegistryStore`], addressed by `REDIS_URL`.
#[derive(Clone)]
pub struct RedisStore {
    conn: redis::aio::ConnectionManager,
}

fn store_err(e: redis::RedisError) -> Error {
    Error::Store(e.to_string())
}

impl RedisStore {
    /// Connect and build a self-reconnecting connection manager.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(store_err)?;
        let conn = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(store_err)?;
        debug!(url, "connected to registry store");
        Ok(Self { conn })
    }
}

#[async_trait]
impl RegistryStore for RedisStore {
    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(store_err)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        let _: () = conn.set(key, value).await.map_err(store_err)?;
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, value, ttl_secs).await.map_err(store_err)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await.map_err(store_err)?;
        Ok(())
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<()> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        let _: () = conn.sadd(key, member).await.map_err(store_err)?;
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<()> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        let _: () = conn.srem(key, member).await.map_err(store_err)?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        let mut members: Vec<String> = conn.smembers(key).await.map_err(store_err)?;
        members.sort();
        Ok(members)
    }

    async fn list_push(&self, key: &str, value: &str, cap: usize, ttl_secs: u64) -> Result<()> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        let _: () = conn.lpush(key, value).await.map_err(store_err)?;
        let _: () = conn
            .ltrim(key, 0, cap.saturating_sub(1) as isize)
            .await
            .map_err(store_err)?;
        let _: () = conn
            .expire(key, ttl_secs as i64)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn list_range(&self, key: &str, limit: usize) -> Result<Vec<String>> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        conn.lrange(key, 0, limit.saturating_sub(1) as isize)
            .await
            .map_err(store_err)
    }

    async fn counter_incr(&self, key: &str, ttl_secs: u64) -> Result<u64> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        let next: u64 = conn.incr(key, 1u64).await.map_err(store_err)?;
        let _: () = conn
            .expire(key, ttl_secs as i64)
            .await
            .map_err(store_err)?;
        Ok(next)
    }
}

// ─── JSON table tier ──────────────────────────────────────────────────────────

/// A JSON file-backed table for one domain of records.
///
/// Keeps the whole table in a `HashMap<String, T>` image and snapshots to
/// `{dir}/tables/{name}.json` on every save.
pub struct JsonTable {
    path: PathBuf,
}

impl JsonTable {
    pub fn new(dir: &Path, name: &str) -> Self {
        let path = dir.join("tables").join(format!("{name}.json"));
        Self { path }
    }

    /// Load the table. Returns an empty map if the file doesn't exist;
    /// a corrupt file is logged and treated as empty.
    pub fn load<T: for<'de> Deserialize<'de>>(&self) -> HashMap<String, T> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(path = %self.path.display(), error = %e, "corrupt table file, starting fresh");
                HashMap::new()
            }),
            Err(_) => {
                debug!(path = %self.path.display(), "no table file, starting fresh");
                HashMap::new()
            }
        }
    }

    /// Save the table, creating directories as needed.
    pub fn save<T: Serialize>(&self, data: &HashMap<String, T>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Store(format!("create {}: {e}", parent.display())))?;
        }
        let content = serde_json::to_string_pretty(data)
            .map_err(|e| Error::Store(format!("encode table: {e}")))?;
        std::fs::write(&self.path, content)
            .map_err(|e| Error::Store(format!("write {}: {e}", self.path.display())))
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
