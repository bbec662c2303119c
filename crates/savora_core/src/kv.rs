//! Key-value persistence for routing state.
//!
//! The engine keeps availability and performance records in a KV store so a
//! restarted process can rehydrate recent history instead of starting cold.
//! Two tiers are provided: an in-process [`MemoryKvStore`] and a SQLite-backed
//! [`SqliteKvStore`], combined by [`TieredKvStore`] with a read-through /
//! write-through policy so consistency under restart is explicit.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{Connection, params};
use tracing::debug;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// A string-keyed store with optional per-entry TTL.
///
/// Values are opaque strings; callers serialize with `serde_json`. Expired
/// entries behave as missing.
pub trait KvStore: Send + Sync {
    /// Fetch a value, or `None` if absent or expired.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store a value. `ttl = None` means the entry never expires.
    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Remove an entry. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<()>;

    /// All live (non-expired) keys starting with `prefix`.
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Current time in unix milliseconds.
fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

// ---------------------------------------------------------------------------
// MemoryKvStore
// ---------------------------------------------------------------------------

struct MemoryEntry {
    value: String,
    /// Unix millis after which the entry is dead; `None` = no expiry.
    expires_at_ms: Option<i64>,
}

/// In-process store used as the fast tier and in tests.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, MemoryEntry>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(e) => {
                if let Some(expiry) = e.expires_at_ms
                    && now_ms() >= expiry
                {
                    entries.remove(key);
                    return Ok(None);
                }
                Ok(Some(e.value.clone()))
            }
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let expires_at_ms = ttl.map(|d| now_ms() + d.as_millis() as i64);
        self.entries.lock().insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at_ms,
            },
        );
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let now = now_ms();
        let entries = self.entries.lock();
        Ok(entries
            .iter()
            .filter(|(k, e)| {
                k.starts_with(prefix) && e.expires_at_ms.is_none_or(|exp| now < exp)
            })
            .map(|(k, _)| k.clone())
            .collect())
    }
}

// ---------------------------------------------------------------------------
// SqliteKvStore
// ---------------------------------------------------------------------------

/// SQLite-backed durable tier.
pub struct SqliteKvStore {
    conn: Mutex<Connection>,
}

impl SqliteKvStore {
    /// Opens (or creates) the store at the given path.
    pub fn open_at(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open KV store: {}", path.display()))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// In-memory SQLite database, for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.lock().execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at_ms INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_kv_expiry ON kv(expires_at_ms);",
        )?;
        Ok(())
    }

    /// Delete expired rows. Returns the number removed.
    pub fn sweep_expired(&self) -> Result<usize> {
        let removed = self.conn.lock().execute(
            "DELETE FROM kv WHERE expires_at_ms IS NOT NULL AND expires_at_ms <= ?1",
            params![now_ms()],
        )?;
        if removed > 0 {
            debug!(removed, "Swept expired KV entries");
        }
        Ok(removed)
    }
}

impl KvStore for SqliteKvStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare_cached("SELECT value, expires_at_ms FROM kv WHERE key = ?1")?;
        let row: Option<(String, Option<i64>)> = stmt
            .query_row(params![key], |r| Ok((r.get(0)?, r.get(1)?)))
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        match row {
            Some((_, Some(expiry))) if now_ms() >= expiry => {
                conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value)),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let expires_at_ms = ttl.map(|d| now_ms() + d.as_millis() as i64);
        self.conn.lock().execute(
            "INSERT INTO kv (key, value, expires_at_ms) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = ?2, expires_at_ms = ?3",
            params![key, value, expires_at_ms],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.conn
            .lock()
            .execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        let mut stmt = conn.prepare_cached(
            "SELECT key FROM kv WHERE key LIKE ?1 ESCAPE '\\'
             AND (expires_at_ms IS NULL OR expires_at_ms > ?2)",
        )?;
        let keys = stmt
            .query_map(params![pattern, now_ms()], |r| r.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(keys)
    }
}

// ---------------------------------------------------------------------------
// TieredKvStore
// ---------------------------------------------------------------------------

/// Two-tier store: fast in-process cache in front of a durable backend.
///
/// Writes go to both tiers (write-through). Reads hit the fast tier first
/// and promote durable hits into it (read-through), so a process restart
/// repopulates the cache lazily from the durable tier.
pub struct TieredKvStore<F: KvStore, D: KvStore> {
    fast: F,
    durable: D,
}

impl<F: KvStore, D: KvStore> TieredKvStore<F, D> {
    pub fn new(fast: F, durable: D) -> Self {
        Self { fast, durable }
    }
}

impl<F: KvStore, D: KvStore> KvStore for TieredKvStore<F, D> {
    fn get(&self, key: &str) -> Result<Option<String>> {
        if let Some(v) = self.fast.get(key)? {
            return Ok(Some(v));
        }
        match self.durable.get(key)? {
            Some(v) => {
                // Promote without TTL: the durable tier owns expiry.
                self.fast.set(key, &v, None)?;
                Ok(Some(v))
            }
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.durable.set(key, value, ttl)?;
        self.fast.set(key, value, ttl)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.fast.remove(key)?;
        self.durable.remove(key)?;
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        // The durable tier is the source of truth for enumeration.
        self.durable.keys_with_prefix(prefix)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
