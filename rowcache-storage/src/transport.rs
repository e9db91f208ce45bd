//! Cache transports.
//!
//! [`CacheTransport`] is the string key/value surface the distributed cache
//! and the local-cache version marker are built on: reads that tell a miss
//! apart from a stored value, set with optional TTL, set-if-absent, expire,
//! delete and exists.
//!
//! Two implementations are provided:
//! - [`MemoryTransport`]: a map shared by every manager holding the same
//!   `Arc`, used in tests and single-process deployments
//! - [`LmdbTransport`]: an LMDB environment, shareable between processes on
//!   one host

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use tracing::debug;

use rowcache_core::{CacheError, CacheSettings, CacheSlot, TransportSettings};

/// Blocking key/value cache operations.
pub trait CacheTransport: Send + Sync {
    fn get(&self, key: &str) -> Result<CacheSlot<String>, CacheError>;

    /// One slot per key, in key order.
    fn mget(&self, keys: &[String]) -> Result<Vec<CacheSlot<String>>, CacheError> {
        keys.iter().map(|k| self.get(k)).collect()
    }

    /// Overwrite `key`. `None` keeps the entry until deleted.
    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError>;

    /// Store `value` only if `key` is absent. Returns true when stored.
    fn set_nx(&self, key: &str, value: &str) -> Result<bool, CacheError>;

    /// Set the remaining lifetime of an existing key. Returns false if absent.
    fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError>;

    /// Delete keys. Returns how many existed.
    fn del(&self, keys: &[String]) -> Result<usize, CacheError>;

    fn exists(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.get(key)?.is_hit())
    }
}

// ============================================================================
// MEMORY
// ============================================================================

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Writes between sweeps of expired entries.
const PRUNE_INTERVAL: usize = 256;

/// In-process transport. Expired entries read as misses and are swept out
/// every [`PRUNE_INTERVAL`] writes.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    entries: RwLock<HashMap<String, MemoryEntry>>,
    writes: AtomicUsize,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live entry count.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|e| e.is_live(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining lifetime of `key`, if it has one.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .filter(|e| e.is_live(now))
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    /// Remove expired entries. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        prune(&mut entries, Instant::now())
    }

    fn note_write(&self, entries: &mut HashMap<String, MemoryEntry>, now: Instant) {
        if self.writes.fetch_add(1, Ordering::Relaxed) % PRUNE_INTERVAL == PRUNE_INTERVAL - 1 {
            prune(entries, now);
        }
    }

    /// Drop everything.
    pub fn flush(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

fn prune(entries: &mut HashMap<String, MemoryEntry>, now: Instant) -> usize {
    let before = entries.len();
    entries.retain(|_, e| e.is_live(now));
    before - entries.len()
}

impl CacheTransport for MemoryTransport {
    fn get(&self, key: &str) -> Result<CacheSlot<String>, CacheError> {
        let now = Instant::now();
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone())
            .into())
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        self.note_write(&mut entries, now);
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: ttl.map(|t| now + t),
            },
        );
        Ok(())
    }

    fn set_nx(&self, key: &str, value: &str) -> Result<bool, CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        self.note_write(&mut entries, now);
        if entries.get(key).is_some_and(|e| e.is_live(now)) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(true)
    }

    fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        match entries.get_mut(key).filter(|e| e.is_live(now)) {
            Some(entry) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn del(&self, keys: &[String]) -> Result<usize, CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        Ok(keys
            .iter()
            .filter_map(|k| entries.remove(k))
            .filter(|e| e.is_live(now))
            .count())
    }
}

// ============================================================================
// LMDB
// ============================================================================

/// LMDB-backed transport.
///
/// Values are stored as `[expires_at_millis: 8 bytes LE][utf-8 value]`, with
/// zero meaning no expiry. Expired entries read as misses and are removed
/// on the next write to the same key.
pub struct LmdbTransport {
    env: Env,
    db: Database<Bytes, Bytes>,
}

fn lmdb_error(op: &'static str, key: &str, e: impl std::fmt::Display) -> CacheError {
    CacheError::Transport {
        op,
        key: key.to_string(),
        reason: e.to_string(),
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn encode_record(value: &str, expires_at: i64) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(8 + value.len());
    bytes.extend_from_slice(&expires_at.to_le_bytes());
    bytes.extend_from_slice(value.as_bytes());
    bytes
}

/// Returns the value and expiry of a live record.
fn decode_record(key: &str, bytes: &[u8], now: i64) -> Result<Option<(String, i64)>, CacheError> {
    if bytes.len() < 8 {
        return Err(lmdb_error("get", key, "record shorter than header"));
    }
    let mut header = [0u8; 8];
    header.copy_from_slice(&bytes[..8]);
    let expires_at = i64::from_le_bytes(header);
    if expires_at != 0 && expires_at <= now {
        return Ok(None);
    }
    let value = std::str::from_utf8(&bytes[8..]).map_err(|e| lmdb_error("get", key, e))?;
    Ok(Some((value.to_string(), expires_at)))
}

fn ttl_millis(ttl: Duration) -> i64 {
    now_millis().saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
}

impl LmdbTransport {
    /// Open (creating if needed) an environment at `path`.
    pub fn open<P: AsRef<Path>>(path: P, map_size_mb: usize) -> Result<Self, CacheError> {
        let shown = path.as_ref().display().to_string();
        std::fs::create_dir_all(&path).map_err(|e| lmdb_error("open", &shown, e))?;

        // SAFETY: the environment is opened once per transport and never
        // concurrently truncated by this process.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| lmdb_error("open", &shown, e))?;

        let mut wtxn = env.write_txn().map_err(|e| lmdb_error("open", &shown, e))?;
        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| lmdb_error("open", &shown, e))?;
        wtxn.commit().map_err(|e| lmdb_error("open", &shown, e))?;

        debug!(path = %shown, map_size_mb, "opened lmdb cache transport");
        Ok(Self { env, db })
    }

    fn read(&self, key: &str) -> Result<Option<(String, i64)>, CacheError> {
        let rtxn = self.env.read_txn().map_err(|e| lmdb_error("get", key, e))?;
        match self
            .db
            .get(&rtxn, key.as_bytes())
            .map_err(|e| lmdb_error("get", key, e))?
        {
            Some(bytes) => decode_record(key, bytes, now_millis()),
            None => Ok(None),
        }
    }
}

impl CacheTransport for LmdbTransport {
    fn get(&self, key: &str) -> Result<CacheSlot<String>, CacheError> {
        Ok(self.read(key)?.map(|(value, _)| value).into())
    }

    fn mget(&self, keys: &[String]) -> Result<Vec<CacheSlot<String>>, CacheError> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| lmdb_error("mget", "", e))?;
        let now = now_millis();
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let slot = match self
                .db
                .get(&rtxn, key.as_bytes())
                .map_err(|e| lmdb_error("mget", key, e))?
            {
                Some(bytes) => decode_record(key, bytes, now)?.map(|(v, _)| v).into(),
                None => CacheSlot::Miss,
            };
            out.push(slot);
        }
        Ok(out)
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let expires_at = ttl.map(ttl_millis).unwrap_or(0);
        let mut wtxn = self.env.write_txn().map_err(|e| lmdb_error("set", key, e))?;
        self.db
            .put(&mut wtxn, key.as_bytes(), &encode_record(value, expires_at))
            .map_err(|e| lmdb_error("set", key, e))?;
        wtxn.commit().map_err(|e| lmdb_error("set", key, e))
    }

    fn set_nx(&self, key: &str, value: &str) -> Result<bool, CacheError> {
        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| lmdb_error("setnx", key, e))?;
        let live = match self
            .db
            .get(&wtxn, key.as_bytes())
            .map_err(|e| lmdb_error("setnx", key, e))?
        {
            Some(bytes) => decode_record(key, bytes, now_millis())?.is_some(),
            None => false,
        };
        if live {
            return Ok(false);
        }
        self.db
            .put(&mut wtxn, key.as_bytes(), &encode_record(value, 0))
            .map_err(|e| lmdb_error("setnx", key, e))?;
        wtxn.commit().map_err(|e| lmdb_error("setnx", key, e))?;
        Ok(true)
    }

    fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| lmdb_error("expire", key, e))?;
        let current = match self
            .db
            .get(&wtxn, key.as_bytes())
            .map_err(|e| lmdb_error("expire", key, e))?
        {
            Some(bytes) => decode_record(key, bytes, now_millis())?,
            None => None,
        };
        let Some((value, _)) = current else {
            return Ok(false);
        };
        self.db
            .put(
                &mut wtxn,
                key.as_bytes(),
                &encode_record(&value, ttl_millis(ttl)),
            )
            .map_err(|e| lmdb_error("expire", key, e))?;
        wtxn.commit().map_err(|e| lmdb_error("expire", key, e))?;
        Ok(true)
    }

    fn del(&self, keys: &[String]) -> Result<usize, CacheError> {
        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| lmdb_error("del", "", e))?;
        let mut deleted = 0;
        for key in keys {
            if self
                .db
                .delete(&mut wtxn, key.as_bytes())
                .map_err(|e| lmdb_error("del", key, e))?
            {
                deleted += 1;
            }
        }
        wtxn.commit().map_err(|e| lmdb_error("del", "", e))?;
        Ok(deleted)
    }
}

/// Build the transport selected by `settings`. `Disabled` yields `None`.
///
/// A `Memory` transport is private to the returned handle; managers only
/// share it when they are given the same `Arc`.
pub fn transport_from_settings(
    settings: &CacheSettings,
) -> Result<Option<Arc<dyn CacheTransport>>, CacheError> {
    let transport: Arc<dyn CacheTransport> = match &settings.transport {
        TransportSettings::Memory => Arc::new(MemoryTransport::new()),
        TransportSettings::Lmdb { path, map_size_mb } => {
            Arc::new(LmdbTransport::open(path, *map_size_mb)?)
        }
        TransportSettings::Disabled => return Ok(None),
    };
    Ok(Some(transport))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn exercise(transport: &dyn CacheTransport) {
        assert_eq!(transport.get("a").unwrap(), CacheSlot::Miss);

        transport.set("a", "", None).unwrap();
        assert_eq!(transport.get("a").unwrap(), CacheSlot::Hit(String::new()));
        assert!(transport.exists("a").unwrap());

        assert!(!transport.set_nx("a", "other").unwrap());
        assert!(transport.set_nx("b", "2").unwrap());

        let slots = transport
            .mget(&["a".to_string(), "missing".to_string(), "b".to_string()])
            .unwrap();
        assert_eq!(
            slots,
            vec![
                CacheSlot::Hit(String::new()),
                CacheSlot::Miss,
                CacheSlot::Hit("2".to_string())
            ]
        );

        assert!(transport.expire("b", Duration::from_secs(60)).unwrap());
        assert!(!transport.expire("missing", Duration::from_secs(60)).unwrap());

        assert_eq!(
            transport
                .del(&["a".to_string(), "b".to_string(), "missing".to_string()])
                .unwrap(),
            2
        );
        assert!(!transport.exists("a").unwrap());
    }

    #[test]
    fn test_memory_transport_contract() {
        exercise(&MemoryTransport::new());
    }

    #[test]
    fn test_lmdb_transport_contract() {
        let dir = TempDir::new().unwrap();
        let transport = LmdbTransport::open(dir.path(), 8).unwrap();
        exercise(&transport);
    }

    #[test]
    fn test_memory_ttl_expires() {
        let transport = MemoryTransport::new();
        transport
            .set("k", "v", Some(Duration::from_millis(0)))
            .unwrap();
        assert!(transport.get("k").unwrap().is_miss());
        assert!(transport.set_nx("k", "fresh").unwrap());
        assert!(transport.ttl("k").is_none());
        transport.expire("k", Duration::from_secs(30)).unwrap();
        assert!(transport.ttl("k").is_some());
    }

    fn stored(transport: &MemoryTransport) -> usize {
        transport.entries.read().unwrap().len()
    }

    #[test]
    fn test_memory_purge_drops_expired_entries() {
        let transport = MemoryTransport::new();
        transport.set("gone", "v", Some(Duration::ZERO)).unwrap();
        transport.set("kept", "v", None).unwrap();
        assert_eq!(stored(&transport), 2);
        assert_eq!(transport.purge_expired(), 1);
        assert_eq!(stored(&transport), 1);
        assert!(transport.exists("kept").unwrap());
    }

    #[test]
    fn test_memory_writes_sweep_expired_entries() {
        let transport = MemoryTransport::new();
        for i in 0..PRUNE_INTERVAL - 1 {
            transport
                .set(&format!("short:{}", i), "v", Some(Duration::ZERO))
                .unwrap();
        }
        assert_eq!(stored(&transport), PRUNE_INTERVAL - 1);
        // The next write triggers a sweep before inserting.
        transport.set("long", "v", None).unwrap();
        assert_eq!(stored(&transport), 1);
        assert_eq!(transport.len(), 1);
    }

    #[test]
    fn test_lmdb_expired_record_is_miss() {
        let dir = TempDir::new().unwrap();
        let transport = LmdbTransport::open(dir.path(), 8).unwrap();
        transport
            .set("k", "v", Some(Duration::from_millis(0)))
            .unwrap();
        assert!(transport.get("k").unwrap().is_miss());
        assert!(transport.set_nx("k", "fresh").unwrap());
        assert_eq!(transport.get("k").unwrap(), CacheSlot::Hit("fresh".to_string()));
    }

    #[test]
    fn test_transport_from_settings() {
        let mut settings = CacheSettings::default();
        settings.transport = TransportSettings::Disabled;
        assert!(transport_from_settings(&settings).unwrap().is_none());

        let dir = TempDir::new().unwrap();
        settings.transport = TransportSettings::Lmdb {
            path: dir.path().join("cache"),
            map_size_mb: 8,
        };
        let transport = transport_from_settings(&settings).unwrap().unwrap();
        transport.set("k", "v", None).unwrap();
        assert!(transport.exists("k").unwrap());
    }
}
