//! Process-local cache for master data.
//!
//! Entries live in the registry's [`LocalStore`] under `<table>##<key>`.
//! Validity is tied to a version marker held in the shared transport under
//! [`VERSION_MARKER_KEY`]: any process that writes master data deletes the
//! marker, and every other process drops its local entries the next time it
//! syncs and finds a newer marker.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use rowcache_core::{
    decode_value, encode_value, CacheError, CacheSlot, Entity, Key, LocalStore, Registry,
};

use crate::transport::CacheTransport;

/// Transport key holding the nanosecond timestamp of the current version.
pub const VERSION_MARKER_KEY: &str = "localcacheTime";

/// Local cache entry key.
pub fn local_key(table: &str, key: &Key) -> String {
    format!("{}##{}", table, key.render())
}

/// Local master data cache bound to a registry and, optionally, the shared
/// transport carrying the version marker.
#[derive(Clone)]
pub struct LocalCache {
    registry: Arc<Registry>,
    transport: Option<Arc<dyn CacheTransport>>,
}

impl LocalCache {
    pub fn new(registry: Arc<Registry>, transport: Option<Arc<dyn CacheTransport>>) -> Self {
        Self {
            registry,
            transport,
        }
    }

    fn store(&self) -> &LocalStore {
        self.registry.local_store()
    }

    pub fn version(&self) -> i64 {
        self.store().version()
    }

    pub fn len(&self) -> usize {
        self.store().len()
    }

    pub fn is_empty(&self) -> bool {
        self.store().is_empty()
    }

    /// Cached row for `key`. Undecodable entries read as misses.
    pub fn get<E: Entity>(&self, key: &Key) -> CacheSlot<E> {
        let entry_key = local_key(E::TABLE, key);
        match self.store().get(&entry_key) {
            CacheSlot::Hit(raw) => match decode_value(&entry_key, &raw) {
                Ok(entity) => CacheSlot::Hit(entity),
                Err(e) => {
                    warn!(key = %entry_key, error = %e, "dropping undecodable local cache entry");
                    CacheSlot::Miss
                }
            },
            CacheSlot::Miss => CacheSlot::Miss,
        }
    }

    pub fn put<E: Entity>(&self, entity: &E) -> Result<(), CacheError> {
        let entry_key = local_key(E::TABLE, &entity.key());
        let raw = encode_value(&entry_key, entity)?;
        self.store().set(entry_key, raw);
        Ok(())
    }

    /// Adopt the shared version marker, creating it if missing. Returns true
    /// if local entries were dropped.
    pub fn sync_version(&self) -> Result<bool, CacheError> {
        let Some(transport) = &self.transport else {
            return Ok(false);
        };
        let marker = match transport.get(VERSION_MARKER_KEY)? {
            CacheSlot::Hit(raw) => decode_value::<i64>(VERSION_MARKER_KEY, &raw)?,
            CacheSlot::Miss => 0,
        };
        let marker = if marker == 0 {
            let now = Utc::now()
                .timestamp_nanos_opt()
                .unwrap_or_else(|| Utc::now().timestamp_micros().saturating_mul(1_000));
            if transport.set_nx(VERSION_MARKER_KEY, &encode_value(VERSION_MARKER_KEY, &now)?)? {
                now
            } else {
                // Another process created it first.
                match transport.get(VERSION_MARKER_KEY)? {
                    CacheSlot::Hit(raw) => decode_value::<i64>(VERSION_MARKER_KEY, &raw)?,
                    CacheSlot::Miss => now,
                }
            }
        } else {
            marker
        };
        let dropped = self.store().adopt_version(marker);
        if dropped {
            debug!(version = marker, "local cache moved to new version");
        }
        Ok(dropped)
    }

    /// Invalidate master data everywhere: delete the shared marker and drop
    /// this process's entries now.
    pub fn invalidate(&self) -> Result<(), CacheError> {
        self.store().clear();
        if let Some(transport) = &self.transport {
            transport.del(&[VERSION_MARKER_KEY.to_string()])?;
        }
        debug!("local cache invalidated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use rowcache_core::{ColumnKind, EntitySchema};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Grade {
        id: i64,
        label: String,
    }

    impl Entity for Grade {
        const TABLE: &'static str = "grade";

        fn schema() -> EntitySchema {
            EntitySchema::new()
                .key("id", ColumnKind::Integer)
                .field("label", ColumnKind::Text)
        }

        fn key(&self) -> Key {
            Key::from(self.id)
        }

        fn is_master() -> bool {
            true
        }
    }

    fn grade(id: i64) -> Grade {
        Grade {
            id,
            label: format!("g{}", id),
        }
    }

    #[test]
    fn test_local_key_format() {
        assert_eq!(local_key("grade", &Key::from(3)), "grade##3");
    }

    #[test]
    fn test_put_and_get() {
        let cache = LocalCache::new(Arc::new(Registry::new()), None);
        cache.put(&grade(1)).unwrap();
        assert_eq!(cache.get::<Grade>(&Key::from(1)), CacheSlot::Hit(grade(1)));
        assert!(cache.get::<Grade>(&Key::from(2)).is_miss());
    }

    #[test]
    fn test_sync_creates_marker_once() {
        let transport: Arc<dyn CacheTransport> = Arc::new(MemoryTransport::new());
        let cache = LocalCache::new(Arc::new(Registry::new()), Some(Arc::clone(&transport)));
        cache.sync_version().unwrap();
        let version = cache.version();
        assert!(version > 0);
        assert!(transport.exists(VERSION_MARKER_KEY).unwrap());

        cache.put(&grade(1)).unwrap();
        assert!(!cache.sync_version().unwrap());
        assert_eq!(cache.version(), version);
        assert!(cache.get::<Grade>(&Key::from(1)).is_hit());
    }

    #[test]
    fn test_invalidation_reaches_other_registry() {
        let transport: Arc<dyn CacheTransport> = Arc::new(MemoryTransport::new());
        let writer = LocalCache::new(Arc::new(Registry::new()), Some(Arc::clone(&transport)));
        let reader = LocalCache::new(Arc::new(Registry::new()), Some(Arc::clone(&transport)));
        writer.sync_version().unwrap();
        reader.sync_version().unwrap();
        reader.put(&grade(1)).unwrap();

        writer.invalidate().unwrap();
        assert!(!transport.exists(VERSION_MARKER_KEY).unwrap());
        // Not yet synced: the reader may still serve its old copy.
        assert!(reader.get::<Grade>(&Key::from(1)).is_hit());

        assert!(reader.sync_version().unwrap());
        assert!(reader.get::<Grade>(&Key::from(1)).is_miss());
    }

    #[test]
    fn test_invalidate_without_transport_clears_entries() {
        let cache = LocalCache::new(Arc::new(Registry::new()), None);
        cache.put(&grade(1)).unwrap();
        cache.invalidate().unwrap();
        assert!(cache.is_empty());
        assert!(!cache.sync_version().unwrap());
    }
}
