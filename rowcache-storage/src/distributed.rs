//! Distributed cache for transactional data.
//!
//! A typed view over a [`CacheTransport`]: entity rows under
//! `<table>:<key>` and master key sets under `mastermodel_keyset::<table>`,
//! all written with the configured TTL.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use rowcache_core::{decode_value, encode_value, CacheError, CacheSlot, Entity, Key};

use crate::transport::CacheTransport;

const MASTER_KEYSET_PREFIX: &str = "mastermodel_keyset::";

/// Distributed cache entry key.
pub fn entity_key(table: &str, key: &Key) -> String {
    format!("{}:{}", table, key.render())
}

/// Key under which the full key set of a master table is cached.
pub fn keyset_key(table: &str) -> String {
    format!("{}{}", MASTER_KEYSET_PREFIX, table)
}

#[derive(Clone)]
pub struct DistributedCache {
    transport: Arc<dyn CacheTransport>,
    ttl: Duration,
}

impl DistributedCache {
    pub fn new(transport: Arc<dyn CacheTransport>, ttl: Duration) -> Self {
        Self { transport, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn set_ttl(&mut self, ttl: Duration) {
        self.ttl = ttl;
    }

    pub fn transport(&self) -> &Arc<dyn CacheTransport> {
        &self.transport
    }

    /// One slot per key, in key order.
    pub fn get_many<E: Entity>(&self, keys: &[Key]) -> Result<Vec<CacheSlot<E>>, CacheError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let cache_keys: Vec<String> = keys.iter().map(|k| entity_key(E::TABLE, k)).collect();
        let raw = self.transport.mget(&cache_keys)?;
        cache_keys
            .iter()
            .zip(raw)
            .map(|(cache_key, slot)| match slot {
                CacheSlot::Hit(value) => decode_value(cache_key, &value).map(CacheSlot::Hit),
                CacheSlot::Miss => Ok(CacheSlot::Miss),
            })
            .collect()
    }

    /// Overwrite the cached row.
    pub fn put<E: Entity>(&self, entity: &E) -> Result<(), CacheError> {
        let cache_key = entity_key(E::TABLE, &entity.key());
        let value = encode_value(&cache_key, entity)?;
        self.transport.set(&cache_key, &value, None)?;
        self.transport.expire(&cache_key, self.ttl)?;
        debug!(key = %cache_key, "cache overwrite");
        Ok(())
    }

    /// Store the row only if no entry exists, then refresh its TTL.
    pub fn put_if_absent<E: Entity>(&self, entity: &E) -> Result<(), CacheError> {
        let cache_key = entity_key(E::TABLE, &entity.key());
        let value = encode_value(&cache_key, entity)?;
        self.transport.set_nx(&cache_key, &value)?;
        self.transport.expire(&cache_key, self.ttl)?;
        Ok(())
    }

    pub fn evict(&self, cache_keys: &[String]) -> Result<usize, CacheError> {
        if cache_keys.is_empty() {
            return Ok(0);
        }
        debug!(keys = ?cache_keys, "cache evict");
        self.transport.del(cache_keys)
    }

    /// Cached key set of a master table.
    pub fn keyset(&self, table: &str) -> Result<CacheSlot<Vec<Key>>, CacheError> {
        let cache_key = keyset_key(table);
        match self.transport.get(&cache_key)? {
            CacheSlot::Hit(raw) => decode_value(&cache_key, &raw).map(CacheSlot::Hit),
            CacheSlot::Miss => Ok(CacheSlot::Miss),
        }
    }

    pub fn put_keyset(&self, table: &str, keys: &[Key]) -> Result<(), CacheError> {
        let cache_key = keyset_key(table);
        let value = encode_value(&cache_key, keys)?;
        self.transport.set(&cache_key, &value, None)?;
        self.transport.expire(&cache_key, self.ttl)?;
        Ok(())
    }

    pub fn evict_keysets<'a, I: IntoIterator<Item = &'a str>>(
        &self,
        tables: I,
    ) -> Result<usize, CacheError> {
        let keys: Vec<String> = tables.into_iter().map(keyset_key).collect();
        self.evict(&keys)
    }
}
