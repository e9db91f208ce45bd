//! Model manager.
//!
//! [`ModelManager`] is the façade collaborators use for one unit of work. It
//! owns the relational connection through a [`TransactionCoordinator`],
//! memoizes every row it hands out in a [`RequestScope`], stages writes in a
//! [`WriteBatch`], and reads through three cache tiers before the store:
//!
//! 1. request scope (identity-stable handles)
//! 2. local cache for master tables, distributed cache for the rest
//! 3. the relational store, back-filling the tiers above
//!
//! A manager is single-owner and not `Send`; run one per request.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use rowcache_core::{
    CacheError, CacheSlot, ColumnValue, Descriptor, EncodedColumn, Entity, FieldDef, Key,
    Registry, RowcacheConfig, RowcacheError, RowcacheResult, StorageError, UsageError, WriteOp,
};

use crate::batch::{
    FieldSelection, PendingFlush, SaveOptions, StagedEntity, StagedSave, TaskResult, WriteBatch,
};
use crate::distributed::{entity_key, DistributedCache};
use crate::executor::{SqlExecutor, SqliteExecutor};
use crate::local::LocalCache;
use crate::scoped::{RequestScope, Shared};
use crate::sql;
use crate::transaction::TransactionCoordinator;
use crate::transport::{transport_from_settings, CacheTransport};

/// Counters of where reads were served from.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TierStats {
    pub request_hits: usize,
    pub local_hits: usize,
    pub distributed_hits: usize,
    pub store_queries: usize,
}

/// What a flushed save did to the row, for cache synchronisation.
enum Written {
    /// The full row is now known; cache it.
    Saved,
    /// The stored row is not fully known (a column subset was written, or
    /// nothing matched); drop the cached copy.
    Evict,
}

/// Cache work collected by a flush. `puts` index into the flushed saves.
#[derive(Default)]
struct CacheSync {
    puts: Vec<usize>,
    evictions: Vec<String>,
    master_tables: BTreeSet<&'static str>,
}

pub struct ModelManager<X: SqlExecutor = SqliteExecutor> {
    tx: TransactionCoordinator<X>,
    registry: Arc<Registry>,
    local: LocalCache,
    distributed: Option<DistributedCache>,
    scope: RequestScope,
    batch: WriteBatch,
    stats: TierStats,
}

impl ModelManager<SqliteExecutor> {
    /// Open the store `store_name` from `config`, with the cache transport it
    /// selects.
    pub fn open(
        config: &RowcacheConfig,
        store_name: &str,
        registry: Arc<Registry>,
    ) -> RowcacheResult<Self> {
        let transport = transport_from_settings(&config.cache)?;
        Self::open_with_transport(config, store_name, registry, transport)
    }

    /// Like [`open`](Self::open) but with a caller-supplied transport, so
    /// several managers can share one.
    pub fn open_with_transport(
        config: &RowcacheConfig,
        store_name: &str,
        registry: Arc<Registry>,
        transport: Option<Arc<dyn CacheTransport>>,
    ) -> RowcacheResult<Self> {
        let settings = config.store(store_name)?;
        let executor = SqliteExecutor::open(settings)?;
        Ok(Self::new(executor, registry, transport)?.with_ttl(config.cache.ttl()))
    }
}

impl<X: SqlExecutor> ModelManager<X> {
    pub fn new(
        executor: X,
        registry: Arc<Registry>,
        transport: Option<Arc<dyn CacheTransport>>,
    ) -> RowcacheResult<Self> {
        let local = LocalCache::new(Arc::clone(&registry), transport.clone());
        local.sync_version()?;
        let distributed = transport.map(|t| {
            DistributedCache::new(t, Duration::from_secs(rowcache_core::DEFAULT_CACHE_TTL_SECS))
        });
        Ok(Self {
            tx: TransactionCoordinator::new(executor),
            registry,
            local,
            distributed,
            scope: RequestScope::new(),
            batch: WriteBatch::new(),
            stats: TierStats::default(),
        })
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.set_ttl(ttl);
        self
    }

    pub fn set_ttl(&mut self, ttl: Duration) {
        if let Some(dist) = &mut self.distributed {
            dist.set_ttl(ttl);
        }
    }

    /// Distributed cache TTL, if a distributed tier is configured.
    pub fn ttl(&self) -> Option<Duration> {
        self.distributed.as_ref().map(DistributedCache::ttl)
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Begin a transaction, first adopting any newer master data version.
    ///
    /// # Panics
    ///
    /// Panics if a transaction is already active on this manager.
    pub fn start_transaction(&mut self) -> RowcacheResult<()> {
        self.local.sync_version()?;
        self.tx.begin()?;
        Ok(())
    }

    /// Commit. Staged but unflushed writes are discarded either way.
    pub fn commit_transaction(&mut self) -> RowcacheResult<()> {
        let result = self.tx.commit();
        self.scope.clear();
        self.batch.clear();
        Ok(result?)
    }

    pub fn rollback_transaction(&mut self) -> RowcacheResult<()> {
        let result = self.tx.rollback();
        self.scope.clear();
        self.batch.clear();
        Ok(result?)
    }

    pub fn is_writable(&self) -> bool {
        self.tx.is_active()
    }

    /// Roll back anything open and release the connection.
    pub fn close(self) -> RowcacheResult<X> {
        Ok(self.tx.close()?)
    }

    // ------------------------------------------------------------------
    // Metadata and accessors
    // ------------------------------------------------------------------

    pub fn table_name<E: Entity>(&self) -> &'static str {
        self.registry.describe::<E>().table()
    }

    pub fn descriptor<E: Entity>(&self) -> Arc<Descriptor> {
        self.registry.describe::<E>()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn stats(&self) -> TierStats {
        self.stats
    }

    pub fn executor(&self) -> &X {
        self.tx.executor()
    }

    pub fn executor_mut(&mut self) -> &mut X {
        self.tx.executor_mut()
    }

    pub fn scope(&self) -> &RequestScope {
        &self.scope
    }

    pub fn batch(&self) -> &WriteBatch {
        &self.batch
    }

    pub fn local_cache(&self) -> &LocalCache {
        &self.local
    }

    pub fn distributed_cache(&self) -> Option<&DistributedCache> {
        self.distributed.as_ref()
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// First row matching `key`, full or partial.
    pub fn get_model<E: Entity>(&mut self, key: impl Into<Key>) -> RowcacheResult<Option<Shared<E>>> {
        Ok(self.get_models::<E>(&[key.into()])?.into_iter().next())
    }

    /// Every row matching any of `keys`. Keys may be partial composite keys;
    /// keys longer than the table key match nothing. Output order is
    /// unspecified; each row appears once.
    pub fn get_models<E: Entity>(&mut self, keys: &[Key]) -> RowcacheResult<Vec<Shared<E>>> {
        let descriptor = self.registry.describe::<E>();
        let key_len = descriptor.key_len();
        let mut found = Found::default();

        let mut pending: BTreeMap<usize, Vec<Key>> = BTreeMap::new();
        let mut queued = HashSet::new();
        for key in keys {
            if key.is_empty() {
                return Err(UsageError::EmptyKey {
                    table: E::TABLE.to_string(),
                }
                .into());
            }
            if key.len() > key_len {
                debug!(table = E::TABLE, key = %key, "key longer than the table key matches nothing");
                continue;
            }
            let hits = self.scope.get_many::<E>(std::slice::from_ref(key));
            if !hits.is_empty() {
                self.stats.request_hits += hits.len();
                found.extend(hits);
                continue;
            }
            if queued.insert(key.render()) {
                pending.entry(key.len()).or_default().push(key.clone());
            }
        }

        if let Some(full) = pending.remove(&key_len) {
            let misses = self.read_cache_tier::<E>(full, &mut found)?;
            if !misses.is_empty() {
                pending.insert(key_len, misses);
            }
        }

        for (len, group) in pending {
            let stmt = sql::select_by_keys(&descriptor, &group);
            let rows = self.tx.executor_mut().query(&stmt)?;
            self.stats.store_queries += 1;
            debug!(table = E::TABLE, keys = group.len(), rows = rows.len(), tier = "store", "read");
            for row in rows {
                let entity = descriptor.decode_row::<E>(&row)?;
                self.back_fill(&entity, len == key_len)?;
                found.push(self.scope.save(entity));
            }
        }

        Ok(found.into_vec())
    }

    /// Serve full keys from the local or distributed cache. Returns the
    /// keys that missed.
    fn read_cache_tier<E: Entity>(
        &mut self,
        keys: Vec<Key>,
        found: &mut Found<E>,
    ) -> RowcacheResult<Vec<Key>> {
        let mut misses = Vec::new();
        if E::is_master() {
            for key in keys {
                match self.local.get::<E>(&key) {
                    CacheSlot::Hit(entity) => {
                        self.stats.local_hits += 1;
                        found.push(self.scope.save(entity));
                    }
                    CacheSlot::Miss => misses.push(key),
                }
            }
            debug!(table = E::TABLE, misses = misses.len(), tier = "local", "read");
            return Ok(misses);
        }

        let Some(dist) = &self.distributed else {
            return Ok(keys);
        };
        let slots = dist.get_many::<E>(&keys)?;
        for (key, slot) in keys.into_iter().zip(slots) {
            match slot {
                CacheSlot::Hit(entity) => {
                    self.stats.distributed_hits += 1;
                    found.push(self.scope.save(entity));
                }
                CacheSlot::Miss => misses.push(key),
            }
        }
        debug!(table = E::TABLE, misses = misses.len(), tier = "distributed", "read");
        Ok(misses)
    }

    fn back_fill<E: Entity>(&self, entity: &E, full_key: bool) -> RowcacheResult<()> {
        if E::is_master() {
            self.local.put(entity)?;
        } else if full_key {
            if let Some(dist) = &self.distributed {
                dist.put_if_absent(entity)?;
            }
        }
        Ok(())
    }

    /// Every row of a master table. Without `reload`, the cached key set is
    /// used when present and rows are read through the tiers.
    pub fn get_master_model_all<E: Entity>(&mut self, reload: bool) -> RowcacheResult<Vec<Shared<E>>> {
        let cached = match &self.distributed {
            Some(dist) if !reload => dist.keyset(E::TABLE)?,
            _ => CacheSlot::Miss,
        };
        if let CacheSlot::Hit(keys) = cached {
            debug!(table = E::TABLE, keys = keys.len(), "master key set hit");
            return self.get_models::<E>(&keys);
        }

        let descriptor = self.registry.describe::<E>();
        let rows = self.tx.executor_mut().query(&sql::select_all(&descriptor))?;
        self.stats.store_queries += 1;
        let mut keys = Vec::with_capacity(rows.len());
        let mut found = Found::default();
        for row in rows {
            let entity = descriptor.decode_row::<E>(&row)?;
            if E::is_master() {
                self.local.put(&entity)?;
            }
            keys.push(entity.key());
            found.push(self.scope.save(entity));
        }
        if let Some(dist) = &self.distributed {
            dist.put_keyset(E::TABLE, &keys)?;
        }
        Ok(found.into_vec())
    }

    // ------------------------------------------------------------------
    // Staging
    // ------------------------------------------------------------------

    /// Stage a save of `entity` and return its request-scoped handle.
    pub fn cached_save<E: Entity>(&mut self, entity: E, options: SaveOptions) -> RowcacheResult<Shared<E>> {
        let key = entity.key();
        let identity = self.prepare_save::<E>(&key, &options)?;
        let shared = if key.is_zero() {
            Rc::new(RefCell::new(entity))
        } else {
            self.scope.save(entity)
        };
        self.batch
            .stage_save(identity, Box::new(Rc::clone(&shared)), options)?;
        Ok(shared)
    }

    /// Stage a save of a handle obtained from this manager or built by the
    /// caller. Returns the canonical handle for its identity.
    pub fn cached_save_shared<E: Entity>(
        &mut self,
        shared: &Shared<E>,
        options: SaveOptions,
    ) -> RowcacheResult<Shared<E>> {
        let key = shared.borrow().key();
        let identity = self.prepare_save::<E>(&key, &options)?;
        let canonical = if key.is_zero() {
            Rc::clone(shared)
        } else {
            self.scope.store_mut::<E>().save_shared(shared)
        };
        self.batch
            .stage_save(identity, Box::new(Rc::clone(&canonical)), options)?;
        Ok(canonical)
    }

    fn prepare_save<E: Entity>(&mut self, key: &Key, options: &SaveOptions) -> RowcacheResult<String> {
        self.registry
            .describe::<E>()
            .resolve_fields(options.field_names())?;
        let identity = self.batch.identity(E::TABLE, key);
        self.batch.check_save(&identity, options)?;
        Ok(identity)
    }

    /// Stage a delete of `entity`. Rows without an assigned key were never
    /// stored and are ignored.
    pub fn set_delete<E: Entity>(&mut self, entity: E) -> RowcacheResult<()> {
        self.set_delete_shared(&Rc::new(RefCell::new(entity)))
    }

    pub fn set_delete_shared<E: Entity>(&mut self, shared: &Shared<E>) -> RowcacheResult<()> {
        let key = shared.borrow().key();
        if key.is_zero() {
            debug!(table = E::TABLE, "ignoring delete of unsaved row");
            return Ok(());
        }
        let identity = self.batch.identity(E::TABLE, &key);
        self.batch.stage_delete(identity, Box::new(Rc::clone(shared)))
    }

    /// Run `task` once after the next successful flush, after every
    /// per-row callback.
    pub fn add_post_flush_task<F>(&mut self, task: F)
    where
        F: FnOnce() -> TaskResult + 'static,
    {
        self.batch.add_task(Box::new(task));
    }

    // ------------------------------------------------------------------
    // Flush
    // ------------------------------------------------------------------

    /// Write every staged save and delete inside the open transaction, run
    /// callbacks and post-flush tasks, then bring the cache tiers in line.
    ///
    /// The batch is cleared only once the writes, callbacks and tasks have
    /// all succeeded. On failure the staged intents go back into the batch;
    /// callbacks and tasks that already ran are not kept. An error satisfying
    /// [`RowcacheError::is_stale_cache`] means the rows were written and only
    /// cache synchronisation failed.
    pub fn write_all(&mut self) -> RowcacheResult<()> {
        if !self.is_writable() {
            return Err(UsageError::NotWritable.into());
        }
        let mut pending = self.batch.take();
        debug!(
            saves = pending.saves.len(),
            deletes = pending.deletes.len(),
            tasks = pending.tasks.len(),
            "flush"
        );

        let sync = match self.flush(&mut pending) {
            Ok(sync) => sync,
            Err(e) => {
                warn!(error = %e, "flush failed, staged writes kept");
                self.batch.restore(pending);
                return Err(e);
            }
        };
        self.scope.clear();

        self.sync_caches(&pending.saves, &sync).map_err(|e| {
            warn!(error = %e, "cache synchronisation after flush failed");
            RowcacheError::from(CacheError::PostWriteSync {
                reason: e.to_string(),
            })
        })
    }

    /// Relational writes, per-row callbacks, then post-flush tasks. Callbacks
    /// and tasks are taken out of `pending` as they run.
    fn flush(&mut self, pending: &mut PendingFlush) -> RowcacheResult<CacheSync> {
        let mut sync = CacheSync::default();

        for (index, save) in pending.saves.iter_mut().enumerate() {
            let descriptor = save.entity.descriptor(&self.registry);
            let written = self.write_row(
                &descriptor,
                save.entity.as_ref(),
                save.fields.as_ref(),
                save.force_insert,
                save.force_update,
            )?;
            let mut callbacks = std::mem::take(&mut save.callbacks).into_iter();
            while let Some(callback) = callbacks.next() {
                if let Err(e) = callback() {
                    save.callbacks = callbacks.collect();
                    return Err(StorageError::CallbackFailed {
                        identity: save.identity.clone(),
                        reason: e.to_string(),
                    }
                    .into());
                }
            }
            if save.entity.is_master() {
                sync.master_tables.insert(save.entity.table());
                continue;
            }
            match written {
                Written::Saved => sync.puts.push(index),
                Written::Evict => sync
                    .evictions
                    .push(entity_key(save.entity.table(), &save.entity.key())),
            }
        }

        for delete in &pending.deletes {
            let descriptor = delete.entity.descriptor(&self.registry);
            let key = delete.entity.key();
            debug!(identity = %delete.identity, "delete");
            self.tx
                .executor_mut()
                .execute(&sql::delete_by_key(&descriptor, &key))
                .map_err(write_failed(WriteOp::Delete, &key))?;
            if delete.entity.is_master() {
                sync.master_tables.insert(delete.entity.table());
            } else {
                sync.evictions.push(entity_key(delete.entity.table(), &key));
            }
        }

        let mut tasks = std::mem::take(&mut pending.tasks).into_iter();
        while let Some(task) = tasks.next() {
            if let Err(e) = task() {
                pending.tasks = tasks.collect();
                return Err(StorageError::CallbackFailed {
                    identity: "post-flush task".to_string(),
                    reason: e.to_string(),
                }
                .into());
            }
        }
        Ok(sync)
    }

    fn write_row(
        &mut self,
        descriptor: &Descriptor,
        entity: &dyn StagedEntity,
        fields: Option<&FieldSelection>,
        force_insert: bool,
        force_update: bool,
    ) -> RowcacheResult<Written> {
        let key = entity.key();
        if force_insert {
            self.insert_row(descriptor, entity, &key)?;
            return Ok(Written::Saved);
        }
        if let Some(FieldSelection::Subset(names)) = fields {
            let columns = entity.encode(descriptor, &|f: &FieldDef| {
                names.iter().any(|n| n == f.name)
            })?;
            self.update_row(descriptor, &columns, &key)?;
            return Ok(Written::Evict);
        }
        if force_update {
            let columns = entity.encode(descriptor, &|f: &FieldDef| !f.is_key)?;
            if self.update_row(descriptor, &columns, &key)? == 0 {
                debug!(table = entity.table(), key = %key.render(), "force update matched no row");
                return Ok(Written::Evict);
            }
            return Ok(Written::Saved);
        }
        if key.is_zero() {
            self.insert_row(descriptor, entity, &key)?;
            return Ok(Written::Saved);
        }
        if descriptor.has_custom_codec() {
            // Custom write expressions rule out INSERT OR REPLACE.
            let rows = self
                .tx
                .executor_mut()
                .query(&sql::count_by_key(descriptor, &key))
                .map_err(write_failed(WriteOp::Count, &key))?;
            let exists = rows
                .first()
                .and_then(|r| r.first())
                .and_then(ColumnValue::as_i64)
                .unwrap_or(0)
                > 0;
            if exists {
                let columns = entity.encode(descriptor, &|f: &FieldDef| !f.is_key)?;
                self.update_row(descriptor, &columns, &key)?;
            } else {
                self.insert_row(descriptor, entity, &key)?;
            }
            return Ok(Written::Saved);
        }
        let columns = entity.encode(descriptor, &|_: &FieldDef| true)?;
        self.tx
            .executor_mut()
            .execute(&sql::replace(descriptor, &columns))
            .map_err(write_failed(WriteOp::Replace, &key))?;
        Ok(Written::Saved)
    }

    /// INSERT, omitting zero key columns and handing the generated row id
    /// back to the entity.
    fn insert_row(
        &mut self,
        descriptor: &Descriptor,
        entity: &dyn StagedEntity,
        key: &Key,
    ) -> RowcacheResult<()> {
        let generated: Vec<&'static str> = descriptor
            .key_fields()
            .zip(key.parts())
            .filter(|(_, part)| part.is_zero())
            .map(|(f, _)| f.name)
            .collect();
        let columns = entity.encode(descriptor, &|f: &FieldDef| !generated.contains(&f.name))?;
        let row_id = self
            .tx
            .executor_mut()
            .insert(&sql::insert(descriptor, &columns))
            .map_err(write_failed(WriteOp::Insert, key))?;
        match row_id {
            Some(id) if !generated.is_empty() => entity.assign_generated_key(id),
            _ => {}
        }
        Ok(())
    }

    fn update_row(
        &mut self,
        descriptor: &Descriptor,
        columns: &[(&FieldDef, EncodedColumn)],
        key: &Key,
    ) -> RowcacheResult<usize> {
        if columns.is_empty() {
            return Ok(0);
        }
        let matched = self
            .tx
            .executor_mut()
            .execute(&sql::update_columns(descriptor, columns, key))
            .map_err(write_failed(WriteOp::Update, key))?;
        Ok(matched)
    }

    fn sync_caches(&self, saves: &[StagedSave], sync: &CacheSync) -> Result<(), CacheError> {
        if let Some(dist) = &self.distributed {
            for save in sync.puts.iter().filter_map(|&i| saves.get(i)) {
                if !save.entity.key().is_zero() {
                    save.entity.cache_put(dist)?;
                }
            }
            dist.evict(&sync.evictions)?;
            if !sync.master_tables.is_empty() {
                dist.evict_keysets(sync.master_tables.iter().copied())?;
            }
        }
        if !sync.master_tables.is_empty() {
            debug!(tables = ?sync.master_tables, "master data written, invalidating local cache");
            self.local.invalidate()?;
        }
        Ok(())
    }
}

/// Turn an executor failure into a write failure naming the row.
fn write_failed(op: WriteOp, key: &Key) -> impl FnOnce(StorageError) -> StorageError {
    let rendered = key.render();
    move |e| match e {
        StorageError::QueryFailed { table, reason } => StorageError::WriteFailed {
            table,
            op,
            key: rendered,
            reason,
        },
        other => other,
    }
}

/// Read results, each handle once.
struct Found<E> {
    rows: Vec<Shared<E>>,
    seen: HashSet<*const RefCell<E>>,
}

impl<E> Default for Found<E> {
    fn default() -> Self {
        Self {
            rows: Vec::new(),
            seen: HashSet::new(),
        }
    }
}

impl<E> Found<E> {
    fn push(&mut self, shared: Shared<E>) {
        if self.seen.insert(Rc::as_ptr(&shared)) {
            self.rows.push(shared);
        }
    }

    fn extend(&mut self, handles: impl IntoIterator<Item = Shared<E>>) {
        for shared in handles {
            self.push(shared);
        }
    }

    fn into_vec(self) -> Vec<Shared<E>> {
        self.rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use rowcache_core::{key, ColumnKind, EntitySchema};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Pair {
        id: i64,
        id2: i64,
        hoge: String,
    }

    impl Entity for Pair {
        const TABLE: &'static str = "pair";

        fn schema() -> EntitySchema {
            EntitySchema::new()
                .key("id", ColumnKind::Integer)
                .key("id2", ColumnKind::Integer)
                .field("hoge", ColumnKind::Text)
        }

        fn key(&self) -> Key {
            key![self.id, self.id2]
        }
    }

    fn pair(id: i64, id2: i64, hoge: &str) -> Pair {
        Pair {
            id,
            id2,
            hoge: hoge.to_string(),
        }
    }

    fn manager() -> ModelManager {
        let exec = SqliteExecutor::open_in_memory().unwrap();
        exec.execute_batch(
            r#"CREATE TABLE "pair" ("id" INTEGER, "id2" INTEGER, "hoge" TEXT, PRIMARY KEY ("id", "id2"))"#,
        )
        .unwrap();
        let transport: Arc<dyn CacheTransport> = Arc::new(MemoryTransport::new());
        ModelManager::new(exec, Arc::new(Registry::new()), Some(transport)).unwrap()
    }

    #[test]
    fn test_write_all_requires_transaction() {
        let mut m = manager();
        let err = m.write_all().unwrap_err();
        assert_eq!(err, RowcacheError::Usage(UsageError::NotWritable));
    }

    #[test]
    fn test_empty_key_is_rejected() {
        let mut m = manager();
        let err = m.get_models::<Pair>(&[Key::new(Vec::new())]).unwrap_err();
        assert!(matches!(err, RowcacheError::Usage(UsageError::EmptyKey { .. })));
    }

    #[test]
    fn test_unknown_field_is_rejected_before_staging() {
        let mut m = manager();
        let err = m
            .cached_save(pair(1, 1, "a"), SaveOptions::new().fields(["nope"]))
            .unwrap_err();
        assert!(matches!(err, RowcacheError::Usage(UsageError::UnknownField { .. })));
        assert!(m.batch().is_empty());
        assert_eq!(m.scope().count::<Pair>(), 0);
    }

    #[test]
    fn test_rejected_save_leaves_scope_untouched() {
        let mut m = manager();
        m.set_delete(pair(1, 1, "a")).unwrap();
        let held = m.cached_save(pair(2, 2, "b"), SaveOptions::new()).unwrap();
        assert!(m.cached_save(pair(1, 1, "z"), SaveOptions::new()).is_err());
        assert_eq!(m.scope().count::<Pair>(), 1);
        assert_eq!(held.borrow().hoge, "b");
    }

    #[test]
    fn test_read_tiers_are_counted() {
        let mut m = manager();
        m.start_transaction().unwrap();
        m.cached_save(pair(1, 2, "a"), SaveOptions::new()).unwrap();
        m.write_all().unwrap();
        m.commit_transaction().unwrap();

        assert_eq!(m.get_models::<Pair>(&[key![1, 2]]).unwrap().len(), 1);
        assert_eq!(m.stats().distributed_hits, 1);
        assert_eq!(m.get_models::<Pair>(&[key![1, 2]]).unwrap().len(), 1);
        assert_eq!(m.stats().request_hits, 1);
        assert_eq!(m.stats().store_queries, 0);

        assert_eq!(m.get_models::<Pair>(&[Key::from(1)]).unwrap().len(), 1);
        assert_eq!(m.stats().request_hits, 2);
    }

    #[test]
    fn test_duplicate_keys_return_one_handle() {
        let mut m = manager();
        m.start_transaction().unwrap();
        m.cached_save(pair(1, 2, "a"), SaveOptions::new()).unwrap();
        m.write_all().unwrap();
        let rows = m
            .get_models::<Pair>(&[key![1, 2], key![1, 2], Key::from(1)])
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn test_overlong_key_matches_nothing() {
        let mut m = manager();
        m.start_transaction().unwrap();
        m.cached_save(pair(1, 2, "a"), SaveOptions::new()).unwrap();
        m.write_all().unwrap();
        m.commit_transaction().unwrap();

        assert!(m.get_models::<Pair>(&[key![1, 2, 99]]).unwrap().is_empty());
        assert_eq!(m.stats(), TierStats::default());
        assert_eq!(m.get_models::<Pair>(&[key![1, 2]]).unwrap().len(), 1);
    }

    #[test]
    fn test_commit_discards_unflushed_writes() {
        let mut m = manager();
        m.start_transaction().unwrap();
        m.cached_save(pair(1, 2, "a"), SaveOptions::new()).unwrap();
        m.commit_transaction().unwrap();
        assert!(m.batch().is_empty());
        assert!(m.get_models::<Pair>(&[key![1, 2]]).unwrap().is_empty());
    }

    #[test]
    fn test_ttl_accessors() {
        let m = manager().with_ttl(Duration::from_secs(5));
        assert_eq!(m.ttl(), Some(Duration::from_secs(5)));
        assert_eq!(m.table_name::<Pair>(), "pair");
        assert_eq!(m.descriptor::<Pair>().key_len(), 2);
    }

    #[test]
    fn test_open_from_config() {
        let config = RowcacheConfig::from_toml_str(
            r#"
            [stores.main]
            path = ":memory:"

            [cache]
            ttl_secs = 30
            transport = { kind = "disabled" }
            "#,
        )
        .unwrap();
        let m = ModelManager::open(&config, "main", Arc::new(Registry::new())).unwrap();
        assert!(m.distributed_cache().is_none());
        assert_eq!(m.ttl(), None);
        assert!(ModelManager::open(&config, "other", Arc::new(Registry::new())).is_err());
    }
}
