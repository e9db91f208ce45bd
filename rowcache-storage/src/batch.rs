//! Write batching.
//!
//! Saves and deletes are staged per identity and only reach the store when
//! the manager flushes. Staging enforces the intent rules:
//! - an identity is either saved or deleted, never both
//! - force-insert and force-update are mutually exclusive, also across calls
//! - field subsets accumulate; an all-fields save supersedes any subset

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use rowcache_core::{
    CacheError, Descriptor, EncodedColumn, Entity, FieldDef, Key, Registry, RowcacheResult,
    UsageError,
};

use crate::distributed::{entity_key, DistributedCache};
use crate::scoped::Shared;

/// Result of a callback or post-flush task.
pub type TaskResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Deferred work run after a successful write.
pub type Task = Box<dyn FnOnce() -> TaskResult>;

/// Options for one staged save.
#[derive(Default)]
pub struct SaveOptions {
    fields: Vec<String>,
    force_insert: bool,
    force_update: bool,
    callback: Option<Task>,
}

impl SaveOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update only these fields. Empty means all fields.
    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn force_insert(mut self) -> Self {
        self.force_insert = true;
        self
    }

    pub fn force_update(mut self) -> Self {
        self.force_update = true;
        self
    }

    /// Run `f` right after this row is written.
    pub fn on_saved<F>(mut self, f: F) -> Self
    where
        F: FnOnce() -> TaskResult + 'static,
    {
        self.callback = Some(Box::new(f));
        self
    }

    pub fn field_names(&self) -> &[String] {
        &self.fields
    }
}

impl fmt::Debug for SaveOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaveOptions")
            .field("fields", &self.fields)
            .field("force_insert", &self.force_insert)
            .field("force_update", &self.force_update)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// Which columns a staged save writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldSelection {
    All,
    /// Field names in first-staged order, without duplicates.
    Subset(Vec<String>),
}

impl FieldSelection {
    fn merge(current: Option<FieldSelection>, requested: &[String]) -> FieldSelection {
        match current {
            _ if requested.is_empty() => FieldSelection::All,
            None => FieldSelection::Subset(dedup(requested.iter().cloned())),
            Some(FieldSelection::All) => FieldSelection::All,
            Some(FieldSelection::Subset(existing)) => {
                FieldSelection::Subset(dedup(existing.into_iter().chain(requested.iter().cloned())))
            }
        }
    }
}

fn dedup(names: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    names.filter(|n| seen.insert(n.clone())).collect()
}

/// Type-erased access to a staged row.
pub(crate) trait StagedEntity {
    fn table(&self) -> &'static str;
    fn key(&self) -> Key;
    fn is_master(&self) -> bool;
    fn descriptor(&self, registry: &Registry) -> Arc<Descriptor>;
    fn encode<'a>(
        &self,
        descriptor: &'a Descriptor,
        include: &dyn Fn(&FieldDef) -> bool,
    ) -> RowcacheResult<Vec<(&'a FieldDef, EncodedColumn)>>;
    fn assign_generated_key(&self, row_id: i64);
    fn cache_put(&self, cache: &DistributedCache) -> Result<(), CacheError>;
}

impl<E: Entity> StagedEntity for Shared<E> {
    fn table(&self) -> &'static str {
        E::TABLE
    }

    fn key(&self) -> Key {
        self.borrow().key()
    }

    fn is_master(&self) -> bool {
        E::is_master()
    }

    fn descriptor(&self, registry: &Registry) -> Arc<Descriptor> {
        registry.describe::<E>()
    }

    fn encode<'a>(
        &self,
        descriptor: &'a Descriptor,
        include: &dyn Fn(&FieldDef) -> bool,
    ) -> RowcacheResult<Vec<(&'a FieldDef, EncodedColumn)>> {
        descriptor.encode_fields(&*self.borrow(), include)
    }

    fn assign_generated_key(&self, row_id: i64) {
        self.borrow_mut().assign_generated_key(row_id);
    }

    fn cache_put(&self, cache: &DistributedCache) -> Result<(), CacheError> {
        cache.put(&*self.borrow())
    }
}

/// A staged save.
pub(crate) struct StagedSave {
    pub identity: String,
    pub entity: Box<dyn StagedEntity>,
    pub fields: Option<FieldSelection>,
    pub force_insert: bool,
    pub force_update: bool,
    pub callbacks: Vec<Task>,
}

pub(crate) struct StagedDelete {
    pub identity: String,
    pub entity: Box<dyn StagedEntity>,
}

/// Everything taken out of a batch for one flush. Callbacks and tasks are
/// removed as they run, so what is left can be restored after a failure.
pub(crate) struct PendingFlush {
    pub saves: Vec<StagedSave>,
    pub deletes: Vec<StagedDelete>,
    pub tasks: Vec<Task>,
}

/// Staged saves and deletes of one manager, in stage order.
#[derive(Default)]
pub struct WriteBatch {
    saves: Vec<StagedSave>,
    save_index: HashMap<String, usize>,
    deletes: Vec<StagedDelete>,
    delete_index: HashSet<String>,
    tasks: Vec<Task>,
    new_models: u64,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Identity used to stage `key` of `table`. Rows without an assigned
    /// key get a fresh `NewModel` identity on every call.
    pub fn identity(&mut self, table: &str, key: &Key) -> String {
        if key.is_zero() {
            let identity = format!("{}:NewModel:{}", table, self.new_models);
            self.new_models += 1;
            identity
        } else {
            entity_key(table, key)
        }
    }

    /// Check that staging `options` for `identity` would be accepted,
    /// without changing anything.
    pub fn check_save(&self, identity: &str, options: &SaveOptions) -> RowcacheResult<()> {
        let conflicting = UsageError::ConflictingForceFlags {
            identity: identity.to_string(),
        };
        if options.force_insert && options.force_update {
            return Err(conflicting.into());
        }
        if self.delete_index.contains(identity) {
            return Err(UsageError::ReservedForOpposite {
                identity: identity.to_string(),
                staged: "delete",
            }
            .into());
        }
        if let Some(&i) = self.save_index.get(identity) {
            let staged = &self.saves[i];
            let insert = staged.force_insert || options.force_insert;
            let update = staged.force_update || options.force_update;
            if insert && update {
                return Err(conflicting.into());
            }
        }
        Ok(())
    }

    /// Stage a save. Restaging an identity replaces the staged row, merges
    /// the field selection and keeps earlier callbacks.
    pub(crate) fn stage_save(
        &mut self,
        identity: String,
        entity: Box<dyn StagedEntity>,
        options: SaveOptions,
    ) -> RowcacheResult<()> {
        self.check_save(&identity, &options)?;
        let SaveOptions {
            fields,
            force_insert,
            force_update,
            callback,
        } = options;

        let index = match self.save_index.get(&identity).copied() {
            Some(i) => {
                self.saves[i].entity = entity;
                i
            }
            None => {
                let i = self.saves.len();
                self.save_index.insert(identity.clone(), i);
                self.saves.push(StagedSave {
                    identity,
                    entity,
                    fields: None,
                    force_insert: false,
                    force_update: false,
                    callbacks: Vec::new(),
                });
                i
            }
        };
        let staged = &mut self.saves[index];
        staged.force_insert |= force_insert;
        staged.force_update |= force_update;
        staged.fields = Some(FieldSelection::merge(staged.fields.take(), &fields));
        staged.callbacks.extend(callback);
        Ok(())
    }

    /// Stage a delete. Repeating it is a no-op.
    pub(crate) fn stage_delete(
        &mut self,
        identity: String,
        entity: Box<dyn StagedEntity>,
    ) -> RowcacheResult<()> {
        if self.delete_index.contains(&identity) {
            return Ok(());
        }
        if self.save_index.contains_key(&identity) {
            return Err(UsageError::ReservedForOpposite {
                identity,
                staged: "save",
            }
            .into());
        }
        self.delete_index.insert(identity.clone());
        self.deletes.push(StagedDelete { identity, entity });
        Ok(())
    }

    pub fn add_task(&mut self, task: Task) {
        self.tasks.push(task);
    }

    pub fn has_save(&self, identity: &str) -> bool {
        self.save_index.contains_key(identity)
    }

    pub fn has_delete(&self, identity: &str) -> bool {
        self.delete_index.contains(identity)
    }

    pub fn field_selection(&self, identity: &str) -> Option<&FieldSelection> {
        self.save_index
            .get(identity)
            .and_then(|&i| self.saves[i].fields.as_ref())
    }

    pub fn save_count(&self) -> usize {
        self.saves.len()
    }

    pub fn delete_count(&self) -> usize {
        self.deletes.len()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.saves.is_empty() && self.deletes.is_empty() && self.tasks.is_empty()
    }

    /// Take all staged work, leaving the batch empty.
    pub(crate) fn take(&mut self) -> PendingFlush {
        self.save_index.clear();
        self.delete_index.clear();
        PendingFlush {
            saves: std::mem::take(&mut self.saves),
            deletes: std::mem::take(&mut self.deletes),
            tasks: std::mem::take(&mut self.tasks),
        }
    }

    /// Put back work returned by [`take`](Self::take) that did not complete,
    /// ahead of anything staged since.
    pub(crate) fn restore(&mut self, pending: PendingFlush) {
        let newer = self.take();
        for save in pending.saves.into_iter().chain(newer.saves) {
            self.save_index.insert(save.identity.clone(), self.saves.len());
            self.saves.push(save);
        }
        for delete in pending.deletes.into_iter().chain(newer.deletes) {
            self.delete_index.insert(delete.identity.clone());
            self.deletes.push(delete);
        }
        self.tasks = pending.tasks;
        self.tasks.extend(newer.tasks);
    }

    pub fn clear(&mut self) {
        self.take();
    }
}
