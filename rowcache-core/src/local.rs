//! Process-local store for master data.
//!
//! Entries are tied to a version number. Adopting a newer version drops
//! every entry at once; there is no per-key expiry.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::read::CacheSlot;

#[derive(Debug, Default)]
struct LocalState {
    version: i64,
    entries: HashMap<String, String>,
}

/// Versioned string map shared by every manager of a registry.
#[derive(Debug, Default)]
pub struct LocalStore {
    state: RwLock<LocalState>,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(&self) -> i64 {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .version
    }

    pub fn get(&self, key: &str) -> CacheSlot<String> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.entries.get(key).cloned().into()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.entries.insert(key.into(), value.into());
    }

    /// Move to `version` if it is newer, dropping all entries. Returns true
    /// when the version changed.
    pub fn adopt_version(&self, version: i64) -> bool {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if version <= state.version {
            return false;
        }
        state.version = version;
        state.entries.clear();
        true
    }

    /// Drop all entries without touching the version.
    pub fn clear(&self) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
