//! Rowcache Test Utilities
//!
//! Shared test infrastructure for the rowcache workspace:
//! - Fixture entity types and their SQLite schema
//! - Proptest generators for keys and rows
//! - A harness wiring managers to one SQLite file and one cache transport
//! - Custom assertions for rowcache error variants

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tempfile::TempDir;

pub use rowcache_core::{
    key, CacheError, ColumnKind, Entity, EntitySchema, Key, KeyPart, Point, Registry,
    RowcacheError, RowcacheResult, StorageError, StoreSettings, UsageError,
};
pub use rowcache_storage::{
    CacheTransport, MemoryTransport, ModelManager, SaveOptions, Shared, SqliteExecutor,
};

// ============================================================================
// FIXTURE ENTITIES
// ============================================================================

/// Transactional table with a two-column key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DummyMultiKeyTable {
    pub id: u32,
    pub id2: u32,
    pub hoge: String,
}

impl Entity for DummyMultiKeyTable {
    const TABLE: &'static str = "dummy_multi_key_table";

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

/// Master table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DummyMasterTable {
    pub id: u32,
    pub hoge: String,
}

impl Entity for DummyMasterTable {
    const TABLE: &'static str = "dummy_master_table";

    fn schema() -> EntitySchema {
        EntitySchema::new()
            .key("id", ColumnKind::Integer)
            .field("hoge", ColumnKind::Text)
    }

    fn key(&self) -> Key {
        Key::from(self.id)
    }

    fn is_master() -> bool {
        true
    }
}

/// Transactional table with a store-generated key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DummyTable {
    pub id: u32,
    pub id2: u32,
    pub hoge: String,
}

impl Entity for DummyTable {
    const TABLE: &'static str = "dummy_table";

    fn schema() -> EntitySchema {
        EntitySchema::new()
            .key("id", ColumnKind::Integer)
            .field("id2", ColumnKind::Integer)
            .field("hoge", ColumnKind::Text)
    }

    fn key(&self) -> Key {
        Key::from(self.id)
    }

    fn assign_generated_key(&mut self, row_id: i64) {
        if let Ok(id) = u32::try_from(row_id) {
            self.id = id;
        }
    }
}

/// Table with a point column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DummyPointTable {
    pub id: u32,
    pub loc: Option<Point>,
}

impl Entity for DummyPointTable {
    const TABLE: &'static str = "dummy_point_table";

    fn schema() -> EntitySchema {
        EntitySchema::new()
            .key("id", ColumnKind::Integer)
            .custom::<Point>("loc")
    }

    fn key(&self) -> Key {
        Key::from(self.id)
    }
}

/// SQLite DDL for every fixture table.
pub const FIXTURE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS "dummy_multi_key_table" (
    "id" INTEGER NOT NULL,
    "id2" INTEGER NOT NULL,
    "hoge" TEXT NOT NULL DEFAULT '',
    PRIMARY KEY ("id", "id2")
);
CREATE TABLE IF NOT EXISTS "dummy_master_table" (
    "id" INTEGER PRIMARY KEY,
    "hoge" TEXT NOT NULL DEFAULT ''
);
CREATE TABLE IF NOT EXISTS "dummy_table" (
    "id" INTEGER PRIMARY KEY AUTOINCREMENT,
    "id2" INTEGER NOT NULL DEFAULT 0,
    "hoge" TEXT NOT NULL DEFAULT ''
);
CREATE TABLE IF NOT EXISTS "dummy_point_table" (
    "id" INTEGER PRIMARY KEY,
    "loc" TEXT
);
"#;

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Canonical rows used across scenario tests.

    use super::*;

    pub fn multi_key(id: u32, id2: u32, hoge: &str) -> DummyMultiKeyTable {
        DummyMultiKeyTable {
            id,
            id2,
            hoge: hoge.to_string(),
        }
    }

    /// The `{12345, 12345678, "hogehoge"}` row.
    pub fn hogehoge() -> DummyMultiKeyTable {
        multi_key(12345, 12345678, "hogehoge")
    }

    pub fn master(id: u32, hoge: &str) -> DummyMasterTable {
        DummyMasterTable {
            id,
            hoge: hoge.to_string(),
        }
    }

    /// A row without an assigned key.
    pub fn unsaved(hoge: &str) -> DummyTable {
        DummyTable {
            id: 0,
            id2: 0,
            hoge: hoge.to_string(),
        }
    }

    pub fn located(id: u32, lat: f64, lon: f64) -> DummyPointTable {
        DummyPointTable {
            id,
            loc: Some(Point::new(lat, lon)),
        }
    }
}

// ============================================================================
// HARNESS
// ============================================================================

/// One SQLite database file and one shared in-memory transport.
///
/// Managers built from the same harness see each other's committed rows and
/// cache entries, like request handlers of one deployment. Managers built
/// with [`manager_in_process`](Self::manager_in_process) and a fresh
/// registry model separate processes with separate local caches.
pub struct TestHarness {
    _dir: TempDir,
    db_path: PathBuf,
    registry: Arc<Registry>,
    transport: Arc<MemoryTransport>,
}

impl TestHarness {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("create temp dir");
        let db_path = dir.path().join("rowcache-test.sqlite3");
        let harness = Self {
            _dir: dir,
            db_path,
            registry: Arc::new(Registry::new()),
            transport: Arc::new(MemoryTransport::new()),
        };
        harness
            .executor()
            .execute_batch(FIXTURE_SCHEMA)
            .expect("create fixture schema");
        harness
    }

    pub fn store_settings(&self) -> StoreSettings {
        StoreSettings::new(self.db_path.to_string_lossy().into_owned())
    }

    /// A new connection to the harness database.
    pub fn executor(&self) -> SqliteExecutor {
        SqliteExecutor::open(&self.store_settings()).expect("open sqlite store")
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn transport(&self) -> &Arc<MemoryTransport> {
        &self.transport
    }

    pub fn shared_transport(&self) -> Arc<dyn CacheTransport> {
        self.transport.clone()
    }

    /// Manager on the harness registry and transport.
    pub fn manager(&self) -> ModelManager {
        self.manager_in_process(Arc::clone(&self.registry))
    }

    /// Manager with its own registry, sharing only the store and transport.
    pub fn manager_in_process(&self, registry: Arc<Registry>) -> ModelManager {
        ModelManager::new(self.executor(), registry, Some(self.shared_transport()))
            .expect("build manager")
    }

    /// Manager with no distributed tier.
    pub fn manager_without_cache(&self) -> ModelManager {
        ModelManager::new(self.executor(), Arc::new(Registry::new()), None)
            .expect("build manager")
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for keys and fixture rows.

    use super::*;
    use proptest::prelude::*;

    pub fn arb_key_part() -> impl Strategy<Value = KeyPart> {
        prop_oneof![
            any::<i64>().prop_map(KeyPart::Int),
            "[a-z0-9]{1,12}".prop_map(KeyPart::Text),
        ]
    }

    /// Keys of one to `max_len` parts.
    pub fn arb_key(max_len: usize) -> impl Strategy<Value = Key> {
        prop::collection::vec(arb_key_part(), 1..=max_len.max(1)).prop_map(Key::new)
    }

    /// Multi-key rows with non-zero keys.
    pub fn arb_multi_key_row() -> impl Strategy<Value = DummyMultiKeyTable> {
        (1u32..10_000, 1u32..10_000, "[a-zA-Z0-9 ]{0,24}").prop_map(|(id, id2, hoge)| {
            DummyMultiKeyTable { id, id2, hoge }
        })
    }

    pub fn arb_point() -> impl Strategy<Value = Point> {
        (-90.0f64..90.0, -180.0f64..180.0).prop_map(|(lat, lon)| Point::new(lat, lon))
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions on rowcache error variants.

    use super::*;

    #[track_caller]
    pub fn assert_usage_error<T: std::fmt::Debug>(result: &RowcacheResult<T>) {
        match result {
            Err(RowcacheError::Usage(_)) => {}
            other => panic!("Expected Usage error, got: {:?}", other),
        }
    }

    /// Assert the save/delete intent conflict error, naming what was staged.
    #[track_caller]
    pub fn assert_reserved_for_opposite<T: std::fmt::Debug>(
        result: &RowcacheResult<T>,
        expected_staged: &str,
    ) {
        match result {
            Err(RowcacheError::Usage(UsageError::ReservedForOpposite { staged, .. })) => {
                assert_eq!(*staged, expected_staged, "Wrong staged intent");
            }
            other => panic!("Expected ReservedForOpposite error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_conflicting_flags<T: std::fmt::Debug>(result: &RowcacheResult<T>) {
        match result {
            Err(RowcacheError::Usage(UsageError::ConflictingForceFlags { .. })) => {}
            other => panic!("Expected ConflictingForceFlags error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_storage_error<T: std::fmt::Debug>(result: &RowcacheResult<T>) {
        match result {
            Err(RowcacheError::Storage(_)) => {}
            other => panic!("Expected Storage error, got: {:?}", other),
        }
    }

    /// Assert that a shared row holds `expected`.
    #[track_caller]
    pub fn assert_row<E: Entity + PartialEq + std::fmt::Debug>(shared: &Shared<E>, expected: &E) {
        assert_eq!(&*shared.borrow(), expected, "Row contents mismatch");
    }
}
