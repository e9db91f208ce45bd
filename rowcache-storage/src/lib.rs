//! Rowcache Storage - Model Manager and Cache Tiers
//!
//! Everything that touches a store: SQL generation, the SQLite executor,
//! cache transports (in-memory and LMDB), the local and distributed cache
//! tiers, the request scope, the write batch and the transaction
//! coordinator, tied together by [`ModelManager`].

pub mod batch;
pub mod distributed;
pub mod executor;
pub mod local;
pub mod manager;
pub mod scoped;
pub mod sql;
pub mod transaction;
pub mod transport;

pub use batch::{FieldSelection, SaveOptions, Task, TaskResult, WriteBatch};
pub use distributed::{entity_key, keyset_key, DistributedCache};
pub use executor::{Row, SqlExecutor, SqliteExecutor};
pub use local::{local_key, LocalCache, VERSION_MARKER_KEY};
pub use manager::{ModelManager, TierStats};
pub use scoped::{RequestScope, ScopedStore, Shared};
pub use sql::Statement;
pub use transaction::{TransactionCoordinator, TransactionState};
pub use transport::{transport_from_settings, CacheTransport, LmdbTransport, MemoryTransport};
