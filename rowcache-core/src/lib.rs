//! Rowcache Core - Entity and Cache Primitives
//!
//! Pure types shared by every tier of the data-access layer: composite keys,
//! entity registration, descriptors, column codecs, cache value encoding,
//! configuration and the error taxonomy. Nothing here performs I/O.

pub mod codec;
pub mod config;
pub mod descriptor;
pub mod entity;
pub mod error;
pub mod key;
pub mod local;
pub mod read;
pub mod telemetry;
pub mod value;

pub use codec::{quote_ident, ColumnCodec, ColumnValue, CustomColumn, EncodedColumn, Point, PointCodec};
pub use config::{
    CacheSettings, RowcacheConfig, StoreSettings, TransportSettings, DEFAULT_CACHE_TTL_SECS,
};
pub use descriptor::{Descriptor, Registry};
pub use entity::{ColumnKind, Entity, EntitySchema, FieldDef};
pub use error::{
    CacheError, CodecError, ConfigError, RowcacheError, RowcacheResult, StorageError, UsageError,
    WriteOp,
};
pub use key::{Key, KeyPart, KEY_SEPARATOR};
pub use local::LocalStore;
pub use read::CacheSlot;
pub use telemetry::{init_logging, LogConfig, LogFormat};
pub use value::{decode_value, encode_value, ENCODED_PREFIX};
