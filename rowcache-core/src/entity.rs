//! Entity registration.
//!
//! Every persisted type implements [`Entity`] once. The schema it returns is
//! turned into a [`Descriptor`](crate::descriptor::Descriptor) on first use
//! and reused for the life of the registry, so no per-call type inspection
//! happens on the read or write path.
//!
//! Field values travel through the entity's serde representation: each
//! declared field is looked up by name in the serialized JSON object, and
//! its [`ColumnKind`] decides how that JSON value binds to a column.

use std::fmt;
use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value as JsonValue;

use crate::codec::{ColumnCodec, ColumnValue, CustomColumn, EncodedColumn};
use crate::error::CodecError;
use crate::key::Key;

/// A row type stored in one relational table.
///
/// # Implementation Requirements
///
/// - `TABLE` must be unique across the registry
/// - `schema()` must declare at least one key field, in key order
/// - `key()` must return the values of those key fields in the same order
/// - serde field names must match the names declared in `schema()`
pub trait Entity: Clone + Serialize + DeserializeOwned + 'static {
    /// Table identifier.
    const TABLE: &'static str;

    /// Columns of the table.
    fn schema() -> EntitySchema;

    /// Primary key of this instance.
    fn key(&self) -> Key;

    /// Master (reference) data is cached process-locally with versioned
    /// invalidation instead of in the distributed cache.
    fn is_master() -> bool {
        false
    }

    /// Receives the row id the store generated for an inserted zero key.
    fn assign_generated_key(&mut self, _row_id: i64) {}
}

/// How a field's JSON value binds to a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Integer,
    Real,
    Text,
    /// Stored as 0/1.
    Bool,
    /// Arbitrary JSON, stored as text.
    Json,
    /// Handled by the field's [`ColumnCodec`].
    Custom,
}

impl ColumnKind {
    fn label(self) -> &'static str {
        match self {
            ColumnKind::Integer => "integer",
            ColumnKind::Real => "real",
            ColumnKind::Text => "text",
            ColumnKind::Bool => "bool",
            ColumnKind::Json => "json",
            ColumnKind::Custom => "custom",
        }
    }

    /// Bind a JSON value. `Custom` columns never reach this path.
    pub fn to_column(self, value: &JsonValue) -> Result<ColumnValue, CodecError> {
        if value.is_null() {
            return Ok(ColumnValue::Null);
        }
        let wrong = || CodecError::WrongShape {
            codec: self.label(),
            reason: format!("unexpected value {}", value),
        };
        match self {
            ColumnKind::Integer => match value {
                JsonValue::Bool(b) => Ok(ColumnValue::Integer(i64::from(*b))),
                _ => value.as_i64().map(ColumnValue::Integer).ok_or_else(wrong),
            },
            ColumnKind::Real => value.as_f64().map(ColumnValue::Real).ok_or_else(wrong),
            ColumnKind::Text => value
                .as_str()
                .map(|s| ColumnValue::Text(s.to_string()))
                .ok_or_else(wrong),
            ColumnKind::Bool => value
                .as_bool()
                .map(|b| ColumnValue::Integer(i64::from(b)))
                .ok_or_else(wrong),
            ColumnKind::Json => Ok(ColumnValue::Text(value.to_string())),
            ColumnKind::Custom => Err(wrong()),
        }
    }

    /// JSON form of a stored column.
    pub fn from_column(self, stored: &ColumnValue) -> Result<JsonValue, CodecError> {
        let wrong = || CodecError::WrongShape {
            codec: self.label(),
            reason: format!("unexpected stored value {:?}", stored),
        };
        match (self, stored) {
            (_, ColumnValue::Null) => Ok(JsonValue::Null),
            (ColumnKind::Integer, ColumnValue::Integer(v)) => Ok(JsonValue::from(*v)),
            (ColumnKind::Integer, ColumnValue::Text(s)) => {
                s.parse::<i64>().map(JsonValue::from).map_err(|_| wrong())
            }
            (ColumnKind::Real, ColumnValue::Real(v)) => Ok(JsonValue::from(*v)),
            (ColumnKind::Real, ColumnValue::Integer(v)) => Ok(JsonValue::from(*v as f64)),
            (ColumnKind::Text, ColumnValue::Text(s)) => Ok(JsonValue::String(s.clone())),
            (ColumnKind::Text, ColumnValue::Integer(v)) => Ok(JsonValue::String(v.to_string())),
            (ColumnKind::Text, ColumnValue::Blob(b)) => {
                Ok(JsonValue::String(String::from_utf8_lossy(b).into_owned()))
            }
            (ColumnKind::Bool, ColumnValue::Integer(v)) => Ok(JsonValue::Bool(*v != 0)),
            (ColumnKind::Json, ColumnValue::Text(s)) => serde_json::from_str(s).map_err(|e| {
                CodecError::WrongShape {
                    codec: self.label(),
                    reason: e.to_string(),
                }
            }),
            _ => Err(wrong()),
        }
    }
}

/// One declared field.
#[derive(Clone)]
pub struct FieldDef {
    /// Serde field name.
    pub name: &'static str,
    /// Column name in the table.
    pub column: &'static str,
    pub kind: ColumnKind,
    pub is_key: bool,
    pub codec: Option<Arc<dyn ColumnCodec>>,
}

impl FieldDef {
    /// Write expression and parameters for this field's JSON value.
    pub fn encode(&self, value: &JsonValue) -> Result<EncodedColumn, CodecError> {
        match &self.codec {
            Some(codec) => codec.encode(value),
            None => self.kind.to_column(value).map(EncodedColumn::bound),
        }
    }

    /// JSON value for this field from its stored column.
    pub fn decode(&self, stored: &ColumnValue) -> Result<JsonValue, CodecError> {
        match &self.codec {
            Some(codec) => Ok(codec.decode(stored)),
            None => self.kind.from_column(stored),
        }
    }
}

impl fmt::Debug for FieldDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldDef")
            .field("name", &self.name)
            .field("column", &self.column)
            .field("kind", &self.kind)
            .field("is_key", &self.is_key)
            .field("codec", &self.codec.as_ref().map(|c| c.name()))
            .finish()
    }
}

/// Builder for an entity's column layout.
///
/// ```ignore
/// EntitySchema::new()
///     .key("id", ColumnKind::Integer)
///     .key("id2", ColumnKind::Integer)
///     .field("hoge", ColumnKind::Text)
/// ```
#[derive(Debug, Clone, Default)]
pub struct EntitySchema {
    fields: Vec<FieldDef>,
}

impl EntitySchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the next primary key field.
    pub fn key(mut self, name: &'static str, kind: ColumnKind) -> Self {
        self.fields.push(FieldDef {
            name,
            column: name,
            kind,
            is_key: true,
            codec: None,
        });
        self
    }

    pub fn field(mut self, name: &'static str, kind: ColumnKind) -> Self {
        self.fields.push(FieldDef {
            name,
            column: name,
            kind,
            is_key: false,
            codec: None,
        });
        self
    }

    /// Field whose column name differs from its serde name.
    pub fn field_as(mut self, name: &'static str, column: &'static str, kind: ColumnKind) -> Self {
        self.fields.push(FieldDef {
            name,
            column,
            kind,
            is_key: false,
            codec: None,
        });
        self
    }

    /// Field whose value type carries its own codec.
    pub fn custom<T: CustomColumn>(mut self, name: &'static str) -> Self {
        self.fields.push(FieldDef {
            name,
            column: name,
            kind: ColumnKind::Custom,
            is_key: false,
            codec: Some(T::codec()),
        });
        self
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn into_fields(self) -> Vec<FieldDef> {
        self.fields
    }
}
