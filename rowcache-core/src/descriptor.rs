//! Entity descriptors and the registry that memoizes them.
//!
//! A [`Descriptor`] is the per-table metadata every read and write consults:
//! key layout, field list, custom codec bindings, the master flag and the
//! read select clause. The [`Registry`] builds one per entity type on first
//! reference and hands out the same `Arc` afterwards. It also owns the
//! process-local master data store, so one registry per process replaces
//! any global state.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use once_cell::sync::OnceCell;
use serde_json::{Map, Value as JsonValue};
use tracing::debug;

use crate::codec::{quote_ident, ColumnCodec, ColumnValue, EncodedColumn};
use crate::entity::{Entity, FieldDef};
use crate::error::{RowcacheError, RowcacheResult, StorageError, UsageError};
use crate::key::Key;
use crate::local::LocalStore;

/// Metadata for one entity type.
#[derive(Debug)]
pub struct Descriptor {
    table: &'static str,
    fields: Vec<FieldDef>,
    key_indices: Vec<usize>,
    master: bool,
    select_clause: OnceCell<String>,
}

impl Descriptor {
    pub fn new(table: &'static str, fields: Vec<FieldDef>, master: bool) -> Self {
        let key_indices = fields
            .iter()
            .enumerate()
            .filter(|(_, f)| f.is_key)
            .map(|(i, _)| i)
            .collect();
        Self {
            table,
            fields,
            key_indices,
            master,
            select_clause: OnceCell::new(),
        }
    }

    pub fn for_entity<E: Entity>() -> Self {
        Self::new(E::TABLE, E::schema().into_fields(), E::is_master())
    }

    /// Descriptor of no table. Returned for anything not registered.
    pub fn zero() -> Self {
        Self::new("", Vec::new(), false)
    }

    pub fn is_zero(&self) -> bool {
        self.table.is_empty()
    }

    pub fn table(&self) -> &'static str {
        self.table
    }

    pub fn is_master(&self) -> bool {
        self.master
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Key fields in key order.
    pub fn key_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.key_indices.iter().map(move |&i| &self.fields[i])
    }

    pub fn non_key_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|f| !f.is_key)
    }

    pub fn key_len(&self) -> usize {
        self.key_indices.len()
    }

    pub fn custom_by_field(&self, name: &str) -> Option<&Arc<dyn ColumnCodec>> {
        self.field(name).and_then(|f| f.codec.as_ref())
    }

    pub fn custom_by_column(&self, column: &str) -> Option<&Arc<dyn ColumnCodec>> {
        self.fields
            .iter()
            .find(|f| f.column == column)
            .and_then(|f| f.codec.as_ref())
    }

    pub fn has_custom_codec(&self) -> bool {
        self.fields.iter().any(|f| f.codec.is_some())
    }

    /// Select list with every custom column rewritten by its codec.
    /// Columns appear in field order.
    pub fn select_clause(&self) -> &str {
        self.select_clause.get_or_init(|| {
            self.fields
                .iter()
                .map(|f| match &f.codec {
                    Some(codec) => codec.select_clause(f.column),
                    None => quote_ident(f.column),
                })
                .collect::<Vec<_>>()
                .join(", ")
        })
    }

    pub fn key_string(&self, key: &Key) -> String {
        key.render()
    }

    /// Key string of `entity`, truncated to `prefix_len` segments. A
    /// length of zero keeps the whole key.
    pub fn key_string_of<E: Entity>(&self, entity: &E, prefix_len: usize) -> String {
        entity.key().prefix(prefix_len).render()
    }

    /// Serialized field map of `entity`.
    pub fn to_json_map<E: Entity>(&self, entity: &E) -> RowcacheResult<Map<String, JsonValue>> {
        match serde_json::to_value(entity) {
            Ok(JsonValue::Object(map)) => Ok(map),
            Ok(other) => Err(StorageError::Decode {
                table: self.table.to_string(),
                reason: format!("entity serialized to non-object {}", other),
            }
            .into()),
            Err(e) => Err(StorageError::Decode {
                table: self.table.to_string(),
                reason: e.to_string(),
            }
            .into()),
        }
    }

    /// Write expressions for the fields of `entity` accepted by `include`,
    /// in field order. Fields absent from the serialized form bind null.
    pub fn encode_fields<'a, E, F>(
        &'a self,
        entity: &E,
        include: F,
    ) -> RowcacheResult<Vec<(&'a FieldDef, EncodedColumn)>>
    where
        E: Entity,
        F: Fn(&FieldDef) -> bool,
    {
        let map = self.to_json_map(entity)?;
        let mut out = Vec::new();
        for field in self.fields.iter().filter(|f| include(f)) {
            let value = map.get(field.name).unwrap_or(&JsonValue::Null);
            out.push((field, field.encode(value)?));
        }
        Ok(out)
    }

    /// Resolve field names to definitions, rejecting unknown names.
    pub fn resolve_fields<'a, I, S>(&'a self, names: I) -> RowcacheResult<Vec<&'a FieldDef>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        names
            .into_iter()
            .map(|name| {
                self.field(name.as_ref()).ok_or_else(|| {
                    RowcacheError::from(UsageError::UnknownField {
                        table: self.table.to_string(),
                        field: name.as_ref().to_string(),
                    })
                })
            })
            .collect()
    }

    /// Rebuild an entity from a row read with [`select_clause`](Self::select_clause).
    pub fn decode_row<E: Entity>(&self, row: &[ColumnValue]) -> RowcacheResult<E> {
        if row.len() != self.fields.len() {
            return Err(StorageError::Decode {
                table: self.table.to_string(),
                reason: format!(
                    "expected {} columns, got {}",
                    self.fields.len(),
                    row.len()
                ),
            }
            .into());
        }
        let mut map = Map::with_capacity(row.len());
        for (field, stored) in self.fields.iter().zip(row) {
            map.insert(field.name.to_string(), field.decode(stored)?);
        }
        serde_json::from_value(JsonValue::Object(map)).map_err(|e| {
            StorageError::Decode {
                table: self.table.to_string(),
                reason: e.to_string(),
            }
            .into()
        })
    }
}

/// Memoized descriptors plus the process-local store.
#[derive(Debug, Default)]
pub struct Registry {
    descriptors: RwLock<HashMap<&'static str, Arc<Descriptor>>>,
    local: LocalStore,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Descriptor for `E`, built on first call.
    pub fn describe<E: Entity>(&self) -> Arc<Descriptor> {
        if let Some(found) = self
            .descriptors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(E::TABLE)
        {
            return Arc::clone(found);
        }
        let mut descriptors = self
            .descriptors
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let descriptor = descriptors.entry(E::TABLE).or_insert_with(|| {
            debug!(table = E::TABLE, "registering entity descriptor");
            Arc::new(Descriptor::for_entity::<E>())
        });
        Arc::clone(descriptor)
    }

    /// Descriptor registered for `table`, or the zero descriptor.
    pub fn lookup(&self, table: &str) -> Arc<Descriptor> {
        self.descriptors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(table)
            .cloned()
            .unwrap_or_else(|| Arc::new(Descriptor::zero()))
    }

    pub fn local_store(&self) -> &LocalStore {
        &self.local
    }

    pub fn len(&self) -> usize {
        self.descriptors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Point;
    use crate::entity::{ColumnKind, EntitySchema};
    use crate::key;
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

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Place {
        id: i64,
        location: Option<Point>,
    }

    impl Entity for Place {
        const TABLE: &'static str = "place";

        fn schema() -> EntitySchema {
            EntitySchema::new()
                .key("id", ColumnKind::Integer)
                .custom::<Point>("location")
        }

        fn key(&self) -> Key {
            Key::from(self.id)
        }

        fn is_master() -> bool {
            true
        }
    }

    #[test]
    fn test_describe_is_memoized() {
        let registry = Registry::new();
        let a = registry.describe::<Pair>();
        let b = registry.describe::<Pair>();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
        assert_eq!(a.key_len(), 2);
        assert!(!a.is_master());
    }

    #[test]
    fn test_lookup_unknown_table_is_zero() {
        let registry = Registry::new();
        registry.describe::<Pair>();
        assert_eq!(registry.lookup("pair").table(), "pair");
        assert!(registry.lookup("nothing").is_zero());
    }

    #[test]
    fn test_select_clause_rewrites_custom_columns() {
        let descriptor = Descriptor::for_entity::<Place>();
        assert!(descriptor.is_master());
        assert!(descriptor.has_custom_codec());
        assert_eq!(
            descriptor.select_clause(),
            r#""id", ST_AsText("location") AS "location""#
        );
        assert!(descriptor.custom_by_field("location").is_some());
        assert!(descriptor.custom_by_column("location").is_some());
        assert!(descriptor.custom_by_field("id").is_none());
    }

    #[test]
    fn test_key_string_with_prefix() {
        let descriptor = Descriptor::for_entity::<Pair>();
        let pair = Pair {
            id: 1000,
            id2: 2000,
            hoge: String::new(),
        };
        assert_eq!(descriptor.key_string_of(&pair, 0), "1000#&#2000");
        assert_eq!(descriptor.key_string_of(&pair, 1), "1000");
        assert_eq!(descriptor.key_string(&pair.key()), "1000#&#2000");
    }

    #[test]
    fn test_encode_and_decode_row() {
        let descriptor = Descriptor::for_entity::<Pair>();
        let pair = Pair {
            id: 1,
            id2: 2,
            hoge: "hogehoge".to_string(),
        };
        let encoded = descriptor.encode_fields(&pair, |f| !f.is_key).unwrap();
        assert_eq!(encoded.len(), 1);
        assert_eq!(encoded[0].0.name, "hoge");
        assert_eq!(
            encoded[0].1.params,
            vec![ColumnValue::Text("hogehoge".to_string())]
        );

        let row = vec![
            ColumnValue::Integer(1),
            ColumnValue::Integer(2),
            ColumnValue::Text("hogehoge".to_string()),
        ];
        assert_eq!(descriptor.decode_row::<Pair>(&row).unwrap(), pair);
    }

    #[test]
    fn test_decode_row_with_wrong_width_fails() {
        let descriptor = Descriptor::for_entity::<Pair>();
        let err = descriptor
            .decode_row::<Pair>(&[ColumnValue::Integer(1)])
            .unwrap_err();
        assert!(matches!(err, RowcacheError::Storage(StorageError::Decode { .. })));
    }

    #[test]
    fn test_unparsable_point_decodes_to_none() {
        let descriptor = Descriptor::for_entity::<Place>();
        let row = vec![
            ColumnValue::Integer(7),
            ColumnValue::Text("garbage".to_string()),
        ];
        let place: Place = descriptor.decode_row(&row).unwrap();
        assert_eq!(place.location, None);
    }

    #[test]
    fn test_resolve_fields_rejects_unknown() {
        let descriptor = Descriptor::for_entity::<Pair>();
        assert_eq!(descriptor.resolve_fields(["hoge"]).unwrap().len(), 1);
        let err = descriptor.resolve_fields(["nope"]).unwrap_err();
        assert!(matches!(
            err,
            RowcacheError::Usage(UsageError::UnknownField { .. })
        ));
    }
}
