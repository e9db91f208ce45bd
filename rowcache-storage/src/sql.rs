//! SQL statement builder.
//!
//! Only key-addressed statements are produced: reads by full or partial
//! key, full-table reads for master data, and single-row writes. Every
//! identifier is quoted and every value is bound as a parameter.

use std::fmt;

use rowcache_core::{quote_ident, ColumnValue, Descriptor, EncodedColumn, FieldDef, Key};

/// A SQL string with its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    /// Table the statement addresses, for error context.
    pub table: &'static str,
    pub sql: String,
    pub params: Vec<ColumnValue>,
}

impl Statement {
    pub fn new(table: &'static str, sql: impl Into<String>, params: Vec<ColumnValue>) -> Self {
        Self {
            table,
            sql: sql.into(),
            params,
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql)
    }
}

fn table_ident(descriptor: &Descriptor) -> String {
    quote_ident(descriptor.table())
}

/// `"k1" = ? AND "k2" = ?` over the leading `key.len()` key columns.
fn key_predicate(descriptor: &Descriptor, key: &Key, params: &mut Vec<ColumnValue>) -> String {
    descriptor
        .key_fields()
        .zip(key.parts())
        .map(|(field, part)| {
            params.push(part.into());
            format!("{} = ?", quote_ident(field.column))
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// Read every row matching any of `keys`. All keys must have the same length.
///
/// Single-column lookups use `IN (...)`; wider ones an OR of conjunctions.
pub fn select_by_keys(descriptor: &Descriptor, keys: &[Key]) -> Statement {
    let mut params = Vec::new();
    let width = keys.first().map(Key::len).unwrap_or(0);
    let predicate = if width == 1 {
        let column = descriptor
            .key_fields()
            .next()
            .map(|f| quote_ident(f.column))
            .unwrap_or_default();
        let placeholders = keys
            .iter()
            .flat_map(|k| k.parts().first())
            .map(|part| {
                params.push(part.into());
                "?"
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!("{} IN ({})", column, placeholders)
    } else {
        keys.iter()
            .map(|k| format!("({})", key_predicate(descriptor, k, &mut params)))
            .collect::<Vec<_>>()
            .join(" OR ")
    };
    Statement::new(
        descriptor.table(),
        format!(
            "SELECT {} FROM {} WHERE {}",
            descriptor.select_clause(),
            table_ident(descriptor),
            predicate
        ),
        params,
    )
}

pub fn select_all(descriptor: &Descriptor) -> Statement {
    Statement::new(
        descriptor.table(),
        format!(
            "SELECT {} FROM {}",
            descriptor.select_clause(),
            table_ident(descriptor)
        ),
        Vec::new(),
    )
}

fn insert_with_verb(
    verb: &str,
    descriptor: &Descriptor,
    columns: &[(&FieldDef, EncodedColumn)],
) -> Statement {
    let mut params = Vec::new();
    let names = columns
        .iter()
        .map(|(f, _)| quote_ident(f.column))
        .collect::<Vec<_>>()
        .join(", ");
    let exprs = columns
        .iter()
        .map(|(_, encoded)| {
            params.extend(encoded.params.iter().cloned());
            encoded.expr.as_str()
        })
        .collect::<Vec<_>>()
        .join(", ");
    Statement::new(
        descriptor.table(),
        format!(
            "{} INTO {} ({}) VALUES ({})",
            verb,
            table_ident(descriptor),
            names,
            exprs
        ),
        params,
    )
}

pub fn insert(descriptor: &Descriptor, columns: &[(&FieldDef, EncodedColumn)]) -> Statement {
    insert_with_verb("INSERT", descriptor, columns)
}

/// Insert, replacing any row with the same key.
pub fn replace(descriptor: &Descriptor, columns: &[(&FieldDef, EncodedColumn)]) -> Statement {
    insert_with_verb("INSERT OR REPLACE", descriptor, columns)
}

/// Update only `columns` of the row addressed by `key`.
pub fn update_columns(
    descriptor: &Descriptor,
    columns: &[(&FieldDef, EncodedColumn)],
    key: &Key,
) -> Statement {
    let mut params = Vec::new();
    let assignments = columns
        .iter()
        .map(|(f, encoded)| {
            params.extend(encoded.params.iter().cloned());
            format!("{} = {}", quote_ident(f.column), encoded.expr)
        })
        .collect::<Vec<_>>()
        .join(", ");
    let predicate = key_predicate(descriptor, key, &mut params);
    Statement::new(
        descriptor.table(),
        format!(
            "UPDATE {} SET {} WHERE {}",
            table_ident(descriptor),
            assignments,
            predicate
        ),
        params,
    )
}

pub fn count_by_key(descriptor: &Descriptor, key: &Key) -> Statement {
    let mut params = Vec::new();
    let predicate = key_predicate(descriptor, key, &mut params);
    Statement::new(
        descriptor.table(),
        format!(
            "SELECT COUNT(*) FROM {} WHERE {}",
            table_ident(descriptor),
            predicate
        ),
        params,
    )
}

pub fn delete_by_key(descriptor: &Descriptor, key: &Key) -> Statement {
    let mut params = Vec::new();
    let predicate = key_predicate(descriptor, key, &mut params);
    Statement::new(
        descriptor.table(),
        format!("DELETE FROM {} WHERE {}", table_ident(descriptor), predicate),
        params,
    )
}
