//! Relational executor.
//!
//! [`SqlExecutor`] is the seam between the manager and the relational store.
//! [`SqliteExecutor`] implements it over a single rusqlite connection and
//! keeps a log of every data statement it ran, which tests use to observe
//! round trips.

use rusqlite::functions::FunctionFlags;
use rusqlite::types::{Value, ValueRef};
use rusqlite::{params_from_iter, Connection, OpenFlags};
use tracing::{debug, trace};

use rowcache_core::{ColumnValue, StorageError, StoreSettings};

use crate::sql::Statement;

/// One result row, columns in select-list order.
pub type Row = Vec<ColumnValue>;

/// Blocking access to a relational store over one exclusive connection.
pub trait SqlExecutor {
    fn query(&mut self, stmt: &Statement) -> Result<Vec<Row>, StorageError>;

    /// Run a write. Returns the number of affected rows.
    fn execute(&mut self, stmt: &Statement) -> Result<usize, StorageError>;

    /// Run an INSERT. Returns the generated row id when the store has one.
    fn insert(&mut self, stmt: &Statement) -> Result<Option<i64>, StorageError>;

    fn begin(&mut self) -> Result<(), StorageError>;
    fn commit(&mut self) -> Result<(), StorageError>;
    fn rollback(&mut self) -> Result<(), StorageError>;
}

fn to_sql_value(value: &ColumnValue) -> Value {
    match value {
        ColumnValue::Null => Value::Null,
        ColumnValue::Integer(v) => Value::Integer(*v),
        ColumnValue::Real(v) => Value::Real(*v),
        ColumnValue::Text(s) => Value::Text(s.clone()),
        ColumnValue::Blob(b) => Value::Blob(b.clone()),
    }
}

fn from_value_ref(value: ValueRef<'_>) -> ColumnValue {
    match value {
        ValueRef::Null => ColumnValue::Null,
        ValueRef::Integer(v) => ColumnValue::Integer(v),
        ValueRef::Real(v) => ColumnValue::Real(v),
        ValueRef::Text(t) => ColumnValue::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => ColumnValue::Blob(b.to_vec()),
    }
}

fn query_failed(table: &str, e: rusqlite::Error) -> StorageError {
    StorageError::QueryFailed {
        table: table.to_string(),
        reason: e.to_string(),
    }
}

fn transaction_failed(e: rusqlite::Error) -> StorageError {
    StorageError::TransactionFailed {
        reason: e.to_string(),
    }
}

/// SQLite executor.
///
/// Registers `ST_AsText` and `ST_GeomFromText` as pass-through scalar
/// functions so point columns stored as well-known text work without a
/// spatial extension.
pub struct SqliteExecutor {
    conn: Connection,
    log: Vec<Statement>,
    queries: usize,
}

impl SqliteExecutor {
    pub fn open(settings: &StoreSettings) -> Result<Self, StorageError> {
        let conn = if settings.path == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open_with_flags(
                &settings.path,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
        }
        .map_err(|e| StorageError::ConnectionFailed {
            reason: format!("{}: {}", settings.path, e),
        })?;
        conn.busy_timeout(settings.busy_timeout())
            .map_err(|e| StorageError::ConnectionFailed {
                reason: e.to_string(),
            })?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::open(&StoreSettings::new(":memory:"))
    }

    pub fn from_connection(conn: Connection) -> Result<Self, StorageError> {
        register_spatial_functions(&conn).map_err(|e| StorageError::ConnectionFailed {
            reason: e.to_string(),
        })?;
        Ok(Self {
            conn,
            log: Vec::new(),
            queries: 0,
        })
    }

    /// Run DDL or other unlogged SQL.
    pub fn execute_batch(&self, sql: &str) -> Result<(), StorageError> {
        self.conn
            .execute_batch(sql)
            .map_err(|e| query_failed("", e))
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Data statements run so far, oldest first.
    pub fn statement_log(&self) -> &[Statement] {
        &self.log
    }

    pub fn clear_log(&mut self) {
        self.log.clear();
        self.queries = 0;
    }

    /// Number of SELECT round trips.
    pub fn query_count(&self) -> usize {
        self.queries
    }

    fn record(&mut self, stmt: &Statement) {
        trace!(table = stmt.table, sql = %stmt.sql, params = stmt.params.len(), "sql");
        self.log.push(stmt.clone());
    }
}

fn register_spatial_functions(conn: &Connection) -> rusqlite::Result<()> {
    let flags = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC;
    conn.create_scalar_function("ST_AsText", 1, flags, |ctx| {
        ctx.get::<Option<String>>(0)
    })?;
    conn.create_scalar_function("ST_GeomFromText", 1, flags, |ctx| {
        ctx.get::<Option<String>>(0)
    })?;
    Ok(())
}

impl SqlExecutor for SqliteExecutor {
    fn query(&mut self, stmt: &Statement) -> Result<Vec<Row>, StorageError> {
        self.record(stmt);
        self.queries += 1;
        let params: Vec<Value> = stmt.params.iter().map(to_sql_value).collect();
        let mut prepared = self
            .conn
            .prepare(&stmt.sql)
            .map_err(|e| query_failed(stmt.table, e))?;
        let width = prepared.column_count();
        let mut rows = prepared
            .query(params_from_iter(params.iter()))
            .map_err(|e| query_failed(stmt.table, e))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(|e| query_failed(stmt.table, e))? {
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                let value = row.get_ref(i).map_err(|e| query_failed(stmt.table, e))?;
                values.push(from_value_ref(value));
            }
            out.push(values);
        }
        debug!(table = stmt.table, rows = out.len(), "query");
        Ok(out)
    }

    fn execute(&mut self, stmt: &Statement) -> Result<usize, StorageError> {
        self.record(stmt);
        let params: Vec<Value> = stmt.params.iter().map(to_sql_value).collect();
        self.conn
            .execute(&stmt.sql, params_from_iter(params.iter()))
            .map_err(|e| query_failed(stmt.table, e))
    }

    fn insert(&mut self, stmt: &Statement) -> Result<Option<i64>, StorageError> {
        self.execute(stmt)?;
        Ok(Some(self.conn.last_insert_rowid()))
    }

    fn begin(&mut self) -> Result<(), StorageError> {
        self.conn.execute_batch("BEGIN").map_err(transaction_failed)
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        self.conn.execute_batch("COMMIT").map_err(transaction_failed)
    }

    fn rollback(&mut self) -> Result<(), StorageError> {
        self.conn
            .execute_batch("ROLLBACK")
            .map_err(transaction_failed)
    }
}
