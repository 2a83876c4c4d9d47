//! Blocking SQLite store for rowmap.

pub mod convert;

use std::fmt;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rowmap::store::{ExecResult, ResultSet, Store, TableDescription, TableMetadata};
use rowmap::value::Value;
use rowmap_error::{Result, StoreError, validation};
use rusqlite::types::Value as SqliteValue;
use rusqlite::{Connection, params_from_iter};
use tracing::debug;

use crate::convert::{from_sqlite, store_error, to_sqlite};

/// A single SQLite connection shared by all callers.
///
/// Statements are serialized on the connection. Every call prepares its
/// statement and drops it before returning.
pub struct SqliteStore {
    path: Option<PathBuf>,
    conn: Mutex<Connection>,
}

impl fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(path) => write!(f, "SqliteStore({})", path.to_string_lossy()),
            None => write!(f, "SqliteStore(:memory:)"),
        }
    }
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path).map_err(store_error)?;
        debug!(path = %path.to_string_lossy(), "opened sqlite store");
        Ok(SqliteStore {
            path: Some(path),
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(store_error)?;
        Ok(SqliteStore {
            path: None,
            conn: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run one or more statements without arguments, e.g. schema setup.
    pub fn execute_batch(&self, sql: &str) -> Result<(), StoreError> {
        self.conn.lock().execute_batch(sql).map_err(store_error)
    }
}

fn bind_args(args: &[Value]) -> Result<Vec<SqliteValue>, StoreError> {
    args.iter().map(to_sqlite).collect()
}

impl Store for SqliteStore {
    fn execute(&self, sql: &str, args: &[Value]) -> Result<ExecResult, StoreError> {
        let params = bind_args(args)?;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql).map_err(store_error)?;
        let rows_affected = stmt.execute(params_from_iter(params.iter())).map_err(store_error)?;
        Ok(ExecResult {
            last_insert_id: conn.last_insert_rowid(),
            rows_affected: rows_affected as u64,
        })
    }

    fn query(&self, sql: &str, args: &[Value]) -> Result<ResultSet, StoreError> {
        let params = bind_args(args)?;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql).map_err(store_error)?;

        let columns: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(|name| name.to_string())
            .collect();
        let num_cols = columns.len();

        let rows = stmt
            .query(params_from_iter(params.iter()))
            .map_err(store_error)?
            .mapped(|r| {
                (0..num_cols)
                    .map(|idx| r.get::<_, SqliteValue>(idx).map(from_sqlite))
                    .collect::<Result<Vec<_>, rusqlite::Error>>()
            })
            .collect::<Result<Vec<_>, rusqlite::Error>>()
            .map_err(store_error)?;

        Ok(ResultSet { columns, rows })
    }
}

impl TableMetadata for SqliteStore {
    /// Primary key from `PRAGMA table_info`. A lone `INTEGER PRIMARY KEY`
    /// column aliases the rowid and is reported as the autoincrement column.
    fn describe_table(&self, table: &str) -> Result<TableDescription> {
        let result = self.query(
            "SELECT name, type, pk FROM pragma_table_info(?)",
            &[Value::from(table)],
        )?;
        if result.is_empty() {
            return Err(validation!("no such table: {table}"));
        }

        let mut keyed = Vec::new();
        for row in result.rows {
            let mut row = row.into_iter();
            let (Some(Value::Text(name)), Some(ty), Some(Value::Int(pk))) = (row.next(), row.next(), row.next())
            else {
                return Err(validation!("unexpected table_info row for {table}"));
            };
            if pk > 0 {
                let ty = match ty {
                    Value::Text(ty) => ty,
                    _ => String::new(),
                };
                keyed.push((pk, name, ty));
            }
        }
        keyed.sort_by_key(|(pk, _, _)| *pk);

        let auto_increment = match keyed.as_slice() {
            [(_, name, ty)] if ty.eq_ignore_ascii_case("INTEGER") => Some(name.clone()),
            _ => None,
        };
        let primary_key = keyed.into_iter().map(|(_, name, _)| name).collect();

        Ok(TableDescription {
            primary_key,
            auto_increment,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .execute_batch(
                "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
                 CREATE TABLE memberships (
                    group_id INTEGER NOT NULL,
                    user_id INTEGER NOT NULL,
                    role TEXT,
                    PRIMARY KEY (user_id, group_id)
                 );
                 CREATE TABLE notes (body TEXT);",
            )
            .unwrap();
        store
    }

    #[test]
    fn describe_tables() {
        let store = store();

        let users = store.describe_table("users").unwrap();
        assert_eq!(vec!["id".to_string()], users.primary_key);
        assert_eq!(Some("id".to_string()), users.auto_increment);

        let memberships = store.describe_table("memberships").unwrap();
        assert_eq!(
            vec!["user_id".to_string(), "group_id".to_string()],
            memberships.primary_key
        );
        assert_eq!(None, memberships.auto_increment);

        let notes = store.describe_table("notes").unwrap();
        assert!(notes.primary_key.is_empty());

        assert!(store.describe_table("missing").is_err());
    }

    #[test]
    fn execute_and_query() {
        let store = store();
        let res = store
            .execute("INSERT INTO users (name) VALUES (?)", &[Value::from("a")])
            .unwrap();
        assert_eq!(1, res.last_insert_id);
        assert_eq!(1, res.rows_affected);

        let result = store
            .query("SELECT id, name FROM users WHERE name=?", &[Value::from("a")])
            .unwrap();
        assert_eq!(vec!["id".to_string(), "name".to_string()], result.columns);
        assert_eq!(vec![vec![Value::Int(1), Value::from("a")]], result.rows);

        let err = store
            .execute("INSERT INTO users (id, name) VALUES (?, ?)", &[Value::Int(1), Value::from("b")])
            .unwrap_err();
        assert!(err.is_duplicate());
    }
}
