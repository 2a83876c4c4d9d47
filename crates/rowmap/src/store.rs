//! Traits implemented by a concrete store, and the plain types that cross
//! the boundary.

use std::collections::HashMap;
use std::fmt::Debug;

use rowmap_error::{Result, StoreError, validation};

use crate::value::Value;

/// Outcome of a non-query statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecResult {
    pub last_insert_id: i64,
    pub rows_affected: u64,
}

/// Column names plus rows of untyped values.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl ResultSet {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    /// First column of the first row, `None` if there are no rows.
    pub fn scalar(&self) -> Option<&Value> {
        self.rows.first().and_then(|row| row.first())
    }
}

/// Executes parametrized statements.
///
/// Implementations prepare a statement per call, bind `args` positionally
/// and release the statement before returning. Calls may come from many
/// threads at once.
pub trait Store: Debug + Send + Sync {
    fn execute(&self, sql: &str, args: &[Value]) -> Result<ExecResult, StoreError>;

    fn query(&self, sql: &str, args: &[Value]) -> Result<ResultSet, StoreError>;
}

/// Key layout of a table as reported by the store.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TableDescription {
    /// Primary key columns, in key order.
    pub primary_key: Vec<String>,
    pub auto_increment: Option<String>,
}

impl TableDescription {
    pub fn new<I, S>(primary_key: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        TableDescription {
            primary_key: primary_key.into_iter().map(Into::into).collect(),
            auto_increment: None,
        }
    }

    pub fn with_auto_increment(mut self, column: impl Into<String>) -> Self {
        self.auto_increment = Some(column.into());
        self
    }
}

pub trait TableMetadata: Debug + Send + Sync {
    fn describe_table(&self, table: &str) -> Result<TableDescription>;
}

/// Fixed table descriptions, for stores without usable introspection.
#[derive(Debug, Clone, Default)]
pub struct StaticMetadata {
    tables: HashMap<String, TableDescription>,
}

impl StaticMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, table: impl Into<String>, description: TableDescription) -> Self {
        self.tables.insert(table.into(), description);
        self
    }
}

impl TableMetadata for StaticMetadata {
    fn describe_table(&self, table: &str) -> Result<TableDescription> {
        self.tables
            .get(table)
            .cloned()
            .ok_or_else(|| validation!("no description for table '{table}'"))
    }
}

/// Which number a raw statement reports back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementVerb {
    /// INSERT and REPLACE report the last inserted id.
    Insert,
    /// UPDATE and DELETE report affected rows.
    Modify,
    Other,
}

impl StatementVerb {
    pub fn of(sql: &str) -> Self {
        let verb = sql
            .trim_start()
            .split(|c: char| c.is_whitespace())
            .next()
            .unwrap_or_default()
            .to_ascii_uppercase();
        match verb.as_str() {
            "INSERT" | "REPLACE" => Self::Insert,
            "UPDATE" | "DELETE" => Self::Modify,
            _ => Self::Other,
        }
    }

    pub fn pick(&self, result: ExecResult) -> i64 {
        match self {
            Self::Insert => result.last_insert_id,
            Self::Modify => i64::try_from(result.rows_affected).unwrap_or(i64::MAX),
            Self::Other => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbs() {
        let res = ExecResult {
            last_insert_id: 9,
            rows_affected: 2,
        };
        assert_eq!(9, StatementVerb::of("insert into t values (1)").pick(res));
        assert_eq!(9, StatementVerb::of("  REPLACE INTO t values (1)").pick(res));
        assert_eq!(2, StatementVerb::of("UPDATE t SET a=1").pick(res));
        assert_eq!(2, StatementVerb::of("delete from t").pick(res));
        assert_eq!(0, StatementVerb::of("CREATE TABLE t (a INT)").pick(res));
        assert_eq!(0, StatementVerb::of("").pick(res));
    }

    #[test]
    fn static_metadata() {
        let metadata = StaticMetadata::new().with_table(
            "users",
            TableDescription::new(["id"]).with_auto_increment("id"),
        );
        let desc = metadata.describe_table("users").unwrap();
        assert_eq!(vec!["id".to_string()], desc.primary_key);
        assert_eq!(Some("id".to_string()), desc.auto_increment);
        assert!(metadata.describe_table("missing").is_err());
    }
}
