//! Per-call query state: filters, sort, limit and pending updates.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Separator between components of a composite primary key.
pub const KEY_SEPARATOR: char = '-';

const KEY_ESCAPE: char = '\\';

/// Serialize ordered primary key values into the cache index string.
///
/// Components are joined with [`KEY_SEPARATOR`]. Separator and escape
/// characters inside a component are prefixed with a backslash so distinct
/// tuples never produce the same key.
pub fn composite_key(values: &[Value]) -> String {
    let mut key = String::new();
    for (idx, value) in values.iter().enumerate() {
        if idx > 0 {
            key.push(KEY_SEPARATOR);
        }
        for c in value.to_string().chars() {
            if c == KEY_SEPARATOR || c == KEY_ESCAPE {
                key.push(KEY_ESCAPE);
            }
            key.push(c);
        }
    }
    key
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

impl Direction {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_sql())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortKey {
    pub column: String,
    pub direction: Direction,
}

/// Row window. A count of 0 means unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Limit {
    pub offset: u64,
    pub count: u64,
}

impl Limit {
    pub const ONE: Limit = Limit {
        offset: 0,
        count: 1,
    };

    pub fn is_unbounded(&self) -> bool {
        self.count == 0
    }
}

/// Exact match on every primary key column.
#[derive(Debug, Clone, PartialEq)]
pub struct PrimaryKeyFilter {
    pub values: Vec<Value>,
    /// Composite key derived from `values`.
    pub key: String,
}

/// Everything a terminal operation needs besides the schema.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuerySpec {
    pub table: String,
    /// Selected output columns. Empty selects all columns.
    pub fields: Vec<String>,
    pub primary_key: Option<PrimaryKeyFilter>,
    /// Free-form predicate built by `filter`/`or_filter`.
    pub predicate: String,
    pub predicate_args: Vec<Value>,
    /// Whether `predicate` contains a top level OR.
    predicate_disjunctive: bool,
    /// Column equality filters, AND-ed together and with `predicate`.
    pub filter_map: Vec<(String, Value)>,
    pub sort: Vec<SortKey>,
    pub limit: Limit,
    /// Pending column/value pairs for a partial update.
    pub updates: Vec<(String, Value)>,
}

impl QuerySpec {
    pub fn new(table: impl Into<String>) -> Self {
        QuerySpec {
            table: table.into(),
            ..Default::default()
        }
    }

    pub fn select<I, S>(&mut self, fields: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields.extend(fields.into_iter().map(Into::into));
        self
    }

    /// AND a predicate fragment onto the generic filter.
    pub fn filter(&mut self, expr: &str, args: impl IntoIterator<Item = Value>) -> &mut Self {
        self.push_predicate(" AND ", expr, args);
        self
    }

    /// OR a predicate fragment onto the generic filter.
    ///
    /// Fragments are joined as written, so a later `filter` is not grouped:
    /// `a`, OR `b`, AND `c` renders `a OR b AND c`, which SQL reads as
    /// `a OR (b AND c)`. Only a filter map ANDed on top wraps the
    /// disjunction in parentheses.
    pub fn or_filter(&mut self, expr: &str, args: impl IntoIterator<Item = Value>) -> &mut Self {
        if !self.predicate.is_empty() {
            self.predicate_disjunctive = true;
        }
        self.push_predicate(" OR ", expr, args);
        self
    }

    fn push_predicate(&mut self, joiner: &str, expr: &str, args: impl IntoIterator<Item = Value>) {
        let expr = expr.trim();
        if expr.is_empty() {
            return;
        }
        if !self.predicate.is_empty() {
            self.predicate.push_str(joiner);
        }
        self.predicate.push_str(expr);
        self.predicate_args.extend(args);
    }

    /// AND a column equality onto the filter.
    pub fn filter_eq(&mut self, column: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.filter_map.push((column.into(), value.into()));
        self
    }

    /// Filter exclusively by primary key. Overrides every other filter at
    /// compile time.
    pub fn filter_primary_key(&mut self, values: Vec<Value>) -> &mut Self {
        let key = composite_key(&values);
        self.primary_key = Some(PrimaryKeyFilter { values, key });
        self
    }

    pub fn sort(&mut self, column: impl Into<String>, direction: Direction) -> &mut Self {
        self.sort.push(SortKey {
            column: column.into(),
            direction,
        });
        self
    }

    pub fn limit(&mut self, offset: u64, count: u64) -> &mut Self {
        self.limit = Limit { offset, count };
        self
    }

    pub fn set(&mut self, column: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.updates.push((column.into(), value.into()));
        self
    }

    /// Returns true if the spec filters rows in any way.
    pub fn has_filter(&self) -> bool {
        self.primary_key.is_some() || !self.predicate.is_empty() || !self.filter_map.is_empty()
    }

    /// Render the WHERE body and its arguments, without the keyword.
    ///
    /// The primary key filter wins over everything else. Otherwise the
    /// generic predicate and the filter map are AND-ed together.
    pub fn where_clause(&self, primary_key_columns: &[String]) -> Option<(String, Vec<Value>)> {
        if let Some(pk) = &self.primary_key {
            let sql = equality_list(primary_key_columns.iter().map(String::as_str));
            return Some((sql, pk.values.clone()));
        }

        if self.predicate.is_empty() && self.filter_map.is_empty() {
            return None;
        }

        let mut sql = String::new();
        let mut args = Vec::with_capacity(self.predicate_args.len() + self.filter_map.len());
        if !self.predicate.is_empty() {
            if self.predicate_disjunctive && !self.filter_map.is_empty() {
                sql.push('(');
                sql.push_str(&self.predicate);
                sql.push(')');
            } else {
                sql.push_str(&self.predicate);
            }
            args.extend(self.predicate_args.iter().cloned());
        }
        if !self.filter_map.is_empty() {
            if !sql.is_empty() {
                sql.push_str(" AND ");
            }
            sql.push_str(&equality_list(self.filter_map.iter().map(|(c, _)| c.as_str())));
            args.extend(self.filter_map.iter().map(|(_, v)| v.clone()));
        }

        Some((sql, args))
    }
}

/// `a=? AND b=?`
pub(crate) fn equality_list<'a>(columns: impl Iterator<Item = &'a str>) -> String {
    columns
        .map(|c| format!("{c}=?"))
        .collect::<Vec<_>>()
        .join(" AND ")
}
