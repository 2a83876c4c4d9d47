//! Compile a [`QuerySpec`] into dialect specific SQL text and positional
//! arguments.
//!
//! Compilation is pure: it never touches the store or the cache. Values are
//! always bound as `?` placeholders. Predicate and sort fragments supplied by
//! callers are copied into the text as-is.

use std::fmt;

use rowmap_error::{Result, fatal, validation};

use crate::dialect::Dialect;
use crate::schema::Schema;
use crate::spec::{Limit, QuerySpec, equality_list};
use crate::value::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    ReadOne,
    ReadAll,
    /// Write every non primary key column of a record.
    UpdateRecord,
    /// Write the query's pending field/value pairs.
    UpdateFields,
    Delete,
    Insert,
    InsertIgnore,
    Replace,
    Count,
    Sum(String),
    Max(String),
    Min(String),
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ReadOne => "read_one",
            Self::ReadAll => "read_all",
            Self::UpdateRecord => "update_record",
            Self::UpdateFields => "update_fields",
            Self::Delete => "delete",
            Self::Insert => "insert",
            Self::InsertIgnore => "insert_ignore",
            Self::Replace => "replace",
            Self::Count => "count",
            Self::Sum(_) => "sum",
            Self::Max(_) => "max",
            Self::Min(_) => "min",
        }
    }

    fn aggregate(&self) -> Option<String> {
        match self {
            Self::Count => Some("COUNT(*)".to_string()),
            Self::Sum(col) => Some(format!("SUM({col})")),
            Self::Max(col) => Some(format!("MAX({col})")),
            Self::Min(col) => Some(format!("MIN({col})")),
            _ => None,
        }
    }
}

/// Compiled SQL text plus its positional arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub args: Vec<Value>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, args: Vec<Value>) -> Self {
        Statement {
            sql: sql.into(),
            args,
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", render_statement(&self.sql, &self.args))
    }
}

/// Substitute rendered arguments for placeholders, for logging only.
///
/// Extra arguments are appended in brackets. Placeholders without an
/// argument are left untouched.
pub fn render_statement(sql: &str, args: &[Value]) -> String {
    let mut out = String::with_capacity(sql.len() + args.len() * 8);
    let mut args_iter = args.iter();
    for c in sql.chars() {
        if c == '?' {
            match args_iter.next() {
                Some(arg) => out.push_str(&arg.render()),
                None => out.push(c),
            }
        } else {
            out.push(c);
        }
    }
    let rest: Vec<_> = args_iter.map(Value::render).collect();
    if !rest.is_empty() {
        out.push_str(" [");
        out.push_str(&rest.join(", "));
        out.push(']');
    }
    out
}

/// Reject a primary key filter the table's key cannot satisfy.
pub(crate) fn check_primary_key_filter(schema: &Schema, spec: &QuerySpec) -> Result<()> {
    if let Some(pk) = &spec.primary_key {
        if schema.primary_key().is_empty() {
            return Err(validation!(
                "table '{}' has no primary key to filter by",
                schema.table()
            ));
        }
        if pk.values.len() != schema.primary_key().len() {
            return Err(validation!(
                "table '{}' has {} primary key columns, got {} values",
                schema.table(),
                schema.primary_key().len(),
                pk.values.len()
            ));
        }
    }
    Ok(())
}

fn where_sql(schema: &Schema, spec: &QuerySpec) -> Result<(String, Vec<Value>)> {
    check_primary_key_filter(schema, spec)?;
    Ok(match spec.where_clause(schema.primary_key()) {
        Some((sql, args)) => (format!(" WHERE {sql}"), args),
        None => (String::new(), Vec::new()),
    })
}

fn order_by_sql(spec: &QuerySpec) -> String {
    if spec.sort.is_empty() {
        return String::new();
    }
    let items: Vec<_> = spec
        .sort
        .iter()
        .map(|s| format!("{} {}", s.column, s.direction))
        .collect();
    format!(" ORDER BY {}", items.join(", "))
}

fn limit_sql(limit: Limit) -> String {
    match limit {
        Limit { count: 0, .. } => String::new(),
        Limit { offset: 0, count } => format!(" LIMIT {count}"),
        Limit { offset, count } => format!(" LIMIT {offset},{count}"),
    }
}

/// UPDATE and DELETE only take a row count, so an offset cannot be honored.
fn write_limit_sql(table: &str, limit: Limit) -> Result<String> {
    match limit {
        Limit { count: 0, .. } => Ok(String::new()),
        Limit { offset: 0, count } => Ok(format!(" LIMIT {count}")),
        Limit { offset, .. } => Err(validation!(
            "limited write on table '{table}' cannot skip {offset} rows"
        )),
    }
}

fn require_row<'a>(action: &Action, row: Option<&'a [Value]>, schema: &Schema) -> Result<&'a [Value]> {
    let row = row.ok_or_else(|| fatal!("{} requires a record", action.name()))?;
    if row.len() != schema.fields().num_columns() {
        return Err(fatal!(
            "record for table '{}' has {} values, expected {}",
            schema.table(),
            row.len(),
            schema.fields().num_columns()
        ));
    }
    Ok(row)
}

fn insert_statement(verb: &str, schema: &Schema, row: &[Value], skip_auto_increment: bool) -> Statement {
    let mut columns = Vec::with_capacity(row.len());
    let mut args = Vec::with_capacity(row.len());
    for (desc, value) in schema.fields().columns().zip(row) {
        let Some(column) = desc.column.as_deref() else {
            continue;
        };
        if skip_auto_increment && schema.auto_increment() == Some(column) {
            continue;
        }
        columns.push(column);
        args.push(value.clone());
    }

    let placeholders = vec!["?"; columns.len()].join(",");
    Statement::new(
        format!(
            "{verb} {} ({}) VALUES ({placeholders})",
            schema.table(),
            columns.join(",")
        ),
        args,
    )
}

/// Compile `spec` for `action`.
///
/// `row` holds the record's column values in schema column order and is
/// required by the record based actions (update by record, the inserts and
/// replace).
pub fn compile(
    schema: &Schema,
    spec: &QuerySpec,
    action: &Action,
    row: Option<&[Value]>,
    dialect: Dialect,
) -> Result<Statement> {
    let caps = dialect.capabilities();
    let table = schema.table();

    let stmt = match action {
        Action::ReadOne | Action::ReadAll => {
            let fields = if spec.fields.is_empty() {
                "*".to_string()
            } else {
                spec.fields.join(",")
            };
            let (where_, args) = where_sql(schema, spec)?;
            let limit = match action {
                Action::ReadOne => Limit::ONE,
                _ => spec.limit,
            };
            Statement::new(
                format!(
                    "SELECT {fields} FROM {table}{where_}{}{}",
                    order_by_sql(spec),
                    limit_sql(limit)
                ),
                args,
            )
        }
        Action::Count | Action::Sum(_) | Action::Max(_) | Action::Min(_) => {
            let expr = action.aggregate().unwrap_or_default();
            let (where_, args) = where_sql(schema, spec)?;
            Statement::new(
                format!("SELECT {expr} FROM {table}{where_}{}", limit_sql(Limit::ONE)),
                args,
            )
        }
        Action::UpdateRecord => {
            let row = require_row(action, row, schema)?;
            let mut set_columns = Vec::new();
            let mut args = Vec::new();
            let mut pk_args = Vec::new();
            for (desc, value) in schema.fields().columns().zip(row) {
                let Some(column) = desc.column.as_deref() else {
                    continue;
                };
                if schema.is_primary_key(column) {
                    continue;
                }
                set_columns.push(format!("{column}=?"));
                args.push(value.clone());
            }
            if set_columns.is_empty() {
                return Err(validation!(
                    "table '{table}' has no non primary key columns to update"
                ));
            }

            let (mut where_, where_args) = where_sql(schema, spec)?;
            if where_.is_empty() {
                if schema.primary_key().is_empty() {
                    return Err(validation!(
                        "update of table '{table}' needs a filter or a primary key"
                    ));
                }
                for path in schema.primary_key_paths() {
                    let idx = schema
                        .fields()
                        .columns()
                        .position(|d| &d.path == path)
                        .ok_or_else(|| fatal!("primary key path {path:?} not mapped"))?;
                    pk_args.push(row[idx].clone());
                }
                where_ = format!(
                    " WHERE {}",
                    equality_list(schema.primary_key().iter().map(String::as_str))
                );
            }
            args.extend(where_args);
            args.extend(pk_args);

            let limit = if caps.limit_on_update_delete {
                limit_sql(Limit::ONE)
            } else {
                String::new()
            };
            Statement::new(
                format!("UPDATE {table} SET {}{where_}{limit}", set_columns.join(",")),
                args,
            )
        }
        Action::UpdateFields => {
            if spec.updates.is_empty() {
                return Err(validation!("no fields to update on table '{table}'"));
            }
            let set_columns: Vec<_> = spec.updates.iter().map(|(c, _)| format!("{c}=?")).collect();
            let mut args: Vec<_> = spec.updates.iter().map(|(_, v)| v.clone()).collect();
            let (where_, where_args) = where_sql(schema, spec)?;
            args.extend(where_args);
            let limit = if caps.limit_on_update_delete {
                write_limit_sql(table, spec.limit)?
            } else {
                String::new()
            };
            Statement::new(
                format!("UPDATE {table} SET {}{where_}{limit}", set_columns.join(",")),
                args,
            )
        }
        Action::Delete => {
            let (where_, args) = where_sql(schema, spec)?;
            let limit = if caps.limit_on_update_delete {
                write_limit_sql(table, spec.limit)?
            } else {
                String::new()
            };
            Statement::new(format!("DELETE FROM {table}{where_}{limit}"), args)
        }
        Action::Insert => insert_statement("INSERT INTO", schema, require_row(action, row, schema)?, true),
        Action::InsertIgnore => {
            insert_statement(caps.insert_ignore, schema, require_row(action, row, schema)?, true)
        }
        Action::Replace => insert_statement(caps.replace, schema, require_row(action, row, schema)?, false),
    };

    Ok(stmt)
}

/// Select only the primary key columns of the rows `spec` matches, used to
/// find the cache entries a filtered write touches.
///
/// `apply_limit` should mirror whether the write itself is limited.
pub fn compile_key_scan(schema: &Schema, spec: &QuerySpec, apply_limit: bool) -> Result<Statement> {
    if schema.primary_key().is_empty() {
        return Err(validation!(
            "table '{}' has no primary key to scan",
            schema.table()
        ));
    }
    let (where_, args) = where_sql(schema, spec)?;
    let limit = if apply_limit {
        write_limit_sql(schema.table(), spec.limit)?
    } else {
        String::new()
    };
    Ok(Statement::new(
        format!(
            "SELECT {} FROM {}{where_}{limit}",
            schema.primary_key().join(","),
            schema.table()
        ),
        args,
    ))
}

pub fn compile_clear(schema: &Schema, dialect: Dialect) -> Statement {
    Statement::new(
        dialect.capabilities().clear_table.statement(schema.table()),
        Vec::new(),
    )
}
