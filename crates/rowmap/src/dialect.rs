use std::fmt;

use rowmap_error::{Result, validation};
use serde::{Deserialize, Serialize};

/// SQL flavor statements are compiled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    #[serde(rename = "mysql")]
    MySql,
    #[default]
    Sqlite,
}

/// How a dialect empties a whole table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearTable {
    Truncate,
    DeleteAll,
}

impl ClearTable {
    pub fn statement(&self, table: &str) -> String {
        match self {
            Self::Truncate => format!("TRUNCATE TABLE {table}"),
            Self::DeleteAll => format!("DELETE FROM {table}"),
        }
    }
}

/// Everything the compiler needs to know about a dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialectCapabilities {
    /// UPDATE and DELETE accept a LIMIT clause.
    pub limit_on_update_delete: bool,
    pub insert_ignore: &'static str,
    pub replace: &'static str,
    pub clear_table: ClearTable,
}

const MYSQL: DialectCapabilities = DialectCapabilities {
    limit_on_update_delete: true,
    insert_ignore: "INSERT IGNORE INTO",
    replace: "REPLACE INTO",
    clear_table: ClearTable::Truncate,
};

const SQLITE: DialectCapabilities = DialectCapabilities {
    limit_on_update_delete: false,
    insert_ignore: "INSERT OR IGNORE INTO",
    replace: "INSERT OR REPLACE INTO",
    clear_table: ClearTable::DeleteAll,
};

impl Dialect {
    pub fn capabilities(&self) -> &'static DialectCapabilities {
        match self {
            Self::MySql => &MYSQL,
            Self::Sqlite => &SQLITE,
        }
    }

    /// Pick the dialect for a driver name such as "mysql" or "sqlite3".
    pub fn from_driver_name(name: &str) -> Result<Self> {
        let lower = name.trim().to_ascii_lowercase();
        if lower.starts_with("mysql") {
            Ok(Self::MySql)
        } else if lower.starts_with("sqlite") {
            Ok(Self::Sqlite)
        } else {
            Err(validation!("unsupported driver: {name}"))
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MySql => write!(f, "mysql"),
            Self::Sqlite => write!(f, "sqlite"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_names() {
        assert_eq!(Dialect::MySql, Dialect::from_driver_name("mysql").unwrap());
        assert_eq!(Dialect::Sqlite, Dialect::from_driver_name("sqlite3").unwrap());
        assert_eq!(Dialect::Sqlite, Dialect::from_driver_name(" SQLite ").unwrap());
        assert!(Dialect::from_driver_name("postgres").is_err());
    }

    #[test]
    fn clear_statements() {
        assert_eq!(
            "TRUNCATE TABLE t",
            Dialect::MySql.capabilities().clear_table.statement("t")
        );
        assert_eq!(
            "DELETE FROM t",
            Dialect::Sqlite.capabilities().clear_table.statement("t")
        );
    }

    #[test]
    fn serde_names() {
        let d: Dialect = serde_json::from_str("\"mysql\"").unwrap();
        assert_eq!(Dialect::MySql, d);
        assert_eq!("\"sqlite\"", serde_json::to_string(&Dialect::Sqlite).unwrap());
    }
}
