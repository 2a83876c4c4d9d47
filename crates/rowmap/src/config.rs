use rowmap_error::{Result, validation};
use serde::{Deserialize, Serialize};

use crate::dialect::Dialect;

/// Mapper wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapperConfig {
    pub dialect: Dialect,
    /// Start in read-only mode.
    pub read_only: bool,
    /// Emit every compiled statement on the `rowmap::statement` target.
    pub log_statements: bool,
    pub log_errors: bool,
    /// Terminate the process after logging a fatal error.
    pub abort_on_fatal: bool,
}

impl Default for MapperConfig {
    fn default() -> Self {
        MapperConfig {
            dialect: Dialect::Sqlite,
            read_only: false,
            log_statements: false,
            log_errors: true,
            abort_on_fatal: false,
        }
    }
}

impl MapperConfig {
    pub fn new(dialect: Dialect) -> Self {
        MapperConfig {
            dialect,
            ..Default::default()
        }
    }

    pub fn from_json(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| validation!("invalid mapper config: {e}"))
    }

    pub fn with_log_statements(mut self, enabled: bool) -> Self {
        self.log_statements = enabled;
        self
    }

    pub fn with_log_errors(mut self, enabled: bool) -> Self {
        self.log_errors = enabled;
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing() {
        let config = MapperConfig::from_json(r#"{"dialect": "mysql", "log_statements": true}"#).unwrap();
        assert_eq!(
            MapperConfig {
                dialect: Dialect::MySql,
                log_statements: true,
                ..Default::default()
            },
            config
        );
        assert_eq!(MapperConfig::default(), MapperConfig::from_json("{}").unwrap());
    }

    #[test]
    fn rejects_unknown_dialect() {
        let err = MapperConfig::from_json(r#"{"dialect": "oracle"}"#).unwrap_err();
        assert_eq!(rowmap_error::ErrorKind::Validation, err.kind());
    }
}
