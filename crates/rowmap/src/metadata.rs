use std::sync::Arc;

use rowmap_error::Result;
use tracing::debug;

use crate::store::{Store, TableDescription, TableMetadata};
use crate::value::{FieldValue, Value};

const PRIMARY_KEY_QUERY: &str = "SELECT column_name FROM information_schema.key_column_usage \
     WHERE table_schema=DATABASE() AND table_name=? AND constraint_name='PRIMARY' \
     ORDER BY ordinal_position";

const AUTO_INCREMENT_QUERY: &str = "SELECT column_name FROM information_schema.columns \
     WHERE table_schema=DATABASE() AND table_name=? AND extra LIKE '%auto_increment%'";

/// Table descriptions read from MySQL's `information_schema`, through any
/// [`Store`] connected to a MySQL database.
#[derive(Debug, Clone)]
pub struct InformationSchemaMetadata {
    store: Arc<dyn Store>,
}

impl InformationSchemaMetadata {
    pub fn new(store: Arc<dyn Store>) -> Self {
        InformationSchemaMetadata { store }
    }

    fn column_names(&self, sql: &str, table: &str) -> Result<Vec<String>> {
        let result = self.store.query(sql, &[Value::from(table)])?;
        result
            .rows
            .into_iter()
            .filter_map(|row| row.into_iter().next())
            .map(String::from_value)
            .collect()
    }
}

impl TableMetadata for InformationSchemaMetadata {
    fn describe_table(&self, table: &str) -> Result<TableDescription> {
        let primary_key = self.column_names(PRIMARY_KEY_QUERY, table)?;
        let auto_increment = self.column_names(AUTO_INCREMENT_QUERY, table)?.into_iter().next();
        debug!(%table, ?primary_key, ?auto_increment, "read table description");
        Ok(TableDescription {
            primary_key,
            auto_increment,
        })
    }
}
