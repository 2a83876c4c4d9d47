//! Per-table schema derivation and the registry that caches it.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rowmap_error::{Result, fatal};
use tracing::debug;

use crate::record::{Member, MemberKind, Record, RecordShape};
use crate::spec::composite_key;
use crate::store::{TableDescription, TableMetadata};
use crate::value::{FieldType, Value};

/// Maps one record member to (optionally) one column.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescriptor {
    /// Column name, `None` for in-memory only members.
    pub column: Option<String>,
    pub field: String,
    /// Member indices from the record root down to this field.
    pub path: Vec<usize>,
    pub field_type: FieldType,
}

/// Ordered field descriptors with lookups by field and column name.
#[derive(Debug, Clone, Default)]
pub struct FieldIndex {
    fields: Vec<FieldDescriptor>,
    by_field: HashMap<String, usize>,
    by_column: HashMap<String, usize>,
    /// Indices into `fields` for descriptors that carry a column, in
    /// declaration order.
    columns: Vec<usize>,
}

impl FieldIndex {
    /// Register a descriptor. Returns false (and changes nothing) if a
    /// descriptor with the same field name already exists.
    ///
    /// Errors if the column is already bound to a different field.
    pub fn add(&mut self, desc: FieldDescriptor) -> Result<bool> {
        if self.by_field.contains_key(&desc.field) {
            return Ok(false);
        }
        if let Some(column) = &desc.column {
            if let Some(&existing) = self.by_column.get(column) {
                return Err(fatal!(
                    "column '{column}' mapped by both '{}' and '{}'",
                    self.fields[existing].field,
                    desc.field
                ));
            }
        }

        let idx = self.fields.len();
        self.by_field.insert(desc.field.clone(), idx);
        if let Some(column) = &desc.column {
            self.by_column.insert(column.clone(), idx);
            self.columns.push(idx);
        }
        self.fields.push(desc);

        Ok(true)
    }

    pub fn by_field(&self, field: &str) -> Option<&FieldDescriptor> {
        self.by_field.get(field).map(|idx| &self.fields[*idx])
    }

    pub fn by_column(&self, column: &str) -> Option<&FieldDescriptor> {
        self.by_column.get(column).map(|idx| &self.fields[*idx])
    }

    /// All descriptors, including in-memory only members.
    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    /// Descriptors that map to a column, in declaration order.
    pub fn columns(&self) -> impl ExactSizeIterator<Item = &FieldDescriptor> + '_ {
        self.columns.iter().map(|idx| &self.fields[*idx])
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }
}

fn flatten_members(
    members: &[Member],
    prefix: &mut Vec<usize>,
    index: &mut FieldIndex,
) -> Result<()> {
    for (idx, member) in members.iter().enumerate() {
        prefix.push(idx);
        match &member.kind {
            MemberKind::Field(field_type) => {
                let added = index.add(FieldDescriptor {
                    column: member.column.map(|c| c.to_string()),
                    field: member.name.to_string(),
                    path: prefix.clone(),
                    field_type: *field_type,
                })?;
                if !added {
                    debug!(field = member.name, "ignoring duplicate field registration");
                }
            }
            MemberKind::Embedded(RecordShape::Struct { members, .. }) => {
                flatten_members(members, prefix, index)?;
            }
            MemberKind::Embedded(RecordShape::Scalar { type_name, .. }) => {
                return Err(fatal!(
                    "embedded member '{}' has non-record type {type_name}",
                    member.name
                ));
            }
        }
        prefix.pop();
    }
    Ok(())
}

/// Column mapping and key metadata for one table.
#[derive(Debug)]
pub struct Schema {
    table: String,
    fields: FieldIndex,
    primary_key: Vec<String>,
    primary_key_paths: Vec<Vec<usize>>,
    auto_increment: Option<String>,
    record_type: TypeId,
    record_type_name: &'static str,
    cache_enabled: AtomicBool,
}

impl Schema {
    /// Derive the schema for `table` from `R`'s shape and the table's key
    /// description.
    pub fn derive<R: Record>(table: &str, description: TableDescription) -> Result<Self> {
        let shape = R::shape();
        let members = match shape {
            RecordShape::Struct { members, .. } => members,
            RecordShape::Scalar { type_name, .. } => {
                return Err(fatal!(
                    "type {type_name} bound to table '{table}' is not a record-like type"
                ));
            }
        };

        let mut fields = FieldIndex::default();
        flatten_members(&members, &mut Vec::new(), &mut fields)?;

        let mut primary_key_paths = Vec::with_capacity(description.primary_key.len());
        for column in &description.primary_key {
            let desc = fields.by_column(column).ok_or_else(|| {
                fatal!(
                    "primary key column '{column}' of table '{table}' is not mapped by {}",
                    std::any::type_name::<R>()
                )
            })?;
            primary_key_paths.push(desc.path.clone());
        }

        let auto_increment = match description.auto_increment {
            Some(column) if fields.by_column(&column).is_some() => Some(column),
            Some(column) => {
                debug!(%table, %column, "autoincrement column not mapped by record");
                None
            }
            None => None,
        };

        Ok(Schema {
            table: table.to_string(),
            fields,
            primary_key: description.primary_key,
            primary_key_paths,
            auto_increment,
            record_type: TypeId::of::<R>(),
            record_type_name: std::any::type_name::<R>(),
            cache_enabled: AtomicBool::new(false),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn fields(&self) -> &FieldIndex {
        &self.fields
    }

    pub fn primary_key(&self) -> &[String] {
        &self.primary_key
    }

    pub fn primary_key_paths(&self) -> &[Vec<usize>] {
        &self.primary_key_paths
    }

    pub fn is_primary_key(&self, column: &str) -> bool {
        self.primary_key.iter().any(|c| c == column)
    }

    pub fn auto_increment(&self) -> Option<&str> {
        self.auto_increment.as_deref()
    }

    pub fn auto_increment_field(&self) -> Option<&FieldDescriptor> {
        self.auto_increment
            .as_deref()
            .and_then(|c| self.fields.by_column(c))
    }

    pub fn record_type_name(&self) -> &'static str {
        self.record_type_name
    }

    pub fn cache_enabled(&self) -> bool {
        self.cache_enabled.load(Ordering::Acquire)
    }

    pub fn set_cache_enabled(&self, enabled: bool) {
        self.cache_enabled.store(enabled, Ordering::Release)
    }

    /// Errors if this schema was derived for a record type other than `R`.
    pub fn check_record_type<R: Record>(&self) -> Result<()> {
        if self.record_type != TypeId::of::<R>() {
            return Err(fatal!(
                "table '{}' is bound to {}, not {}",
                self.table,
                self.record_type_name,
                std::any::type_name::<R>()
            ));
        }
        Ok(())
    }

    /// Values of every mapped column, in column order.
    pub fn column_values<R: Record>(&self, record: &R) -> Result<Vec<Value>> {
        self.fields
            .columns()
            .map(|desc| record.get_field(&desc.path))
            .collect()
    }

    pub fn primary_key_values<R: Record>(&self, record: &R) -> Result<Vec<Value>> {
        self.primary_key_paths
            .iter()
            .map(|path| record.get_field(path))
            .collect()
    }

    /// Composite key of `record`, used to index the table cache.
    pub fn composite_key<R: Record>(&self, record: &R) -> Result<String> {
        let values = self.primary_key_values(record)?;
        Ok(composite_key(&values))
    }
}

/// Derives schemas on first use and caches them per table.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    schemas: scc::HashMap<String, Arc<Schema>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the schema for `table`, deriving it from `R` on first reference.
    pub fn resolve<R: Record>(&self, table: &str, metadata: &dyn TableMetadata) -> Result<Arc<Schema>> {
        if let Some(schema) = self.get(table) {
            schema.check_record_type::<R>()?;
            return Ok(schema);
        }

        let description = metadata.describe_table(table)?;
        let schema = Arc::new(Schema::derive::<R>(table, description)?);
        debug!(
            %table,
            record = schema.record_type_name(),
            primary_key = ?schema.primary_key(),
            auto_increment = ?schema.auto_increment(),
            "derived schema"
        );

        // Another caller may have raced us, first insert wins.
        match self.schemas.entry(table.to_string()) {
            scc::hash_map::Entry::Occupied(ent) => {
                let existing = ent.get().clone();
                existing.check_record_type::<R>()?;
                Ok(existing)
            }
            scc::hash_map::Entry::Vacant(ent) => {
                ent.insert_entry(schema.clone());
                Ok(schema)
            }
        }
    }

    pub fn get(&self, table: &str) -> Option<Arc<Schema>> {
        self.schemas.read(table, |_, schema| schema.clone())
    }

    pub fn schemas(&self) -> Vec<Arc<Schema>> {
        let mut out = Vec::with_capacity(self.schemas.len());
        self.schemas.scan(|_, schema| out.push(schema.clone()));
        out
    }

    pub fn clear(&self) {
        self.schemas.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StaticMetadata;
    use crate::value::FieldType;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Audit {
        id: i64,
        created_by: String,
    }

    crate::record! {
        Audit {
            id: i64 => "audit_id",
            created_by: String => "created_by",
        }
    }

    #[derive(Debug, Clone, Default, PartialEq)]
    struct User {
        id: i64,
        name: String,
        note: String,
        audit: Audit,
    }

    crate::record! {
        User {
            id: i64 => "id",
            name: String => "name",
            note: String,
        }
        embed { audit: Audit }
    }

    #[derive(Debug, Clone, Default)]
    struct Counter(i64);

    impl Record for Counter {
        fn shape() -> RecordShape {
            RecordShape::Scalar {
                type_name: "Counter",
                field_type: FieldType::Int,
            }
        }

        fn get_field(&self, _path: &[usize]) -> Result<Value> {
            Ok(Value::Int(self.0))
        }

        fn set_field(&mut self, _path: &[usize], value: Value) -> Result<()> {
            self.0 = crate::value::FieldValue::from_value(value)?;
            Ok(())
        }
    }

    fn users_metadata() -> StaticMetadata {
        StaticMetadata::new().with_table("users", TableDescription::new(["id"]).with_auto_increment("id"))
    }

    #[test]
    fn flatten_embedded_and_dedupe_fields() {
        let schema = Schema::derive::<User>("users", TableDescription::new(["id"])).unwrap();

        let columns: Vec<_> = schema
            .fields()
            .columns()
            .map(|d| d.column.clone().unwrap())
            .collect();
        // The embedded `id` has the same field name as the outer one and is
        // ignored.
        assert_eq!(vec!["id", "name", "created_by"], columns);

        let by_field = schema.fields().by_field("created_by").unwrap();
        let by_column = schema.fields().by_column("created_by").unwrap();
        assert_eq!(by_field, by_column);
        assert_eq!(vec![3, 1], by_field.path);

        // In-memory member has a field entry but no column.
        assert!(schema.fields().by_field("note").unwrap().column.is_none());
        assert!(schema.fields().by_column("audit_id").is_none());
    }

    #[test]
    fn duplicate_field_registration_is_noop() {
        let mut index = FieldIndex::default();
        let desc = FieldDescriptor {
            column: Some("a".to_string()),
            field: "a".to_string(),
            path: vec![0],
            field_type: FieldType::Int,
        };
        assert!(index.add(desc.clone()).unwrap());
        let dup = FieldDescriptor {
            column: Some("b".to_string()),
            path: vec![1],
            ..desc
        };
        assert!(!index.add(dup).unwrap());
        assert_eq!(1, index.num_columns());
        assert!(index.by_column("b").is_none());
        assert_eq!(vec![0], index.by_field("a").unwrap().path);
    }

    #[test]
    fn duplicate_column_is_fatal() {
        let mut index = FieldIndex::default();
        index
            .add(FieldDescriptor {
                column: Some("a".to_string()),
                field: "a".to_string(),
                path: vec![0],
                field_type: FieldType::Int,
            })
            .unwrap();
        let err = index
            .add(FieldDescriptor {
                column: Some("a".to_string()),
                field: "other".to_string(),
                path: vec![1],
                field_type: FieldType::Int,
            })
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn scalar_shape_is_fatal() {
        let err = Schema::derive::<Counter>("counters", TableDescription::default()).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn unmapped_primary_key_is_fatal() {
        let err = Schema::derive::<User>("users", TableDescription::new(["uid"])).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn registry_caches_and_checks_type() {
        let registry = SchemaRegistry::new();
        let metadata = users_metadata();

        let a = registry.resolve::<User>("users", &metadata).unwrap();
        let b = registry.resolve::<User>("users", &metadata).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(Some("id"), a.auto_increment());

        let err = registry.resolve::<Audit>("users", &metadata).unwrap_err();
        assert!(err.is_fatal());

        registry.clear();
        assert!(registry.get("users").is_none());
    }

    #[test]
    fn cache_flag_updates_in_place() {
        let registry = SchemaRegistry::new();
        let schema = registry.resolve::<User>("users", &users_metadata()).unwrap();
        assert!(!schema.cache_enabled());
        schema.set_cache_enabled(true);
        assert!(registry.get("users").unwrap().cache_enabled());
    }

    #[test]
    fn record_key() {
        let schema = Schema::derive::<User>("users", TableDescription::new(["id", "name"])).unwrap();
        let user = User {
            id: 7,
            name: "a".to_string(),
            ..Default::default()
        };
        assert_eq!("7-a", schema.composite_key(&user).unwrap());
    }
}
