//! Fluent per-call query builder and its terminal operations.
//!
//! Every write keeps the table cache in step with the store when the cache
//! is active: the store is written first, then the cache. There is no
//! transaction spanning the two.

use std::marker::PhantomData;
use std::sync::Arc;

use rowmap_error::{MapperError, Result, validation};
use tracing::{debug, warn};

use crate::cache::{CacheMap, patch_entry, remove_entry, snapshot, store_entry};
use crate::compile::{Action, check_primary_key_filter, compile, compile_clear, compile_key_scan};
use crate::mapper::Mapper;
use crate::materialize::{RowMaterializer, read_all, read_one};
use crate::record::Record;
use crate::schema::Schema;
use crate::spec::{Direction, QuerySpec};
use crate::store::ExecResult;
use crate::value::{FieldValue, Value};

/// How a delete keeps the cache in step.
enum DeletePlan {
    /// Unfiltered delete, reload the whole table afterwards.
    Reload,
    /// Remove exactly these keys afterwards.
    Keys(Vec<String>),
}

pub struct Query<'a, R> {
    mapper: &'a Mapper,
    spec: QuerySpec,
    _record: PhantomData<fn() -> R>,
}

impl<R> std::fmt::Debug for Query<'_, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query").field("spec", &self.spec).finish_non_exhaustive()
    }
}

impl<'a, R: Record> Query<'a, R> {
    pub(crate) fn new(mapper: &'a Mapper, table: &str) -> Self {
        Query {
            mapper,
            spec: QuerySpec::new(table),
            _record: PhantomData,
        }
    }

    pub fn spec(&self) -> &QuerySpec {
        &self.spec
    }

    pub fn select<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spec.select(fields);
        self
    }

    /// AND a raw predicate. `expr` is copied into the statement text,
    /// values go through `args`.
    pub fn filter(mut self, expr: &str, args: impl IntoIterator<Item = Value>) -> Self {
        self.spec.filter(expr, args);
        self
    }

    pub fn and_filter(self, expr: &str, args: impl IntoIterator<Item = Value>) -> Self {
        self.filter(expr, args)
    }

    /// OR a raw predicate. Predicates ANDed afterwards are not grouped with
    /// the disjunction, see [`QuerySpec::or_filter`].
    pub fn or_filter(mut self, expr: &str, args: impl IntoIterator<Item = Value>) -> Self {
        self.spec.or_filter(expr, args);
        self
    }

    pub fn filter_eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.spec.filter_eq(column, value);
        self
    }

    /// AND several column equalities.
    pub fn filter_map<I, S>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, Value)>,
        S: Into<String>,
    {
        for (column, value) in pairs {
            self.spec.filter_eq(column, value);
        }
        self
    }

    /// Match exactly one row by its primary key values, in key order. Any
    /// other filter is ignored.
    pub fn filter_primary_key<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.spec
            .filter_primary_key(values.into_iter().map(Into::into).collect());
        self
    }

    pub fn sort(mut self, column: impl Into<String>, direction: Direction) -> Self {
        self.spec.sort(column, direction);
        self
    }

    pub fn sort_many<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = (S, Direction)>,
        S: Into<String>,
    {
        for (column, direction) in keys {
            self.spec.sort(column, direction);
        }
        self
    }

    /// Skip `offset` rows and return at most `count`. A count of 0 is
    /// unbounded.
    pub fn limit(mut self, offset: u64, count: u64) -> Self {
        self.spec.limit(offset, count);
        self
    }

    /// Queue a column assignment for [`update_fields`](Self::update_fields).
    pub fn set(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.spec.set(column, value);
        self
    }

    fn schema(&self) -> Result<Arc<Schema>> {
        self.mapper.resolve::<R>(&self.spec.table)
    }

    fn cache_map(&self, schema: &Schema) -> Result<Option<Arc<CacheMap<R>>>> {
        self.mapper.cache().active_map::<R>(schema)
    }

    fn done<T>(&self, op: &str, result: Result<T>) -> Result<T> {
        self.mapper.finish(op, &self.spec.table, result)
    }

    fn read_only(&self, op: &str) -> bool {
        let read_only = self.mapper.is_read_only();
        if read_only {
            debug!(table = %self.spec.table, %op, "read only, skipping write");
        }
        read_only
    }

    /// First matching row.
    ///
    /// Returns [`MapperError::NoRows`] if nothing matches. A primary key
    /// lookup on an actively cached table is answered from the cache alone.
    pub fn one(self) -> Result<R> {
        let result = self.one_inner();
        self.done("one", result)
    }

    fn one_inner(&self) -> Result<R> {
        let schema = self.schema()?;
        check_primary_key_filter(&schema, &self.spec)?;
        if let Some(pk) = &self.spec.primary_key {
            if let Some(map) = self.cache_map(&schema)? {
                return map
                    .read(pk.key.as_str(), |_, record| record.clone())
                    .ok_or(MapperError::NoRows);
            }
        }

        let stmt = compile(&schema, &self.spec, &Action::ReadOne, None, self.mapper.dialect())?;
        let result = self.mapper.query_statement(&stmt)?;
        read_one(&schema, result)
    }

    /// All matching rows. Empty if nothing matches.
    pub fn all(self) -> Result<Vec<R>> {
        let result = self.all_inner();
        self.done("all", result)
    }

    fn all_inner(&self) -> Result<Vec<R>> {
        let schema = self.schema()?;
        let stmt = compile(&schema, &self.spec, &Action::ReadAll, None, self.mapper.dialect())?;
        let result = self.mapper.query_statement(&stmt)?;
        read_all(&schema, result)
    }

    /// Number of matching rows. Unfiltered counts on an actively cached
    /// table come from the cache.
    pub fn count(self) -> Result<i64> {
        let result = self.count_inner();
        self.done("count", result)
    }

    fn count_inner(&self) -> Result<i64> {
        let schema = self.schema()?;
        if !self.spec.has_filter() {
            if let Some(map) = self.cache_map(&schema)? {
                return Ok(map.len() as i64);
            }
        }
        self.aggregate(&schema, Action::Count)
    }

    /// `SUM(column)` over matching rows. NULL (no rows) decodes as the zero
    /// value unless `T` is an `Option`.
    pub fn sum<T: FieldValue>(self, column: &str) -> Result<T> {
        let result = self
            .schema()
            .and_then(|schema| self.aggregate(&schema, Action::Sum(column.to_string())));
        self.done("sum", result)
    }

    pub fn max<T: FieldValue>(self, column: &str) -> Result<T> {
        let result = self
            .schema()
            .and_then(|schema| self.aggregate(&schema, Action::Max(column.to_string())));
        self.done("max", result)
    }

    pub fn min<T: FieldValue>(self, column: &str) -> Result<T> {
        let result = self
            .schema()
            .and_then(|schema| self.aggregate(&schema, Action::Min(column.to_string())));
        self.done("min", result)
    }

    fn aggregate<T: FieldValue>(&self, schema: &Schema, action: Action) -> Result<T> {
        let stmt = compile(schema, &self.spec, &action, None, self.mapper.dialect())?;
        let value = match self.mapper.query_statement(&stmt) {
            Ok(result) => result.scalar().cloned().unwrap_or(Value::Null),
            Err(e) if e.is_no_rows() => Value::Null,
            Err(e) => return Err(e),
        };
        T::from_value(value)
            .map_err(|e| MapperError::Fatal(format!("{}: {e}", action.name())))
    }

    /// Insert `record` and return the generated id.
    ///
    /// The autoincrement field, if any, is set to the generated id.
    pub fn insert(self, record: &mut R) -> Result<i64> {
        if self.read_only("insert") {
            return Ok(0);
        }
        let result = self.insert_inner(record, Action::Insert);
        self.done("insert", result)
    }

    /// Like [`insert`](Self::insert), but a row that collides with an
    /// existing key is skipped. Skipped rows return 0 and leave `record` and
    /// the cache untouched.
    pub fn insert_ignore(self, record: &mut R) -> Result<i64> {
        if self.read_only("insert_ignore") {
            return Ok(0);
        }
        let result = match self.insert_inner(record, Action::InsertIgnore) {
            Err(e) if e.is_duplicate() => {
                debug!(table = %self.spec.table, "ignored duplicate insert");
                Ok(0)
            }
            other => other,
        };
        self.done("insert_ignore", result)
    }

    fn insert_inner(&self, record: &mut R, action: Action) -> Result<i64> {
        let schema = self.schema()?;
        let row = schema.column_values(record)?;
        let stmt = compile(&schema, &self.spec, &action, Some(&row), self.mapper.dialect())?;
        let log_duplicates = action != Action::InsertIgnore;
        let res = self.mapper.execute_statement(&stmt, log_duplicates)?;

        if action == Action::InsertIgnore && res.rows_affected == 0 {
            debug!(table = %self.spec.table, "insert ignored");
            return Ok(0);
        }

        if let Some(desc) = schema.auto_increment_field() {
            record.set_field(&desc.path, Value::Int(res.last_insert_id))?;
        }
        self.cache_record(&schema, record)?;

        Ok(res.last_insert_id)
    }

    /// Insert `record`, replacing any row with the same key. Returns the
    /// store's last inserted id.
    pub fn replace(self, record: &R) -> Result<i64> {
        if self.read_only("replace") {
            return Ok(0);
        }
        let result = self.write_record(record, Action::Replace).map(|res| res.last_insert_id);
        self.done("replace", result)
    }

    /// Write every non primary key column of `record`. Without a filter the
    /// row is matched by the record's own primary key.
    ///
    /// The cached copy under the record's key is overwritten regardless of
    /// how many rows matched.
    pub fn update(self, record: &R) -> Result<u64> {
        if self.read_only("update") {
            return Ok(0);
        }
        let result = self
            .write_record(record, Action::UpdateRecord)
            .map(|res| res.rows_affected);
        self.done("update", result)
    }

    fn write_record(&self, record: &R, action: Action) -> Result<ExecResult> {
        let schema = self.schema()?;
        let row = schema.column_values(record)?;
        let stmt = compile(&schema, &self.spec, &action, Some(&row), self.mapper.dialect())?;
        let res = self.mapper.execute_statement(&stmt, true)?;
        self.cache_record(&schema, record)?;
        Ok(res)
    }

    fn cache_record(&self, schema: &Schema, record: &R) -> Result<()> {
        if let Some(map) = self.cache_map(schema)? {
            let key = schema.composite_key(record)?;
            store_entry(&map, key, record.clone());
        }
        Ok(())
    }

    /// Assign `pairs` (plus anything queued with [`set`](Self::set)) on every
    /// matching row. Primary key columns are never assigned.
    pub fn update_fields<I, S>(mut self, pairs: I) -> Result<u64>
    where
        I: IntoIterator<Item = (S, Value)>,
        S: Into<String>,
    {
        if self.read_only("update_fields") {
            return Ok(0);
        }
        for (column, value) in pairs {
            self.spec.set(column, value);
        }
        let result = self.update_fields_inner();
        self.done("update_fields", result)
    }

    fn update_fields_inner(&mut self) -> Result<u64> {
        let schema = self.schema()?;

        let table = self.spec.table.clone();
        self.spec.updates.retain(|(column, _)| {
            let keep = !schema.is_primary_key(column);
            if !keep {
                debug!(%table, %column, "dropping primary key column from update");
            }
            keep
        });
        if self.spec.updates.is_empty() {
            return Err(validation!("no fields to update on table '{table}'"));
        }

        let map = self.cache_map(&schema)?;
        let keys = match &map {
            Some(_) => self.matching_keys(&schema)?,
            None => Vec::new(),
        };

        let stmt = compile(&schema, &self.spec, &Action::UpdateFields, None, self.mapper.dialect())?;
        let res = self.mapper.execute_statement(&stmt, true)?;

        if let Some(map) = map {
            for key in &keys {
                let patched = patch_entry(&map, key, |record| {
                    for (column, value) in &self.spec.updates {
                        match schema.fields().by_column(column) {
                            Some(desc) => record.set_field(&desc.path, value.clone())?,
                            None => {
                                warn!(%table, %column, "updated column not mapped, cache not patched");
                            }
                        }
                    }
                    Ok(())
                });
                match patched {
                    Some(result) => result?,
                    None => {
                        debug!(%table, %key, "updated row not cached");
                    }
                }
            }
        }

        Ok(res.rows_affected)
    }

    /// Keys of the rows the current filter matches, read before a write.
    fn matching_keys(&self, schema: &Schema) -> Result<Vec<String>> {
        if let Some(pk) = &self.spec.primary_key {
            return Ok(vec![pk.key.clone()]);
        }

        let apply_limit = self
            .mapper
            .dialect()
            .capabilities()
            .limit_on_update_delete;
        let stmt = compile_key_scan(schema, &self.spec, apply_limit)?;
        let result = match self.mapper.query_statement(&stmt) {
            Ok(result) => result,
            Err(e) if e.is_no_rows() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let materializer = RowMaterializer::new(schema, &result.columns);
        result
            .rows
            .into_iter()
            .map(|row| {
                let record: R = materializer.materialize(row)?;
                schema.composite_key(&record)
            })
            .collect()
    }

    /// Delete matching rows and return how many were removed.
    pub fn delete(self) -> Result<u64> {
        if self.read_only("delete") {
            return Ok(0);
        }
        let result = self.delete_inner();
        self.done("delete", result)
    }

    fn delete_inner(&self) -> Result<u64> {
        let schema = self.schema()?;

        let plan = match self.cache_map(&schema)? {
            None => None,
            Some(map) if !self.spec.has_filter() => Some((map, DeletePlan::Reload)),
            Some(map) => {
                let keys = self.matching_keys(&schema)?;
                Some((map, DeletePlan::Keys(keys)))
            }
        };

        let stmt = compile(&schema, &self.spec, &Action::Delete, None, self.mapper.dialect())?;
        let res = self.mapper.execute_statement(&stmt, true)?;

        match plan {
            None => (),
            Some((_, DeletePlan::Reload)) => self.mapper.load_table_cache::<R>(&self.spec.table)?,
            Some((map, DeletePlan::Keys(keys))) => {
                for key in &keys {
                    if !remove_entry(&map, key) {
                        debug!(table = %self.spec.table, %key, "deleted row not cached");
                    }
                }
            }
        }

        Ok(res.rows_affected)
    }

    /// Empty the table, and its cache if it has one.
    pub fn truncate(self) -> Result<()> {
        if self.read_only("truncate") {
            return Ok(());
        }
        let result = self.truncate_inner();
        self.done("truncate", result)
    }

    fn truncate_inner(&self) -> Result<()> {
        let schema = self.schema()?;
        if self.mapper.cache().is_registered(&self.spec.table) {
            self.mapper
                .cache()
                .replace::<R>(&self.spec.table, CacheMap::new())?;
        }
        let stmt = compile_clear(&schema, self.mapper.dialect());
        self.mapper.execute_statement(&stmt, true)?;
        Ok(())
    }

    /// Reload this table's cache from the store.
    pub fn load_cache(self) -> Result<()> {
        let result = self.load_cache_inner();
        self.done("load_cache", result)
    }

    fn load_cache_inner(&self) -> Result<()> {
        let schema = self.schema()?;
        if !schema.cache_enabled() || !self.mapper.cache().is_registered(&self.spec.table) {
            return Err(validation!(
                "table '{}' is not bound with caching enabled",
                self.spec.table
            ));
        }
        self.mapper.load_table_cache::<R>(&self.spec.table)
    }

    /// Every cached record of this table, in no particular order. `None`
    /// when the table's cache is not active.
    pub fn cached_all(self) -> Result<Option<Vec<R>>> {
        let result = self
            .schema()
            .and_then(|schema| self.cache_map(&schema))
            .map(|map| map.map(|map| snapshot(&map)));
        self.done("cached_all", result)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use parking_lot::Mutex;
    use rowmap_error::{ErrorKind, StoreError, StoreErrorCode};

    use super::*;
    use crate::config::MapperConfig;
    use crate::dialect::Dialect;
    use crate::store::{ResultSet, StaticMetadata, Store, TableDescription};

    /// Answers queries from a queue of canned results.
    #[derive(Debug, Default)]
    struct CannedStore {
        results: Mutex<VecDeque<ResultSet>>,
        statements: Mutex<Vec<String>>,
        /// Returned by the next query instead of a result.
        failure: Mutex<Option<StoreError>>,
    }

    impl Store for CannedStore {
        fn execute(&self, sql: &str, _args: &[Value]) -> Result<ExecResult, StoreError> {
            self.statements.lock().push(sql.to_string());
            Ok(ExecResult {
                last_insert_id: 3,
                rows_affected: 1,
            })
        }

        fn query(&self, sql: &str, _args: &[Value]) -> Result<ResultSet, StoreError> {
            self.statements.lock().push(sql.to_string());
            if let Some(err) = self.failure.lock().take() {
                return Err(err);
            }
            Ok(self.results.lock().pop_front().unwrap_or_default())
        }
    }

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Tag {
        id: i64,
        name: String,
    }

    crate::record! {
        Tag {
            id: i64 => "id",
            name: String => "name",
        }
    }

    fn rows(ids: &[i64]) -> ResultSet {
        ResultSet {
            columns: vec!["id".to_string(), "name".to_string()],
            rows: ids
                .iter()
                .map(|id| vec![Value::Int(*id), Value::Text(format!("t{id}"))])
                .collect(),
        }
    }

    fn setup(dialect: Dialect, loaded: &[i64]) -> (Arc<CannedStore>, Mapper) {
        let store = Arc::new(CannedStore::default());
        store.results.lock().push_back(rows(loaded));
        let metadata = StaticMetadata::new().with_table(
            "tags",
            TableDescription::new(["id"]).with_auto_increment("id"),
        );
        let mapper = Mapper::with_metadata(MapperConfig::new(dialect), store.clone(), Arc::new(metadata));
        mapper.bind::<Tag>("tags", true).unwrap();
        mapper.enable_cache(true).unwrap();
        store.statements.lock().clear();
        (store, mapper)
    }

    #[test]
    fn limited_delete_scans_keys_with_limit() {
        let (store, mapper) = setup(Dialect::MySql, &[1, 2, 3]);
        store.results.lock().push_back(rows(&[2]));

        mapper
            .table::<Tag>("tags")
            .filter("name LIKE ?", [Value::from("t%")])
            .limit(0, 1)
            .delete()
            .unwrap();

        assert_eq!(
            vec![
                "SELECT id FROM tags WHERE name LIKE ? LIMIT 1".to_string(),
                "DELETE FROM tags WHERE name LIKE ? LIMIT 1".to_string(),
            ],
            *store.statements.lock()
        );
        let map = mapper.cache().map::<Tag>("tags").unwrap();
        assert_eq!(2, map.len());
        assert!(!map.contains("2"));
    }

    #[test]
    fn sqlite_key_scan_ignores_limit() {
        let (store, mapper) = setup(Dialect::Sqlite, &[1, 2]);
        store.results.lock().push_back(rows(&[1, 2]));

        mapper
            .table::<Tag>("tags")
            .filter("id>?", [Value::Int(0)])
            .limit(0, 1)
            .update_fields([("name", Value::from("x"))])
            .unwrap();

        assert_eq!(
            vec![
                "SELECT id FROM tags WHERE id>?".to_string(),
                "UPDATE tags SET name=? WHERE id>?".to_string(),
            ],
            *store.statements.lock()
        );
        let map = mapper.cache().map::<Tag>("tags").unwrap();
        assert_eq!(Some("x".to_string()), map.read("1", |_, t| t.name.clone()));
        assert_eq!(Some("x".to_string()), map.read("2", |_, t| t.name.clone()));
    }

    #[test]
    fn cached_fast_paths_skip_store() {
        let (store, mapper) = setup(Dialect::Sqlite, &[1, 2]);

        let tag: Tag = mapper.table("tags").filter_primary_key([2]).one().unwrap();
        assert_eq!("t2", tag.name);
        assert_eq!(2, mapper.table::<Tag>("tags").count().unwrap());
        assert!(mapper.table::<Tag>("tags").filter_primary_key([9]).one().unwrap_err().is_no_rows());
        assert!(store.statements.lock().is_empty());
    }

    #[test]
    fn insert_backfills_and_caches() {
        let (store, mapper) = setup(Dialect::Sqlite, &[]);
        let mut tag = Tag {
            id: 0,
            name: "new".to_string(),
        };
        assert_eq!(3, mapper.table::<Tag>("tags").insert(&mut tag).unwrap());
        assert_eq!(3, tag.id);
        assert_eq!(
            vec!["INSERT INTO tags (name) VALUES (?)".to_string()],
            *store.statements.lock()
        );
        let cached = mapper.table::<Tag>("tags").cached_all().unwrap().unwrap();
        assert_eq!(vec![tag], cached);
    }

    #[test]
    fn read_all_propagates_store_no_rows() {
        let (store, mapper) = setup(Dialect::Sqlite, &[1]);
        *store.failure.lock() = Some(StoreError::new("no rows").with_code(StoreErrorCode::NoRows));

        let err = mapper.table::<Tag>("tags").filter_eq("name", "t1").all().unwrap_err();
        assert!(err.is_no_rows());
        assert_eq!(ErrorKind::NotFound, err.kind());
    }

    #[test]
    fn primary_key_arity_checked_before_cache() {
        let (store, mapper) = setup(Dialect::Sqlite, &[1]);

        let err = mapper
            .table::<Tag>("tags")
            .filter_primary_key([1, 2])
            .one()
            .unwrap_err();
        assert_eq!(ErrorKind::Validation, err.kind());
        assert!(store.statements.lock().is_empty());

        mapper.enable_cache(false).unwrap();
        let err = mapper
            .table::<Tag>("tags")
            .filter_primary_key([1, 2])
            .one()
            .unwrap_err();
        assert_eq!(ErrorKind::Validation, err.kind());
    }
}
