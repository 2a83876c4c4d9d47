use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use rowmap_error::{ErrorKind, MapperError, Result, validation};
use tracing::{debug, error, info};

use crate::cache::{CacheManager, Loader, build_map};
use crate::compile::{Action, Statement, compile};
use crate::config::MapperConfig;
use crate::dialect::Dialect;
use crate::materialize::read_all;
use crate::query::Query;
use crate::record::Record;
use crate::schema::{Schema, SchemaRegistry};
use crate::spec::QuerySpec;
use crate::store::{ExecResult, ResultSet, StatementVerb, Store, TableMetadata};
use crate::value::Value;

/// Target of the statement log.
pub const STATEMENT_TARGET: &str = "rowmap::statement";

/// Entry point for all mapping operations against one store.
///
/// Owns the schema registry, the table caches and the read-only flag. Safe
/// to share between threads.
#[derive(Debug)]
pub struct Mapper {
    store: Arc<dyn Store>,
    metadata: Arc<dyn TableMetadata>,
    config: MapperConfig,
    registry: SchemaRegistry,
    cache: CacheManager,
    read_only: AtomicBool,
}

impl Mapper {
    /// Create a mapper over a store that also describes its own tables.
    pub fn new<S>(config: MapperConfig, store: Arc<S>) -> Self
    where
        S: Store + TableMetadata + 'static,
    {
        let metadata: Arc<dyn TableMetadata> = store.clone();
        Self::with_metadata(config, store, metadata)
    }

    pub fn with_metadata(
        config: MapperConfig,
        store: Arc<dyn Store>,
        metadata: Arc<dyn TableMetadata>,
    ) -> Self {
        let read_only = AtomicBool::new(config.read_only);
        Mapper {
            store,
            metadata,
            config,
            registry: SchemaRegistry::new(),
            cache: CacheManager::new(),
            read_only,
        }
    }

    pub fn config(&self) -> &MapperConfig {
        &self.config
    }

    pub fn dialect(&self) -> Dialect {
        self.config.dialect
    }

    /// Start a query against `table`.
    pub fn table<R: Record>(&self, table: &str) -> Query<'_, R> {
        Query::new(self, table)
    }

    /// Resolve the schema for `table` now and set its cache flag.
    ///
    /// Binding again only updates the cache flag. If caching is enabled
    /// process wide, a newly cache-enabled table is loaded immediately.
    pub fn bind<R: Record>(&self, table: &str, cache_enabled: bool) -> Result<Arc<Schema>> {
        let result = self.bind_inner::<R>(table, cache_enabled);
        self.finish("bind", table, result)
    }

    fn bind_inner<R: Record>(&self, table: &str, cache_enabled: bool) -> Result<Arc<Schema>> {
        let schema = self.resolve::<R>(table)?;
        if cache_enabled && schema.primary_key().is_empty() {
            return Err(validation!(
                "table '{table}' has no primary key and cannot be cached"
            ));
        }

        let was_enabled = schema.cache_enabled();
        schema.set_cache_enabled(cache_enabled);
        if cache_enabled {
            let loader: Loader = load_table_cache::<R>;
            self.cache.register::<R>(table, loader);
            if !was_enabled && self.cache.is_enabled() {
                self.load_table_cache::<R>(table)?;
            }
        }

        debug!(%table, cache_enabled, "bound table");
        Ok(schema)
    }

    pub fn schema(&self, table: &str) -> Option<Arc<Schema>> {
        self.registry.get(table)
    }

    /// Turn the process wide cache switch on or off.
    ///
    /// Turning it on reloads every cache-enabled table first.
    pub fn enable_cache(&self, enabled: bool) -> Result<()> {
        if enabled {
            self.load_cache()?;
        }
        self.cache.set_enabled(enabled);
        debug!(enabled, "set cache switch");
        Ok(())
    }

    pub fn is_cache_enabled(&self) -> bool {
        self.cache.is_enabled()
    }

    /// Reload every cache-enabled table from the store.
    pub fn load_cache(&self) -> Result<()> {
        for (table, loader) in self.cache.loaders() {
            let enabled = self
                .registry
                .get(&table)
                .map(|schema| schema.cache_enabled())
                .unwrap_or(false);
            if !enabled {
                continue;
            }
            let result = loader(self, &table);
            self.finish("load_cache", &table, result)?;
        }
        Ok(())
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    /// While set, every mutating operation returns immediately without
    /// touching the store or the cache.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::Release);
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    /// Forget all schemas and caches and restore the configured flags.
    pub fn reset(&self) {
        self.registry.clear();
        self.cache.clear();
        self.set_read_only(self.config.read_only);
        debug!("reset mapper");
    }

    /// Execute a raw statement. Not subject to read-only mode.
    ///
    /// Returns the last inserted id for INSERT and REPLACE, the number of
    /// affected rows for UPDATE and DELETE, and 0 for anything else.
    pub fn exec(&self, sql: &str, args: &[Value]) -> Result<i64> {
        let verb = StatementVerb::of(sql);
        let stmt = Statement::new(sql, args.to_vec());
        let result = self.execute_statement(&stmt, true);
        self.finish("exec", "", result).map(|res| verb.pick(res))
    }

    /// Run a raw query and return its untyped rows.
    pub fn query_raw(&self, sql: &str, args: &[Value]) -> Result<ResultSet> {
        let stmt = Statement::new(sql, args.to_vec());
        let result = self.query_statement(&stmt);
        self.finish("query", "", result)
    }

    pub(crate) fn resolve<R: Record>(&self, table: &str) -> Result<Arc<Schema>> {
        self.registry.resolve::<R>(table, self.metadata.as_ref())
    }

    pub(crate) fn execute_statement(&self, stmt: &Statement, log_duplicates: bool) -> Result<ExecResult> {
        let start = Instant::now();
        let result = self.store.execute(&stmt.sql, &stmt.args);
        let elapsed = start.elapsed();

        if self.config.log_statements {
            info!(target: STATEMENT_TARGET, elapsed_ms = elapsed.as_secs_f64() * 1000.0, "{stmt}");
        }

        result.map_err(|e| {
            if self.config.log_errors && (log_duplicates || !e.is_duplicate()) {
                error!(error = %e, statement = %stmt, "statement failed");
            }
            MapperError::from(e)
        })
    }

    pub(crate) fn query_statement(&self, stmt: &Statement) -> Result<ResultSet> {
        let start = Instant::now();
        let result = self.store.query(&stmt.sql, &stmt.args);
        let elapsed = start.elapsed();

        if self.config.log_statements {
            info!(target: STATEMENT_TARGET, elapsed_ms = elapsed.as_secs_f64() * 1000.0, "{stmt}");
        }

        result.map_err(|e| {
            let e = MapperError::from(e);
            if self.config.log_errors && !e.is_no_rows() {
                error!(error = %e, statement = %stmt, "query failed");
            }
            e
        })
    }

    /// Operation boundary. Logs mapper side failures, store failures are
    /// logged where they happen.
    pub(crate) fn finish<T>(&self, op: &str, table: &str, result: Result<T>) -> Result<T> {
        let Err(e) = &result else {
            return result;
        };
        match e.kind() {
            ErrorKind::Fatal => {
                if self.config.log_errors {
                    error!(%op, %table, error = %e, "fatal mapping error");
                }
                if self.config.abort_on_fatal {
                    std::process::exit(1);
                }
            }
            ErrorKind::Validation => {
                if self.config.log_errors {
                    error!(%op, %table, error = %e, "invalid request");
                }
            }
            ErrorKind::NotFound | ErrorKind::Store => (),
        }
        result
    }

    /// Read every row of `table` and swap the result in as its cache.
    pub(crate) fn load_table_cache<R: Record>(&self, table: &str) -> Result<()> {
        let schema = self.resolve::<R>(table)?;
        let spec = QuerySpec::new(table);
        let stmt = compile(&schema, &spec, &Action::ReadAll, None, self.dialect())?;
        let records = match self.query_statement(&stmt) {
            Ok(result) => read_all::<R>(&schema, result)?,
            Err(e) if e.is_no_rows() => Vec::new(),
            Err(e) => return Err(e),
        };
        let map = build_map(&schema, records)?;
        self.cache.replace(table, map)
    }
}

fn load_table_cache<R: Record>(mapper: &Mapper, table: &str) -> Result<()> {
    mapper.load_table_cache::<R>(table)
}
