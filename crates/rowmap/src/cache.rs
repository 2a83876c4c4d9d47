//! Per-table write-through record cache.
//!
//! Each cache-enabled table owns a concurrent map from composite primary
//! key to the last committed record. Maps are type erased here and
//! recovered through [`CacheManager::map`]. A reload builds a fresh map and
//! swaps it in whole.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use rowmap_error::{Result, fatal};
use tracing::debug;

use crate::mapper::Mapper;
use crate::record::Record;
use crate::schema::Schema;

pub type CacheMap<R> = scc::HashMap<String, R>;

/// Reloads one table's cache from the store.
pub(crate) type Loader = fn(&Mapper, &str) -> Result<()>;

pub(crate) struct TableCache {
    data: RwLock<Arc<dyn Any + Send + Sync>>,
    record_type: &'static str,
    loader: Loader,
}

impl fmt::Debug for TableCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableCache")
            .field("record_type", &self.record_type)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct CacheManager {
    /// Process wide switch. A table's cache is consulted only when this
    /// and the table's own flag are both set.
    enabled: AtomicBool,
    tables: scc::HashMap<String, Arc<TableCache>>,
}

impl CacheManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release)
    }

    /// Create an empty cache for `table` if it doesn't have one yet.
    pub(crate) fn register<R: Record>(&self, table: &str, loader: Loader) {
        if self.tables.contains(table) {
            return;
        }
        let empty: Arc<dyn Any + Send + Sync> = Arc::new(CacheMap::<R>::new());
        let cache = Arc::new(TableCache {
            data: RwLock::new(empty),
            record_type: std::any::type_name::<R>(),
            loader,
        });
        if self.tables.insert(table.to_string(), cache).is_ok() {
            debug!(%table, record = std::any::type_name::<R>(), "registered table cache");
        }
    }

    pub fn is_registered(&self, table: &str) -> bool {
        self.tables.contains(table)
    }

    /// Whether reads and writes on this table go through the cache.
    pub fn is_active(&self, schema: &Schema) -> bool {
        self.is_enabled() && schema.cache_enabled() && self.is_registered(schema.table())
    }

    /// The current map for `table`.
    pub fn map<R: Record>(&self, table: &str) -> Result<Arc<CacheMap<R>>> {
        let cache = self
            .tables
            .read(table, |_, cache| cache.clone())
            .ok_or_else(|| fatal!("table '{table}' has no cache"))?;
        let data = cache.data.read().clone();
        data.downcast::<CacheMap<R>>().map_err(|_| {
            fatal!(
                "cache for table '{table}' holds {}, not {}",
                cache.record_type,
                std::any::type_name::<R>()
            )
        })
    }

    /// The map for the table if its cache is active.
    pub fn active_map<R: Record>(&self, schema: &Schema) -> Result<Option<Arc<CacheMap<R>>>> {
        if !self.is_active(schema) {
            return Ok(None);
        }
        self.map::<R>(schema.table()).map(Some)
    }

    /// Swap in a new map for `table`.
    pub fn replace<R: Record>(&self, table: &str, map: CacheMap<R>) -> Result<()> {
        let cache = self
            .tables
            .read(table, |_, cache| cache.clone())
            .ok_or_else(|| fatal!("table '{table}' has no cache"))?;
        if cache.record_type != std::any::type_name::<R>() {
            return Err(fatal!(
                "cache for table '{table}' holds {}, not {}",
                cache.record_type,
                std::any::type_name::<R>()
            ));
        }
        let len = map.len();
        *cache.data.write() = Arc::new(map);
        debug!(%table, entries = len, "replaced table cache");
        Ok(())
    }

    /// Loaders for every registered table, in no particular order.
    pub(crate) fn loaders(&self) -> Vec<(String, Loader)> {
        let mut out = Vec::with_capacity(self.tables.len());
        self.tables
            .scan(|table, cache| out.push((table.clone(), cache.loader)));
        out
    }

    pub fn clear(&self) {
        self.set_enabled(false);
        self.tables.clear();
    }
}

/// Insert or overwrite the entry for `key`.
pub fn store_entry<R: Record>(map: &CacheMap<R>, key: String, record: R) {
    match map.entry(key) {
        scc::hash_map::Entry::Occupied(mut ent) => {
            *ent.get_mut() = record;
        }
        scc::hash_map::Entry::Vacant(ent) => {
            ent.insert_entry(record);
        }
    }
}

pub fn remove_entry<R: Record>(map: &CacheMap<R>, key: &str) -> bool {
    map.remove(key).is_some()
}

/// Apply `patch` to the entry for `key`. Returns `None` if there is no
/// entry.
pub fn patch_entry<R, F>(map: &CacheMap<R>, key: &str, patch: F) -> Option<Result<()>>
where
    R: Record,
    F: FnOnce(&mut R) -> Result<()>,
{
    map.update(key, |_, record| patch(record))
}

/// Index `records` by composite key. Later records win on key collisions.
pub fn build_map<R: Record>(schema: &Schema, records: Vec<R>) -> Result<CacheMap<R>> {
    let map = CacheMap::with_capacity(records.len());
    for record in records {
        let key = schema.composite_key(&record)?;
        store_entry(&map, key, record);
    }
    Ok(map)
}

/// Every cached record, in no particular order.
pub fn snapshot<R: Record>(map: &CacheMap<R>) -> Vec<R> {
    let mut out = Vec::with_capacity(map.len());
    map.scan(|_, record| out.push(record.clone()));
    out
}
