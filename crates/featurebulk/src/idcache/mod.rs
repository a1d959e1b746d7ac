//! Partitioned external-id to internal-id cache.
//!
//! External identifiers are spread over P segments by hash. Each segment keeps
//! its entries in memory until the eviction threshold is reached and then
//! spills the least recently inserted entries to its own cache table. Lookups
//! that miss in memory fall through to that table, so an entry is never lost
//! during a run.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::cache::{CacheTableHandle, CacheTableManager, CacheTableModel};
use crate::config::IdCacheConfig;
use crate::db::SqlValue;
use crate::error::{BulkError, Result};

/// An identifier cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdCacheEntry {
    pub internal_id: i64,
    /// Set once some reference has resolved to this entry.
    pub consumed: bool,
}

/// Sizing derived from the configured capacity and page factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionPolicy {
    /// In-memory size at which a segment spills.
    pub threshold: usize,
    /// In-memory size a segment is reduced to by a spill.
    pub retain: usize,
}

impl EvictionPolicy {
    pub fn new(cache_size: usize, page_factor: f64) -> Self {
        let threshold = ((cache_size as f64 * page_factor).ceil() as usize).clamp(1, cache_size.max(1));
        let retain = ((threshold as f64 * page_factor).floor() as usize).min(threshold - 1);
        Self { threshold, retain }
    }
}

#[derive(Default)]
struct SegmentState {
    entries: HashMap<String, IdCacheEntry>,
    /// Insertion order of `entries`, oldest first.
    order: VecDeque<String>,
    table: Option<CacheTableHandle>,
    spilled: usize,
}

struct Segment {
    index: usize,
    state: Mutex<SegmentState>,
}

/// Bounded, partitioned identifier cache.
pub struct IdCache {
    segments: Vec<Segment>,
    cache_tables: Arc<CacheTableManager>,
    policy: EvictionPolicy,
    strict: bool,
    duplicates: AtomicU64,
}

impl IdCache {
    pub fn new(
        config: &IdCacheConfig,
        partitions: usize,
        cache_tables: Arc<CacheTableManager>,
        strict: bool,
    ) -> Self {
        let segments = (0..partitions.max(1))
            .map(|index| Segment {
                index,
                state: Mutex::new(SegmentState::default()),
            })
            .collect();
        Self {
            segments,
            cache_tables,
            policy: EvictionPolicy::new(config.cache_size, config.page_factor),
            strict,
            duplicates: AtomicU64::new(0),
        }
    }

    pub fn partitions(&self) -> usize {
        self.segments.len()
    }

    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    /// Segment owning an external identifier (FNV-1a, stable across runs).
    pub fn partition_of(&self, external_id: &str) -> usize {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in external_id.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        (hash % self.segments.len() as u64) as usize
    }

    fn segment(&self, external_id: &str) -> &Segment {
        &self.segments[self.partition_of(external_id)]
    }

    /// Register the internal id of a freshly inserted record and spill the
    /// segment if it reached the eviction threshold.
    ///
    /// A duplicate external id overwrites the earlier entry and is counted,
    /// unless strict mode is on, in which case it is a conversion error.
    pub async fn put(&self, external_id: &str, internal_id: i64) -> Result<()> {
        self.register(external_id, internal_id).await?;
        self.enforce_capacity(external_id).await
    }

    /// Register an id in memory only. Either the entry is stored or the
    /// cache is left unchanged; no cache table is written.
    pub async fn register(&self, external_id: &str, internal_id: i64) -> Result<()> {
        let segment = self.segment(external_id);
        let mut state = segment.state.lock().await;

        let known = match state.entries.get(external_id) {
            Some(entry) => Some(entry.internal_id),
            // Spilled duplicates are shadowed by the newer in-memory entry;
            // only strict mode pays for the lookup.
            None if self.strict => self
                .load_spilled(&state, external_id)
                .await?
                .map(|e| e.internal_id),
            None => None,
        };

        if let Some(previous) = known {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
            if self.strict {
                return Err(BulkError::conversion(
                    external_id,
                    format!("duplicate external id (already stored as {})", previous),
                ));
            }
            warn!(
                partition = segment.index,
                "Duplicate external id '{}': {} replaces {}", external_id, internal_id, previous
            );
        }

        let entry = IdCacheEntry {
            internal_id,
            consumed: false,
        };
        if state.entries.insert(external_id.to_string(), entry).is_none() {
            state.order.push_back(external_id.to_string());
        }
        Ok(())
    }

    /// Spill the segment owning `external_id` if it reached the threshold.
    pub async fn enforce_capacity(&self, external_id: &str) -> Result<()> {
        let segment = self.segment(external_id);
        let mut state = segment.state.lock().await;
        if state.entries.len() >= self.policy.threshold {
            self.spill(segment.index, &mut state).await?;
        }
        Ok(())
    }

    /// Drop an in-memory entry registered for a record that was not
    /// stored after all. Entries since replaced by another id are kept.
    pub async fn forget(&self, external_id: &str, internal_id: i64) {
        let segment = self.segment(external_id);
        let mut state = segment.state.lock().await;
        if state.entries.get(external_id).map(|e| e.internal_id) == Some(internal_id) {
            state.entries.remove(external_id);
            state.order.retain(|key| key != external_id);
        }
    }

    /// Internal id of an external id, from memory or the segment's table.
    pub async fn get(&self, external_id: &str) -> Result<Option<i64>> {
        let segment = self.segment(external_id);
        let state = segment.state.lock().await;
        if let Some(entry) = state.entries.get(external_id) {
            return Ok(Some(entry.internal_id));
        }
        Ok(self
            .load_spilled(&state, external_id)
            .await?
            .map(|e| e.internal_id))
    }

    /// Full entry of an external id.
    pub async fn entry(&self, external_id: &str) -> Result<Option<IdCacheEntry>> {
        let segment = self.segment(external_id);
        let state = segment.state.lock().await;
        if let Some(entry) = state.entries.get(external_id) {
            return Ok(Some(*entry));
        }
        self.load_spilled(&state, external_id).await
    }

    /// Mark an entry as referenced. Returns false when the id is unknown.
    pub async fn consume(&self, external_id: &str) -> Result<bool> {
        let segment = self.segment(external_id);
        let mut state = segment.state.lock().await;
        if let Some(entry) = state.entries.get_mut(external_id) {
            entry.consumed = true;
            return Ok(true);
        }
        let Some(table) = state.table.as_ref() else {
            return Ok(false);
        };
        let updated = self
            .cache_tables
            .update_column(table, external_id.into(), "consumed", SqlValue::Bool(true))
            .await?;
        Ok(updated > 0)
    }

    /// Entries currently held in memory across all segments.
    pub async fn in_memory(&self) -> usize {
        let mut total = 0;
        for segment in &self.segments {
            total += segment.state.lock().await.entries.len();
        }
        total
    }

    /// Entries moved to cache tables so far.
    pub async fn spilled(&self) -> usize {
        let mut total = 0;
        for segment in &self.segments {
            total += segment.state.lock().await.spilled;
        }
        total
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }

    async fn load_spilled(&self, state: &SegmentState, external_id: &str) -> Result<Option<IdCacheEntry>> {
        let Some(table) = state.table.as_ref() else {
            return Ok(None);
        };
        let Some(row) = self.cache_tables.find(table, external_id.into()).await? else {
            return Ok(None);
        };
        Ok(Some(IdCacheEntry {
            internal_id: row.get_i64(1)?,
            consumed: row.get_i64(2)? != 0,
        }))
    }

    /// Move the oldest entries of a segment to its table until only
    /// `policy.retain` remain.
    async fn spill(&self, partition: usize, state: &mut SegmentState) -> Result<()> {
        if state.table.is_none() {
            state.table = Some(
                self.cache_tables
                    .create(CacheTableModel::IdCache, partition)
                    .await?,
            );
        }

        let excess = state.entries.len().saturating_sub(self.policy.retain).max(1);
        let mut rows = Vec::with_capacity(excess);
        let mut evicted = Vec::with_capacity(excess);
        let mut scanned = 0;
        for key in &state.order {
            if rows.len() >= excess {
                break;
            }
            scanned += 1;
            if let Some(entry) = state.entries.get(key) {
                rows.push(vec![
                    SqlValue::Text(key.clone()),
                    SqlValue::I64(entry.internal_id),
                    SqlValue::Bool(entry.consumed),
                ]);
                evicted.push(key.clone());
            }
        }

        if let Some(table) = state.table.as_ref() {
            self.cache_tables.upsert_rows(table, rows).await?;
        }
        // Only forget entries once they are safely stored
        state.order.drain(..scanned);
        for key in &evicted {
            state.entries.remove(key);
        }
        state.spilled += evicted.len();

        debug!(
            partition,
            spilled = evicted.len(),
            remaining = state.entries.len(),
            "Spilled identifier cache segment"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ConnectionPool, PoolOptions, PoolRole};
    use std::time::Duration;

    async fn cache_tables(dir: &tempfile::TempDir) -> Arc<CacheTableManager> {
        let pool = ConnectionPool::sqlite(
            dir.path().join("cache.db").to_string_lossy(),
            PoolOptions {
                role: PoolRole::Cache,
                size: 2,
                acquire_timeout: Duration::from_secs(5),
                max_reconnect_attempts: 1,
            },
        )
        .await
        .unwrap();
        Arc::new(CacheTableManager::new(pool, "tmp_idc"))
    }

    fn small_config() -> IdCacheConfig {
        IdCacheConfig {
            cache_size: 4,
            page_factor: 0.75,
            partitions: Some(1),
        }
    }

    #[tokio::test]
    async fn test_failed_spill_keeps_eviction_order() {
        let dir = tempfile::tempdir().unwrap();
        let tables = cache_tables(&dir).await;
        let cache = IdCache::new(&small_config(), 1, Arc::clone(&tables), false);

        cache.put("a", 1).await.unwrap();
        cache.put("b", 2).await.unwrap();
        cache.put("c", 3).await.unwrap(); // spills "a"
        let handle = tables.handles(CacheTableModel::IdCache).remove(0);

        // Backing table gone: the spill triggered by "d" fails
        tables.drop_table(&handle).await.unwrap();
        assert!(cache.put("d", 4).await.is_err());
        assert_eq!(cache.in_memory().await, 3);
        assert_eq!(cache.get("d").await.unwrap(), Some(4));

        // Once the table is back the oldest entries leave first
        tables.create(CacheTableModel::IdCache, 0).await.unwrap();
        cache.put("e", 5).await.unwrap();
        assert_eq!(cache.in_memory().await, 2);
        assert!(tables.find(&handle, "b".into()).await.unwrap().is_some());
        assert!(tables.find(&handle, "c".into()).await.unwrap().is_some());
        assert!(tables.find(&handle, "d".into()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_register_defers_spill_and_forget_undoes_it() {
        let dir = tempfile::tempdir().unwrap();
        let tables = cache_tables(&dir).await;
        let cache = IdCache::new(&small_config(), 1, Arc::clone(&tables), true);

        for (n, id) in ["a", "b", "c"].iter().enumerate() {
            cache.register(id, n as i64 + 1).await.unwrap();
        }
        assert_eq!(cache.spilled().await, 0);
        assert!(tables.handles(CacheTableModel::IdCache).is_empty());

        // A strict duplicate leaves the cache untouched
        assert!(cache.register("b", 9).await.is_err());
        assert_eq!(cache.get("b").await.unwrap(), Some(2));

        cache.forget("c", 3).await;
        cache.forget("b", 7).await;
        assert_eq!(cache.get("c").await.unwrap(), None);
        assert_eq!(cache.get("b").await.unwrap(), Some(2));

        cache.register("c", 4).await.unwrap();
        cache.enforce_capacity("c").await.unwrap();
        assert_eq!(cache.spilled().await, 1);
        assert_eq!(cache.get("a").await.unwrap(), Some(1));
    }

    #[test]
    fn test_eviction_policy() {
        assert_eq!(
            EvictionPolicy::new(4, 0.75),
            EvictionPolicy {
                threshold: 3,
                retain: 2
            }
        );
        assert_eq!(
            EvictionPolicy::new(200_000, 0.85),
            EvictionPolicy {
                threshold: 170_000,
                retain: 144_500
            }
        );
        // Degenerate sizes still spill at least one entry
        assert_eq!(
            EvictionPolicy::new(1, 1.0),
            EvictionPolicy {
                threshold: 1,
                retain: 0
            }
        );
    }
}
