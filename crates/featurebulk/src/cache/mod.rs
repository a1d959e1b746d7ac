//! Transient cache tables.
//!
//! The manager creates, fills, scans and drops partitioned tables holding
//! pending references and spilled identifier cache entries. Table names are
//! derived from the configuration hash so concurrent runs with different
//! configurations never collide.

mod model;

pub use model::{CacheTableHandle, CacheTableModel, MAX_EXTERNAL_ID_LEN};

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::db::{ConnectionPool, Row, SqlValue};
use crate::dialect::{Dialect, DialectImpl, SelectQueryOptions, TableDurability};
use crate::error::Result;

/// Creates and maintains the cache tables of one run.
pub struct CacheTableManager {
    pool: ConnectionPool,
    prefix: String,
    tables: Mutex<BTreeMap<(CacheTableModel, usize), CacheTableHandle>>,
    next_keys: Mutex<HashMap<String, i64>>,
}

impl CacheTableManager {
    pub fn new(pool: ConnectionPool, prefix: impl Into<String>) -> Self {
        Self {
            pool,
            prefix: prefix.into(),
            tables: Mutex::new(BTreeMap::new()),
            next_keys: Mutex::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn dialect(&self) -> &DialectImpl {
        self.pool.dialect()
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Create a partition table, or return the handle if this run already
    /// created it. A table left behind by an earlier run is replaced.
    pub async fn create(&self, model: CacheTableModel, partition: usize) -> Result<CacheTableHandle> {
        if let Some(handle) = self.tables.lock().get(&(model, partition)) {
            return Ok(handle.clone());
        }

        let handle = CacheTableHandle::new(&self.prefix, model, partition);
        let dialect = self.dialect();
        let conn = self.pool.acquire().await?;
        conn.batch_execute(&dialect.drop_table_sql(&handle.name)).await?;
        conn.batch_execute(&dialect.create_table_sql(
            &handle.name,
            &model.columns(),
            Some(model.key_column()),
            TableDurability::Transient,
        ))
        .await?;
        drop(conn);

        // Another task may have raced us to the same partition
        let mut tables = self.tables.lock();
        let handle = tables
            .entry((model, partition))
            .or_insert(handle)
            .clone();
        debug!(table = %handle.name, "Created cache table");
        Ok(handle)
    }

    /// Handles of every partition of a model, in partition order.
    pub fn handles(&self, model: CacheTableModel) -> Vec<CacheTableHandle> {
        self.tables
            .lock()
            .iter()
            .filter(|((m, _), _)| *m == model)
            .map(|(_, h)| h.clone())
            .collect()
    }

    /// Drop one partition table.
    pub async fn drop_table(&self, handle: &CacheTableHandle) -> Result<()> {
        let conn = self.pool.acquire().await?;
        conn.batch_execute(&self.dialect().drop_table_sql(&handle.name))
            .await?;
        self.tables.lock().remove(&(handle.model, handle.partition));
        self.next_keys.lock().remove(&handle.name);
        debug!(table = %handle.name, "Dropped cache table");
        Ok(())
    }

    /// Drop every table created by this manager. Failures are logged and the
    /// remaining tables are still dropped.
    pub async fn drop_all(&self) -> Result<()> {
        let handles: Vec<_> = self.tables.lock().values().cloned().collect();
        if handles.is_empty() {
            return Ok(());
        }

        let mut first_error = None;
        for handle in &handles {
            if let Err(e) = self.drop_table(handle).await {
                warn!(table = %handle.name, "Failed to drop cache table: {}", e);
                first_error.get_or_insert(e);
            }
        }
        info!("Dropped {} cache table(s)", handles.len());
        first_error.map_or(Ok(()), Err)
    }

    /// Reserve `count` sequential keys for a partition.
    fn reserve_keys(&self, handle: &CacheTableHandle, count: usize) -> i64 {
        let mut keys = self.next_keys.lock();
        let next = keys.entry(handle.name.clone()).or_insert(1);
        let first = *next;
        *next += count as i64;
        first
    }

    /// Insert rows given in [`CacheTableModel::insert_columns`] order.
    ///
    /// Statements are chunked by the dialect's batch size and bind parameter
    /// limit. Returns the number of inserted rows.
    pub async fn insert_rows(&self, handle: &CacheTableHandle, rows: Vec<Vec<SqlValue>>) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let with_key = handle.model.has_sequence_key();
        let columns = if with_key {
            handle.model.column_names()
        } else {
            handle.model.insert_columns()
        };
        let mut next_key = if with_key {
            self.reserve_keys(handle, rows.len())
        } else {
            0
        };

        let dialect = self.dialect();
        let chunk_size = dialect.capabilities().rows_per_statement(columns.len());
        let conn = self.pool.acquire().await?;
        let mut inserted = 0;

        for chunk in rows.chunks(chunk_size) {
            let sql = dialect.build_multi_row_insert(&handle.name, &columns, chunk.len());
            let mut params = Vec::with_capacity(chunk.len() * columns.len());
            for row in chunk {
                if with_key {
                    params.push(SqlValue::I64(next_key));
                    next_key += 1;
                }
                params.extend(row.iter().cloned());
            }
            conn.execute(&sql, &params).await?;
            inserted += chunk.len() as u64;
        }

        Ok(inserted)
    }

    /// Insert or overwrite rows by key, given in model column order.
    pub async fn upsert_rows(&self, handle: &CacheTableHandle, rows: Vec<Vec<SqlValue>>) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let columns = handle.model.column_names();
        let keys = vec![handle.model.key_column().to_string()];
        let dialect = self.dialect();
        let chunk_size = dialect.capabilities().rows_per_statement(columns.len());
        let conn = self.pool.acquire().await?;
        let mut written = 0;

        for chunk in rows.chunks(chunk_size) {
            let sql = dialect.build_multi_row_upsert(&handle.name, &columns, &keys, chunk.len());
            let params: Vec<SqlValue> = chunk.iter().flatten().cloned().collect();
            conn.execute(&sql, &params).await?;
            written += chunk.len() as u64;
        }

        Ok(written)
    }

    /// Row whose key equals `key`, all model columns.
    pub async fn find(&self, handle: &CacheTableHandle, key: SqlValue) -> Result<Option<Row>> {
        let dialect = self.dialect();
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = {}",
            dialect.column_list(&handle.model.column_names()),
            dialect.quote_ident(&handle.name),
            dialect.quote_ident(handle.model.key_column()),
            dialect.param_placeholder(1)
        );
        let conn = self.pool.acquire().await?;
        conn.query_opt(&sql, &[key]).await
    }

    /// Update one column of the row with the given key.
    pub async fn update_column(
        &self,
        handle: &CacheTableHandle,
        key: SqlValue,
        column: &str,
        value: SqlValue,
    ) -> Result<u64> {
        let dialect = self.dialect();
        let sql = format!(
            "UPDATE {} SET {} = {} WHERE {} = {}",
            dialect.quote_ident(&handle.name),
            dialect.quote_ident(column),
            dialect.param_placeholder(1),
            dialect.quote_ident(handle.model.key_column()),
            dialect.param_placeholder(2)
        );
        let conn = self.pool.acquire().await?;
        conn.execute(&sql, &[value, key]).await
    }

    pub async fn count(&self, handle: &CacheTableHandle) -> Result<i64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {}",
            self.dialect().quote_ident(&handle.name)
        );
        let conn = self.pool.acquire().await?;
        conn.query_i64(&sql, &[]).await
    }

    /// Keyset page of rows with a sequence key greater than `after_id`.
    pub async fn scan(&self, handle: &CacheTableHandle, after_id: i64, limit: usize) -> Result<Vec<Row>> {
        let dialect = self.dialect();
        let columns = handle
            .model
            .column_names()
            .iter()
            .map(|c| dialect.quote_ident(c))
            .collect();
        let sql = dialect.build_select_query(&SelectQueryOptions {
            schema: None,
            table: handle.name.clone(),
            columns,
            pk_col: Some(handle.model.key_column().to_string()),
            min_pk: Some(after_id),
            where_clause: None,
            limit: Some(limit),
        });
        let conn = self.pool.acquire().await?;
        conn.query(&sql, &[]).await
    }

    /// Delete rows by sequence key, chunked by the dialect's batch size.
    pub async fn delete_keys(&self, handle: &CacheTableHandle, keys: &[i64]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let dialect = self.dialect();
        let chunk_size = dialect.capabilities().rows_per_statement(1);
        let conn = self.pool.acquire().await?;
        let mut deleted = 0;
        for chunk in keys.chunks(chunk_size) {
            let sql = dialect.build_delete_by_keys(&handle.name, handle.model.key_column(), chunk.len());
            let params: Vec<SqlValue> = chunk.iter().map(|k| SqlValue::I64(*k)).collect();
            deleted += conn.execute(&sql, &params).await?;
        }
        Ok(deleted)
    }

    /// `UNION ALL` of the given columns across all partitions of a model.
    pub fn union_query(&self, model: CacheTableModel, columns: &[&str]) -> Option<String> {
        let dialect = self.dialect();
        let handles = self.handles(model);
        if handles.is_empty() {
            return None;
        }
        let cols = columns
            .iter()
            .map(|c| dialect.quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        Some(
            handles
                .iter()
                .map(|h| format!("SELECT {} FROM {}", cols, dialect.quote_ident(&h.name)))
                .collect::<Vec<_>>()
                .join(" UNION ALL "),
        )
    }

    /// Total rows across all partitions of a model.
    pub async fn count_model(&self, model: CacheTableModel) -> Result<i64> {
        let Some(union) = self.union_query(model, &[model.key_column()]) else {
            return Ok(0);
        };
        let sql = format!("SELECT COUNT(*) FROM ({}) fb_union", union);
        let conn = self.pool.acquire().await?;
        conn.query_i64(&sql, &[]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{PoolOptions, PoolRole};
    use std::time::Duration;

    async fn manager(dir: &tempfile::TempDir) -> CacheTableManager {
        let pool = ConnectionPool::sqlite(
            dir.path().join("cache.db").to_string_lossy(),
            PoolOptions {
                role: PoolRole::Cache,
                size: 4,
                acquire_timeout: Duration::from_secs(5),
                max_reconnect_attempts: 1,
            },
        )
        .await
        .unwrap();
        CacheTableManager::new(pool, "tmp_test")
    }

    fn pending_row(origin_id: i64, target: &str) -> Vec<SqlValue> {
        vec![
            "feature_link".into(),
            "target_id".into(),
            origin_id.into(),
            target.into(),
            SqlValue::Null,
            SqlValue::Null,
        ]
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir).await;

        let a = manager.create(CacheTableModel::PendingReference, 0).await.unwrap();
        manager.insert_rows(&a, vec![pending_row(1, "x")]).await.unwrap();
        let b = manager.create(CacheTableModel::PendingReference, 0).await.unwrap();

        assert_eq!(a, b);
        assert_eq!(manager.count(&b).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_insert_scan_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir).await;
        let handle = manager.create(CacheTableModel::PendingReference, 1).await.unwrap();

        let rows = (0..25).map(|i| pending_row(i, &format!("t{}", i))).collect();
        assert_eq!(manager.insert_rows(&handle, rows).await.unwrap(), 25);

        let page = manager.scan(&handle, 0, 10).await.unwrap();
        assert_eq!(page.len(), 10);
        assert_eq!(page[0].get_i64(0).unwrap(), 1);
        let last = page[9].get_i64(0).unwrap();

        let page = manager.scan(&handle, last, 10).await.unwrap();
        assert_eq!(page[0].get_i64(0).unwrap(), last + 1);

        let deleted = manager.delete_keys(&handle, &[1, 2, 3]).await.unwrap();
        assert_eq!(deleted, 3);
        assert_eq!(manager.count(&handle).await.unwrap(), 22);
    }

    #[tokio::test]
    async fn test_union_and_drop_all() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir).await;
        for partition in 0..3 {
            let handle = manager
                .create(CacheTableModel::PendingReference, partition)
                .await
                .unwrap();
            manager
                .insert_rows(&handle, vec![pending_row(partition as i64, "a")])
                .await
                .unwrap();
        }
        assert_eq!(
            manager.count_model(CacheTableModel::PendingReference).await.unwrap(),
            3
        );
        assert_eq!(manager.count_model(CacheTableModel::IdCache).await.unwrap(), 0);

        manager.drop_all().await.unwrap();
        assert!(manager.handles(CacheTableModel::PendingReference).is_empty());
        assert!(manager
            .union_query(CacheTableModel::PendingReference, &["id"])
            .is_none());
    }

    #[tokio::test]
    async fn test_drop_table_forgets_partition() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir).await;
        let kept = manager.create(CacheTableModel::PendingReference, 0).await.unwrap();
        let dropped = manager.create(CacheTableModel::PendingReference, 1).await.unwrap();

        manager.drop_table(&dropped).await.unwrap();

        assert_eq!(manager.handles(CacheTableModel::PendingReference), vec![kept]);
        // Dropping twice is harmless
        manager.drop_table(&dropped).await.unwrap();

        let recreated = manager.create(CacheTableModel::PendingReference, 1).await.unwrap();
        assert_eq!(manager.count(&recreated).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_upsert_overwrites_by_key() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir).await;
        let handle = manager.create(CacheTableModel::IdCache, 0).await.unwrap();

        let row = |id: i64| vec!["gml_1".into(), id.into(), false.into()];
        manager.upsert_rows(&handle, vec![row(1)]).await.unwrap();
        manager.upsert_rows(&handle, vec![row(2)]).await.unwrap();

        let found = manager.find(&handle, "gml_1".into()).await.unwrap().unwrap();
        assert_eq!(found.get_i64(1).unwrap(), 2);
        assert_eq!(manager.count(&handle).await.unwrap(), 1);
    }
}
