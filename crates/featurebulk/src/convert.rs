//! Conversion of feature records into target rows.
//!
//! Each [`FeatureConverter`] is one import worker. A record becomes one
//! `feature` row plus one `feature_link` row per reference. A reference whose
//! target is already in the identifier cache gets its `target_id` right away;
//! any other reference is buffered as a [`PendingReference`] and flushed to
//! the worker's own cache table partition.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::audit::AuditLog;
use crate::cache::{CacheTableHandle, CacheTableManager, CacheTableModel, MAX_EXTERNAL_ID_LEN};
use crate::db::{ConnectionPool, PooledConnection, SqlValue};
use crate::dialect::{Dialect, SqlColumn};
use crate::error::{BulkError, Result};
use crate::events::{EventChannel, PipelineEvent};
use crate::idcache::IdCache;
use crate::record::FeatureRecord;
use crate::resolver::{PendingReference, ReferencePayload};
use crate::schema::{FEATURE_TABLE, LINK_PAYLOAD_COLUMN, LINK_TABLE, LINK_TARGET_COLUMN};
use crate::worker::Worker;

/// Counters shared by all converters of a run.
#[derive(Debug, Default)]
pub struct ConverterStats {
    features: AtomicU64,
    links: AtomicU64,
    deferred: AtomicU64,
}

impl ConverterStats {
    pub fn features(&self) -> u64 {
        self.features.load(Ordering::Relaxed)
    }

    pub fn links(&self) -> u64 {
        self.links.load(Ordering::Relaxed)
    }

    /// Links whose target was unknown when they were written.
    pub fn deferred(&self) -> u64 {
        self.deferred.load(Ordering::Relaxed)
    }
}

/// State shared by the converters of one import run.
pub struct ConverterContext {
    pub target: ConnectionPool,
    pub cache_tables: Arc<CacheTableManager>,
    pub id_cache: Arc<IdCache>,
    pub events: EventChannel,
    pub audit: Option<Arc<AuditLog>>,
    /// SRID of geometries that do not carry their own.
    pub srid: i32,
    /// Pending references buffered per worker before a flush.
    pub reference_buffer: usize,
    pub stats: ConverterStats,
}

/// Import worker writing feature records to the target database.
pub struct FeatureConverter {
    worker_id: usize,
    ctx: Arc<ConverterContext>,
    pending: Vec<PendingReference>,
    partition: Option<CacheTableHandle>,
}

impl FeatureConverter {
    pub fn new(worker_id: usize, ctx: Arc<ConverterContext>) -> Self {
        Self {
            worker_id,
            ctx,
            pending: Vec::new(),
            partition: None,
        }
    }

    fn check(&self, record: &FeatureRecord) -> Result<()> {
        if record.external_id.is_empty() {
            return Err(BulkError::conversion(
                &record.feature_type,
                "record has no external id",
            ));
        }
        if record.external_id.chars().count() > MAX_EXTERNAL_ID_LEN as usize {
            return Err(BulkError::conversion(
                &record.external_id,
                format!("external id longer than {} characters", MAX_EXTERNAL_ID_LEN),
            ));
        }
        if record.feature_type.is_empty() {
            return Err(BulkError::conversion(&record.external_id, "record has no feature type"));
        }
        if let Some(reference) = record.references.iter().find(|r| r.target.is_empty()) {
            return Err(BulkError::conversion(
                &record.external_id,
                format!("reference '{}' has no target", reference.role),
            ));
        }
        Ok(())
    }

    /// Insert the feature and its links inside one transaction.
    ///
    /// Returns the feature id and, per reference, the link id.
    async fn write(
        &self,
        conn: &PooledConnection,
        record: &FeatureRecord,
        targets: &[Option<i64>],
    ) -> Result<(i64, Vec<i64>)> {
        let dialect = conn.dialect();

        let mut columns = vec![
            SqlColumn::Value("feature_type".to_string()),
            SqlColumn::Value("external_id".to_string()),
            SqlColumn::Value("properties".to_string()),
        ];
        let mut params: Vec<SqlValue> = vec![
            record.feature_type.as_str().into(),
            record.external_id.as_str().into(),
            if record.properties.is_null() {
                SqlValue::Null
            } else {
                SqlValue::Text(serde_json::to_string(&record.properties)?)
            },
        ];
        if let Some(geometry) = &record.geometry {
            columns.push(SqlColumn::Geometry {
                name: "geometry".to_string(),
                srid: geometry.srid.unwrap_or(self.ctx.srid),
            });
            params.push(geometry.wkt.as_str().into());
        }

        let insert_feature = returning_insert(dialect, FEATURE_TABLE, &columns)?;
        let feature_id = conn
            .query_opt(&insert_feature, &params)
            .await?
            .ok_or_else(|| BulkError::conversion(&record.external_id, "insert returned no id"))?
            .get_i64(0)?;

        let link_columns: Vec<SqlColumn> = [
            "feature_id",
            "role",
            "target_external_id",
            LINK_TARGET_COLUMN,
            LINK_PAYLOAD_COLUMN,
        ]
        .iter()
        .map(|c| SqlColumn::Value(c.to_string()))
        .collect();
        let insert_link = returning_insert(dialect, LINK_TABLE, &link_columns)?;

        let mut link_ids = Vec::with_capacity(record.references.len());
        for (reference, target) in record.references.iter().zip(targets) {
            // The payload travels with the foreign key
            let payload = target.and(reference.payload.clone());
            let params = [
                SqlValue::I64(feature_id),
                reference.role.as_str().into(),
                reference.target.as_str().into(),
                (*target).into(),
                payload.into(),
            ];
            let link_id = conn
                .query_opt(&insert_link, &params)
                .await?
                .ok_or_else(|| BulkError::conversion(&record.external_id, "insert returned no id"))?
                .get_i64(0)?;
            link_ids.push(link_id);
        }

        Ok((feature_id, link_ids))
    }

    /// Move buffered pending references into this worker's partition.
    async fn flush_pending(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let handle = match &self.partition {
            Some(handle) => handle.clone(),
            None => {
                let handle = self
                    .ctx
                    .cache_tables
                    .create(CacheTableModel::PendingReference, self.worker_id)
                    .await?;
                self.partition = Some(handle.clone());
                handle
            }
        };

        let rows: Vec<Vec<SqlValue>> = self.pending.iter().map(|r| r.to_row()).collect();
        let written = self.ctx.cache_tables.insert_rows(&handle, rows).await?;
        self.pending.clear();
        debug!(
            worker = self.worker_id,
            table = %handle.name,
            "Stored {} pending references", written
        );
        Ok(())
    }
}

fn returning_insert(
    dialect: &impl Dialect,
    table: &str,
    columns: &[SqlColumn],
) -> Result<String> {
    dialect
        .insert_returning_id(table, columns, "id")
        .into_option()
        .ok_or_else(|| {
            BulkError::Config(format!(
                "{} cannot return generated keys for {}",
                dialect.name(),
                table
            ))
        })
}

#[async_trait]
impl Worker for FeatureConverter {
    type Task = FeatureRecord;

    async fn process(&mut self, record: FeatureRecord) -> Result<()> {
        self.check(&record)?;
        let ctx = Arc::clone(&self.ctx);

        // Targets are looked up before the target transaction starts
        let mut targets = Vec::with_capacity(record.references.len());
        for reference in &record.references {
            targets.push(ctx.id_cache.get(&reference.target).await?);
        }

        let conn = ctx.target.acquire().await?;
        conn.begin().await?;
        let written = match self.write(&conn, &record, &targets).await {
            // Registration only touches memory, so no cache table is written
            // while the target transaction is open
            Ok((feature_id, link_ids)) => ctx
                .id_cache
                .register(&record.external_id, feature_id)
                .await
                .map(|()| (feature_id, link_ids)),
            Err(e) => Err(e),
        };
        let (feature_id, link_ids) = match written {
            Ok(ids) => ids,
            Err(e) => {
                if let Err(rollback) = conn.rollback().await {
                    warn!(worker = self.worker_id, "Rollback failed: {}", rollback);
                }
                return Err(e);
            }
        };
        if let Err(e) = conn.commit().await {
            ctx.id_cache.forget(&record.external_id, feature_id).await;
            return Err(e);
        }
        drop(conn);

        // The record is stored; a failed spill is retried by the next one
        if let Err(e) = ctx.id_cache.enforce_capacity(&record.external_id).await {
            if e.is_fatal() {
                return Err(e);
            }
            warn!(worker = self.worker_id, "Identifier cache spill failed: {}", e);
        }
        ctx.stats.features.fetch_add(1, Ordering::Relaxed);
        ctx.stats.links.fetch_add(link_ids.len() as u64, Ordering::Relaxed);

        for ((reference, target), link_id) in record.references.iter().zip(&targets).zip(link_ids) {
            if target.is_some() {
                ctx.id_cache.consume(&reference.target).await?;
                continue;
            }
            ctx.stats.deferred.fetch_add(1, Ordering::Relaxed);
            self.pending.push(PendingReference {
                origin_table: LINK_TABLE.to_string(),
                origin_column: LINK_TARGET_COLUMN.to_string(),
                origin_id: link_id,
                target_external_id: reference.target.clone(),
                payload: reference.payload.clone().map(|value| ReferencePayload {
                    column: LINK_PAYLOAD_COLUMN.to_string(),
                    value,
                }),
            });
        }

        if let Some(audit) = &ctx.audit {
            audit
                .record(&record.feature_type, feature_id, &record.external_id)
                .await?;
        }
        ctx.events.publish(PipelineEvent::RecordProcessed {
            external_id: record.external_id,
            internal_id: Some(feature_id),
        });

        if self.pending.len() >= ctx.reference_buffer.max(1) {
            self.flush_pending().await?;
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        self.flush_pending().await
    }

    fn label(record: &FeatureRecord) -> Option<String> {
        Some(record.external_id.clone())
    }
}
