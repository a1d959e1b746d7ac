//! Deferred-reference resolution.
//!
//! Workers store a [`PendingReference`] whenever a reference target is not
//! yet known. After ingestion the [`Resolver`] sweeps every partition of the
//! pending-reference cache table, looks the targets up in the identifier
//! cache and writes the foreign keys with batched `UPDATE ... CASE` statements.
//! Resolved rows are deleted; what is still pending after the retry pass is
//! reported as unresolvable and the origin column stays NULL.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheTableHandle, CacheTableManager, CacheTableModel};
use crate::db::{ConnectionPool, Row, SqlValue};
use crate::dialect::{Dialect, SqlType};
use crate::error::{BulkError, Result};
use crate::events::{EventChannel, PipelineEvent};
use crate::idcache::IdCache;

/// Extra column written together with the foreign key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferencePayload {
    pub column: String,
    pub value: String,
}

/// A foreign key whose target was not known when the origin row was written.
///
/// Pending while its cache row exists; resolved when the row is deleted after
/// the foreign key is applied; unresolvable when it survives the retry pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingReference {
    pub origin_table: String,
    pub origin_column: String,
    pub origin_id: i64,
    pub target_external_id: String,
    pub payload: Option<ReferencePayload>,
}

impl PendingReference {
    /// Cache table row, in insert column order.
    pub fn to_row(&self) -> Vec<SqlValue> {
        vec![
            self.origin_table.clone().into(),
            self.origin_column.clone().into(),
            self.origin_id.into(),
            self.target_external_id.clone().into(),
            self.payload.as_ref().map(|p| p.column.clone()).into(),
            self.payload.as_ref().map(|p| p.value.clone()).into(),
        ]
    }

    /// Parse a scanned cache row into its key and reference.
    pub fn from_row(row: &Row) -> Result<(i64, Self)> {
        let payload = match (row.get_opt_string(5)?, row.get_opt_string(6)?) {
            (Some(column), Some(value)) => Some(ReferencePayload { column, value }),
            _ => None,
        };
        Ok((
            row.get_i64(0)?,
            Self {
                origin_table: row.get_string(1)?,
                origin_column: row.get_string(2)?,
                origin_id: row.get_i64(3)?,
                target_external_id: row.get_string(4)?,
                payload,
            },
        ))
    }
}

/// Outcome of one resolver pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    pub resolved: u64,
    pub remaining: u64,
    /// Keyset batches read across all partitions.
    pub batches: u64,
}

/// Outcome of a full resolution (first pass plus retry pass).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolutionSummary {
    pub resolved: u64,
    /// References left unresolved after the retry pass.
    pub unresolvable: u64,
    pub passes: u32,
}

/// A resolved reference waiting to be written.
struct Hit {
    key: i64,
    origin_id: i64,
    target_id: i64,
    payload: Option<String>,
}

/// Sweeps pending references and applies foreign keys.
pub struct Resolver {
    cache_tables: Arc<CacheTableManager>,
    id_cache: Arc<IdCache>,
    target: ConnectionPool,
    batch_size: usize,
    events: EventChannel,
    cancel: CancellationToken,
}

impl Resolver {
    pub fn new(
        cache_tables: Arc<CacheTableManager>,
        id_cache: Arc<IdCache>,
        target: ConnectionPool,
        batch_size: usize,
        events: EventChannel,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            cache_tables,
            id_cache,
            target,
            batch_size: batch_size.max(1),
            events,
            cancel,
        }
    }

    /// Run the first pass and, if anything is left, exactly one retry pass;
    /// then report every remaining reference as unresolvable.
    pub async fn resolve(&self) -> Result<ResolutionSummary> {
        let mut summary = ResolutionSummary::default();

        for pass in 1..=2 {
            let report = self.resolve_pass().await?;
            summary.resolved += report.resolved;
            summary.passes = pass;

            let unresolvable = if pass == 2 { report.remaining } else { 0 };
            self.events.publish(PipelineEvent::ResolutionPassComplete {
                pass,
                resolved: report.resolved,
                unresolvable,
            });
            info!(
                "Resolution pass {}: {} resolved, {} remaining ({} batches)",
                pass, report.resolved, report.remaining, report.batches
            );

            if report.remaining == 0 {
                return Ok(summary);
            }
        }

        summary.unresolvable = self.report_unresolvable().await?;
        Ok(summary)
    }

    /// One sweep over every pending-reference partition.
    pub async fn resolve_pass(&self) -> Result<PassReport> {
        let mut report = PassReport::default();
        for handle in self.cache_tables.handles(CacheTableModel::PendingReference) {
            let partition = self.resolve_partition(&handle).await?;
            report.resolved += partition.resolved;
            report.remaining += partition.remaining;
            report.batches += partition.batches;
        }
        Ok(report)
    }

    /// Sweep one partition in `ceil(count / batch_size)` keyset batches.
    pub async fn resolve_partition(&self, handle: &CacheTableHandle) -> Result<PassReport> {
        let count = self.cache_tables.count(handle).await?.max(0) as u64;
        if count == 0 {
            self.cache_tables.drop_table(handle).await?;
            return Ok(PassReport::default());
        }

        let batch_size = self.batch_size as u64;
        let batches = count.div_ceil(batch_size);
        let mut report = PassReport::default();
        let mut after_id = 0i64;

        for _ in 0..batches {
            if self.cancel.is_cancelled() {
                return Err(BulkError::Cancelled);
            }

            let rows = self
                .cache_tables
                .scan(handle, after_id, self.batch_size)
                .await?;
            report.batches += 1;
            if rows.is_empty() {
                break;
            }

            let mut groups: BTreeMap<(String, String, Option<String>), Vec<Hit>> = BTreeMap::new();
            for row in &rows {
                let (key, reference) = PendingReference::from_row(row)?;
                after_id = after_id.max(key);

                let Some(target_id) = self.id_cache.get(&reference.target_external_id).await? else {
                    continue;
                };
                self.id_cache.consume(&reference.target_external_id).await?;

                let (payload_column, payload) = match reference.payload {
                    Some(p) => (Some(p.column), Some(p.value)),
                    None => (None, None),
                };
                groups
                    .entry((reference.origin_table, reference.origin_column, payload_column))
                    .or_default()
                    .push(Hit {
                        key,
                        origin_id: reference.origin_id,
                        target_id,
                        payload,
                    });
            }

            let mut resolved_keys = Vec::new();
            for ((table, column, payload_column), hits) in groups {
                self.apply(&table, &column, payload_column.as_deref(), &hits)
                    .await?;
                resolved_keys.extend(hits.iter().map(|h| h.key));
            }

            report.resolved += resolved_keys.len() as u64;
            self.cache_tables.delete_keys(handle, &resolved_keys).await?;
        }

        report.remaining = count - report.resolved;
        debug!(
            table = %handle.name,
            resolved = report.resolved,
            remaining = report.remaining,
            batches = report.batches,
            "Resolved partition"
        );

        if report.remaining == 0 {
            self.cache_tables.drop_table(handle).await?;
        }
        Ok(report)
    }

    /// Write foreign keys (and payloads) for one origin table and column.
    async fn apply(
        &self,
        table: &str,
        column: &str,
        payload_column: Option<&str>,
        hits: &[Hit],
    ) -> Result<()> {
        let dialect = self.target.dialect();
        let mut set_columns = vec![(column.to_string(), SqlType::BigInt)];
        if let Some(payload_column) = payload_column {
            set_columns.push((payload_column.to_string(), SqlType::Text));
        }

        let stride = set_columns.len() + 1;
        let chunk_size = dialect.capabilities().rows_per_statement(stride);
        let conn = self.target.acquire().await?;

        for chunk in hits.chunks(chunk_size) {
            let sql = dialect.build_case_update(table, "id", &set_columns, chunk.len());
            let mut params = Vec::with_capacity(chunk.len() * stride);
            for hit in chunk {
                params.push(SqlValue::I64(hit.origin_id));
                params.push(SqlValue::I64(hit.target_id));
                if payload_column.is_some() {
                    params.push(hit.payload.clone().into());
                }
            }
            conn.execute(&sql, &params).await?;
        }
        Ok(())
    }

    /// Report every reference still pending as unresolvable, one page at a
    /// time. Returns how many were reported.
    async fn report_unresolvable(&self) -> Result<u64> {
        let mut unresolvable = 0u64;
        for handle in self.cache_tables.handles(CacheTableModel::PendingReference) {
            let mut after_id = 0i64;
            loop {
                let rows = self
                    .cache_tables
                    .scan(&handle, after_id, self.batch_size)
                    .await?;
                if rows.is_empty() {
                    break;
                }
                for row in &rows {
                    let (key, reference) = PendingReference::from_row(row)?;
                    after_id = after_id.max(key);

                    let err = BulkError::reference(
                        format!(
                            "{}.{} (id {})",
                            reference.origin_table, reference.origin_column, reference.origin_id
                        ),
                        &reference.target_external_id,
                    );
                    warn!("{}", err);
                    self.events.publish(PipelineEvent::ReferenceUnresolvable {
                        origin_table: reference.origin_table,
                        origin_column: reference.origin_column,
                        origin_id: reference.origin_id,
                        target_external_id: reference.target_external_id,
                    });
                    unresolvable += 1;
                }
            }
        }
        if unresolvable > 0 {
            warn!("{} reference(s) could not be resolved", unresolvable);
        }
        Ok(unresolvable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_round_trip_keeps_payload() {
        let reference = PendingReference {
            origin_table: "feature_link".into(),
            origin_column: "target_id".into(),
            origin_id: 12,
            target_external_id: "gml_7".into(),
            payload: Some(ReferencePayload {
                column: "payload".into(),
                value: "#gml_7".into(),
            }),
        };
        let mut values = vec![SqlValue::I64(99)];
        values.extend(reference.to_row());

        let (key, parsed) = PendingReference::from_row(&Row::new(values)).unwrap();
        assert_eq!(key, 99);
        assert_eq!(parsed, reference);
    }

    #[tokio::test]
    async fn test_resolve_counts_unresolvable_and_reports_each() {
        use crate::config::IdCacheConfig;
        use crate::db::{PoolOptions, PoolRole};
        use std::time::Duration;

        let dir = tempfile::tempdir().unwrap();
        let options = |role| PoolOptions {
            role,
            size: 2,
            acquire_timeout: Duration::from_secs(5),
            max_reconnect_attempts: 1,
        };
        let target = ConnectionPool::sqlite(
            dir.path().join("target.db").to_string_lossy(),
            options(PoolRole::Writer),
        )
        .await
        .unwrap();
        crate::schema::ensure_schema(&target).await.unwrap();
        let cache_tables = Arc::new(CacheTableManager::new(
            ConnectionPool::sqlite(
                dir.path().join("cache.db").to_string_lossy(),
                options(PoolRole::Cache),
            )
            .await
            .unwrap(),
            "tmp_unres",
        ));
        let id_cache = Arc::new(IdCache::new(
            &IdCacheConfig::default(),
            1,
            Arc::clone(&cache_tables),
            false,
        ));

        let handle = cache_tables
            .create(CacheTableModel::PendingReference, 0)
            .await
            .unwrap();
        let rows = (1..=5)
            .map(|n| {
                PendingReference {
                    origin_table: "feature_link".into(),
                    origin_column: "target_id".into(),
                    origin_id: n,
                    target_external_id: format!("missing-{}", n),
                    payload: None,
                }
                .to_row()
            })
            .collect();
        cache_tables.insert_rows(&handle, rows).await.unwrap();

        let events = EventChannel::new();
        let mut subscription = events.subscribe();
        let resolver = Resolver::new(
            cache_tables,
            id_cache,
            target,
            2,
            events,
            CancellationToken::new(),
        );
        let summary = resolver.resolve().await.unwrap();

        assert_eq!(summary.passes, 2);
        assert_eq!(summary.resolved, 0);
        assert_eq!(summary.unresolvable, 5);
        let reported = subscription
            .drain()
            .into_iter()
            .filter(|e| matches!(e, PipelineEvent::ReferenceUnresolvable { .. }))
            .count();
        assert_eq!(reported, 5);
    }
}
