//! Export run: stored features out to a record sink.
//!
//! The run pages through feature ids and hands them to reader workers. Each
//! worker assembles one [`FeatureRecord`] per id and sends it over a bounded
//! channel; the run writes them to the sink in arrival order.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{RunMode, RunSummary};
use crate::config::Config;
use crate::db::{ConnectionPool, PoolOptions, PoolRole, SqlValue};
use crate::dialect::{BoundingBox, Dialect, SelectQueryOptions, SpatialPredicate};
use crate::error::{BulkError, Result};
use crate::events::{EventChannel, PipelineEvent};
use crate::record::{FeatureRecord, FeatureReference, Geometry, RecordSink};
use crate::schema::{FEATURE_TABLE, LINK_PAYLOAD_COLUMN, LINK_TABLE};
use crate::worker::{Worker, WorkerPool, WorkerPoolOptions};

/// Which features to export.
#[derive(Debug, Clone, Default)]
pub struct ExportFilter {
    pub feature_type: Option<String>,
    /// Only features whose geometry overlaps this box. Ignored on backends
    /// without spatial predicates.
    pub bbox: Option<BoundingBox>,
}

/// Drives one export run.
pub struct ExportPipeline {
    config: Config,
    filter: ExportFilter,
    page_size: Option<usize>,
    events: EventChannel,
    cancel: CancellationToken,
}

impl ExportPipeline {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            filter: ExportFilter::default(),
            page_size: None,
            events: EventChannel::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_filter(mut self, filter: ExportFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Feature ids read per page; defaults to the dialect's batch size.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size.max(1));
        self
    }

    pub fn with_events(mut self, events: EventChannel) -> Self {
        self.events = events;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn events(&self) -> &EventChannel {
        &self.events
    }

    /// Export every matching feature to `sink`.
    pub async fn run<K: RecordSink>(&self, sink: &mut K) -> RunSummary {
        let mut summary = RunSummary::start(RunMode::Export);
        info!("Starting export run: {}", summary.run_id);

        let outcome = self.execute(sink, &mut summary).await;
        let summary = summary.finish(outcome);
        self.events.publish(PipelineEvent::RunFinished {
            summary: summary.clone(),
        });
        summary
    }

    async fn execute<K: RecordSink>(&self, sink: &mut K, summary: &mut RunSummary) -> Result<()> {
        let resources = &self.config.resources;
        let reader = ConnectionPool::connect(
            &self.config.database,
            PoolOptions::for_role(PoolRole::Reader, resources),
        )
        .await?;

        let outcome = self.export(&reader, sink, summary).await;
        reader.close();
        outcome
    }

    async fn export<K: RecordSink>(
        &self,
        reader: &ConnectionPool,
        sink: &mut K,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let resources = &self.config.resources;
        let threads = resources.get_threads();
        let (tx, mut rx) = mpsc::channel::<FeatureRecord>(resources.get_queue_size().max(1));
        let run_cancel = self.cancel.child_token();

        let workers = (0..threads)
            .map(|_| FeatureAssembler {
                reader: reader.clone(),
                output: tx.clone(),
                events: self.events.clone(),
                cancel: run_cancel.clone(),
            })
            .collect();
        // Workers hold the only senders; the channel closes once they are joined
        drop(tx);

        let mut pool = WorkerPool::start(
            workers,
            WorkerPoolOptions {
                queue_size: resources.get_queue_size(),
                submit_timeout: resources.submit_timeout(),
            },
            run_cancel.clone(),
            self.events.clone(),
        );
        pool.register_interruptible(reader.clone());

        let produce = async {
            let fed = self.feed_ids(reader, &pool).await;
            let report = match &fed {
                Ok(()) => pool.close().await,
                Err(_) => pool.shutdown_now().await,
            };
            (fed, report)
        };

        let consume = async move {
            let mut written = 0u64;
            while let Some(record) = rx.recv().await {
                if let Err(e) = sink.write(record).await {
                    run_cancel.cancel();
                    // Releases assemblers blocked on a full channel
                    drop(rx);
                    return Err(e);
                }
                written += 1;
            }
            sink.flush().await?;
            Ok(written)
        };

        let ((fed, report), written) = tokio::join!(produce, consume);

        summary.processed = report.stats.processed;
        summary.failed = report.stats.failed;
        if let Some(fatal) = report.fatal {
            return Err(fatal);
        }
        let written = written?;
        fed?;

        info!("Exported {} features", written);
        Ok(())
    }

    /// Page through matching feature ids and submit them.
    async fn feed_ids(&self, reader: &ConnectionPool, pool: &WorkerPool<FeatureAssembler>) -> Result<()> {
        let dialect = reader.dialect();
        let page_size = self
            .page_size
            .unwrap_or(dialect.capabilities().max_batch_size);

        let mut conditions = Vec::new();
        let mut params = Vec::new();
        if let Some(feature_type) = &self.filter.feature_type {
            conditions.push(format!(
                "{} = {}",
                dialect.quote_ident("feature_type"),
                dialect.param_placeholder(params.len() + 1)
            ));
            params.push(SqlValue::from(feature_type.as_str()));
        }

        let mut id_column = dialect.quote_ident("id");
        if let Some(bbox) = &self.filter.bbox {
            let predicate = dialect
                .envelope(bbox, self.config.database.srid)
                .into_option()
                .map(|envelope| {
                    dialect.spatial_predicate(
                        SpatialPredicate::BboxOverlaps,
                        &dialect.quote_ident("geometry"),
                        &envelope,
                    )
                });
            match predicate.and_then(|p| p.into_option()) {
                Some(predicate) => {
                    conditions.push(predicate);
                    if let Some(hint) = dialect
                        .spatial_query_hint(FEATURE_TABLE, "feature_geometry_idx")
                        .into_option()
                    {
                        id_column = format!("{} {}", hint, id_column);
                    }
                }
                None => warn!(
                    "{} has no spatial predicates; bounding box filter ignored",
                    dialect.name()
                ),
            }
        }

        let where_clause = if conditions.is_empty() {
            None
        } else {
            Some(conditions.join(" AND "))
        };

        let mut last_id = 0i64;
        let mut pages = 0u64;
        loop {
            if pool.cancellation_token().is_cancelled() {
                return Err(BulkError::Cancelled);
            }

            let sql = dialect.build_select_query(&SelectQueryOptions {
                schema: None,
                table: FEATURE_TABLE.to_string(),
                columns: vec![id_column.clone()],
                pk_col: Some("id".to_string()),
                min_pk: Some(last_id),
                where_clause: where_clause.clone(),
                limit: Some(page_size),
            });
            let ids = {
                let conn = reader.acquire().await?;
                conn.query(&sql, &params).await?
            };
            pages += 1;

            for row in &ids {
                let id = row.get_i64(0)?;
                last_id = last_id.max(id);
                pool.submit(id).await?;
            }
            if ids.len() < page_size {
                break;
            }
        }

        debug!("Read {} id pages", pages);
        Ok(())
    }
}

/// Export worker assembling one record per feature id.
struct FeatureAssembler {
    reader: ConnectionPool,
    output: mpsc::Sender<FeatureRecord>,
    events: EventChannel,
    cancel: CancellationToken,
}

impl FeatureAssembler {
    async fn assemble(&self, id: i64) -> Result<FeatureRecord> {
        let conn = self.reader.acquire().await?;
        let dialect = conn.dialect();
        let q = |c: &str| dialect.quote_ident(c);

        let feature_sql = format!(
            "SELECT {}, {}, {}, {} FROM {} WHERE {} = {}",
            q("feature_type"),
            q("external_id"),
            q("properties"),
            dialect.geometry_to_text(&q("geometry")),
            q(FEATURE_TABLE),
            q("id"),
            dialect.param_placeholder(1)
        );
        let row = conn
            .query_opt(&feature_sql, &[SqlValue::I64(id)])
            .await?
            .ok_or_else(|| BulkError::conversion(id.to_string(), "feature no longer exists"))?;

        let external_id = row.get_string(1)?;
        let properties = match row.get_opt_string(2)? {
            Some(text) => serde_json::from_str(&text)
                .map_err(|e| BulkError::conversion(&external_id, format!("properties: {}", e)))?,
            None => serde_json::Value::Null,
        };

        let links_sql = format!(
            "SELECT {}, {}, {} FROM {} WHERE {} = {} ORDER BY {}",
            q("role"),
            q("target_external_id"),
            q(LINK_PAYLOAD_COLUMN),
            q(LINK_TABLE),
            q("feature_id"),
            dialect.param_placeholder(1),
            q("id")
        );
        let references = conn
            .query(&links_sql, &[SqlValue::I64(id)])
            .await?
            .iter()
            .map(|link| {
                Ok(FeatureReference {
                    role: link.get_string(0)?,
                    target: link.get_string(1)?,
                    payload: link.get_opt_string(2)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(FeatureRecord {
            feature_type: row.get_string(0)?,
            external_id,
            properties,
            geometry: row
                .get_opt_string(3)?
                .map(|wkt| Geometry { wkt, srid: None }),
            references,
        })
    }
}

#[async_trait]
impl Worker for FeatureAssembler {
    type Task = i64;

    async fn process(&mut self, id: i64) -> Result<()> {
        let record = self.assemble(id).await?;
        let external_id = record.external_id.clone();
        // The consumer only goes away when the run is stopping
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(BulkError::Cancelled),
            sent = self.output.send(record) => sent.map_err(|_| BulkError::Cancelled)?,
        }
        self.events.publish(PipelineEvent::RecordProcessed {
            external_id,
            internal_id: Some(id),
        });
        Ok(())
    }

    fn label(id: &i64) -> Option<String> {
        Some(id.to_string())
    }
}
