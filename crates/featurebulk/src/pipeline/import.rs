//! Import run: source records into the feature tables.

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{RunMode, RunSummary};
use crate::audit::AuditLog;
use crate::cache::CacheTableManager;
use crate::config::{CacheConfig, Config};
use crate::convert::{ConverterContext, ConverterStats, FeatureConverter};
use crate::db::{ConnectionPool, PoolOptions, PoolRole};
use crate::error::{BulkError, ErrorKind, Result};
use crate::events::{EventChannel, PipelineEvent};
use crate::idcache::IdCache;
use crate::record::RecordSource;
use crate::resolver::Resolver;
use crate::schema;
use crate::worker::{WorkerPool, WorkerPoolOptions};

/// Drives one import run.
pub struct ImportPipeline {
    config: Config,
    events: EventChannel,
    cancel: CancellationToken,
}

impl ImportPipeline {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            events: EventChannel::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Publish run events on an existing channel.
    pub fn with_events(mut self, events: EventChannel) -> Self {
        self.events = events;
        self
    }

    /// Stop the run when `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn events(&self) -> &EventChannel {
        &self.events
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Import every record of `source`.
    ///
    /// Always returns a summary; a fatal error is reported through its
    /// status and error message.
    pub async fn run<S: RecordSource>(&self, mut source: S) -> RunSummary {
        let mut summary = RunSummary::start(RunMode::Import);
        info!("Starting import run: {}", summary.run_id);

        let outcome = self.execute(&mut source, &mut summary).await;
        let summary = summary.finish(outcome);
        self.events.publish(PipelineEvent::RunFinished {
            summary: summary.clone(),
        });
        summary
    }

    async fn execute<S: RecordSource>(&self, source: &mut S, summary: &mut RunSummary) -> Result<()> {
        let resources = &self.config.resources;

        let target = ConnectionPool::connect(
            &self.config.database,
            PoolOptions::for_role(PoolRole::Writer, resources),
        )
        .await?;
        if self.config.import.create_schema {
            schema::ensure_schema(&target).await?;
        }

        let cache_pool = match self.open_cache_pool().await {
            Ok(pool) => pool,
            Err(e) => {
                target.close();
                return Err(e);
            }
        };
        let cache_tables = Arc::new(CacheTableManager::new(
            cache_pool,
            self.config.cache_table_prefix(),
        ));

        let outcome = self
            .ingest_and_resolve(source, &target, Arc::clone(&cache_tables), summary)
            .await;

        // Cache tables go away on every exit path
        if let Err(e) = cache_tables.drop_all().await {
            warn!("Failed to drop cache tables: {}", e);
        }
        cache_tables.pool().close();
        target.close();
        self.remove_local_cache().await;

        outcome
    }

    async fn open_cache_pool(&self) -> Result<ConnectionPool> {
        let options = PoolOptions::for_role(PoolRole::Cache, &self.config.resources);
        match &self.config.cache {
            CacheConfig::Database => ConnectionPool::connect(&self.config.database, options).await,
            CacheConfig::Local { path } => {
                tokio::fs::create_dir_all(path).await?;
                let file = self.local_cache_file(path);
                ConnectionPool::sqlite(file.to_string_lossy(), options).await
            }
        }
    }

    fn local_cache_file(&self, dir: &str) -> std::path::PathBuf {
        Path::new(dir).join(format!("{}.db", self.config.cache_table_prefix()))
    }

    async fn remove_local_cache(&self) {
        let CacheConfig::Local { path } = &self.config.cache else {
            return;
        };
        let file = self.local_cache_file(path);
        for suffix in ["", "-wal", "-shm"] {
            let mut name = file.clone().into_os_string();
            name.push(suffix);
            if tokio::fs::remove_file(&name).await.is_ok() {
                debug!("Removed {:?}", name);
            }
        }
    }

    async fn ingest_and_resolve<S: RecordSource>(
        &self,
        source: &mut S,
        target: &ConnectionPool,
        cache_tables: Arc<CacheTableManager>,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let resources = &self.config.resources;
        let import = &self.config.import;

        let id_cache = Arc::new(IdCache::new(
            &resources.id_cache,
            resources.get_partitions(),
            Arc::clone(&cache_tables),
            import.strict_unique_ids,
        ));
        let audit = match &import.audit_log {
            Some(path) => Some(Arc::new(AuditLog::create(path).await?)),
            None => None,
        };

        let ctx = Arc::new(ConverterContext {
            target: target.clone(),
            cache_tables: Arc::clone(&cache_tables),
            id_cache: Arc::clone(&id_cache),
            events: self.events.clone(),
            audit: audit.clone(),
            srid: self.config.database.srid,
            reference_buffer: import.reference_buffer,
            stats: ConverterStats::default(),
        });

        let workers = (0..resources.get_threads())
            .map(|worker_id| FeatureConverter::new(worker_id, Arc::clone(&ctx)))
            .collect();
        let mut pool = WorkerPool::start(
            workers,
            WorkerPoolOptions {
                queue_size: resources.get_queue_size(),
                submit_timeout: resources.submit_timeout(),
            },
            self.cancel.child_token(),
            self.events.clone(),
        );
        pool.register_interruptible(target.clone());
        pool.register_interruptible(cache_tables.pool().clone());

        info!("Phase 1: Importing records");
        let fed = self.feed(source, &pool, summary).await;
        let report = match &fed {
            Ok(()) => pool.close().await,
            Err(_) => pool.shutdown_now().await,
        };

        summary.processed = report.stats.processed;
        summary.failed = report.stats.failed;
        summary.references = ctx.stats.links();
        summary.duplicates = id_cache.duplicates();
        if let Some(audit) = &audit {
            audit.flush().await?;
        }

        // A worker's fatal error is the cause of the feed being cancelled
        if let Some(fatal) = report.fatal {
            return Err(fatal);
        }
        fed?;

        info!(
            "Imported {} records ({} references, {} deferred)",
            ctx.stats.features(),
            ctx.stats.links(),
            ctx.stats.deferred()
        );

        info!("Phase 2: Resolving deferred references");
        let resolver = Resolver::new(
            cache_tables,
            id_cache,
            target.clone(),
            import.resolver_batch_size,
            self.events.clone(),
            self.cancel.clone(),
        );
        let resolution = resolver.resolve().await?;
        summary.resolved = resolution.resolved;
        summary.unresolved = resolution.unresolvable;
        Ok(())
    }

    /// Submit source records until the source is exhausted or the pool stops.
    async fn feed<S: RecordSource>(
        &self,
        source: &mut S,
        pool: &WorkerPool<FeatureConverter>,
        summary: &mut RunSummary,
    ) -> Result<()> {
        loop {
            let next = tokio::select! {
                biased;
                _ = pool.cancellation_token().cancelled() => return Err(BulkError::Cancelled),
                next = source.next() => next,
            };

            match next {
                None => return Ok(()),
                Some(Ok(record)) => pool.submit(record).await?,
                Some(Err(e)) if e.kind() == ErrorKind::Conversion => {
                    summary.skipped += 1;
                    warn!("Skipping unreadable record: {}", e);
                    self.events.publish(PipelineEvent::RecordFailed {
                        external_id: None,
                        kind: e.kind(),
                        reason: e.to_string(),
                    });
                }
                Some(Err(e)) => return Err(e),
            }
        }
    }
}
