//! # featurebulk
//!
//! Bounded-memory bulk import and export of geospatial feature graphs.
//!
//! This library moves large sets of feature records between documents and a
//! relational backend with:
//!
//! - **SQL dialect adapters** for PostGIS, Oracle Spatial and SQLite
//! - **Parallel workers** behind a bounded queue for backpressure
//! - **Deferred reference resolution** for references to records not yet
//!   written, through transient cache tables
//! - **A partitioned identifier cache** that spills to cache tables instead
//!   of growing without limit
//!
//! ## Example
//!
//! ```rust,no_run
//! use featurebulk::{Config, ImportPipeline, JsonLinesSource};
//!
//! #[tokio::main]
//! async fn main() -> featurebulk::Result<()> {
//!     let config = Config::load("featurebulk.yaml")?.with_auto_tuning();
//!     let source = JsonLinesSource::open("features.jsonl").await?;
//!     let summary = ImportPipeline::new(config).run(source).await;
//!     println!("{}", summary.to_json()?);
//!     Ok(())
//! }
//! ```

pub mod audit;
pub mod cache;
pub mod config;
pub mod convert;
pub mod db;
pub mod dialect;
pub mod error;
pub mod events;
pub mod idcache;
pub mod logging;
pub mod pipeline;
pub mod record;
pub mod resolver;
pub mod schema;
pub mod worker;

// Re-exports for convenient access
pub use cache::{CacheTableHandle, CacheTableManager, CacheTableModel};
pub use config::{CacheConfig, Config, DatabaseConfig, IdCacheConfig, ImportConfig, ResourcesConfig};
pub use db::{ConnectionPool, PoolOptions, PoolRole, SqlValue};
pub use dialect::{BackendKind, Dialect, DialectImpl, SqlFragment};
pub use error::{BulkError, ErrorKind, Result};
pub use events::{EventChannel, PipelineEvent, Subscription};
pub use idcache::IdCache;
pub use logging::{setup_logging, LogFormat};
pub use pipeline::{ExportFilter, ExportPipeline, ImportPipeline, RunMode, RunStatus, RunSummary};
pub use record::{FeatureRecord, JsonLinesSink, JsonLinesSource, RecordSink, RecordSource};
pub use resolver::{PendingReference, Resolver};
pub use worker::{Worker, WorkerPool, WorkerPoolOptions};
