//! Configuration type definitions with auto-tuning based on system resources.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use sysinfo::System;
use tracing::info;

/// System resource information for auto-tuning.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total RAM in GB.
    pub total_memory_gb: f64,
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl SystemResources {
    /// Detect system resources.
    pub fn detect() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        let total_memory_gb = sys.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0);
        let cpu_cores = sys.cpus().len().max(1);

        Self {
            total_memory_gb,
            cpu_cores,
        }
    }

    /// Log detected system resources.
    pub fn log(&self) {
        info!(
            "System resources: {:.1} GB RAM, {} CPU cores",
            self.total_memory_gb, self.cpu_cores
        );
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Backend holding the feature tables.
    pub database: DatabaseConfig,

    /// Where transient cache tables live.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Threads, queues, pools and identifier cache sizing.
    #[serde(default)]
    pub resources: ResourcesConfig,

    /// Import behaviour.
    #[serde(default)]
    pub import: ImportConfig,
}

impl Config {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that weren't explicitly set in the config file.
    pub fn with_auto_tuning(mut self) -> Self {
        let resources = SystemResources::detect();
        resources.log();
        self.resources = self.resources.with_auto_tuning(&resources);
        self
    }
}

/// Backend connection components.
#[derive(Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Backend kind: "postgis", "oracle" or "sqlite".
    #[serde(default = "default_postgis")]
    pub r#type: String,

    /// Database host (ignored for sqlite).
    #[serde(default)]
    pub host: String,

    /// Port; the dialect's default port when not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Database name, or the database file path for sqlite.
    pub database: String,

    /// Schema holding the feature tables (ignored for sqlite).
    #[serde(default = "default_public_schema")]
    pub schema: String,

    /// Username.
    #[serde(default)]
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// Spatial reference system of stored geometries.
    #[serde(default = "default_srid")]
    pub srid: i32,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("type", &self.r#type)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("schema", &self.schema)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("srid", &self.srid)
            .finish()
    }
}

/// Location of transient cache tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum CacheConfig {
    /// Cache tables live in the target database.
    Database,
    /// Cache tables live in a local SQLite file.
    Local {
        /// Directory for the cache database file.
        #[serde(default = "default_cache_dir")]
        path: String,
    },
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig::Database
    }
}

/// Identifier cache sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdCacheConfig {
    /// Entries held in memory per partition before spilling starts.
    #[serde(default = "default_id_cache_size")]
    pub cache_size: usize,

    /// Fraction of `cache_size` at which a partition spills.
    #[serde(default = "default_page_factor")]
    pub page_factor: f64,

    /// Number of independent partitions; defaults to the worker count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partitions: Option<usize>,
}

impl Default for IdCacheConfig {
    fn default() -> Self {
        Self {
            cache_size: default_id_cache_size(),
            page_factor: default_page_factor(),
            partitions: None,
        }
    }
}

/// Resource configuration.
/// Performance-related fields use Option<T> to distinguish between
/// "not set" (use auto-tuned default) and "explicitly set" (use provided value).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResourcesConfig {
    /// Number of parallel workers. Auto-tuned based on CPU cores if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threads: Option<usize>,

    /// Capacity of the shared task queue. Auto-tuned from threads if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_size: Option<usize>,

    /// Identifier cache sizing.
    #[serde(default)]
    pub id_cache: IdCacheConfig,

    /// Connections used by export workers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reader_connections: Option<usize>,

    /// Connections used by import workers and the resolver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub writer_connections: Option<usize>,

    /// Connections to the cache backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_connections: Option<usize>,

    /// Seconds to wait for a free connection before failing the run.
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,

    /// Seconds a blocked submission may wait for queue space.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submit_timeout_secs: Option<u64>,

    /// Reconnect attempts before a connectivity error becomes fatal.
    #[serde(default = "default_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
}

impl ResourcesConfig {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that are None (not explicitly set).
    pub fn with_auto_tuning(mut self, resources: &SystemResources) -> Self {
        let cores = resources.cpu_cores;

        // Threads: cores - 1, but at least 2 and at most 32
        if self.threads.is_none() {
            self.threads = Some(cores.saturating_sub(1).clamp(2, 32));
        }
        let threads = self.get_threads();

        if self.queue_size.is_none() {
            self.queue_size = Some(threads * 100);
        }

        if self.id_cache.partitions.is_none() {
            self.id_cache.partitions = Some(threads.clamp(1, 16));
        }

        // Every worker holds one writer connection; the resolver needs one more
        if self.writer_connections.is_none() {
            self.writer_connections = Some(threads + 1);
        }

        if self.reader_connections.is_none() {
            self.reader_connections = Some(threads + 1);
        }

        // Id cache segments spill concurrently with worker partitions
        if self.cache_connections.is_none() {
            self.cache_connections = Some((threads + self.get_partitions()).min(64));
        }

        info!(
            "Auto-tuned resources: threads={}, queue_size={}, id_cache_partitions={}, \
             writer_conns={}, reader_conns={}, cache_conns={}",
            self.get_threads(),
            self.get_queue_size(),
            self.get_partitions(),
            self.get_writer_connections(),
            self.get_reader_connections(),
            self.get_cache_connections(),
        );

        self
    }

    // Accessor methods that return the effective value (with fallback defaults)
    // These are used when the config hasn't been auto-tuned yet

    pub fn get_threads(&self) -> usize {
        self.threads.unwrap_or(4)
    }

    pub fn get_queue_size(&self) -> usize {
        self.queue_size.unwrap_or(self.get_threads() * 100)
    }

    pub fn get_partitions(&self) -> usize {
        self.id_cache.partitions.unwrap_or(10)
    }

    pub fn get_reader_connections(&self) -> usize {
        self.reader_connections.unwrap_or(self.get_threads() + 1)
    }

    pub fn get_writer_connections(&self) -> usize {
        self.writer_connections.unwrap_or(self.get_threads() + 1)
    }

    pub fn get_cache_connections(&self) -> usize {
        self.cache_connections
            .unwrap_or(self.get_threads() + self.get_partitions())
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn submit_timeout(&self) -> Option<Duration> {
        self.submit_timeout_secs.map(Duration::from_secs)
    }
}

/// Import behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportConfig {
    /// Rows per resolver scan batch.
    #[serde(default = "default_resolver_batch")]
    pub resolver_batch_size: usize,

    /// Pending references buffered per worker before a flush.
    #[serde(default = "default_reference_buffer")]
    pub reference_buffer: usize,

    /// Fail records whose external id was already imported in this run.
    #[serde(default)]
    pub strict_unique_ids: bool,

    /// Optional audit log path (`TYPE,INTERNAL_ID,EXTERNAL_ID` per line).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_log: Option<String>,

    /// Create the feature tables when missing.
    #[serde(default = "default_true")]
    pub create_schema: bool,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            resolver_batch_size: default_resolver_batch(),
            reference_buffer: default_reference_buffer(),
            strict_unique_ids: false,
            audit_log: None,
            create_schema: true,
        }
    }
}

// Default value functions for serde
fn default_postgis() -> String {
    "postgis".to_string()
}

fn default_public_schema() -> String {
    "public".to_string()
}

fn default_srid() -> i32 {
    4326
}

fn default_cache_dir() -> String {
    std::env::temp_dir().to_string_lossy().into_owned()
}

fn default_id_cache_size() -> usize {
    200_000
}

fn default_page_factor() -> f64 {
    0.85
}

fn default_acquire_timeout() -> u64 {
    60
}

fn default_reconnect_attempts() -> u32 {
    3
}

fn default_resolver_batch() -> usize {
    10_000
}

fn default_reference_buffer() -> usize {
    1_000
}

fn default_true() -> bool {
    true
}
