//! Import and export runs.
//!
//! - [`ImportPipeline`]: records from a [`RecordSource`](crate::record::RecordSource)
//!   into the feature tables, then deferred-reference resolution.
//! - [`ExportPipeline`]: stored features back out to a
//!   [`RecordSink`](crate::record::RecordSink).
//!
//! Both end every run with a [`RunSummary`], also when a fatal error stops
//! the run early, and publish it as [`PipelineEvent::RunFinished`](crate::events::PipelineEvent::RunFinished).

mod export;
mod import;

pub use export::{ExportFilter, ExportPipeline};
pub use import::ImportPipeline;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::{BulkError, Result};

/// Direction of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Import,
    Export,
}

/// Final state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Cancelled,
    Failed,
}

/// Aggregate counts of a finished run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    /// Unique run identifier.
    pub run_id: String,

    pub mode: RunMode,

    pub status: RunStatus,

    pub started_at: DateTime<Utc>,

    pub completed_at: DateTime<Utc>,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    /// Records written (import) or emitted (export).
    pub processed: u64,

    /// Source entries that could not be read as records.
    pub skipped: u64,

    /// Records dropped by a recoverable error while being processed.
    pub failed: u64,

    /// References written across all records.
    pub references: u64,

    /// References applied by the resolver.
    pub resolved: u64,

    /// References whose target never appeared.
    pub unresolved: u64,

    /// External ids seen more than once.
    pub duplicates: u64,

    /// Detailed fatal error of a failed run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunSummary {
    fn start(mode: RunMode) -> Self {
        let now = Utc::now();
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            mode,
            status: RunStatus::Completed,
            started_at: now,
            completed_at: now,
            duration_seconds: 0.0,
            processed: 0,
            skipped: 0,
            failed: 0,
            references: 0,
            resolved: 0,
            unresolved: 0,
            duplicates: 0,
            error: None,
        }
    }

    fn finish(mut self, outcome: Result<()>) -> Self {
        self.completed_at = Utc::now();
        self.duration_seconds =
            (self.completed_at - self.started_at).num_milliseconds() as f64 / 1000.0;

        match outcome {
            Ok(()) => self.status = RunStatus::Completed,
            Err(BulkError::Cancelled) => self.status = RunStatus::Cancelled,
            Err(e) => {
                error!("{}", e.format_detailed());
                self.status = RunStatus::Failed;
                self.error = Some(e.to_string());
            }
        }

        let line = format!(
            "{:?} run {} {:?}: {} processed, {} skipped, {} failed, {} unresolved in {:.1}s",
            self.mode,
            self.run_id,
            self.status,
            self.processed,
            self.skipped,
            self.failed,
            self.unresolved,
            self.duration_seconds
        );
        if self.status == RunStatus::Completed {
            info!("{}", line);
        } else {
            warn!("{}", line);
        }
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
