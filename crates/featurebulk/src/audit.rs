//! Audit log of imported records.
//!
//! One line `TYPE,INTERNAL_ID,EXTERNAL_ID` per record, shared by all workers.

use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;
use tracing::info;

use crate::error::Result;

pub struct AuditLog {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl AuditLog {
    /// Create (or truncate) the log file.
    pub async fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).await?;
        info!("Writing audit log to {:?}", path);
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn record(&self, feature_type: &str, internal_id: i64, external_id: &str) -> Result<()> {
        let line = format!("{},{},{}\n", feature_type, internal_id, external_id);
        self.writer.lock().await.write_all(line.as_bytes()).await?;
        Ok(())
    }

    pub async fn flush(&self) -> Result<()> {
        self.writer.lock().await.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lines_are_written_on_flush() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::create(dir.path().join("audit.csv")).await.unwrap();

        log.record("Building", 1, "b-1").await.unwrap();
        log.record("Parcel", 2, "p-9").await.unwrap();
        log.flush().await.unwrap();

        let content = std::fs::read_to_string(log.path()).unwrap();
        assert_eq!(content, "Building,1,b-1\nParcel,2,p-9\n");
    }
}
