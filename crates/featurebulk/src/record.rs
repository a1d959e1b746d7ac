//! Feature records and the document reader/writer seams.
//!
//! A [`RecordSource`] produces records lazily during import; a
//! [`RecordSink`] receives assembled records during export. JSON-lines
//! implementations of both are provided, one feature per line.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, Lines};

use crate::error::{BulkError, Result};

/// Geometry as well-known text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    pub wkt: String,
    /// Spatial reference system; the database SRID when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub srid: Option<i32>,
}

/// A reference from one feature to another by external id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureReference {
    /// Relationship name, e.g. "boundedBy" or "parent".
    pub role: String,
    /// External id of the referenced feature.
    pub target: String,
    /// Extra text stored with the link (e.g. the original href).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

/// One feature of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRecord {
    pub feature_type: String,
    pub external_id: String,
    #[serde(default)]
    pub properties: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geometry: Option<Geometry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<FeatureReference>,
}

impl FeatureRecord {
    pub fn new(feature_type: impl Into<String>, external_id: impl Into<String>) -> Self {
        Self {
            feature_type: feature_type.into(),
            external_id: external_id.into(),
            properties: serde_json::Value::Null,
            geometry: None,
            references: Vec::new(),
        }
    }

    pub fn with_geometry(mut self, wkt: impl Into<String>) -> Self {
        self.geometry = Some(Geometry {
            wkt: wkt.into(),
            srid: None,
        });
        self
    }

    pub fn with_reference(mut self, role: impl Into<String>, target: impl Into<String>) -> Self {
        self.references.push(FeatureReference {
            role: role.into(),
            target: target.into(),
            payload: None,
        });
        self
    }

    pub fn with_properties(mut self, properties: serde_json::Value) -> Self {
        self.properties = properties;
        self
    }
}

/// Lazily produces records to import.
#[async_trait]
pub trait RecordSource: Send {
    /// The next record, `None` at end of input.
    async fn next(&mut self) -> Option<Result<FeatureRecord>>;
}

/// Receives exported records.
#[async_trait]
pub trait RecordSink: Send {
    async fn write(&mut self, record: FeatureRecord) -> Result<()>;

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Reads one JSON feature per line; blank lines are skipped.
pub struct JsonLinesSource<R> {
    lines: Lines<R>,
    line_no: usize,
}

impl JsonLinesSource<BufReader<File>> {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path).await?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: AsyncBufRead + Unpin + Send> JsonLinesSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line_no: 0,
        }
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> RecordSource for JsonLinesSource<R> {
    async fn next(&mut self) -> Option<Result<FeatureRecord>> {
        loop {
            let line = match self.lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return None,
                Err(e) => return Some(Err(e.into())),
            };
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            // A malformed line is a conversion problem of that record only
            return Some(serde_json::from_str(&line).map_err(|e| {
                BulkError::conversion(format!("line {}", self.line_no), e.to_string())
            }));
        }
    }
}

/// Writes one JSON feature per line.
pub struct JsonLinesSink<W> {
    writer: W,
}

impl JsonLinesSink<BufWriter<File>> {
    pub async fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::create(path).await?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: AsyncWrite + Unpin + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> RecordSink for JsonLinesSink<W> {
    async fn write(&mut self, record: FeatureRecord) -> Result<()> {
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.writer.flush().await?;
        Ok(())
    }
}

/// Source over records already in memory.
pub struct IterSource<I> {
    records: I,
}

impl<I> IterSource<I>
where
    I: Iterator<Item = FeatureRecord> + Send,
{
    pub fn new(records: impl IntoIterator<IntoIter = I>) -> Self {
        Self {
            records: records.into_iter(),
        }
    }
}

#[async_trait]
impl<I> RecordSource for IterSource<I>
where
    I: Iterator<Item = FeatureRecord> + Send,
{
    async fn next(&mut self) -> Option<Result<FeatureRecord>> {
        self.records.next().map(Ok)
    }
}

/// Sink collecting records in memory.
#[derive(Debug, Default)]
pub struct VecSink {
    pub records: Vec<FeatureRecord>,
}

#[async_trait]
impl RecordSink for VecSink {
    async fn write(&mut self, record: FeatureRecord) -> Result<()> {
        self.records.push(record);
        Ok(())
    }
}
