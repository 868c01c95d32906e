//! Record output for dnswatch
//!
//! Sinks consume decoded [`DnsSendRecord`]s: a column printer, a JSON lines
//! writer, a per-process top view and a Prometheus endpoint.

pub mod exporter;
pub mod jsonl;
pub mod printer;
pub mod top;

pub use exporter::{metrics_router, serve_metrics, serve_metrics_on, MetricsSink};
pub use jsonl::{JsonlExporter, JsonlExporterConfig};
pub use printer::{call_line, parse_fields, Field, TextPrinter};
pub use top::{TopAggregator, TopRow};

use async_trait::async_trait;
use dnswatch_core::DnsSendRecord;
use thiserror::Error;

/// Export error type
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown field '{field}' (valid: {valid})")]
    InvalidField { field: String, valid: String },

    #[error("Output writer poisoned")]
    Poisoned,
}

pub type ExportResult<T> = Result<T, ExportError>;

/// A consumer of DNS send records
#[async_trait]
pub trait RecordSink: Send + Sync {
    fn name(&self) -> &str;

    /// Write one record
    async fn export(&self, record: &DnsSendRecord) -> ExportResult<()>;

    /// Flush buffered output
    async fn flush(&self) -> ExportResult<()> {
        Ok(())
    }
}
