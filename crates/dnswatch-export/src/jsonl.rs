//! JSON lines exporter

use crate::{ExportError, ExportResult, RecordSink};
use async_trait::async_trait;
use dnswatch_core::DnsSendRecord;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::info;

/// JSONL exporter configuration
#[derive(Debug, Clone)]
pub struct JsonlExporterConfig {
    /// Output file path (None = stdout)
    pub path: Option<PathBuf>,

    /// Whether to append to existing file
    pub append: bool,

    /// Flush after each write
    pub flush_each: bool,
}

impl Default for JsonlExporterConfig {
    fn default() -> Self {
        Self {
            path: None,
            append: true,
            flush_each: true,
        }
    }
}

/// Writes one JSON object per record
pub struct JsonlExporter {
    config: JsonlExporterConfig,
    writer: Mutex<Box<dyn Write + Send>>,
    records_written: AtomicU64,
}

impl JsonlExporter {
    /// Open the configured output
    pub fn open(config: JsonlExporterConfig) -> ExportResult<Self> {
        let writer: Box<dyn Write + Send> = match &config.path {
            Some(path) => {
                let file = if config.append {
                    OpenOptions::new().create(true).append(true).open(path)?
                } else {
                    File::create(path)?
                };
                info!("JSONL exporter writing to: {:?}", path);
                Box::new(BufWriter::new(file))
            }
            None => Box::new(std::io::stdout()),
        };
        Ok(Self::with_writer(config, writer))
    }

    pub fn with_writer(config: JsonlExporterConfig, writer: Box<dyn Write + Send>) -> Self {
        Self {
            config,
            writer: Mutex::new(writer),
            records_written: AtomicU64::new(0),
        }
    }

    pub fn records_written(&self) -> u64 {
        self.records_written.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl RecordSink for JsonlExporter {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn export(&self, record: &DnsSendRecord) -> ExportResult<()> {
        let json = serde_json::to_string(record)?;

        let mut w = self.writer.lock().map_err(|_| ExportError::Poisoned)?;
        writeln!(w, "{}", json)?;
        if self.config.flush_each {
            w.flush()?;
        }

        self.records_written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn flush(&self) -> ExportResult<()> {
        let mut w = self.writer.lock().map_err(|_| ExportError::Poisoned)?;
        w.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dnswatch_ebpf_common::{DnsSendEvent, FnId};

    fn record(tgid: u32) -> DnsSendRecord {
        let mut event = DnsSendEvent::zeroed();
        event.tgid = tgid;
        event.pid = tgid;
        event.comm[..4].copy_from_slice(b"curl");
        event.fn_id = FnId::Udpv6Sendmsg as u8;
        event.sock_port_nr = 5353;
        DnsSendRecord::from_raw(&event).unwrap()
    }

    #[tokio::test]
    async fn test_writes_one_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dns.jsonl");
        let exporter = JsonlExporter::open(JsonlExporterConfig {
            path: Some(path.clone()),
            ..Default::default()
        })
        .unwrap();

        exporter.export(&record(1)).await.unwrap();
        exporter.export(&record(2)).await.unwrap();
        exporter.flush().await.unwrap();
        assert_eq!(exporter.records_written(), 2);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["tgid"], 1);
        assert_eq!(lines[1]["comm"], "curl");
        assert_eq!(lines[1]["hook"], "udpv6_sendmsg");
        assert_eq!(lines[1]["sock_port"], 5353);
    }

    #[tokio::test]
    async fn test_truncate_mode_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dns.jsonl");
        std::fs::write(&path, "stale\n").unwrap();

        let exporter = JsonlExporter::open(JsonlExporterConfig {
            path: Some(path.clone()),
            append: false,
            ..Default::default()
        })
        .unwrap();
        exporter.export(&record(3)).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(!content.contains("stale"));
        assert_eq!(content.lines().count(), 1);
    }
}
