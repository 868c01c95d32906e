//! Capture backend trait
//!
//! A backend produces [`DnsSendRecord`]s on a channel until stopped. The eBPF
//! backend reads them from the kernel; the synthetic backend drives the
//! in-process capture engine.

use crate::events::DnsSendRecord;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;

/// Capture error type
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Failed to load probe object: {0}")]
    LoadFailed(String),

    #[error("Failed to attach {program}: {reason}")]
    AttachFailed { program: String, reason: String },

    #[error("Capture not supported: {0}")]
    Unsupported(String),

    #[error("Capture already running")]
    AlreadyRunning,

    #[error("Capture configuration error: {0}")]
    Configuration(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl CaptureError {
    pub fn attach(program: impl Into<String>, reason: impl ToString) -> Self {
        CaptureError::AttachFailed {
            program: program.into(),
            reason: reason.to_string(),
        }
    }
}

pub type CaptureResult<T> = Result<T, CaptureError>;

/// A source of DNS send records
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    /// Backend name, for logs and status output
    fn name(&self) -> &str;

    /// Attach and start forwarding records to `tx`.
    ///
    /// Attach failures are returned before any record is produced.
    async fn start(&mut self, tx: mpsc::Sender<DnsSendRecord>) -> CaptureResult<()>;

    /// Stop forwarding and detach
    async fn stop(&mut self) -> CaptureResult<()>;

    /// Check if capture is running
    fn is_running(&self) -> bool;

    /// Get capture statistics
    fn stats(&self) -> CaptureStats {
        CaptureStats::default()
    }
}

/// Capture statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CaptureStats {
    /// Records forwarded to the consumer
    pub events_captured: u64,
    /// Records lost (channel full, consumer gone)
    pub events_dropped: u64,
    /// Records carrying a kernel command line
    pub cmdline_kernel: u64,
    /// Records whose command line came from /proc
    pub cmdline_procfs: u64,
    /// Samples that failed to decode
    pub errors: u64,
    /// Ring buffer poll iterations
    pub ringbuf_polls: u64,
}

/// Shared atomic counters behind [`CaptureStats`]
#[derive(Debug, Default)]
pub struct CaptureCounters {
    pub events_captured: AtomicU64,
    pub events_dropped: AtomicU64,
    pub cmdline_kernel: AtomicU64,
    pub cmdline_procfs: AtomicU64,
    pub errors: AtomicU64,
    pub ringbuf_polls: AtomicU64,
}

impl CaptureCounters {
    pub fn snapshot(&self) -> CaptureStats {
        CaptureStats {
            events_captured: self.events_captured.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            cmdline_kernel: self.cmdline_kernel.load(Ordering::Relaxed),
            cmdline_procfs: self.cmdline_procfs.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            ringbuf_polls: self.ringbuf_polls.load(Ordering::Relaxed),
        }
    }

    /// Count a record about to be forwarded, by command line source.
    pub fn record(&self, record: &DnsSendRecord) {
        use crate::events::CmdlineSource;

        self.events_captured.fetch_add(1, Ordering::Relaxed);
        match record.cmdline_source {
            CmdlineSource::Kernel => {
                self.cmdline_kernel.fetch_add(1, Ordering::Relaxed);
            }
            CmdlineSource::Procfs => {
                self.cmdline_procfs.fetch_add(1, Ordering::Relaxed);
            }
            CmdlineSource::Unknown => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{CmdlineSource, DnsSendRecord};
    use dnswatch_ebpf_common::DnsSendEvent;

    #[test]
    fn test_counters_snapshot() {
        let counters = CaptureCounters::default();
        let mut record = DnsSendRecord::from_raw(&DnsSendEvent::zeroed()).unwrap();
        counters.record(&record);
        record.fill_cmdline(Some("dig".into()), CmdlineSource::Procfs);
        counters.record(&record);
        counters.errors.fetch_add(1, Ordering::Relaxed);

        let stats = counters.snapshot();
        assert_eq!(stats.events_captured, 2);
        assert_eq!(stats.cmdline_procfs, 1);
        assert_eq!(stats.cmdline_kernel, 0);
        assert_eq!(stats.errors, 1);
    }

    #[test]
    fn test_attach_error_message() {
        let err = CaptureError::attach("dnswatch_kprobe_udp_sendmsg", "permission denied");
        assert_eq!(
            err.to_string(),
            "Failed to attach dnswatch_kprobe_udp_sendmsg: permission denied"
        );
    }

    struct Idle;

    #[async_trait]
    impl CaptureBackend for Idle {
        fn name(&self) -> &str {
            "idle"
        }

        async fn start(&mut self, _tx: mpsc::Sender<DnsSendRecord>) -> CaptureResult<()> {
            Err(CaptureError::Unsupported("idle backend".into()))
        }

        async fn stop(&mut self) -> CaptureResult<()> {
            Ok(())
        }

        fn is_running(&self) -> bool {
            false
        }
    }

    #[test]
    fn test_default_stats_and_boxed_backend() {
        let mut backend: Box<dyn CaptureBackend> = Box::new(Idle);
        let (tx, _rx) = mpsc::channel(1);
        let result = tokio_test::block_on(backend.start(tx));
        assert!(matches!(result, Err(CaptureError::Unsupported(_))));
        assert_eq!(backend.stats(), CaptureStats::default());
        assert!(!backend.is_running());
    }
}
