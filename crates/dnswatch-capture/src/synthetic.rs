//! Synthetic capture backend
//!
//! Drives the in-process [`CaptureEngine`] with a scripted workload of
//! resolvers and clients, so the full decode and output path can run without
//! eBPF (CI, non-Linux hosts, `dnswatch demo`).

use crate::engine::{Argv, CaptureEngine, EngineConfig, MsgHeader, Socket, Task, RECORD_FOOTPRINT};
use crate::filter::EventFilter;
use async_trait::async_trait;
use dnswatch_core::events::local_hostname;
use dnswatch_core::{
    CaptureBackend, CaptureCounters, CaptureError, CaptureResult, CaptureStats, DnsSendRecord,
};
use dnswatch_ebpf_common::FnId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Configuration for the synthetic workload
#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    /// Interval between workload rounds in milliseconds
    pub interval_ms: u64,

    /// Number of records to deliver (0 = infinite)
    pub event_count: u64,

    /// Base tgid for simulated processes
    pub tgid_base: u32,

    /// Copy exec-time command lines into records
    pub cmdline_enrichment: bool,

    /// Engine ring size in records
    pub ring_records: usize,

    /// Records to deliver
    pub filter: EventFilter,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            interval_ms: 500,
            event_count: 0,
            tgid_base: 20_000,
            cmdline_enrichment: true,
            ring_records: 4096,
            filter: EventFilter::default(),
        }
    }
}

/// One simulated process and the send it performs each round
struct Actor {
    task: Task,
    argv: &'static [&'static str],
    hook: FnId,
    socket: Socket,
    msg: MsgHeader,
}

fn workload(tgid_base: u32) -> Vec<Actor> {
    let to_53 = MsgHeader::to_port(53);
    vec![
        Actor {
            task: Task::process(tgid_base + 1, "dig"),
            argv: &["dig", "example.com", "@8.8.8.8"],
            hook: FnId::UdpSendmsg,
            socket: Socket::unconnected(41_001),
            msg: to_53,
        },
        Actor {
            task: Task::new(tgid_base + 2, tgid_base + 7, "curl"),
            argv: &["curl", "-s", "https://example.org/"],
            hook: FnId::Udpv6Sendmsg,
            socket: Socket::connected(41_002, 53),
            msg: MsgHeader::default(),
        },
        Actor {
            task: Task::process(tgid_base + 3, "systemd-resolve"),
            argv: &[],
            hook: FnId::UdpSendmsg,
            socket: Socket::unconnected(5355),
            msg: to_53,
        },
        Actor {
            task: Task::process(tgid_base + 4, "unbound"),
            argv: &["/usr/sbin/unbound", "-d", "-c", "/etc/unbound/unbound.conf.d/local.conf"],
            hook: FnId::TcpSendmsg,
            socket: Socket::connected(41_004, 53),
            msg: MsgHeader::default(),
        },
        // HTTPS traffic, filtered out in the engine.
        Actor {
            task: Task::process(tgid_base + 5, "wget"),
            argv: &["wget", "https://example.net/"],
            hook: FnId::TcpSendmsg,
            socket: Socket::connected(41_005, 443),
            msg: MsgHeader::default(),
        },
    ]
}

/// Synthetic capture backend
pub struct SyntheticCapture {
    config: SyntheticConfig,
    running: Arc<AtomicBool>,
    counters: Arc<CaptureCounters>,
    shutdown: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl SyntheticCapture {
    pub fn new() -> Self {
        Self::with_config(SyntheticConfig::default())
    }

    pub fn with_config(config: SyntheticConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(CaptureCounters::default()),
            shutdown: None,
            task: None,
        }
    }

    async fn join_task(&mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Synthetic capture task failed: {}", e);
            }
        }
    }
}

impl Default for SyntheticCapture {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CaptureBackend for SyntheticCapture {
    fn name(&self) -> &str {
        "synthetic"
    }

    async fn start(&mut self, tx: mpsc::Sender<DnsSendRecord>) -> CaptureResult<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(CaptureError::AlreadyRunning);
        }
        // A workload that ended on its own still has a task to reap.
        self.join_task().await;

        let engine = CaptureEngine::attach(EngineConfig {
            ring_bytes: self.config.ring_records * RECORD_FOOTPRINT,
            cmdline_enrichment: self.config.cmdline_enrichment,
        });
        let actors = workload(self.config.tgid_base);
        // Processes with argv were exec'd before the capture began.
        for actor in actors.iter().filter(|a| !a.argv.is_empty()) {
            engine.on_exec(&actor.task, &Argv::new(actor.argv));
        }

        self.running.store(true, Ordering::SeqCst);
        info!("Starting synthetic capture");

        let running = self.running.clone();
        let counters = self.counters.clone();
        let config = self.config.clone();
        let host = local_hostname();
        let (shutdown_tx, mut shutdown) = watch::channel(false);
        self.shutdown = Some(shutdown_tx);

        self.task = Some(tokio::spawn(async move {
            let mut delivered = 0u64;

            'outer: while running.load(Ordering::SeqCst) {
                for actor in &actors {
                    engine.on_sendmsg(actor.hook, &actor.task, &actor.socket, &actor.msg);
                }

                for event in engine.drain(usize::MAX) {
                    let record = match DnsSendRecord::from_raw(&event) {
                        Ok(record) => record.with_host(host.clone()),
                        Err(e) => {
                            debug!("Dropping undecodable record: {}", e);
                            counters.errors.fetch_add(1, Ordering::Relaxed);
                            continue;
                        }
                    };
                    if !config.filter.matches(&record) {
                        continue;
                    }
                    if !running.load(Ordering::SeqCst) {
                        break 'outer;
                    }
                    counters.record(&record);
                    tokio::select! {
                        biased;
                        _ = shutdown.changed() => break 'outer,
                        sent = tx.send(record) => {
                            if sent.is_err() {
                                break 'outer;
                            }
                        }
                    }
                    delivered += 1;
                    if config.event_count > 0 && delivered >= config.event_count {
                        break 'outer;
                    }
                }

                counters.ringbuf_polls.fetch_add(1, Ordering::Relaxed);
                tokio::select! {
                    _ = shutdown.changed() => break 'outer,
                    _ = tokio::time::sleep(tokio::time::Duration::from_millis(config.interval_ms)) => {}
                }
            }

            engine.detach();
            running.store(false, Ordering::SeqCst);
            info!(
                "Synthetic capture stopped. Delivered {} records ({} sends filtered in-engine)",
                delivered,
                engine.stats().not_dns
            );
        }));

        Ok(())
    }

    /// Returns once the workload task has exited; no record is sent after that.
    async fn stop(&mut self) -> CaptureResult<()> {
        info!("Stopping synthetic capture...");
        self.running.store(false, Ordering::SeqCst);
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        self.join_task().await;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn stats(&self) -> CaptureStats {
        self.counters.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dnswatch_core::{CmdlineSource, Hook};

    async fn collect(capture: &mut SyntheticCapture, limit: usize) -> Vec<DnsSendRecord> {
        let (tx, mut rx) = mpsc::channel(100);
        capture.start(tx).await.unwrap();

        let mut records = Vec::new();
        while let Ok(Some(record)) =
            tokio::time::timeout(tokio::time::Duration::from_millis(500), rx.recv()).await
        {
            records.push(record);
            if records.len() >= limit {
                break;
            }
        }
        records
    }

    #[tokio::test]
    async fn test_synthetic_round_contents() {
        let mut capture = SyntheticCapture::with_config(SyntheticConfig {
            interval_ms: 10,
            event_count: 4,
            ..Default::default()
        });
        let records = collect(&mut capture, 4).await;
        assert_eq!(records.len(), 4);

        let dig = records.iter().find(|r| r.comm == "dig").unwrap();
        assert_eq!(dig.hook, Hook::UdpSendmsg);
        assert_eq!(dig.sock_port, 41_001);
        assert_eq!(dig.cmdline.as_deref(), Some("dig example.com @8.8.8.8"));
        assert_eq!(dig.cmdline_source, CmdlineSource::Kernel);

        let curl = records.iter().find(|r| r.comm == "curl").unwrap();
        assert_eq!(curl.hook, Hook::Udpv6Sendmsg);
        assert_ne!(curl.pid, curl.tgid);

        let resolved = records.iter().find(|r| r.comm == "systemd-resolve").unwrap();
        assert!(resolved.cmdline.is_none());

        let unbound = records.iter().find(|r| r.comm == "unbound").unwrap();
        assert_eq!(unbound.hook, Hook::TcpSendmsg);
        assert_eq!(unbound.sock_port, 41_004);
        // Fourth argument truncated to 29 bytes.
        assert_eq!(
            unbound.cmdline.as_deref(),
            Some("/usr/sbin/unbound -d -c /etc/unbound/unbound.conf.d/l")
        );

        assert!(records.iter().all(|r| r.comm != "wget"));
    }

    #[tokio::test]
    async fn test_synthetic_applies_filter_and_stats() {
        let mut capture = SyntheticCapture::with_config(SyntheticConfig {
            interval_ms: 5,
            event_count: 3,
            filter: EventFilter::new().include_comm("dig"),
            ..Default::default()
        });
        let records = collect(&mut capture, 3).await;
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.comm == "dig"));

        let stats = capture.stats();
        assert_eq!(stats.events_captured, 3);
        assert_eq!(stats.cmdline_kernel, 3);
    }

    #[tokio::test]
    async fn test_synthetic_without_enrichment() {
        let mut capture = SyntheticCapture::with_config(SyntheticConfig {
            interval_ms: 5,
            event_count: 4,
            cmdline_enrichment: false,
            ..Default::default()
        });
        let records = collect(&mut capture, 4).await;
        assert!(!records.is_empty());
        assert!(records.iter().all(|r| r.cmdline.is_none()));
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let mut capture = SyntheticCapture::with_config(SyntheticConfig {
            interval_ms: 10,
            ..Default::default()
        });
        let (tx, _rx) = mpsc::channel(100);
        capture.start(tx.clone()).await.unwrap();
        assert!(capture.is_running());
        assert!(matches!(
            capture.start(tx).await,
            Err(CaptureError::AlreadyRunning)
        ));
        capture.stop().await.unwrap();
        assert!(!capture.is_running());
    }

    #[tokio::test]
    async fn test_no_records_after_stop_returns() {
        let mut capture = SyntheticCapture::with_config(SyntheticConfig {
            interval_ms: 1,
            ..Default::default()
        });
        let (tx, mut rx) = mpsc::channel(1);
        capture.start(tx).await.unwrap();
        assert!(rx.recv().await.is_some());

        // The task is blocked on the full channel here.
        capture.stop().await.unwrap();
        assert!(!capture.is_running());

        // At most the one buffered record remains, then the sender is gone.
        let mut late = 0;
        while let Ok(Some(_)) =
            tokio::time::timeout(tokio::time::Duration::from_millis(200), rx.recv()).await
        {
            late += 1;
        }
        assert!(late <= 1);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let mut capture = SyntheticCapture::with_config(SyntheticConfig {
            interval_ms: 1,
            ..Default::default()
        });
        let (tx, mut rx) = mpsc::channel(1);
        capture.start(tx).await.unwrap();
        assert!(rx.recv().await.is_some());
        capture.stop().await.unwrap();

        let records = collect(&mut capture, 2).await;
        assert_eq!(records.len(), 2);
        capture.stop().await.unwrap();
    }
}
