//! eBPF capture backend

#![cfg(target_os = "linux")]

use crate::attach::{attach_exec_tracker, attach_interceptors};
use crate::loader::resolve_interceptor;
use crate::sample::SampleProcessor;

use async_trait::async_trait;
use dnswatch_capture::EventFilter;
use dnswatch_core::config::CaptureSettings;
use dnswatch_core::{
    AttachMode, CaptureBackend, CaptureCounters, CaptureError, CaptureResult, CaptureStats,
    DnsSendRecord,
};
use dnswatch_ebpf_common::{CONFIG_KEY_FLAGS, CONFIG_MAP, EVENTS_MAP, FLAG_SKIP_CMDLINE};
use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[cfg(embedded_probe)]
fn embedded_probe() -> Option<&'static [u8]> {
    Some(include_bytes!(concat!(env!("OUT_DIR"), "/dnswatch")))
}

#[cfg(not(embedded_probe))]
fn embedded_probe() -> Option<&'static [u8]> {
    None
}

/// eBPF capture configuration
#[derive(Debug, Clone)]
pub struct EbpfCaptureConfig {
    /// Interceptor variant (auto-detected by default)
    pub attach_mode: AttachMode,

    /// Copy exec-time command lines in the kernel
    pub cmdline_enrichment: bool,

    /// Fill missing command lines from /proc
    pub proc_fallback: bool,

    /// Path to the probe object (overrides the embedded one)
    pub ebpf_bytecode_path: Option<String>,

    /// Ring buffer poll interval
    pub poll_interval_ms: u64,

    /// Records to deliver
    pub filter: EventFilter,
}

impl Default for EbpfCaptureConfig {
    fn default() -> Self {
        Self {
            attach_mode: AttachMode::Auto,
            cmdline_enrichment: true,
            proc_fallback: true,
            ebpf_bytecode_path: None,
            poll_interval_ms: 10,
            filter: EventFilter::default(),
        }
    }
}

impl EbpfCaptureConfig {
    pub fn from_settings(settings: &CaptureSettings) -> Self {
        Self {
            attach_mode: settings.attach_mode,
            cmdline_enrichment: settings.cmdline_enrichment,
            proc_fallback: settings.proc_fallback,
            ebpf_bytecode_path: settings.ebpf_path.clone(),
            poll_interval_ms: settings.poll_interval_ms,
            filter: EventFilter::from_settings(settings),
        }
    }

    /// Value for the kernel config flags map
    pub fn kernel_flags(&self) -> u32 {
        if self.cmdline_enrichment {
            0
        } else {
            FLAG_SKIP_CMDLINE
        }
    }
}

/// eBPF capture backend
pub struct EbpfCapture {
    config: EbpfCaptureConfig,
    running: Arc<AtomicBool>,
    counters: Arc<CaptureCounters>,
    shutdown: Option<watch::Sender<bool>>,
    poller: Option<JoinHandle<()>>,
}

impl EbpfCapture {
    pub fn new() -> Self {
        Self::with_config(EbpfCaptureConfig::default())
    }

    pub fn with_config(config: EbpfCaptureConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(CaptureCounters::default()),
            shutdown: None,
            poller: None,
        }
    }

    /// Wait for the poll task; the probes are detached once it returns.
    async fn join_poller(&mut self) {
        if let Some(poller) = self.poller.take() {
            if let Err(e) = poller.await {
                warn!("eBPF poll task failed: {}", e);
            }
        }
    }

    /// Probe object bytes: configured path first, then the embedded copy
    fn bytecode(&self) -> CaptureResult<Cow<'static, [u8]>> {
        if let Some(path) = &self.config.ebpf_bytecode_path {
            let bytes = std::fs::read(path).map_err(|e| {
                CaptureError::LoadFailed(format!("Failed to read probe object '{}': {}", path, e))
            })?;
            return Ok(Cow::Owned(bytes));
        }

        embedded_probe().map(Cow::Borrowed).ok_or_else(|| {
            CaptureError::Configuration(
                "No embedded probe object. Set 'capture.ebpf_path' in config.".into(),
            )
        })
    }

    /// Write deployment flags to the kernel config map
    fn apply_flags(&self, ebpf: &mut aya::Ebpf) -> CaptureResult<()> {
        use aya::maps::HashMap as AyaHashMap;

        let flags = self.config.kernel_flags();
        let map = ebpf
            .map_mut(CONFIG_MAP)
            .ok_or_else(|| CaptureError::LoadFailed(format!("{} map not found", CONFIG_MAP)))?;
        let mut config_flags: AyaHashMap<_, u32, u32> = map.try_into().map_err(|e| {
            CaptureError::LoadFailed(format!("Failed to get {} map: {}", CONFIG_MAP, e))
        })?;
        config_flags
            .insert(CONFIG_KEY_FLAGS, flags, 0)
            .map_err(|e| CaptureError::LoadFailed(format!("Failed to set config flags: {}", e)))?;
        info!("Applied config flags: {:#x}", flags);
        Ok(())
    }

    /// Bump memlock rlimit for eBPF (required on older kernels)
    fn bump_memlock_rlimit() -> bool {
        let rlim = libc::rlimit {
            rlim_cur: libc::RLIM_INFINITY,
            rlim_max: libc::RLIM_INFINITY,
        };
        let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
        if ret != 0 {
            warn!("Failed to remove limit on locked memory (ret={})", ret);
            false
        } else {
            true
        }
    }
}

impl Default for EbpfCapture {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CaptureBackend for EbpfCapture {
    fn name(&self) -> &str {
        "ebpf"
    }

    async fn start(&mut self, tx: mpsc::Sender<DnsSendRecord>) -> CaptureResult<()> {
        use aya::maps::RingBuf;
        use aya::Ebpf;

        if self.running.load(Ordering::SeqCst) {
            return Err(CaptureError::AlreadyRunning);
        }
        self.join_poller().await;

        info!("Starting eBPF capture...");
        Self::bump_memlock_rlimit();

        let bytecode = self.bytecode()?;
        info!("Loading probe object ({} bytes)...", bytecode.len());
        let mut ebpf = Ebpf::load(&bytecode)
            .map_err(|e| CaptureError::LoadFailed(format!("Failed to load probe object: {}", e)))?;

        self.apply_flags(&mut ebpf)?;

        let interceptor = resolve_interceptor(self.config.attach_mode);
        info!(
            "Attaching {} interceptors (requested: {})",
            interceptor, self.config.attach_mode
        );
        attach_exec_tracker(&mut ebpf)?;
        attach_interceptors(&mut ebpf, interceptor)?;

        // Take the ring before spawning so a missing map fails the attach.
        let events = ebpf
            .take_map(EVENTS_MAP)
            .ok_or_else(|| CaptureError::LoadFailed(format!("{} map not found", EVENTS_MAP)))?;
        let mut ring_buf = RingBuf::try_from(events).map_err(|e| {
            CaptureError::LoadFailed(format!("Failed to open {} ring buffer: {}", EVENTS_MAP, e))
        })?;

        self.running.store(true, Ordering::SeqCst);
        info!("eBPF capture started, polling ring buffer...");

        let running = self.running.clone();
        let counters = self.counters.clone();
        let poll_interval = std::time::Duration::from_millis(self.config.poll_interval_ms);
        let mut processor = SampleProcessor::new(
            self.config.filter.clone(),
            self.config.proc_fallback,
            self.counters.clone(),
        );
        let (shutdown_tx, mut shutdown) = watch::channel(false);
        self.shutdown = Some(shutdown_tx);

        self.poller = Some(tokio::spawn(async move {
            // Links and maps live as long as the object.
            let ebpf = ebpf;

            'poll: while running.load(Ordering::SeqCst) {
                counters.ringbuf_polls.fetch_add(1, Ordering::Relaxed);

                let mut batch = Vec::new();
                while let Some(item) = ring_buf.next() {
                    if let Some(record) = processor.process(&item) {
                        batch.push(record);
                    }
                }

                for record in batch {
                    if !running.load(Ordering::SeqCst) {
                        break 'poll;
                    }
                    counters.record(&record);
                    tokio::select! {
                        biased;
                        _ = shutdown.changed() => break 'poll,
                        sent = tx.send(record) => {
                            if sent.is_err() {
                                debug!("Record consumer gone");
                                counters.events_dropped.fetch_add(1, Ordering::Relaxed);
                                break 'poll;
                            }
                        }
                    }
                }

                tokio::select! {
                    _ = shutdown.changed() => break 'poll,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }

            running.store(false, Ordering::SeqCst);
            drop(ring_buf);
            drop(ebpf);
            info!("eBPF ring buffer polling stopped, probes detached");
        }));

        Ok(())
    }

    async fn stop(&mut self) -> CaptureResult<()> {
        info!("Stopping eBPF capture...");
        self.running.store(false, Ordering::SeqCst);
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        self.join_poller().await;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn stats(&self) -> CaptureStats {
        self.counters.snapshot()
    }
}
