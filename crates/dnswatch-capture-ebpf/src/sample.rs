//! Ring buffer sample handling
//!
//! Turns raw samples into filtered, attributed records. Kept separate from
//! the polling loop so it runs without a kernel.

use crate::linux_proc::ProcInfoCache;
use dnswatch_capture::EventFilter;
use dnswatch_core::{CaptureCounters, CmdlineSource, DnsSendRecord};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::debug;

const PROC_CACHE_ENTRIES: usize = 4096;

pub struct SampleProcessor {
    filter: EventFilter,
    proc_cache: Option<ProcInfoCache>,
    host: Option<String>,
    counters: Arc<CaptureCounters>,
}

impl SampleProcessor {
    pub fn new(filter: EventFilter, proc_fallback: bool, counters: Arc<CaptureCounters>) -> Self {
        Self {
            filter,
            proc_cache: proc_fallback.then(|| ProcInfoCache::new(PROC_CACHE_ENTRIES)),
            host: dnswatch_core::events::local_hostname(),
            counters,
        }
    }

    /// Use a different /proc cache (tests point it at a fake tree).
    pub fn with_proc_cache(mut self, cache: Option<ProcInfoCache>) -> Self {
        self.proc_cache = cache;
        self
    }

    /// Decode one sample. `None` if it is malformed or filtered out.
    pub fn process(&mut self, sample: &[u8]) -> Option<DnsSendRecord> {
        let mut record = match DnsSendRecord::decode(sample) {
            Ok(record) => record,
            Err(e) => {
                debug!("Skipping malformed sample: {}", e);
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if !self.filter.matches(&record) {
            return None;
        }

        if record.cmdline.is_none() {
            if let Some(cache) = self.proc_cache.as_mut() {
                record.fill_cmdline(cache.cmdline(record.tgid), CmdlineSource::Procfs);
            }
        }

        Some(record.with_host(self.host.clone()))
    }
}
