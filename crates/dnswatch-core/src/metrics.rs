//! Metrics for dnswatch
//!
//! Counts DNS sends per process and hook, plus capture health counters, and
//! renders them in the Prometheus text format.

use crate::capture::CaptureStats;
use crate::events::{DnsSendRecord, Hook};
use std::collections::BTreeMap;
use std::fmt::Write;
use std::time::Instant;

/// Global metrics collector
#[derive(Debug)]
pub struct MetricsCollector {
    /// When the collector was started
    start_time: Instant,
    /// DNS sends by (comm, hook)
    sends: parking_lot::RwLock<BTreeMap<(String, Hook), u64>>,
    /// Latest capture statistics
    capture: parking_lot::RwLock<CaptureStats>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            sends: parking_lot::RwLock::new(BTreeMap::new()),
            capture: parking_lot::RwLock::new(CaptureStats::default()),
        }
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Count one DNS send
    pub fn record(&self, record: &DnsSendRecord) {
        let mut sends = self.sends.write();
        *sends.entry((record.comm.clone(), record.hook)).or_insert(0) += 1;
    }

    /// Replace the capture health counters with a fresh snapshot
    pub fn update_capture(&self, stats: CaptureStats) {
        *self.capture.write() = stats;
    }

    /// Total DNS sends counted so far
    pub fn total_sends(&self) -> u64 {
        self.sends.read().values().sum()
    }

    /// Export metrics in Prometheus format
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP dnswatch_uptime_seconds Time since dnswatch started\n");
        output.push_str("# TYPE dnswatch_uptime_seconds gauge\n");
        let _ = writeln!(output, "dnswatch_uptime_seconds {}\n", self.uptime_seconds());

        output.push_str("# HELP dnswatch_dns_sends_total DNS sends observed per process\n");
        output.push_str("# TYPE dnswatch_dns_sends_total counter\n");
        let sends = self.sends.read();
        let _ = writeln!(
            output,
            "dnswatch_dns_sends_total{{process=\"all\",hook=\"all\"}} {}",
            sends.values().sum::<u64>()
        );
        for ((comm, hook), count) in sends.iter() {
            let _ = writeln!(
                output,
                "dnswatch_dns_sends_total{{process=\"{}\",hook=\"{}\"}} {}",
                escape_label(comm),
                hook,
                count
            );
        }
        drop(sends);
        output.push('\n');

        let capture = *self.capture.read();

        output.push_str("# HELP dnswatch_capture_dropped_total Records lost in userspace\n");
        output.push_str("# TYPE dnswatch_capture_dropped_total counter\n");
        let _ = writeln!(
            output,
            "dnswatch_capture_dropped_total {}\n",
            capture.events_dropped
        );

        output.push_str("# HELP dnswatch_capture_errors_total Samples that failed to decode\n");
        output.push_str("# TYPE dnswatch_capture_errors_total counter\n");
        let _ = writeln!(output, "dnswatch_capture_errors_total {}\n", capture.errors);

        output.push_str(
            "# HELP dnswatch_cmdline_enriched_total Records with a command line, by source\n",
        );
        output.push_str("# TYPE dnswatch_cmdline_enriched_total counter\n");
        let _ = writeln!(
            output,
            "dnswatch_cmdline_enriched_total{{source=\"kernel\"}} {}",
            capture.cmdline_kernel
        );
        let _ = writeln!(
            output,
            "dnswatch_cmdline_enriched_total{{source=\"procfs\"}} {}\n",
            capture.cmdline_procfs
        );

        output.push_str("# HELP dnswatch_ringbuf_polls_total Total ring buffer poll operations\n");
        output.push_str("# TYPE dnswatch_ringbuf_polls_total counter\n");
        let _ = writeln!(output, "dnswatch_ringbuf_polls_total {}", capture.ringbuf_polls);

        output
    }

    /// Export metrics as JSON
    pub fn to_json(&self) -> serde_json::Value {
        let sends: Vec<serde_json::Value> = self
            .sends
            .read()
            .iter()
            .map(|((comm, hook), count)| {
                serde_json::json!({
                    "process": comm,
                    "hook": hook,
                    "count": count,
                })
            })
            .collect();

        serde_json::json!({
            "uptime_seconds": self.uptime_seconds(),
            "sends": sends,
            "capture": *self.capture.read(),
        })
    }
}

/// Escape a Prometheus label value
fn escape_label(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            c => escaped.push(c),
        }
    }
    escaped
}
