//! Per-process aggregation for `dnswatch top`
//!
//! Counts DNS sends per process since start and renders a table of the
//! busiest senders. Rows can be keyed by tgid or merged by process name.

use chrono::{DateTime, Utc};
use dnswatch_core::{DnsSendRecord, Hook};
use std::collections::HashMap;
use std::fmt::Write;

/// Aggregated sends of one process (or one process name)
#[derive(Debug, Clone, PartialEq)]
pub struct TopRow {
    /// tgid; for rows merged by name, the most recently seen tgid
    pub tgid: u32,
    pub comm: String,
    pub sends: u64,
    /// Sends per hook, indexed by `fn_id`
    pub by_hook: [u64; 3],
    /// Share of all sends, in percent
    pub share: f64,
    pub cmdline: Option<String>,
    pub last_seen: DateTime<Utc>,
}

impl TopRow {
    fn new(record: &DnsSendRecord) -> Self {
        Self {
            tgid: record.tgid,
            comm: record.comm.clone(),
            sends: 0,
            by_hook: [0; 3],
            share: 0.0,
            cmdline: None,
            last_seen: record.timestamp,
        }
    }

    fn add(&mut self, record: &DnsSendRecord) {
        self.sends += 1;
        self.by_hook[record.hook.fn_id() as usize] += 1;
        if record.timestamp >= self.last_seen {
            self.tgid = record.tgid;
            self.last_seen = record.timestamp;
        }
        if record.cmdline.is_some() {
            self.cmdline = record.cmdline.clone();
        }
    }

    fn merge(&mut self, other: &TopRow) {
        self.sends += other.sends;
        for (a, b) in self.by_hook.iter_mut().zip(other.by_hook) {
            *a += b;
        }
        if other.last_seen >= self.last_seen {
            self.tgid = other.tgid;
            self.last_seen = other.last_seen;
            if other.cmdline.is_some() {
                self.cmdline = other.cmdline.clone();
            }
        }
    }

    pub fn hook_count(&self, hook: Hook) -> u64 {
        self.by_hook[hook.fn_id() as usize]
    }
}

/// Running per-process counters
#[derive(Debug)]
pub struct TopAggregator {
    started: DateTime<Utc>,
    rows: HashMap<(u32, String), TopRow>,
    total: u64,
}

impl Default for TopAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl TopAggregator {
    pub fn new() -> Self {
        Self {
            started: Utc::now(),
            rows: HashMap::new(),
            total: 0,
        }
    }

    pub fn record(&mut self, record: &DnsSendRecord) {
        self.total += 1;
        self.rows
            .entry((record.tgid, record.comm.clone()))
            .or_insert_with(|| TopRow::new(record))
            .add(record);
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Rows sorted by sends (descending), then tgid.
    ///
    /// With `by_comm`, processes sharing a name collapse into one row.
    /// With `active_since`, only rows seen at or after that instant are kept.
    pub fn rows(&self, by_comm: bool, active_since: Option<DateTime<Utc>>) -> Vec<TopRow> {
        let mut rows: Vec<TopRow> = if by_comm {
            let mut merged: HashMap<&str, TopRow> = HashMap::new();
            for row in self.rows.values() {
                merged
                    .entry(row.comm.as_str())
                    .and_modify(|m| m.merge(row))
                    .or_insert_with(|| row.clone());
            }
            merged.into_values().collect()
        } else {
            self.rows.values().cloned().collect()
        };

        if let Some(since) = active_since {
            rows.retain(|r| r.last_seen >= since);
        }

        for row in &mut rows {
            row.share = if self.total == 0 {
                0.0
            } else {
                row.sends as f64 / self.total as f64 * 100.0
            };
        }

        rows.sort_by(|a, b| b.sends.cmp(&a.sends).then(a.tgid.cmp(&b.tgid)));
        rows
    }

    /// Text table with a summary header, at most `max_rows` rows
    pub fn render(&self, max_rows: usize, by_comm: bool, active_since: Option<DateTime<Utc>>) -> String {
        const DATE: &str = "%Y-%m-%d %H:%M:%S%.3f";
        let rows = self.rows(by_comm, active_since);
        let mut out = String::new();

        let _ = writeln!(
            out,
            "START TIME: {}, LAST REFRESH: {}",
            self.started.format(DATE),
            Utc::now().format(DATE)
        );
        let udp6: u64 = rows.iter().map(|r| r.hook_count(Hook::Udpv6Sendmsg)).sum();
        let udp: u64 = rows.iter().map(|r| r.hook_count(Hook::UdpSendmsg)).sum();
        let tcp: u64 = rows.iter().map(|r| r.hook_count(Hook::TcpSendmsg)).sum();
        let _ = writeln!(out, "{:<19}: {:>10}", "DNS SENDS", self.total);
        let _ = writeln!(
            out,
            "{:<19}: {:>10}, {:<19}: {:>10}, {:<19}: {:>10}",
            "UDPv6 SENDS", udp6, "UDPv4 SENDS", udp, "TCP SENDS", tcp
        );
        out.push('\n');

        let _ = writeln!(
            out,
            "{:<10}  {:<15}  {:<9}  {:<9}  {:<9}  {:<9}  {:<9}  CMDLINE",
            if by_comm { "LAST PID" } else { "PID" },
            "COMM",
            "DNS",
            "%DNS",
            "UDPv6",
            "UDPv4",
            "TCP"
        );
        for row in rows.iter().take(max_rows) {
            let comm: String = row.comm.chars().take(14).collect();
            let line = format!(
                "{:<10}  {:<15}  {:<9}  {:<9.2}  {:<9}  {:<9}  {:<9}  {}",
                row.tgid,
                comm,
                row.sends,
                row.share,
                row.hook_count(Hook::Udpv6Sendmsg),
                row.hook_count(Hook::UdpSendmsg),
                row.hook_count(Hook::TcpSendmsg),
                row.cmdline.as_deref().unwrap_or("")
            );
            out.push_str(line.trim_end());
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use dnswatch_ebpf_common::{DnsSendEvent, FnId};

    fn record(tgid: u32, comm: &str, fn_id: FnId) -> DnsSendRecord {
        let mut event = DnsSendEvent::zeroed();
        event.tgid = tgid;
        event.pid = tgid;
        event.comm[..comm.len()].copy_from_slice(comm.as_bytes());
        event.fn_id = fn_id as u8;
        DnsSendRecord::from_raw(&event).unwrap()
    }

    fn sample() -> TopAggregator {
        let mut top = TopAggregator::new();
        for _ in 0..3 {
            top.record(&record(10, "dig", FnId::UdpSendmsg));
        }
        top.record(&record(11, "dig", FnId::Udpv6Sendmsg));
        top.record(&record(20, "unbound", FnId::TcpSendmsg));
        top.record(&record(20, "unbound", FnId::TcpSendmsg));
        top
    }

    #[test]
    fn test_rows_per_process() {
        let top = sample();
        assert_eq!(top.total(), 6);

        let rows = top.rows(false, None);
        let summary: Vec<(u32, u64)> = rows.iter().map(|r| (r.tgid, r.sends)).collect();
        assert_eq!(summary, vec![(10, 3), (20, 2), (11, 1)]);
        assert_eq!(rows[0].hook_count(Hook::UdpSendmsg), 3);
        assert_eq!(rows[1].hook_count(Hook::TcpSendmsg), 2);
        assert!((rows[0].share - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_rows_merged_by_comm() {
        let top = sample();
        let rows = top.rows(true, None);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].comm, "dig");
        assert_eq!(rows[0].sends, 4);
        assert_eq!(rows[0].by_hook, [1, 3, 0]);
        let total_share: f64 = rows.iter().map(|r| r.share).sum();
        assert!((total_share - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_active_filter() {
        let top = sample();
        let future = Utc::now() + Duration::seconds(60);
        assert!(top.rows(false, Some(future)).is_empty());
        let past = Utc::now() - Duration::seconds(60);
        assert_eq!(top.rows(false, Some(past)).len(), 3);
    }

    #[test]
    fn test_cmdline_is_kept_from_latest_record() {
        let mut top = TopAggregator::new();
        let mut with_cmdline = record(5, "curl", FnId::UdpSendmsg);
        with_cmdline.cmdline = Some("curl example.com".into());
        top.record(&with_cmdline);
        top.record(&record(5, "curl", FnId::UdpSendmsg));
        assert_eq!(top.rows(false, None)[0].cmdline.as_deref(), Some("curl example.com"));
    }

    #[test]
    fn test_render() {
        let top = sample();
        let text = top.render(2, false, None);
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].starts_with("START TIME: "));
        assert_eq!(lines[1], "DNS SENDS          :          6");
        assert!(lines[2].contains("TCP SENDS          :          2"));
        assert!(lines[4].starts_with("PID         COMM"));
        assert_eq!(lines.len(), 7);
        assert_eq!(
            lines[5],
            "10          dig              3          50.00      0          3          0"
        );
    }
}
