//! Record filtering for capture consumers

use dnswatch_core::config::CaptureSettings;
use dnswatch_core::DnsSendRecord;

/// Filter configuration
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Process names to include (substring match, empty = all)
    pub include_comms: Vec<String>,

    /// Process names to exclude (substring match)
    pub exclude_comms: Vec<String>,

    /// Thread ids to include (empty = all)
    pub include_pids: Vec<u32>,

    /// Process ids to include (empty = all)
    pub include_tgids: Vec<u32>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter from the `[capture]` config section
    pub fn from_settings(settings: &CaptureSettings) -> Self {
        Self {
            include_comms: settings.process_filter.clone(),
            exclude_comms: settings.exclude_process.clone(),
            include_pids: settings.pid_filter.clone(),
            include_tgids: settings.tgid_filter.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.include_comms.is_empty()
            && self.exclude_comms.is_empty()
            && self.include_pids.is_empty()
            && self.include_tgids.is_empty()
    }

    /// Check if a record should be delivered
    pub fn matches(&self, record: &DnsSendRecord) -> bool {
        if !self.include_pids.is_empty() && !self.include_pids.contains(&record.pid) {
            return false;
        }
        if !self.include_tgids.is_empty() && !self.include_tgids.contains(&record.tgid) {
            return false;
        }

        if !self.include_comms.is_empty()
            && !self.include_comms.iter().any(|c| record.comm.contains(c.as_str()))
        {
            return false;
        }
        if self
            .exclude_comms
            .iter()
            .any(|c| record.comm.contains(c.as_str()))
        {
            return false;
        }

        true
    }

    /// Add a process name to include
    pub fn include_comm(mut self, comm: impl Into<String>) -> Self {
        self.include_comms.push(comm.into());
        self
    }

    /// Add a process name to exclude
    pub fn exclude_comm(mut self, comm: impl Into<String>) -> Self {
        self.exclude_comms.push(comm.into());
        self
    }

    /// Add a thread id to include
    pub fn include_pid(mut self, pid: u32) -> Self {
        self.include_pids.push(pid);
        self
    }

    /// Add a process id to include
    pub fn include_tgid(mut self, tgid: u32) -> Self {
        self.include_tgids.push(tgid);
        self
    }
}
