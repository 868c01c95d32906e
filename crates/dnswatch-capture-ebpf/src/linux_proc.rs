//! Process attribution via the /proc filesystem
//!
//! Fills in the command line of records whose process was already running
//! when the exec tracepoint was attached.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::trace;

/// Process information read from /proc
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcInfo {
    pub pid: u32,
    pub comm: Option<String>,
    pub cmdline: Option<String>,
}

impl ProcInfo {
    /// Read process info from /proc/{pid}
    pub fn from_pid(pid: u32) -> Option<Self> {
        Self::from_root(Path::new("/proc"), pid)
    }

    /// Read process info from `{root}/{pid}`
    pub fn from_root(root: &Path, pid: u32) -> Option<Self> {
        let proc_path = root.join(pid.to_string());
        if !proc_path.exists() {
            return None;
        }

        let comm = fs::read_to_string(proc_path.join("comm"))
            .ok()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());

        let cmdline = fs::read(proc_path.join("cmdline"))
            .ok()
            .and_then(|bytes| join_cmdline(&bytes));

        Some(ProcInfo { pid, comm, cmdline })
    }
}

/// Join a NUL-separated /proc cmdline with spaces, `None` if empty.
fn join_cmdline(bytes: &[u8]) -> Option<String> {
    let cmdline = bytes
        .split(|&b| b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    (!cmdline.is_empty()).then_some(cmdline)
}

/// Cache for process info to avoid repeated /proc reads
///
/// Keyed by tgid. Misses are cached too, so a process that exited is not
/// retried for every record. Cleared wholesale once it holds `capacity`
/// entries.
pub struct ProcInfoCache {
    root: PathBuf,
    capacity: usize,
    cache: HashMap<u32, Option<ProcInfo>>,
}

impl ProcInfoCache {
    pub fn new(capacity: usize) -> Self {
        Self::with_root("/proc", capacity)
    }

    pub fn with_root(root: impl Into<PathBuf>, capacity: usize) -> Self {
        Self {
            root: root.into(),
            capacity: capacity.max(1),
            cache: HashMap::new(),
        }
    }

    /// Get process info for a tgid, using cache
    pub fn get(&mut self, tgid: u32) -> Option<&ProcInfo> {
        if !self.cache.contains_key(&tgid) {
            if self.cache.len() >= self.capacity {
                trace!("Process info cache full ({} entries), clearing", self.cache.len());
                self.cache.clear();
            }
            let info = ProcInfo::from_root(&self.root, tgid);
            self.cache.insert(tgid, info);
        }
        self.cache.get(&tgid).and_then(|o| o.as_ref())
    }

    /// Command line for a tgid, if /proc has one
    pub fn cmdline(&mut self, tgid: u32) -> Option<String> {
        self.get(tgid).and_then(|info| info.cmdline.clone())
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Remove a specific tgid from cache
    pub fn invalidate(&mut self, tgid: u32) {
        self.cache.remove(&tgid);
    }
}
