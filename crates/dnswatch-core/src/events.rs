//! Decoded DNS send records
//!
//! [`DnsSendRecord`] is the owned, serializable form of the fixed-layout
//! [`DnsSendEvent`] read from the event ring buffer.

use chrono::{DateTime, Utc};
use dnswatch_ebpf_common::{cmdline_args, until_nul, DnsSendEvent, FnId, CMDLINE_LEN};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Record decoding errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("sample too short: {0} bytes")]
    Truncated(usize),

    #[error("unknown hook id: {0}")]
    UnknownHook(u8),
}

/// Kernel send path that observed the datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Hook {
    Udpv6Sendmsg,
    UdpSendmsg,
    TcpSendmsg,
}

impl Hook {
    pub fn as_str(&self) -> &'static str {
        self.fn_id().symbol()
    }

    pub fn fn_id(&self) -> FnId {
        match self {
            Hook::Udpv6Sendmsg => FnId::Udpv6Sendmsg,
            Hook::UdpSendmsg => FnId::UdpSendmsg,
            Hook::TcpSendmsg => FnId::TcpSendmsg,
        }
    }

    pub fn is_tcp(&self) -> bool {
        matches!(self, Hook::TcpSendmsg)
    }
}

impl From<FnId> for Hook {
    fn from(id: FnId) -> Self {
        match id {
            FnId::Udpv6Sendmsg => Hook::Udpv6Sendmsg,
            FnId::UdpSendmsg => Hook::UdpSendmsg,
            FnId::TcpSendmsg => Hook::TcpSendmsg,
        }
    }
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a record's command line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CmdlineSource {
    /// Exec-time snapshot from the kernel identity table
    Kernel,
    /// Read from /proc after the event was received
    Procfs,
    /// Not available
    Unknown,
}

/// One DNS send, decoded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsSendRecord {
    /// When userspace received the record
    pub timestamp: DateTime<Utc>,

    /// Thread group id (process id in userspace terms)
    pub tgid: u32,

    /// Thread id of the sender
    pub pid: u32,

    /// Task comm
    pub comm: String,

    /// Command line, space-joined
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmdline: Option<String>,

    pub cmdline_source: CmdlineSource,

    /// Local port of the sending socket
    pub sock_port: i32,

    pub hook: Hook,

    /// Host the sensor runs on
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

impl DnsSendRecord {
    /// Decode a raw ring buffer sample.
    pub fn decode(sample: &[u8]) -> Result<Self, RecordError> {
        let event = DnsSendEvent::from_bytes(sample).ok_or(RecordError::Truncated(sample.len()))?;
        Self::from_raw(&event)
    }

    pub fn from_raw(event: &DnsSendEvent) -> Result<Self, RecordError> {
        let hook = event
            .hook()
            .map(Hook::from)
            .ok_or(RecordError::UnknownHook(event.fn_id))?;

        let cmdline = render_cmdline(&event.cmdline);
        let cmdline_source = if cmdline.is_some() {
            CmdlineSource::Kernel
        } else {
            CmdlineSource::Unknown
        };

        Ok(Self {
            timestamp: Utc::now(),
            tgid: event.tgid,
            pid: event.pid,
            comm: String::from_utf8_lossy(until_nul(&event.comm)).into_owned(),
            cmdline,
            cmdline_source,
            sock_port: event.sock_port_nr,
            hook,
            host: None,
        })
    }

    /// Fill in a command line from another source if the kernel had none.
    pub fn fill_cmdline(&mut self, cmdline: Option<String>, source: CmdlineSource) {
        if self.cmdline.is_some() {
            return;
        }
        if let Some(cmdline) = cmdline.filter(|c| !c.is_empty()) {
            self.cmdline = Some(cmdline);
            self.cmdline_source = source;
        }
    }

    pub fn with_host(mut self, host: Option<String>) -> Self {
        self.host = host;
        self
    }
}

/// Render an exec-time snapshot as `arg0 arg1 ...`, `None` if empty.
pub fn render_cmdline(cmdline: &[u8; CMDLINE_LEN]) -> Option<String> {
    let args: Vec<String> = cmdline_args(cmdline)
        .map(|arg| String::from_utf8_lossy(arg).into_owned())
        .collect();
    if args.is_empty() {
        None
    } else {
        Some(args.join(" "))
    }
}

/// Local hostname, if it can be determined.
pub fn local_hostname() -> Option<String> {
    hostname::get()
        .ok()
        .map(|h| h.to_string_lossy().into_owned())
}
