#![cfg_attr(not(test), no_std)]

//! Types and hot-path logic shared by the dnswatch kernel programs and
//! userspace.
//!
//! Everything here is `no_std` and allocation free. The kernel crate drives
//! [`record_exec`] and [`emit_dns_send`] through thin wrappers around BPF
//! maps and helpers, and the host capture engine drives the same functions
//! through in-process implementations of the same traits.

mod emit;
mod ports;
mod tracker;

pub use emit::{EmitOutcome, EventSink, ReservedEvent, TaskContext, emit_dns_send};
pub use ports::SendPorts;
pub use tracker::{ArgReader, IdentityStore, record_exec};

/// Number of slots in the identity table. Prime, to spread tgids evenly.
pub const TABLE_SIZE: u32 = 100_003;

/// Destination port that marks a send as DNS traffic.
pub const DNS_PORT: u16 = 53;

/// Number of argv entries captured at exec.
pub const ARG_COUNT: usize = 4;

/// Bytes per argv slot, including the forced NUL terminator.
pub const ARG_LEN: usize = 30;

/// Command line snapshot size (`ARG_COUNT` slots of `ARG_LEN` bytes).
pub const CMDLINE_LEN: usize = ARG_COUNT * ARG_LEN;

/// Process short name field width in [`DnsSendEvent`]. Must be >= TASK_COMM_LEN.
pub const COMM_LEN: usize = 80;

/// Kernel `TASK_COMM_LEN`, the size of `bpf_get_current_comm` output.
pub const TASK_COMM_LEN: usize = 16;

/// Byte size of the event ring buffer (16 MiB).
pub const EVENTS_BYTE_SIZE: u32 = 1 << 24;

/// Per-record overhead of the BPF ring buffer (record header).
pub const RINGBUF_HEADER_LEN: usize = 8;

/// Map and program names shared by the loader and the kernel object.
pub const EVENTS_MAP: &str = "DNSWATCH_EVENTS";
pub const IDENTITIES_MAP: &str = "DNSWATCH_IDENTITIES";
pub const CONFIG_MAP: &str = "DNSWATCH_CONFIG";

/// Key of the flags word in the config map.
pub const CONFIG_KEY_FLAGS: u32 = 0;

/// Skip the identity table lookup on the send path.
pub const FLAG_SKIP_CMDLINE: u32 = 1 << 0;

/// Identity table slot for a thread group.
#[inline(always)]
pub const fn identity_key(tgid: u32) -> u32 {
    tgid % TABLE_SIZE
}

// =============================================================================
// Hook discriminator
// =============================================================================

/// Which socket send entry point produced an event.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FnId {
    Udpv6Sendmsg = 0,
    UdpSendmsg = 1,
    TcpSendmsg = 2,
}

impl FnId {
    pub const ALL: [FnId; 3] = [FnId::Udpv6Sendmsg, FnId::UdpSendmsg, FnId::TcpSendmsg];

    /// Kernel function the interceptor attaches to.
    pub const fn symbol(self) -> &'static str {
        match self {
            FnId::Udpv6Sendmsg => "udpv6_sendmsg",
            FnId::UdpSendmsg => "udp_sendmsg",
            FnId::TcpSendmsg => "tcp_sendmsg",
        }
    }

    pub const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(FnId::Udpv6Sendmsg),
            1 => Some(FnId::UdpSendmsg),
            2 => Some(FnId::TcpSendmsg),
            _ => None,
        }
    }
}

// =============================================================================
// Identity table value
// =============================================================================

/// Identity table value, written on exec and read on every DNS send.
///
/// `original_tgid` is the un-hashed key. A lookup whose tgid differs from it
/// hit a slot owned by another process and must be treated as a miss.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ProcessIdentity {
    pub original_tgid: u32,
    /// `ARG_COUNT` slots of `ARG_LEN` bytes, each NUL-terminated at its last byte.
    pub cmdline: [u8; CMDLINE_LEN],
}

impl ProcessIdentity {
    pub const fn zeroed() -> Self {
        Self {
            original_tgid: 0,
            cmdline: [0u8; CMDLINE_LEN],
        }
    }
}

// =============================================================================
// Wire record
// =============================================================================

/// One observed DNS send, as carried by the event ring buffer.
///
/// Layout: `tgid: u32, pid: u32, comm: [u8; 80], sock_port_nr: i32,
/// fn_id: u8, cmdline: [u8; 120]`, padded to 216 bytes.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct DnsSendEvent {
    pub tgid: u32,
    pub pid: u32,
    /// NUL-padded task comm; only the first `TASK_COMM_LEN` bytes are ever set.
    pub comm: [u8; COMM_LEN],
    /// Local (source) port of the sending socket, host order.
    pub sock_port_nr: i32,
    /// Raw [`FnId`].
    pub fn_id: u8,
    /// Copy of [`ProcessIdentity::cmdline`], zeroed on a table miss.
    pub cmdline: [u8; CMDLINE_LEN],
    _pad: [u8; 3],
}

impl DnsSendEvent {
    pub const fn zeroed() -> Self {
        Self {
            tgid: 0,
            pid: 0,
            comm: [0u8; COMM_LEN],
            sock_port_nr: 0,
            fn_id: 0,
            cmdline: [0u8; CMDLINE_LEN],
            _pad: [0u8; 3],
        }
    }

    /// Decode a record from a ring buffer sample.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < core::mem::size_of::<Self>() {
            return None;
        }
        // SAFETY: length checked above and every bit pattern is a valid value.
        Some(unsafe { core::ptr::read_unaligned(data.as_ptr().cast::<Self>()) })
    }

    pub fn hook(&self) -> Option<FnId> {
        FnId::from_raw(self.fn_id)
    }

    /// True when the kernel side copied a command line into the record.
    pub fn has_cmdline(&self) -> bool {
        self.cmdline.iter().any(|&b| b != 0)
    }
}

/// Bytes before the first NUL of a fixed-size, NUL-padded field.
pub fn until_nul(bytes: &[u8]) -> &[u8] {
    match bytes.iter().position(|&b| b == 0) {
        Some(end) => &bytes[..end],
        None => bytes,
    }
}

/// Non-empty argv slots of a command line snapshot, in order.
pub fn cmdline_args(cmdline: &[u8; CMDLINE_LEN]) -> impl Iterator<Item = &[u8]> {
    cmdline
        .chunks_exact(ARG_LEN)
        .map(until_nul)
        .filter(|arg| !arg.is_empty())
}
