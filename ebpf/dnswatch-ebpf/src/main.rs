#![no_std]
#![no_main]

mod kernel;

use aya_ebpf::{
    helpers::{
        bpf_get_current_comm, bpf_get_current_pid_tgid, bpf_probe_read_user,
        bpf_probe_read_user_str_bytes,
    },
    macros::{fentry, kprobe, map, tracepoint},
    maps::{Array, HashMap, RingBuf, ring_buf::RingBufEntry},
    programs::{FEntryContext, ProbeContext, TracePointContext},
};
use dnswatch_ebpf_common::{
    ArgReader, CMDLINE_LEN, CONFIG_KEY_FLAGS, DnsSendEvent, EVENTS_BYTE_SIZE, EventSink,
    FLAG_SKIP_CMDLINE, FnId, IdentityStore, ProcessIdentity, ReservedEvent, SendPorts,
    TABLE_SIZE, TASK_COMM_LEN, TaskContext, emit_dns_send, record_exec,
};

use kernel::{MsgHdr, SockCommon};

// =============================================================================
// Maps
// =============================================================================

/// DNS send records for userspace. 16 MiB, roughly 70k records.
#[map]
static DNSWATCH_EVENTS: RingBuf = RingBuf::with_byte_size(EVENTS_BYTE_SIZE, 0);

/// Exec-time command lines, direct-mapped by `tgid % TABLE_SIZE`.
/// Never cleared; a slot is only replaced by a later exec hashing to it.
#[map]
static DNSWATCH_IDENTITIES: Array<ProcessIdentity> = Array::with_max_entries(TABLE_SIZE, 0);

/// Configuration flags
/// Bit 0: skip command line enrichment on the send path
#[map]
static DNSWATCH_CONFIG: HashMap<u32, u32> = HashMap::with_max_entries(1, 0);

#[inline(always)]
fn enrichment_enabled() -> bool {
    let flags = unsafe { DNSWATCH_CONFIG.get(&CONFIG_KEY_FLAGS).copied().unwrap_or(0) };
    flags & FLAG_SKIP_CMDLINE == 0
}

// =============================================================================
// Map and helper adapters
// =============================================================================

struct CurrentTask;

impl TaskContext for CurrentTask {
    #[inline(always)]
    fn pid_tgid(&self) -> u64 {
        bpf_get_current_pid_tgid()
    }

    #[inline(always)]
    fn comm(&self) -> Option<[u8; TASK_COMM_LEN]> {
        bpf_get_current_comm().ok()
    }
}

struct IdentityTable;

impl IdentityStore for IdentityTable {
    #[inline(always)]
    fn store(&self, key: u32, identity: &ProcessIdentity) {
        if let Some(slot) = DNSWATCH_IDENTITIES.get_ptr_mut(key) {
            unsafe { *slot = *identity };
        }
    }

    #[inline(always)]
    fn load_cmdline(&self, key: u32, tgid: u32, dst: &mut [u8; CMDLINE_LEN]) -> bool {
        match DNSWATCH_IDENTITIES.get(key) {
            Some(identity) if identity.original_tgid == tgid => {
                *dst = identity.cmdline;
                true
            }
            _ => false,
        }
    }
}

struct EventRing;

struct RingEntry(RingBufEntry<DnsSendEvent>);

impl ReservedEvent for RingEntry {
    #[inline(always)]
    fn event_mut(&mut self) -> &mut DnsSendEvent {
        // Initialized in `EventRing::reserve`.
        unsafe { self.0.assume_init_mut() }
    }

    #[inline(always)]
    fn submit(self) {
        self.0.submit(0);
    }
}

impl EventSink for EventRing {
    type Entry<'a> = RingEntry;

    #[inline(always)]
    fn reserve(&self) -> Option<RingEntry> {
        let mut entry = DNSWATCH_EVENTS.reserve::<DnsSendEvent>(0)?;
        entry.write(DnsSendEvent::zeroed());
        Some(RingEntry(entry))
    }
}

/// argv of the exec being traced, a user pointer to a NULL-terminated array.
struct UserArgv(*const u64);

impl ArgReader for UserArgv {
    #[inline(always)]
    fn arg_ptr(&self, index: usize) -> Option<u64> {
        unsafe { bpf_probe_read_user(self.0.wrapping_add(index)).ok() }
    }

    #[inline(always)]
    fn read_str(&self, ptr: u64, dst: &mut [u8]) -> bool {
        unsafe { bpf_probe_read_user_str_bytes(ptr as *const u8, dst).is_ok() }
    }
}

// =============================================================================
// Send path
// =============================================================================

#[inline(always)]
fn udp_ports(sk: *const SockCommon, msg: *const MsgHdr) -> Result<SendPorts, i64> {
    let (skc_dport, skc_num) = kernel::socket_ports(sk)?;
    Ok(SendPorts::udp(kernel::message_dport(msg), skc_dport, skc_num))
}

#[inline(always)]
fn tcp_ports(sk: *const SockCommon) -> Result<SendPorts, i64> {
    let (skc_dport, skc_num) = kernel::socket_ports(sk)?;
    Ok(SendPorts::tcp(skc_dport, skc_num))
}

#[inline(always)]
fn try_sendmsg(fn_id: FnId, ports: SendPorts) -> Result<(), i64> {
    emit_dns_send(
        &CurrentTask,
        &IdentityTable,
        &EventRing,
        fn_id,
        ports,
        enrichment_enabled,
    );
    Ok(())
}

// Dynamic kprobes. Work on any kernel that exports the symbols.

#[kprobe]
pub fn dnswatch_kprobe_udpv6_sendmsg(ctx: ProbeContext) -> u32 {
    match try_kprobe_udp(&ctx, FnId::Udpv6Sendmsg) {
        Ok(()) => 0,
        Err(_) => 0,
    }
}

#[kprobe]
pub fn dnswatch_kprobe_udp_sendmsg(ctx: ProbeContext) -> u32 {
    match try_kprobe_udp(&ctx, FnId::UdpSendmsg) {
        Ok(()) => 0,
        Err(_) => 0,
    }
}

#[kprobe]
pub fn dnswatch_kprobe_tcp_sendmsg(ctx: ProbeContext) -> u32 {
    match try_kprobe_tcp(&ctx) {
        Ok(()) => 0,
        Err(_) => 0,
    }
}

fn try_kprobe_udp(ctx: &ProbeContext, fn_id: FnId) -> Result<(), i64> {
    // int udp_sendmsg(struct sock *sk, struct msghdr *msg, size_t len)
    let sk: *const SockCommon = ctx.arg(0).ok_or(1i64)?;
    let msg: *const MsgHdr = ctx.arg(1).ok_or(1i64)?;
    try_sendmsg(fn_id, udp_ports(sk, msg)?)
}

fn try_kprobe_tcp(ctx: &ProbeContext) -> Result<(), i64> {
    let sk: *const SockCommon = ctx.arg(0).ok_or(1i64)?;
    try_sendmsg(FnId::TcpSendmsg, tcp_ports(sk)?)
}

// BTF trampolines. Lower overhead, need /sys/kernel/btf/vmlinux at load.

#[fentry(function = "udpv6_sendmsg")]
pub fn dnswatch_fentry_udpv6_sendmsg(ctx: FEntryContext) -> u32 {
    match try_fentry_udp(&ctx, FnId::Udpv6Sendmsg) {
        Ok(()) => 0,
        Err(_) => 0,
    }
}

#[fentry(function = "udp_sendmsg")]
pub fn dnswatch_fentry_udp_sendmsg(ctx: FEntryContext) -> u32 {
    match try_fentry_udp(&ctx, FnId::UdpSendmsg) {
        Ok(()) => 0,
        Err(_) => 0,
    }
}

#[fentry(function = "tcp_sendmsg")]
pub fn dnswatch_fentry_tcp_sendmsg(ctx: FEntryContext) -> u32 {
    match try_fentry_tcp(&ctx) {
        Ok(()) => 0,
        Err(_) => 0,
    }
}

fn try_fentry_udp(ctx: &FEntryContext, fn_id: FnId) -> Result<(), i64> {
    let sk: *const SockCommon = unsafe { ctx.arg(0) };
    let msg: *const MsgHdr = unsafe { ctx.arg(1) };
    try_sendmsg(fn_id, udp_ports(sk, msg)?)
}

fn try_fentry_tcp(ctx: &FEntryContext) -> Result<(), i64> {
    let sk: *const SockCommon = unsafe { ctx.arg(0) };
    try_sendmsg(FnId::TcpSendmsg, tcp_ports(sk)?)
}

// =============================================================================
// Exec tracking
// =============================================================================

/// Offset of `argv` in the sys_enter_execve record.
/// See: /sys/kernel/debug/tracing/events/syscalls/sys_enter_execve/format
const EXECVE_ARGV_OFFSET: usize = 24;

/// Offset of `argv` in the sys_enter_execveat record (after `fd`, `filename`).
const EXECVEAT_ARGV_OFFSET: usize = 32;

#[tracepoint]
pub fn dnswatch_sys_enter_execve(ctx: TracePointContext) -> u32 {
    match try_exec(&ctx, EXECVE_ARGV_OFFSET) {
        Ok(()) => 0,
        Err(_) => 0,
    }
}

#[tracepoint]
pub fn dnswatch_sys_enter_execveat(ctx: TracePointContext) -> u32 {
    match try_exec(&ctx, EXECVEAT_ARGV_OFFSET) {
        Ok(()) => 0,
        Err(_) => 0,
    }
}

fn try_exec(ctx: &TracePointContext, argv_offset: usize) -> Result<(), i64> {
    let argv: u64 = unsafe { ctx.read_at(argv_offset)? };
    let tgid = (bpf_get_current_pid_tgid() >> 32) as u32;
    record_exec(tgid, &UserArgv(argv as *const u64), &IdentityTable);
    Ok(())
}

// =============================================================================
// Required for eBPF programs
// =============================================================================

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}

#[unsafe(link_section = "license")]
#[unsafe(no_mangle)]
static LICENSE: [u8; 13] = *b"Dual MIT/GPL\0";
