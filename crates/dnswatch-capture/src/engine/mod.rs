//! In-process capture engine
//!
//! Runs the same tracker and emitter code as the kernel programs against a
//! host identity table and ring. Callers play the kernel's part: they invoke
//! [`CaptureEngine::on_exec`] and the `on_*_sendmsg` hooks from any number of
//! threads and drain records from one consumer.

pub mod identity;
pub mod ring;

pub use identity::IdentityTable;
pub use ring::{EventRing, RingReservation, RECORD_FOOTPRINT};

use dnswatch_ebpf_common::{
    emit_dns_send, record_exec, ArgReader, DnsSendEvent, EmitOutcome, FnId, SendPorts,
    TaskContext, EVENTS_BYTE_SIZE, TASK_COMM_LEN,
};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Ring size in bytes, as for the kernel ring buffer map
    pub ring_bytes: usize,
    /// Copy the exec-time command line into records
    pub cmdline_enrichment: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ring_bytes: EVENTS_BYTE_SIZE as usize,
            cmdline_enrichment: true,
        }
    }
}

/// The thread issuing a syscall
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Task {
    pub tgid: u32,
    pub pid: u32,
    pub comm: [u8; TASK_COMM_LEN],
}

impl Task {
    /// Task with `comm` truncated to 15 bytes, as the kernel stores it.
    pub fn new(tgid: u32, pid: u32, comm: &str) -> Self {
        let mut buf = [0u8; TASK_COMM_LEN];
        let len = comm.len().min(TASK_COMM_LEN - 1);
        buf[..len].copy_from_slice(&comm.as_bytes()[..len]);
        Self { tgid, pid, comm: buf }
    }

    /// Single-threaded process: pid == tgid.
    pub fn process(tgid: u32, comm: &str) -> Self {
        Self::new(tgid, tgid, comm)
    }
}

impl TaskContext for Task {
    fn pid_tgid(&self) -> u64 {
        (u64::from(self.tgid) << 32) | u64::from(self.pid)
    }

    fn comm(&self) -> Option<[u8; TASK_COMM_LEN]> {
        Some(self.comm)
    }
}

/// Send-path state of a socket (`struct sock_common`), host byte order
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Socket {
    /// `skc_num`
    pub local_port: u16,
    /// `skc_dport`; 0 when unconnected
    pub peer_port: u16,
}

impl Socket {
    pub fn unconnected(local_port: u16) -> Self {
        Self {
            local_port,
            peer_port: 0,
        }
    }

    pub fn connected(local_port: u16, peer_port: u16) -> Self {
        Self {
            local_port,
            peer_port,
        }
    }
}

/// Per-call message header of a send
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MsgHeader {
    /// Port of `msg_name`; `None` when no destination address was passed
    pub dest_port: Option<u16>,
}

impl MsgHeader {
    pub fn to_port(port: u16) -> Self {
        Self {
            dest_port: Some(port),
        }
    }
}

/// One argv entry as it sits in user memory
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserArg {
    Readable(Vec<u8>),
    /// The page behind this pointer faults
    Faulted,
}

/// argv of an exec
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Argv {
    args: Vec<UserArg>,
    /// The pointer array itself is unreadable
    faulted: bool,
}

impl Argv {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        Self {
            args: args
                .into_iter()
                .map(|a| UserArg::Readable(a.as_ref().to_vec()))
                .collect(),
            faulted: false,
        }
    }

    pub fn from_user(args: Vec<UserArg>) -> Self {
        Self {
            args,
            faulted: false,
        }
    }

    pub fn unreadable() -> Self {
        Self {
            args: Vec::new(),
            faulted: true,
        }
    }
}

impl ArgReader for Argv {
    fn arg_ptr(&self, index: usize) -> Option<u64> {
        if self.faulted {
            return None;
        }
        // Entry i lives at pointer i + 1; the slot past the end is NULL.
        Some(if index < self.args.len() {
            index as u64 + 1
        } else {
            0
        })
    }

    fn read_str(&self, ptr: u64, dst: &mut [u8]) -> bool {
        let Some(UserArg::Readable(bytes)) = ptr
            .checked_sub(1)
            .and_then(|i| self.args.get(i as usize))
        else {
            return false;
        };
        let src = dnswatch_ebpf_common::until_nul(bytes);
        let len = src.len().min(dst.len().saturating_sub(1));
        dst[..len].copy_from_slice(&src[..len]);
        dst[len..].fill(0);
        true
    }
}

/// Hook outcome counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub execs: u64,
    pub not_dns: u64,
    pub emitted: u64,
    pub enriched: u64,
    pub dropped: u64,
    pub identity_contended: u64,
}

#[derive(Debug, Default)]
struct Counters {
    execs: AtomicU64,
    not_dns: AtomicU64,
    emitted: AtomicU64,
    enriched: AtomicU64,
    dropped: AtomicU64,
}

/// Attached capture engine. Dropping it releases the table and ring.
pub struct CaptureEngine {
    identities: IdentityTable,
    ring: EventRing,
    enrich: AtomicBool,
    attached: AtomicBool,
    counters: Counters,
}

impl CaptureEngine {
    /// Allocate the identity table and ring and start accepting hook calls.
    pub fn attach(config: EngineConfig) -> Self {
        tracing::debug!(
            ring_bytes = config.ring_bytes,
            enrichment = config.cmdline_enrichment,
            "Attaching capture engine"
        );
        Self {
            identities: IdentityTable::new(),
            ring: EventRing::with_byte_size(config.ring_bytes),
            enrich: AtomicBool::new(config.cmdline_enrichment),
            attached: AtomicBool::new(true),
            counters: Counters::default(),
        }
    }

    /// Stop accepting hook calls and stop delivering records.
    pub fn detach(&self) {
        self.attached.store(false, Ordering::Release);
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    pub fn set_cmdline_enrichment(&self, enabled: bool) {
        self.enrich.store(enabled, Ordering::Relaxed);
    }

    pub fn ring_capacity(&self) -> usize {
        self.ring.capacity()
    }

    pub fn identities(&self) -> &IdentityTable {
        &self.identities
    }

    /// Exec tracepoint
    pub fn on_exec(&self, task: &Task, argv: &Argv) {
        if !self.is_attached() {
            return;
        }
        record_exec(task.tgid, argv, &self.identities);
        self.counters.execs.fetch_add(1, Ordering::Relaxed);
    }

    /// `udpv6_sendmsg` interceptor
    pub fn on_udpv6_sendmsg(
        &self,
        task: &Task,
        sock: &Socket,
        msg: &MsgHeader,
    ) -> Option<EmitOutcome> {
        self.intercept(task, FnId::Udpv6Sendmsg, udp_ports(sock, msg))
    }

    /// `udp_sendmsg` interceptor
    pub fn on_udp_sendmsg(
        &self,
        task: &Task,
        sock: &Socket,
        msg: &MsgHeader,
    ) -> Option<EmitOutcome> {
        self.intercept(task, FnId::UdpSendmsg, udp_ports(sock, msg))
    }

    /// `tcp_sendmsg` interceptor
    pub fn on_tcp_sendmsg(&self, task: &Task, sock: &Socket) -> Option<EmitOutcome> {
        self.intercept(
            task,
            FnId::TcpSendmsg,
            SendPorts::tcp(sock.peer_port.to_be(), sock.local_port),
        )
    }

    /// Dispatch to the interceptor for `fn_id`.
    pub fn on_sendmsg(
        &self,
        fn_id: FnId,
        task: &Task,
        sock: &Socket,
        msg: &MsgHeader,
    ) -> Option<EmitOutcome> {
        match fn_id {
            FnId::Udpv6Sendmsg => self.on_udpv6_sendmsg(task, sock, msg),
            FnId::UdpSendmsg => self.on_udp_sendmsg(task, sock, msg),
            FnId::TcpSendmsg => self.on_tcp_sendmsg(task, sock),
        }
    }

    /// Next record in reservation order, if one is published.
    pub fn next_event(&self) -> Option<DnsSendEvent> {
        if !self.is_attached() {
            return None;
        }
        self.ring.pop()
    }

    /// Up to `max` records.
    pub fn drain(&self, max: usize) -> Vec<DnsSendEvent> {
        if !self.is_attached() {
            return Vec::new();
        }
        self.ring.drain(max)
    }

    pub fn stats(&self) -> EngineStats {
        let c = &self.counters;
        EngineStats {
            execs: c.execs.load(Ordering::Relaxed),
            not_dns: c.not_dns.load(Ordering::Relaxed),
            emitted: c.emitted.load(Ordering::Relaxed),
            enriched: c.enriched.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            identity_contended: self.identities.contended(),
        }
    }

    fn intercept(&self, task: &Task, fn_id: FnId, ports: SendPorts) -> Option<EmitOutcome> {
        if !self.is_attached() {
            return None;
        }
        let outcome = emit_dns_send(
            task,
            &self.identities,
            &self.ring,
            fn_id,
            ports,
            || self.enrich.load(Ordering::Relaxed),
        );
        let counter = match outcome {
            EmitOutcome::NotDns => &self.counters.not_dns,
            EmitOutcome::Dropped => &self.counters.dropped,
            EmitOutcome::Emitted { enriched } => {
                if enriched {
                    self.counters.enriched.fetch_add(1, Ordering::Relaxed);
                }
                &self.counters.emitted
            }
        };
        counter.fetch_add(1, Ordering::Relaxed);
        Some(outcome)
    }
}

fn udp_ports(sock: &Socket, msg: &MsgHeader) -> SendPorts {
    SendPorts::udp(
        msg.dest_port.map(u16::to_be),
        sock.peer_port.to_be(),
        sock.local_port,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use dnswatch_ebpf_common::{cmdline_args, until_nul, ARG_LEN, DNS_PORT, TABLE_SIZE};
    use std::collections::HashSet;

    fn engine() -> CaptureEngine {
        CaptureEngine::attach(EngineConfig {
            ring_bytes: RECORD_FOOTPRINT * 1024,
            ..Default::default()
        })
    }

    fn args(event: &DnsSendEvent) -> Vec<String> {
        cmdline_args(&event.cmdline)
            .map(|a| String::from_utf8_lossy(a).into_owned())
            .collect()
    }

    #[test]
    fn test_dig_scenario() {
        let engine = engine();
        let dig = Task::process(4242, "dig");
        engine.on_exec(&dig, &Argv::new(["dig", "example.com", "@8.8.8.8"]));

        let sock = Socket::unconnected(41000);
        let outcome = engine.on_udp_sendmsg(&dig, &sock, &MsgHeader::to_port(DNS_PORT));
        assert_eq!(outcome, Some(EmitOutcome::Emitted { enriched: true }));

        let events = engine.drain(16);
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.tgid, 4242);
        assert_eq!(event.pid, 4242);
        assert_eq!(until_nul(&event.comm), b"dig");
        assert_eq!(event.sock_port_nr, 41000);
        assert_eq!(event.fn_id, FnId::UdpSendmsg as u8);
        assert_eq!(args(event), vec!["dig", "example.com", "@8.8.8.8"]);
        assert_eq!(&event.cmdline[3 * ARG_LEN..], &[0u8; ARG_LEN][..]);
    }

    #[test]
    fn test_exec_truncates_long_arguments() {
        let engine = engine();
        let task = Task::process(77, "python3");
        let long = "x".repeat(64);
        engine.on_exec(&task, &Argv::new(["python3", long.as_str(), "a", "b", "c"]));
        engine.on_udpv6_sendmsg(&task, &Socket::connected(5353, 53), &MsgHeader::default());

        let event = engine.next_event().unwrap();
        assert_eq!(event.cmdline[2 * ARG_LEN - 1], 0);
        assert_eq!(
            args(&event),
            vec!["python3".to_string(), "x".repeat(ARG_LEN - 1), "a".into(), "b".into()]
        );
    }

    #[test]
    fn test_faulting_argument_ends_capture() {
        let engine = engine();
        let task = Task::process(78, "sh");
        let argv = Argv::from_user(vec![
            UserArg::Readable(b"sh".to_vec()),
            UserArg::Faulted,
            UserArg::Readable(b"never".to_vec()),
        ]);
        engine.on_exec(&task, &argv);

        let identity = engine.identities().lookup(78).unwrap();
        assert_eq!(until_nul(&identity.cmdline), b"sh");
        assert!(identity.cmdline[ARG_LEN..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_unreadable_argv_stores_empty_identity() {
        let engine = engine();
        engine.on_exec(&Task::process(79, "x"), &Argv::unreadable());
        let identity = engine.identities().lookup(79).unwrap();
        assert!(identity.cmdline.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_non_dns_sends_are_ignored_by_every_hook() {
        let engine = engine();
        let task = Task::process(10, "curl");
        engine.on_exec(&task, &Argv::new(["curl", "https://example.com"]));

        let sock = Socket::connected(40000, 443);
        for fn_id in FnId::ALL {
            let outcome = engine.on_sendmsg(fn_id, &task, &sock, &MsgHeader::default());
            assert_eq!(outcome, Some(EmitOutcome::NotDns));
            let outcome = engine.on_sendmsg(fn_id, &task, &sock, &MsgHeader::to_port(8053));
            assert_eq!(outcome, Some(EmitOutcome::NotDns));
        }

        assert!(engine.next_event().is_none());
        assert_eq!(engine.stats().not_dns, 6);
        assert_eq!(engine.stats().emitted, 0);
    }

    #[test]
    fn test_udp_message_destination_wins_over_socket_peer() {
        let engine = engine();
        let task = Task::process(11, "resolver");

        // Connected elsewhere but explicitly addressed to 53.
        let sock = Socket::connected(33333, 8080);
        assert!(matches!(
            engine.on_udp_sendmsg(&task, &sock, &MsgHeader::to_port(53)),
            Some(EmitOutcome::Emitted { .. })
        ));
        // Connected to 53 but explicitly addressed elsewhere.
        let sock = Socket::connected(33334, 53);
        assert_eq!(
            engine.on_udp_sendmsg(&task, &sock, &MsgHeader::to_port(123)),
            Some(EmitOutcome::NotDns)
        );
        // Connected to 53, no per-call address.
        assert!(matches!(
            engine.on_udp_sendmsg(&task, &sock, &MsgHeader::default()),
            Some(EmitOutcome::Emitted { .. })
        ));

        let ports: Vec<i32> = engine.drain(8).iter().map(|e| e.sock_port_nr).collect();
        assert_eq!(ports, vec![33333, 33334]);
    }

    #[test]
    fn test_fn_id_and_source_port_per_hook() {
        let engine = engine();
        let task = Task::new(20, 21, "worker");
        let sock = Socket::connected(50001, 53);

        engine.on_udpv6_sendmsg(&task, &sock, &MsgHeader::default());
        engine.on_udp_sendmsg(&task, &sock, &MsgHeader::default());
        engine.on_tcp_sendmsg(&task, &sock);

        let events = engine.drain(8);
        let ids: Vec<u8> = events.iter().map(|e| e.fn_id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        for event in &events {
            assert_eq!(event.sock_port_nr, 50001);
            assert_eq!((event.tgid, event.pid), (20, 21));
        }
    }

    #[test]
    fn test_tcp_scenario_reports_local_port() {
        let engine = engine();
        let task = Task::process(30, "unbound");
        engine.on_exec(&task, &Argv::new(["unbound", "-d"]));

        let sock = Socket::connected(45678, 53);
        engine.on_tcp_sendmsg(&task, &sock);
        let event = engine.next_event().unwrap();
        assert_eq!(event.fn_id, FnId::TcpSendmsg as u8);
        assert_eq!(event.sock_port_nr, 45678);
        assert_eq!(args(&event), vec!["unbound", "-d"]);

        // TCP ignores the message header entirely.
        let outcome = engine.on_sendmsg(
            FnId::TcpSendmsg,
            &task,
            &Socket::connected(45679, 443),
            &MsgHeader::to_port(53),
        );
        assert_eq!(outcome, Some(EmitOutcome::NotDns));
    }

    #[test]
    fn test_hash_collision_scenario() {
        let engine = engine();
        let first = Task::process(1234, "old");
        let second = Task::process(1234 + TABLE_SIZE, "new");
        engine.on_exec(&first, &Argv::new(["old", "--flag"]));
        engine.on_exec(&second, &Argv::new(["new"]));

        let sock = Socket::connected(1000, 53);
        assert_eq!(
            engine.on_udp_sendmsg(&first, &sock, &MsgHeader::default()),
            Some(EmitOutcome::Emitted { enriched: false })
        );
        assert_eq!(
            engine.on_udp_sendmsg(&second, &sock, &MsgHeader::default()),
            Some(EmitOutcome::Emitted { enriched: true })
        );

        let events = engine.drain(8);
        assert!(!events[0].has_cmdline());
        assert_eq!(args(&events[1]), vec!["new"]);
    }

    #[test]
    fn test_send_without_exec_has_empty_cmdline() {
        let engine = engine();
        let task = Task::process(555, "systemd-resolve");
        engine.on_udp_sendmsg(&task, &Socket::connected(1, 53), &MsgHeader::default());
        let event = engine.next_event().unwrap();
        assert!(!event.has_cmdline());
        assert_eq!(until_nul(&event.comm), b"systemd-resolve");
    }

    #[test]
    fn test_enrichment_can_be_disabled() {
        let engine = engine();
        let task = Task::process(9, "dig");
        engine.on_exec(&task, &Argv::new(["dig"]));
        engine.set_cmdline_enrichment(false);

        assert_eq!(
            engine.on_udp_sendmsg(&task, &Socket::connected(2, 53), &MsgHeader::default()),
            Some(EmitOutcome::Emitted { enriched: false })
        );
        assert!(!engine.next_event().unwrap().has_cmdline());
    }

    #[test]
    fn test_saturation_drops_without_stalling() {
        let engine = CaptureEngine::attach(EngineConfig {
            ring_bytes: RECORD_FOOTPRINT * 4,
            ..Default::default()
        });
        let task = Task::process(3, "flood");
        let sock = Socket::connected(3000, 53);

        for _ in 0..10 {
            engine.on_udp_sendmsg(&task, &sock, &MsgHeader::default());
        }
        let stats = engine.stats();
        assert_eq!(stats.emitted, 4);
        assert_eq!(stats.dropped, 6);
        assert_eq!(engine.drain(100).len(), 4);

        // Space frees up once the consumer catches up.
        assert!(matches!(
            engine.on_udp_sendmsg(&task, &sock, &MsgHeader::default()),
            Some(EmitOutcome::Emitted { .. })
        ));
        assert_eq!(engine.drain(100).len(), 1);
    }

    #[test]
    fn test_concurrent_producers_with_execs() {
        const THREADS: u32 = 8;
        const SENDS: u32 = 2_000;

        let engine = CaptureEngine::attach(EngineConfig {
            ring_bytes: RECORD_FOOTPRINT * 512,
            ..Default::default()
        });
        let mut consumed = Vec::new();

        std::thread::scope(|scope| {
            let engine = &engine;
            let handles: Vec<_> = (0..THREADS)
                .map(|t| {
                    scope.spawn(move || {
                        let tgid = 1000 + t;
                        let task = Task::process(tgid, "load");
                        let name = format!("proc-{t}");
                        engine.on_exec(&task, &Argv::new([name.as_str(), "--run"]));
                        for i in 0..SENDS {
                            let sock = Socket::connected(10_000 + i as u16, 53);
                            engine.on_udp_sendmsg(&task, &sock, &MsgHeader::default());
                        }
                    })
                })
                .collect();

            loop {
                let done = handles.iter().all(|h| h.is_finished());
                consumed.extend(engine.drain(usize::MAX));
                if done {
                    break;
                }
            }
        });
        consumed.extend(engine.drain(usize::MAX));

        let stats = engine.stats();
        assert_eq!(stats.emitted + stats.dropped, u64::from(THREADS * SENDS));
        assert_eq!(consumed.len() as u64, stats.emitted);

        let mut seen = HashSet::new();
        for event in &consumed {
            let t = event.tgid - 1000;
            assert!(t < THREADS);
            assert_eq!(event.pid, event.tgid);
            assert_eq!(until_nul(&event.comm), b"load");
            let port = event.sock_port_nr - 10_000;
            assert!((0..SENDS as i32).contains(&port));
            assert!(seen.insert((event.tgid, port)), "duplicate record");
            if event.has_cmdline() {
                assert_eq!(args(event), vec![format!("proc-{t}"), "--run".into()]);
            }
        }
    }

    #[test]
    fn test_detached_engine_ignores_hooks() {
        let engine = engine();
        let task = Task::process(1, "dig");
        engine.on_udp_sendmsg(&task, &Socket::connected(1, 53), &MsgHeader::default());
        engine.detach();

        assert!(!engine.is_attached());
        assert!(engine.next_event().is_none());
        assert_eq!(
            engine.on_udp_sendmsg(&task, &Socket::connected(1, 53), &MsgHeader::default()),
            None
        );
        engine.on_exec(&task, &Argv::new(["dig"]));
        assert_eq!(engine.stats().execs, 0);
    }
}
