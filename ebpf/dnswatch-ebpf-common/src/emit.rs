use crate::{
    DNS_PORT, DnsSendEvent, FnId, IdentityStore, SendPorts, TASK_COMM_LEN, identity_key,
};

/// Execution context of the task performing the send.
pub trait TaskContext {
    /// `tgid << 32 | pid`, as returned by `bpf_get_current_pid_tgid`.
    fn pid_tgid(&self) -> u64;

    /// Task comm, if it could be read.
    fn comm(&self) -> Option<[u8; TASK_COMM_LEN]>;
}

/// Producer side of the event channel.
pub trait EventSink {
    type Entry<'a>: ReservedEvent
    where
        Self: 'a;

    /// Reserve space for one zero-initialized record. `None` means the
    /// channel is full and the event is lost.
    fn reserve(&self) -> Option<Self::Entry<'_>>;
}

/// A reserved, not yet visible record.
pub trait ReservedEvent {
    fn event_mut(&mut self) -> &mut DnsSendEvent;

    /// Publish the record to the consumer.
    fn submit(self);
}

/// What [`emit_dns_send`] did with a send.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmitOutcome {
    /// Destination port was not 53.
    NotDns,
    /// Channel full, event lost.
    Dropped,
    /// Record submitted; `enriched` is true when a command line was attached.
    Emitted { enriched: bool },
}

/// Filter a send on its destination port and, for DNS, publish one record.
///
/// The port check comes before any other work; `enrich` (which may read a
/// config map) is only evaluated for DNS sends. Identity enrichment copies the
/// command line only when the table slot belongs to the sending tgid.
#[inline(always)]
pub fn emit_dns_send<C, S, E, F>(
    task: &C,
    identities: &S,
    sink: &E,
    fn_id: FnId,
    ports: SendPorts,
    enrich: F,
) -> EmitOutcome
where
    C: TaskContext,
    S: IdentityStore,
    E: EventSink,
    F: FnOnce() -> bool,
{
    if ports.dport != DNS_PORT {
        return EmitOutcome::NotDns;
    }

    let pid_tgid = task.pid_tgid();
    let tgid = (pid_tgid >> 32) as u32;
    let pid = pid_tgid as u32;

    let Some(mut entry) = sink.reserve() else {
        return EmitOutcome::Dropped;
    };

    let event = entry.event_mut();
    event.tgid = tgid;
    event.pid = pid;
    if let Some(comm) = task.comm() {
        event.comm[..TASK_COMM_LEN].copy_from_slice(&comm);
    }
    event.sock_port_nr = ports.sport as i32;
    event.fn_id = fn_id as u8;

    let enriched = enrich() && identities.load_cmdline(identity_key(tgid), tgid, &mut event.cmdline);

    entry.submit();
    EmitOutcome::Emitted { enriched }
}
