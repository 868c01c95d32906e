//! Hand-mirrored prefixes of the kernel structures the interceptors read.
//!
//! Only leading fields whose offsets have been stable across kernel releases
//! are declared; everything is read through `bpf_probe_read_kernel`.

use core::ffi::c_void;
use core::ptr::addr_of;

use aya_ebpf::helpers::bpf_probe_read_kernel;

/// `struct sock_common` up to `skc_portpair`. `struct sock` starts with it.
#[repr(C)]
pub struct SockCommon {
    _skc_addrpair: u64,
    _skc_hash: u32,
    /// Peer port, network byte order.
    pub skc_dport: u16,
    /// Local port, host byte order.
    pub skc_num: u16,
}

/// `struct msghdr`, first field only.
#[repr(C)]
pub struct MsgHdr {
    pub msg_name: *const c_void,
}

/// Shared prefix of `sockaddr_in` and `sockaddr_in6`.
#[repr(C)]
pub struct SockaddrPrefix {
    pub family: u16,
    /// `sin_port` / `sin6_port`, network byte order.
    pub port: u16,
}

/// `(skc_dport, skc_num)` of a socket.
#[inline(always)]
pub fn socket_ports(sk: *const SockCommon) -> Result<(u16, u16), i64> {
    let dport = unsafe { bpf_probe_read_kernel(addr_of!((*sk).skc_dport))? };
    let num = unsafe { bpf_probe_read_kernel(addr_of!((*sk).skc_num))? };
    Ok((dport, num))
}

/// Port of `msg->msg_name`, if the sender passed an explicit destination.
#[inline(always)]
pub fn message_dport(msg: *const MsgHdr) -> Option<u16> {
    if msg.is_null() {
        return None;
    }
    let name = unsafe { bpf_probe_read_kernel(addr_of!((*msg).msg_name)).ok()? };
    if name.is_null() {
        return None;
    }
    let addr = name.cast::<SockaddrPrefix>();
    unsafe { bpf_probe_read_kernel(addr_of!((*addr).port)).ok() }
}
