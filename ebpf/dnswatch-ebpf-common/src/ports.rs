/// Ports of one socket send, in host byte order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SendPorts {
    /// Destination port the datagram is addressed to.
    pub dport: u16,
    /// Local port of the sending socket.
    pub sport: u16,
}

impl SendPorts {
    /// UDP send. `msg_dport_be` is the port of `msg->msg_name` when the caller
    /// supplied a per-call destination (sendto/sendmsg on an unconnected
    /// socket); it takes precedence over the socket's connected peer port.
    #[inline(always)]
    pub fn udp(msg_dport_be: Option<u16>, skc_dport_be: u16, skc_num: u16) -> Self {
        let dport_be = match msg_dport_be {
            Some(port) => port,
            None => skc_dport_be,
        };
        Self {
            dport: u16::from_be(dport_be),
            sport: skc_num,
        }
    }

    /// TCP send. Both ports come from the connected socket.
    #[inline(always)]
    pub fn tcp(skc_dport_be: u16, skc_num: u16) -> Self {
        Self {
            dport: u16::from_be(skc_dport_be),
            sport: skc_num,
        }
    }
}
