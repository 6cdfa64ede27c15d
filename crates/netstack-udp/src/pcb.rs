//! UDP PCB data model.

use std::net::Ipv4Addr;

use netstack_pbuf::PoolHandle;

pub type UdpPcbHandle = PoolHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UdpFlags(u8);

impl UdpFlags {
    pub const CONNECTED: UdpFlags = UdpFlags(0b001);
    pub const NOCHKSUM: UdpFlags = UdpFlags(0b010);
    pub const UDPLITE: UdpFlags = UdpFlags(0b100);

    pub fn contains(self, other: UdpFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn set(&mut self, flag: UdpFlags, value: bool) {
        if value {
            self.0 |= flag.0;
        } else {
            self.0 &= !flag.0;
        }
    }
}

/// The capability record named in the redesign flags: an optional closure over client state,
/// rather than a raw function pointer plus an opaque `arg`.
pub type RecvCallback = Box<dyn FnMut(&[u8], Ipv4Addr, u16) + Send>;

pub struct UdpPcb {
    pub local_ip: Option<Ipv4Addr>,
    pub local_port: u16,
    pub remote_ip: Option<Ipv4Addr>,
    pub remote_port: Option<u16>,
    pub flags: UdpFlags,
    /// `UDP_LITE` coverage length in bytes; `0` means "whole datagram".
    pub chksum_len: u16,
    pub on_recv: Option<RecvCallback>,
}

impl UdpPcb {
    pub fn unbound() -> Self {
        Self {
            local_ip: None,
            local_port: 0,
            remote_ip: None,
            remote_port: None,
            flags: UdpFlags::default(),
            chksum_len: 0,
            on_recv: None,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.local_port != 0
    }

    /// Tuple-match specificity for `input`'s demux order: exact 4-tuple beats wildcard-remote,
    /// which beats wildcard-local/remote. Returns `None` if `local_port` doesn't match at all
    /// (a hard requirement, not a specificity tiebreak).
    pub fn match_specificity(
        &self,
        dst_ip: Ipv4Addr,
        dst_port: u16,
        src_ip: Ipv4Addr,
        src_port: u16,
    ) -> Option<u8> {
        if self.local_port != dst_port {
            return None;
        }
        if let Some(local_ip) = self.local_ip {
            if local_ip != dst_ip {
                return None;
            }
        }

        let remote_exact = self.remote_ip == Some(src_ip) && self.remote_port == Some(src_port);
        let remote_wildcard = self.remote_ip.is_none() && self.remote_port.is_none();

        if remote_exact {
            return Some(2);
        }
        if remote_wildcard {
            return Some(if self.local_ip.is_some() { 1 } else { 0 });
        }
        None
    }
}
