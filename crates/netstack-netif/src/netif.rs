//! Netif registry.

use std::net::Ipv4Addr;

use netstack_error::{Error, Result};
use netstack_pbuf::{FixedPool, PoolHandle};

use crate::arp::ArpTable;

/// Interface flags, per the data model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetifFlags(u8);

impl NetifFlags {
    pub const UP: NetifFlags = NetifFlags(0b0000_0001);
    pub const BROADCAST: NetifFlags = NetifFlags(0b0000_0010);
    pub const POINT_TO_POINT: NetifFlags = NetifFlags(0b0000_0100);
    pub const LINK_UP: NetifFlags = NetifFlags(0b0000_1000);
    pub const ETHARP: NetifFlags = NetifFlags(0b0001_0000);

    pub fn contains(self, other: NetifFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn set(&mut self, flag: NetifFlags, value: bool) {
        if value {
            self.0 |= flag.0;
        } else {
            self.0 &= !flag.0;
        }
    }
}

impl std::ops::BitOr for NetifFlags {
    type Output = NetifFlags;

    fn bitor(self, rhs: NetifFlags) -> NetifFlags {
        NetifFlags(self.0 | rhs.0)
    }
}

/// `Copy` handle identifying a registered interface.
pub type NetifHandle = PoolHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ipv4Config {
    pub addr: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
}

impl Ipv4Config {
    /// Whether `addr & netmask == self.addr & netmask`, i.e. `addr` is on-link.
    pub fn same_subnet(&self, addr: Ipv4Addr) -> bool {
        u32::from(self.addr) & u32::from(self.netmask) == u32::from(addr) & u32::from(self.netmask)
    }

    /// The subnet's directed broadcast address (host bits all set).
    pub fn directed_broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.addr) | !u32::from(self.netmask))
    }
}

/// A network interface: identity, addressing, and the link-layer neighbor table (when
/// `ETHARP` is set). `linkoutput`/`output_ip` are realized as trait objects supplied at
/// registration time, matching the driver contract of `linkoutput(netif, pbuf)`.
pub struct Netif {
    pub name: [u8; 2],
    pub hwaddr: [u8; 6],
    pub mtu: u16,
    pub ipv4: Ipv4Config,
    pub flags: NetifFlags,
    pub arp: ArpTable,
    linkoutput: Box<dyn FnMut(&[u8]) -> Result<()> + Send>,
}

impl Netif {
    pub fn is_up(&self) -> bool {
        self.flags.contains(NetifFlags::UP)
    }

    pub fn is_link_up(&self) -> bool {
        self.flags.contains(NetifFlags::LINK_UP)
    }

    /// Transmits a single already-framed packet via the driver's `linkoutput`.
    pub fn linkoutput(&mut self, frame: &[u8]) -> Result<()> {
        (self.linkoutput)(frame)
    }
}

/// Interfaces registered with the stack, plus which one is the default route.
pub struct NetifRegistry {
    netifs: FixedPool<Netif>,
    default: Option<NetifHandle>,
}

impl NetifRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            netifs: FixedPool::new(capacity),
            default: None,
        }
    }

    pub fn add(
        &mut self,
        name: [u8; 2],
        hwaddr: [u8; 6],
        mtu: u16,
        ipv4: Ipv4Config,
        flags: NetifFlags,
        linkoutput: impl FnMut(&[u8]) -> Result<()> + Send + 'static,
    ) -> Result<NetifHandle> {
        let netif = Netif {
            name,
            hwaddr,
            mtu,
            ipv4,
            flags,
            arp: ArpTable::new(),
            linkoutput: Box::new(linkoutput),
        };

        let handle = self.netifs.alloc(netif)?;

        if self.default.is_none() {
            self.default = Some(handle);
        }

        Ok(handle)
    }

    pub fn remove(&mut self, handle: NetifHandle) {
        self.netifs.free(handle);
        if self.default == Some(handle) {
            self.default = None;
        }
    }

    pub fn set_default(&mut self, handle: NetifHandle) -> Result<()> {
        if self.netifs.get(handle).is_none() {
            return Err(Error::IllegalArgument);
        }
        self.default = Some(handle);
        Ok(())
    }

    pub fn default_netif(&self) -> Option<NetifHandle> {
        self.default
    }

    pub fn get(&self, handle: NetifHandle) -> Option<&Netif> {
        self.netifs.get(handle)
    }

    pub fn get_mut(&mut self, handle: NetifHandle) -> Option<&mut Netif> {
        self.netifs.get_mut(handle)
    }

    pub fn set_up(&mut self, handle: NetifHandle, up: bool) {
        if let Some(netif) = self.netifs.get_mut(handle) {
            netif.flags.set(NetifFlags::UP, up);
        }
    }

    pub fn set_link_up(&mut self, handle: NetifHandle, up: bool) {
        if let Some(netif) = self.netifs.get_mut(handle) {
            netif.flags.set(NetifFlags::LINK_UP, up);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (NetifHandle, &Netif)> {
        self.netifs.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (NetifHandle, &mut Netif)> {
        self.netifs.iter_mut()
    }

    /// Returns the interface whose subnet contains `dest`, falling back to the default route.
    pub fn route(&self, dest: Ipv4Addr) -> Option<NetifHandle> {
        self.netifs
            .iter()
            .find(|(_, netif)| netif.ipv4.same_subnet(dest))
            .map(|(h, _)| h)
            .or(self.default)
    }

    /// Whether `addr` matches any interface's own unicast address.
    pub fn is_for_us(&self, addr: Ipv4Addr) -> bool {
        self.netifs.iter().any(|(_, n)| n.ipv4.addr == addr)
    }

    /// Whether `addr` is the limited broadcast or `netif`'s directed broadcast.
    pub fn is_broadcast(&self, netif: NetifHandle, addr: Ipv4Addr) -> bool {
        if addr == Ipv4Addr::BROADCAST {
            return true;
        }
        self.netifs
            .get(netif)
            .map(|n| n.ipv4.directed_broadcast() == addr)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(addr: [u8; 4], mask: [u8; 4], gw: [u8; 4]) -> Ipv4Config {
        Ipv4Config {
            addr: Ipv4Addr::from(addr),
            netmask: Ipv4Addr::from(mask),
            gateway: Ipv4Addr::from(gw),
        }
    }

    #[test]
    fn route_prefers_on_link_subnet_over_default() {
        let mut reg = NetifRegistry::new(4);
        let eth0 = reg
            .add(
                *b"e0",
                [0; 6],
                1500,
                cfg([10, 0, 0, 1], [255, 255, 255, 0], [10, 0, 0, 254]),
                NetifFlags::UP | NetifFlags::LINK_UP,
                |_| Ok(()),
            )
            .unwrap();
        let eth1 = reg
            .add(
                *b"e1",
                [0; 6],
                1500,
                cfg([192, 168, 1, 1], [255, 255, 255, 0], [192, 168, 1, 254]),
                NetifFlags::UP | NetifFlags::LINK_UP,
                |_| Ok(()),
            )
            .unwrap();

        assert_eq!(reg.route(Ipv4Addr::new(10, 0, 0, 42)), Some(eth0));
        assert_eq!(reg.route(Ipv4Addr::new(192, 168, 1, 42)), Some(eth1));
        // Unmatched destination falls back to the default (first-registered) interface.
        assert_eq!(reg.route(Ipv4Addr::new(8, 8, 8, 8)), Some(eth0));
    }

    #[test]
    fn directed_broadcast_is_recognised() {
        let mut reg = NetifRegistry::new(4);
        let eth0 = reg
            .add(
                *b"e0",
                [0; 6],
                1500,
                cfg([10, 0, 0, 1], [255, 255, 255, 0], [10, 0, 0, 254]),
                NetifFlags::UP,
                |_| Ok(()),
            )
            .unwrap();

        assert!(reg.is_broadcast(eth0, Ipv4Addr::new(10, 0, 0, 255)));
        assert!(reg.is_broadcast(eth0, Ipv4Addr::BROADCAST));
        assert!(!reg.is_broadcast(eth0, Ipv4Addr::new(10, 0, 0, 42)));
    }
}
