//! IP engine: input, routing, forwarding, and fragmenting output.
//!
//! This stack's interfaces are TUN-style — they carry bare IP datagrams, never Ethernet frames —
//! reading and writing IP packets directly against a TUN device. `NetifFlags::ETHARP` interfaces
//! still go through neighbor resolution before a packet is handed to `linkoutput`; constructing
//! the actual ARP request/reply wire packets is left to the driver/port layer that owns the real
//! link, so a resolution miss here only queues the packet and reports that a request is needed.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU16, Ordering};

use etherparse::IpNumber;
use netstack_config::StackConfig;
use netstack_error::{Error, Result};
use netstack_netif::{NetifHandle, NetifRegistry, ResolveOutcome};
use netstack_time::Instant;

use crate::icmp;
use crate::packet::Ipv4Packet;
use crate::reassembly::{Reassembly, ReassemblyKey};

const MIN_IPV4_HEADER_LEN: usize = 20;
/// IP protocol number for UDP-Lite (RFC 3828), matching `netstack-udp`'s own hardcoded constant.
const UDP_LITE: IpNumber = IpNumber(136);

/// What the caller (the top-level stack) should do with an inbound datagram once the IP engine
/// is done with it.
#[derive(Debug)]
pub enum IpInputOutcome {
    /// Consumed entirely by the IP layer: forwarded, queued for reassembly, answered directly
    /// (e.g. an ICMP echo reply), or dropped.
    Consumed,
    /// Addressed to us and carries a protocol this engine doesn't handle itself; the caller
    /// should dispatch `payload` to the matching UDP/TCP engine.
    ForUs {
        protocol: IpNumber,
        source: Ipv4Addr,
        destination: Ipv4Addr,
        payload: Vec<u8>,
        /// The packet as received, kept around so a caller that finds no matching PCB/listener
        /// for `protocol` (e.g. a UDP datagram with no bound socket) can still answer with an
        /// ICMP destination/port-unreachable, which needs to quote this packet's header.
        original: Ipv4Packet,
    },
}

pub struct IpEngine {
    config: StackConfig,
    reassembly: Reassembly,
    next_identification: AtomicU16,
}

impl IpEngine {
    pub fn new(config: StackConfig) -> Self {
        let reassembly = Reassembly::new(config.memp_num_reassdata);
        Self {
            config,
            reassembly,
            next_identification: AtomicU16::new(1),
        }
    }

    fn next_id(&self) -> u16 {
        self.next_identification.fetch_add(1, Ordering::Relaxed)
    }

    /// Validate, reassemble if needed, then dispatch-for-us or forward.
    pub fn input(
        &mut self,
        netifs: &mut NetifRegistry,
        in_netif: NetifHandle,
        bytes: Vec<u8>,
        now: Instant,
    ) -> IpInputOutcome {
        let packet = match Ipv4Packet::parse(bytes) {
            Ok(p) => p,
            Err(_) => {
                tracing::debug!("dropping malformed IPv4 datagram");
                return IpInputOutcome::Consumed;
            }
        };

        if packet.header().version() != 4 || !packet.checksum_ok() {
            tracing::debug!("dropping IPv4 datagram with bad version or checksum");
            return IpInputOutcome::Consumed;
        }

        let packet = match self.maybe_reassemble(packet) {
            Some(p) => p,
            None => return IpInputOutcome::Consumed,
        };

        let for_us = netifs.is_for_us(packet.destination())
            || netifs.is_broadcast(in_netif, packet.destination());

        if for_us {
            return self.dispatch(netifs, in_netif, packet, now);
        }

        if !self.config.ip_forward {
            return IpInputOutcome::Consumed;
        }

        self.forward(netifs, in_netif, packet, now);
        IpInputOutcome::Consumed
    }

    fn maybe_reassemble(&mut self, packet: Ipv4Packet) -> Option<Ipv4Packet> {
        if !packet.is_fragmented() {
            return Some(packet);
        }

        if !self.config.ip_reassembly {
            tracing::debug!("reassembly disabled, dropping fragment");
            return None;
        }

        let key = ReassemblyKey {
            src: packet.source(),
            dst: packet.destination(),
            identification: packet.identification(),
            protocol: packet.protocol(),
        };
        let offset = packet.fragment_offset() as usize * 8;
        let last = !packet.more_fragments();
        let proto = packet.protocol();
        let (src, dst, ttl, id, df) = (
            packet.source(),
            packet.destination(),
            packet.ttl(),
            packet.identification(),
            packet.dont_fragment(),
        );
        let payload = packet.payload().to_vec();

        let assembled = self.reassembly.insert(key, offset, payload, last)?;

        match Ipv4Packet::build(src, dst, ttl, id, df, false, 0, proto, &assembled) {
            Ok(p) => Some(p),
            Err(_) => {
                tracing::debug!("failed to rebuild reassembled datagram");
                None
            }
        }
    }

    /// Ages reassembly entries by one slow-tick; any that time out get an ICMP time-exceeded
    /// reply if their offset-0 fragment was held (RFC 791: only the first fragment is known to
    /// be addressed to a reachable reporter).
    pub fn age_reassembly(&mut self, netifs: &mut NetifRegistry, out_netif: NetifHandle, now: Instant) {
        let expired = self.reassembly.age(self.config.ip_reass_maxage);
        let Some(our_addr) = netifs.get(out_netif).map(|n| n.ipv4.addr) else {
            return;
        };

        for (key, first_fragment) in expired {
            let Some(fragment_bytes) = first_fragment else {
                continue;
            };
            let Ok(original) = Ipv4Packet::build(
                key.src,
                key.dst,
                64,
                key.identification,
                false,
                true,
                0,
                key.protocol,
                &fragment_bytes,
            ) else {
                continue;
            };

            if let Ok(Some(reply)) = icmp::time_exceeded(&self.config, &original, our_addr) {
                let _ = self.transmit_via(netifs, out_netif, reply, now);
            }
        }
    }

    fn dispatch(
        &mut self,
        netifs: &mut NetifRegistry,
        in_netif: NetifHandle,
        packet: Ipv4Packet,
        now: Instant,
    ) -> IpInputOutcome {
        let our_addr = netifs.get(in_netif).map(|n| n.ipv4.addr).unwrap_or(Ipv4Addr::UNSPECIFIED);

        match packet.protocol() {
            IpNumber::ICMP => {
                if let Ok(Some(reply)) = icmp::echo_reply(&self.config, &packet, our_addr) {
                    let _ = self.transmit_via(netifs, in_netif, reply, now);
                }
                IpInputOutcome::Consumed
            }
            IpNumber::UDP | IpNumber::TCP | UDP_LITE => {
                let protocol = packet.protocol();
                let source = packet.source();
                let destination = packet.destination();
                let payload = packet.payload().to_vec();
                IpInputOutcome::ForUs { protocol, source, destination, payload, original: packet }
            }
            _ => {
                if let Ok(Some(reply)) = icmp::destination_unreachable(
                    &self.config,
                    &packet,
                    our_addr,
                    icmp::Unreachable::Protocol,
                ) {
                    let _ = self.transmit_via(netifs, in_netif, reply, now);
                }
                IpInputOutcome::Consumed
            }
        }
    }

    fn forward(
        &mut self,
        netifs: &mut NetifRegistry,
        in_netif: NetifHandle,
        mut packet: Ipv4Packet,
        now: Instant,
    ) {
        if netifs.is_broadcast(in_netif, packet.destination()) {
            return;
        }

        if packet.ttl() <= 1 {
            if let Some(our_addr) = netifs.get(in_netif).map(|n| n.ipv4.addr) {
                if let Ok(Some(reply)) = icmp::time_exceeded(&self.config, &packet, our_addr) {
                    let _ = self.transmit_via(netifs, in_netif, reply, now);
                }
            }
            return;
        }

        let route = match netifs.route(packet.destination()) {
            Some(h) if h != in_netif => h,
            _ => return,
        };

        if packet.decrement_ttl().is_err() {
            return;
        }

        let _ = self.transmit_via(netifs, route, packet, now);
    }

    /// Routes, then calls `send_if`.
    pub fn send(
        &mut self,
        netifs: &mut NetifRegistry,
        src: Ipv4Addr,
        dest: Ipv4Addr,
        ttl: u8,
        protocol: IpNumber,
        payload: &[u8],
        now: Instant,
    ) -> Result<()> {
        let netif = netifs.route(dest).ok_or(Error::Routing)?;
        self.send_if(netifs, netif, src, dest, ttl, protocol, payload, now)
    }

    /// Builds the IP header(s), fragmenting if `payload` exceeds the interface's MTU, and
    /// transmits each resulting datagram.
    pub fn send_if(
        &mut self,
        netifs: &mut NetifRegistry,
        netif: NetifHandle,
        src: Ipv4Addr,
        dest: Ipv4Addr,
        ttl: u8,
        protocol: IpNumber,
        payload: &[u8],
        now: Instant,
    ) -> Result<()> {
        let mtu = netifs.get(netif).ok_or(Error::InterfaceError)?.mtu as usize;
        let max_payload = mtu.saturating_sub(MIN_IPV4_HEADER_LEN);
        let id = self.next_id();

        if payload.len() <= max_payload {
            let packet = Ipv4Packet::build(src, dest, ttl, id, false, false, 0, protocol, payload)?;
            return self.transmit_via(netifs, netif, packet, now);
        }

        if !self.config.ip_frag {
            return Err(Error::Buffer);
        }

        // RFC 791: every fragment but the last must carry a payload that's a multiple of 8 bytes.
        let frag_size = (max_payload / 8) * 8;
        if frag_size == 0 {
            return Err(Error::Buffer);
        }

        let mut offset = 0usize;
        while offset < payload.len() {
            let end = (offset + frag_size).min(payload.len());
            let more_fragments = end < payload.len();
            let packet = Ipv4Packet::build(
                src,
                dest,
                ttl,
                id,
                false,
                more_fragments,
                (offset / 8) as u16,
                protocol,
                &payload[offset..end],
            )?;
            self.transmit_via(netifs, netif, packet, now)?;
            offset = end;
        }

        Ok(())
    }

    /// Answers `original` with an ICMP destination/port/protocol-unreachable, for a caller above
    /// this engine that finds no matching PCB/listener for a datagram this engine already
    /// decided was `ForUs`. A no-op if ICMP is disabled, `original` is itself an ICMP message, or
    /// `original` wasn't addressed to this interface's own unicast address.
    pub fn reply_unreachable(
        &mut self,
        netifs: &mut NetifRegistry,
        in_netif: NetifHandle,
        original: &Ipv4Packet,
        kind: icmp::Unreachable,
        now: Instant,
    ) -> Result<()> {
        if netifs.is_broadcast(in_netif, original.destination()) {
            return Ok(());
        }
        let our_addr = netifs.get(in_netif).map(|n| n.ipv4.addr).unwrap_or(Ipv4Addr::UNSPECIFIED);
        if let Some(reply) = icmp::destination_unreachable(&self.config, original, our_addr, kind)? {
            self.transmit_via(netifs, in_netif, reply, now)?;
        }
        Ok(())
    }

    /// Flushes the single frame queued for a neighbor once ARP (or an equivalent neighbor
    /// resolution) completes.
    pub fn on_neighbor_resolved(
        &self,
        netifs: &mut NetifRegistry,
        netif: NetifHandle,
        addr: Ipv4Addr,
        hwaddr: [u8; 6],
        now: Instant,
    ) -> Result<()> {
        let netif = netifs.get_mut(netif).ok_or(Error::InterfaceError)?;
        if let Some(queued) = netif.arp.on_resolved(addr, hwaddr, now) {
            return netif.linkoutput(&queued);
        }
        Ok(())
    }

    fn transmit_via(
        &self,
        netifs: &mut NetifRegistry,
        handle: NetifHandle,
        packet: Ipv4Packet,
        now: Instant,
    ) -> Result<()> {
        let next_hop = {
            let netif = netifs.get(handle).ok_or(Error::InterfaceError)?;
            if netif.ipv4.same_subnet(packet.destination()) || netifs.is_broadcast(handle, packet.destination())
            {
                packet.destination()
            } else {
                netif.ipv4.gateway
            }
        };

        let bytes = packet.into_bytes();
        let netif = netifs.get_mut(handle).ok_or(Error::InterfaceError)?;

        if !netif.is_up() || !netif.is_link_up() {
            return Err(Error::InterfaceError);
        }

        if !netif.flags.contains(netstack_netif::NetifFlags::ETHARP) {
            return netif.linkoutput(&bytes);
        }

        if let Some(_hwaddr) = netif.arp.lookup(next_hop) {
            return netif.linkoutput(&bytes);
        }

        match netif.arp.resolve_or_queue(next_hop, now, bytes) {
            ResolveOutcome::RequestNeeded => {
                tracing::debug!(%next_hop, "ARP miss, request needed");
                Ok(())
            }
            ResolveOutcome::AlreadyPendingDroppedPrevious => {
                tracing::debug!(%next_hop, "ARP resolution already pending, dropped previously queued packet");
                Ok(())
            }
            ResolveOutcome::Resolved(_) => unreachable!("checked lookup above"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netstack_netif::{Ipv4Config, NetifFlags, NetifRegistry};
    use std::sync::{Arc, Mutex};

    fn netifs_with_loopback() -> (NetifRegistry, NetifHandle, Arc<Mutex<Vec<Vec<u8>>>>) {
        let mut netifs = NetifRegistry::new(4);
        let sent = Arc::new(Mutex::new(Vec::new()));
        let sent_clone = sent.clone();
        let handle = netifs
            .add(
                *b"lo",
                [0; 6],
                1500,
                Ipv4Config {
                    addr: Ipv4Addr::new(10, 0, 0, 1),
                    netmask: Ipv4Addr::new(255, 255, 255, 0),
                    gateway: Ipv4Addr::new(10, 0, 0, 254),
                },
                NetifFlags::UP | NetifFlags::LINK_UP,
                move |bytes| {
                    sent_clone.lock().unwrap().push(bytes.to_vec());
                    Ok(())
                },
            )
            .unwrap();
        (netifs, handle, sent)
    }

    #[test]
    fn echo_request_for_us_produces_a_reply_without_surfacing_to_caller() {
        let (mut netifs, handle, sent) = netifs_with_loopback();
        let mut engine = IpEngine::new(StackConfig::default());

        let builder = etherparse::PacketBuilder::ipv4(
            [10, 0, 0, 5],
            [10, 0, 0, 1],
            64,
        )
        .icmpv4_echo_request(1, 1);
        let mut bytes = Vec::with_capacity(builder.size(4));
        builder.write(&mut bytes, b"ping").unwrap();

        let outcome = engine.input(&mut netifs, handle, bytes, Instant::ZERO);
        assert!(matches!(outcome, IpInputOutcome::Consumed));
        assert_eq!(sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn udp_for_us_is_surfaced_to_caller() {
        let (mut netifs, handle, _sent) = netifs_with_loopback();
        let mut engine = IpEngine::new(StackConfig::default());

        let packet = Ipv4Packet::build(
            Ipv4Addr::new(10, 0, 0, 5),
            Ipv4Addr::new(10, 0, 0, 1),
            64,
            1,
            false,
            false,
            0,
            IpNumber::UDP,
            b"hello",
        )
        .unwrap();

        let outcome = engine.input(&mut netifs, handle, packet.into_bytes(), Instant::ZERO);
        match outcome {
            IpInputOutcome::ForUs { protocol, payload, .. } => {
                assert_eq!(protocol, IpNumber::UDP);
                assert_eq!(payload, b"hello");
            }
            IpInputOutcome::Consumed => panic!("expected UDP to be surfaced"),
        }
    }

    #[test]
    fn oversized_payload_fragments_into_two_on_wire_datagrams() {
        let (mut netifs, handle, sent) = netifs_with_loopback();
        let mut engine = IpEngine::new(StackConfig::default());

        // 2000 bytes splits into a full 1480-byte leading fragment and a 520-byte tail, the
        // simplest case that exercises MF/offset bookkeeping without tipping into three
        // fragments (a 1500-MTU interface's usable IP payload per fragment is 1480 bytes).
        let payload = vec![7u8; 2000];
        engine
            .send(
                &mut netifs,
                Ipv4Addr::new(10, 0, 0, 1),
                Ipv4Addr::new(10, 0, 0, 5),
                64,
                IpNumber::UDP,
                &payload,
                Instant::ZERO,
            )
            .unwrap();

        let frames = sent.lock().unwrap();
        assert_eq!(frames.len(), 2);
        let first = Ipv4Packet::parse(frames[0].clone()).unwrap();
        let second = Ipv4Packet::parse(frames[1].clone()).unwrap();
        assert!(first.more_fragments());
        assert!(!second.more_fragments());
        assert_eq!(first.identification(), second.identification());
        assert_eq!(
            first.payload().len() + second.payload().len(),
            payload.len()
        );
    }

    #[test]
    fn unknown_protocol_elicits_destination_unreachable() {
        let (mut netifs, handle, sent) = netifs_with_loopback();
        let mut engine = IpEngine::new(StackConfig::default());

        let packet = Ipv4Packet::build(
            Ipv4Addr::new(10, 0, 0, 5),
            Ipv4Addr::new(10, 0, 0, 1),
            64,
            1,
            false,
            false,
            0,
            IpNumber(137), // unused/experimental protocol number
            b"x",
        )
        .unwrap();

        let outcome = engine.input(&mut netifs, handle, packet.into_bytes(), Instant::ZERO);
        assert!(matches!(outcome, IpInputOutcome::Consumed));

        let frames = sent.lock().unwrap();
        assert_eq!(frames.len(), 1);
        let reply = Ipv4Packet::parse(frames[0].clone()).unwrap();
        assert_eq!(reply.protocol(), IpNumber::ICMP);
    }
}
