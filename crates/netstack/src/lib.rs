//! Wires the netif registry and the IP/UDP/TCP engines into one sans-IO `Stack`: the caller
//! pushes received bytes in via [`Stack::handle_rx`] and advances time via
//! [`Stack::handle_timeout`]; everything else (routing, demux, retransmission, ARP aging,
//! reassembly aging) happens inside. There is no internal clock read anywhere in this crate —
//! every entry point takes `now` explicitly, sans-IO style, in the shape of a
//! `handle_inbound`/`handle_timeout`/`poll_outbound` driver.
//!
//! Two tick cadences, matching the historical "fast tick" (TCP retransmission, ~every call) and
//! "slow tick" (ARP aging, IP reassembly aging, ~once a second) split: `handle_timeout` always
//! polls TCP's own per-PCB deadlines, and additionally runs the coarser housekeeping job once
//! its [`TimeoutWheel`] entry comes due.

use std::net::Ipv4Addr;
use std::time::Duration;

use etherparse::IpNumber;
use netstack_config::StackConfig;
use netstack_error::Result;
use netstack_ip::{IpEngine, IpInputOutcome};
pub use netstack_netif::{Ipv4Config, NetifFlags, NetifHandle, NetifRegistry};
use netstack_tcp::{TcpEngine, TcpListenHandle, TcpPcbHandle};
pub use netstack_tcp::TcpInputOutcome;
use netstack_time::{Instant, TimeoutWheel};
use netstack_udp::{UdpEngine, UdpInputOutcome, UdpPcbHandle};

#[cfg(feature = "threaded")]
pub mod protocol;

/// IP protocol number for UDP-Lite (RFC 3828); mirrors `netstack-ip`'s and `netstack-udp`'s own
/// hardcoded constants since UDP-Lite isn't a named `etherparse::IpNumber` associated const.
const UDP_LITE: IpNumber = IpNumber(136);

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);

enum Tick {
    Housekeeping,
}

pub struct Stack {
    pub netifs: NetifRegistry,
    pub ip: IpEngine,
    pub udp: UdpEngine,
    pub tcp: TcpEngine,
    ticks: TimeoutWheel<Tick>,
}

impl Stack {
    pub fn new(config: StackConfig, netif_capacity: usize, now: Instant) -> Self {
        let mut ticks = TimeoutWheel::new();
        ticks.schedule(now, HOUSEKEEPING_INTERVAL, Tick::Housekeeping);
        Self {
            netifs: NetifRegistry::new(netif_capacity),
            ip: IpEngine::new(config),
            udp: UdpEngine::new(&config),
            tcp: TcpEngine::new(config),
            ticks,
        }
    }

    /// Hands a just-received IP datagram (no link-layer framing; interfaces are TUN-style, per
    /// `netstack-ip`'s engine doc) to the stack, dispatching to UDP/TCP once the IP layer has
    /// decided the datagram is for us.
    pub fn handle_rx(&mut self, netif: NetifHandle, bytes: Vec<u8>, now: Instant) {
        let outcome = self.ip.input(&mut self.netifs, netif, bytes, now);
        let IpInputOutcome::ForUs { protocol, source, destination, payload, original } = outcome else {
            return;
        };

        match protocol {
            IpNumber::UDP => {
                if let UdpInputOutcome::NoMatchingPcb = self.udp.input(source, destination, &payload, false) {
                    let _ = self.ip.reply_unreachable(&mut self.netifs, netif, &original, netstack_ip::Unreachable::Port, now);
                }
            }
            UDP_LITE => {
                if let UdpInputOutcome::NoMatchingPcb = self.udp.input(source, destination, &payload, true) {
                    let _ = self.ip.reply_unreachable(&mut self.netifs, netif, &original, netstack_ip::Unreachable::Port, now);
                }
            }
            IpNumber::TCP => {
                match self.tcp.input(&mut self.netifs, &mut self.ip, source, destination, &payload, now) {
                    TcpInputOutcome::Delivered | TcpInputOutcome::NewConnection(_) => {
                        // `NewConnection` already ran the listener's `on_accept` capability
                        // inside the engine; nothing further to dispatch here.
                    }
                    _ => {}
                }
            }
            _ => {} // IP engine already emitted ICMP protocol-unreachable for anything else.
        }
    }

    /// Advances time: always polls TCP's per-connection timers (retransmit, persist, delayed
    /// ACK, 2·MSL), and additionally runs ARP/reassembly aging once a second.
    pub fn handle_timeout(&mut self, now: Instant) {
        self.tcp.poll_timers(&mut self.netifs, &mut self.ip, now);

        let due = self.ticks.check(now);
        if due.is_empty() {
            return;
        }
        let handles: Vec<NetifHandle> = self.netifs.iter().map(|(h, _)| h).collect();
        for handle in handles {
            if let Some(netif) = self.netifs.get_mut(handle) {
                netif.arp.age(now);
            }
            self.ip.age_reassembly(&mut self.netifs, handle, now);
        }
        self.ticks.schedule(now, HOUSEKEEPING_INTERVAL, Tick::Housekeeping);
    }

    /// Deadline the driver/protocol-thread event loop should wait on next, folding in whatever
    /// the TCP engine's own per-connection deadlines need. `handle_timeout` polls TCP
    /// unconditionally, so the wheel's housekeeping deadline is the only one this crate needs to
    /// surface; a caller wanting sub-second TCP timer precision should simply call
    /// `handle_timeout` on a short fixed cadence rather than computing an exact next-fire time.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.ticks.next_deadline()
    }

    // ---- Driver-facing netif management -------------------------------------------------------

    pub fn add_netif(
        &mut self,
        name: [u8; 2],
        hwaddr: [u8; 6],
        mtu: u16,
        ipv4: Ipv4Config,
        flags: NetifFlags,
        linkoutput: impl FnMut(&[u8]) -> Result<()> + Send + 'static,
    ) -> Result<NetifHandle> {
        self.netifs.add(name, hwaddr, mtu, ipv4, flags, linkoutput)
    }

    // ---- Direct (callback-mode) TCP/UDP convenience wrappers -----------------------------------

    pub fn udp_send(&mut self, handle: UdpPcbHandle, dest_ip: Ipv4Addr, dest_port: u16, payload: &[u8], ttl: u8, now: Instant) -> Result<()> {
        self.udp.send(&mut self.netifs, &mut self.ip, handle, dest_ip, dest_port, payload, ttl, now)
    }

    pub fn tcp_connect(&mut self, local_ip: Ipv4Addr, local_port: u16, remote_ip: Ipv4Addr, remote_port: u16, now: Instant) -> Result<TcpPcbHandle> {
        self.tcp.connect(&mut self.netifs, &mut self.ip, local_ip, local_port, remote_ip, remote_port, now)
    }

    pub fn tcp_output(&mut self, handle: TcpPcbHandle, now: Instant) -> Result<()> {
        self.tcp.output(&mut self.netifs, &mut self.ip, handle, now)
    }

    pub fn tcp_close(&mut self, handle: TcpPcbHandle, now: Instant) -> Result<()> {
        self.tcp.close(handle)?;
        self.tcp.output(&mut self.netifs, &mut self.ip, handle, now)
    }

    pub fn tcp_abort(&mut self, handle: TcpPcbHandle, now: Instant) -> Result<()> {
        self.tcp.abort(&mut self.netifs, &mut self.ip, handle, now)
    }

    pub fn tcp_listen(&mut self, local_ip: Option<Ipv4Addr>, local_port: u16, backlog: usize) -> Result<TcpListenHandle> {
        self.tcp.listen(local_ip, local_port, backlog)
    }
}
