//! Netif input glue: ARP neighbor state.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use netstack_time::Instant;

/// Default ARP entry lifetime once `Stable`, matching RFC 826 common practice (not otherwise
/// specified).
pub const ARP_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpState {
    Empty,
    Pending,
    Stable,
}

struct ArpEntry {
    hwaddr: [u8; 6],
    state: ArpState,
    expires_at: Instant,
    /// At most one outbound frame queued while resolution is pending.
    queued: Option<Vec<u8>>,
}

/// Fixed-size map from IPv4 address to link-layer neighbor state, owned by one [`super::Netif`].
#[derive(Default)]
pub struct ArpTable {
    entries: HashMap<Ipv4Addr, ArpEntry>,
}

pub enum ResolveOutcome {
    /// The neighbor is already known; transmit immediately with this hardware address.
    Resolved([u8; 6]),
    /// The neighbor is unknown. The caller must broadcast an ARP request; `frame` has been
    /// queued and will be returned from `on_reply` once resolved.
    RequestNeeded,
    /// Resolution is already in flight; the newly-queued frame replaced whatever was queued
    /// before (bounded queue depth of one), so the earlier frame was dropped.
    AlreadyPendingDroppedPrevious,
}

impl ArpTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a stable neighbor without side effects.
    pub fn lookup(&self, addr: Ipv4Addr) -> Option<[u8; 6]> {
        match self.entries.get(&addr) {
            Some(e) if e.state == ArpState::Stable => Some(e.hwaddr),
            _ => None,
        }
    }

    /// Called when an outbound frame needs resolution for `addr`. Queues `frame` (replacing any
    /// previously queued frame for the same destination) and reports what the caller must do.
    pub fn resolve_or_queue(&mut self, addr: Ipv4Addr, now: Instant, frame: Vec<u8>) -> ResolveOutcome {
        if let Some(hwaddr) = self.lookup(addr) {
            return ResolveOutcome::Resolved(hwaddr);
        }

        let outcome = match self.entries.get(&addr) {
            Some(e) if e.state == ArpState::Pending && e.queued.is_some() => {
                ResolveOutcome::AlreadyPendingDroppedPrevious
            }
            _ => ResolveOutcome::RequestNeeded,
        };

        self.entries.insert(
            addr,
            ArpEntry {
                hwaddr: [0; 6],
                state: ArpState::Pending,
                expires_at: now + ARP_TTL,
                queued: Some(frame),
            },
        );

        outcome
    }

    /// Promotes `addr` to `Stable` on an ARP reply (or any frame whose sender matches a pending
    /// entry) and flushes the queued frame, if any.
    pub fn on_resolved(&mut self, addr: Ipv4Addr, hwaddr: [u8; 6], now: Instant) -> Option<Vec<u8>> {
        let was_pending = self
            .entries
            .get(&addr)
            .map(|e| e.state == ArpState::Pending)
            .unwrap_or(false);

        if !was_pending && !self.entries.contains_key(&addr) {
            return None;
        }

        let queued = self.entries.get_mut(&addr).and_then(|e| e.queued.take());

        self.entries.insert(
            addr,
            ArpEntry {
                hwaddr,
                state: ArpState::Stable,
                expires_at: now + ARP_TTL,
                queued: None,
            },
        );

        queued
    }

    /// Gratuitous ARP: only refreshes entries that are already `Stable`; never creates or
    /// promotes a `Pending` entry.
    pub fn on_gratuitous(&mut self, addr: Ipv4Addr, hwaddr: [u8; 6], now: Instant) {
        if let Some(entry) = self.entries.get_mut(&addr) {
            if entry.state == ArpState::Stable {
                entry.hwaddr = hwaddr;
                entry.expires_at = now + ARP_TTL;
            }
        }
    }

    pub fn state(&self, addr: Ipv4Addr) -> ArpState {
        self.entries
            .get(&addr)
            .map(|e| e.state)
            .unwrap_or(ArpState::Empty)
    }

    /// Ages out `Stable` entries whose TTL has expired. `Pending` entries are left alone — they
    /// expire only when replaced by a fresh resolution attempt, not by a standalone timeout on
    /// the in-flight request.
    pub fn age(&mut self, now: Instant) {
        self.entries
            .retain(|_, e| !(e.state == ArpState::Stable && e.expires_at <= now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn miss_then_reply_flushes_exactly_one_queued_packet() {
        let mut arp = ArpTable::new();
        let now = Instant::ZERO;
        let addr = Ipv4Addr::new(10, 0, 0, 2);

        match arp.resolve_or_queue(addr, now, b"packet-1".to_vec()) {
            ResolveOutcome::RequestNeeded => {}
            _ => panic!("expected a fresh resolution to require a request"),
        }
        assert_eq!(arp.state(addr), ArpState::Pending);

        let flushed = arp.on_resolved(addr, [1, 2, 3, 4, 5, 6], now);
        assert_eq!(flushed, Some(b"packet-1".to_vec()));
        assert_eq!(arp.state(addr), ArpState::Stable);
        assert_eq!(arp.lookup(addr), Some([1, 2, 3, 4, 5, 6]));
    }

    #[test]
    fn second_miss_while_pending_drops_first_queued_packet() {
        let mut arp = ArpTable::new();
        let now = Instant::ZERO;
        let addr = Ipv4Addr::new(10, 0, 0, 2);

        arp.resolve_or_queue(addr, now, b"first".to_vec());
        match arp.resolve_or_queue(addr, now, b"second".to_vec()) {
            ResolveOutcome::AlreadyPendingDroppedPrevious => {}
            _ => panic!("expected the second miss to report a dropped packet"),
        }

        let flushed = arp.on_resolved(addr, [9; 6], now);
        assert_eq!(flushed, Some(b"second".to_vec()));
    }

    #[test]
    fn gratuitous_arp_never_creates_or_promotes_pending_entries() {
        let mut arp = ArpTable::new();
        let now = Instant::ZERO;
        let addr = Ipv4Addr::new(10, 0, 0, 2);

        arp.on_gratuitous(addr, [1; 6], now);
        assert_eq!(arp.state(addr), ArpState::Empty);

        arp.resolve_or_queue(addr, now, b"x".to_vec());
        arp.on_gratuitous(addr, [1; 6], now);
        assert_eq!(arp.state(addr), ArpState::Pending);
    }

    #[test]
    fn stable_entries_age_out() {
        let mut arp = ArpTable::new();
        let now = Instant::ZERO;
        let addr = Ipv4Addr::new(10, 0, 0, 2);

        arp.resolve_or_queue(addr, now, b"x".to_vec());
        arp.on_resolved(addr, [1; 6], now);

        arp.age(now + ARP_TTL + Duration::from_secs(1));
        assert_eq!(arp.state(addr), ArpState::Empty);
    }
}
