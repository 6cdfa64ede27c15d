//! Network interface registry and ARP neighbor state.

mod arp;
mod netif;

pub use arp::{ArpState, ArpTable, ResolveOutcome, ARP_TTL};
pub use netif::{Ipv4Config, Netif, NetifFlags, NetifHandle, NetifRegistry};
