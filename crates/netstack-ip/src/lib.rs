//! IPv4 engine and ICMP.
//!
//! Operates on bare IPv4 datagrams — no Ethernet framing, TUN-style. See `engine::IpEngine` for
//! the input/output/forward entry points.

mod engine;
mod icmp;
mod packet;
mod reassembly;

pub use engine::{IpEngine, IpInputOutcome};
pub use icmp::Unreachable;
pub use packet::{Ipv4Packet, MAX_DATAGRAM_SIZE};
pub use reassembly::ReassemblyKey;
