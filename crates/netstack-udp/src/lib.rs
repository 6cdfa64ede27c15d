//! UDP and UDP-Lite engine.

mod checksum;
mod engine;
mod pcb;

pub use engine::{UdpEngine, UdpInputOutcome};
pub use pcb::{RecvCallback, UdpFlags, UdpPcb, UdpPcbHandle};
