//! TCP engine: connection state machine, segmentation, retransmission, congestion control,
//! and out-of-order reassembly.

mod engine;
mod ooseq;
mod pcb;
mod rto;
mod seq;
mod state;
mod wire;

#[cfg(all(test, feature = "proptest"))]
mod proptests;

pub use engine::{TcpEngine, TcpInputOutcome};
pub use ooseq::OutOfOrderQueue;
pub use pcb::{
    AcceptCallback, ConnectedCallback, ErrCallback, PollCallback, RecvCallback, SentCallback,
    TcpFlags, TcpListenHandle, TcpPcbHandle,
};
pub use state::TcpState;
