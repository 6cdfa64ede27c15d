//! Buffer chains (pbuf) and fixed-capacity memory pools — components A and B of the stack.

mod pbuf;
mod pool;

pub use pbuf::{Layer, PbufArena, PbufHandle, PbufType};
pub use pool::{FixedPool, Handle as PoolHandle, PoolStats};
