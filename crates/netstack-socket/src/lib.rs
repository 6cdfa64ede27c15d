//! Netconn/socket API: the thread-safe blocking wrapper around the protocol thread, plus a
//! BSD-socket facade over it. Owns no protocol state itself — every call here
//! ends in an [`api::ApiMsg`] posted to the protocol thread, which alone drives the TCP/UDP
//! engines (see the top-level `netstack` crate).

mod api;
mod netconn;
mod socket;

pub use api::{ApiCall, ApiMsg};
pub use netconn::{Netconn, NetconnPcb, NetconnState, NetconnType, RecvItem};
pub use socket::{RecvTimeout, SocketTable};
