//! The netconn handle: one per open connection or listener, shared between the blocking-API
//! caller and the protocol thread via `Arc`. Bundles the connection type, the underlying PCB
//! handle, the mailboxes and semaphore the blocking calls rendezvous on, the last posted error,
//! and the connection's lifecycle state.

use std::net::Ipv4Addr;
use std::sync::Mutex;

use netstack_error::Error;
use netstack_sys::{Mailbox, Semaphore};
use netstack_tcp::{TcpListenHandle, TcpPcbHandle};
use netstack_udp::UdpPcbHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetconnType {
    Tcp,
    Udp,
}

/// What a netconn currently owns in the protocol core. `Unbound` covers a freshly created
/// netconn that hasn't been bound, connected, or listened on yet.
pub enum NetconnPcb {
    Unbound,
    Tcp(TcpPcbHandle),
    TcpListen(TcpListenHandle),
    Udp(UdpPcbHandle),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetconnState {
    None,
    Connect,
    Write,
    Close,
}

/// One item placed in `recv_mbox`. Segments delivered to a single TCP connection are posted
/// strictly in sequence order. `Closed` is the sentinel a blocking `recv` wakes up to once the
/// PCB's `err`/EOF callback has fired: closing a netconn wakes any thread blocked on its
/// mailboxes with `CLOSED`.
pub enum RecvItem {
    Tcp(Vec<u8>),
    Udp { data: Vec<u8>, from_ip: Ipv4Addr, from_port: u16 },
    Closed,
}

pub struct Netconn {
    pub conn_type: NetconnType,
    pub pcb: Mutex<NetconnPcb>,
    /// For TCP netconns `bind` runs before the engine has allocated any PCB to bind (unlike UDP,
    /// whose PCB exists from `socket()` onward), so the requested local address is parked here
    /// until `listen`/`connect` actually create one.
    pub tcp_bind: Mutex<Option<(Option<Ipv4Addr>, u16)>>,
    pub recv_mbox: Mailbox<RecvItem>,
    /// Only meaningful for `NetconnType::Tcp` netconns created via `listen`; children spawned by
    /// the TCP engine's `on_accept` land here for `accept` to pick up.
    pub accept_mbox: Mailbox<TcpPcbHandle>,
    /// Signaled by the protocol thread's `sent` callback once buffer space frees up, waking a
    /// `write` call that blocked on a full send queue.
    pub send_sem: Semaphore,
    pub last_err: Mutex<Option<Error>>,
    pub state: Mutex<NetconnState>,
}

impl Netconn {
    pub fn new(conn_type: NetconnType) -> Self {
        Self {
            conn_type,
            pcb: Mutex::new(NetconnPcb::Unbound),
            tcp_bind: Mutex::new(None),
            recv_mbox: Mailbox::new(32),
            accept_mbox: Mailbox::new(8),
            send_sem: Semaphore::new(0),
            last_err: Mutex::new(None),
            state: Mutex::new(NetconnState::None),
        }
    }

    pub fn set_last_err(&self, err: Error) {
        *self.last_err.lock().expect("netconn poisoned") = Some(err);
    }

    pub fn take_last_err(&self) -> Option<Error> {
        self.last_err.lock().expect("netconn poisoned").take()
    }
}
