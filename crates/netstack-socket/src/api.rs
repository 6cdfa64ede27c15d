//! The API message funnel: a thin adapter that posts messages to the protocol task and blocks
//! on completion. [`ApiMsg`] is what blocking callers
//! post to the protocol thread's mailbox; [`ApiCall`] is the rendezvous object a poster blocks
//! on while the protocol thread executes the message and calls back with a result.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use netstack_error::{Error, Result};
use netstack_sys::Semaphore;

use crate::netconn::Netconn;

/// A one-shot result slot plus the semaphore a blocking caller waits on. Generic over the
/// message's result type so `Write` can hand back bytes-accepted while `Connect` hands back
/// nothing but success/failure.
pub struct ApiCall<T> {
    result: Mutex<Option<Result<T>>>,
    done: Semaphore,
}

impl<T> ApiCall<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            result: Mutex::new(None),
            done: Semaphore::new(0),
        })
    }

    /// Called by the protocol thread once it has executed the corresponding [`ApiMsg`].
    pub fn complete(&self, result: Result<T>) {
        *self.result.lock().expect("api call poisoned") = Some(result);
        self.done.signal();
    }

    /// Blocks the calling thread until `complete` is called, with no timeout — used for calls
    /// that never time out on their own (e.g. `close`).
    pub fn wait(&self) -> Result<T> {
        self.done.wait();
        self.result.lock().expect("api call poisoned").take().expect("signaled without a result")
    }

    /// Blocks with a caller-supplied timeout (`SO_RCVTIMEO`-style). An expired timeout
    /// returns `Error::Timeout` without cancelling the in-flight protocol work; the eventual
    /// completion, if any, is simply never observed by this caller.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<T> {
        if self.done.wait_timeout(timeout) {
            self.result.lock().expect("api call poisoned").take().expect("signaled without a result")
        } else {
            Err(Error::Timeout)
        }
    }
}

/// One message posted to the protocol thread's API mailbox. The protocol thread (owned by the
/// top-level `netstack` crate, which alone holds the engines) matches on this and drives the
/// matching `TcpEngine`/`UdpEngine` call, then completes `reply`.
pub enum ApiMsg {
    NewTcp {
        reply: Arc<ApiCall<Arc<Netconn>>>,
    },
    NewUdp {
        reply: Arc<ApiCall<Arc<Netconn>>>,
    },
    Bind {
        conn: Arc<Netconn>,
        local_ip: Option<Ipv4Addr>,
        local_port: u16,
        reply: Arc<ApiCall<()>>,
    },
    Connect {
        conn: Arc<Netconn>,
        remote_ip: Ipv4Addr,
        remote_port: u16,
        reply: Arc<ApiCall<()>>,
    },
    Listen {
        conn: Arc<Netconn>,
        backlog: usize,
        reply: Arc<ApiCall<()>>,
    },
    Write {
        conn: Arc<Netconn>,
        data: Vec<u8>,
        push: bool,
        reply: Arc<ApiCall<usize>>,
    },
    SendTo {
        conn: Arc<Netconn>,
        data: Vec<u8>,
        to_ip: Ipv4Addr,
        to_port: u16,
        reply: Arc<ApiCall<usize>>,
    },
    Close {
        conn: Arc<Netconn>,
        reply: Arc<ApiCall<()>>,
    },
    /// Sentinel telling the protocol thread's dispatch loop to stop; posted once by
    /// `protocol::Handle::drop`, never by a socket call.
    Shutdown,
}
