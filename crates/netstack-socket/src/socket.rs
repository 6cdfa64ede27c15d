//! BSD-socket facade over [`Netconn`]/[`ApiMsg`]: a fixed-size fd table (capacity configurable)
//! mapping small integers to netconns, plus a residue field that lets a TCP `recv` shorter than
//! the available bytes leave the remainder for the following call.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use netstack_error::{Error, Result};
use netstack_sys::MailboxSender;

use crate::api::{ApiCall, ApiMsg};
use crate::netconn::{Netconn, NetconnType, RecvItem};

/// Read timeout, matching `SO_RCVTIMEO` semantics: `None` blocks forever, `Some(Duration::ZERO)`
/// is a non-blocking poll that returns `WouldBlock` immediately instead of `Timeout`.
pub type RecvTimeout = Option<Duration>;

struct SocketEntry {
    conn: Arc<Netconn>,
    /// Bytes left over from the previous `recv`/`read` that didn't fit the caller's buffer, and
    /// how far into it the caller has already consumed. Only ever populated for
    /// `NetconnType::Tcp`: UDP preserves datagram boundaries, so a short read simply discards
    /// the rest of that datagram instead of re-queuing the leftover bytes.
    residue: Option<(Vec<u8>, usize)>,
}

pub struct SocketTable {
    entries: Mutex<Vec<Option<SocketEntry>>>,
    api_tx: MailboxSender<ApiMsg>,
}

impl SocketTable {
    pub fn new(capacity: usize, api_tx: MailboxSender<ApiMsg>) -> Self {
        let mut entries = Vec::with_capacity(capacity);
        entries.resize_with(capacity, || None);
        Self {
            entries: Mutex::new(entries),
            api_tx,
        }
    }

    fn alloc(&self, conn: Arc<Netconn>) -> Result<i32> {
        let mut entries = self.entries.lock().expect("socket table poisoned");
        for (i, slot) in entries.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(SocketEntry { conn, residue: None });
                return Ok(i as i32);
            }
        }
        Err(Error::OutOfMemory)
    }

    fn conn(&self, fd: i32) -> Result<Arc<Netconn>> {
        let entries = self.entries.lock().expect("socket table poisoned");
        let slot = usize::try_from(fd).ok().and_then(|i| entries.get(i)).ok_or(Error::IllegalArgument)?;
        slot.as_ref().map(|e| Arc::clone(&e.conn)).ok_or(Error::IllegalArgument)
    }

    fn post<T>(&self, msg: ApiMsg, reply: Arc<ApiCall<T>>) -> Result<T> {
        self.api_tx.post(msg).map_err(|_| Error::InterfaceError)?;
        reply.wait()
    }

    /// Allocates a fresh netconn of the requested type and its fd-table slot.
    pub fn socket(&self, conn_type: NetconnType) -> Result<i32> {
        let reply = ApiCall::new();
        let msg = match conn_type {
            NetconnType::Tcp => ApiMsg::NewTcp { reply: Arc::clone(&reply) },
            NetconnType::Udp => ApiMsg::NewUdp { reply: Arc::clone(&reply) },
        };
        let conn = self.post(msg, reply)?;
        self.alloc(conn)
    }

    pub fn bind(&self, fd: i32, local_ip: Option<Ipv4Addr>, local_port: u16) -> Result<()> {
        let conn = self.conn(fd)?;
        let reply = ApiCall::new();
        self.post(ApiMsg::Bind { conn, local_ip, local_port, reply: Arc::clone(&reply) }, reply)
    }

    pub fn connect(&self, fd: i32, remote_ip: Ipv4Addr, remote_port: u16) -> Result<()> {
        let conn = self.conn(fd)?;
        let reply = ApiCall::new();
        self.post(ApiMsg::Connect { conn, remote_ip, remote_port, reply: Arc::clone(&reply) }, reply)
    }

    pub fn listen(&self, fd: i32, backlog: usize) -> Result<()> {
        let conn = self.conn(fd)?;
        let reply = ApiCall::new();
        self.post(ApiMsg::Listen { conn, backlog, reply: Arc::clone(&reply) }, reply)
    }

    /// Blocks on the listening netconn's `accept_mbox`, then hands the caller a brand-new fd
    /// wrapping the child connection the TCP engine already spun up.
    pub fn accept(&self, fd: i32, timeout: RecvTimeout) -> Result<i32> {
        let listener = self.conn(fd)?;
        if listener.conn_type != NetconnType::Tcp {
            return Err(Error::IllegalOperation);
        }
        let handle = fetch_with_timeout(&listener.accept_mbox, timeout)?;

        let child = Arc::new(Netconn::new(NetconnType::Tcp));
        *child.pcb.lock().expect("netconn poisoned") = crate::netconn::NetconnPcb::Tcp(handle);
        self.alloc(child)
    }

    pub fn send(&self, fd: i32, data: &[u8]) -> Result<usize> {
        let conn = self.conn(fd)?;
        if conn.conn_type != NetconnType::Tcp {
            return Err(Error::IllegalOperation);
        }
        let reply = ApiCall::new();
        self.post(ApiMsg::Write { conn, data: data.to_vec(), push: true, reply: Arc::clone(&reply) }, reply)
    }

    pub fn sendto(&self, fd: i32, data: &[u8], to_ip: Ipv4Addr, to_port: u16) -> Result<usize> {
        let conn = self.conn(fd)?;
        if conn.conn_type != NetconnType::Udp {
            return Err(Error::IllegalOperation);
        }
        let reply = ApiCall::new();
        self.post(ApiMsg::SendTo { conn, data: data.to_vec(), to_ip, to_port, reply: Arc::clone(&reply) }, reply)
    }

    /// Serves leftover residue first, then blocks on the netconn's `recv_mbox`. Returns
    /// `(bytes_written, Some((from_ip, from_port)))` for UDP; the address is `None` for TCP,
    /// which has none per-datagram (it's a byte stream).
    pub fn recv(&self, fd: i32, buf: &mut [u8], timeout: RecvTimeout) -> Result<(usize, Option<(Ipv4Addr, u16)>)> {
        let conn = self.conn(fd)?;

        if conn.conn_type == NetconnType::Tcp {
            if let Some(n) = self.drain_residue(fd, buf) {
                return Ok((n, None));
            }
        }

        let item = fetch_with_timeout(&conn.recv_mbox, timeout)?;
        match item {
            RecvItem::Closed => Err(Error::ConnectionClosed),
            RecvItem::Udp { data, from_ip, from_port } => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok((n, Some((from_ip, from_port))))
            }
            RecvItem::Tcp(data) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    let mut entries = self.entries.lock().expect("socket table poisoned");
                    if let Some(Some(entry)) = usize::try_from(fd).ok().map(|i| entries.get_mut(i)) {
                        entry.residue = Some((data, n));
                    }
                }
                Ok((n, None))
            }
        }
    }

    fn drain_residue(&self, fd: i32, buf: &mut [u8]) -> Option<usize> {
        let mut entries = self.entries.lock().expect("socket table poisoned");
        let entry = usize::try_from(fd).ok().and_then(|i| entries.get_mut(i))?.as_mut()?;
        let (data, offset) = entry.residue.take()?;
        let remaining = &data[offset..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        if offset + n < data.len() {
            entry.residue = Some((data, offset + n));
        }
        Some(n)
    }

    /// Tears down the netconn and frees its fd slot. Does not itself wait for the protocol
    /// thread's teardown to complete beyond `ApiMsg::Close`'s own reply.
    pub fn close(&self, fd: i32) -> Result<()> {
        let conn = self.conn(fd)?;
        let reply = ApiCall::new();
        let result = self.post(ApiMsg::Close { conn, reply: Arc::clone(&reply) }, reply);
        let mut entries = self.entries.lock().expect("socket table poisoned");
        if let Some(slot) = usize::try_from(fd).ok().and_then(|i| entries.get_mut(i)) {
            *slot = None;
        }
        result
    }
}

/// A zero-duration timeout is a non-blocking poll (`WouldBlock` on empty), any other duration is
/// `SO_RCVTIMEO`-style (`Timeout` on expiry), and no timeout blocks until an item arrives.
fn fetch_with_timeout<T>(mailbox: &netstack_sys::Mailbox<T>, timeout: RecvTimeout) -> Result<T> {
    match timeout {
        Some(Duration::ZERO) => mailbox.try_fetch().ok_or(Error::WouldBlock),
        Some(d) => mailbox.fetch(Some(d)).ok_or(Error::Timeout),
        None => mailbox.fetch(None).ok_or(Error::InterfaceError), // mailbox closed unexpectedly
    }
}
