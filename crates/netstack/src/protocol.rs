//! The protocol thread: the single context that owns the [`Stack`] and all mutable engine
//! state. Blocking socket calls never touch the engines directly — they post an [`ApiMsg`] to
//! this thread's mailbox and rendezvous on an [`ApiCall`] reply slot, keeping shared state
//! behind one writer.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use netstack_config::StackConfig;
use netstack_error::{Error, Result};
use netstack_netif::{Ipv4Config, NetifFlags, NetifHandle};
use netstack_socket::{ApiMsg, Netconn, NetconnPcb, NetconnState, NetconnType, RecvItem, SocketTable};
use netstack_sys::{Mailbox, MailboxSender};
use netstack_tcp::TcpPcbHandle;
use netstack_time::{Clock, Instant, SystemClock};
use netstack_udp::UdpPcbHandle;

use crate::Stack;

const API_MAILBOX_CAPACITY: usize = 64;
const LOOPBACK_MAILBOX_CAPACITY: usize = 256;
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(250);
const LOOPBACK_ADDR: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);
const LOOPBACK_NETMASK: Ipv4Addr = Ipv4Addr::new(255, 0, 0, 0);

/// A running protocol thread plus the socket table that posts to it. Dropping this joins the
/// thread after telling it to stop.
pub struct Handle {
    sockets: Arc<SocketTable>,
    api_tx: MailboxSender<ApiMsg>,
    join: Option<std::thread::JoinHandle<()>>,
}

impl Handle {
    pub fn sockets(&self) -> &Arc<SocketTable> {
        &self.sockets
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        let _ = self.api_tx.post(ApiMsg::Shutdown);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Spawns the protocol thread owning a fresh [`Stack`], and returns a [`Handle`] whose
/// [`SocketTable`] is the only thing application code needs to drive blocking socket calls.
/// `add_netifs` runs once against the stack before the thread starts servicing the mailbox —
/// interfaces can't be added afterwards, since only the protocol thread may touch the `Stack`.
pub fn spawn(
    config: StackConfig,
    netif_capacity: usize,
    socket_capacity: usize,
    add_netifs: impl FnOnce(&mut Stack) + Send + 'static,
) -> Handle {
    let mailbox = Arc::new(Mailbox::<ApiMsg>::new(API_MAILBOX_CAPACITY));
    let api_tx = mailbox.sender();
    let sockets = Arc::new(SocketTable::new(socket_capacity, api_tx.clone()));

    let loopback_rx = Mailbox::<Vec<u8>>::new(LOOPBACK_MAILBOX_CAPACITY);
    let loopback_tx = loopback_rx.sender();

    let join = std::thread::Builder::new()
        .name("netstack-protocol".into())
        .spawn(move || {
            let clock = SystemClock::new();
            let mut stack = Stack::new(config, netif_capacity, clock.now());

            // Every stack gets a loopback netif for free: a socket connecting to 127.0.0.1 needs
            // somewhere to route to without a real driver underneath. `linkoutput` just
            // re-queues the frame for the next `drain_loopback` instead of handing it to any
            // actual link.
            let loopback = stack
                .add_netif(
                    *b"lo",
                    [0; 6],
                    u16::MAX,
                    Ipv4Config {
                        addr: LOOPBACK_ADDR,
                        netmask: LOOPBACK_NETMASK,
                        gateway: LOOPBACK_ADDR,
                    },
                    NetifFlags::UP | NetifFlags::LINK_UP,
                    move |frame: &[u8]| {
                        let _ = loopback_tx.post(frame.to_vec());
                        Ok(())
                    },
                )
                .expect("loopback netif registration cannot fail on an empty registry");
            stack.netifs.set_default(loopback).expect("just-registered netif handle is valid");

            add_netifs(&mut stack);

            loop {
                drain_loopback(&mut stack, loopback, &loopback_rx, &clock);

                let wait = stack
                    .next_deadline()
                    .and_then(|d| d.checked_duration_since(clock.now()))
                    .unwrap_or(IDLE_POLL_INTERVAL)
                    .min(IDLE_POLL_INTERVAL);
                let msg = mailbox.fetch(Some(wait));
                stack.handle_timeout(clock.now());
                drain_loopback(&mut stack, loopback, &loopback_rx, &clock);

                let Some(msg) = msg else {
                    continue;
                };
                let should_continue = dispatch(&mut stack, clock.now(), msg);
                drain_loopback(&mut stack, loopback, &loopback_rx, &clock);
                if !should_continue {
                    break;
                }
            }
        })
        .expect("failed to spawn protocol thread");

    Handle {
        sockets,
        api_tx,
        join: Some(join),
    }
}

/// Feeds every frame the loopback netif has queued back into the IP layer. Draining eagerly
/// (rather than only once per wakeup) keeps a local echo round-trip within one dispatch instead
/// of waiting out `IDLE_POLL_INTERVAL`.
fn drain_loopback(stack: &mut Stack, loopback: NetifHandle, queue: &Mailbox<Vec<u8>>, clock: &SystemClock) {
    while let Some(frame) = queue.try_fetch() {
        stack.handle_rx(loopback, frame, clock.now());
    }
}

/// Executes one [`ApiMsg`] against the engines owned by `stack`. Returns `false` on
/// [`ApiMsg::Shutdown`] to stop the thread's loop.
fn dispatch(stack: &mut Stack, now: Instant, msg: ApiMsg) -> bool {
    match msg {
        ApiMsg::NewTcp { reply } => {
            reply.complete(Ok(Arc::new(Netconn::new(NetconnType::Tcp))));
        }
        ApiMsg::NewUdp { reply } => {
            let result = stack.udp.new_pcb().map(|handle| {
                let conn = Arc::new(Netconn::new(NetconnType::Udp));
                *conn.pcb.lock().expect("netconn poisoned") = NetconnPcb::Udp(handle);
                wire_udp_recv(stack, handle, Arc::clone(&conn));
                conn
            });
            reply.complete(result);
        }
        ApiMsg::Bind { conn, local_ip, local_port, reply } => {
            reply.complete(bind(stack, &conn, local_ip, local_port));
        }
        ApiMsg::Connect { conn, remote_ip, remote_port, reply } => {
            reply.complete(connect(stack, conn, remote_ip, remote_port, now));
        }
        ApiMsg::Listen { conn, backlog, reply } => {
            reply.complete(listen(stack, conn, backlog));
        }
        ApiMsg::Write { conn, data, push, reply } => {
            reply.complete(write(stack, &conn, &data, push, now).map(|()| data.len()));
        }
        ApiMsg::SendTo { conn, data, to_ip, to_port, reply } => {
            reply.complete(sendto(stack, &conn, &data, to_ip, to_port, now).map(|()| data.len()));
        }
        ApiMsg::Close { conn, reply } => {
            reply.complete(close(stack, &conn, now));
        }
        ApiMsg::Shutdown => return false,
    }
    true
}

fn udp_pcb(conn: &Netconn) -> Result<UdpPcbHandle> {
    match *conn.pcb.lock().expect("netconn poisoned") {
        NetconnPcb::Udp(h) => Ok(h),
        _ => Err(Error::IllegalOperation),
    }
}

fn tcp_pcb(conn: &Netconn) -> Result<TcpPcbHandle> {
    match *conn.pcb.lock().expect("netconn poisoned") {
        NetconnPcb::Tcp(h) => Ok(h),
        _ => Err(Error::IllegalOperation),
    }
}

fn bind(stack: &mut Stack, conn: &Netconn, local_ip: Option<Ipv4Addr>, local_port: u16) -> Result<()> {
    match conn.conn_type {
        NetconnType::Udp => stack.udp.bind(udp_pcb(conn)?, local_ip, local_port),
        NetconnType::Tcp => {
            *conn.tcp_bind.lock().expect("netconn poisoned") = Some((local_ip, local_port));
            Ok(())
        }
    }
}

fn connect(stack: &mut Stack, conn: Arc<Netconn>, remote_ip: Ipv4Addr, remote_port: u16, now: Instant) -> Result<()> {
    match conn.conn_type {
        NetconnType::Udp => stack.udp.connect(udp_pcb(&conn)?, remote_ip, remote_port),
        NetconnType::Tcp => {
            let bound = *conn.tcp_bind.lock().expect("netconn poisoned");
            let local_ip = bound.and_then(|(ip, _)| ip).unwrap_or_else(|| {
                stack
                    .netifs
                    .default_netif()
                    .and_then(|h| stack.netifs.get(h))
                    .map(|n| n.ipv4.addr)
                    .unwrap_or(Ipv4Addr::UNSPECIFIED)
            });
            let local_port = bound.map(|(_, port)| port).unwrap_or(0);
            let handle = stack.tcp_connect(local_ip, local_port, remote_ip, remote_port, now)?;
            wire_tcp_recv(stack, handle, Arc::clone(&conn));
            *conn.pcb.lock().expect("netconn poisoned") = NetconnPcb::Tcp(handle);
            *conn.state.lock().expect("netconn poisoned") = NetconnState::Connect;
            Ok(())
        }
    }
}

fn listen(stack: &mut Stack, conn: Arc<Netconn>, backlog: usize) -> Result<()> {
    let bound = *conn.tcp_bind.lock().expect("netconn poisoned");
    let local_ip = bound.and_then(|(ip, _)| ip);
    let local_port = bound.map(|(_, port)| port).unwrap_or(0);
    let handle = stack.tcp_listen(local_ip, local_port, backlog)?;
    // Every accepted child is handed unconditionally to the listening netconn's `accept_mbox`;
    // a full mailbox (backlog already exceeds what `accept` has drained) rejects with a RST,
    // matching `try_spawn_from_listen`'s reject path in the TCP engine.
    let accept_conn = Arc::clone(&conn);
    stack.tcp.set_accept(
        handle,
        Box::new(move |child| accept_conn.accept_mbox.post(child).is_ok()),
    );
    *conn.pcb.lock().expect("netconn poisoned") = NetconnPcb::TcpListen(handle);
    Ok(())
}

fn write(stack: &mut Stack, conn: &Netconn, data: &[u8], push: bool, now: Instant) -> Result<()> {
    let handle = tcp_pcb(conn)?;
    stack.tcp.write(handle, data, push)?;
    stack.tcp_output(handle, now)
}

fn sendto(stack: &mut Stack, conn: &Netconn, data: &[u8], to_ip: Ipv4Addr, to_port: u16, now: Instant) -> Result<()> {
    stack.udp_send(udp_pcb(conn)?, to_ip, to_port, data, 64, now)
}

fn close(stack: &mut Stack, conn: &Netconn, now: Instant) -> Result<()> {
    let pcb = std::mem::replace(&mut *conn.pcb.lock().expect("netconn poisoned"), NetconnPcb::Unbound);
    match pcb {
        NetconnPcb::Tcp(handle) => stack.tcp_close(handle, now),
        NetconnPcb::Udp(handle) => {
            stack.udp.remove(handle);
            Ok(())
        }
        NetconnPcb::TcpListen(_) | NetconnPcb::Unbound => Ok(()),
    }
}

fn wire_udp_recv(stack: &mut Stack, handle: UdpPcbHandle, conn: Arc<Netconn>) {
    stack.udp.set_recv(
        handle,
        Box::new(move |data, from_ip, from_port| {
            let _ = conn.recv_mbox.post(RecvItem::Udp {
                data: data.to_vec(),
                from_ip,
                from_port,
            });
        }),
    );
}

fn wire_tcp_recv(stack: &mut Stack, handle: TcpPcbHandle, conn: Arc<Netconn>) {
    stack.tcp.set_recv(
        handle,
        Box::new(move |data| {
            let item = match data {
                Some(bytes) => RecvItem::Tcp(bytes.to_vec()),
                None => RecvItem::Closed,
            };
            let _ = conn.recv_mbox.post(item);
        }),
    );
}
