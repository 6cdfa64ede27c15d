//! TCP PCB data model — the hardest entity in the stack.
//!
//! Listening and active PCBs are two distinct types living in two distinct pools rather than
//! one sum type: a tagged-variant alternative would store unused slots on listeners.
//! [`ListenPcb`] never carries the sequence-space/congestion fields an active connection needs,
//! and [`ActivePcb`] never carries a backlog counter.

use std::collections::VecDeque;
use std::net::Ipv4Addr;

use netstack_error::Error;
use netstack_pbuf::PoolHandle;
use netstack_time::Instant;

use crate::ooseq::OutOfOrderQueue;
use crate::rto::RttEstimator;
use crate::state::TcpState;

pub type TcpListenHandle = PoolHandle;
pub type TcpPcbHandle = PoolHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpFlags(u8);

impl TcpFlags {
    pub const NODELAY: TcpFlags = TcpFlags(0b001);
    pub const KEEPALIVE: TcpFlags = TcpFlags(0b010);
    pub const DELAYED_ACK_PENDING: TcpFlags = TcpFlags(0b100);

    pub fn contains(self, other: TcpFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn set(&mut self, flag: TcpFlags, value: bool) {
        if value {
            self.0 |= flag.0;
        } else {
            self.0 &= !flag.0;
        }
    }
}

/// One queued or in-flight chunk of the send stream. `syn`/`fin` each consume one sequence
/// number, matching RFC 793's treatment of the control flags as occupying sequence space.
#[derive(Debug, Clone)]
pub struct Segment {
    pub seq: u32,
    pub data: Vec<u8>,
    pub syn: bool,
    pub fin: bool,
    pub push: bool,
    pub rtx_count: u8,
    pub first_sent: Option<Instant>,
}

impl Segment {
    pub fn seq_len(&self) -> u32 {
        self.data.len() as u32 + self.syn as u32 + self.fin as u32
    }

    pub fn end(&self) -> u32 {
        self.seq.wrapping_add(self.seq_len())
    }
}

pub type RecvCallback = Box<dyn FnMut(Option<&[u8]>) + Send>;
pub type SentCallback = Box<dyn FnMut(u32) + Send>;
pub type ErrCallback = Box<dyn FnMut(Error) + Send>;
pub type PollCallback = Box<dyn FnMut() + Send>;
pub type ConnectedCallback = Box<dyn FnMut() + Send>;
/// Returns `true` to accept the new connection, `false` to reject it (caller sends RST).
pub type AcceptCallback = Box<dyn FnMut(TcpPcbHandle) -> bool + Send>;

#[derive(Default)]
pub struct TcpCallbacks {
    pub on_recv: Option<RecvCallback>,
    pub on_sent: Option<SentCallback>,
    pub on_err: Option<ErrCallback>,
    pub on_poll: Option<PollCallback>,
    pub on_connected: Option<ConnectedCallback>,
}

pub struct ListenPcb {
    pub local_ip: Option<Ipv4Addr>,
    pub local_port: u16,
    pub backlog: usize,
    /// Children currently in SYN_RCVD spawned from this listener, counted against `backlog`.
    pub pending: usize,
    pub on_accept: Option<AcceptCallback>,
}

impl ListenPcb {
    pub fn has_backlog_room(&self) -> bool {
        self.pending < self.backlog
    }
}

pub struct ActivePcb {
    pub local_ip: Ipv4Addr,
    pub local_port: u16,
    pub remote_ip: Ipv4Addr,
    pub remote_port: u16,
    pub state: TcpState,

    pub snd_una: u32,
    pub snd_nxt: u32,
    pub snd_max: u32,
    pub snd_wnd: u32,
    pub snd_wl1: u32,
    pub snd_wl2: u32,

    pub rcv_nxt: u32,
    pub rcv_wnd: u32,
    pub rcv_ann_wnd: u32,
    pub rcv_ann_right_edge: u32,

    pub cwnd: u32,
    pub ssthresh: u32,
    pub mss: u16,
    pub rtt: RttEstimator,
    pub rto: std::time::Duration,
    pub dupacks: u8,

    pub unsent: VecDeque<Segment>,
    pub unacked: VecDeque<Segment>,
    pub ooseq: OutOfOrderQueue,

    pub retransmit_deadline: Option<Instant>,
    pub persist_deadline: Option<Instant>,
    pub keepalive_deadline: Option<Instant>,
    pub time_wait_deadline: Option<Instant>,
    pub delayed_ack_deadline: Option<Instant>,

    pub rtx_count: u8,
    pub persist_backoff: u8,
    pub keepalive_probes: u8,

    /// Eviction priority under pool pressure: higher value is evicted first. A
    /// freshly accepted connection starts at a low priority; applications may raise it.
    pub priority: u8,
    pub flags: TcpFlags,
    pub callbacks: TcpCallbacks,

    /// RFC 7323 window scale. Zero unless `tcp-extended-options` negotiated one during
    /// the handshake, in which case the shift is a no-op and behavior matches the feature-off
    /// build exactly.
    pub snd_wscale: u8,
    pub rcv_wscale: u8,
    /// RFC 7323 timestamps: whether negotiated, and the peer's last-seen `TSval`, echoed
    /// back as our next `TSecr`. Not wired into RTT estimation — `rtt`/`rto` above still drive
    /// retransmission timing on a pure cumulative-ACK model.
    pub ts_enabled: bool,
    pub ts_recent: u32,
}

impl ActivePcb {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_ip: Ipv4Addr,
        local_port: u16,
        remote_ip: Ipv4Addr,
        remote_port: u16,
        state: TcpState,
        iss: u32,
        mss: u16,
        rcv_wnd: u32,
    ) -> Self {
        Self {
            local_ip,
            local_port,
            remote_ip,
            remote_port,
            state,
            snd_una: iss,
            snd_nxt: iss,
            snd_max: iss,
            snd_wnd: 0,
            snd_wl1: 0,
            snd_wl2: 0,
            rcv_nxt: 0,
            rcv_wnd,
            rcv_ann_wnd: rcv_wnd,
            rcv_ann_right_edge: 0,
            cwnd: mss as u32,
            ssthresh: u32::MAX,
            mss,
            rtt: RttEstimator::new(),
            rto: std::time::Duration::from_secs(1),
            dupacks: 0,
            unsent: VecDeque::new(),
            unacked: VecDeque::new(),
            ooseq: OutOfOrderQueue::new(),
            retransmit_deadline: None,
            persist_deadline: None,
            keepalive_deadline: None,
            time_wait_deadline: None,
            delayed_ack_deadline: None,
            rtx_count: 0,
            persist_backoff: 0,
            keepalive_probes: 0,
            priority: 0,
            flags: TcpFlags::default(),
            callbacks: TcpCallbacks::default(),
            snd_wscale: 0,
            rcv_wscale: 0,
            ts_enabled: false,
            ts_recent: 0,
        }
    }

    pub fn in_flight(&self) -> u32 {
        self.snd_nxt.wrapping_sub(self.snd_una)
    }

    pub fn usable_window(&self) -> u32 {
        self.cwnd.min(self.snd_wnd).saturating_sub(self.in_flight())
    }

    /// Appends `data` to `unsent`, coalescing into the tail segment up to `mss` when it's still
    /// open for more data (no control flags, room left).
    pub fn enqueue_write(&mut self, data: &[u8], push: bool) {
        let mss = self.mss as usize;
        let mut offset = 0;
        if let Some(last) = self.unsent.back_mut() {
            if !last.syn && !last.fin && last.data.len() < mss {
                let room = mss - last.data.len();
                let take = room.min(data.len());
                last.data.extend_from_slice(&data[..take]);
                last.push = push && take == data.len();
                offset = take;
            }
        }
        let next_seq = self
            .unsent
            .back()
            .map(Segment::end)
            .unwrap_or(self.snd_nxt.wrapping_add(self.in_unsent_len()));

        let mut seq = next_seq;
        while offset < data.len() {
            let take = mss.min(data.len() - offset);
            let chunk = data[offset..offset + take].to_vec();
            let is_last = offset + take == data.len();
            self.unsent.push_back(Segment {
                seq,
                data: chunk,
                syn: false,
                fin: false,
                push: push && is_last,
                rtx_count: 0,
                first_sent: None,
            });
            seq = seq.wrapping_add(take as u32);
            offset += take;
        }
    }

    fn in_unsent_len(&self) -> u32 {
        self.unsent.iter().map(|s| s.seq_len()).sum()
    }

    pub fn enqueue_fin(&mut self) {
        let seq = self
            .unsent
            .back()
            .map(Segment::end)
            .unwrap_or(self.snd_nxt.wrapping_add(self.in_unsent_len()));
        self.unsent.push_back(Segment {
            seq,
            data: Vec::new(),
            syn: false,
            fin: true,
            push: true,
            rtx_count: 0,
            first_sent: None,
        });
    }
}
