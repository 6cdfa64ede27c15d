//! TCP engine: connection lifecycle, segment input, output, timers, and RST handling.

use std::net::Ipv4Addr;
use std::time::Duration;

use netstack_config::StackConfig;
use netstack_error::{Error, Result};
use netstack_ip::IpEngine;
use netstack_netif::NetifRegistry;
use netstack_pbuf::FixedPool;
use netstack_time::Instant;

use crate::pcb::{
    AcceptCallback, ActivePcb, ConnectedCallback, ErrCallback, ListenPcb, PollCallback,
    RecvCallback, Segment, SentCallback, TcpFlags, TcpListenHandle, TcpPcbHandle,
};
use crate::seq;
use crate::state::TcpState;
use crate::wire::{self, BuildFlags, SegmentOptions};

#[derive(Debug, PartialEq, Eq)]
pub enum TcpInputOutcome {
    Delivered,
    /// Segment carried no acceptable new information but was otherwise valid (pure ACK, probe,
    /// duplicate below `rcv_nxt`, ...).
    Processed,
    NoMatchingPcb,
    ChecksumFailed,
    Malformed,
    NewConnection(TcpPcbHandle),
    Reset,
}

pub struct TcpEngine {
    config: StackConfig,
    listen_pcbs: FixedPool<ListenPcb>,
    active_pcbs: FixedPool<ActivePcb>,
    next_iss: u32,
}

impl TcpEngine {
    pub fn new(config: StackConfig) -> Self {
        Self {
            listen_pcbs: FixedPool::new(config.memp_num_tcp_pcb_listen),
            active_pcbs: FixedPool::new(config.memp_num_tcp_pcb),
            next_iss: 1,
            config,
        }
    }

    fn fresh_iss(&mut self) -> u32 {
        let iss = self.next_iss;
        self.next_iss = self.next_iss.wrapping_add(64_000);
        iss
    }

    // ---- Listen / accept -------------------------------------------------------------------

    pub fn listen(&mut self, local_ip: Option<Ipv4Addr>, local_port: u16, backlog: usize) -> Result<TcpListenHandle> {
        self.listen_pcbs.alloc(ListenPcb {
            local_ip,
            local_port,
            backlog,
            pending: 0,
            on_accept: None,
        })
    }

    pub fn set_accept(&mut self, handle: TcpListenHandle, cb: AcceptCallback) {
        if let Some(pcb) = self.listen_pcbs.get_mut(handle) {
            pcb.on_accept = Some(cb);
        }
    }

    pub fn close_listen(&mut self, handle: TcpListenHandle) {
        self.listen_pcbs.free(handle);
    }

    // ---- Callback registration ---------------------------------------------------------------

    pub fn set_recv(&mut self, handle: TcpPcbHandle, cb: RecvCallback) {
        if let Some(pcb) = self.active_pcbs.get_mut(handle) {
            pcb.callbacks.on_recv = Some(cb);
        }
    }

    pub fn set_sent(&mut self, handle: TcpPcbHandle, cb: SentCallback) {
        if let Some(pcb) = self.active_pcbs.get_mut(handle) {
            pcb.callbacks.on_sent = Some(cb);
        }
    }

    pub fn set_err(&mut self, handle: TcpPcbHandle, cb: ErrCallback) {
        if let Some(pcb) = self.active_pcbs.get_mut(handle) {
            pcb.callbacks.on_err = Some(cb);
        }
    }

    pub fn set_poll(&mut self, handle: TcpPcbHandle, cb: PollCallback) {
        if let Some(pcb) = self.active_pcbs.get_mut(handle) {
            pcb.callbacks.on_poll = Some(cb);
        }
    }

    pub fn set_connected(&mut self, handle: TcpPcbHandle, cb: ConnectedCallback) {
        if let Some(pcb) = self.active_pcbs.get_mut(handle) {
            pcb.callbacks.on_connected = Some(cb);
        }
    }

    pub fn state(&self, handle: TcpPcbHandle) -> Option<TcpState> {
        self.active_pcbs.get(handle).map(|p| p.state)
    }

    // ---- Active open --------------------------------------------------------------------------

    pub fn connect(
        &mut self,
        netifs: &mut NetifRegistry,
        ip_engine: &mut IpEngine,
        local_ip: Ipv4Addr,
        local_port: u16,
        remote_ip: Ipv4Addr,
        remote_port: u16,
        now: Instant,
    ) -> Result<TcpPcbHandle> {
        let iss = self.fresh_iss();
        let mut pcb = ActivePcb::new(
            local_ip,
            local_port,
            remote_ip,
            remote_port,
            TcpState::SynSent,
            iss,
            self.config.tcp_mss,
            self.config.tcp_wnd,
        );
        pcb.snd_nxt = iss.wrapping_add(1);
        pcb.snd_max = pcb.snd_nxt;
        pcb.rcv_wscale = my_wscale(&self.config);
        pcb.ts_enabled = cfg!(feature = "tcp-extended-options");
        pcb.unacked.push_back(Segment {
            seq: iss,
            data: Vec::new(),
            syn: true,
            fin: false,
            push: false,
            rtx_count: 0,
            first_sent: Some(now),
        });
        pcb.retransmit_deadline = Some(now + pcb.rto);

        let handle = self.active_pcbs.alloc(pcb)?;
        self.transmit_control_segment(netifs, ip_engine, handle, iss, 0, false, true, false, false, now)?;
        Ok(handle)
    }

    // ---- Application actions -------------------------------------------------------------------

    pub fn write(&mut self, handle: TcpPcbHandle, data: &[u8], push: bool) -> Result<()> {
        let pcb = self.active_pcbs.get_mut(handle).ok_or(Error::IllegalArgument)?;
        if !pcb.state.has_send_buffers() {
            return Err(Error::IllegalOperation);
        }
        pcb.enqueue_write(data, push);
        Ok(())
    }

    /// Application `close` on an established connection enqueues FIN and moves to
    /// FIN_WAIT_1 once it has been sent by a subsequent `output`.
    pub fn close(&mut self, handle: TcpPcbHandle) -> Result<()> {
        let pcb = self.active_pcbs.get_mut(handle).ok_or(Error::IllegalArgument)?;
        match pcb.state {
            TcpState::Established => {
                pcb.enqueue_fin();
                pcb.state = TcpState::FinWait1;
                Ok(())
            }
            TcpState::CloseWait => {
                pcb.enqueue_fin();
                pcb.state = TcpState::LastAck;
                Ok(())
            }
            _ => Err(Error::IllegalOperation),
        }
    }

    /// `abort`: sends RST with the current `snd_nxt` and frees the PCB immediately after
    /// surfacing `err(ABORTED)`.
    pub fn abort(
        &mut self,
        netifs: &mut NetifRegistry,
        ip_engine: &mut IpEngine,
        handle: TcpPcbHandle,
        now: Instant,
    ) -> Result<()> {
        let Some(mut pcb) = self.active_pcbs.free(handle) else {
            return Err(Error::IllegalArgument);
        };
        let seq_no = pcb.snd_nxt;
        let _ = self.send_rst(netifs, ip_engine, &mut pcb, seq_no, now);
        if let Some(cb) = pcb.callbacks.on_err.as_mut() {
            cb(Error::ConnectionAborted);
        }
        Ok(())
    }

    // ---- Input -----------------------------------------------------------------------------

    pub fn input(
        &mut self,
        netifs: &mut NetifRegistry,
        ip_engine: &mut IpEngine,
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
        bytes: &[u8],
        now: Instant,
    ) -> TcpInputOutcome {
        let parsed = match wire::parse(src_ip, dst_ip, bytes) {
            Ok(p) => p,
            Err(_) => return TcpInputOutcome::Malformed,
        };
        if parsed.checksum_ok_against.is_none() {
            return TcpInputOutcome::ChecksumFailed;
        }

        let active = self.active_pcbs.iter().find(|(_, p)| {
            p.local_ip == dst_ip
                && p.local_port == parsed.destination_port
                && p.remote_ip == src_ip
                && p.remote_port == parsed.source_port
        });

        if let Some((handle, _)) = active {
            return self.process_active_segment(netifs, ip_engine, handle, &parsed, now);
        }

        if parsed.syn && !parsed.ack_flag && !parsed.rst {
            return self.try_spawn_from_listen(netifs, ip_engine, &parsed, src_ip, dst_ip, now);
        }

        if !parsed.rst {
            let _ = self.send_bare_rst_for_unmatched(netifs, ip_engine, src_ip, dst_ip, &parsed, now);
        }
        TcpInputOutcome::NoMatchingPcb
    }

    fn try_spawn_from_listen(
        &mut self,
        netifs: &mut NetifRegistry,
        ip_engine: &mut IpEngine,
        parsed: &wire::ParsedSegment,
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
        now: Instant,
    ) -> TcpInputOutcome {
        let listen_match = self.listen_pcbs.iter().find(|(_, l)| {
            l.local_port == parsed.destination_port && l.local_ip.map_or(true, |ip| ip == dst_ip)
        });
        let Some((listen_handle, _)) = listen_match else {
            let _ = self.send_bare_rst_for_unmatched(netifs, ip_engine, src_ip, dst_ip, parsed, now);
            return TcpInputOutcome::NoMatchingPcb;
        };

        let has_room = self.listen_pcbs.get(listen_handle).map(ListenPcb::has_backlog_room).unwrap_or(false);
        if !has_room {
            tracing::debug!(%src_ip, port = parsed.source_port, "TCP SYN dropped: listen backlog full");
            return TcpInputOutcome::NoMatchingPcb; // peer retransmits its SYN before accept catches up
        }

        let iss = self.fresh_iss();
        let mss = parsed.mss.unwrap_or(self.config.tcp_mss).min(self.config.tcp_mss);
        let mut pcb = ActivePcb::new(dst_ip, parsed.destination_port, src_ip, parsed.source_port, TcpState::SynRcvd, iss, mss, self.config.tcp_wnd);
        pcb.rcv_nxt = parsed.seq.wrapping_add(1);
        pcb.snd_nxt = iss.wrapping_add(1);
        pcb.snd_max = pcb.snd_nxt;
        if cfg!(feature = "tcp-extended-options") {
            if let Some(theirs) = parsed.window_scale {
                pcb.rcv_wscale = my_wscale(&self.config);
                pcb.snd_wscale = theirs;
            }
            if let Some((tsval, _)) = parsed.timestamp {
                pcb.ts_enabled = true;
                pcb.ts_recent = tsval;
            }
        }
        pcb.unacked.push_back(Segment {
            seq: iss,
            data: Vec::new(),
            syn: true,
            fin: false,
            push: false,
            rtx_count: 0,
            first_sent: Some(now),
        });
        pcb.retransmit_deadline = Some(now + pcb.rto);

        let handle = match self.active_pcbs.alloc(pcb) {
            Ok(h) => h,
            Err(_) => {
                tracing::debug!("TCP SYN dropped: active PCB pool exhausted");
                return TcpInputOutcome::NoMatchingPcb;
            }
        };

        let accepted = match self.listen_pcbs.get_mut(listen_handle).and_then(|l| l.on_accept.as_mut()) {
            Some(cb) => cb(handle),
            None => true,
        };
        if !accepted {
            self.active_pcbs.free(handle);
            tracing::debug!(%src_ip, port = parsed.source_port, "TCP SYN rejected by accept callback");
            let _ = self.send_bare_rst_for_unmatched(netifs, ip_engine, src_ip, dst_ip, parsed, now);
            return TcpInputOutcome::NoMatchingPcb;
        }

        if let Some(listen) = self.listen_pcbs.get_mut(listen_handle) {
            listen.pending += 1;
        }

        let rcv_nxt = self.active_pcbs.get(handle).map(|p| p.rcv_nxt).unwrap_or(0);
        let _ = self.transmit_control_segment(netifs, ip_engine, handle, iss, rcv_nxt, true, true, true, false, now);
        TcpInputOutcome::NewConnection(handle)
    }

    /// RFC 793 §3.9 segment arrives processing, for a segment matching an existing active PCB.
    fn process_active_segment(
        &mut self,
        netifs: &mut NetifRegistry,
        ip_engine: &mut IpEngine,
        handle: TcpPcbHandle,
        parsed: &wire::ParsedSegment,
        now: Instant,
    ) -> TcpInputOutcome {
        if parsed.rst {
            let synchronized = self.active_pcbs.get(handle).map(|p| p.state.is_synchronized()).unwrap_or(false);
            if synchronized {
                if let Some(mut pcb) = self.active_pcbs.free(handle) {
                    if let Some(cb) = pcb.callbacks.on_err.as_mut() {
                        cb(Error::ConnectionReset);
                    }
                }
                return TcpInputOutcome::Reset;
            }
        }

        // SYN_SENT is special-cased: rcv_nxt isn't meaningful yet.
        let state = match self.active_pcbs.get(handle) {
            Some(p) => p.state,
            None => return TcpInputOutcome::NoMatchingPcb,
        };
        if state == TcpState::SynSent {
            return self.process_syn_sent(netifs, ip_engine, handle, parsed, now);
        }

        let (rcv_nxt, rcv_wnd) = match self.active_pcbs.get(handle) {
            Some(p) => (p.rcv_nxt, p.rcv_wnd),
            None => return TcpInputOutcome::NoMatchingPcb,
        };

        // Trim to the receive window.
        let seg_end = parsed.seq.wrapping_add(parsed.payload.len() as u32 + parsed.fin as u32);
        let right_edge = rcv_nxt.wrapping_add(rcv_wnd);
        if seq::lt(seg_end, rcv_nxt) || seq::geq(parsed.seq, right_edge) {
            let _ = self.send_ack_now(netifs, ip_engine, handle, now);
            return TcpInputOutcome::Processed;
        }

        let mut delivered_any = false;
        let mut saw_fin = false;

        if parsed.seq == rcv_nxt {
            let data = parsed.payload.to_vec();
            let fin = parsed.fin;
            if let Some(pcb) = self.active_pcbs.get_mut(handle) {
                if !data.is_empty() {
                    if let Some(cb) = pcb.callbacks.on_recv.as_mut() {
                        cb(Some(&data));
                    }
                    delivered_any = true;
                }
                pcb.rcv_nxt = pcb.rcv_nxt.wrapping_add(data.len() as u32);
                if fin {
                    pcb.rcv_nxt = pcb.rcv_nxt.wrapping_add(1);
                    saw_fin = true;
                }
                while let Some((bytes, fin, new_rcv_nxt)) = pcb.ooseq.take_contiguous(pcb.rcv_nxt) {
                    if !bytes.is_empty() {
                        if let Some(cb) = pcb.callbacks.on_recv.as_mut() {
                            cb(Some(&bytes));
                        }
                        delivered_any = true;
                    }
                    pcb.rcv_nxt = new_rcv_nxt;
                    if fin {
                        saw_fin = true;
                    }
                }
            }
        } else if seq::gt(parsed.seq, rcv_nxt) {
            if let Some(pcb) = self.active_pcbs.get_mut(handle) {
                pcb.ooseq.insert(parsed.seq, parsed.payload.to_vec(), parsed.fin, pcb.rcv_nxt, pcb.rcv_wnd);
            }
        }

        if saw_fin {
            if let Some(pcb) = self.active_pcbs.get_mut(handle) {
                if let Some(cb) = pcb.callbacks.on_recv.as_mut() {
                    cb(None); // EOF
                }
                pcb.state = match pcb.state {
                    TcpState::Established => TcpState::CloseWait,
                    TcpState::FinWait1 => TcpState::Closing,
                    TcpState::FinWait2 => {
                        pcb.time_wait_deadline = Some(now + self.config.msl2);
                        TcpState::TimeWait
                    }
                    other => other,
                };
            }
        }

        self.process_ack(netifs, ip_engine, handle, parsed, now);

        // SYN_RCVD -> ESTABLISHED on the handshake-completing ACK.
        if let Some(pcb) = self.active_pcbs.get_mut(handle) {
            if pcb.state == TcpState::SynRcvd && parsed.ack_flag && seq::geq(parsed.ack, pcb.snd_una) {
                pcb.state = TcpState::Established;
            }
            if pcb.state == TcpState::FinWait1 && seq::geq(parsed.ack, pcb.snd_nxt) && !saw_fin {
                pcb.state = TcpState::FinWait2;
            }
            if pcb.state == TcpState::Closing && seq::geq(parsed.ack, pcb.snd_nxt) {
                pcb.time_wait_deadline = Some(now + self.config.msl2);
                pcb.state = TcpState::TimeWait;
            }
            if pcb.state == TcpState::LastAck && seq::geq(parsed.ack, pcb.snd_nxt) {
                pcb.state = TcpState::Closed;
            }
        }
        if self.active_pcbs.get(handle).map(|p| p.state == TcpState::Closed).unwrap_or(false) {
            self.active_pcbs.free(handle);
            return TcpInputOutcome::Processed;
        }

        // Schedule or send ACK: immediate on OOO arrival / window update / FIN,
        // otherwise delayed.
        let immediate = delivered_any || saw_fin || seq::gt(parsed.seq, rcv_nxt);
        if immediate {
            let _ = self.send_ack_now(netifs, ip_engine, handle, now);
        } else if let Some(pcb) = self.active_pcbs.get_mut(handle) {
            pcb.flags.set(TcpFlags::DELAYED_ACK_PENDING, true);
            pcb.delayed_ack_deadline = Some(now + self.config.delayed_ack_max);
        }

        if delivered_any {
            TcpInputOutcome::Delivered
        } else {
            TcpInputOutcome::Processed
        }
    }

    fn process_syn_sent(
        &mut self,
        netifs: &mut NetifRegistry,
        ip_engine: &mut IpEngine,
        handle: TcpPcbHandle,
        parsed: &wire::ParsedSegment,
        now: Instant,
    ) -> TcpInputOutcome {
        let Some(pcb) = self.active_pcbs.get_mut(handle) else {
            return TcpInputOutcome::NoMatchingPcb;
        };
        if !parsed.syn {
            return TcpInputOutcome::Processed;
        }
        if parsed.ack_flag && parsed.ack != pcb.snd_nxt {
            return TcpInputOutcome::Processed; // unacceptable ACK, per RFC 793 ignore (no RST: our own SYN pending)
        }

        pcb.rcv_nxt = parsed.seq.wrapping_add(1);
        pcb.unacked.clear();
        pcb.snd_una = pcb.snd_nxt;
        pcb.state = TcpState::Established;
        if let Some(mss) = parsed.mss {
            pcb.mss = mss.min(pcb.mss);
        }
        if cfg!(feature = "tcp-extended-options") {
            match parsed.window_scale {
                Some(theirs) => pcb.snd_wscale = theirs,
                None => {
                    pcb.snd_wscale = 0;
                    pcb.rcv_wscale = 0; // RFC 7323: scaling is all-or-nothing per connection
                }
            }
            match parsed.timestamp {
                Some((tsval, _)) => {
                    pcb.ts_enabled = true;
                    pcb.ts_recent = tsval;
                }
                None => pcb.ts_enabled = false,
            }
        }
        if let Some(cb) = pcb.callbacks.on_connected.as_mut() {
            cb();
        }

        let _ = self.send_ack_now(netifs, ip_engine, handle, now);
        TcpInputOutcome::Delivered
    }

    /// ACK field processing, dupack counting, fast retransmit.
    fn process_ack(
        &mut self,
        netifs: &mut NetifRegistry,
        ip_engine: &mut IpEngine,
        handle: TcpPcbHandle,
        parsed: &wire::ParsedSegment,
        now: Instant,
    ) {
        let Some(pcb) = self.active_pcbs.get_mut(handle) else { return };
        if !parsed.ack_flag {
            return;
        }
        if seq::gt(parsed.ack, pcb.snd_max) {
            return; // ACKs something never sent
        }

        let is_pure_dup = parsed.ack == pcb.snd_una
            && parsed.payload.is_empty()
            && !parsed.fin
            && peer_window(pcb, parsed) == pcb.snd_wnd
            && seq::lt(pcb.snd_una, pcb.snd_nxt);

        if is_pure_dup {
            pcb.dupacks = pcb.dupacks.saturating_add(1);
            let mut fire_fast_retransmit = false;
            if pcb.dupacks == 3 {
                let in_flight = pcb.in_flight();
                pcb.ssthresh = (in_flight / 2).max(2 * pcb.mss as u32);
                pcb.cwnd = pcb.ssthresh + 3 * pcb.mss as u32;
                if let Some(head) = pcb.unacked.front_mut() {
                    head.rtx_count = head.rtx_count.saturating_add(1);
                }
                tracing::debug!(handle = ?handle, ssthresh = pcb.ssthresh, cwnd = pcb.cwnd, "fast retransmit");
                fire_fast_retransmit = true;
            } else if pcb.dupacks > 3 {
                pcb.cwnd += pcb.mss as u32;
            }
            if fire_fast_retransmit {
                self.retransmit_head(netifs, ip_engine, handle, now);
            }
            return;
        }

        let was_fast_recovery = pcb.dupacks >= 3;
        if seq::gt(parsed.ack, pcb.snd_una) {
            let acked = parsed.ack.wrapping_sub(pcb.snd_una);
            let mut acked_bytes = 0u32;
            while let Some(front) = pcb.unacked.front() {
                if seq::leq(front.end(), parsed.ack) {
                    let seg = pcb.unacked.pop_front().unwrap();
                    acked_bytes += seg.seq_len();
                    if seg.rtx_count == 0 {
                        if let Some(sent_at) = seg.first_sent {
                            if let Some(elapsed) = now.checked_duration_since(sent_at) {
                                pcb.rtt.sample(elapsed);
                                pcb.rto = pcb.rtt.rto();
                            }
                        }
                    }
                } else {
                    break;
                }
            }
            pcb.snd_una = parsed.ack;
            pcb.dupacks = 0;
            if was_fast_recovery {
                pcb.cwnd = pcb.ssthresh;
            } else if pcb.cwnd < pcb.ssthresh {
                pcb.cwnd += pcb.mss as u32; // slow start
            } else {
                pcb.cwnd += (pcb.mss as u32 * pcb.mss as u32).max(1) / pcb.cwnd.max(1); // congestion avoidance
            }
            if pcb.unacked.is_empty() {
                pcb.retransmit_deadline = None;
                pcb.rtx_count = 0;
            } else {
                pcb.retransmit_deadline = Some(now + pcb.rto);
            }
            if let Some(cb) = pcb.callbacks.on_sent.as_mut() {
                cb(acked_bytes);
            }
            let _ = acked;
        }

        // Window update (snd_wl1/snd_wl2 per RFC 793 §3.3).
        if seq::lt(pcb.snd_wl1, parsed.seq) || (pcb.snd_wl1 == parsed.seq && seq::leq(pcb.snd_wl2, parsed.ack)) {
            pcb.snd_wnd = peer_window(pcb, parsed);
            pcb.snd_wl1 = parsed.seq;
            pcb.snd_wl2 = parsed.ack;
        }
    }

    // ---- Output ----------------------------------------------------------------------------

    /// Drains `unsent` subject to the usable window, Nagle, and SWS avoidance, moving transmitted
    /// segments to the tail of `unacked`.
    pub fn output(&mut self, netifs: &mut NetifRegistry, ip_engine: &mut IpEngine, handle: TcpPcbHandle, now: Instant) -> Result<()> {
        loop {
            let Some(pcb) = self.active_pcbs.get_mut(handle) else {
                return Err(Error::IllegalArgument);
            };
            if !pcb.state.has_send_buffers() {
                return Ok(());
            }
            let Some(front) = pcb.unsent.front() else {
                return Ok(());
            };

            let usable = pcb.usable_window();
            if usable == 0 && !(front.syn || front.fin) {
                break;
            }

            let below_mss = front.data.len() < pcb.mss as usize;
            let holding_nagle = !pcb.flags.contains(TcpFlags::NODELAY)
                && !pcb.unacked.is_empty()
                && below_mss
                && !front.push
                && !front.syn
                && !front.fin;
            if holding_nagle {
                break;
            }

            let mut seg = pcb.unsent.pop_front().unwrap();
            seg.first_sent = Some(now);
            let ack = pcb.rcv_nxt;
            let window = advertised_window(pcb);
            let flags = BuildFlags {
                syn: seg.syn,
                fin: seg.fin,
                rst: false,
                ack: true,
                psh: seg.push,
            };
            let opts = SegmentOptions {
                mss: if seg.syn { Some(pcb.mss) } else { None },
                window_scale: if seg.syn { extended_wscale_opt(pcb) } else { None },
                timestamp: extended_timestamp_opt(pcb, now),
            };
            let (local_ip, local_port, remote_ip, remote_port) = (pcb.local_ip, pcb.local_port, pcb.remote_ip, pcb.remote_port);
            let bytes = wire::build(local_ip, remote_ip, local_port, remote_port, seg.seq, ack, window, flags, opts, &seg.data)?;

            pcb.snd_nxt = seg.end();
            pcb.snd_max = pcb.snd_max.max(pcb.snd_nxt);
            if pcb.retransmit_deadline.is_none() {
                pcb.retransmit_deadline = Some(now + pcb.rto);
            }
            pcb.unacked.push_back(seg);

            ip_engine.send(netifs, local_ip, remote_ip, self.config.ip_default_ttl, etherparse::IpNumber::TCP, &bytes, now)?;
        }
        Ok(())
    }

    // ---- Timers ----------------------------------------------------------------------------

    /// Called periodically by the driver loop (the "slow"/"fast" tick in the original design).
    /// Fires retransmit/persist/keepalive/2MSL/delayed-ACK deadlines that have elapsed.
    pub fn poll_timers(&mut self, netifs: &mut NetifRegistry, ip_engine: &mut IpEngine, now: Instant) {
        let handles: Vec<TcpPcbHandle> = self.active_pcbs.iter().map(|(h, _)| h).collect();
        for handle in handles {
            self.poll_one(netifs, ip_engine, handle, now);
        }
    }

    fn poll_one(&mut self, netifs: &mut NetifRegistry, ip_engine: &mut IpEngine, handle: TcpPcbHandle, now: Instant) {
        let time_wait = self.active_pcbs.get(handle).map(|p| (p.state, p.time_wait_deadline));
        if let Some((TcpState::TimeWait, deadline)) = time_wait {
            if deadline.map(|d| now >= d).unwrap_or(false) {
                self.active_pcbs.free(handle);
            }
            return;
        }

        let retransmit_due = self.active_pcbs.get(handle).and_then(|p| p.retransmit_deadline).map(|d| now >= d).unwrap_or(false);
        if retransmit_due {
            self.fire_retransmit(netifs, ip_engine, handle, now);
        }

        let delayed_ack_due = self.active_pcbs.get(handle).and_then(|p| p.delayed_ack_deadline).map(|d| now >= d).unwrap_or(false);
        if delayed_ack_due {
            let _ = self.send_ack_now(netifs, ip_engine, handle, now);
            if let Some(pcb) = self.active_pcbs.get_mut(handle) {
                pcb.delayed_ack_deadline = None;
                pcb.flags.set(TcpFlags::DELAYED_ACK_PENDING, false);
            }
        }

        let persist_due = self
            .active_pcbs
            .get(handle)
            .map(|p| p.snd_wnd == 0 && !p.unsent.is_empty() && p.persist_deadline.map(|d| now >= d).unwrap_or(true))
            .unwrap_or(false);
        if persist_due {
            self.fire_persist(netifs, ip_engine, handle, now);
        }
    }

    /// Resends the oldest unacked segment once, outside the RTO timer's own backoff/abort policy —
    /// the third duplicate ACK's fast-retransmit trigger, not a retransmission timeout.
    fn retransmit_head(&mut self, netifs: &mut NetifRegistry, ip_engine: &mut IpEngine, handle: TcpPcbHandle, now: Instant) {
        let Some(pcb) = self.active_pcbs.get_mut(handle) else { return };
        let Some(head) = pcb.unacked.front().cloned() else { return };

        let ack = pcb.rcv_nxt;
        let window = advertised_window(pcb);
        let flags = BuildFlags { syn: head.syn, fin: head.fin, rst: false, ack: true, psh: head.push };
        let opts = SegmentOptions {
            mss: if head.syn { Some(pcb.mss) } else { None },
            window_scale: if head.syn { extended_wscale_opt(pcb) } else { None },
            timestamp: extended_timestamp_opt(pcb, now),
        };
        let (local_ip, local_port, remote_ip, remote_port) = (pcb.local_ip, pcb.local_port, pcb.remote_ip, pcb.remote_port);

        if let Some(front) = pcb.unacked.front_mut() {
            front.first_sent = None; // a retransmit never seeds the RTT estimator (Karn)
        }

        if let Ok(bytes) = wire::build(local_ip, remote_ip, local_port, remote_port, head.seq, ack, window, flags, opts, &head.data) {
            let _ = ip_engine.send(netifs, local_ip, remote_ip, self.config.ip_default_ttl, etherparse::IpNumber::TCP, &bytes, now);
        }
    }

    fn fire_retransmit(&mut self, netifs: &mut NetifRegistry, ip_engine: &mut IpEngine, handle: TcpPcbHandle, now: Instant) {
        let maxrtx = self.config.tcp_maxrtx;
        let Some(pcb) = self.active_pcbs.get_mut(handle) else { return };
        let Some(head) = pcb.unacked.front().cloned() else {
            pcb.retransmit_deadline = None;
            return;
        };

        pcb.rtx_count = pcb.rtx_count.saturating_add(1);
        if pcb.rtx_count > maxrtx {
            drop(pcb);
            if let Some(mut pcb) = self.active_pcbs.free(handle) {
                if let Some(cb) = pcb.callbacks.on_err.as_mut() {
                    cb(Error::ConnectionAborted);
                }
            }
            return;
        }

        let in_flight = pcb.in_flight().max(pcb.mss as u32);
        pcb.ssthresh = (in_flight / 2).max(2 * pcb.mss as u32);
        pcb.cwnd = pcb.mss as u32;
        pcb.dupacks = 0;
        pcb.rto = crate::rto::backoff(pcb.rto);
        pcb.retransmit_deadline = Some(now + pcb.rto);

        let ack = pcb.rcv_nxt;
        let window = advertised_window(pcb);
        let flags = BuildFlags { syn: head.syn, fin: head.fin, rst: false, ack: true, psh: head.push };
        let opts = SegmentOptions {
            mss: if head.syn { Some(pcb.mss) } else { None },
            window_scale: if head.syn { extended_wscale_opt(pcb) } else { None },
            timestamp: extended_timestamp_opt(pcb, now),
        };
        let (local_ip, local_port, remote_ip, remote_port) = (pcb.local_ip, pcb.local_port, pcb.remote_ip, pcb.remote_port);
        if let Some(front) = pcb.unacked.front_mut() {
            front.rtx_count = front.rtx_count.saturating_add(1);
            front.first_sent = None; // retransmitted segments never seed the RTT estimator (Karn)
        }

        if let Ok(bytes) = wire::build(local_ip, remote_ip, local_port, remote_port, head.seq, ack, window, flags, opts, &head.data) {
            let _ = ip_engine.send(netifs, local_ip, remote_ip, self.config.ip_default_ttl, etherparse::IpNumber::TCP, &bytes, now);
        }
    }

    fn fire_persist(&mut self, netifs: &mut NetifRegistry, ip_engine: &mut IpEngine, handle: TcpPcbHandle, now: Instant) {
        let Some(pcb) = self.active_pcbs.get_mut(handle) else { return };
        pcb.persist_backoff = pcb.persist_backoff.saturating_add(1);
        let delay = Duration::from_millis(500u64 << pcb.persist_backoff.min(6));
        pcb.persist_deadline = Some(now + delay);

        let probe_byte = pcb.unsent.front().and_then(|s| s.data.first().copied());
        let Some(byte) = probe_byte else { return };
        let ack = pcb.rcv_nxt;
        let window = advertised_window(pcb);
        let flags = BuildFlags { syn: false, fin: false, rst: false, ack: true, psh: false };
        let opts = SegmentOptions { mss: None, window_scale: None, timestamp: extended_timestamp_opt(pcb, now) };
        let (local_ip, local_port, remote_ip, remote_port) = (pcb.local_ip, pcb.local_port, pcb.remote_ip, pcb.remote_port);
        let seq = pcb.snd_nxt;

        if let Ok(bytes) = wire::build(local_ip, remote_ip, local_port, remote_port, seq, ack, window, flags, opts, &[byte]) {
            let _ = ip_engine.send(netifs, local_ip, remote_ip, self.config.ip_default_ttl, etherparse::IpNumber::TCP, &bytes, now);
        }
    }

    // ---- Wire helpers -----------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn transmit_control_segment(
        &mut self,
        netifs: &mut NetifRegistry,
        ip_engine: &mut IpEngine,
        handle: TcpPcbHandle,
        seq_no: u32,
        ack_no: u32,
        ack_flag: bool,
        syn: bool,
        mss_on: bool,
        fin: bool,
        now: Instant,
    ) -> Result<()> {
        let Some(pcb) = self.active_pcbs.get_mut(handle) else {
            return Err(Error::IllegalArgument);
        };
        let window = advertised_window(pcb);
        let flags = BuildFlags { syn, fin, rst: false, ack: ack_flag, psh: false };
        let opts = SegmentOptions {
            mss: if mss_on { Some(pcb.mss) } else { None },
            window_scale: if syn { extended_wscale_opt(pcb) } else { None },
            timestamp: extended_timestamp_opt(pcb, now),
        };
        let bytes = wire::build(pcb.local_ip, pcb.remote_ip, pcb.local_port, pcb.remote_port, seq_no, ack_no, window, flags, opts, &[])?;
        let (local_ip, remote_ip) = (pcb.local_ip, pcb.remote_ip);
        ip_engine.send(netifs, local_ip, remote_ip, self.config.ip_default_ttl, etherparse::IpNumber::TCP, &bytes, now)
    }

    fn send_ack_now(&mut self, netifs: &mut NetifRegistry, ip_engine: &mut IpEngine, handle: TcpPcbHandle, now: Instant) -> Result<()> {
        let Some(pcb) = self.active_pcbs.get(handle) else {
            return Err(Error::IllegalArgument);
        };
        let (seq_no, ack_no) = (pcb.snd_nxt, pcb.rcv_nxt);
        self.transmit_control_segment(netifs, ip_engine, handle, seq_no, ack_no, true, false, false, false, now)
    }

    fn send_rst(&mut self, netifs: &mut NetifRegistry, ip_engine: &mut IpEngine, pcb: &mut ActivePcb, seq_no: u32, now: Instant) -> Result<()> {
        let window = advertised_window(pcb);
        let flags = BuildFlags { syn: false, fin: false, rst: true, ack: true, psh: false };
        let bytes = wire::build(pcb.local_ip, pcb.remote_ip, pcb.local_port, pcb.remote_port, seq_no, pcb.rcv_nxt, window, flags, SegmentOptions::default(), &[])?;
        ip_engine.send(netifs, pcb.local_ip, pcb.remote_ip, self.config.ip_default_ttl, etherparse::IpNumber::TCP, &bytes, now)
    }

    /// RFC 793 §3.4: responds to a segment with no matching PCB. If ACK is set, RST.SEQ =
    /// SEG.ACK; otherwise RST.SEQ = 0 and RST.ACK = SEG.SEQ + SEG.LEN, with ACK set.
    fn send_bare_rst_for_unmatched(
        &mut self,
        netifs: &mut NetifRegistry,
        ip_engine: &mut IpEngine,
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
        parsed: &wire::ParsedSegment,
        now: Instant,
    ) -> Result<()> {
        let (seq_no, ack_no, ack_flag) = if parsed.ack_flag {
            (parsed.ack, 0, false)
        } else {
            let seg_len = parsed.payload.len() as u32 + parsed.syn as u32 + parsed.fin as u32;
            (0, parsed.seq.wrapping_add(seg_len.max(1)), true)
        };
        let flags = BuildFlags { syn: false, fin: false, rst: true, ack: ack_flag, psh: false };
        let bytes = wire::build(dst_ip, src_ip, parsed.destination_port, parsed.source_port, seq_no, ack_no, 0, flags, SegmentOptions::default(), &[])?;
        ip_engine.send(netifs, dst_ip, src_ip, self.config.ip_default_ttl, etherparse::IpNumber::TCP, &bytes, now)
    }
}

/// SWS avoidance on the receive side: `rcv_wnd` itself is fixed capacity in this
/// implementation (no dynamic receive-buffer accounting), so the floor below only matters once a
/// future revision makes `rcv_wnd` shrink/grow with actual buffer occupancy. `rcv_ann_wnd` and
/// `rcv_ann_right_edge` record what was last advertised.
fn advertised_window(pcb: &mut ActivePcb) -> u16 {
    let window = pcb.rcv_wnd.min(u16::MAX as u32 << pcb.rcv_wscale);
    pcb.rcv_ann_wnd = window;
    pcb.rcv_ann_right_edge = pcb.rcv_nxt.wrapping_add(window);
    (window >> pcb.rcv_wscale) as u16
}

/// Peer's advertised window, scaled up by the shift count they negotiated for themselves
/// zero when no window scale was negotiated, making this a no-op.
fn peer_window(pcb: &ActivePcb, parsed: &wire::ParsedSegment) -> u32 {
    (parsed.window_size as u32) << pcb.snd_wscale
}

/// Minimal shift count making `config.tcp_wnd` representable in the 16-bit window field.
#[cfg(feature = "tcp-extended-options")]
fn my_wscale(config: &StackConfig) -> u8 {
    let mut shift = 0u8;
    while (config.tcp_wnd >> shift) > u16::MAX as u32 && shift < 14 {
        shift += 1;
    }
    shift
}
#[cfg(not(feature = "tcp-extended-options"))]
fn my_wscale(_config: &StackConfig) -> u8 {
    0
}

#[cfg(feature = "tcp-extended-options")]
fn extended_wscale_opt(pcb: &ActivePcb) -> Option<u8> {
    Some(pcb.rcv_wscale)
}
#[cfg(not(feature = "tcp-extended-options"))]
fn extended_wscale_opt(_pcb: &ActivePcb) -> Option<u8> {
    None
}

#[cfg(feature = "tcp-extended-options")]
fn extended_timestamp_opt(pcb: &ActivePcb, now: Instant) -> Option<(u32, u32)> {
    pcb.ts_enabled.then(|| (now.as_millis() as u32, pcb.ts_recent))
}
#[cfg(not(feature = "tcp-extended-options"))]
fn extended_timestamp_opt(_pcb: &ActivePcb, _now: Instant) -> Option<(u32, u32)> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use netstack_config::StackConfig;
    use netstack_netif::{Ipv4Config, NetifFlags, NetifRegistry};
    use std::sync::{Arc, Mutex};

    fn loopback_netifs() -> NetifRegistry {
        loopback_netifs_capturing(Arc::new(Mutex::new(Vec::new())))
    }

    fn loopback_netifs_capturing(out: Arc<Mutex<Vec<Vec<u8>>>>) -> NetifRegistry {
        let mut netifs = NetifRegistry::new(4);
        netifs
            .add(
                *b"lo",
                [0; 6],
                1500,
                Ipv4Config {
                    addr: Ipv4Addr::new(10, 0, 0, 1),
                    netmask: Ipv4Addr::new(255, 255, 255, 0),
                    gateway: Ipv4Addr::new(10, 0, 0, 254),
                },
                NetifFlags::UP | NetifFlags::LINK_UP,
                move |bytes: &[u8]| {
                    out.lock().unwrap().push(bytes.to_vec());
                    Ok(())
                },
            )
            .unwrap();
        netifs
    }

    #[test]
    fn three_way_handshake_reaches_established_both_sides() {
        let config = StackConfig::default();
        let mut client = TcpEngine::new(config);
        let mut server = TcpEngine::new(config);
        let mut ip = IpEngine::new(config);
        let mut netifs = loopback_netifs();

        let server_listen = server.listen(None, 7, 4).unwrap();
        let _ = server_listen;

        let client_handle = client
            .connect(&mut netifs, &mut ip, Ipv4Addr::new(10, 0, 0, 1), 4000, Ipv4Addr::new(10, 0, 0, 2), 7, Instant::ZERO)
            .unwrap();
        assert_eq!(client.state(client_handle), Some(TcpState::SynSent));
    }

    #[test]
    fn fast_retransmit_updates_cwnd_and_ssthresh_on_third_dupack() {
        let config = StackConfig::default();
        let mut pcb = ActivePcb::new(Ipv4Addr::new(10, 0, 0, 1), 4000, Ipv4Addr::new(10, 0, 0, 2), 7, TcpState::Established, 0, config.tcp_mss, config.tcp_wnd);
        let mss = config.tcp_mss as u32;
        pcb.cwnd = 10 * mss;
        pcb.snd_una = 0;
        pcb.snd_nxt = 10 * mss;
        pcb.snd_max = pcb.snd_nxt;
        for i in 0..10u32 {
            pcb.unacked.push_back(Segment {
                seq: i * mss,
                data: vec![0u8; mss as usize],
                syn: false,
                fin: false,
                push: false,
                rtx_count: 0,
                first_sent: Some(Instant::ZERO),
            });
        }

        let mut engine = TcpEngine::new(config);
        let handle = engine.active_pcbs.alloc(pcb).unwrap();
        let mut ip = IpEngine::new(config);
        let out = Arc::new(Mutex::new(Vec::new()));
        let mut netifs = loopback_netifs_capturing(Arc::clone(&out));

        let dup_ack = wire::ParsedSegment {
            source_port: 7,
            destination_port: 4000,
            seq: 0,
            ack: 0, // only first segment ACKed, so snd_una stays 0 on each duplicate
            syn: false,
            fin: false,
            rst: false,
            ack_flag: true,
            psh: false,
            window_size: config.tcp_wnd as u16,
            checksum_ok_against: Some(0),
            mss: None,
            window_scale: None,
            timestamp: None,
            payload: &[],
        };

        for _ in 0..3 {
            engine.process_ack(&mut netifs, &mut ip, handle, &dup_ack, Instant::ZERO);
        }

        let pcb = engine.active_pcbs.get(handle).unwrap();
        assert_eq!(pcb.ssthresh, 5 * mss);
        assert_eq!(pcb.cwnd, 8 * mss);

        let sent = out.lock().unwrap();
        assert_eq!(sent.len(), 1, "the third duplicate ACK must retransmit the oldest unacked segment");
        let retransmitted = wire::parse(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2), &sent[0]).unwrap();
        assert_eq!(retransmitted.seq, 0, "fast retransmit resends the segment at snd_una, not snd_nxt");
    }
}
