//! The runtime configuration surface.
//!
//! Historically this stack's tunables (`MEM_SIZE`, `PBUF_POOL_SIZE`, `MEMP_NUM_*`, `TCP_*`,
//! `IP_*`, ...) were compile-time `#define`s. Per the redesign flags, they're a single struct
//! here instead, so hosted simulation and tests can exercise more than one configuration in a
//! single binary. `NO_SYS` is the one exception: it stays a Cargo feature (`callback-only`,
//! enabled on the crates that need it) because it changes which types exist, not just their
//! parameters.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackConfig {
    /// `MEM_SIZE`: historical heap arena size in bytes. Informational only here —
    /// this implementation allocates non-pooled memory (PCBs' ancillary buffers, segment
    /// queues) from the ordinary global allocator rather than a fixed arena, so nothing reads
    /// this field back; it's kept so callers porting a configuration over have somewhere to put
    /// the old value instead of it silently vanishing.
    pub mem_size: usize,
    /// `PBUF_POOL_SIZE`: number of pooled pbuf nodes.
    pub pbuf_pool_size: usize,
    /// `PBUF_POOL_BUFSIZE`: payload bytes per pooled pbuf node.
    pub pbuf_pool_bufsize: usize,

    /// `MEMP_NUM_TCP_PCB`: active TCP PCB pool capacity.
    pub memp_num_tcp_pcb: usize,
    /// `MEMP_NUM_TCP_PCB_LISTEN`: listening TCP PCB pool capacity.
    pub memp_num_tcp_pcb_listen: usize,
    /// `MEMP_NUM_TCP_SEG`: TCP segment pool capacity.
    pub memp_num_tcp_seg: usize,
    /// `MEMP_NUM_UDP_PCB`: UDP PCB pool capacity.
    pub memp_num_udp_pcb: usize,
    /// `MEMP_NUM_REASSDATA`: concurrent IP reassembly entries.
    pub memp_num_reassdata: usize,
    /// `MEMP_NUM_NETCONN`: netconn handle pool capacity.
    pub memp_num_netconn: usize,
    /// `MEMP_NUM_SYS_TIMEOUT`: timer pool capacity (informational; the wheel itself is unbounded
    /// in this implementation, matching a `Vec`-backed sorted list rather than a fixed pool).
    pub memp_num_sys_timeout: usize,

    /// `TCP_MSS`: default maximum segment size offered on SYN.
    pub tcp_mss: u16,
    /// `TCP_WND`: default receive window.
    pub tcp_wnd: u32,
    /// `TCP_SND_BUF`: default send buffer size.
    pub tcp_snd_buf: u32,
    /// `TCP_SND_QUEUELEN`: maximum queued unsent segments.
    pub tcp_snd_queuelen: usize,
    /// `TCP_MAXRTX`: max retransmissions for an established connection before aborting.
    pub tcp_maxrtx: u8,
    /// `TCP_SYNMAXRTX`: max retransmissions of a SYN before aborting.
    pub tcp_synmaxrtx: u8,
    /// `TCP_QUEUE_OOSEQ`: whether out-of-order segments are buffered at all.
    pub tcp_queue_ooseq: bool,

    /// `IP_FORWARD`.
    pub ip_forward: bool,
    /// `IP_REASSEMBLY`.
    pub ip_reassembly: bool,
    /// `IP_FRAG`.
    pub ip_frag: bool,
    /// `IP_DEFAULT_TTL`.
    pub ip_default_ttl: u8,
    /// `IP_REASS_MAXAGE`, in "slow tick" units (seconds).
    pub ip_reass_maxage: u32,

    /// Enables ICMP echo replies and error generation in the IP engine.
    pub icmp_enabled: bool,

    /// 2·MSL, the TIME_WAIT linger duration.
    pub msl2: Duration,
    /// Delayed-ACK ceiling: sent within one slow-tick, at most 200ms.
    pub delayed_ack_max: Duration,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            mem_size: 1600 * 16,
            pbuf_pool_size: 16,
            pbuf_pool_bufsize: 1528,

            memp_num_tcp_pcb: 16,
            memp_num_tcp_pcb_listen: 8,
            memp_num_tcp_seg: 64,
            memp_num_udp_pcb: 16,
            memp_num_reassdata: 4,
            memp_num_netconn: 16,
            memp_num_sys_timeout: 16,

            tcp_mss: 536,
            tcp_wnd: 4 * 536,
            tcp_snd_buf: 8 * 536,
            tcp_snd_queuelen: 16,
            tcp_maxrtx: 12,
            tcp_synmaxrtx: 6,
            tcp_queue_ooseq: true,

            ip_forward: false,
            ip_reassembly: true,
            ip_frag: true,
            ip_default_ttl: 64,
            ip_reass_maxage: 15,

            icmp_enabled: true,

            msl2: Duration::from_secs(60),
            delayed_ack_max: Duration::from_millis(200),
        }
    }
}
