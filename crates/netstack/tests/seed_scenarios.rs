//! Cross-crate integration tests, each covering one end-to-end behavior of the stack. Each drives
//! the netif, IP, and transport engines together through the top-level [`netstack::Stack`] driver
//! API, the same way a real caller would, rather than poking at a single crate's internals. Some
//! scenarios are also pinned more precisely by a focused unit test inside the owning crate, where
//! exact PCB fields this crate boundary doesn't expose (cwnd, ssthresh, sequence numbers) need
//! checking; those unit tests are noted alongside the scenario they share.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use etherparse::IpNumber;
use netstack::{Ipv4Config, NetifFlags, NetifHandle, Stack};
use netstack_config::StackConfig;
use netstack_netif::ArpState;
use netstack_tcp::TcpState;
use netstack_time::Instant;

/// A `Stack` with a single loopback-style netif whose `linkoutput` captures frames instead of
/// sending them anywhere; the test drains the queue by hand and feeds frames to whichever
/// `Stack` they're addressed to, standing in for the real link two real hosts would share.
struct Harness {
    stack: Stack,
    netif: NetifHandle,
    out: Arc<Mutex<Vec<Vec<u8>>>>,
}

fn harness(addr: Ipv4Addr, mtu: u16) -> Harness {
    harness_with_flags(addr, mtu, NetifFlags::UP | NetifFlags::LINK_UP)
}

fn harness_with_flags(addr: Ipv4Addr, mtu: u16, flags: NetifFlags) -> Harness {
    let mut stack = Stack::new(StackConfig::default(), 2, Instant::ZERO);
    let out = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&out);
    let netif = stack
        .add_netif(
            *b"tn",
            [0; 6],
            mtu,
            Ipv4Config {
                addr,
                netmask: Ipv4Addr::new(255, 255, 255, 0),
                gateway: addr,
            },
            flags,
            move |frame: &[u8]| {
                sink.lock().unwrap().push(frame.to_vec());
                Ok(())
            },
        )
        .expect("netif registration");
    Harness { stack, netif, out }
}

impl Harness {
    fn drain(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.out.lock().unwrap())
    }
}

/// Relays every frame `from` has queued into `to`'s IP input, as many times as it takes for both
/// sides to stop producing new output — good enough for a fully synchronous, no-loss loopback.
fn pump(a: &mut Harness, b: &mut Harness, now: Instant) {
    for _ in 0..32 {
        let a_out = a.drain();
        let b_out = b.drain();
        if a_out.is_empty() && b_out.is_empty() {
            break;
        }
        for frame in a_out {
            b.stack.handle_rx(b.netif, frame, now);
        }
        for frame in b_out {
            a.stack.handle_rx(a.netif, frame, now);
        }
    }
}

/// TCP echo on port 7, both sides reach CLOSED (i.e. the engine frees their
/// PCB slots) within 2·MSL of close.
#[test]
fn tcp_echo_reaches_closed_within_two_msl() {
    let server_addr = Ipv4Addr::new(10, 0, 0, 1);
    let client_addr = Ipv4Addr::new(10, 0, 0, 2);
    let mut server = harness(server_addr, 1500);
    let mut client = harness(client_addr, 1500);

    let mut now = Instant::ZERO;
    let listen = server.stack.tcp_listen(Some(server_addr), 7, 4).expect("listen");
    let accepted = Arc::new(Mutex::new(None));
    let accepted_clone = Arc::clone(&accepted);
    server.stack.tcp.set_accept(
        listen,
        Box::new(move |child| {
            *accepted_clone.lock().unwrap() = Some(child);
            true
        }),
    );

    let client_handle = client
        .stack
        .tcp_connect(client_addr, 49_152, server_addr, 7, now)
        .expect("connect");

    pump(&mut client, &mut server, now);

    let server_handle = accepted.lock().unwrap().expect("server accepted a child pcb");

    assert_eq!(client.stack.tcp.state(client_handle), Some(TcpState::Established));
    assert_eq!(server.stack.tcp.state(server_handle), Some(TcpState::Established));

    let echoed = Arc::new(Mutex::new(Vec::new()));
    let echoed_clone = Arc::clone(&echoed);
    server.stack.tcp.set_recv(
        server_handle,
        Box::new(move |data| {
            if let Some(bytes) = data {
                echoed_clone.lock().unwrap().extend_from_slice(bytes);
            }
        }),
    );

    client.stack.tcp.write(client_handle, b"hello", true).expect("write");
    client.stack.tcp_output(client_handle, now).expect("output");
    pump(&mut client, &mut server, now);

    server.stack.tcp.write(server_handle, &echoed.lock().unwrap(), true).expect("echo write");
    server.stack.tcp_output(server_handle, now).expect("echo output");
    pump(&mut server, &mut client, now);

    client.stack.tcp_close(client_handle, now).expect("client close");
    pump(&mut client, &mut server, now);
    server.stack.tcp_close(server_handle, now).expect("server close");
    pump(&mut server, &mut client, now);

    now = now + Duration::from_secs(121);
    client.stack.handle_timeout(now);
    server.stack.handle_timeout(now);
    pump(&mut client, &mut server, now);
    pump(&mut server, &mut client, now);

    assert_eq!(client.stack.tcp.state(client_handle), None, "client pcb reclaimed after 2*MSL");
    assert_eq!(server.stack.tcp.state(server_handle), None, "server pcb reclaimed after 2*MSL");
}

/// A 3000-byte UDP datagram sent through an MTU-1500 interface fragments on the
/// wire, and loopback reassembly at the receiver delivers the original payload byte-identical.
/// The exact fragment count isn't pinned (see DESIGN.md open question 3): this only asserts
/// fragmentation happened (more than one frame) and that reassembly is lossless.
#[test]
fn ip_fragmentation_round_trips_large_udp_payload() {
    let sender_addr = Ipv4Addr::new(10, 0, 1, 1);
    let receiver_addr = Ipv4Addr::new(10, 0, 1, 2);
    let mut sender = harness(sender_addr, 1500);
    let mut receiver = harness(receiver_addr, 1500);

    let now = Instant::ZERO;
    let udp_handle = sender.stack.udp.new_pcb().expect("udp pcb");
    let received = Arc::new(Mutex::new(None));
    let received_clone = Arc::clone(&received);
    let recv_handle = receiver.stack.udp.new_pcb().expect("udp pcb");
    receiver.stack.udp.bind(recv_handle, Some(receiver_addr), 7).expect("bind");
    receiver.stack.udp.set_recv(
        recv_handle,
        Box::new(move |data, _from_ip, _from_port| {
            *received_clone.lock().unwrap() = Some(data.to_vec());
        }),
    );

    let payload = vec![0xABu8; 3000];
    sender
        .stack
        .udp_send(udp_handle, receiver_addr, 7, &payload, 64, now)
        .expect("udp send");

    let fragments = sender.drain();
    assert!(fragments.len() > 1, "3000 bytes over an MTU-1500 link must fragment");

    for frame in fragments {
        receiver.stack.handle_rx(receiver.netif, frame, now);
    }

    assert_eq!(received.lock().unwrap().as_deref(), Some(payload.as_slice()));
}

/// Three segments delivered out of order reassemble into one contiguous
/// delivery once the missing piece arrives. Grounded in real wire frames produced by the
/// engine's own `write`/`tcp_output`, captured and redelivered in reverse order, rather than
/// hand-built bytes with fabricated sequence numbers -- `TcpEngine` exposes no accessor for
/// `rcv_nxt`/`snd_nxt`, and adding one purely for test introspection would be scope creep. The
/// out-of-order queue's own invariants (bounded depth, coalescing adjacent holes) are pinned
/// directly in `netstack-tcp::ooseq`'s unit tests.
#[test]
fn tcp_out_of_order_segments_reassemble_in_order() {
    let server_addr = Ipv4Addr::new(10, 0, 3, 1);
    let client_addr = Ipv4Addr::new(10, 0, 3, 2);
    let mut server = harness(server_addr, 1500);
    let mut client = harness(client_addr, 1500);
    let now = Instant::ZERO;

    let listen = server.stack.tcp_listen(Some(server_addr), 7, 4).expect("listen");
    let accepted = Arc::new(Mutex::new(None));
    let accepted_clone = Arc::clone(&accepted);
    server.stack.tcp.set_accept(
        listen,
        Box::new(move |child| {
            *accepted_clone.lock().unwrap() = Some(child);
            true
        }),
    );

    let client_handle = client
        .stack
        .tcp_connect(client_addr, 49_153, server_addr, 7, now)
        .expect("connect");
    pump(&mut client, &mut server, now);
    let server_handle = accepted.lock().unwrap().expect("server accepted a child pcb");

    let received = Arc::new(Mutex::new(Vec::new()));
    let received_clone = Arc::clone(&received);
    server.stack.tcp.set_recv(
        server_handle,
        Box::new(move |data| {
            if let Some(bytes) = data {
                received_clone.lock().unwrap().extend_from_slice(bytes);
            }
        }),
    );

    let mut segments = Vec::new();
    for chunk in [&b"AAAA"[..], &b"BBBB"[..], &b"CCCC"[..]] {
        client.stack.tcp.write(client_handle, chunk, true).expect("write");
        client.stack.tcp_output(client_handle, now).expect("output");
        let mut frames = client.drain();
        assert_eq!(frames.len(), 1, "each write produced exactly one segment");
        segments.push(frames.remove(0));
    }

    for frame in segments.into_iter().rev() {
        server.stack.handle_rx(server.netif, frame, now);
    }

    assert_eq!(
        received.lock().unwrap().as_slice(),
        b"AAAABBBBCCCC",
        "reordered arrival still reassembles into the original byte order"
    );
}

/// Losing the first of several in-flight segments makes each later segment
/// that arrives out of order draw an immediate duplicate ACK, without the receiver delivering
/// any new bytes. This engine's dupack handling (`TcpEngine::process_ack`'s `is_pure_dup`
/// branch) updates cwnd/ssthresh bookkeeping on the third duplicate and fast-retransmits the
/// lost segment right away rather than waiting on the RTO timer -- exact before/after cwnd/
/// ssthresh values (10*MSS -> ssthresh 5*MSS, cwnd 8*MSS) are pinned by
/// `netstack-tcp::engine::fast_retransmit_updates_cwnd_and_ssthresh_on_third_dupack`, which has
/// direct PCB access this crate boundary doesn't expose. What's checked here is the externally
/// observable half: the first two duplicate ACKs put nothing new on the wire, and the third
/// draws exactly one retransmit of the segment that was lost.
#[test]
fn tcp_third_duplicate_ack_from_reordered_segments_fast_retransmits_lost_segment() {
    let server_addr = Ipv4Addr::new(10, 0, 6, 1);
    let client_addr = Ipv4Addr::new(10, 0, 6, 2);
    let mut server = harness(server_addr, 1500);
    let mut client = harness(client_addr, 1500);
    let now = Instant::ZERO;

    let listen = server.stack.tcp_listen(Some(server_addr), 7, 4).expect("listen");
    server.stack.tcp.set_accept(listen, Box::new(|_| true));

    let client_handle = client
        .stack
        .tcp_connect(client_addr, 49_156, server_addr, 7, now)
        .expect("connect");
    pump(&mut client, &mut server, now);

    let mut segments = Vec::new();
    for chunk in [&b"11111"[..], &b"22222"[..], &b"33333"[..], &b"44444"[..]] {
        client.stack.tcp.write(client_handle, chunk, true).expect("write");
        client.stack.tcp_output(client_handle, now).expect("output");
        let mut frames = client.drain();
        assert_eq!(frames.len(), 1, "each write produced exactly one segment");
        segments.push(frames.remove(0));
    }
    let lost = segments.remove(0); // simulated loss: never delivered to the server

    for frame in &segments {
        server.stack.handle_rx(server.netif, frame.clone(), now);
    }
    let dup_acks = server.drain();
    assert_eq!(dup_acks.len(), 3, "each of the three reordered segments draws its own ACK");

    client.stack.handle_rx(client.netif, dup_acks[0].clone(), now);
    assert!(client.drain().is_empty(), "the first duplicate ACK emits nothing");
    client.stack.handle_rx(client.netif, dup_acks[1].clone(), now);
    assert!(client.drain().is_empty(), "the second duplicate ACK emits nothing");

    client.stack.handle_rx(client.netif, dup_acks[2].clone(), now);
    let retransmitted = client.drain();
    assert_eq!(
        retransmitted.len(),
        1,
        "the third duplicate ACK fast-retransmits the lost segment"
    );
    // 20-byte IPv4 header + 20-byte TCP header (no options, since `tcp-extended-options` is off
    // by default and this isn't a SYN): sequence number is the TCP header's first four bytes.
    let seq_of = |frame: &[u8]| u32::from_be_bytes(frame[24..28].try_into().unwrap());
    assert_eq!(
        seq_of(&retransmitted[0]),
        seq_of(&lost),
        "fast retransmit resends the segment at the original lost sequence number"
    );
    assert_eq!(
        retransmitted[0][40..],
        lost[40..],
        "the retransmitted frame carries the same payload that was originally lost"
    );
}

/// With the peer never acknowledging, the retransmit timer backs off
/// 1s -> 2s -> 4s (the doubling is pinned generally by `netstack-tcp::rto::backoff_doubles_and_caps`),
/// and once more than `TCP_MAXRTX` consecutive attempts go unanswered the connection aborts via
/// `on_err(ConnectionAborted)` and its PCB slot is freed.
#[test]
fn tcp_rto_backoff_then_aborts_after_max_retransmissions() {
    let server_addr = Ipv4Addr::new(10, 0, 5, 1);
    let client_addr = Ipv4Addr::new(10, 0, 5, 2);
    let mut server = harness(server_addr, 1500);
    let mut client = harness(client_addr, 1500);
    let mut now = Instant::ZERO;

    let listen = server.stack.tcp_listen(Some(server_addr), 7, 4).expect("listen");
    server.stack.tcp.set_accept(listen, Box::new(|_| true));

    let client_handle = client
        .stack
        .tcp_connect(client_addr, 49_155, server_addr, 7, now)
        .expect("connect");
    pump(&mut client, &mut server, now);
    assert_eq!(client.stack.tcp.state(client_handle), Some(TcpState::Established));

    client.stack.tcp.write(client_handle, b"stuck", true).expect("write");
    client.stack.tcp_output(client_handle, now).expect("output");
    client.drain(); // first attempt goes out; the peer never sees it (simulated loss)

    let aborted = Arc::new(Mutex::new(false));
    let aborted_clone = Arc::clone(&aborted);
    client.stack.tcp.set_err(
        client_handle,
        Box::new(move |_err| {
            *aborted_clone.lock().unwrap() = true;
        }),
    );

    for wait in [Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(4)] {
        now = now + wait - Duration::from_millis(1);
        client.stack.handle_timeout(now);
        assert!(client.drain().is_empty(), "retransmit timer must not fire early");

        now = now + Duration::from_millis(1);
        client.stack.handle_timeout(now);
        assert_eq!(
            client.drain().len(),
            1,
            "exactly one retransmission per backoff interval"
        );
    }

    // Backoff caps at 60s (`netstack_tcp::rto::MAX_RTO`); generous jumps from here on are
    // guaranteed to clear whatever the current deadline is without needing to track it exactly.
    for _ in 0..12 {
        if *aborted.lock().unwrap() {
            break;
        }
        now = now + Duration::from_secs(61);
        client.stack.handle_timeout(now);
    }

    assert!(*aborted.lock().unwrap(), "connection aborts once TCP_MAXRTX is exceeded");
    assert_eq!(client.stack.tcp.state(client_handle), None, "aborted pcb is freed");
}

/// Sending to a neighbor with no ARP entry queues exactly one packet and
/// leaves the link untouched until the neighbor resolves; `IpEngine::on_neighbor_resolved`
/// then flushes the queued packet and the entry reaches `Stable`. ARP table mechanics
/// themselves (bounded one-deep queue, aging) are pinned directly in `netstack-netif::arp`'s
/// unit tests; this only checks that the IP engine wires `ArpTable` in correctly end to end.
#[test]
fn arp_pending_packet_flushes_once_resolved() {
    let local_addr = Ipv4Addr::new(10, 0, 7, 1);
    let neighbor_addr = Ipv4Addr::new(10, 0, 7, 2);
    let mut host = harness_with_flags(
        local_addr,
        1500,
        NetifFlags::UP | NetifFlags::LINK_UP | NetifFlags::ETHARP,
    );
    let now = Instant::ZERO;

    host.stack
        .ip
        .send_if(
            &mut host.stack.netifs,
            host.netif,
            local_addr,
            neighbor_addr,
            64,
            IpNumber::UDP,
            b"hi",
            now,
        )
        .expect("send queues the packet pending resolution");
    assert!(
        host.drain().is_empty(),
        "nothing goes out while the neighbor is unresolved"
    );
    assert_eq!(
        host.stack.netifs.get(host.netif).unwrap().arp.state(neighbor_addr),
        ArpState::Pending
    );

    host.stack
        .ip
        .on_neighbor_resolved(&mut host.stack.netifs, host.netif, neighbor_addr, [0xAA; 6], now)
        .expect("resolution flushes the queued packet");

    let flushed = host.drain();
    assert_eq!(flushed.len(), 1, "exactly one packet was queued and flushed");
    assert_eq!(
        host.stack.netifs.get(host.netif).unwrap().arp.state(neighbor_addr),
        ArpState::Stable
    );
}
