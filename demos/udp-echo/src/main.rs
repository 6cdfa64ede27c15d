//! UDP echo server on port 7: read one datagram, echo it back to whoever sent it. Loops forever
//! on a single thread since every receive already carries the sender's address (no per-client
//! fd), over the blocking socket API.

use netstack_config::StackConfig;
use netstack_socket::NetconnType;

const ECHO_PORT: u16 = 7;

fn main() {
    tracing_subscriber::fmt::init();

    let handle = netstack::protocol::spawn(StackConfig::default(), 4, 64, |_stack| {});
    let sockets = handle.sockets();

    let fd = sockets.socket(NetconnType::Udp).expect("allocate udp socket");
    sockets.bind(fd, None, ECHO_PORT).expect("bind to echo port");
    tracing::info!(port = ECHO_PORT, "udp-echo listening");

    let mut buf = [0u8; 4096];
    loop {
        match sockets.recv(fd, &mut buf, None) {
            Ok((n, Some((from_ip, from_port)))) => {
                if let Err(err) = sockets.sendto(fd, &buf[..n], from_ip, from_port) {
                    tracing::warn!(%err, "echo reply failed");
                }
            }
            Ok((_, None)) => unreachable!("udp recv always carries a sender address"),
            Err(err) => tracing::warn!(%err, "recv failed"),
        }
    }
}
