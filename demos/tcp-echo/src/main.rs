//! TCP echo server on port 7: accept connections and write back whatever was read, closing
//! once the peer does. Rides the blocking socket API with one OS thread per connection — the
//! natural shape once a real blocking `accept`/`recv`/`send` exists.

use std::sync::Arc;

use netstack_config::StackConfig;
use netstack_socket::{NetconnType, SocketTable};

const ECHO_PORT: u16 = 7;

fn main() {
    tracing_subscriber::fmt::init();

    let handle = netstack::protocol::spawn(StackConfig::default(), 4, 64, |_stack| {});
    let sockets = Arc::clone(handle.sockets());

    let fd = sockets.socket(NetconnType::Tcp).expect("allocate listening socket");
    sockets.bind(fd, None, ECHO_PORT).expect("bind to echo port");
    sockets.listen(fd, 8).expect("listen");
    tracing::info!(port = ECHO_PORT, "tcp-echo listening");

    loop {
        let conn_fd = match sockets.accept(fd, None) {
            Ok(fd) => fd,
            Err(err) => {
                tracing::warn!(%err, "accept failed");
                continue;
            }
        };
        let sockets = Arc::clone(&sockets);
        std::thread::spawn(move || serve(sockets, conn_fd));
    }
}

fn serve(sockets: Arc<SocketTable>, fd: i32) {
    let mut buf = [0u8; 4096];
    loop {
        match sockets.recv(fd, &mut buf, None) {
            Ok((0, _)) => break,
            Ok((n, _)) => {
                if let Err(err) = sockets.send(fd, &buf[..n]) {
                    tracing::warn!(%err, "echo write failed");
                    break;
                }
            }
            Err(netstack_error::Error::ConnectionClosed) => break,
            Err(err) => {
                tracing::warn!(%err, "echo read failed");
                break;
            }
        }
    }
    let _ = sockets.close(fd);
}
