use std::net::{SocketAddr, UdpSocket};

use async_io::Async;

/// A datagram connection: an unconnected UDP socket paired with the remote
/// address it is aimed at. The socket stays unconnected at the OS level; the
/// remote is supplied on every send, so the same invariants hold whether the
/// socket was bound to a wildcard by a custom dialer or by [crate::dialer::PlainDialer].
pub struct DatagramConn {
    socket: Async<UdpSocket>,
    remote: SocketAddr,
}

impl std::fmt::Debug for DatagramConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatagramConn")
            .field("remote", &self.remote)
            .finish()
    }
}

impl DatagramConn {
    pub fn new(socket: Async<UdpSocket>, remote: SocketAddr) -> Self {
        Self { socket, remote }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.get_ref().local_addr()
    }

    /// Sends one datagram to the paired remote.
    pub async fn send(&self, buf: &[u8]) -> std::io::Result<usize> {
        self.socket.send_to(buf, self.remote).await
    }

    /// Receives one datagram from the paired remote. Datagrams arriving from
    /// anywhere else are dropped, since the socket is bound to a wildcard and
    /// can legally receive from the whole world.
    pub async fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            let (n, from) = self.socket.recv_from(buf).await?;
            if same_endpoint(&from, &self.remote) {
                return Ok(n);
            }
            tracing::debug!(
                from = display(from),
                expected = display(self.remote),
                "dropping datagram from unexpected sender"
            );
        }
    }
}

fn same_endpoint(a: &SocketAddr, b: &SocketAddr) -> bool {
    a.port() == b.port() && a.ip().to_canonical() == b.ip().to_canonical()
}
