use std::{
    net::{Ipv6Addr, SocketAddr, SocketAddrV6},
    os::fd::AsRawFd,
    sync::Arc,
    time::Duration,
};

use async_io::Async;
use async_trait::async_trait;
use filament::{
    Pipe,
    dialer::{Destination, Dialer, Network},
    tcp::{TcpPipe, set_tcp_options},
    udp::DatagramConn,
};
use futures_intrusive::sync::ManualResetEvent;
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use smol_timeout2::TimeoutExt;
use socket2::{Domain, Protocol, Socket, Type};

use crate::{
    callback::HostCallbacks,
    endpoint::ResolvedEndpoint,
    errors::DialError,
    resolver::{NameResolver, lookup},
};

const PREPARE_ATTEMPTS: usize = 10;
const PREPARE_RETRY_WAIT: Duration = Duration::from_secs(2);

/// The system dialer installed into the engine. Every socket it hands out has
/// been marked by the host so its packets escape the tunnel; without the mark
/// the engine's upstream traffic would re-enter the tunnel and loop.
///
/// One destination, the pinned primary server, gets special treatment: its
/// resolution is cached ahead of time by [ProtectedDialer::prepare_domain]
/// and its addresses are rotated when connections to it fail. Everything else
/// is resolved fresh on every dial.
pub struct ProtectedDialer {
    callbacks: Arc<dyn HostCallbacks>,
    resolver: Arc<dyn NameResolver>,
    retry_wait: Duration,
    state: RwLock<PinState>,
}

struct PinState {
    pinned: Option<Destination>,
    prefer_ipv6: bool,
    cycle: Arc<PrepareCycle>,
}

/// One preparation cycle of the pinned primary. `done` fires exactly once per
/// cycle; `endpoint` is written at most once, before the firing, so any task
/// that observes the event set also observes the endpoint.
struct PrepareCycle {
    done: ManualResetEvent,
    endpoint: OnceCell<Arc<ResolvedEndpoint>>,
}

impl PrepareCycle {
    fn fresh() -> Arc<Self> {
        Arc::new(Self {
            done: ManualResetEvent::new(false),
            endpoint: OnceCell::new(),
        })
    }
}

impl ProtectedDialer {
    pub fn new(
        callbacks: Arc<dyn HostCallbacks>,
        resolver: Arc<dyn NameResolver>,
        prefer_ipv6: bool,
    ) -> Self {
        Self {
            callbacks,
            resolver,
            retry_wait: PREPARE_RETRY_WAIT,
            state: RwLock::new(PinState {
                pinned: None,
                prefer_ipv6,
                cycle: PrepareCycle::fresh(),
            }),
        }
    }

    #[cfg(test)]
    fn set_retry_wait(&mut self, wait: Duration) {
        self.retry_wait = wait;
    }

    /// Resolves and caches the primary server's addresses ahead of the first
    /// dial to it. Dials to the primary block until this finishes; callers
    /// must run at most one preparation at a time per dialer. The completion
    /// event fires on every exit path, including cancellation by dropping
    /// this future.
    pub async fn prepare_domain(
        &self,
        domain: &str,
        cancel: Arc<ManualResetEvent>,
        prefer_ipv6: bool,
    ) {
        let cycle = PrepareCycle::fresh();
        let pinned: Option<Destination> = domain.parse().ok();
        let malformed = pinned.is_none();
        {
            let mut state = self.state.write();
            state.pinned = pinned;
            state.prefer_ipv6 = prefer_ipv6;
            state.cycle = cycle.clone();
        }
        let _done = scopeguard::guard(cycle.clone(), |cycle| cycle.done.set());
        if malformed {
            tracing::warn!(domain, "primary server address is malformed");
            return;
        }
        for attempt in 1..=PREPARE_ATTEMPTS {
            match lookup(&*self.resolver, domain, prefer_ipv6).await {
                Ok(endpoint) => {
                    tracing::info!(
                        domain,
                        ip = display(endpoint.current_ip()),
                        attempt,
                        "primary server prepared"
                    );
                    let _ = cycle.endpoint.set(Arc::new(endpoint));
                    return;
                }
                Err(err) => {
                    tracing::warn!(
                        domain,
                        attempt,
                        err = debug(&err),
                        "preparing primary server failed"
                    );
                    if cancel.wait().timeout(self.retry_wait).await.is_some() {
                        tracing::debug!(domain, "preparation cancelled");
                        return;
                    }
                }
            }
        }
        tracing::warn!(domain, "exhausted all preparation attempts");
    }

    /// The cached endpoint, waiting out an in-flight preparation first.
    async fn pinned_endpoint(
        &self,
        cycle: &PrepareCycle,
    ) -> Result<Arc<ResolvedEndpoint>, DialError> {
        cycle.done.wait().await;
        cycle.endpoint.get().cloned().ok_or(DialError::PrepareFailed)
    }

    fn pinned_cycle(&self, dest: &Destination) -> Option<Arc<PrepareCycle>> {
        let state = self.state.read();
        if state.pinned.as_ref() == Some(dest) {
            Some(state.cycle.clone())
        } else {
            None
        }
    }

    fn prefer_ipv6(&self) -> bool {
        self.state.read().prefer_ipv6
    }

    async fn dial_tcp(&self, dest: &Destination) -> Result<Box<dyn Pipe>, DialError> {
        match self.pinned_cycle(dest) {
            Some(cycle) => {
                let endpoint = self.pinned_endpoint(&cycle).await?;
                let target = endpoint.current_target();
                match self.connect_stream(target).await {
                    Ok(pipe) => Ok(pipe),
                    Err(err) => {
                        // the engine retries, which carries the next attempt
                        // onto the next address; a refused protect says
                        // nothing about address quality, so it does not rotate
                        if matches!(err, DialError::Connect(_)) {
                            endpoint.rotate();
                        }
                        Err(err)
                    }
                }
            }
            None => {
                let endpoint =
                    lookup(&*self.resolver, &dest.to_string(), self.prefer_ipv6()).await?;
                self.connect_stream(endpoint.current_target()).await
            }
        }
    }

    async fn dial_udp(&self, dest: &Destination) -> Result<DatagramConn, DialError> {
        match self.pinned_cycle(dest) {
            Some(cycle) => {
                let endpoint = self.pinned_endpoint(&cycle).await?;
                let target = endpoint.current_target();
                match self.bind_datagram(target) {
                    Ok(conn) => Ok(conn),
                    Err(err) => {
                        if matches!(err, DialError::Bind(_)) {
                            endpoint.rotate();
                        }
                        Err(err)
                    }
                }
            }
            None => {
                let endpoint =
                    lookup(&*self.resolver, &dest.to_string(), self.prefer_ipv6()).await?;
                self.bind_datagram(endpoint.current_target())
            }
        }
    }

    /// Creates a dual-stack socket and has the host mark it, in that order.
    /// A refused mark closes the descriptor on drop before any connect or
    /// bind can happen.
    fn protected_socket(&self, network: Network) -> Result<Socket, DialError> {
        let (ty, proto) = match network {
            Network::Tcp => (Type::STREAM, Protocol::TCP),
            Network::Udp => (Type::DGRAM, Protocol::UDP),
        };
        let socket = Socket::new(Domain::IPV6, ty, Some(proto)).map_err(DialError::SocketCreate)?;
        socket
            .set_nonblocking(true)
            .map_err(DialError::SocketCreate)?;
        socket.set_only_v6(false).map_err(DialError::SocketCreate)?;
        let fd = socket.as_raw_fd();
        if !self.callbacks.protect(fd) {
            tracing::warn!(fd, net = display(network), "host refused to protect socket");
            return Err(DialError::ProtectFail(fd));
        }
        Ok(socket)
    }

    async fn connect_stream(&self, target: SocketAddr) -> Result<Box<dyn Pipe>, DialError> {
        let socket = self.protected_socket(Network::Tcp)?;
        match socket.connect(&v6_sockaddr(target).into()) {
            Ok(()) => {}
            Err(err) if connect_in_progress(&err) => {}
            Err(err) => return Err(DialError::Connect(err)),
        }
        // from here the fd is owned by the stream; drop on any error path
        // closes exactly once
        let stream =
            Async::new(std::net::TcpStream::from(socket)).map_err(DialError::Connect)?;
        stream.writable().await.map_err(DialError::Connect)?;
        if let Some(err) = stream.get_ref().take_error().map_err(DialError::Connect)? {
            return Err(DialError::Connect(err));
        }
        stream.get_ref().peer_addr().map_err(DialError::Connect)?;
        set_tcp_options(&stream).map_err(DialError::Connect)?;
        tracing::debug!(target = display(target), "protected stream connected");
        Ok(Box::new(TcpPipe::new(stream, target.to_string())))
    }

    /// Binds a protected datagram socket to the wildcard. The socket is left
    /// unconnected; the target rides along in the returned connection and is
    /// supplied on every send.
    fn bind_datagram(&self, target: SocketAddr) -> Result<DatagramConn, DialError> {
        let socket = self.protected_socket(Network::Udp)?;
        socket
            .bind(&SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, 0, 0, 0).into())
            .map_err(DialError::Bind)?;
        let socket = Async::new(std::net::UdpSocket::from(socket)).map_err(DialError::Bind)?;
        tracing::debug!(target = display(target), "protected datagram socket bound");
        Ok(DatagramConn::new(
            socket,
            SocketAddr::V6(v6_sockaddr(target)),
        ))
    }
}

#[async_trait]
impl Dialer for ProtectedDialer {
    async fn dial_stream(&self, dest: &Destination) -> std::io::Result<Box<dyn Pipe>> {
        Ok(self.dial_tcp(dest).await?)
    }

    async fn dial_datagram(&self, dest: &Destination) -> std::io::Result<DatagramConn> {
        Ok(self.dial_udp(dest).await?)
    }
}

/// The v4-mapped form of the target, so a dual-stack AF_INET6 socket can
/// reach both families.
fn v6_sockaddr(addr: SocketAddr) -> SocketAddrV6 {
    match addr {
        SocketAddr::V4(v4) => SocketAddrV6::new(v4.ip().to_ipv6_mapped(), v4.port(), 0, 0),
        SocketAddr::V6(v6) => v6,
    }
}

fn connect_in_progress(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(libc::EINPROGRESS)
        || err.kind() == std::io::ErrorKind::WouldBlock
}
