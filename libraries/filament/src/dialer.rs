use std::{
    fmt::Display,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream, UdpSocket},
    str::FromStr,
    sync::Arc,
};

use async_io::Async;
use async_trait::async_trait;

use crate::{Pipe, tcp::TcpPipe, udp::DatagramConn};

/// The transport an outbound connection runs over.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Udp,
}

impl Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
            Network::Udp => write!(f, "udp"),
        }
    }
}

/// Errors produced when parsing a `host:port` string into a [Destination].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AddrError {
    #[error("malformed address {0:?}")]
    BadAddress(String),
    #[error("bad port in address {0:?}")]
    BadPort(String),
}

/// A destination as named by the layer that wants the connection: a hostname
/// or IP literal, plus a numeric port. IPv6 literals are written in brackets.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Destination {
    pub host: String,
    pub port: u16,
}

impl FromStr for Destination {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| AddrError::BadAddress(s.to_string()))?;
        let host = if let Some(inner) = host.strip_prefix('[') {
            inner
                .strip_suffix(']')
                .ok_or_else(|| AddrError::BadAddress(s.to_string()))?
        } else if host.contains(':') {
            // a bare v6 literal without brackets is ambiguous with the port separator
            return Err(AddrError::BadAddress(s.to_string()));
        } else {
            host
        };
        if host.is_empty() {
            return Err(AddrError::BadAddress(s.to_string()));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| AddrError::BadPort(s.to_string()))?;
        Ok(Destination {
            host: host.to_string(),
            port,
        })
    }
}

impl Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[async_trait]
/// Dialers create connections to a caller-supplied destination. This is the seam through which an engine obtains every one of its outbound connections. Failures are indicated by the standard I/O error type.
pub trait Dialer: Send + Sync + 'static {
    /// Opens a stream-oriented connection to the destination.
    async fn dial_stream(&self, dest: &Destination) -> std::io::Result<Box<dyn Pipe>>;

    /// Opens a datagram socket aimed at the destination. The returned
    /// connection is unconnected at the OS level; the remote address rides
    /// along with it.
    async fn dial_datagram(&self, dest: &Destination) -> std::io::Result<DatagramConn>;
}

/// A type-erased, cheaply clonable [Dialer].
#[derive(Clone)]
pub struct DynDialer {
    inner: Arc<dyn Dialer>,
}

impl DynDialer {
    pub fn new(inner: impl Dialer) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn from_arc(inner: Arc<dyn Dialer>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Dialer for DynDialer {
    async fn dial_stream(&self, dest: &Destination) -> std::io::Result<Box<dyn Pipe>> {
        self.inner.dial_stream(dest).await
    }

    async fn dial_datagram(&self, dest: &Destination) -> std::io::Result<DatagramConn> {
        self.inner.dial_datagram(dest).await
    }
}

/// A PlainDialer resolves the destination through the platform resolver and
/// connects with an ordinary, unmarked socket. It is what an engine gets when
/// nobody installs anything smarter.
pub struct PlainDialer;

impl PlainDialer {
    async fn resolve_one(&self, dest: &Destination) -> std::io::Result<SocketAddr> {
        let addrs = smol::net::resolve((dest.host.as_str(), dest.port)).await?;
        addrs.into_iter().next().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no addresses for {}", dest.host),
            )
        })
    }
}

#[async_trait]
impl Dialer for PlainDialer {
    async fn dial_stream(&self, dest: &Destination) -> std::io::Result<Box<dyn Pipe>> {
        let addr = self.resolve_one(dest).await?;
        let conn = Async::<TcpStream>::connect(addr).await?;
        crate::tcp::set_tcp_options(&conn)?;
        tracing::debug!(
            net = display(Network::Tcp),
            dest = display(dest),
            addr = display(addr),
            "plain dial"
        );
        Ok(Box::new(TcpPipe::new(conn, addr.to_string())))
    }

    async fn dial_datagram(&self, dest: &Destination) -> std::io::Result<DatagramConn> {
        let remote = self.resolve_one(dest).await?;
        let bind_addr: SocketAddr = if remote.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = Async::new(UdpSocket::bind(bind_addr)?)?;
        tracing::debug!(
            net = display(Network::Udp),
            dest = display(dest),
            addr = display(remote),
            "plain dial"
        );
        Ok(DatagramConn::new(socket, remote))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_names() {
        assert_eq!(Network::Tcp.to_string(), "tcp");
        assert_eq!(Network::Udp.to_string(), "udp");
    }

    #[test]
    fn parses_plain_host_port() {
        let dest: Destination = "example.com:443".parse().unwrap();
        assert_eq!(dest.host, "example.com");
        assert_eq!(dest.port, 443);
        assert_eq!(dest.to_string(), "example.com:443");
    }

    #[test]
    fn parses_bracketed_v6() {
        let dest: Destination = "[2001:db8::1]:8443".parse().unwrap();
        assert_eq!(dest.host, "2001:db8::1");
        assert_eq!(dest.port, 8443);
        assert_eq!(dest.to_string(), "[2001:db8::1]:8443");
    }

    #[test]
    fn rejects_missing_port() {
        assert!(matches!(
            "example.com".parse::<Destination>(),
            Err(AddrError::BadAddress(_))
        ));
    }

    #[test]
    fn rejects_unbracketed_v6() {
        assert!(matches!(
            "2001:db8::1:443".parse::<Destination>(),
            Err(AddrError::BadAddress(_))
        ));
    }

    #[test]
    fn rejects_bad_port() {
        assert!(matches!(
            "example.com:https".parse::<Destination>(),
            Err(AddrError::BadPort(_))
        ));
        assert!(matches!(
            "example.com:99999".parse::<Destination>(),
            Err(AddrError::BadPort(_))
        ));
    }

    #[test]
    fn rejects_empty_host() {
        assert!(matches!(
            ":443".parse::<Destination>(),
            Err(AddrError::BadAddress(_))
        ));
    }
}
