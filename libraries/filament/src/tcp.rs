use std::net::TcpStream;

use async_io::Async;
use futures_lite::{AsyncRead, AsyncWrite};
use pin_project::pin_project;

use crate::Pipe;

/// A TcpPipe wraps an async TCP stream together with a human-readable remote
/// address. The stream may have been produced by any means, including raw
/// sockets hand-built elsewhere, so the constructor is public.
#[pin_project]
pub struct TcpPipe {
    #[pin]
    inner: Async<TcpStream>,
    remote: String,
}

impl TcpPipe {
    pub fn new(inner: Async<TcpStream>, remote: String) -> Self {
        Self { inner, remote }
    }
}

impl std::fmt::Debug for TcpPipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpPipe")
            .field("remote", &self.remote)
            .finish()
    }
}

impl AsyncRead for TcpPipe {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut [u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        self.project().inner.poll_read(cx, buf)
    }
}

impl AsyncWrite for TcpPipe {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_close(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        self.project().inner.poll_close(cx)
    }
}

impl Pipe for TcpPipe {
    fn protocol(&self) -> &str {
        "tcp"
    }

    fn remote_addr(&self) -> Option<&str> {
        Some(&self.remote)
    }
}

pub fn set_tcp_options(conn: &Async<TcpStream>) -> std::io::Result<()> {
    conn.get_ref().set_nodelay(true)?;

    #[cfg(any(target_os = "linux", target_os = "android"))]
    unsafe {
        use std::os::fd::AsRawFd;
        let lowat: libc::c_int = 32768;
        let ret = libc::setsockopt(
            conn.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_NOTSENT_LOWAT,
            &lowat as *const _ as *const libc::c_void,
            std::mem::size_of_val(&lowat) as libc::socklen_t,
        );
        if ret != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}
