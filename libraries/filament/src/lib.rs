use futures_util::{AsyncRead, AsyncWrite};

pub mod dialer;
pub mod tcp;
pub mod udp;

/// Filament overall is based on returning connection-like items that implement AsyncRead and AsyncWrite, as well as a few other things. This is called a Pipe.
pub trait Pipe: AsyncRead + AsyncWrite + Send + Unpin + std::fmt::Debug + 'static {
    /// This must return a string that uniquely identifies the protocol type.
    fn protocol(&self) -> &str;

    /// This might return a string that is some sort of human-readable identifier of the remote address.
    fn remote_addr(&self) -> Option<&str>;
}

impl Pipe for Box<dyn Pipe> {
    fn protocol(&self) -> &str {
        (**self).protocol()
    }

    fn remote_addr(&self) -> Option<&str> {
        (**self).remote_addr()
    }
}
