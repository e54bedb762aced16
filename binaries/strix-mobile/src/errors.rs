use std::os::fd::RawFd;

use filament::dialer::AddrError;

/// Everything that can go wrong while producing one protected connection.
/// These propagate unchanged to the engine, which applies its own retry
/// policy; the dialer itself never retries a dial.
#[derive(thiserror::Error, Debug)]
pub enum DialError {
    #[error(transparent)]
    Addr(#[from] AddrError),
    #[error("cannot resolve {host:?}: {source}")]
    ResolveFailed {
        host: String,
        #[source]
        source: std::io::Error,
    },
    #[error("primary endpoint was never prepared")]
    PrepareFailed,
    #[error("host refused to protect fd {0}")]
    ProtectFail(RawFd),
    #[error("cannot create socket: {0}")]
    SocketCreate(std::io::Error),
    #[error("cannot connect: {0}")]
    Connect(std::io::Error),
    #[error("cannot bind: {0}")]
    Bind(std::io::Error),
}

impl From<DialError> for std::io::Error {
    fn from(err: DialError) -> Self {
        use std::io::ErrorKind;
        let kind = match &err {
            DialError::Addr(_) => ErrorKind::InvalidInput,
            DialError::ResolveFailed { .. } => ErrorKind::NotFound,
            DialError::PrepareFailed => ErrorKind::NotConnected,
            DialError::ProtectFail(_) => ErrorKind::PermissionDenied,
            DialError::SocketCreate(e) | DialError::Connect(e) | DialError::Bind(e) => e.kind(),
        };
        std::io::Error::new(kind, err)
    }
}

/// Errors surfaced across the controller and probe surface.
#[derive(thiserror::Error, Debug)]
pub enum ControlError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(#[source] anyhow::Error),
    #[error("engine failed to start: {0}")]
    StartFailed(#[source] anyhow::Error),
    #[error("engine failed to close: {0}")]
    CoreClose(#[source] anyhow::Error),
    #[error("latency probe failed: {0}")]
    ProbeFailed(#[source] anyhow::Error),
    #[error("latency probe timed out")]
    ProbeTimeout,
}
