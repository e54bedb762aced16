use std::os::fd::RawFd;

/// The capability set the embedding host supplies to the library.
///
/// Every method may be invoked from arbitrary worker threads: the engine
/// drives dials from its own thread pool, so implementations must be legal to
/// call off the host's main runtime thread. `protect` in particular sits on
/// the hot path of every outbound connection and must not block for long —
/// a slow protect stalls every concurrent dial.
pub trait HostCallbacks: Send + Sync + 'static {
    /// Asks the host's VPN service to mark a native socket descriptor so the
    /// OS routes its traffic outside the tunnel. Returns true iff the mark
    /// was applied; a socket that could not be protected must never be used.
    fn protect(&self, fd: RawFd) -> bool;

    /// Signalled once the engine has been started.
    fn startup(&self) -> i32;

    /// Signalled once the engine has been torn down.
    fn shutdown(&self) -> i32;

    /// Carries textual status to the host.
    fn emit_status(&self, code: i32, message: &str) -> i32;
}
