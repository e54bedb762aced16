use std::{
    net::{IpAddr, SocketAddr},
    time::{Duration, Instant},
};

use parking_lot::Mutex;

/// Minimum spacing between two IP rotations. The engine's transport layers
/// may dial the primary server many times in parallel; if every failure
/// rotated, a storm of failing concurrent dials would cycle the index past
/// every address within milliseconds and bury the one that works.
const ROTATE_COOLDOWN: Duration = Duration::from_secs(5);

/// The cached resolution of one primary-server domain: an ordered address
/// list plus a cursor into it. Replaced wholesale on re-resolution; only the
/// cursor and its throttle timestamp mutate in place.
#[derive(Debug)]
pub struct ResolvedEndpoint {
    domain: String,
    port: u16,
    state: Mutex<EndpointState>,
}

#[derive(Debug)]
struct EndpointState {
    ips: Vec<IpAddr>,
    ip_index: usize,
    last_resolved_at: Instant,
    last_rotated_at: Option<Instant>,
}

impl ResolvedEndpoint {
    /// Callers must guarantee a nonempty address list.
    pub fn new(domain: String, ips: Vec<IpAddr>, port: u16) -> Self {
        assert!(!ips.is_empty(), "an endpoint must have at least one address");
        Self {
            domain,
            port,
            state: Mutex::new(EndpointState {
                ips,
                ip_index: 0,
                last_resolved_at: Instant::now(),
                last_rotated_at: None,
            }),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The currently selected address.
    pub fn current_ip(&self) -> IpAddr {
        let state = self.state.lock();
        state.ips[state.ip_index]
    }

    /// The currently selected address paired with the resolved port.
    pub fn current_target(&self) -> SocketAddr {
        SocketAddr::new(self.current_ip(), self.port)
    }

    pub fn age(&self) -> Duration {
        self.state.lock().last_resolved_at.elapsed()
    }

    /// Advances the cursor to the next address, wrapping around. Throttled:
    /// a no-op when there is only one address, or when the last advancement
    /// was under the cooldown ago.
    pub fn rotate(&self) {
        self.rotate_at(Instant::now())
    }

    fn rotate_at(&self, now: Instant) {
        let mut state = self.state.lock();
        if state.ips.len() <= 1 {
            return;
        }
        if let Some(last) = state.last_rotated_at {
            if now.duration_since(last) < ROTATE_COOLDOWN {
                return;
            }
        }
        state.ip_index = (state.ip_index + 1) % state.ips.len();
        state.last_rotated_at = Some(now);
        tracing::debug!(
            domain = display(&self.domain),
            ip = display(state.ips[state.ip_index]),
            "rotated primary server address"
        );
    }

    #[cfg(test)]
    pub(crate) fn ips(&self) -> Vec<IpAddr> {
        self.state.lock().ips.clone()
    }
}
