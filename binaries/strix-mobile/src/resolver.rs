use std::{net::IpAddr, time::Duration};

use async_trait::async_trait;
use filament::dialer::Destination;
use smol_timeout2::TimeoutExt;

use crate::{endpoint::ResolvedEndpoint, errors::DialError};

const RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Turns hostnames into address lists.
#[async_trait]
pub trait NameResolver: Send + Sync + 'static {
    async fn resolve(&self, host: &str) -> std::io::Result<Vec<IpAddr>>;
}

/// Resolves through the platform's native name service, via the blocking
/// pool. This must never go through the engine's own DNS: the engine's DNS
/// traffic itself flows through the dialer being configured here, and looping
/// the two would deadlock the first dial.
pub struct SystemResolver;

#[async_trait]
impl NameResolver for SystemResolver {
    async fn resolve(&self, host: &str) -> std::io::Result<Vec<IpAddr>> {
        let addrs = smol::net::resolve((host, 0)).await?;
        Ok(addrs.into_iter().map(|a| a.ip()).collect())
    }
}

/// Resolves a `host:port` string into a fresh [ResolvedEndpoint], with the
/// address list ordered by family preference.
pub async fn lookup(
    resolver: &dyn NameResolver,
    address: &str,
    prefer_ipv6: bool,
) -> Result<ResolvedEndpoint, DialError> {
    let dest: Destination = address.parse()?;
    let resolved = resolver
        .resolve(&dest.host)
        .timeout(RESOLVE_TIMEOUT)
        .await
        .unwrap_or_else(|| {
            Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "resolution deadline exceeded",
            ))
        })
        .map_err(|source| DialError::ResolveFailed {
            host: dest.host.clone(),
            source,
        })?;
    if resolved.is_empty() {
        return Err(DialError::ResolveFailed {
            host: dest.host.clone(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses returned"),
        });
    }
    let ips = order_by_family(resolved, prefer_ipv6);
    tracing::debug!(
        host = display(&dest.host),
        count = ips.len(),
        prefer_ipv6,
        "resolved endpoint"
    );
    Ok(ResolvedEndpoint::new(dest.host, ips, dest.port))
}

/// Orders the preferred family first, preserving lookup order within each
/// family. Each address appears exactly once.
fn order_by_family(ips: Vec<IpAddr>, prefer_ipv6: bool) -> Vec<IpAddr> {
    let (preferred, fallback): (Vec<IpAddr>, Vec<IpAddr>) =
        ips.into_iter().partition(|ip| ip.is_ipv6() == prefer_ipv6);
    preferred.into_iter().chain(fallback).collect()
}
