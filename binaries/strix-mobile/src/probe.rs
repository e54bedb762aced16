use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::anyhow;
use filament::dialer::{Destination, DynDialer, PlainDialer};
use futures_intrusive::sync::ManualResetEvent;
use futures_lite::FutureExt;
use futures_util::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use smol_timeout2::TimeoutExt;

use crate::{
    engine::{Engine, EngineBuilder},
    errors::ControlError,
};

pub const DEFAULT_PROBE_URL: &str = "https://www.google.com/generate_204";

const PROBE_DEADLINE: Duration = Duration::from_secs(12);
const TLS_HANDSHAKE_DEADLINE: Duration = Duration::from_secs(6);

struct ProbeTarget {
    tls: bool,
    dest: Destination,
    path: String,
}

fn parse_probe_url(url: &str) -> Result<ProbeTarget, ControlError> {
    let url = if url.is_empty() { DEFAULT_PROBE_URL } else { url };
    let (tls, rest) = if let Some(rest) = url.strip_prefix("https://") {
        (true, rest)
    } else if let Some(rest) = url.strip_prefix("http://") {
        (false, rest)
    } else {
        return Err(ControlError::ProbeFailed(anyhow!(
            "unsupported probe url {url:?}"
        )));
    };
    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };
    let dest = match authority.parse::<Destination>() {
        Ok(dest) => dest,
        Err(filament::dialer::AddrError::BadAddress(_)) => {
            let host = authority
                .strip_prefix('[')
                .and_then(|h| h.strip_suffix(']'))
                .unwrap_or(authority);
            if host.is_empty() || host.contains('@') {
                return Err(ControlError::ProbeFailed(anyhow!(
                    "unsupported probe url {url:?}"
                )));
            }
            Destination {
                host: host.to_string(),
                port: if tls { 443 } else { 80 },
            }
        }
        Err(err) => return Err(ControlError::ProbeFailed(err.into())),
    };
    Ok(ProbeTarget {
        tls,
        dest,
        path: path.to_string(),
    })
}

/// Issues one HTTP/1.1 GET through the engine and times it. 200 and 204 count
/// as success; redirects are not followed. Aborts when `close_signal` fires,
/// so tearing the engine down interrupts an in-flight probe.
pub(crate) async fn http_ping(
    engine: &Arc<dyn Engine>,
    url: &str,
    close_signal: &ManualResetEvent,
) -> Result<u64, ControlError> {
    let target = parse_probe_url(url)?;
    let start = Instant::now();
    let attempt = async {
        let pipe = engine
            .open_conn(&target.dest.to_string())
            .await
            .map_err(|e| ControlError::ProbeFailed(e.into()))?;
        let status = if target.tls {
            let tls = async_native_tls::TlsConnector::new()
                .connect(&target.dest.host, pipe)
                .timeout(TLS_HANDSHAKE_DEADLINE)
                .await
                .ok_or(ControlError::ProbeTimeout)?
                .map_err(|e| ControlError::ProbeFailed(e.into()))?;
            fetch_status(tls, &target).await?
        } else {
            fetch_status(pipe, &target).await?
        };
        if status == 200 || status == 204 {
            Ok(start.elapsed().as_millis() as u64)
        } else {
            Err(ControlError::ProbeFailed(anyhow!(
                "unexpected status {status}"
            )))
        }
    };
    let cancelled = async {
        close_signal.wait().await;
        Err(ControlError::ProbeFailed(anyhow!(
            "interrupted by shutdown"
        )))
    };
    attempt
        .or(cancelled)
        .timeout(PROBE_DEADLINE)
        .await
        .unwrap_or(Err(ControlError::ProbeTimeout))
}

async fn fetch_status(
    mut stream: impl AsyncRead + AsyncWrite + Unpin,
    target: &ProbeTarget,
) -> Result<u16, ControlError> {
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        target.path, target.dest.host
    );
    let probe_err = |e: std::io::Error| ControlError::ProbeFailed(e.into());
    stream.write_all(request.as_bytes()).await.map_err(probe_err)?;
    stream.flush().await.map_err(probe_err)?;

    let mut buf = Vec::with_capacity(256);
    let mut chunk = [0u8; 512];
    loop {
        let n = stream.read(&mut chunk).await.map_err(probe_err)?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(2).any(|w| w == b"\r\n") {
            break;
        }
        if buf.len() > 8192 {
            return Err(ControlError::ProbeFailed(anyhow!(
                "response status line too long"
            )));
        }
    }
    let line = buf.split(|&b| b == b'\r').next().unwrap_or(&[]);
    let line = String::from_utf8_lossy(line);
    let status = line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| ControlError::ProbeFailed(anyhow!("malformed status line {line:?}")))?;
    Ok(status)
}

/// Spins up a throwaway engine purely to time one request, then tears it
/// down. Unlike [crate::Controller::measure_delay] this does not touch any
/// running instance, and the engine it builds is stripped down so the
/// measurement cannot bind listening ports.
pub async fn measure_outbound_delay(
    builder: &dyn EngineBuilder,
    config_json: &str,
    url: &str,
) -> Result<u64, ControlError> {
    let config: serde_json::Value =
        serde_json::from_str(config_json).map_err(|e| ControlError::ConfigInvalid(e.into()))?;
    let config = strip_probe_config(config);
    let engine = builder
        .build(&config, DynDialer::new(PlainDialer))
        .map_err(ControlError::StartFailed)?;
    engine.start().map_err(ControlError::StartFailed)?;
    let result = http_ping(&engine, url, &ManualResetEvent::new(false)).await;
    if let Err(err) = engine.close() {
        tracing::warn!(err = debug(&err), "closing the probe engine failed");
    }
    result
}

/// Retains only the app modules a single outbound request needs (outbound,
/// dispatcher and log) and empties the inbound list. Anything more would
/// make a latency measurement open listening sockets.
fn strip_probe_config(mut config: serde_json::Value) -> serde_json::Value {
    const RETAINED: [&str; 3] = ["outbound", "dispatcher", "log"];
    if let Some(apps) = config.get_mut("app").and_then(|v| v.as_array_mut()) {
        apps.retain(|entry| {
            entry
                .get("type")
                .and_then(|t| t.as_str())
                .is_some_and(|t| RETAINED.contains(&t))
        });
    }
    if let Some(obj) = config.as_object_mut() {
        obj.insert("inbound".into(), serde_json::Value::Array(vec![]));
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        net::TcpListener,
        sync::atomic::{AtomicBool, Ordering},
    };

    use async_io::Async;
    use async_trait::async_trait;
    use filament::{Pipe, dialer::Dialer};
    use parking_lot::Mutex;
    use serde_json::json;

    use crate::stats::StatsRegistry;

    struct MockEngine {
        dialer: DynDialer,
        stats: Arc<StatsRegistry>,
        started: AtomicBool,
        closed: AtomicBool,
    }

    impl MockEngine {
        fn plain() -> Arc<dyn Engine> {
            Arc::new(Self {
                dialer: DynDialer::new(PlainDialer),
                stats: Arc::new(StatsRegistry::new()),
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl Engine for MockEngine {
        fn start(&self) -> anyhow::Result<()> {
            self.started.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn close(&self) -> anyhow::Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn open_conn(&self, dest: &str) -> std::io::Result<Box<dyn Pipe>> {
            let dest: Destination = dest
                .parse()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("{e}")))?;
            self.dialer.dial_stream(&dest).await
        }

        fn stats(&self) -> Arc<StatsRegistry> {
            self.stats.clone()
        }
    }

    /// Serves one canned HTTP response on a fresh loopback port.
    fn serve_once(response: &'static str) -> u16 {
        let listener = Async::new(TcpListener::bind("127.0.0.1:0").unwrap()).unwrap();
        let port = listener.get_ref().local_addr().unwrap().port();
        smolscale::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = conn.read(&mut buf).await;
            let _ = conn.write_all(response.as_bytes()).await;
        })
        .detach();
        port
    }

    #[test]
    fn parses_default_url() {
        let target = parse_probe_url("").unwrap();
        assert!(target.tls);
        assert_eq!(target.dest.host, "www.google.com");
        assert_eq!(target.dest.port, 443);
        assert_eq!(target.path, "/generate_204");
    }

    #[test]
    fn parses_explicit_port_and_path() {
        let target = parse_probe_url("http://example.com:8080/health").unwrap();
        assert!(!target.tls);
        assert_eq!(target.dest.host, "example.com");
        assert_eq!(target.dest.port, 8080);
        assert_eq!(target.path, "/health");
    }

    #[test]
    fn bare_host_gets_scheme_defaults() {
        let target = parse_probe_url("http://example.com").unwrap();
        assert_eq!(target.dest.port, 80);
        assert_eq!(target.path, "/");
        let target = parse_probe_url("https://example.com").unwrap();
        assert_eq!(target.dest.port, 443);
    }

    #[test]
    fn rejects_unknown_schemes() {
        assert!(parse_probe_url("ftp://example.com/x").is_err());
        assert!(parse_probe_url("example.com").is_err());
    }

    #[test]
    fn accepted_statuses_measure() {
        smolscale::block_on(async {
            let port = serve_once("HTTP/1.1 204 No Content\r\n\r\n");
            let engine = MockEngine::plain();
            let ms = http_ping(
                &engine,
                &format!("http://127.0.0.1:{port}/generate_204"),
                &ManualResetEvent::new(false),
            )
            .await
            .unwrap();
            assert!(ms < 12_000);
        })
    }

    #[test]
    fn rejected_status_is_probe_failure() {
        smolscale::block_on(async {
            let port = serve_once("HTTP/1.1 502 Bad Gateway\r\n\r\n");
            let engine = MockEngine::plain();
            let err = http_ping(
                &engine,
                &format!("http://127.0.0.1:{port}/x"),
                &ManualResetEvent::new(false),
            )
            .await
            .unwrap_err();
            assert!(matches!(err, ControlError::ProbeFailed(_)));
        })
    }

    #[test]
    fn close_signal_aborts_probe() {
        smolscale::block_on(async {
            // a listener that accepts but never answers
            let listener = Async::new(TcpListener::bind("127.0.0.1:0").unwrap()).unwrap();
            let port = listener.get_ref().local_addr().unwrap().port();
            smolscale::spawn(async move {
                let (_conn, _) = listener.accept().await.unwrap();
                futures_lite::future::pending::<()>().await;
            })
            .detach();

            let engine = MockEngine::plain();
            let close_signal = ManualResetEvent::new(false);
            close_signal.set();
            let start = Instant::now();
            let err = http_ping(&engine, &format!("http://127.0.0.1:{port}/x"), &close_signal)
                .await
                .unwrap_err();
            assert!(matches!(err, ControlError::ProbeFailed(_)));
            assert!(start.elapsed() < Duration::from_secs(5));
        })
    }

    struct CapturingBuilder {
        seen: Mutex<Option<serde_json::Value>>,
    }

    impl EngineBuilder for CapturingBuilder {
        fn build(
            &self,
            config: &serde_json::Value,
            _dialer: DynDialer,
        ) -> anyhow::Result<Arc<dyn Engine>> {
            *self.seen.lock() = Some(config.clone());
            Ok(MockEngine::plain())
        }

        fn core_version(&self) -> String {
            "1.2.3".into()
        }
    }

    #[test]
    fn standalone_measurement_strips_the_config() {
        smolscale::block_on(async {
            let port = serve_once("HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
            let builder = CapturingBuilder {
                seen: Mutex::new(None),
            };
            let config = r#"{
                "app": [{"type": "stats"}, {"type": "log"}, {"type": "outbound"}],
                "inbound": [{"type": "socks", "listen": "127.0.0.1:1080"}]
            }"#;
            measure_outbound_delay(&builder, config, &format!("http://127.0.0.1:{port}/"))
                .await
                .unwrap();

            let seen = builder.seen.lock().clone().unwrap();
            let kinds: Vec<&str> = seen["app"]
                .as_array()
                .unwrap()
                .iter()
                .map(|e| e["type"].as_str().unwrap())
                .collect();
            assert_eq!(kinds, vec!["log", "outbound"]);
            assert_eq!(seen["inbound"].as_array().unwrap().len(), 0);
        })
    }

    #[test]
    fn probe_config_is_stripped_exactly() {
        let config = json!({
            "app": [
                {"type": "outbound", "settings": {}},
                {"type": "stats"},
                {"type": "dispatcher"},
                {"type": "inbound"},
                {"type": "log", "level": "info"},
                {"type": "policy"},
            ],
            "inbound": [{"type": "socks", "listen": "127.0.0.1:1080"}],
            "outbound": [{"tag": "proxy"}],
        });
        let stripped = strip_probe_config(config);
        let kinds: Vec<&str> = stripped["app"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["type"].as_str().unwrap())
            .collect();
        assert_eq!(kinds, vec!["outbound", "dispatcher", "log"]);
        assert_eq!(stripped["inbound"].as_array().unwrap().len(), 0);
        assert_eq!(stripped["outbound"][0]["tag"], "proxy");
    }
}
