use std::sync::Arc;

use anyhow::anyhow;
use filament::dialer::{DynDialer, PlainDialer};
use futures_intrusive::sync::ManualResetEvent;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{
    callback::HostCallbacks,
    dialer::ProtectedDialer,
    engine::{Engine, EngineBuilder},
    errors::ControlError,
    probe::http_ping,
    resolver::{NameResolver, SystemResolver},
    stats::{Direction, traffic_counter_name},
};

/// Everything the host sets before bringing the engine up. The engine
/// configuration itself is an opaque JSON document.
#[derive(Clone, Serialize, Deserialize)]
pub struct StartOptions {
    pub config_json: String,
    /// The upstream server whose resolution is pinned and rotated. When
    /// absent, every destination is resolved fresh.
    #[serde(default)]
    pub primary_server: Option<String>,
    #[serde(default)]
    pub prefer_ipv6: bool,
}

/// The single-instance coordinator the host drives. Start and stop are
/// serialized and idempotent; everything else snapshots the running state
/// and never holds the lifecycle lock across a wait.
pub struct Controller {
    callbacks: Arc<dyn HostCallbacks>,
    builder: Arc<dyn EngineBuilder>,
    resolver: Arc<dyn NameResolver>,
    lifecycle: smol::lock::Mutex<()>,
    state: RwLock<Option<Running>>,
}

struct Running {
    engine: Arc<dyn Engine>,
    close_signal: Arc<ManualResetEvent>,
}

impl Controller {
    pub fn new(callbacks: Arc<dyn HostCallbacks>, builder: Arc<dyn EngineBuilder>) -> Self {
        Self {
            callbacks,
            builder,
            resolver: Arc::new(SystemResolver),
            lifecycle: smol::lock::Mutex::new(()),
            state: RwLock::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.read().is_some()
    }

    /// Builds and starts the engine with the protected dialer installed as
    /// its system dialer, and kicks off preparation of the primary server.
    /// A no-op when already running.
    pub async fn start(&self, opts: StartOptions) -> Result<(), ControlError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.state.read().is_some() {
            tracing::debug!("start requested while already running");
            return Ok(());
        }
        let config: serde_json::Value = serde_json::from_str(&opts.config_json)
            .map_err(|e| ControlError::ConfigInvalid(e.into()))?;

        let close_signal = Arc::new(ManualResetEvent::new(false));
        let dialer = Arc::new(ProtectedDialer::new(
            self.callbacks.clone(),
            self.resolver.clone(),
            opts.prefer_ipv6,
        ));
        let engine = self
            .builder
            .build(&config, DynDialer::from_arc(dialer.clone()))
            .map_err(ControlError::StartFailed)?;

        if let Some(domain) = opts.primary_server.filter(|s| !s.is_empty()) {
            let dialer = dialer.clone();
            let cancel = close_signal.clone();
            let prefer_ipv6 = opts.prefer_ipv6;
            smolscale::spawn(async move {
                dialer.prepare_domain(&domain, cancel, prefer_ipv6).await
            })
            .detach();
        }

        if let Err(err) = engine.start() {
            // also cuts short an in-flight preparation
            close_signal.set();
            return Err(ControlError::StartFailed(err));
        }
        self.callbacks.startup();
        self.callbacks.emit_status(0, "started");
        *self.state.write() = Some(Running {
            engine,
            close_signal,
        });
        tracing::info!("engine started");
        Ok(())
    }

    /// Tears the engine down, which closes every socket it owns. A no-op when
    /// not running.
    pub async fn stop(&self) -> Result<(), ControlError> {
        let _lifecycle = self.lifecycle.lock().await;
        let Some(running) = self.state.write().take() else {
            tracing::debug!("stop requested while not running");
            return Ok(());
        };
        let closed = running.engine.close();
        running.close_signal.set();
        self.callbacks.shutdown();
        self.callbacks.emit_status(0, "closed");
        tracing::info!("engine closed");
        closed.map_err(ControlError::CoreClose)
    }

    /// Drains one outbound traffic counter. Reads 0 when the engine is not
    /// running or the counter does not exist.
    pub fn query_stats(&self, tag: &str, direction: Direction) -> i64 {
        match &*self.state.read() {
            Some(running) => running
                .engine
                .stats()
                .read_and_reset(&traffic_counter_name(tag, direction)),
            None => 0,
        }
    }

    /// Times one HTTP GET through the running engine. Aborted by [Controller::stop].
    pub async fn measure_delay(&self, url: &str) -> Result<u64, ControlError> {
        let (engine, close_signal) = {
            let state = self.state.read();
            let running = state
                .as_ref()
                .ok_or_else(|| ControlError::ProbeFailed(anyhow!("engine is not running")))?;
            (running.engine.clone(), running.close_signal.clone())
        };
        http_ping(&engine, url, &close_signal).await
    }
}

/// Checks that a configuration parses and that the engine accepts it, without
/// starting anything.
pub fn test_config(builder: &dyn EngineBuilder, config_json: &str) -> Result<(), ControlError> {
    let config: serde_json::Value =
        serde_json::from_str(config_json).map_err(|e| ControlError::ConfigInvalid(e.into()))?;
    builder
        .build(&config, DynDialer::new(PlainDialer))
        .map_err(ControlError::ConfigInvalid)?;
    Ok(())
}
