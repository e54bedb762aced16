use std::sync::Arc;

use async_trait::async_trait;
use filament::{Pipe, dialer::DynDialer};

use crate::stats::StatsRegistry;

/// The proxy engine, consumed as an opaque library. The binding never looks
/// inside: it builds one from a configuration, starts and closes it, opens
/// tunnelled connections through it for the latency probe, and reads its
/// traffic counters.
#[async_trait]
pub trait Engine: Send + Sync + 'static {
    fn start(&self) -> anyhow::Result<()>;

    fn close(&self) -> anyhow::Result<()>;

    /// Opens a connection to `dest` ("host:port") routed through the engine's
    /// configured outbounds, the same path user traffic takes.
    async fn open_conn(&self, dest: &str) -> std::io::Result<Box<dyn Pipe>>;

    fn stats(&self) -> Arc<StatsRegistry>;
}

/// Constructs engines from configuration. The embedder links the real engine
/// crate and hands its builder to [crate::new_controller]; the dialer passed
/// here becomes the engine's system dialer, used for every outbound socket
/// the engine opens.
pub trait EngineBuilder: Send + Sync + 'static {
    fn build(
        &self,
        config: &serde_json::Value,
        dialer: DynDialer,
    ) -> anyhow::Result<Arc<dyn Engine>>;

    fn core_version(&self) -> String;
}
