use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Installs the library's tracing subscriber: compact output on stderr,
/// filtered by `RUST_LOG` with a debug default for this crate. Best-effort —
/// when the host process already installed a subscriber, the failure is
/// swallowed and the host's stays.
pub fn init_logging() {
    if let Err(err) = try_init_logging() {
        tracing::debug!(err = debug(&err), "logging already initialized elsewhere");
    }
}

fn try_init_logging() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().compact().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive("strix_mobile=debug".parse()?)
                .from_env_lossy(),
        )
        .try_init()?;
    Ok(())
}
