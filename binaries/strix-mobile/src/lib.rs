pub use callback::HostCallbacks;
pub use controller::{Controller, StartOptions, test_config};
pub use dialer::ProtectedDialer;
pub use endpoint::ResolvedEndpoint;
pub use engine::{Engine, EngineBuilder};
pub use env::{init_environment, read_asset, set_asset_fallback};
pub use errors::{ControlError, DialError};
pub use logging::init_logging;
pub use probe::{DEFAULT_PROBE_URL, measure_outbound_delay};
pub use resolver::{NameResolver, SystemResolver};
pub use stats::{Direction, StatsRegistry, traffic_counter_name};

mod callback;
mod controller;
mod dialer;
mod endpoint;
mod engine;
mod env;
mod errors;
mod logging;
mod probe;
mod resolver;
mod stats;

use std::sync::Arc;

/// Monotonically increasing version of this binding.
pub const LIB_VERSION: u32 = 9;

/// Creates the single controller instance the host drives. The builder is
/// the embedder's link to the engine crate; everything the engine dials goes
/// through the protected dialer the controller installs at start.
pub fn new_controller(
    callbacks: Arc<dyn HostCallbacks>,
    builder: Arc<dyn EngineBuilder>,
) -> Controller {
    Controller::new(callbacks, builder)
}

/// A human-readable version string covering both the binding and the engine
/// it embeds.
pub fn version(builder: &dyn EngineBuilder) -> String {
    format!("Strix Mobile v{LIB_VERSION}, core v{}", builder.core_version())
}
