//! Tracing subscriber setup for binaries embedding the engine.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global tracing subscriber.
///
/// `default_filter` applies when `RUST_LOG` is unset (e.g. `"kernel_agents=info"`).
/// With `json`, log lines are emitted as structured JSON.
///
/// # Errors
/// Returns error if a global subscriber is already installed.
pub fn init_tracing(
    default_filter: &str,
    json: bool,
) -> Result<(), tracing_subscriber::util::TryInitError> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
    }
}
