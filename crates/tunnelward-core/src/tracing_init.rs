//! Process-wide tracing setup.
//!
//! Logs always go to stderr: the CLI keeps stdout for command vectors, PIDs
//! and status lines that scripts consume.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::{Result, TunnelError};

/// Crates whose events are shown at the requested level.
const LOG_TARGETS: &[&str] = &["tunnelward", "tunnelward_core"];

/// Filter directives for `level`, e.g. `tunnelward=debug,tunnelward_core=debug`.
pub fn default_directives(level: &str) -> String {
    LOG_TARGETS
        .iter()
        .map(|target| format!("{target}={}", level.trim()))
        .collect::<Vec<_>>()
        .join(",")
}

/// Install the global subscriber.
///
/// `RUST_LOG`, when set, replaces the directives built from `level`. With
/// `log_json` every event is one JSON object per line.
pub fn init_tracing(level: &str, log_json: bool) -> Result<()> {
    let filter = match std::env::var("RUST_LOG") {
        Ok(directives) if !directives.trim().is_empty() => EnvFilter::try_new(directives),
        _ => EnvFilter::try_new(default_directives(level)),
    }
    .map_err(|e| TunnelError::Config(format!("invalid log filter: {e}")))?;

    let layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry().with(filter);
    let installed = if log_json {
        registry.with(layer.json()).try_init()
    } else {
        registry.with(layer).try_init()
    };
    installed.map_err(|e| TunnelError::Config(format!("tracing already initialised: {e}")))
}
