//! Error types for the tunnel supervisor.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using [`TunnelError`].
pub type Result<T> = std::result::Result<T, TunnelError>;

/// Errors surfaced by provisioning, command synthesis and supervision.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// No tunnel artifact is published for this OS/architecture.
    #[error("Unsupported platform: {os}/{arch}")]
    UnsupportedPlatform { os: String, arch: String },

    /// None of the candidate install directories exists or could be created.
    #[error("No writable location for the tunnel binary (tried: {})", display_paths(.tried))]
    NoWritableLocation { tried: Vec<PathBuf> },

    #[error("Failed to download tunnel binary from {url}: {reason}")]
    Download { url: String, reason: String },

    /// The binary did not answer the version query with the expected pattern,
    /// even after one re-download.
    #[error("Tunnel binary at {} is corrupt (version output: {output:?})", .path.display())]
    CorruptBinary { path: PathBuf, output: String },

    #[error("Failed to launch {program}: {reason}")]
    ProcessLaunch { program: String, reason: String },

    /// The structured status record could not be understood.
    #[error("Malformed tunnel status: {0}")]
    Protocol(String),

    /// Failure message reported by the tunnel binary itself, verbatim.
    #[error("{0}")]
    TunnelReported(String),

    #[error("Failed to connect to {service}")]
    ConnectTimeout { service: String },

    #[error("Failed to check whether process {pid} is alive: {reason}")]
    Liveness { pid: u32, reason: String },

    #[error("Missing access key: the `key` option is required to start a tunnel")]
    MissingAccessKey,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
