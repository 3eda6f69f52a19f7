//! Detection protocols spoken by the two generations of tunnel binary.
//!
//! - [`streaming`]: long-running subprocess whose output is scanned for
//!   sentinel lines.
//! - [`structured`]: synchronous `-d start` / `-d stop` invocations that print
//!   one JSON status record.
//!
//! The protocol is chosen once per binary from its reported version.

pub mod classify;
pub mod streaming;
pub mod structured;

use std::future::Future;
use std::path::Path;

pub use streaming::StreamingProtocol;
pub use structured::{StatusRecord, StructuredProtocol};

use crate::command::CommandLine;
use crate::config::{ProtocolPreference, SupervisorConfig};
use crate::error::Result;
use crate::notifier::{StateNotifier, TunnelState};
use crate::options::TunnelOptions;
use crate::provision::BinaryVersion;

/// First major version that speaks the structured protocol.
pub const STRUCTURED_SINCE_MAJOR: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    Structured,
    Streaming,
}

impl ProtocolKind {
    /// Resolve a preference against the version the binary reported.
    /// Without a known version, `auto` means the current generation.
    pub fn select(preference: ProtocolPreference, version: Option<BinaryVersion>) -> Self {
        match preference {
            ProtocolPreference::Structured => Self::Structured,
            ProtocolPreference::Streaming => Self::Streaming,
            ProtocolPreference::Auto => match version {
                Some(v) if v.major < STRUCTURED_SINCE_MAJOR => Self::Streaming,
                _ => Self::Structured,
            },
        }
    }
}

impl std::fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Structured => write!(f, "structured"),
            Self::Streaming => write!(f, "streaming"),
        }
    }
}

/// What a supervisor needs from a protocol implementation.
pub trait TunnelProtocol {
    /// The argv a `start` with these options would run.
    fn start_command(&self, binary: &Path, options: &TunnelOptions) -> Result<CommandLine>;

    /// Start the tunnel and return once it is connected or has failed.
    fn start(
        &mut self,
        binary: &Path,
        options: &TunnelOptions,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Stop the tunnel. Does nothing if none is running.
    fn stop(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Whether the tunnel process is still alive.
    fn is_running(&self) -> impl Future<Output = Result<bool>> + Send;

    fn reported_state(&self) -> TunnelState;

    /// OS process id of the tunnel, if one is tracked.
    fn pid(&self) -> Option<u32>;
}

/// The protocol selected for a binary.
#[derive(Debug)]
pub enum ProtocolDriver {
    Structured(StructuredProtocol),
    Streaming(StreamingProtocol),
}

impl ProtocolDriver {
    pub fn new(kind: ProtocolKind, config: SupervisorConfig, notifier: StateNotifier) -> Self {
        match kind {
            ProtocolKind::Structured => Self::Structured(StructuredProtocol::new(config, notifier)),
            ProtocolKind::Streaming => Self::Streaming(StreamingProtocol::new(config, notifier)),
        }
    }

    pub const fn kind(&self) -> ProtocolKind {
        match self {
            Self::Structured(_) => ProtocolKind::Structured,
            Self::Streaming(_) => ProtocolKind::Streaming,
        }
    }
}

impl TunnelProtocol for ProtocolDriver {
    fn start_command(&self, binary: &Path, options: &TunnelOptions) -> Result<CommandLine> {
        match self {
            Self::Structured(p) => p.start_command(binary, options),
            Self::Streaming(p) => p.start_command(binary, options),
        }
    }

    async fn start(&mut self, binary: &Path, options: &TunnelOptions) -> Result<()> {
        match self {
            Self::Structured(p) => p.start(binary, options).await,
            Self::Streaming(p) => p.start(binary, options).await,
        }
    }

    async fn stop(&mut self) -> Result<()> {
        match self {
            Self::Structured(p) => p.stop().await,
            Self::Streaming(p) => p.stop().await,
        }
    }

    async fn is_running(&self) -> Result<bool> {
        match self {
            Self::Structured(p) => p.is_running().await,
            Self::Streaming(p) => p.is_running().await,
        }
    }

    fn reported_state(&self) -> TunnelState {
        match self {
            Self::Structured(p) => p.reported_state(),
            Self::Streaming(p) => p.reported_state(),
        }
    }

    fn pid(&self) -> Option<u32> {
        match self {
            Self::Structured(p) => p.pid(),
            Self::Streaming(p) => p.pid(),
        }
    }
}
