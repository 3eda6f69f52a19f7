//! Tunnelward Core Library
//!
//! Client-side supervision of a vendor tunnel binary:
//! - Platform detection, download and validation of the binary
//! - Translation of tunnel options into the binary's argv
//! - Streaming and structured detection protocols
//! - Tunnel state tracking with observer hooks
//! - Configuration resolution and tracing setup

pub mod command;
pub mod config;
pub mod error;
pub mod liveness;
pub mod notifier;
pub mod options;
pub mod platform;
pub mod protocol;
pub mod provision;
pub mod supervisor;
pub mod tracing_init;

pub use config::SupervisorConfig;
pub use error::{Result, TunnelError};
pub use notifier::{TunnelObserver, TunnelState};
pub use options::TunnelOptions;
pub use protocol::{ProtocolKind, TunnelProtocol};
pub use supervisor::{StartOutcome, TunnelSupervisor};
