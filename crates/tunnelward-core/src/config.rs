//! Configuration resolution for the tunnel supervisor.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (`<config dir>/tunnelward/settings.json`)
//! 3. Environment variables
//! 4. CLI arguments (applied by the caller, highest priority)

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TunnelError};

/// Complete supervisor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub vendor: VendorProfile,
    /// Which detection protocol to drive the binary with.
    pub protocol: ProtocolPreference,
    /// Where the streaming protocol reads its sentinel lines from.
    pub stream_source: StreamSource,
    /// Length of one connect wait cycle.
    pub connect_wait_secs: u64,
    /// Number of wait cycles before a streaming start is declared failed.
    pub connect_attempts: u32,
    /// Interval at which `stop` re-checks that a killed tunnel has exited.
    pub stop_poll_interval_ms: u64,
    /// Upper bound on how long `stop` waits for a killed tunnel to exit.
    pub terminate_timeout_secs: u64,
    /// Backoff between reads when a tailed log file is at EOF.
    pub log_poll_interval_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            vendor: VendorProfile::default(),
            protocol: ProtocolPreference::Auto,
            stream_source: StreamSource::Stdout,
            connect_wait_secs: 30,
            connect_attempts: 2,
            stop_poll_interval_ms: 1000,
            terminate_timeout_secs: 10,
            log_poll_interval_ms: 250,
        }
    }
}

impl SupervisorConfig {
    pub const fn connect_wait(&self) -> Duration {
        Duration::from_secs(self.connect_wait_secs)
    }

    pub const fn stop_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stop_poll_interval_ms)
    }

    pub const fn terminate_timeout(&self) -> Duration {
        Duration::from_secs(self.terminate_timeout_secs)
    }

    pub const fn log_poll_interval(&self) -> Duration {
        Duration::from_millis(self.log_poll_interval_ms)
    }
}

/// Everything that ties the supervisor to one tunnel vendor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VendorProfile {
    /// Base URL the platform artifact name is appended to.
    pub download_base_url: String,
    /// File name of the cached executable (without `.exe`).
    pub binary_name: String,
    /// Product name printed by `--version`, e.g. `"<product> version 8.4"`.
    pub product_name: String,
    /// Service name used in user-facing messages.
    pub service_name: String,
    /// Directory created under the home directory for the binary cache.
    pub cache_dir_name: String,
}

impl Default for VendorProfile {
    fn default() -> Self {
        Self {
            download_base_url: "https://www.browserstack.com/local-testing/downloads/binaries/"
                .to_string(),
            binary_name: "BrowserStackLocal".to_string(),
            product_name: "BrowserStack Local".to_string(),
            service_name: "BrowserStack".to_string(),
            cache_dir_name: ".browserstack".to_string(),
        }
    }
}

/// Protocol selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolPreference {
    /// Pick by the version the binary reports.
    #[default]
    Auto,
    Structured,
    Streaming,
}

impl std::str::FromStr for ProtocolPreference {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "structured" => Ok(Self::Structured),
            "streaming" => Ok(Self::Streaming),
            other => Err(TunnelError::Config(format!(
                "unknown protocol {other:?} (expected auto, structured or streaming)"
            ))),
        }
    }
}

/// Output source scanned by the streaming protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamSource {
    #[default]
    Stdout,
    LogFile,
}

/// Load configuration with hierarchical resolution.
pub fn load_config(explicit_path: Option<&Path>) -> Result<SupervisorConfig> {
    let mut config = match explicit_path {
        Some(path) => load_config_file(path)?,
        None => match global_config_path() {
            Some(path) if path.exists() => load_config_file(&path)?,
            _ => SupervisorConfig::default(),
        },
    };

    apply_env_overrides(&mut config)?;
    Ok(config)
}

/// Get the global settings file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("tunnelward").join("settings.json"))
}

fn load_config_file(path: &Path) -> Result<SupervisorConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        TunnelError::Config(format!(
            "Failed to read config file {}: {}",
            path.display(),
            e
        ))
    })?;
    parse_config(&content).map_err(|e| {
        TunnelError::Config(format!(
            "Failed to parse config file {}: {}",
            path.display(),
            e
        ))
    })
}

fn parse_config(content: &str) -> std::result::Result<SupervisorConfig, serde_json::Error> {
    serde_json::from_str(content)
}

fn apply_env_overrides(config: &mut SupervisorConfig) -> Result<()> {
    apply_overrides(config, |name| std::env::var(name).ok())
}

fn apply_overrides(
    config: &mut SupervisorConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    if let Some(protocol) = lookup("TUNNELWARD_PROTOCOL") {
        config.protocol = protocol.parse()?;
    }
    if let Some(url) = lookup("TUNNELWARD_DOWNLOAD_URL") {
        config.vendor.download_base_url = url;
    }
    if let Some(secs) = lookup("TUNNELWARD_CONNECT_WAIT_SECS") {
        config.connect_wait_secs = secs.trim().parse().map_err(|_| {
            TunnelError::Config(format!("TUNNELWARD_CONNECT_WAIT_SECS is not a number: {secs:?}"))
        })?;
    }
    Ok(())
}
