//! Structured protocol: `-d start` and `-d stop` run to completion and print
//! one JSON status record.
//!
//! The tunnel itself is a daemon the binary detaches, so only its PID is
//! tracked. Liveness is answered by [`crate::liveness`].

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::TunnelProtocol;
use crate::command::{CommandLine, Invocation, OpCode, build_command};
use crate::config::SupervisorConfig;
use crate::error::{Result, TunnelError};
use crate::liveness;
use crate::notifier::{StateNotifier, TunnelState};
use crate::options::TunnelOptions;

#[derive(Debug)]
pub struct StructuredProtocol {
    config: SupervisorConfig,
    notifier: StateNotifier,
    pid: Option<u32>,
    /// Binary and options of the last successful start, reused by `stop`.
    started_with: Option<(PathBuf, TunnelOptions)>,
}

/// A status record as printed by the binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusRecord {
    Connected { pid: u32 },
    Failed { state: String, message: String },
}

/// Loose wire shape. `pid` may be a number or a numeric string; `message` may
/// be a string or an object with a `message` field.
#[derive(Debug, Deserialize)]
struct RawStatus {
    state: String,
    #[serde(default)]
    pid: Option<Value>,
    #[serde(default)]
    message: Option<Value>,
}

impl StatusRecord {
    /// Parse the record from a completed invocation: stdout, or stderr when
    /// stdout is blank.
    pub fn from_output(stdout: &str, stderr: &str) -> Result<Self> {
        let text = if stdout.trim().is_empty() {
            stderr
        } else {
            stdout
        };
        Self::parse(text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let raw = parse_raw(text)?;

        if raw.state.trim().eq_ignore_ascii_case("connected") {
            let pid = raw.pid.as_ref().and_then(pid_value).ok_or_else(|| {
                TunnelError::Protocol(format!(
                    "connected status without a valid pid: {}",
                    text.trim()
                ))
            })?;
            return Ok(Self::Connected { pid });
        }

        let message = raw
            .message
            .as_ref()
            .and_then(message_value)
            .unwrap_or_else(|| format!("tunnel reported state {:?}", raw.state));
        Ok(Self::Failed {
            state: raw.state,
            message,
        })
    }
}

/// The whole text as JSON, else the outermost `{...}` span in it.
fn parse_raw(text: &str) -> Result<RawStatus> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(TunnelError::Protocol("empty status output".to_string()));
    }
    if let Ok(raw) = serde_json::from_str(trimmed) {
        return Ok(raw);
    }
    let span = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => &trimmed[start..=end],
        _ => trimmed,
    };
    serde_json::from_str(span)
        .map_err(|e| TunnelError::Protocol(format!("{e} in {trimmed:?}")))
}

fn pid_value(value: &Value) -> Option<u32> {
    let pid = match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    pid.filter(|pid| *pid != 0)
}

fn message_value(value: &Value) -> Option<String> {
    let text = match value {
        Value::Null => return None,
        Value::String(s) => s.clone(),
        Value::Object(map) => match map.get("message") {
            Some(Value::String(s)) => s.clone(),
            _ => value.to_string(),
        },
        other => other.to_string(),
    };
    Some(text).filter(|t| !t.trim().is_empty())
}

impl StructuredProtocol {
    pub const fn new(config: SupervisorConfig, notifier: StateNotifier) -> Self {
        Self {
            config,
            notifier,
            pid: None,
            started_with: None,
        }
    }

    /// Run `-d stop` with `options` instead of those the tunnel was started
    /// with.
    pub async fn stop_with(&mut self, binary: &Path, options: &TunnelOptions) -> Result<()> {
        let command = build_command(binary, options, Invocation::Structured(OpCode::Stop))?;
        let output = self.run(&command).await?;
        log_stop_output(&output);

        info!(pid = ?self.pid, "Tunnel stopped");
        self.pid = None;
        self.started_with = None;
        self.notifier.transition(TunnelState::Disconnected);
        Ok(())
    }

    /// Run one invocation to completion, bounded by the connect wait budget.
    async fn run(&self, command: &CommandLine) -> Result<Output> {
        let budget = self.config.connect_wait() * self.config.connect_attempts.max(1);
        let mut cmd = command.to_command();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match tokio::time::timeout(budget, cmd.output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(TunnelError::ProcessLaunch {
                program: command.program().to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(TunnelError::ConnectTimeout {
                service: self.config.vendor.service_name.clone(),
            }),
        }
    }
}

fn log_stop_output(output: &Output) {
    let stdout = String::from_utf8_lossy(&output.stdout);
    if output.status.success() {
        debug!(status = ?output.status, output = %stdout.trim(), "Stop invocation finished");
    } else {
        warn!(
            status = ?output.status,
            stdout = %stdout.trim(),
            stderr = %String::from_utf8_lossy(&output.stderr).trim(),
            "Stop invocation failed"
        );
    }
}

impl TunnelProtocol for StructuredProtocol {
    fn start_command(&self, binary: &Path, options: &TunnelOptions) -> Result<CommandLine> {
        build_command(binary, options, Invocation::Structured(OpCode::Start))
    }

    async fn start(&mut self, binary: &Path, options: &TunnelOptions) -> Result<()> {
        let command = self.start_command(binary, options)?;
        if self.pid.is_some() {
            self.stop().await?;
        }

        let output = match self.run(&command).await {
            Ok(output) => output,
            Err(e) => {
                self.notifier.fail(e.to_string());
                return Err(e);
            }
        };
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!(status = ?output.status, stdout = %stdout.trim(), "Start invocation finished");

        match StatusRecord::from_output(&stdout, &stderr) {
            Ok(StatusRecord::Connected { pid }) => {
                info!(pid, "Tunnel daemon started");
                self.pid = Some(pid);
                self.started_with = Some((binary.to_path_buf(), options.clone()));
                self.notifier.transition(TunnelState::Connected);
                Ok(())
            }
            Ok(StatusRecord::Failed { state, message }) => {
                warn!(%state, %message, "Tunnel failed to start");
                self.notifier.fail(message.clone());
                Err(TunnelError::TunnelReported(message))
            }
            Err(e) => {
                self.notifier.fail(e.to_string());
                Err(e)
            }
        }
    }

    async fn stop(&mut self) -> Result<()> {
        if self.pid.is_none() {
            return Ok(());
        }
        let Some((binary, options)) = self.started_with.clone() else {
            return Ok(());
        };
        self.stop_with(&binary, &options).await
    }

    async fn is_running(&self) -> Result<bool> {
        match self.pid {
            Some(pid) => liveness::is_alive(pid).await,
            None => Ok(false),
        }
    }

    fn reported_state(&self) -> TunnelState {
        self.notifier.state()
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}
