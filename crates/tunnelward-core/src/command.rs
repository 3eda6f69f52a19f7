//! Command-line synthesis for the tunnel binary.
//!
//! Every forwarded option becomes one independent flag group, so the order in
//! which options are visited does not change the meaning of the command.

use std::fmt;
use std::path::Path;

use crate::error::{Result, TunnelError};
use crate::options::{TunnelOptions, is_truthy};

/// Bumped whenever an entry of [`PARAMETERS`] changes meaning.
pub const CLASSIFICATION_VERSION: u32 = 2;

/// How a known option is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// `-flag <value>`, or `-flag` alone when the value is absent.
    Value(&'static str),
    /// `-flag` with the value ignored; omitted when the value is `"false"`.
    Presence(&'static str),
}

/// Known options keyed by lowercase name.
const PARAMETERS: &[(&str, ParamKind)] = &[
    ("f", ParamKind::Value("-f")),
    ("only", ParamKind::Value("-only")),
    ("hosts", ParamKind::Value("-hosts")),
    ("localidentifier", ParamKind::Value("-localIdentifier")),
    ("proxyhost", ParamKind::Value("-proxyHost")),
    ("proxyport", ParamKind::Value("-proxyPort")),
    ("proxyuser", ParamKind::Value("-proxyUser")),
    ("proxypass", ParamKind::Value("-proxyPass")),
    ("v", ParamKind::Presence("-vvv")),
    ("verbose", ParamKind::Presence("-vvv")),
    ("force", ParamKind::Presence("-force")),
    ("forcelocal", ParamKind::Presence("-forcelocal")),
    ("forceproxy", ParamKind::Presence("-forceproxy")),
    ("onlyautomate", ParamKind::Presence("-onlyAutomate")),
];

/// Look up the rendering of `key`; `None` means pass it through verbatim.
pub fn classify(key: &str) -> Option<ParamKind> {
    let key = key.trim();
    PARAMETERS
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(key))
        .map(|(_, kind)| *kind)
}

/// Operation requested from a structured-protocol binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Start,
    Stop,
}

impl OpCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
        }
    }
}

/// Protocol-specific leading flags.
#[derive(Debug, Clone, Copy)]
pub enum Invocation<'a> {
    /// `-d <start|stop>`
    Structured(OpCode),
    /// `-logFile <path>`
    Streaming { log_file: &'a Path },
}

/// Ordered argv for the tunnel binary, program first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine(Vec<String>);

impl CommandLine {
    pub fn program(&self) -> &str {
        self.0.first().map_or("", String::as_str)
    }

    pub fn args(&self) -> &[String] {
        self.0.get(1..).unwrap_or_default()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<String> {
        self.0
    }

    pub fn contains(&self, arg: &str) -> bool {
        self.0.iter().any(|a| a == arg)
    }

    /// Index of the first occurrence of `arg`.
    pub fn position(&self, arg: &str) -> Option<usize> {
        self.0.iter().position(|a| a == arg)
    }

    /// A `tokio` command for this argv with no stdio configured.
    pub fn to_command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(self.program());
        cmd.args(self.args());
        cmd
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(" "))
    }
}

/// Build the argv for one invocation of the tunnel binary.
///
/// Layout: program, protocol flags, access key, then one group per forwarded
/// option. Fails with [`TunnelError::MissingAccessKey`] when `key` is absent.
pub fn build_command(
    binary: &Path,
    options: &TunnelOptions,
    invocation: Invocation<'_>,
) -> Result<CommandLine> {
    let key = options.access_key().ok_or(TunnelError::MissingAccessKey)?;

    let mut argv = vec![binary.display().to_string()];
    match invocation {
        Invocation::Structured(op) => {
            argv.push("-d".to_string());
            argv.push(op.as_str().to_string());
        }
        Invocation::Streaming { log_file } => {
            argv.push("-logFile".to_string());
            argv.push(log_file.display().to_string());
        }
    }
    argv.push(key.to_string());

    for (name, value) in options.forwarded() {
        let value = value.map(str::trim).filter(|v| !v.is_empty());
        match classify(name) {
            Some(ParamKind::Presence(flag)) => {
                if is_truthy(value) {
                    argv.push(flag.to_string());
                }
            }
            Some(ParamKind::Value(flag)) => {
                argv.push(flag.to_string());
                argv.extend(value.map(str::to_string));
            }
            None => {
                argv.push(format!("-{name}"));
                argv.extend(value.map(str::to_string));
            }
        }
    }

    Ok(CommandLine(argv))
}
