//! Tunnel subcommands: `start`, `stop`, `status` and `provision`.

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use tracing::{info, warn};

use tunnelward_core::config::SupervisorConfig;
use tunnelward_core::liveness;
use tunnelward_core::protocol::ProtocolKind;
use tunnelward_core::provision::BinaryProvisioner;
use tunnelward_core::{StartOutcome, TunnelOptions, TunnelState, TunnelSupervisor};

#[derive(clap::Subcommand, Debug)]
pub enum TunnelAction {
    /// Start a tunnel.
    ///
    /// A structured-protocol tunnel runs as a daemon: its PID is printed and
    /// the command exits. A streaming-protocol tunnel stays in the foreground
    /// until Ctrl-C.
    Start {
        #[command(flatten)]
        tunnel: TunnelArgs,

        /// Log file the tunnel writes to (streaming protocol)
        #[arg(long)]
        log_file: Option<PathBuf>,

        /// Protocol override: auto, structured or streaming
        #[arg(long)]
        protocol: Option<String>,

        /// Print the command vector instead of starting the tunnel
        #[arg(long)]
        print_command: bool,
    },

    /// Stop a structured-protocol tunnel identified by its options.
    Stop {
        #[command(flatten)]
        tunnel: TunnelArgs,
    },

    /// Report whether a process is alive. Exits 0 if it is, 1 if not.
    Status {
        #[arg(long)]
        pid: u32,
    },

    /// Download and validate the tunnel binary, then print where it is.
    Provision {
        /// Validate this binary instead of the cached download
        #[arg(long)]
        binary_path: Option<PathBuf>,
    },
}

/// Options shared by `start` and `stop`.
#[derive(clap::Args, Debug)]
pub struct TunnelArgs {
    /// Access key
    #[arg(long, env = "BROWSERSTACK_ACCESS_KEY", hide_env_values = true)]
    key: Option<String>,

    /// Use this tunnel binary instead of downloading one
    #[arg(long)]
    binary_path: Option<PathBuf>,

    /// Extra tunnel option as `name=value`, or `name` alone for a flag
    #[arg(short = 'o', long = "option", value_parser = parse_option_arg)]
    options: Vec<OptionArg>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionArg {
    name: String,
    value: Option<String>,
}

fn parse_option_arg(raw: &str) -> Result<OptionArg, String> {
    let (name, value) = match raw.split_once('=') {
        Some((name, value)) => (name.trim(), Some(value.to_string())),
        None => (raw.trim(), None),
    };
    if name.is_empty() {
        return Err(format!("option name missing in {raw:?}"));
    }
    Ok(OptionArg {
        name: name.to_string(),
        value,
    })
}

impl TunnelArgs {
    fn to_options(&self) -> TunnelOptions {
        let mut options = TunnelOptions::new();
        for arg in &self.options {
            match &arg.value {
                Some(value) => options.insert(arg.name.clone(), value.clone()),
                None => options.insert_flag(arg.name.clone()),
            }
        }
        // Dedicated flags win over `-o` duplicates.
        if let Some(key) = &self.key {
            options.insert("key", key.clone());
        }
        if let Some(path) = &self.binary_path {
            options.insert("binarypath", path.display().to_string());
        }
        options
    }
}

/// Execute a tunnel subcommand.
pub async fn run(action: TunnelAction, mut config: SupervisorConfig) -> Result<ExitCode> {
    match action {
        TunnelAction::Start {
            tunnel,
            log_file,
            protocol,
            print_command,
        } => {
            if let Some(protocol) = protocol {
                config.protocol = protocol.parse()?;
            }
            let mut options = tunnel.to_options();
            if let Some(path) = log_file {
                options.insert("logfile", path.display().to_string());
            }
            if print_command {
                options.insert("onlyCommand", "true");
            }
            start(config, &options).await
        }
        TunnelAction::Stop { tunnel } => stop(config, &tunnel.to_options()).await,
        TunnelAction::Status { pid } => Ok(exit_code(status(pid).await?)),
        TunnelAction::Provision { binary_path } => provision(&config, binary_path).await,
    }
}

async fn start(config: SupervisorConfig, options: &TunnelOptions) -> Result<ExitCode> {
    let mut supervisor = TunnelSupervisor::new(config);
    let outcome = supervisor
        .start(options)
        .await
        .context("Failed to start tunnel")?;

    let mut out = io::stdout();
    if let StartOutcome::CommandOnly(command) = outcome {
        writeln!(out, "{command}")?;
        return Ok(ExitCode::SUCCESS);
    }

    let pid = supervisor
        .pid()
        .map_or_else(|| "unknown".to_string(), |p| p.to_string());
    if supervisor.protocol() == Some(ProtocolKind::Structured) {
        writeln!(out, "{pid}")?;
        return Ok(ExitCode::SUCCESS);
    }

    writeln!(out, "Tunnel connected (pid {pid}). Press Ctrl-C to stop.")?;
    run_foreground(&mut supervisor).await
}

/// Hold a streaming tunnel until Ctrl-C, SIGTERM, or until it stops being
/// connected.
async fn run_foreground(supervisor: &mut TunnelSupervisor) -> Result<ExitCode> {
    let mut signals = ShutdownSignal::install()?;
    let interrupted = hold(supervisor, signals.recv()).await?;
    Ok(exit_code(interrupted))
}

/// Wait for `shutdown` or for the tunnel to leave `Connected`, then stop it.
/// Returns whether `shutdown` fired.
async fn hold(
    supervisor: &mut TunnelSupervisor,
    shutdown: impl Future<Output = Result<&'static str>>,
) -> Result<bool> {
    let mut state = supervisor.notifier().subscribe();
    let interrupted = tokio::select! {
        biased;
        signal = shutdown => {
            let signal = signal?;
            info!(signal, "Shutdown signal received, stopping tunnel");
            true
        }
        _ = state.wait_for(|s| *s != TunnelState::Connected) => {
            warn!(state = %supervisor.state(), error = ?supervisor.last_error(), "Tunnel is no longer connected");
            false
        }
    };

    supervisor.stop().await.context("Failed to stop tunnel")?;
    Ok(interrupted)
}

/// Ctrl-C, plus SIGTERM on unix. Handlers are registered by [`install`], so
/// a signal delivered before [`recv`] is polled is not lost and does not
/// take the default action of ending the process.
///
/// [`install`]: ShutdownSignal::install
/// [`recv`]: ShutdownSignal::recv
struct ShutdownSignal {
    #[cfg(unix)]
    sigterm: tokio::signal::unix::Signal,
}

impl ShutdownSignal {
    fn install() -> Result<Self> {
        Ok(Self {
            #[cfg(unix)]
            sigterm: tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("Failed to listen for SIGTERM")?,
        })
    }

    /// Name of the signal that arrived.
    async fn recv(&mut self) -> Result<&'static str> {
        #[cfg(unix)]
        let sigterm = self.sigterm.recv();
        #[cfg(not(unix))]
        let sigterm = std::future::pending::<Option<()>>();

        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                Ok("SIGINT")
            }
            _ = sigterm => Ok("SIGTERM"),
        }
    }
}

fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

async fn stop(config: SupervisorConfig, options: &TunnelOptions) -> Result<ExitCode> {
    let mut supervisor = TunnelSupervisor::new(config);
    supervisor
        .stop_with(options)
        .await
        .context("Failed to stop tunnel")?;
    let mut out = io::stdout();
    writeln!(out, "Tunnel stopped")?;
    Ok(ExitCode::SUCCESS)
}

async fn status(pid: u32) -> Result<bool> {
    let alive = liveness::is_alive(pid)
        .await
        .with_context(|| format!("Failed to check process {pid}"))?;
    let mut out = io::stdout();
    if alive {
        writeln!(out, "Process {pid} is running")?;
    } else {
        writeln!(out, "Process {pid} is not running")?;
    }
    Ok(alive)
}

async fn provision(config: &SupervisorConfig, binary_path: Option<PathBuf>) -> Result<ExitCode> {
    let provisioner = BinaryProvisioner::new(config.vendor.clone())?;
    let info = provisioner
        .ensure_binary(binary_path.as_deref())
        .await
        .context("Failed to provision tunnel binary")?;
    let protocol = ProtocolKind::select(config.protocol, Some(info.version));

    let mut out = io::stdout();
    writeln!(out, "Binary:   {}", info.path.display())?;
    writeln!(out, "Version:  {}", info.version)?;
    writeln!(out, "Protocol: {protocol}")?;
    Ok(ExitCode::SUCCESS)
}
