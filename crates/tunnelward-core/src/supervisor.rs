//! The public entry point: resolves a binary, picks the protocol it speaks
//! and drives one tunnel through its lifecycle.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info};

use crate::command::CommandLine;
use crate::config::SupervisorConfig;
use crate::error::{Result, TunnelError};
use crate::notifier::{StateNotifier, TunnelObserver, TunnelState};
use crate::options::TunnelOptions;
use crate::protocol::{ProtocolDriver, ProtocolKind, StructuredProtocol, TunnelProtocol};
use crate::provision::{BinaryProvisioner, BinaryVersion};

/// Result of [`TunnelSupervisor::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// The tunnel reported itself connected.
    Connected,
    /// `onlyCommand` was set; nothing was launched.
    CommandOnly(CommandLine),
}

/// Supervises a single tunnel. Independent supervisors share no state.
#[derive(Debug)]
pub struct TunnelSupervisor {
    config: SupervisorConfig,
    notifier: StateNotifier,
    provisioner: Option<BinaryProvisioner>,
    driver: Option<ProtocolDriver>,
    binary: Option<PathBuf>,
    last_command: Option<CommandLine>,
}

impl TunnelSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            notifier: StateNotifier::new(),
            provisioner: None,
            driver: None,
            binary: None,
            last_command: None,
        }
    }

    /// Use `provisioner` instead of one built from the vendor profile.
    #[must_use]
    pub fn with_provisioner(mut self, provisioner: BinaryProvisioner) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    #[must_use]
    pub fn with_observer(self, observer: Arc<dyn TunnelObserver>) -> Self {
        self.notifier.set_observer(observer);
        self
    }

    pub fn set_observer(&self, observer: Arc<dyn TunnelObserver>) {
        self.notifier.set_observer(observer);
    }

    pub const fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Start a tunnel with `options`.
    ///
    /// Fails with [`TunnelError::MissingAccessKey`] before touching the disk
    /// or network when no `key` is given. With `onlyCommand` the argv is
    /// built and returned instead of launched.
    pub async fn start(&mut self, options: &TunnelOptions) -> Result<StartOutcome> {
        if options.access_key().is_none() {
            return Err(TunnelError::MissingAccessKey);
        }

        let (binary, version) = self.resolve_binary(options).await?;
        let kind = ProtocolKind::select(self.config.protocol, version);
        debug!(binary = %binary.display(), %kind, "Selected tunnel protocol");

        let driver = self.driver_for(kind).await?;
        let command = driver.start_command(&binary, options)?;
        self.last_command = Some(command.clone());
        self.binary = Some(binary.clone());

        if options.only_command() {
            info!("onlyCommand set, not launching the tunnel");
            return Ok(StartOutcome::CommandOnly(command));
        }

        let driver = self.driver_for(kind).await?;
        driver.start(&binary, options).await?;
        Ok(StartOutcome::Connected)
    }

    /// Stop the tunnel started by this supervisor. Safe to call repeatedly.
    pub async fn stop(&mut self) -> Result<()> {
        match self.driver.as_mut() {
            Some(driver) => driver.stop().await,
            None => Ok(()),
        }
    }

    /// Stop a structured-protocol tunnel using `options` for the stop
    /// invocation, e.g. to stop a tunnel started by another process.
    pub async fn stop_with(&mut self, options: &TunnelOptions) -> Result<()> {
        let known = options.binary_path().or_else(|| self.binary.clone());
        let binary = match known {
            Some(path) => path,
            None => self.resolve_binary(options).await?.0,
        };
        if let Some(ProtocolDriver::Structured(protocol)) = self.driver.as_mut() {
            return protocol.stop_with(&binary, options).await;
        }
        StructuredProtocol::new(self.config.clone(), self.notifier.clone())
            .stop_with(&binary, options)
            .await
    }

    /// Whether the tunnel process is alive.
    pub async fn is_running(&self) -> Result<bool> {
        match &self.driver {
            Some(driver) => driver.is_running().await,
            None => Ok(false),
        }
    }

    pub fn state(&self) -> TunnelState {
        self.notifier.state()
    }

    /// Message attached to the last transition into `Error`.
    pub fn last_error(&self) -> Option<String> {
        self.notifier.last_error()
    }

    /// Argv of the most recent start, launched or not.
    pub const fn command(&self) -> Option<&CommandLine> {
        self.last_command.as_ref()
    }

    pub fn pid(&self) -> Option<u32> {
        self.driver.as_ref().and_then(|d| d.pid())
    }

    pub fn protocol(&self) -> Option<ProtocolKind> {
        self.driver.as_ref().map(ProtocolDriver::kind)
    }

    pub fn notifier(&self) -> &StateNotifier {
        &self.notifier
    }

    /// The driver for `kind`, replacing (and stopping) one of another kind.
    async fn driver_for(&mut self, kind: ProtocolKind) -> Result<&mut ProtocolDriver> {
        if let Some(existing) = self.driver.as_mut().filter(|d| d.kind() != kind) {
            existing.stop().await?;
            self.driver = None;
        }
        let driver = self.driver.take().unwrap_or_else(|| {
            ProtocolDriver::new(kind, self.config.clone(), self.notifier.clone())
        });
        Ok(self.driver.insert(driver))
    }

    /// The binary to run and, when it was validated, its version.
    ///
    /// With `onlyCommand` and an explicit `binarypath`, the path is used
    /// as given without provisioning or validation.
    async fn resolve_binary(
        &mut self,
        options: &TunnelOptions,
    ) -> Result<(PathBuf, Option<BinaryVersion>)> {
        let explicit = options.binary_path();
        if let (true, Some(path)) = (options.only_command(), explicit.as_ref()) {
            return Ok((path.clone(), None));
        }

        let provisioner = match self.provisioner.take() {
            Some(p) => p,
            None => BinaryProvisioner::new(self.config.vendor.clone())?,
        };
        let provisioner = self.provisioner.insert(provisioner);
        let info = provisioner.ensure_binary(explicit.as_deref()).await?;
        info!(
            path = %info.path.display(),
            version = %info.version,
            "Tunnel binary ready"
        );
        Ok((info.path, Some(info.version)))
    }
}
