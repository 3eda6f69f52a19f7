//! Streaming protocol: one long-lived tunnel process whose output is scanned
//! for sentinel lines.
//!
//! The process is launched with `-logFile <path>`. Sentinels are read from
//! stdout, or from the tailed log file when the config says so. A waiter task
//! owns the [`Child`] and reaps it; dropping the [`RunningTunnel`] handle
//! kills the process.
//!
//! That drop guard is the shutdown hook for a host that unwinds normally.
//! A signal whose default action ends the host skips every destructor, so a
//! host that can receive SIGTERM must catch it and call `stop` itself.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::TunnelProtocol;
use super::classify::{OutputClassifier, Signal};
use crate::command::{CommandLine, Invocation, build_command};
use crate::config::{StreamSource, SupervisorConfig};
use crate::error::{Result, TunnelError};
use crate::notifier::{StateNotifier, TunnelState};
use crate::options::TunnelOptions;

/// Log file name used when the caller gives none.
pub const DEFAULT_LOG_FILE: &str = "local.log";

/// Extra time `stop` allows on top of the terminate timeout for the forced kill.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// How long a reader may take to drain once the process is gone.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

const MIN_LOG_POLL: Duration = Duration::from_millis(10);

#[derive(Debug)]
pub struct StreamingProtocol {
    config: SupervisorConfig,
    notifier: StateNotifier,
    running: Option<RunningTunnel>,
}

/// Handle to the live tunnel process.
#[derive(Debug)]
struct RunningTunnel {
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
    exited: watch::Receiver<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningTunnel {
    fn request_kill(&mut self) {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
    }

    fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    /// Kill the process, then poll every `poll` until it has been reaped or
    /// `limit` has passed.
    async fn shutdown(mut self, poll: Duration, limit: Duration) {
        self.request_kill();

        let deadline = tokio::time::Instant::now() + limit;
        while !self.has_exited() {
            if tokio::time::Instant::now() >= deadline {
                warn!(pid = ?self.pid, "Tunnel process did not exit in time");
                break;
            }
            tokio::select! {
                () = tokio::time::sleep(poll) => {}
                changed = self.exited.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        for mut task in std::mem::take(&mut self.tasks) {
            if tokio::time::timeout(READER_DRAIN_TIMEOUT, &mut task)
                .await
                .is_err()
            {
                task.abort();
                let _ = task.await;
            }
        }
    }
}

impl Drop for RunningTunnel {
    fn drop(&mut self) {
        self.request_kill();
        // Aborting the waiter drops the child, and `kill_on_drop` kills it.
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl StreamingProtocol {
    pub const fn new(config: SupervisorConfig, notifier: StateNotifier) -> Self {
        Self {
            config,
            notifier,
            running: None,
        }
    }

    /// The `logfile` option, else `local.log` in the working directory.
    pub fn log_file(options: &TunnelOptions) -> PathBuf {
        options.log_file().unwrap_or_else(|| {
            std::env::current_dir()
                .unwrap_or_default()
                .join(DEFAULT_LOG_FILE)
        })
    }

    /// Spawn the tunnel and return without waiting for it to connect.
    ///
    /// A tunnel already running under this protocol is killed first.
    pub async fn launch(&mut self, binary: &Path, options: &TunnelOptions) -> Result<()> {
        let command = self.start_command(binary, options)?;
        self.kill().await;

        let log_file = Self::log_file(options);
        let source = self.config.stream_source;
        self.notifier.transition(TunnelState::Connecting);

        if let Err(e) = tokio::fs::File::create(&log_file).await {
            if source == StreamSource::LogFile {
                self.notifier.fail(format!(
                    "failed to prepare log file {}: {e}",
                    log_file.display()
                ));
                return Err(e.into());
            }
            warn!(path = %log_file.display(), error = %e, "Failed to truncate tunnel log");
        }

        let mut cmd = command.to_command();
        cmd.stdin(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        match source {
            StreamSource::Stdout => cmd.stdout(Stdio::piped()),
            StreamSource::LogFile => cmd.stdout(Stdio::null()),
        };

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.notifier.fail(e.to_string());
                return Err(TunnelError::ProcessLaunch {
                    program: command.program().to_string(),
                    reason: e.to_string(),
                });
            }
        };
        let pid = child.id();
        info!(
            pid = ?pid,
            binary = %binary.display(),
            ?source,
            "Tunnel process started"
        );

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = watch::channel(false);
        let mut tasks = Vec::with_capacity(3);

        if let Some(stderr) = child.stderr.take() {
            tasks.push(tokio::spawn(drain_stderr(stderr, pid)));
        }
        match source {
            StreamSource::Stdout => {
                if let Some(stdout) = child.stdout.take() {
                    tasks.push(tokio::spawn(scan_output(stdout, self.notifier.clone())));
                }
            }
            StreamSource::LogFile => {
                tasks.push(tokio::spawn(tail_log(
                    log_file,
                    self.notifier.clone(),
                    exited_rx.clone(),
                    self.config.log_poll_interval(),
                )));
            }
        }
        tasks.push(tokio::spawn(supervise_exit(
            child,
            kill_rx,
            exited_tx,
            self.config.terminate_timeout(),
        )));

        self.running = Some(RunningTunnel {
            pid,
            kill_tx: Some(kill_tx),
            exited: exited_rx,
            tasks,
        });
        Ok(())
    }

    /// Kill the running tunnel, if any, and wait for it to exit.
    /// An `Error` state survives the kill; anything else becomes `Disconnected`.
    async fn kill(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running
            .shutdown(
                self.config.stop_poll_interval(),
                self.config.terminate_timeout() + KILL_GRACE,
            )
            .await;
        if self.notifier.state() != TunnelState::Error {
            self.notifier.transition(TunnelState::Disconnected);
        }
    }
}

impl TunnelProtocol for StreamingProtocol {
    fn start_command(&self, binary: &Path, options: &TunnelOptions) -> Result<CommandLine> {
        let log_file = Self::log_file(options);
        build_command(
            binary,
            options,
            Invocation::Streaming {
                log_file: &log_file,
            },
        )
    }

    async fn start(&mut self, binary: &Path, options: &TunnelOptions) -> Result<()> {
        self.launch(binary, options).await?;

        let mut attempts = 0;
        loop {
            let state = self
                .notifier
                .wait_for(|s| s != TunnelState::Connecting, self.config.connect_wait())
                .await;
            match state {
                Some(TunnelState::Connected) => return Ok(()),
                Some(TunnelState::Error) => {
                    let message = self
                        .notifier
                        .last_error()
                        .unwrap_or_else(|| "tunnel reported an error".to_string());
                    self.kill().await;
                    return Err(TunnelError::TunnelReported(message));
                }
                Some(TunnelState::Idle | TunnelState::Disconnected) => {
                    self.kill().await;
                    return Err(TunnelError::ProcessLaunch {
                        program: binary.display().to_string(),
                        reason: "tunnel exited before connecting".to_string(),
                    });
                }
                Some(TunnelState::Connecting) | None => {
                    attempts += 1;
                    debug!(attempts, "Still waiting for the tunnel to connect");
                    if self.config.connect_attempts > 0 && attempts >= self.config.connect_attempts
                    {
                        let service = self.config.vendor.service_name.clone();
                        self.notifier
                            .fail(format!("Failed to connect to {service}"));
                        self.kill().await;
                        return Err(TunnelError::ConnectTimeout { service });
                    }
                }
            }
        }
    }

    async fn stop(&mut self) -> Result<()> {
        self.kill().await;
        Ok(())
    }

    async fn is_running(&self) -> Result<bool> {
        Ok(self.running.as_ref().is_some_and(|r| !r.has_exited()))
    }

    fn reported_state(&self) -> TunnelState {
        self.notifier.state()
    }

    fn pid(&self) -> Option<u32> {
        self.running.as_ref().and_then(|r| r.pid)
    }
}

/// Owns the child until it exits on its own or a kill is requested.
/// A dropped kill sender counts as a request.
async fn supervise_exit(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    exited: watch::Sender<bool>,
    grace: Duration,
) {
    tokio::select! {
        status = child.wait() => match status {
            Ok(status) => info!(?status, "Tunnel process exited"),
            Err(e) => warn!(error = %e, "Failed to wait for tunnel process"),
        },
        _ = kill_rx => terminate(&mut child, grace).await,
    }
    exited.send_replace(true);
}

async fn terminate(child: &mut Child, grace: Duration) {
    request_exit(child);
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => info!(?status, "Tunnel process terminated"),
        Ok(Err(e)) => {
            warn!(error = %e, "Error waiting for tunnel process");
            child.kill().await.ok();
        }
        Err(_) => {
            warn!("Timeout waiting for tunnel process to terminate, killing");
            child.kill().await.ok();
        }
    }
}

#[cfg(unix)]
fn request_exit(child: &Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        warn!(pid, error = %e, "Failed to send SIGTERM");
    }
}

#[cfg(not(unix))]
fn request_exit(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        warn!(error = %e, "Failed to kill tunnel process");
    }
}

fn apply(notifier: &StateNotifier, signal: Option<Signal>) {
    match signal {
        Some(Signal::Ready) => {
            notifier.transition(TunnelState::Connected);
        }
        Some(Signal::Error(message)) => {
            notifier.fail(message);
        }
        None => {}
    }
}

fn end_of_output(notifier: &StateNotifier) {
    if notifier.state() != TunnelState::Error {
        notifier.transition(TunnelState::Disconnected);
    }
}

async fn scan_output<R>(reader: R, notifier: StateNotifier)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut classifier = OutputClassifier::new();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => apply(&notifier, classifier.push_line(&line)),
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Failed to read tunnel output");
                notifier.fail(e.to_string());
                break;
            }
        }
    }
    classifier.flush();
    end_of_output(&notifier);
}

/// Follow a log file the tunnel appends to. Stops once the process has
/// exited and everything written before the exit has been read.
async fn tail_log(
    path: PathBuf,
    notifier: StateNotifier,
    mut exited: watch::Receiver<bool>,
    poll: Duration,
) {
    let poll = poll.max(MIN_LOG_POLL);
    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to open tunnel log");
            notifier.fail(format!("failed to open {}: {e}", path.display()));
            return;
        }
    };

    let mut reader = BufReader::new(file);
    let mut classifier = OutputClassifier::new();
    let mut pending = String::new();
    loop {
        let exited_before_read = *exited.borrow();
        match reader.read_line(&mut pending).await {
            Ok(0) => {
                if exited_before_read {
                    break;
                }
                tokio::select! {
                    () = tokio::time::sleep(poll) => {}
                    _ = exited.changed() => {}
                }
            }
            Ok(_) if pending.ends_with('\n') => {
                apply(&notifier, classifier.push_line(&pending));
                pending.clear();
            }
            // Partial line; the rest has not been written yet.
            Ok(_) => {}
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read tunnel log");
                notifier.fail(e.to_string());
                break;
            }
        }
    }
    if !pending.is_empty() {
        apply(&notifier, classifier.push_line(&pending));
    }
    classifier.flush();
    end_of_output(&notifier);
}

async fn drain_stderr<R>(reader: R, pid: Option<u32>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        warn!(pid = ?pid, "stderr: {}", line);
    }
}
