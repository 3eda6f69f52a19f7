//! Supervisor lifecycle against fake tunnel binaries written as shell scripts.
#![cfg(unix)]
#![allow(clippy::unwrap_used)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tunnelward_core::config::{StreamSource, SupervisorConfig};
use tunnelward_core::liveness;
use tunnelward_core::protocol::ProtocolKind;
use tunnelward_core::{
    StartOutcome, TunnelError, TunnelObserver, TunnelOptions, TunnelState, TunnelSupervisor,
};

#[derive(Default)]
struct Events(Mutex<Vec<String>>);

impl Events {
    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

impl TunnelObserver for Events {
    fn on_connecting(&self) {
        self.0.lock().unwrap().push("connecting".into());
    }

    fn on_connected(&self) {
        self.0.lock().unwrap().push("connected".into());
    }

    fn on_disconnected(&self) {
        self.0.lock().unwrap().push("disconnected".into());
    }

    fn on_error(&self, message: Option<&str>) {
        self.0
            .lock()
            .unwrap()
            .push(format!("error:{}", message.unwrap_or("-")));
    }
}

/// A fake binary answering `--version` with `version`, then running `body`.
fn fake_binary(dir: &Path, version: &str, body: &str) -> PathBuf {
    let path = dir.join("tunnel");
    let script = format!(
        "#!/bin/sh\ncase \"$1\" in\n  --version) echo \"BrowserStack Local version {version}\"; exit 0 ;;\nesac\n{body}\n"
    );
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn fast_config() -> SupervisorConfig {
    SupervisorConfig {
        connect_wait_secs: 10,
        connect_attempts: 1,
        stop_poll_interval_ms: 20,
        terminate_timeout_secs: 5,
        log_poll_interval_ms: 20,
        ..SupervisorConfig::default()
    }
}

fn options(dir: &Path, binary: &Path) -> TunnelOptions {
    TunnelOptions::new()
        .with("key", "secret")
        .with("binarypath", binary.display().to_string())
        .with("logfile", dir.join("local.log").display().to_string())
}

fn observed(config: SupervisorConfig) -> (TunnelSupervisor, Arc<Events>) {
    let events = Arc::new(Events::default());
    let supervisor = TunnelSupervisor::new(config).with_observer(events.clone());
    (supervisor, events)
}

async fn wait_until_dead(pid: u32) -> bool {
    for _ in 0..100 {
        if !liveness::is_alive(pid).await.unwrap() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

// --- Option handling ---

#[tokio::test]
async fn missing_key_fails_before_any_launch() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("ran");
    let binary = fake_binary(
        dir.path(),
        "8.4",
        &format!("touch {}", marker.display()),
    );
    let (mut supervisor, events) = observed(fast_config());

    let opts = TunnelOptions::new().with("binarypath", binary.display().to_string());
    let err = supervisor.start(&opts).await.unwrap_err();

    assert!(matches!(err, TunnelError::MissingAccessKey));
    assert!(!marker.exists());
    assert!(events.take().is_empty());
}

#[tokio::test]
async fn only_command_launches_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("ran");
    let binary = fake_binary(
        dir.path(),
        "8.4",
        &format!("touch {}", marker.display()),
    );
    let (mut supervisor, _events) = observed(fast_config());

    let opts = options(dir.path(), &binary)
        .with("onlyCommand", "true")
        .with("localIdentifier", "ci-7")
        .with("v", "true");
    let outcome = supervisor.start(&opts).await.unwrap();

    let StartOutcome::CommandOnly(command) = outcome else {
        panic!("expected command only, got {outcome:?}");
    };
    assert_eq!(command.program(), binary.display().to_string());
    assert_eq!(&command.args()[..3], ["-d", "start", "secret"]);
    assert!(command.contains("-localIdentifier"));
    assert!(command.contains("ci-7"));
    assert!(command.contains("-vvv"));
    assert!(!marker.exists());
    assert_eq!(supervisor.state(), TunnelState::Idle);
}

// --- Structured protocol ---

#[tokio::test]
async fn structured_start_stop_and_liveness() {
    let dir = tempfile::tempdir().unwrap();
    let calls = dir.path().join("calls");
    let mut daemon = tokio::process::Command::new("sleep")
        .arg("30")
        .kill_on_drop(true)
        .spawn()
        .unwrap();
    let daemon_pid = daemon.id().unwrap();

    let binary = fake_binary(
        dir.path(),
        "8.4",
        &format!(
            "echo \"$@\" >> {calls}\n\
             if [ \"$2\" = start ]; then\n\
               echo '{{\"state\":\"connected\",\"pid\":{daemon_pid}}}'\n\
             else\n\
               echo '{{\"state\":\"disconnected\",\"message\":{{\"message\":\"stopped\"}}}}'\n\
             fi",
            calls = calls.display()
        ),
    );
    let (mut supervisor, events) = observed(fast_config());

    let outcome = supervisor
        .start(&options(dir.path(), &binary))
        .await
        .unwrap();
    assert_eq!(outcome, StartOutcome::Connected);
    assert_eq!(supervisor.protocol(), Some(ProtocolKind::Structured));
    assert_eq!(supervisor.state(), TunnelState::Connected);
    assert_eq!(supervisor.pid(), Some(daemon_pid));
    assert!(supervisor.is_running().await.unwrap());
    // The structured protocol has no connecting phase.
    assert_eq!(events.take(), vec!["connected"]);

    supervisor.stop().await.unwrap();
    assert_eq!(supervisor.state(), TunnelState::Disconnected);
    assert_eq!(supervisor.pid(), None);
    assert!(!supervisor.is_running().await.unwrap());
    assert_eq!(events.take(), vec!["disconnected"]);

    // Stopping again is a no-op.
    supervisor.stop().await.unwrap();
    assert_eq!(supervisor.state(), TunnelState::Disconnected);
    assert!(events.take().is_empty());

    let log = std::fs::read_to_string(&calls).unwrap();
    let lines: Vec<&str> = log.lines().collect();
    assert_eq!(lines.len(), 2, "{log}");
    assert!(lines[0].starts_with("-d start secret"), "{log}");
    assert!(lines[1].starts_with("-d stop secret"), "{log}");

    daemon.kill().await.unwrap();
    assert!(!liveness::is_alive(daemon_pid).await.unwrap());
}

#[tokio::test]
async fn structured_failure_reports_vendor_message() {
    let dir = tempfile::tempdir().unwrap();
    let binary = fake_binary(
        dir.path(),
        "8.4",
        "echo '{\"state\":\"disconnected\",\"message\":{\"message\":\"Invalid access key\"}}'",
    );
    let (mut supervisor, events) = observed(fast_config());

    let err = supervisor
        .start(&options(dir.path(), &binary))
        .await
        .unwrap_err();

    assert!(
        matches!(&err, TunnelError::TunnelReported(m) if m == "Invalid access key"),
        "{err}"
    );
    assert_eq!(err.to_string(), "Invalid access key");
    assert_eq!(supervisor.state(), TunnelState::Error);
    assert_eq!(
        supervisor.last_error().as_deref(),
        Some("Invalid access key")
    );
    assert_eq!(events.take(), vec!["error:Invalid access key"]);
    assert_eq!(supervisor.pid(), None);
}

#[tokio::test]
async fn structured_garbage_is_protocol_error() {
    let dir = tempfile::tempdir().unwrap();
    let binary = fake_binary(dir.path(), "8.4", "echo 'daemon started'");
    let (mut supervisor, _events) = observed(fast_config());

    let err = supervisor
        .start(&options(dir.path(), &binary))
        .await
        .unwrap_err();
    assert!(matches!(err, TunnelError::Protocol(_)), "{err}");
    assert_eq!(supervisor.state(), TunnelState::Error);
}

#[tokio::test]
async fn stop_with_uses_given_options() {
    let dir = tempfile::tempdir().unwrap();
    let calls = dir.path().join("calls");
    let binary = fake_binary(
        dir.path(),
        "8.4",
        &format!("echo \"$@\" >> {}", calls.display()),
    );
    let (mut supervisor, _events) = observed(fast_config());

    let opts = options(dir.path(), &binary).with("localIdentifier", "ci-9");
    supervisor.stop_with(&opts).await.unwrap();

    assert_eq!(supervisor.state(), TunnelState::Disconnected);
    let log = std::fs::read_to_string(&calls).unwrap();
    assert!(log.starts_with("-d stop secret"), "{log}");
    assert!(log.contains("-localIdentifier ci-9"), "{log}");
}

// --- Streaming protocol ---

#[tokio::test]
async fn streaming_ready_line_connects() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("pid");
    let binary = fake_binary(
        dir.path(),
        "3.1",
        &format!(
            "echo $$ > {}\necho 'BrowserStackLocal v3.1'\necho 'Press Ctrl-C to exit'\nexec sleep 30",
            pid_file.display()
        ),
    );
    let (mut supervisor, events) = observed(fast_config());

    let outcome = supervisor
        .start(&options(dir.path(), &binary))
        .await
        .unwrap();
    assert_eq!(outcome, StartOutcome::Connected);
    assert_eq!(supervisor.protocol(), Some(ProtocolKind::Streaming));
    assert_eq!(supervisor.state(), TunnelState::Connected);
    assert!(supervisor.is_running().await.unwrap());
    assert_eq!(events.take(), vec!["connecting", "connected"]);

    let command = supervisor.command().unwrap();
    assert_eq!(command.args()[0], "-logFile");
    assert_eq!(command.args()[2], "secret");

    let pid: u32 = std::fs::read_to_string(&pid_file)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert_eq!(supervisor.pid(), Some(pid));

    supervisor.stop().await.unwrap();
    assert_eq!(supervisor.state(), TunnelState::Disconnected);
    assert!(!supervisor.is_running().await.unwrap());
    assert!(wait_until_dead(pid).await);
    assert_eq!(events.take(), vec!["disconnected"]);

    supervisor.stop().await.unwrap();
    assert!(events.take().is_empty());
}

#[tokio::test]
async fn streaming_error_line_fails_start() {
    let dir = tempfile::tempdir().unwrap();
    let binary = fake_binary(
        dir.path(),
        "3.1",
        "echo 'Connecting...'\necho '*** Error: quota exceeded'\nexec sleep 30",
    );
    let (mut supervisor, events) = observed(fast_config());

    let err = supervisor
        .start(&options(dir.path(), &binary))
        .await
        .unwrap_err();

    assert!(
        matches!(&err, TunnelError::TunnelReported(m) if m == "quota exceeded"),
        "{err}"
    );
    assert_eq!(supervisor.state(), TunnelState::Error);
    assert_eq!(supervisor.last_error().as_deref(), Some("quota exceeded"));
    assert!(!supervisor.is_running().await.unwrap());
    assert_eq!(events.take(), vec!["connecting", "error:quota exceeded"]);
}

#[tokio::test]
async fn streaming_prefixed_error_line_reports_vendor_message() {
    let dir = tempfile::tempdir().unwrap();
    let binary = fake_binary(
        dir.path(),
        "3.1",
        "echo 'Connecting to hub'\necho '[2024-01-01 10:00:00] *** Error: quota exceeded'\nexec sleep 30",
    );
    let (mut supervisor, _events) = observed(fast_config());

    let err = supervisor
        .start(&options(dir.path(), &binary))
        .await
        .unwrap_err();

    assert!(
        matches!(&err, TunnelError::TunnelReported(m) if m == "quota exceeded"),
        "{err}"
    );
    assert_eq!(supervisor.last_error().as_deref(), Some("quota exceeded"));
}

#[tokio::test]
async fn streaming_timeout_kills_the_tunnel() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("pid");
    let binary = fake_binary(
        dir.path(),
        "3.1",
        &format!("echo $$ > {}\nexec sleep 30", pid_file.display()),
    );
    let config = SupervisorConfig {
        connect_wait_secs: 1,
        ..fast_config()
    };
    let (mut supervisor, events) = observed(config);

    let err = supervisor
        .start(&options(dir.path(), &binary))
        .await
        .unwrap_err();

    assert!(
        matches!(&err, TunnelError::ConnectTimeout { service } if service == "BrowserStack"),
        "{err}"
    );
    assert_eq!(err.to_string(), "Failed to connect to BrowserStack");
    assert_eq!(supervisor.state(), TunnelState::Error);
    assert_eq!(
        supervisor.last_error().as_deref(),
        Some("Failed to connect to BrowserStack")
    );
    assert_eq!(
        events.take(),
        vec!["connecting", "error:Failed to connect to BrowserStack"]
    );

    let pid: u32 = std::fs::read_to_string(&pid_file)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert!(wait_until_dead(pid).await);
}

#[tokio::test]
async fn streaming_exit_before_ready_is_launch_error() {
    let dir = tempfile::tempdir().unwrap();
    let binary = fake_binary(dir.path(), "3.1", "echo 'starting'\nexit 3");
    let (mut supervisor, _events) = observed(fast_config());

    let err = supervisor
        .start(&options(dir.path(), &binary))
        .await
        .unwrap_err();
    assert!(matches!(err, TunnelError::ProcessLaunch { .. }), "{err}");
    assert_eq!(supervisor.state(), TunnelState::Disconnected);
}

#[tokio::test]
async fn streaming_from_log_file() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("local.log");
    std::fs::write(&log, "Press Ctrl-C to exit\nstale output from a previous run\n").unwrap();
    let binary = fake_binary(
        dir.path(),
        "3.1",
        "echo 'stdout is ignored'\nsleep 0.2\necho 'Press Ctrl-C to exit' >> \"$2\"\nexec sleep 30",
    );
    let config = SupervisorConfig {
        stream_source: StreamSource::LogFile,
        ..fast_config()
    };
    let (mut supervisor, events) = observed(config);

    supervisor
        .start(&options(dir.path(), &binary))
        .await
        .unwrap();
    assert_eq!(supervisor.state(), TunnelState::Connected);
    assert_eq!(events.take(), vec!["connecting", "connected"]);
    // Truncated before launch, so only the fresh run is in the file.
    assert_eq!(
        std::fs::read_to_string(&log).unwrap(),
        "Press Ctrl-C to exit\n"
    );

    supervisor.stop().await.unwrap();
    assert_eq!(supervisor.state(), TunnelState::Disconnected);
}

#[tokio::test]
async fn restart_replaces_running_tunnel() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("pid");
    let binary = fake_binary(
        dir.path(),
        "3.1",
        &format!(
            "echo $$ >> {}\necho 'Press Ctrl-C to exit'\nexec sleep 30",
            pid_file.display()
        ),
    );
    let (mut supervisor, _events) = observed(fast_config());
    let opts = options(dir.path(), &binary);

    supervisor.start(&opts).await.unwrap();
    supervisor.start(&opts).await.unwrap();
    assert_eq!(supervisor.state(), TunnelState::Connected);

    let pids: Vec<u32> = std::fs::read_to_string(&pid_file)
        .unwrap()
        .lines()
        .map(|l| l.trim().parse().unwrap())
        .collect();
    assert_eq!(pids.len(), 2);
    assert!(wait_until_dead(pids[0]).await);
    assert_eq!(supervisor.pid(), Some(pids[1]));

    supervisor.stop().await.unwrap();
    assert!(wait_until_dead(pids[1]).await);
}

#[tokio::test]
async fn supervisors_are_independent() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let ready = "echo 'Press Ctrl-C to exit'\nexec sleep 30";
    let binary_a = fake_binary(dir_a.path(), "3.1", ready);
    let binary_b = fake_binary(dir_b.path(), "3.1", ready);

    let (mut a, _) = observed(fast_config());
    let (mut b, _) = observed(fast_config());
    a.start(&options(dir_a.path(), &binary_a)).await.unwrap();
    b.start(&options(dir_b.path(), &binary_b)).await.unwrap();

    a.stop().await.unwrap();
    assert_eq!(a.state(), TunnelState::Disconnected);
    assert_eq!(b.state(), TunnelState::Connected);
    assert!(b.is_running().await.unwrap());

    b.stop().await.unwrap();
}
