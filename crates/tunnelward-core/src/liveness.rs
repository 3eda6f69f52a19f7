//! Best-effort "is this PID still running" check.
//!
//! PIDs are recycled by the OS, so a positive answer only means *some*
//! process holds that PID right now. A zombie (exited but not yet reaped)
//! also counts as alive on POSIX.

use crate::error::Result;
#[cfg(any(unix, windows))]
use crate::error::TunnelError;

/// Whether a process with `pid` currently exists.
pub async fn is_alive(pid: u32) -> Result<bool> {
    if pid == 0 {
        return Ok(false);
    }
    probe(pid).await
}

#[cfg(unix)]
#[allow(clippy::unused_async)]
async fn probe(pid: u32) -> Result<bool> {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return Ok(false);
    };
    // Signal 0 performs the existence and permission checks only.
    match kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(e) => Err(TunnelError::Liveness {
            pid,
            reason: e.to_string(),
        }),
    }
}

#[cfg(windows)]
async fn probe(pid: u32) -> Result<bool> {
    let filter = format!("PID eq {pid}");
    let output = tokio::process::Command::new("tasklist")
        .args(["/FI", &filter, "/NH", "/FO", "CSV"])
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| TunnelError::Liveness {
            pid,
            reason: e.to_string(),
        })?;
    if !output.status.success() {
        return Err(TunnelError::Liveness {
            pid,
            reason: format!("tasklist exited with {}", output.status),
        });
    }
    Ok(tasklist_lists_pid(
        &String::from_utf8_lossy(&output.stdout),
        pid,
    ))
}

#[cfg(not(any(unix, windows)))]
#[allow(clippy::unused_async)]
async fn probe(pid: u32) -> Result<bool> {
    tracing::warn!(pid, "no process table access on this platform");
    Ok(false)
}

/// Whether CSV `tasklist` output contains a row for `pid`.
#[cfg_attr(not(windows), allow(dead_code))]
fn tasklist_lists_pid(stdout: &str, pid: u32) -> bool {
    let needle = format!("\"{pid}\"");
    stdout
        .lines()
        .any(|line| line.split(',').nth(1).is_some_and(|col| col.trim() == needle))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pid_zero_is_never_alive() {
        assert!(!is_alive(0).await.unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn own_process_is_alive() {
        assert!(is_alive(std::process::id()).await.unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn reaped_child_is_not_alive() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        assert!(is_alive(pid).await.unwrap());

        child.kill().await.unwrap();
        assert!(!is_alive(pid).await.unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn out_of_range_pid_is_not_alive() {
        assert!(!is_alive(u32::MAX).await.unwrap());
    }

    #[test]
    fn tasklist_match() {
        let out = "\"tunnel.exe\",\"4242\",\"Console\",\"1\",\"12,345 K\"\r\n";
        assert!(tasklist_lists_pid(out, 4242));
        assert!(!tasklist_lists_pid(out, 424));
    }

    #[test]
    fn tasklist_no_match() {
        let out = "INFO: No tasks are running which match the specified criteria.\r\n";
        assert!(!tasklist_lists_pid(out, 4242));
    }
}
