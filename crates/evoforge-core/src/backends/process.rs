//! Subprocess plumbing shared by the domain backends.
//!
//! Every command runs in its own process group so a timeout can take down the
//! whole tree (make spawning compilers, shells spawning emulators), not just the
//! direct child.

use anyhow::Context;
use serde::Serialize;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

/// Pipes still open after a group kill (escaped grandchildren) are abandoned after this.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessOutput {
    pub returncode: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.returncode == Some(0)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "returncode": self.returncode,
            "stdout": self.stdout,
            "stderr": self.stderr,
            "timed_out": self.timed_out,
        })
    }
}

/// `bash -c <script>` in `cwd`, piped, in a fresh process group.
pub fn shell(script: &str, cwd: &Path) -> Command {
    let mut cmd = Command::new("bash");
    cmd.arg("-c")
        .arg(script)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);
    cmd
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupSignal {
    Interrupt,
    Kill,
}

/// Sends `signal` to every process in group `pgid`.
///
/// A group that is already gone is not an error; any other failure is logged.
pub fn signal_group(pgid: u32, signal: GroupSignal) {
    #[cfg(unix)]
    {
        let sig = match signal {
            GroupSignal::Interrupt => libc::SIGINT,
            GroupSignal::Kill => libc::SIGKILL,
        };
        // 0 and 1 would address our own group and init.
        let Some(pgid) = libc::pid_t::try_from(pgid).ok().filter(|p| *p > 1) else {
            tracing::warn!(event = "process.signal_failed", pgid, "refusing to signal pgid");
            return;
        };
        // SAFETY: killpg takes plain integers and touches no memory of ours.
        if unsafe { libc::killpg(pgid, sig) } != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                tracing::debug!(event = "process.signal_gone", pgid, signal = ?signal);
            } else {
                tracing::warn!(
                    event = "process.signal_failed",
                    pgid,
                    signal = ?signal,
                    error = %err,
                    "could not signal process group"
                );
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (pgid, signal);
    }
}

fn drain<R>(reader: Option<R>) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut r) = reader {
            let _ = r.read_to_end(&mut buf).await;
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

async fn collect(handle: Option<JoinHandle<String>>) -> String {
    let Some(handle) = handle else {
        return String::new();
    };
    match tokio::time::timeout(DRAIN_GRACE, handle).await {
        Ok(Ok(s)) => s,
        _ => String::new(),
    }
}

/// Runs `cmd` to completion, or kills its process group once `limit` elapses.
///
/// A timeout is not an error: the partial output comes back with `timed_out` set.
pub async fn run_bounded(mut cmd: Command, limit: Option<Duration>) -> anyhow::Result<ProcessOutput> {
    let mut child = cmd.spawn().context("failed to spawn subprocess")?;
    let pgid = child.id();
    let out = drain(child.stdout.take());
    let err = drain(child.stderr.take());

    let (returncode, timed_out) = match limit {
        Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
            Ok(status) => (status.context("failed to wait for subprocess")?.code(), false),
            Err(_) => {
                if let Some(pgid) = pgid {
                    signal_group(pgid, GroupSignal::Kill);
                }
                let _ = child.kill().await;
                (child.wait().await.ok().and_then(|s| s.code()), true)
            }
        },
        None => (
            child
                .wait()
                .await
                .context("failed to wait for subprocess")?
                .code(),
            false,
        ),
    };

    Ok(ProcessOutput {
        returncode,
        stdout: collect(Some(out)).await.trim().to_string(),
        stderr: collect(Some(err)).await.trim().to_string(),
        timed_out,
    })
}

/// A background helper process (probe loader, traffic server) owned for a scope.
///
/// Dropping the guard kills the helper's process group; [`ProcessGuard::stop`]
/// does the same gracefully and returns what the helper printed.
pub struct ProcessGuard {
    label: String,
    child: Option<Child>,
    pgid: Option<u32>,
    out: Option<JoinHandle<String>>,
    err: Option<JoinHandle<String>>,
}

impl ProcessGuard {
    pub fn spawn(label: impl Into<String>, mut cmd: Command) -> anyhow::Result<Self> {
        let label = label.into();
        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {}", label))?;
        let pgid = child.id();
        let out = drain(child.stdout.take());
        let err = drain(child.stderr.take());
        tracing::debug!(event = "process.spawn", label = %label, pid = ?pgid);
        Ok(Self {
            label,
            child: Some(child),
            pgid,
            out: Some(out),
            err: Some(err),
        })
    }

    /// Interrupts the helper, escalating to SIGKILL if it ignores `grace`.
    pub async fn stop(mut self, grace: Duration) -> ProcessOutput {
        let mut returncode = None;
        if let Some(mut child) = self.child.take() {
            if let Some(pgid) = self.pgid {
                signal_group(pgid, GroupSignal::Interrupt);
            }
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => returncode = status.code(),
                _ => {
                    if let Some(pgid) = self.pgid {
                        signal_group(pgid, GroupSignal::Kill);
                    }
                    let _ = child.kill().await;
                    returncode = child.wait().await.ok().and_then(|s| s.code());
                }
            }
        }
        tracing::debug!(event = "process.stop", label = %self.label, returncode = ?returncode);
        ProcessOutput {
            returncode,
            stdout: collect(self.out.take()).await.trim().to_string(),
            stderr: collect(self.err.take()).await.trim().to_string(),
            timed_out: false,
        }
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            tracing::warn!(event = "process.abandon", label = %self.label, "killing helper on scope exit");
            if let Some(pgid) = self.pgid {
                signal_group(pgid, GroupSignal::Kill);
            }
            let _ = child.start_kill();
        }
    }
}
