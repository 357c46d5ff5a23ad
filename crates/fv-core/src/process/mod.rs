//! Process handle: one spawned agent process and its output pipes.
//!
//! The handle owns the child and hands its stdout to exactly one consumer
//! (the node's [`crate::watch::LogWatcher`]). Stderr is forwarded to
//! `tracing` so agent warnings still show up in the test log.

use std::time::Duration;

use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::{debug, warn};

/// Lifecycle of a node's process slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Nothing has been spawned yet.
    Unstarted,
    /// A process was spawned and has not been reaped.
    Running,
    /// The process exited or was terminated.
    Stopped,
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unstarted => "unstarted",
            Self::Running => "running",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// How a call to [`ProcessHandle::terminate`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// The process had already exited before we signalled it.
    AlreadyExited,
    /// The process exited within the grace period after SIGTERM.
    Graceful,
    /// The grace period elapsed and the process was force-killed.
    Killed,
}

/// A spawned agent process.
#[derive(Debug)]
pub struct ProcessHandle {
    label: String,
    pid: u32,
    child: Child,
    /// `Option` so it can be `.take()`-ed once by the watcher.
    stdout: Option<ChildStdout>,
    state: ProcessState,
}

impl ProcessHandle {
    /// Spawn `cmd` with stdout piped for watching.
    ///
    /// Stdin is closed, stderr is drained into the log in the background,
    /// and the child is killed if the handle is dropped while running.
    pub fn spawn(label: impl Into<String>, mut cmd: Command) -> std::io::Result<Self> {
        let label = label.into();

        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let pid = child.id().ok_or_else(|| {
            std::io::Error::other("child process exited before its pid could be read")
        })?;

        let stdout = child.stdout.take();
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(label.clone(), stderr));
        }

        debug!(node = %label, pid, "spawned agent process");

        Ok(Self {
            label,
            pid,
            child,
            stdout,
            state: ProcessState::Running,
        })
    }

    /// OS process id.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Current state as last observed.
    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Take the stdout pipe. Returns `None` after the first call.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Check whether the process is still alive, reaping it if it exited.
    pub fn is_running(&mut self) -> bool {
        if self.state != ProcessState::Running {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!(node = %self.label, pid = self.pid, %status, "agent process exited");
                self.state = ProcessState::Stopped;
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!(node = %self.label, pid = self.pid, error = %e, "error checking process status");
                false
            }
        }
    }

    /// Stop the process: SIGTERM, wait up to `grace`, then SIGKILL.
    ///
    /// Never fails; errors from signalling a dead process are absorbed and
    /// the handle ends up `Stopped` either way.
    pub async fn terminate(&mut self, grace: Duration) -> TerminateOutcome {
        if !self.is_running() {
            self.state = ProcessState::Stopped;
            return TerminateOutcome::AlreadyExited;
        }

        #[cfg(unix)]
        {
            // SAFETY: pid belongs to a child we spawned and have not reaped.
            let ret = unsafe { libc::kill(self.pid as i32, libc::SIGTERM) };
            if ret != 0 {
                warn!(node = %self.label, pid = self.pid, "SIGTERM failed, proceeding to SIGKILL");
            }
        }

        let outcome = match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(node = %self.label, pid = self.pid, %status, "process exited after SIGTERM");
                TerminateOutcome::Graceful
            }
            _ => {
                warn!(
                    node = %self.label,
                    pid = self.pid,
                    grace_ms = grace.as_millis() as u64,
                    "process did not exit after SIGTERM, sending SIGKILL"
                );
                let _ = self.child.kill().await;
                TerminateOutcome::Killed
            }
        };

        self.state = ProcessState::Stopped;
        outcome
    }
}

/// Log every stderr line of the agent until the pipe closes.
async fn forward_stderr(label: String, stderr: ChildStderr) {
    let lines = async_stream::stream! {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            yield line;
        }
    };
    futures::pin_mut!(lines);

    while let Some(line) = lines.next().await {
        debug!(target: "fv::stderr", node = %label, "{line}");
    }
}
