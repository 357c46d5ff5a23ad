//! Node controller: the lifecycle of one agent instance.
//!
//! ```text
//! create(delay_start = true)  ──> Unstarted ──trigger_start()──> Running
//! create(delay_start = false) ────────────────────────────────> Running
//! Running ──restart()──> Running   (stop + fresh watcher + spawn)
//! any     ──stop()─────> Stopped   (idempotent)
//! ```
//!
//! Each run gets its own [`LogWatcher`]. Subscriptions taken from a
//! previous run's watcher are abandoned when that run is stopped and never
//! see output from a later run.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::launcher::Launcher;
use crate::process::{ProcessHandle, ProcessState, TerminateOutcome};
use crate::watch::{DEFAULT_TAIL_LINES, LogWatcher, Subscription, WatcherError};

/// How long the reader may take to drain output written during shutdown.
const READER_DRAIN: Duration = Duration::from_secs(1);

/// Name and position of a node within its topology.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeIdentity {
    pub name: String,
    pub index: usize,
}

impl NodeIdentity {
    pub fn new(name: impl Into<String>, index: usize) -> Self {
        Self {
            name: name.into(),
            index,
        }
    }
}

impl std::fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// Per-node settings.
#[derive(Debug, Clone)]
pub struct NodeOptions {
    /// Create the node without spawning; wait for [`Node::trigger_start`].
    pub delay_start: bool,
    /// Initial desired environment.
    pub env: BTreeMap<String, String>,
    /// Grace period between SIGTERM and SIGKILL.
    pub stop_grace: Duration,
    /// Upper bound for a single inspection command.
    pub exec_timeout: Duration,
    /// Recent stdout lines kept for diagnostics.
    pub tail_lines: usize,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            delay_start: false,
            env: BTreeMap::new(),
            stop_grace: Duration::from_secs(10),
            exec_timeout: Duration::from_secs(30),
            tail_lines: DEFAULT_TAIL_LINES,
        }
    }
}

/// Errors from node lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// The agent could not be started. Not retried.
    #[error("failed to spawn agent for node {node} via {launcher} launcher")]
    Spawn {
        node: String,
        launcher: String,
        #[source]
        source: std::io::Error,
    },

    /// The operation is not valid in the node's current state.
    #[error("cannot {op} node {node}: it is {state}")]
    InvalidTransition {
        node: String,
        op: &'static str,
        state: ProcessState,
    },

    #[error("invalid stdout pattern {pattern:?}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error(transparent)]
    Watcher(#[from] WatcherError),

    #[error("failed to run {program} on node {node}")]
    Exec {
        node: String,
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} on node {node} did not finish within {timeout:?}")]
    ExecTimeout {
        node: String,
        program: String,
        timeout: Duration,
    },

    #[error("{program} on node {node} exited with {status}: {stderr}")]
    ExecStatus {
        node: String,
        program: String,
        status: String,
        stderr: String,
    },
}

enum Run {
    Unstarted,
    Running {
        process: ProcessHandle,
        reader: JoinHandle<()>,
    },
    Stopped,
}

/// One agent instance.
pub struct Node {
    identity: NodeIdentity,
    launcher: Arc<dyn Launcher>,
    env: BTreeMap<String, String>,
    stop_grace: Duration,
    exec_timeout: Duration,
    tail_lines: usize,
    run: Run,
    watcher: LogWatcher,
    starts: u32,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("identity", &self.identity)
            .field("launcher", &self.launcher.name())
            .field("state", &self.state())
            .field("starts", &self.starts)
            .finish()
    }
}

impl Node {
    /// Create a node. Spawns the agent now unless `options.delay_start`.
    pub async fn create(
        identity: NodeIdentity,
        launcher: Arc<dyn Launcher>,
        options: NodeOptions,
    ) -> Result<Self, NodeError> {
        let watcher = LogWatcher::with_tail_capacity(identity.name.clone(), options.tail_lines);
        let mut node = Self {
            identity,
            launcher,
            env: options.env,
            stop_grace: options.stop_grace,
            exec_timeout: options.exec_timeout,
            tail_lines: options.tail_lines,
            run: Run::Unstarted,
            watcher,
            starts: 0,
        };

        if options.delay_start {
            debug!(node = %node.identity, "delaying agent start");
        } else {
            node.spawn_run().await?;
        }
        Ok(node)
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn state(&self) -> ProcessState {
        match &self.run {
            Run::Unstarted => ProcessState::Unstarted,
            Run::Running { .. } => ProcessState::Running,
            Run::Stopped => ProcessState::Stopped,
        }
    }

    /// Pid of the current run, if any.
    pub fn pid(&self) -> Option<u32> {
        match &self.run {
            Run::Running { process, .. } => Some(process.pid()),
            _ => None,
        }
    }

    /// Number of restarts performed (starts after the first).
    pub fn restart_count(&self) -> u32 {
        self.starts.saturating_sub(1)
    }

    /// Whether the current run's process is still alive.
    ///
    /// A crashed agent keeps the node `Running` until it is stopped or
    /// restarted; this is how callers tell a dead agent from a quiet one.
    pub fn is_alive(&mut self) -> bool {
        match &mut self.run {
            Run::Running { process, .. } => process.is_running(),
            _ => false,
        }
    }

    /// Desired environment for the next start.
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Merge variables into the desired environment. Takes effect on the
    /// next start or restart only.
    pub fn set_env<K, V>(&mut self, vars: impl IntoIterator<Item = (K, V)>)
    where
        K: Into<String>,
        V: Into<String>,
    {
        for (key, value) in vars {
            self.env.insert(key.into(), value.into());
        }
    }

    /// Remove variables from the desired environment.
    pub fn unset_env<K: AsRef<str>>(&mut self, keys: impl IntoIterator<Item = K>) {
        for key in keys {
            self.env.remove(key.as_ref());
        }
    }

    /// Watcher for the current (or pending) run.
    pub fn watcher(&self) -> &LogWatcher {
        &self.watcher
    }

    /// Subscribe to the next stdout line matching `pattern` in this run.
    pub fn watch_stdout_for(&self, pattern: Regex) -> Subscription {
        self.watcher.register(pattern)
    }

    /// Like [`Self::watch_stdout_for`], compiling `pattern` first.
    pub fn watch_stdout_for_str(&self, pattern: &str) -> Result<Subscription, NodeError> {
        let re = Regex::new(pattern).map_err(|source| NodeError::Pattern {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(self.watch_stdout_for(re))
    }

    /// Recent stdout lines of the current run.
    pub fn stdout_tail(&self) -> Vec<String> {
        self.watcher.tail()
    }

    /// Start a node created with `delay_start`.
    pub async fn trigger_start(&mut self) -> Result<(), NodeError> {
        match self.run {
            Run::Unstarted => self.spawn_run().await,
            _ => Err(self.invalid("trigger_start")),
        }
    }

    /// Stop the agent and start it again with the current environment.
    pub async fn restart(&mut self) -> Result<(), NodeError> {
        self.restart_with(|_| {}).await
    }

    /// Restart, letting `register` subscribe on the new run's watcher
    /// after the old run is gone and before the new process spawns.
    pub async fn restart_with<F>(&mut self, register: F) -> Result<(), NodeError>
    where
        F: FnOnce(&LogWatcher),
    {
        if !matches!(self.run, Run::Running { .. }) {
            return Err(self.invalid("restart"));
        }

        info!(node = %self.identity, restarts = self.starts, "restarting agent");
        self.stop_run().await;

        self.watcher = LogWatcher::with_tail_capacity(self.identity.name.clone(), self.tail_lines);
        register(&self.watcher);
        self.spawn_run().await
    }

    /// Terminate the agent and release its watcher. Idempotent.
    pub async fn stop(&mut self) {
        if matches!(self.run, Run::Stopped) {
            return;
        }
        self.stop_run().await;
        info!(node = %self.identity, "node stopped");
    }

    /// Run an inspection command in the node's context and return stdout.
    pub async fn exec_output(&self, program: &str, args: &[&str]) -> Result<String, NodeError> {
        let args: Vec<String> = args.iter().map(|a| (*a).to_string()).collect();
        let mut cmd = self.launcher.exec_command(&self.identity, program, &args);
        cmd.stdin(std::process::Stdio::null());
        cmd.kill_on_drop(true);

        let output = tokio::time::timeout(self.exec_timeout, cmd.output())
            .await
            .map_err(|_| NodeError::ExecTimeout {
                node: self.identity.name.clone(),
                program: program.to_string(),
                timeout: self.exec_timeout,
            })?
            .map_err(|source| NodeError::Exec {
                node: self.identity.name.clone(),
                program: program.to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(NodeError::ExecStatus {
                node: self.identity.name.clone(),
                program: program.to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn invalid(&self, op: &'static str) -> NodeError {
        NodeError::InvalidTransition {
            node: self.identity.name.clone(),
            op,
            state: self.state(),
        }
    }

    async fn spawn_run(&mut self) -> Result<(), NodeError> {
        // A previous crashed harness may have left this node's resources behind.
        if let Err(e) = self.launcher.cleanup(&self.identity).await {
            warn!(node = %self.identity, error = %e, "pre-start cleanup failed");
        }

        let spawn_error = |source| NodeError::Spawn {
            node: self.identity.name.clone(),
            launcher: self.launcher.name().to_string(),
            source,
        };

        let cmd = self.launcher.agent_command(&self.identity, &self.env);
        let mut process = ProcessHandle::spawn(self.identity.name.clone(), cmd).map_err(spawn_error)?;
        let stdout = process
            .take_stdout()
            .ok_or_else(|| spawn_error(std::io::Error::other("agent stdout was not piped")))?;
        let reader = self.watcher.attach(stdout)?;

        self.starts += 1;
        info!(
            node = %self.identity,
            pid = process.pid(),
            launcher = self.launcher.name(),
            run = self.starts,
            "agent started"
        );
        self.run = Run::Running { process, reader };
        Ok(())
    }

    async fn stop_run(&mut self) {
        match std::mem::replace(&mut self.run, Run::Stopped) {
            Run::Running {
                mut process,
                reader,
            } => {
                let pid = process.pid();
                match process.terminate(self.stop_grace).await {
                    TerminateOutcome::Killed => {
                        warn!(node = %self.identity, pid, "agent ignored SIGTERM and was killed");
                    }
                    TerminateOutcome::Graceful => {
                        debug!(node = %self.identity, pid, "agent exited after SIGTERM");
                    }
                    TerminateOutcome::AlreadyExited => {
                        debug!(node = %self.identity, pid, "agent had already exited");
                    }
                }

                // Lines written while shutting down still belong to this run.
                if tokio::time::timeout(READER_DRAIN, reader).await.is_err() {
                    debug!(node = %self.identity, "stdout still open after exit, abandoning reader");
                }
                self.watcher.abandon();

                if let Err(e) = self.launcher.cleanup(&self.identity).await {
                    warn!(node = %self.identity, error = %e, "post-stop cleanup failed");
                }
            }
            Run::Unstarted | Run::Stopped => self.watcher.abandon(),
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        // The process itself is killed on drop; stop the reader with it.
        self.watcher.abandon();
    }
}
