//! Host launcher: the agent runs as a plain child process.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;

use super::Launcher;
use crate::node::NodeIdentity;

/// Runs the agent binary directly on the host.
///
/// Inspection commands also run on the host; they receive `FV_NODE_NAME`
/// and `FV_NODE_INDEX` so node-aware tools can find the node's state.
#[derive(Debug, Clone)]
pub struct HostLauncher {
    program: PathBuf,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl HostLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

#[async_trait]
impl Launcher for HostLauncher {
    fn name(&self) -> &str {
        "host"
    }

    fn agent_command(&self, _node: &NodeIdentity, env: &BTreeMap<String, String>) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        // Merge, don't replace the entire env.
        cmd.envs(env);
        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    fn exec_command(&self, node: &NodeIdentity, program: &str, args: &[String]) -> Command {
        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.env("FV_NODE_NAME", &node.name);
        cmd.env("FV_NODE_INDEX", node.index.to_string());
        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}
