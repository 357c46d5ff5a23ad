//! Docker launcher: each node is a named container running the agent in
//! the foreground.
//!
//! `docker run` stays attached, so the container's stdout is the child's
//! stdout and SIGTERM on the client is proxied to the agent. Inspection
//! commands go through `docker exec`, and `docker rm -f` clears the name
//! before the next run.

use std::collections::BTreeMap;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::process::Command;

use super::Launcher;
use crate::node::NodeIdentity;

/// Configuration for the docker launcher.
#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// Path or name of the docker CLI.
    pub docker_binary: String,
    /// Image to run (e.g. "calico/felix:latest-amd64").
    pub image: String,
    /// Command and arguments passed after the image. Empty uses the
    /// image's default entrypoint.
    pub command: Vec<String>,
    /// Additional flags for `docker run` (e.g. "--privileged").
    pub extra_flags: Vec<String>,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            docker_binary: "docker".to_string(),
            image: String::new(),
            command: Vec::new(),
            extra_flags: vec!["--privileged".to_string()],
        }
    }
}

#[derive(Debug, Clone)]
pub struct DockerLauncher {
    config: DockerConfig,
}

impl DockerLauncher {
    pub fn new(config: DockerConfig) -> Self {
        Self { config }
    }

    /// Container name for a node (alphanumeric and hyphens only).
    pub fn container_name(node: &NodeIdentity) -> String {
        node.name
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '-' })
            .collect()
    }
}

#[async_trait]
impl Launcher for DockerLauncher {
    fn name(&self) -> &str {
        "docker"
    }

    fn agent_command(&self, node: &NodeIdentity, env: &BTreeMap<String, String>) -> Command {
        let name = Self::container_name(node);
        let mut cmd = Command::new(&self.config.docker_binary);
        cmd.args(["run", "--rm", "--name", &name, "--hostname", &name]);
        cmd.args(&self.config.extra_flags);
        for (key, value) in env {
            cmd.arg("-e").arg(format!("{key}={value}"));
        }
        cmd.arg(&self.config.image);
        cmd.args(&self.config.command);
        cmd
    }

    fn exec_command(&self, node: &NodeIdentity, program: &str, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.config.docker_binary);
        cmd.arg("exec").arg(Self::container_name(node)).arg(program).args(args);
        cmd
    }

    async fn cleanup(&self, node: &NodeIdentity) -> Result<()> {
        let name = Self::container_name(node);
        let output = Command::new(&self.config.docker_binary)
            .args(["rm", "-f", &name])
            .output()
            .await
            .context("failed to run docker rm")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // Don't fail if the container is already gone.
            if !stderr.contains("No such container") {
                bail!("docker rm -f {name} failed: {stderr}");
            }
        }
        Ok(())
    }
}
