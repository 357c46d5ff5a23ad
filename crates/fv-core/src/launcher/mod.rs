//! Launcher abstraction: how an agent process and its inspection commands
//! are built for a node.
//!
//! Decouples the node controller from where the agent runs, so the same
//! lifecycle code drives an agent on the host or inside a container.

pub mod docker;
pub mod host;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::process::Command;

use crate::node::NodeIdentity;

pub use docker::{DockerConfig, DockerLauncher};
pub use host::HostLauncher;

/// Builds the commands that run an agent and inspect its node.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Human-readable name of the backend (e.g. "host", "docker").
    fn name(&self) -> &str;

    /// Command that runs the agent for `node` with exactly `env` layered
    /// on top of the inherited environment.
    fn agent_command(&self, node: &NodeIdentity, env: &BTreeMap<String, String>) -> Command;

    /// Command that runs an inspection tool in the node's context.
    fn exec_command(&self, node: &NodeIdentity, program: &str, args: &[String]) -> Command;

    /// Release anything the previous run left behind. Called after every
    /// stop, before a restart spawns again.
    async fn cleanup(&self, _node: &NodeIdentity) -> Result<()> {
        Ok(())
    }
}

/// Factory: create a launcher from a mode string.
///
/// `agent` is the agent binary for host mode and the container command for
/// docker mode; `image` is required for docker mode.
pub fn create_launcher(
    mode: &str,
    agent: PathBuf,
    agent_args: Vec<String>,
    image: Option<&str>,
) -> Result<Arc<dyn Launcher>> {
    match mode {
        "host" => Ok(Arc::new(HostLauncher::new(agent).with_args(agent_args))),
        "docker" => {
            let Some(image) = image else {
                bail!("docker launcher requires an image");
            };
            let mut command = vec![agent.to_string_lossy().into_owned()];
            command.extend(agent_args);
            Ok(Arc::new(DockerLauncher::new(DockerConfig {
                image: image.to_string(),
                command,
                ..DockerConfig::default()
            })))
        }
        other => bail!("unknown launcher mode: {other:?} (expected \"host\" or \"docker\")"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_builds_host_launcher() {
        let launcher = create_launcher("host", PathBuf::from("/bin/agent"), vec![], None).unwrap();
        assert_eq!(launcher.name(), "host");
    }

    #[test]
    fn factory_requires_image_for_docker() {
        let err = create_launcher("docker", PathBuf::from("agent"), vec![], None)
            .err()
            .unwrap();
        assert!(err.to_string().contains("requires an image"));

        let launcher =
            create_launcher("docker", PathBuf::from("agent"), vec![], Some("agent:dev")).unwrap();
        assert_eq!(launcher.name(), "docker");
    }

    #[test]
    fn factory_rejects_unknown_mode() {
        let err = create_launcher("vm", PathBuf::from("agent"), vec![], None)
            .err()
            .unwrap();
        assert!(err.to_string().contains("unknown launcher mode"));
    }
}
