//! Topology orchestrator: N nodes over one shared infrastructure.
//!
//! Creation is all-or-nothing. If any node fails to come up, every node
//! created so far is stopped before the error is returned.

pub mod infra;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::node::{Node, NodeIdentity, NodeOptions};
use crate::watch::DEFAULT_TAIL_LINES;

pub use infra::{Infrastructure, LocalInfra};

/// Options applied to every node of a topology.
#[derive(Debug, Clone)]
pub struct TopologyOptions {
    /// Create nodes unstarted; each needs `trigger_start`.
    pub delay_start: bool,
    /// Variables added to every agent's environment.
    pub extra_env: BTreeMap<String, String>,
    /// Agent log severity, exported as `log_severity_var`.
    pub log_severity: String,
    pub log_severity_var: String,
    /// Node names become `<prefix>-<index>`. A random prefix when unset.
    pub name_prefix: Option<String>,
    pub stop_grace: Duration,
    pub tail_lines: usize,
}

impl Default for TopologyOptions {
    fn default() -> Self {
        Self {
            delay_start: false,
            extra_env: BTreeMap::new(),
            log_severity: "info".to_string(),
            log_severity_var: "FELIX_LOGSEVERITYSCREEN".to_string(),
            name_prefix: None,
            stop_grace: Duration::from_secs(10),
            tail_lines: DEFAULT_TAIL_LINES,
        }
    }
}

impl TopologyOptions {
    /// Initial environment for one node. Later layers win:
    /// infrastructure, log severity, extra env, node identity.
    pub fn node_env(
        &self,
        infra_env: &BTreeMap<String, String>,
        node: &NodeIdentity,
    ) -> BTreeMap<String, String> {
        let mut env = infra_env.clone();
        if !self.log_severity_var.is_empty() {
            env.insert(self.log_severity_var.clone(), self.log_severity.clone());
        }
        env.extend(self.extra_env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env.insert("FV_NODE_NAME".to_string(), node.name.clone());
        env.insert("FV_NODE_INDEX".to_string(), node.index.to_string());
        env
    }

    fn prefix(&self) -> String {
        match &self.name_prefix {
            Some(prefix) => prefix.clone(),
            None => {
                let id = Uuid::new_v4().simple().to_string();
                format!("fv-{}", &id[..8])
            }
        }
    }
}

/// A running set of nodes and the infrastructure they share.
pub struct Topology {
    nodes: Vec<Node>,
    infra: Arc<dyn Infrastructure>,
}

impl std::fmt::Debug for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topology")
            .field("infra", &self.infra.name())
            .field("nodes", &self.nodes)
            .finish()
    }
}

/// Create `n` nodes against `infra`.
pub async fn start_topology(
    n: usize,
    options: &TopologyOptions,
    infra: Arc<dyn Infrastructure>,
) -> Result<Topology> {
    let prefix = options.prefix();
    let launcher = infra.launcher();
    let infra_env = infra.node_env();
    let mut nodes = Vec::with_capacity(n);

    info!(
        infra = infra.name(),
        launcher = launcher.name(),
        nodes = n,
        prefix = %prefix,
        delay_start = options.delay_start,
        "starting topology"
    );

    for index in 0..n {
        let identity = NodeIdentity::new(format!("{prefix}-{index}"), index);
        let node_options = NodeOptions {
            delay_start: options.delay_start,
            env: options.node_env(&infra_env, &identity),
            stop_grace: options.stop_grace,
            tail_lines: options.tail_lines,
            ..NodeOptions::default()
        };

        match Node::create(identity, Arc::clone(&launcher), node_options).await {
            Ok(node) => nodes.push(node),
            Err(e) => {
                rollback(&mut nodes).await;
                return Err(e).with_context(|| format!("failed to create node {index} of {n}"));
            }
        }
    }

    if let Err(e) = infra.connect(&nodes).await {
        rollback(&mut nodes).await;
        return Err(e).context("failed to connect topology nodes");
    }

    Ok(Topology { nodes, infra })
}

async fn rollback(nodes: &mut [Node]) {
    if nodes.is_empty() {
        return;
    }
    warn!(created = nodes.len(), "topology start failed, stopping created nodes");
    for node in nodes.iter_mut().rev() {
        node.stop().await;
    }
}

impl Topology {
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn nodes_mut(&mut self) -> &mut [Node] {
        &mut self.nodes
    }

    pub fn node(&self, index: usize) -> Option<&Node> {
        self.nodes.get(index)
    }

    pub fn node_mut(&mut self, index: usize) -> Option<&mut Node> {
        self.nodes.get_mut(index)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn infra(&self) -> &Arc<dyn Infrastructure> {
        &self.infra
    }

    /// Split into the nodes and the shared infrastructure.
    pub fn into_parts(self) -> (Vec<Node>, Arc<dyn Infrastructure>) {
        (self.nodes, self.infra)
    }

    /// Log every node's recent stdout, then the infrastructure's state.
    pub async fn dump_error_data(&self) {
        for node in &self.nodes {
            let tail = node.stdout_tail();
            error!(
                node = node.name(),
                state = %node.state(),
                lines = tail.len(),
                "recent agent output follows"
            );
            for line in tail {
                error!(node = node.name(), "| {line}");
            }
        }
        self.infra.dump_error_data().await;
    }

    /// Stop nodes in reverse order, then the infrastructure.
    pub async fn stop(&mut self) -> Result<()> {
        for node in self.nodes.iter_mut().rev() {
            node.stop().await;
        }
        self.infra
            .stop()
            .await
            .with_context(|| format!("failed to stop {} infrastructure", self.infra.name()))
    }
}
