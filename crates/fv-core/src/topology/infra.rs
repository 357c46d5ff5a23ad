//! Shared infrastructure: the environment every node in a topology runs
//! against (datastore, policy, network wiring).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};
use async_trait::async_trait;
use tracing::{info, warn};

use crate::launcher::Launcher;
use crate::node::Node;

/// Collaborator shared by all nodes of a topology. Outlives any single
/// node's restarts.
#[async_trait]
pub trait Infrastructure: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Launcher every node in the topology is spawned with.
    fn launcher(&self) -> Arc<dyn Launcher>;

    /// Environment the infrastructure requires in every agent (datastore
    /// endpoints, credentials).
    fn node_env(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    /// Wire freshly created nodes together (routes, peering).
    async fn connect(&self, _nodes: &[Node]) -> Result<()> {
        Ok(())
    }

    /// Install a rule permitting traffic for endpoints matching `selector`.
    async fn add_allow_rule(&self, selector: &str) -> Result<()>;

    /// Log whatever state helps explain a failed test.
    async fn dump_error_data(&self);

    /// Tear the infrastructure down. Nodes must already be stopped.
    async fn stop(&self) -> Result<()>;
}

/// Infrastructure for agents running directly on the host. Rules are
/// recorded in memory.
pub struct LocalInfra {
    launcher: Arc<dyn Launcher>,
    env: BTreeMap<String, String>,
    rules: Mutex<Vec<String>>,
    stopped: AtomicBool,
}

impl LocalInfra {
    pub fn new(launcher: Arc<dyn Launcher>) -> Self {
        Self {
            launcher,
            env: BTreeMap::new(),
            rules: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Selectors passed to [`Infrastructure::add_allow_rule`], in order.
    pub fn rules(&self) -> Vec<String> {
        self.rules.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Infrastructure for LocalInfra {
    fn name(&self) -> &str {
        "local"
    }

    fn launcher(&self) -> Arc<dyn Launcher> {
        Arc::clone(&self.launcher)
    }

    fn node_env(&self) -> BTreeMap<String, String> {
        self.env.clone()
    }

    async fn add_allow_rule(&self, selector: &str) -> Result<()> {
        if selector.trim().is_empty() {
            bail!("allow rule selector must not be empty");
        }
        if self.is_stopped() {
            bail!("cannot add rule {selector:?}: infrastructure is stopped");
        }
        info!(infra = self.name(), selector, "added allow rule");
        self.rules
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(selector.to_string());
        Ok(())
    }

    async fn dump_error_data(&self) {
        let rules = self.rules();
        warn!(infra = self.name(), rules = ?rules, "infrastructure state");
    }

    async fn stop(&self) -> Result<()> {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            info!(infra = self.name(), "infrastructure stopped");
        }
        Ok(())
    }
}
