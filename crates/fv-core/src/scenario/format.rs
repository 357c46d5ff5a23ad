//! TOML format types for scenario files.
//!
//! ```toml
//! name = "bpf reattach"
//! nodes = 1
//! delay_start = true
//! log_severity = "debug"
//!
//! [env]
//! FELIX_BPFENABLED = "true"
//!
//! [[steps]]
//! action = "watch"
//! name = "hep_to"
//! pattern = 'Program attached to TC.*ToOrFrom:"to"'
//!
//! [[steps]]
//! action = "trigger_start"
//!
//! [[steps]]
//! action = "expect_matched"
//! name = "hep_to"
//! timeout = "10s"
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level structure of a scenario file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ScenarioToml {
    /// Human-readable name. Defaults to the file stem when loaded from disk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Number of nodes in the topology.
    #[serde(default = "default_nodes")]
    pub nodes: usize,
    /// Create nodes unstarted; steps must `trigger_start` them.
    #[serde(default)]
    pub delay_start: bool,
    /// Agent log severity. Uses the topology default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_severity: Option<String>,
    /// Node name prefix. Random when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_prefix: Option<String>,
    /// Grace period between SIGTERM and SIGKILL.
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub stop_grace: Option<Duration>,
    /// Extra environment for every agent.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Ordered steps.
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// A subscription to register: `name` is how later steps refer to it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct WatchSpec {
    pub name: String,
    pub pattern: String,
}

/// One `[[steps]]` entry. `node` defaults to 0 for `watch`, `restart` and
/// `poll_exec`. `trigger_start`, `set_env` and `stop` default to every node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    /// Add an allow rule to the infrastructure.
    Allow { selector: String },

    /// Register a subscription on the node's current run.
    Watch {
        name: String,
        pattern: String,
        #[serde(default)]
        node: usize,
    },

    TriggerStart {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        node: Option<usize>,
    },

    /// Wait for a named subscription to match.
    ExpectMatched {
        name: String,
        #[serde(default = "default_wait", with = "humantime_serde")]
        timeout: Duration,
    },

    /// Assert a named subscription has not matched.
    ExpectPending { name: String },

    /// Restart one node, registering `watch` on the new run before it
    /// spawns.
    Restart {
        #[serde(default)]
        node: usize,
        #[serde(default)]
        watch: Vec<WatchSpec>,
    },

    /// Change the environment for the next start.
    SetEnv {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        node: Option<usize>,
        #[serde(default)]
        env: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        unset: Vec<String>,
    },

    Stop {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        node: Option<usize>,
    },

    /// Poll an inspection command until its output contains (or lacks) a
    /// substring.
    PollExec {
        #[serde(default)]
        node: usize,
        command: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        contains: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lacks: Option<String>,
        #[serde(default = "default_poll_timeout", with = "humantime_serde")]
        timeout: Duration,
        #[serde(default = "default_poll_interval", with = "humantime_serde")]
        interval: Duration,
    },

    Sleep {
        #[serde(with = "humantime_serde")]
        duration: Duration,
    },
}

impl Step {
    /// The `action` tag, for reports.
    pub fn action(&self) -> &'static str {
        match self {
            Self::Allow { .. } => "allow",
            Self::Watch { .. } => "watch",
            Self::TriggerStart { .. } => "trigger_start",
            Self::ExpectMatched { .. } => "expect_matched",
            Self::ExpectPending { .. } => "expect_pending",
            Self::Restart { .. } => "restart",
            Self::SetEnv { .. } => "set_env",
            Self::Stop { .. } => "stop",
            Self::PollExec { .. } => "poll_exec",
            Self::Sleep { .. } => "sleep",
        }
    }
}

fn default_nodes() -> usize {
    1
}

fn default_wait() -> Duration {
    Duration::from_secs(10)
}

fn default_poll_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}
