//! Scenario runner: drives a topology through a scenario's steps.
//!
//! Steps run in order. The first failing step fails the scenario, the
//! remaining steps are skipped and error data is dumped. The topology is
//! always stopped before the report is returned.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::format::{ScenarioToml, Step, WatchSpec};
use crate::node::Node;
use crate::poll::Poller;
use crate::topology::{Infrastructure, Topology, TopologyOptions, start_topology};
use crate::watch::{Subscription, SubscriptionState};

#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    #[error("failed to start topology for scenario {scenario:?}")]
    Setup {
        scenario: String,
        #[source]
        source: anyhow::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Passed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub index: usize,
    pub action: &'static str,
    pub outcome: StepOutcome,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Result of one scenario run.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub name: String,
    pub passed: bool,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
    pub steps: Vec<StepReport>,
}

impl ScenarioReport {
    /// First failing step, if any.
    pub fn failure(&self) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.outcome == StepOutcome::Failed)
    }
}

/// Run `scenario` against `infra`.
///
/// Only a topology that cannot be started is an error; step failures are
/// reported in the returned [`ScenarioReport`].
pub async fn run_scenario(
    scenario: &ScenarioToml,
    infra: Arc<dyn Infrastructure>,
) -> Result<ScenarioReport, ScenarioError> {
    let name = scenario.name.clone().unwrap_or_else(|| "scenario".to_string());
    let started = Instant::now();

    let mut options = TopologyOptions {
        delay_start: scenario.delay_start,
        extra_env: scenario.env.clone(),
        name_prefix: scenario.name_prefix.clone(),
        ..TopologyOptions::default()
    };
    if let Some(severity) = &scenario.log_severity {
        options.log_severity = severity.clone();
    }
    if let Some(grace) = scenario.stop_grace {
        options.stop_grace = grace;
    }

    info!(scenario = %name, nodes = scenario.nodes, steps = scenario.steps.len(), "running scenario");
    let topology = start_topology(scenario.nodes, &options, infra)
        .await
        .map_err(|source| ScenarioError::Setup {
            scenario: name.clone(),
            source,
        })?;

    let mut run = Run {
        topology,
        subscriptions: HashMap::new(),
    };
    let mut steps = Vec::with_capacity(scenario.steps.len());
    let mut failed = false;

    for (index, step) in scenario.steps.iter().enumerate() {
        if failed {
            steps.push(StepReport {
                index,
                action: step.action(),
                outcome: StepOutcome::Skipped,
                elapsed: Duration::ZERO,
                detail: None,
            });
            continue;
        }

        let t = Instant::now();
        let result = run.step(step).await;
        let elapsed = t.elapsed();
        let (outcome, detail) = match result {
            Ok(detail) => {
                debug!(scenario = %name, step = index, action = step.action(), "step passed");
                (StepOutcome::Passed, detail)
            }
            Err(reason) => {
                warn!(scenario = %name, step = index, action = step.action(), %reason, "step failed");
                failed = true;
                (StepOutcome::Failed, Some(reason))
            }
        };
        steps.push(StepReport {
            index,
            action: step.action(),
            outcome,
            elapsed,
            detail,
        });
    }

    if failed {
        run.topology.dump_error_data().await;
    }
    if let Err(e) = run.topology.stop().await {
        warn!(scenario = %name, error = %e, "teardown failed");
    }

    let report = ScenarioReport {
        name,
        passed: !failed,
        elapsed: started.elapsed(),
        steps,
    };
    info!(scenario = %report.name, passed = report.passed, elapsed = ?report.elapsed, "scenario finished");
    Ok(report)
}

struct Run {
    topology: Topology,
    subscriptions: HashMap<String, Subscription>,
}

type StepResult = Result<Option<String>, String>;

impl Run {
    fn node(&self, index: usize) -> Result<&Node, String> {
        self.topology
            .node(index)
            .ok_or_else(|| format!("no node {index}"))
    }

    fn node_mut(&mut self, index: usize) -> Result<&mut Node, String> {
        self.topology
            .node_mut(index)
            .ok_or_else(|| format!("no node {index}"))
    }

    fn targets(&self, node: Option<usize>) -> Vec<usize> {
        match node {
            Some(index) => vec![index],
            None => (0..self.topology.len()).collect(),
        }
    }

    fn subscription(&self, name: &str) -> Result<&Subscription, String> {
        self.subscriptions
            .get(name)
            .ok_or_else(|| format!("{name:?} was never watched"))
    }

    async fn step(&mut self, step: &Step) -> StepResult {
        match step {
            Step::Allow { selector } => {
                self.topology
                    .infra()
                    .add_allow_rule(selector)
                    .await
                    .map_err(|e| format!("{e:#}"))?;
                Ok(None)
            }
            Step::Watch {
                name,
                pattern,
                node,
            } => {
                let sub = self
                    .node(*node)?
                    .watch_stdout_for_str(pattern)
                    .map_err(|e| e.to_string())?;
                self.subscriptions.insert(name.clone(), sub);
                Ok(None)
            }
            Step::TriggerStart { node } => {
                for index in self.targets(*node) {
                    self.node_mut(index)?
                        .trigger_start()
                        .await
                        .map_err(|e| e.to_string())?;
                }
                Ok(None)
            }
            Step::ExpectMatched { name, timeout } => {
                match self.subscription(name)?.wait(*timeout).await {
                    Ok(m) => Ok(Some(format!("line {}: {}", m.line_number, m.line))),
                    Err(e) => Err(format!("{name}: {e}")),
                }
            }
            Step::ExpectPending { name } => match self.subscription(name)?.state() {
                SubscriptionState::Pending => Ok(None),
                SubscriptionState::Matched(m) => Err(format!(
                    "{name} matched line {}: {}",
                    m.line_number, m.line
                )),
                // Discarded without a match still counts as never matched.
                SubscriptionState::Abandoned => Ok(Some("abandoned without a match".to_string())),
            },
            Step::Restart { node, watch } => {
                let patterns = compile(watch)?;
                let mut registered = Vec::with_capacity(patterns.len());
                self.node_mut(*node)?
                    .restart_with(|watcher| {
                        for (name, re) in patterns {
                            registered.push((name, watcher.register(re)));
                        }
                    })
                    .await
                    .map_err(|e| e.to_string())?;
                self.subscriptions.extend(registered);
                Ok(None)
            }
            Step::SetEnv { node, env, unset } => {
                for index in self.targets(*node) {
                    let node = self.node_mut(index)?;
                    node.unset_env(unset);
                    node.set_env(env.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
                Ok(None)
            }
            Step::Stop { node } => {
                for index in self.targets(*node) {
                    self.node_mut(index)?.stop().await;
                }
                Ok(None)
            }
            Step::PollExec {
                node,
                command,
                contains,
                lacks,
                timeout,
                interval,
            } => {
                let node = self.node(*node)?;
                let (program, args) = command
                    .split_first()
                    .ok_or_else(|| "empty command".to_string())?;
                let args: Vec<&str> = args.iter().map(String::as_str).collect();
                let (needle, want) = match (contains, lacks) {
                    (Some(needle), None) => (needle.as_str(), true),
                    (None, Some(needle)) => (needle.as_str(), false),
                    _ => return Err("needs exactly one of contains or lacks".to_string()),
                };

                // A failing command never satisfies the expectation.
                let poller = Poller::new(*timeout, *interval);
                let satisfied = poller
                    .until_some(|| {
                        let args = &args;
                        async move {
                            match node.exec_output(program, args).await {
                                Ok(out) if out.contains(needle) == want => Some(out),
                                Ok(_) => None,
                                Err(e) => {
                                    debug!(node = node.name(), error = %e, "inspection command failed");
                                    None
                                }
                            }
                        }
                    })
                    .await;

                match satisfied {
                    Ok(_) => Ok(None),
                    Err(t) => {
                        let verb = if want { "contain" } else { "stop containing" };
                        Err(format!("{} output did not {verb} {needle:?}: {t}", command.join(" ")))
                    }
                }
            }
            Step::Sleep { duration } => {
                tokio::time::sleep(*duration).await;
                Ok(None)
            }
        }
    }
}

fn compile(specs: &[WatchSpec]) -> Result<Vec<(String, Regex)>, String> {
    specs
        .iter()
        .map(|spec| {
            Regex::new(&spec.pattern)
                .map(|re| (spec.name.clone(), re))
                .map_err(|e| format!("invalid pattern {:?}: {e}", spec.pattern))
        })
        .collect()
}
