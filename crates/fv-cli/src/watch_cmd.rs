//! `fv watch`: start one agent and wait for stdout patterns.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use regex::Regex;
use tokio::time::Instant;

use fv_core::watch::{LineMatch, Subscription};
use fv_core::{LocalInfra, NodeError, Topology, TopologyOptions, start_topology};
use tracing::warn;

use crate::config::FvConfig;

/// Arguments for `fv watch`.
#[derive(Debug)]
pub struct WatchArgs {
    pub patterns: Vec<String>,
    pub absent: Vec<String>,
    pub timeout: Duration,
    /// Agent command; the configured agent when empty.
    pub command: Vec<String>,
}

/// What happened to one pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternResult {
    Matched { pattern: String, line_number: u64, line: String },
    Missing { pattern: String },
    /// An absent pattern matched before the last expected line.
    Unwanted { pattern: String, line_number: u64, line: String },
    Absent { pattern: String },
}

impl PatternResult {
    pub fn ok(&self) -> bool {
        matches!(self, Self::Matched { .. } | Self::Absent { .. })
    }
}

impl std::fmt::Display for PatternResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Matched {
                pattern,
                line_number,
                line,
            } => write!(f, "matched  {pattern:?} at line {line_number}: {line}"),
            Self::Missing { pattern } => write!(f, "MISSING  {pattern:?}"),
            Self::Unwanted {
                pattern,
                line_number,
                line,
            } => write!(f, "UNWANTED {pattern:?} at line {line_number}: {line}"),
            Self::Absent { pattern } => write!(f, "absent   {pattern:?}"),
        }
    }
}

fn compile(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| Regex::new(p).with_context(|| format!("invalid pattern {p:?}")))
        .collect()
}

/// Classify absent-pattern subscriptions. A match at or before `horizon`
/// (the last expected line) is unwanted; with no horizon any match is.
pub fn check_absent(subs: &[Subscription], horizon: Option<u64>) -> Vec<PatternResult> {
    subs.iter()
        .map(|sub| {
            let unwanted = sub.matched().filter(|m| match horizon {
                Some(last) => m.line_number <= last,
                None => true,
            });
            match unwanted {
                Some(m) => PatternResult::Unwanted {
                    pattern: sub.pattern().to_string(),
                    line_number: m.line_number,
                    line: m.line.clone(),
                },
                None => PatternResult::Absent {
                    pattern: sub.pattern().to_string(),
                },
            }
        })
        .collect()
}

/// Execute `fv watch`.
pub async fn run_watch(config: &FvConfig, args: WatchArgs) -> Result<()> {
    if args.patterns.is_empty() && args.absent.is_empty() {
        bail!("nothing to watch; pass at least one --pattern or --absent");
    }
    let expected = compile(&args.patterns)?;
    let unwanted = compile(&args.absent)?;

    let launcher = match args.command.split_first() {
        Some((program, rest)) => config.launcher_for(PathBuf::from(program), rest.to_vec())?,
        None => config.launcher()?,
    };

    let options = TopologyOptions {
        delay_start: true,
        log_severity: config.log_severity.clone(),
        name_prefix: Some("fv-watch".to_string()),
        stop_grace: config.stop_grace,
        ..TopologyOptions::default()
    };
    let infra = Arc::new(LocalInfra::new(launcher));
    let mut topology = start_topology(1, &options, infra).await?;
    let node = topology
        .node_mut(0)
        .context("topology has no nodes")?;

    let expected: Vec<Subscription> = expected.into_iter().map(|re| node.watch_stdout_for(re)).collect();
    let unwanted: Vec<Subscription> = unwanted.into_iter().map(|re| node.watch_stdout_for(re)).collect();

    if let Err(e) = node.trigger_start().await {
        return Err(abort_start(&mut topology, e).await);
    }

    let deadline = Instant::now() + args.timeout;
    let mut results = Vec::with_capacity(expected.len() + unwanted.len());
    let mut horizon: Option<u64> = None;
    for sub in &expected {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match sub.wait(remaining).await {
            Ok(m) => {
                horizon = Some(horizon.map_or(m.line_number, |h| h.max(m.line_number)));
                results.push(matched(sub, &m));
            }
            Err(_) => results.push(PatternResult::Missing {
                pattern: sub.pattern().to_string(),
            }),
        }
    }
    if expected.is_empty() {
        // Only absent patterns: observe for the whole window.
        tokio::time::sleep_until(deadline).await;
    }
    results.extend(check_absent(&unwanted, horizon));

    if results.iter().any(|r| !r.ok()) {
        topology.dump_error_data().await;
    }
    topology.stop().await?;

    for result in &results {
        println!("{result}");
    }
    let failed = results.iter().filter(|r| !r.ok()).count();
    if failed > 0 {
        bail!("{failed} of {} pattern checks failed", results.len());
    }
    Ok(())
}

/// Tear down after a failed start. The start error is what the caller sees;
/// a teardown failure is only logged.
async fn abort_start(topology: &mut Topology, err: NodeError) -> anyhow::Error {
    if let Err(e) = topology.stop().await {
        warn!(error = %format!("{e:#}"), "teardown after failed start failed");
    }
    anyhow::Error::new(err).context("failed to start agent")
}

fn matched(sub: &Subscription, m: &LineMatch) -> PatternResult {
    PatternResult::Matched {
        pattern: sub.pattern().to_string(),
        line_number: m.line_number,
        line: m.line.clone(),
    }
}

#[cfg(test)]
mod tests {
    use fv_core::launcher::{HostLauncher, Launcher};
    use fv_core::process::ProcessState;
    use fv_core::{Infrastructure, LogWatcher};
    use tokio::io::AsyncWriteExt;

    use super::*;

    #[tokio::test]
    async fn absent_match_before_horizon_is_unwanted() {
        let watcher = LogWatcher::new("t");
        let sub = watcher.register(Regex::new("panic").unwrap());
        let (mut tx, rx) = tokio::io::duplex(256);
        let reader = watcher.attach(rx).unwrap();
        tx.write_all(b"starting\npanic: boom\nready\n").await.unwrap();
        drop(tx);
        reader.await.unwrap();

        let subs = std::slice::from_ref(&sub);
        assert_eq!(
            check_absent(subs, Some(3)),
            vec![PatternResult::Unwanted {
                pattern: "panic".to_string(),
                line_number: 2,
                line: "panic: boom".to_string(),
            }]
        );
        assert!(!check_absent(subs, None)[0].ok());
        assert!(check_absent(subs, Some(1))[0].ok());
    }

    /// Host infrastructure whose teardown always fails.
    struct StuckInfra(LocalInfra);

    #[async_trait::async_trait]
    impl Infrastructure for StuckInfra {
        fn name(&self) -> &str {
            "stuck"
        }

        fn launcher(&self) -> Arc<dyn Launcher> {
            self.0.launcher()
        }

        async fn add_allow_rule(&self, selector: &str) -> anyhow::Result<()> {
            self.0.add_allow_rule(selector).await
        }

        async fn dump_error_data(&self) {}

        async fn stop(&self) -> anyhow::Result<()> {
            anyhow::bail!("datastore refused to shut down")
        }
    }

    #[tokio::test]
    async fn failed_start_keeps_spawn_error_when_teardown_fails() {
        let launcher = Arc::new(HostLauncher::new("/nonexistent/fv/agent"));
        let infra = Arc::new(StuckInfra(LocalInfra::new(launcher)));
        let options = TopologyOptions {
            delay_start: true,
            name_prefix: Some("abort".to_string()),
            ..TopologyOptions::default()
        };
        let mut topology = start_topology(1, &options, infra).await.unwrap();

        let spawn_err = topology
            .node_mut(0)
            .unwrap()
            .trigger_start()
            .await
            .unwrap_err();
        let err = abort_start(&mut topology, spawn_err).await;

        assert_eq!(err.to_string(), "failed to start agent");
        assert!(matches!(
            err.downcast_ref::<NodeError>(),
            Some(NodeError::Spawn { .. })
        ));
        assert!(!format!("{err:#}").contains("refused to shut down"));
        assert_eq!(topology.node(0).unwrap().state(), ProcessState::Stopped);
    }

    #[test]
    fn results_display_and_status() {
        let ok = PatternResult::Matched {
            pattern: "ready".to_string(),
            line_number: 3,
            line: "agent ready".to_string(),
        };
        let missing = PatternResult::Missing {
            pattern: "attached".to_string(),
        };
        assert!(ok.ok());
        assert!(!missing.ok());
        assert_eq!(ok.to_string(), "matched  \"ready\" at line 3: agent ready");
        assert_eq!(missing.to_string(), "MISSING  \"attached\"");
    }
}
