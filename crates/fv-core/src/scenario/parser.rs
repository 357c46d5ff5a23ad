//! Scenario parser with validation.
//!
//! Checks, before anything is spawned:
//! - every node index is within the topology;
//! - every pattern compiles;
//! - `expect_*` steps refer to a name an earlier step watched;
//! - `poll_exec` has a command and exactly one of `contains` / `lacks`.

use std::collections::HashSet;
use std::path::Path;

use regex::Regex;
use thiserror::Error;

use super::format::{ScenarioToml, Step};

#[derive(Debug, Error)]
pub enum ScenarioParseError {
    #[error("failed to read scenario {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("scenario must have at least one node")]
    NoNodes,

    #[error("step {step}: node {node} is out of range (scenario has {nodes} nodes)")]
    NodeOutOfRange { step: usize, node: usize, nodes: usize },

    #[error("step {step}: invalid pattern {pattern:?}: {source}")]
    InvalidPattern {
        step: usize,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("step {step}: {name:?} was never watched")]
    UnknownWatch { step: usize, name: String },

    #[error("step {step}: {reason}")]
    InvalidStep { step: usize, reason: String },
}

/// Parse and validate a scenario string.
pub fn parse_scenario(content: &str) -> Result<ScenarioToml, ScenarioParseError> {
    let scenario: ScenarioToml = toml::from_str(content)?;
    validate(&scenario)?;
    Ok(scenario)
}

/// Read, parse, and validate a scenario file. The file stem names an
/// unnamed scenario.
pub fn load_scenario(path: &Path) -> Result<ScenarioToml, ScenarioParseError> {
    let content = std::fs::read_to_string(path).map_err(|source| ScenarioParseError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let mut scenario = parse_scenario(&content)?;
    if scenario.name.is_none() {
        scenario.name = path.file_stem().map(|s| s.to_string_lossy().into_owned());
    }
    Ok(scenario)
}

fn validate(scenario: &ScenarioToml) -> Result<(), ScenarioParseError> {
    if scenario.nodes == 0 {
        return Err(ScenarioParseError::NoNodes);
    }

    let nodes = scenario.nodes;
    let check_node = |step: usize, node: usize| {
        if node >= nodes {
            Err(ScenarioParseError::NodeOutOfRange { step, node, nodes })
        } else {
            Ok(())
        }
    };
    let check_pattern = |step: usize, pattern: &str| {
        Regex::new(pattern)
            .map(|_| ())
            .map_err(|source| ScenarioParseError::InvalidPattern {
                step,
                pattern: pattern.to_string(),
                source,
            })
    };

    let mut watched: HashSet<&str> = HashSet::new();
    for (step, entry) in scenario.steps.iter().enumerate() {
        match entry {
            Step::Allow { selector } => {
                if selector.trim().is_empty() {
                    return Err(invalid(step, "allow selector must not be empty"));
                }
            }
            Step::Watch {
                name,
                pattern,
                node,
            } => {
                check_node(step, *node)?;
                check_pattern(step, pattern)?;
                watched.insert(name);
            }
            Step::TriggerStart { node } | Step::Stop { node } | Step::SetEnv { node, .. } => {
                if let Some(node) = node {
                    check_node(step, *node)?;
                }
            }
            Step::ExpectMatched { name, .. } | Step::ExpectPending { name } => {
                if !watched.contains(name.as_str()) {
                    return Err(ScenarioParseError::UnknownWatch {
                        step,
                        name: name.clone(),
                    });
                }
            }
            Step::Restart { node, watch } => {
                check_node(step, *node)?;
                for spec in watch {
                    check_pattern(step, &spec.pattern)?;
                    watched.insert(&spec.name);
                }
            }
            Step::PollExec {
                node,
                command,
                contains,
                lacks,
                interval,
                ..
            } => {
                check_node(step, *node)?;
                if command.is_empty() {
                    return Err(invalid(step, "poll_exec needs a command"));
                }
                if contains.is_some() == lacks.is_some() {
                    return Err(invalid(step, "poll_exec needs exactly one of `contains` or `lacks`"));
                }
                if interval.is_zero() {
                    return Err(invalid(step, "poll_exec interval must be non-zero"));
                }
            }
            Step::Sleep { .. } => {}
        }
    }
    Ok(())
}

fn invalid(step: usize, reason: &str) -> ScenarioParseError {
    ScenarioParseError::InvalidStep {
        step,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    const REATTACH: &str = r#"
name = "reattach"
delay_start = true
log_severity = "debug"

[env]
FELIX_BPFENABLED = "true"

[[steps]]
action = "allow"
selector = "host-endpoint=='true'"

[[steps]]
action = "watch"
name = "hep_to"
pattern = 'Program attached to TC.*ToOrFrom:"to"'

[[steps]]
action = "trigger_start"

[[steps]]
action = "expect_matched"
name = "hep_to"

[[steps]]
action = "restart"
watch = [{ name = "skip_to", pattern = "skip reattaching to_hep" }]

[[steps]]
action = "expect_matched"
name = "skip_to"
timeout = "5s"

[[steps]]
action = "poll_exec"
command = ["bpftool", "-jp", "net"]
lacks = "eth0"
interval = "250ms"
"#;

    #[test]
    fn parses_full_scenario_with_defaults() {
        let scenario = parse_scenario(REATTACH).unwrap();
        assert_eq!(scenario.name.as_deref(), Some("reattach"));
        assert_eq!(scenario.nodes, 1);
        assert!(scenario.delay_start);
        assert_eq!(scenario.steps.len(), 7);

        assert_eq!(scenario.steps[2], Step::TriggerStart { node: None });
        match &scenario.steps[4] {
            Step::Restart { node, watch } => {
                assert_eq!(*node, 0);
                assert_eq!(watch.len(), 1);
            }
            other => panic!("unexpected step {other:?}"),
        }
        match &scenario.steps[3] {
            Step::ExpectMatched { timeout, .. } => assert_eq!(*timeout, Duration::from_secs(10)),
            other => panic!("unexpected step {other:?}"),
        }
        match &scenario.steps[6] {
            Step::PollExec {
                timeout, interval, ..
            } => {
                assert_eq!(*timeout, Duration::from_secs(15));
                assert_eq!(*interval, Duration::from_millis(250));
            }
            other => panic!("unexpected step {other:?}"),
        }
    }

    #[test]
    fn expect_on_unknown_name_is_rejected() {
        let err = parse_scenario(
            r#"
[[steps]]
action = "expect_pending"
name = "ghost"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ScenarioParseError::UnknownWatch { step: 0, .. }));
    }

    #[test]
    fn node_out_of_range_is_rejected() {
        let err = parse_scenario(
            r#"
nodes = 2

[[steps]]
action = "stop"
node = 2
"#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ScenarioParseError::NodeOutOfRange {
                node: 2,
                nodes: 2,
                ..
            }
        ));
    }

    #[test]
    fn bad_pattern_is_rejected() {
        let err = parse_scenario(
            r#"
[[steps]]
action = "watch"
name = "broken"
pattern = "(unclosed"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ScenarioParseError::InvalidPattern { .. }));
    }

    #[test]
    fn poll_exec_needs_exactly_one_expectation() {
        let both = r#"
[[steps]]
action = "poll_exec"
command = ["bpftool"]
contains = "a"
lacks = "b"
"#;
        let neither = r#"
[[steps]]
action = "poll_exec"
command = ["bpftool"]
"#;
        for content in [both, neither] {
            let err = parse_scenario(content).unwrap_err();
            assert!(err.to_string().contains("exactly one"), "{err}");
        }
    }

    #[test]
    fn unknown_action_is_a_parse_error() {
        let err = parse_scenario(
            r#"
[[steps]]
action = "reboot"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ScenarioParseError::TomlError(_)));
    }

    #[test]
    fn load_names_scenario_after_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("smoke.toml");
        std::fs::write(&path, "nodes = 1\n").unwrap();

        let scenario = load_scenario(&path).unwrap();
        assert_eq!(scenario.name.as_deref(), Some("smoke"));
    }
}
