//! `fv run`: execute a scenario file and print its report.

use std::fmt::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use fv_core::LocalInfra;
use fv_core::scenario::{ScenarioReport, StepOutcome, load_scenario, run_scenario};

use crate::config::FvConfig;

/// Execute `fv run`.
pub async fn run_scenario_file(config: &FvConfig, path: &Path, json: bool) -> Result<()> {
    let mut scenario = load_scenario(path)
        .with_context(|| format!("failed to load scenario {}", path.display()))?;
    scenario
        .log_severity
        .get_or_insert_with(|| config.log_severity.clone());
    scenario.stop_grace.get_or_insert(config.stop_grace);

    let infra = Arc::new(LocalInfra::new(config.launcher()?));
    let report = run_scenario(&scenario, infra).await?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("failed to serialize report")?
        );
    } else {
        print!("{}", format_report(&report));
    }

    if !report.passed {
        bail!("scenario {:?} failed", report.name);
    }
    Ok(())
}

/// Human-readable report: one row per step, then a summary line.
pub fn format_report(report: &ScenarioReport) -> String {
    let mut out = String::new();
    for step in &report.steps {
        let tag = match step.outcome {
            StepOutcome::Passed => "PASS",
            StepOutcome::Failed => "FAIL",
            StepOutcome::Skipped => "SKIP",
        };
        let _ = write!(
            out,
            "[{tag}] {:>2} {:<14} {:>8}",
            step.index,
            step.action,
            humantime::format_duration(round_ms(step.elapsed)).to_string()
        );
        if let Some(detail) = &step.detail {
            let _ = write!(out, "  {detail}");
        }
        out.push('\n');
    }

    let passed = report
        .steps
        .iter()
        .filter(|s| s.outcome == StepOutcome::Passed)
        .count();
    let _ = writeln!(
        out,
        "{}: {} ({passed}/{} steps passed in {})",
        report.name,
        if report.passed { "passed" } else { "FAILED" },
        report.steps.len(),
        humantime::format_duration(round_ms(report.elapsed))
    );
    out
}

fn round_ms(d: Duration) -> Duration {
    Duration::from_millis(d.as_millis().try_into().unwrap_or(u64::MAX))
}
