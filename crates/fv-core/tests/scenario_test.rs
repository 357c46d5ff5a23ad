//! Scenario files run end to end against the scripted dataplane.

use std::sync::Arc;

use fv_core::launcher::HostLauncher;
use fv_core::scenario::{StepOutcome, parse_scenario, run_scenario};
use fv_core::{Infrastructure, LocalInfra};
use fv_test_utils::FakeDataplane;

fn infra(fake: &FakeDataplane) -> Arc<LocalInfra> {
    Arc::new(LocalInfra::new(Arc::new(HostLauncher::new(fake.agent()))))
}

fn reattach_scenario(fake: &FakeDataplane) -> String {
    format!(
        r#"
name = "reattach"
delay_start = true
log_severity = "debug"
name_prefix = "scn"
stop_grace = "5s"

[env]
FELIX_BPFENABLED = "true"

[[steps]]
action = "allow"
selector = "host-endpoint=='true'"

[[steps]]
action = "watch"
name = "first_run_base"
pattern = "Program already attached, skip reattaching"

[[steps]]
action = "watch"
name = "attached_to"
pattern = 'Program attached to TC.*Type:"host", ToOrFrom:"to"'

[[steps]]
action = "watch"
name = "startup"
pattern = "startup complete"

[[steps]]
action = "trigger_start"

[[steps]]
action = "expect_matched"
name = "attached_to"

[[steps]]
action = "expect_matched"
name = "startup"

[[steps]]
action = "expect_pending"
name = "first_run_base"

[[steps]]
action = "set_env"
env = {{ FELIX_BPFDataIfacePattern = "eth1" }}

[[steps]]
action = "restart"
watch = [
  {{ name = "second_run_base", pattern = "Continue with attaching BPF program (to|from)_hep" }},
  {{ name = "skip_to", pattern = "skip reattaching to_hep_fib_debug.o iface=eth1" }},
  {{ name = "restarted", pattern = "startup complete" }},
]

[[steps]]
action = "expect_matched"
name = "skip_to"

[[steps]]
action = "expect_matched"
name = "restarted"

[[steps]]
action = "expect_pending"
name = "second_run_base"

[[steps]]
action = "poll_exec"
command = ["{bpftool}", "-jp", "net"]
lacks = "eth0"
interval = "200ms"

[[steps]]
action = "stop"
"#,
        bpftool = fake.bpftool().display()
    )
}

#[tokio::test]
async fn reattach_scenario_passes() {
    let fake = FakeDataplane::new();
    let scenario = parse_scenario(&reattach_scenario(&fake)).unwrap();
    let infra = infra(&fake);

    let report = run_scenario(&scenario, infra.clone()).await.unwrap();
    assert!(report.passed, "{report:#?}");
    assert_eq!(report.steps.len(), scenario.steps.len());
    assert!(report.steps.iter().all(|s| s.outcome == StepOutcome::Passed));
    assert_eq!(infra.rules(), vec!["host-endpoint=='true'"]);
    assert!(infra.is_stopped());
    assert_eq!(fake.attached("scn-0"), vec!["eth1.from", "eth1.to"]);
}

#[tokio::test]
async fn failing_step_skips_the_rest_and_tears_down() {
    let fake = FakeDataplane::new();
    let scenario = parse_scenario(
        r#"
name_prefix = "fail"

[[steps]]
action = "watch"
name = "never"
pattern = "kernel panic"

[[steps]]
action = "expect_matched"
name = "never"
timeout = "300ms"

[[steps]]
action = "allow"
selector = "all()"
"#,
    )
    .unwrap();
    let infra = infra(&fake);

    let report = run_scenario(&scenario, infra.clone()).await.unwrap();
    assert!(!report.passed);

    let outcomes: Vec<_> = report.steps.iter().map(|s| s.outcome).collect();
    assert_eq!(
        outcomes,
        vec![StepOutcome::Passed, StepOutcome::Failed, StepOutcome::Skipped]
    );
    let failure = report.failure().unwrap();
    assert_eq!(failure.index, 1);
    assert!(failure.detail.as_deref().unwrap().contains("not seen within"));

    // skipped steps never reach the infrastructure
    assert!(infra.rules().is_empty());
    assert!(infra.is_stopped());

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["passed"], false);
    assert_eq!(json["steps"][1]["outcome"], "failed");
    assert_eq!(json["steps"][2]["outcome"], "skipped");
    assert_eq!(json["steps"][2]["elapsed"], "0s");
}

#[tokio::test]
async fn trigger_start_on_running_node_fails_the_step() {
    let fake = FakeDataplane::new();
    let scenario = parse_scenario(
        r#"
name_prefix = "twice"

[[steps]]
action = "trigger_start"
"#,
    )
    .unwrap();

    let report = run_scenario(&scenario, infra(&fake)).await.unwrap();
    assert!(!report.passed);
    assert!(
        report.steps[0]
            .detail
            .as_deref()
            .unwrap()
            .contains("cannot trigger_start")
    );
}

#[tokio::test]
async fn unstartable_agent_is_a_setup_error() {
    let infra: Arc<dyn Infrastructure> =
        Arc::new(LocalInfra::new(Arc::new(HostLauncher::new("/nonexistent/fv/agent"))));
    let scenario = parse_scenario("name = \"broken\"\n").unwrap();

    let err = run_scenario(&scenario, infra).await.unwrap_err();
    assert!(err.to_string().contains("broken"));
}
