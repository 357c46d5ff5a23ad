//! Integration tests for the `fv` binary.
//!
//! Each test points XDG_CONFIG_HOME at a temp dir so no real config file
//! is picked up.

use std::path::Path;
use std::process::{Command, Output};

use fv_test_utils::FakeDataplane;

fn fv(config_home: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_fv"))
        .args(args)
        .env("XDG_CONFIG_HOME", config_home)
        .env_remove("FV_AGENT_BINARY")
        .env_remove("FV_LAUNCHER")
        .env_remove("FV_DOCKER_IMAGE")
        .env_remove("FV_LOG_SEVERITY")
        .env("RUST_LOG", "warn")
        .output()
        .expect("failed to run fv")
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).into_owned()
}

#[test]
fn watch_succeeds_when_patterns_appear() {
    let home = tempfile::tempdir().unwrap();
    let out = fv(
        home.path(),
        &[
            "watch",
            "--pattern",
            "^ready$",
            "--absent",
            "panic",
            "--timeout",
            "5s",
            "--",
            "sh",
            "-c",
            "echo booting; echo ready; exec sleep 30",
        ],
    );
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    let text = stdout(&out);
    assert!(text.contains("matched  \"^ready$\" at line 2: ready"), "{text}");
    assert!(text.contains("absent   \"panic\""), "{text}");
}

#[test]
fn watch_fails_on_missing_pattern() {
    let home = tempfile::tempdir().unwrap();
    let out = fv(
        home.path(),
        &[
            "watch",
            "--pattern",
            "never printed",
            "--timeout",
            "300ms",
            "--",
            "sh",
            "-c",
            "echo hello; exec sleep 30",
        ],
    );
    assert!(!out.status.success());
    assert!(stdout(&out).contains("MISSING  \"never printed\""));
}

#[test]
fn watch_fails_when_absent_pattern_precedes_expected_line() {
    let home = tempfile::tempdir().unwrap();
    let out = fv(
        home.path(),
        &[
            "watch",
            "--pattern",
            "ready",
            "--absent",
            "panic",
            "--",
            "sh",
            "-c",
            "echo 'panic: early'; echo ready; exec sleep 30",
        ],
    );
    assert!(!out.status.success());
    assert!(stdout(&out).contains("UNWANTED \"panic\" at line 1"));
}

#[test]
fn init_writes_config_and_refuses_to_overwrite() {
    let home = tempfile::tempdir().unwrap();

    let out = fv(home.path(), &["init", "--agent", "/opt/agent"]);
    assert!(out.status.success());
    let written = std::fs::read_to_string(home.path().join("fv/config.toml")).unwrap();
    assert!(written.contains("binary = \"/opt/agent\""), "{written}");

    let again = fv(home.path(), &["init"]);
    assert!(!again.status.success());
    assert!(String::from_utf8_lossy(&again.stderr).contains("already exists"));

    assert!(fv(home.path(), &["init", "--force"]).status.success());
}

#[test]
fn run_prints_json_report() {
    let home = tempfile::tempdir().unwrap();
    let fake = FakeDataplane::new();
    let scenario = home.path().join("attach.toml");
    std::fs::write(
        &scenario,
        format!(
            r#"
delay_start = true
name_prefix = "cli"

[[steps]]
action = "watch"
name = "startup"
pattern = "startup complete"

[[steps]]
action = "trigger_start"

[[steps]]
action = "expect_matched"
name = "startup"

[[steps]]
action = "poll_exec"
command = ["{}", "-jp", "net"]
contains = "eth0"
interval = "200ms"
"#,
            fake.bpftool().display()
        ),
    )
    .unwrap();

    let agent = fake.agent().display().to_string();
    let out = fv(
        home.path(),
        &["--agent", &agent, "run", scenario.to_str().unwrap(), "--json"],
    );
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));

    let report: serde_json::Value = serde_json::from_str(&stdout(&out)).unwrap();
    assert_eq!(report["name"], "attach");
    assert_eq!(report["passed"], true);
    assert_eq!(report["steps"].as_array().unwrap().len(), 4);
}
