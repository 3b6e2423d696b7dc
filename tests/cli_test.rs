#![cfg(unix)]

use serde_json::Value;
use std::fs;
use std::path::Path;
use std::process::{Child, Command, Output, Stdio};

const FIT_SCRIPT: &str = r#"cat >/dev/null; sleep 0.02; printf '{"id":"%s","pid":%s}' "$0" "$PPID""#;

fn fitrun(state: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_fitrun"));
    cmd.arg("--state-dir").arg(state).env("FITRUN_LOG", "warn");
    cmd
}

fn spawn_worker(state: &Path, subcommand: &[&str]) -> Child {
    fitrun(state)
        .args(subcommand)
        .args(["--", "sh", "-c", FIT_SCRIPT])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap()
}

fn status(state: &Path, run: &str) -> Value {
    let output = fitrun(state).args(["status", "--run", run, "--json"]).output().unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    serde_json::from_slice(&output.stdout).unwrap()
}

fn assert_ok(output: &Output) {
    assert!(
        output.status.success(),
        "stdout: {}\nstderr: {}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Several OS processes fit one run; every object is fitted by exactly one process.
#[test]
fn test_independent_processes_split_the_run() {
    let temp_dir = tempfile::tempdir().unwrap();
    let state = temp_dir.path().join("state");
    let ids_path = temp_dir.path().join("ids.txt");
    let ids: Vec<String> = (0..24).map(|i| format!("gal-{:02}", i)).collect();
    fs::write(&ids_path, ids.join("\n")).unwrap();
    let config_path = temp_dir.path().join("config.json");
    fs::write(&config_path, r#"{"nwalkers": 8}"#).unwrap();

    let ids_arg = ids_path.to_str().unwrap();
    let config_arg = config_path.to_str().unwrap();
    let start = ["start", "--run", "survey", "--ids", ids_arg, "--config", config_arg, "--batch-size", "4"];
    let first = spawn_worker(&state, &start);
    let others: Vec<Child> = (0..3)
        .map(|_| spawn_worker(&state, &start))
        .collect();

    for child in std::iter::once(first).chain(others) {
        assert_ok(&child.wait_with_output().unwrap());
    }

    let report = status(&state, "survey");
    assert_eq!(report["total"], 24);
    assert_eq!(report["completed"], 24);
    assert_eq!(report["claimed"], 0);

    let merge = fitrun(&state).args(["merge", "--run", "survey"]).output().unwrap();
    assert_ok(&merge);
    assert!(String::from_utf8_lossy(&merge.stdout).contains("unchanged"));

    let summary = fs::read_to_string(state.join("runs/survey/summary.jsonl")).unwrap();
    let rows: Vec<Value> = summary.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
    let row_ids: Vec<&str> = rows.iter().map(|r| r["id"].as_str().unwrap()).collect();
    assert_eq!(row_ids, ids.iter().map(String::as_str).collect::<Vec<_>>());
}

#[test]
fn test_work_on_unknown_run_fails_without_storage_exit_code() {
    let temp_dir = tempfile::tempdir().unwrap();
    let output = fitrun(temp_dir.path())
        .args(["work", "--run", "missing", "--", "true"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("does not exist"));
}

#[test]
fn test_failed_fits_and_clean_via_cli() {
    let temp_dir = tempfile::tempdir().unwrap();
    let state = temp_dir.path().join("state");
    let ids_path = temp_dir.path().join("ids.txt");
    fs::write(&ids_path, "ok-1\nbad-1\nok-2\n").unwrap();

    let output = fitrun(&state)
        .args(["start", "--run", "mixed", "--ids", ids_path.to_str().unwrap(), "--workers", "2"])
        .args(["--", "sh", "-c", r#"case "$0" in bad-*) echo diverged >&2; exit 1;; esac; echo 1"#])
        .output()
        .unwrap();
    assert_ok(&output);

    let report = status(&state, "mixed");
    assert_eq!(report["completed"], 2);
    assert_eq!(report["failed"], 1);

    let clean = fitrun(&state).args(["clean", "--run", "mixed"]).output().unwrap();
    assert_ok(&clean);
    let after = status(&state, "mixed");
    assert_eq!(after["completed"], 2);
    assert_eq!(after["failed"], 1);
    assert_eq!(after["claimed"], 0);

    let reap = fitrun(&state).args(["reap", "--run", "mixed", "--dry-run"]).output().unwrap();
    assert_ok(&reap);
    assert!(String::from_utf8_lossy(&reap.stdout).contains("0 stale claims"));

    let purge = fitrun(&state).args(["clean", "--run", "mixed", "--purge"]).output().unwrap();
    assert_ok(&purge);
    assert!(!state.join("runs/mixed").exists());
}
