use std::path::Path;
use std::process::{Command, Output};

use gateflow::exit_codes;
use gateflow::io::config::{ProjectPaths, write_config};
use gateflow::test_support::{HELLO_PATCH, TestRepo};

fn gateflow(root: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_gateflow"))
        .arg("--root")
        .arg(root)
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("run gateflow")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn run_id_from(output: &Output) -> String {
    stdout(output)
        .lines()
        .find_map(|line| line.strip_prefix("run_id: "))
        .expect("run id line")
        .trim()
        .to_string()
}

#[test]
fn init_writes_default_config_once() {
    let temp = tempfile::tempdir().expect("tempdir");
    let out = gateflow(temp.path(), &["init"]);
    assert_eq!(out.status.code(), Some(exit_codes::OK));
    let config_path = ProjectPaths::new(temp.path()).config_path;
    let written = std::fs::read_to_string(&config_path).expect("config");
    assert!(written.contains("[runs]"));

    let out = gateflow(temp.path(), &["init"]);
    assert!(stdout(&out).contains("already exists"));
}

#[test]
fn cli_drives_a_run_through_every_gate() {
    let repo = TestRepo::new();
    write_config(&ProjectPaths::new(repo.root()).config_path, &repo.config()).expect("config");
    let root = repo.root();

    let out = gateflow(root, &["run", "--story", "Greet the world"]);
    assert_eq!(out.status.code(), Some(exit_codes::OK), "{}", stdout(&out));
    assert!(stdout(&out).contains("status: WAITING_APPROVAL_PLAN"));
    let run_id = run_id_from(&out);

    let out = gateflow(root, &["approve", &run_id, "plan", "--advance"]);
    assert!(stdout(&out).contains("status: WAITING_APPROVAL_PATCH"));

    let patch_path = root.join("change.diff");
    std::fs::write(&patch_path, HELLO_PATCH).expect("write patch");
    let out = gateflow(root, &["patch", &run_id, patch_path.to_str().expect("utf8 path")]);
    assert_eq!(out.status.code(), Some(exit_codes::OK));

    let out = gateflow(root, &["approve", &run_id, "patch", "--advance"]);
    assert!(stdout(&out).contains("status: WAITING_APPROVAL_FINAL"), "{}", stdout(&out));

    let out = gateflow(root, &["approve", &run_id, "final", "--approver", "lead", "--advance"]);
    assert!(stdout(&out).contains("status: FINALIZED"));

    let out = gateflow(root, &["list"]);
    assert!(stdout(&out).contains(&format!("{run_id}\tFINALIZED")));

    let out = gateflow(root, &["validate", "--run", &run_id]);
    assert_eq!(out.status.code(), Some(exit_codes::OK));

    let out = gateflow(root, &["metrics", &run_id]);
    let metrics: serde_json::Value = serde_json::from_slice(&out.stdout).expect("metrics json");
    assert_eq!(metrics["status"], "FINALIZED");
    assert_eq!(metrics["has_node_telemetry"], true);
}

#[test]
fn errors_map_to_exit_codes() {
    let repo = TestRepo::new();
    write_config(&ProjectPaths::new(repo.root()).config_path, &repo.config()).expect("config");
    let root = repo.root();

    let out = gateflow(root, &["status", "20260101_000000_ffff"]);
    assert_eq!(out.status.code(), Some(exit_codes::NOT_FOUND));

    let out = gateflow(root, &["run", "--story", "x"]);
    let run_id = run_id_from(&out);
    let out = gateflow(root, &["approve", &run_id, "final"]);
    assert_eq!(out.status.code(), Some(exit_codes::STATE));
    assert!(String::from_utf8_lossy(&out.stderr).contains("cannot approve gate 'final'"));

    let out = gateflow(root, &["reject", &run_id, "plan", "--note", "no"]);
    assert!(stdout(&out).contains("status: FAILED"));
    let out = gateflow(root, &["next", &run_id]);
    assert_eq!(out.status.code(), Some(exit_codes::RUN_FAILED));
}
