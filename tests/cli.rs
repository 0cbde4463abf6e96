//! Command-line round trips against a local state directory.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use serde_json::Value;
use tempfile::tempdir;

const DOCUMENT: &str = r#"
resources:
  - type: null_network
    name: main
    attributes:
      cidr: 10.0.0.0/16
  - type: null_server
    name: web
    count: 2
    attributes:
      network: "${null_network.main.id}"
"#;

fn converge(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_converge"))
        .current_dir(dir)
        .env_remove("CONVERGE_CONFIG")
        .env_remove("RUST_LOG")
        .args(args)
        .output()
        .expect("run converge")
}

fn json(output: &Output) -> Value {
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("json on stdout")
}

#[test]
fn test_validate_reports_invalid_document() {
    let dir = tempdir().unwrap();
    fs::write(
        dir.path().join("converge.yaml"),
        "resources:\n  - {type: null_vm, name: box, count: 1, for_each: [a]}\n",
    )
    .unwrap();

    let output = converge(dir.path(), &["validate"]);
    assert!(!output.status.success());
}

#[test]
fn test_plan_apply_and_inspect_state() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("converge.yaml"), DOCUMENT).unwrap();

    let plan = json(&converge(dir.path(), &["--output", "json", "plan"]));
    let actions: Vec<&str> = plan["changes"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["action"].as_str().unwrap())
        .collect();
    assert_eq!(actions, vec!["create"; 3]);

    let report = json(&converge(dir.path(), &["--output", "json", "apply", "--yes"]));
    assert_eq!(report["cancelled"], Value::Bool(false));
    assert_eq!(report["steps"].as_array().unwrap().len(), 3);
    assert!(dir.path().join(".converge").join("state.json").exists());

    let state = json(&converge(dir.path(), &["--output", "json", "state", "list"]));
    assert_eq!(state["addresses"].as_array().unwrap().len(), 3);

    let again = json(&converge(dir.path(), &["--output", "json", "plan"]));
    assert!(again["steps"].as_array().unwrap().is_empty());
}

#[test]
fn test_saved_plan_and_state_edits() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("converge.yaml"), DOCUMENT).unwrap();

    let output = converge(dir.path(), &["plan", "--out", "plan.json"]);
    assert!(output.status.success());
    assert!(dir.path().join("plan.json").exists());

    let output = converge(dir.path(), &["apply", "plan.json"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let output = converge(dir.path(), &["state", "taint", "null_server.web[1]"]);
    assert!(output.status.success());

    let plan = json(&converge(dir.path(), &["--output", "json", "plan"]));
    let replaced: Vec<&str> = plan["changes"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|c| c["action"] == "replace")
        .map(|c| c["address"].as_str().unwrap())
        .collect();
    assert_eq!(replaced, vec!["null_server.web[1]"]);

    let output = converge(dir.path(), &["state", "mv", "null_server.web[1]", "null_server.spare"]);
    assert!(output.status.success());

    let entry = json(&converge(
        dir.path(),
        &["--output", "json", "state", "show", "null_server.spare"],
    ));
    assert_eq!(entry["tainted"], Value::Bool(true));
}
