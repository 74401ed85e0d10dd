//! End-to-end tests for the `aptool` binary.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn aptool() -> Command {
    Command::cargo_bin("aptool").unwrap()
}

// ============================================
// Basics
// ============================================

#[test]
fn shows_help() {
    aptool()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("aptool"))
        .stdout(predicate::str::contains("calclet"));
}

#[test]
fn shows_version() {
    aptool()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn unknown_command_suggests_and_fails() {
    aptool()
        .arg("lss")
        .assert()
        .failure()
        .stderr(predicate::str::contains("did you mean ls?"));
}

// ============================================
// Paper lifecycle via the CLI
// ============================================

#[test]
fn create_set_and_list() {
    let tmp = TempDir::new().unwrap();
    let paper = tmp.path().join("cli.ap");
    let paper_arg = paper.to_str().unwrap();

    aptool().args(["-p", paper_arg, "create"]).assert().success();
    aptool()
        .args(["-p", paper_arg, "set", "frequency", "0.2"])
        .assert()
        .success();
    aptool()
        .args(["-p", paper_arg, "ls"])
        .assert()
        .success()
        .stdout(predicate::str::contains("data/frequency"));
    aptool()
        .args(["-p", paper_arg, "ls", "--long", "--type", "data"])
        .assert()
        .success()
        .stdout(predicate::str::contains("data/frequency"));
}

#[test]
fn store_and_run_a_calclet() {
    let tmp = TempDir::new().unwrap();
    let paper = tmp.path().join("run.ap");
    let paper_arg = paper.to_str().unwrap();
    let script = tmp.path().join("calc_twice.rhai");
    std::fs::write(
        &script,
        r#"data.create_dataset("twice", data["x"].value * 2.0);"#,
    )
    .unwrap();

    aptool().args(["-p", paper_arg, "create"]).assert().success();
    aptool()
        .args(["-p", paper_arg, "set", "x", "21.0"])
        .assert()
        .success();
    aptool()
        .args([
            "-p",
            paper_arg,
            "calclet",
            "code/calc_twice",
            script.to_str().unwrap(),
            "--run",
        ])
        .assert()
        .success();
    aptool()
        .args(["-p", paper_arg, "ls", "--type", "data"])
        .assert()
        .success()
        .stdout(predicate::str::contains("data/twice"));
}

#[test]
fn failing_codelet_exits_nonzero_with_traceback() {
    let tmp = TempDir::new().unwrap();
    let paper = tmp.path().join("fail.ap");
    let paper_arg = paper.to_str().unwrap();
    let script = tmp.path().join("boom.rhai");
    std::fs::write(&script, r#"throw "boom";"#).unwrap();

    aptool().args(["-p", paper_arg, "create"]).assert().success();
    aptool()
        .args([
            "-p",
            paper_arg,
            "calclet",
            "code/boom",
            script.to_str().unwrap(),
        ])
        .assert()
        .success();
    aptool()
        .args(["-p", paper_arg, "run", "boom"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Codelet traceback"));
}

#[test]
fn update_reruns_codelets_for_dummies() {
    let tmp = TempDir::new().unwrap();
    let paper = tmp.path().join("update.ap");
    let paper_arg = paper.to_str().unwrap();
    let script = tmp.path().join("calc.rhai");
    std::fs::write(
        &script,
        r#"data.create_dataset("derived", data["x"].value + 1.0);"#,
    )
    .unwrap();

    aptool().args(["-p", paper_arg, "create"]).assert().success();
    aptool()
        .args(["-p", paper_arg, "set", "x", "1.0"])
        .assert()
        .success();
    aptool()
        .args([
            "-p",
            paper_arg,
            "calclet",
            "code/calc",
            script.to_str().unwrap(),
            "--run",
        ])
        .assert()
        .success();
    aptool()
        .args(["-p", paper_arg, "dummy", "--force", "data/derived"])
        .assert()
        .success();
    aptool()
        .args(["-p", paper_arg, "ls", "--type", "dummy"])
        .assert()
        .success()
        .stdout(predicate::str::contains("data/derived"));
    aptool()
        .args(["-p", paper_arg, "update", "--verbose"])
        .assert()
        .success()
        .stdout(predicate::str::contains("running /code/calc"));
    aptool()
        .args(["-p", paper_arg, "ls", "--type", "dummy"])
        .assert()
        .success()
        .stdout(predicate::str::contains("data/derived").not());
}

#[test]
fn extract_writes_item_contents() {
    let tmp = TempDir::new().unwrap();
    let paper = tmp.path().join("extract.ap");
    let paper_arg = paper.to_str().unwrap();
    let script = tmp.path().join("noop.rhai");
    std::fs::write(&script, "let unused = 0;\n").unwrap();

    aptool().args(["-p", paper_arg, "create"]).assert().success();
    aptool()
        .args([
            "-p",
            paper_arg,
            "calclet",
            "code/noop",
            script.to_str().unwrap(),
        ])
        .assert()
        .success();
    let out = tmp.path().join("noop_out.rhai");
    aptool()
        .args([
            "-p",
            paper_arg,
            "extract",
            "code/noop",
            out.to_str().unwrap(),
        ])
        .assert()
        .success();
    assert_eq!(std::fs::read_to_string(&out).unwrap(), "let unused = 0;\n");
}
