use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

fn keiro_cmd() -> Command {
    let mut cmd = Command::cargo_bin("keiro").unwrap();
    // keep a developer's keiro.json out of the way
    cmd.env("KEIRO_CONFIG", "does-not-exist.json");
    cmd
}

#[test]
fn test_eval_divide_by_zero_is_null() {
    keiro_cmd()
        .args(["eval", r#"{"$divide": [1, 0]}"#])
        .assert()
        .success()
        .stdout(predicate::str::diff("null\n"));
}

#[test]
fn test_eval_against_root() {
    keiro_cmd()
        .args([
            "eval",
            r#"{"$concat": ["hello ", "$name"]}"#,
            "--root",
            r#"{"name": "keiro"}"#,
        ])
        .assert()
        .success()
        .stdout(predicate::str::diff("\"hello keiro\"\n"));
}

#[test]
fn test_eval_rejects_unknown_operator() {
    keiro_cmd()
        .args(["eval", r#"{"$frobnicate": 1}"#])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Error:"));
}

#[test]
fn test_run_pipeline_over_input_file() {
    let mut input = tempfile::NamedTempFile::new().unwrap();
    write!(input, r#"[{{"n": 1}}, {{"n": 2}}, {{"n": 3}}]"#).unwrap();
    keiro_cmd()
        .args([
            "run",
            r#"[{"$skip": 1}, {"$limit": 1}]"#,
            "--input",
            &format!("@{}", input.path().display()),
        ])
        .assert()
        .success()
        .stdout(predicate::str::diff("[{\"n\":2}]\n"));
}

#[test]
fn test_cron_preview() {
    keiro_cmd()
        .args([
            "cron",
            "0 6 * * *",
            "-n",
            "2",
            "--after",
            "2024-01-01T00:00:00Z",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("2024-01-01T06:00:00+00:00"))
        .stdout(predicate::str::contains("2024-01-02T06:00:00+00:00"));
}

#[test]
fn test_cron_rejects_bad_expression() {
    keiro_cmd()
        .args(["cron", "61 * * * *"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Error:"));
}

#[test]
fn test_config_reads_file() {
    let mut config = tempfile::NamedTempFile::new().unwrap();
    write!(config, r#"{{"environment": "staging"}}"#).unwrap();
    keiro_cmd()
        .env("KEIRO_CONFIG", config.path())
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"environment\":\"staging\""));
}
