// Copyright (c) The testplat Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Runs the testplat binary end to end, using its own fixture-driven test host.

use camino::Utf8Path;
use camino_tempfile::Utf8TempDir;
use indoc::indoc;
use pretty_assertions::assert_eq;
use std::process::{Command, Output};
use testplat_metadata::TestplatExitCode;

const TESTPLAT: &str = env!("CARGO_BIN_EXE_testplat");

const FLAKY_FIXTURE: &str = indoc! {r#"
    [
        { "uid": "stable", "display_name": "stable", "outcomes": ["pass"] },
        { "uid": "flaky", "display_name": "flaky", "outcomes": ["fail", "fail", "pass"] },
        { "uid": "skipped", "display_name": "skipped", "outcomes": ["skip"] }
    ]
"#};

const BROKEN_FIXTURE: &str = indoc! {r#"
    [
        { "uid": "broken", "display_name": "broken", "outcomes": ["fail"] },
        { "uid": "fine", "display_name": "fine", "outcomes": ["pass"] }
    ]
"#};

fn run_testplat(dir: &Utf8Path, fixture: &str, retry_args: &[&str]) -> Output {
    let fixture_path = dir.join("fixture.json");
    std::fs::write(&fixture_path, fixture).unwrap();

    let mut cmd = Command::new(TESTPLAT);
    cmd.args(["--color", "never", "run"])
        .args(retry_args)
        .args(["--results-directory", dir.join("results").as_str()])
        .args(["--hang-timeout", "20s", "--", TESTPLAT, "__test-host"])
        .args(["--fixture", fixture_path.as_str()])
        .args(["--state-dir", dir.join("state").as_str()])
        .env_remove("TESTPLAT_LOG");
    cmd.output().expect("testplat ran")
}

fn read_results(dir: &Utf8Path) -> serde_json::Value {
    let contents = std::fs::read_to_string(dir.join("results/test-results.json")).unwrap();
    serde_json::from_str(&contents).unwrap()
}

fn attempt_dirs(dir: &Utf8Path) -> Vec<String> {
    let retries = dir.join("results/Retries");
    let mut ids = std::fs::read_dir(&retries).unwrap();
    let id = ids.next().expect("one retries directory").unwrap().path();
    assert!(ids.next().is_none(), "exactly one retries directory");
    let mut attempts: Vec<_> = std::fs::read_dir(id)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().into_string().unwrap())
        .collect();
    attempts.sort();
    attempts
}

#[test]
fn flaky_test_passes_on_retry() {
    let dir = Utf8TempDir::new().unwrap();
    let output = run_testplat(dir.path(), FLAKY_FIXTURE, &["--retry-failed-tests", "3"]);
    assert_eq!(
        output.status.code(),
        Some(TestplatExitCode::SUCCESS),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    // Three attempts: everything, then only the flaky test twice.
    assert_eq!(attempt_dirs(dir.path()), vec!["1", "2", "3"]);
    let results = read_results(dir.path());
    assert_eq!(results.as_array().map(Vec::len), Some(1));
    assert_eq!(results[0]["uid"], "flaky");
    assert_eq!(results[0]["state"], "passed");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("Retrying 1 failed tests, attempt: 2/4"),
        "stderr: {stderr}"
    );
}

#[test]
fn retries_exhausted() {
    let dir = Utf8TempDir::new().unwrap();
    let output = run_testplat(dir.path(), BROKEN_FIXTURE, &["--retry-failed-tests", "1"]);
    assert_eq!(
        output.status.code(),
        Some(TestplatExitCode::AT_LEAST_ONE_TEST_FAILED)
    );
    assert_eq!(attempt_dirs(dir.path()), vec!["1", "2"]);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("state/broken.runs")).unwrap(),
        "2"
    );
    assert_eq!(
        std::fs::read_to_string(dir.path().join("state/fine.runs")).unwrap(),
        "1"
    );
}

#[test]
fn threshold_stops_retries() {
    let dir = Utf8TempDir::new().unwrap();
    let output = run_testplat(
        dir.path(),
        BROKEN_FIXTURE,
        &[
            "--retry-failed-tests",
            "3",
            "--retry-failed-tests-max-percentage",
            "10",
        ],
    );
    assert_eq!(
        output.status.code(),
        Some(TestplatExitCode::AT_LEAST_ONE_TEST_FAILED)
    );
    assert_eq!(attempt_dirs(dir.path()), vec!["1"]);
    // The first attempt's results are kept.
    assert_eq!(read_results(dir.path()).as_array().map(Vec::len), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("Failure threshold policy is enabled"),
        "stderr: {stderr}"
    );
}

#[test]
fn invalid_retry_options() {
    let dir = Utf8TempDir::new().unwrap();
    let output = run_testplat(
        dir.path(),
        BROKEN_FIXTURE,
        &["--retry-failed-tests-max-tests", "2"],
    );
    assert_eq!(
        output.status.code(),
        Some(TestplatExitCode::INVALID_COMMAND_LINE)
    );
    assert!(!dir.path().join("results").exists());
}
