use predicates::prelude::*;

#[test]
fn run_with_missing_settings_fails_with_cause() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("jobhunter");
    cmd.args(["run", "--settings", "/nonexistent/settings.yaml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("load settings"));
}

#[test]
fn help_lists_the_run_command() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("jobhunter");
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"));
}
