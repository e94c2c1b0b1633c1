use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::path::PathBuf;
use std::process::Command;

fn write_route(dir: &tempfile::TempDir, name: &str, source: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, source).unwrap();
    path
}

#[test]
fn missing_file() {
    let mut cmd = Command::cargo_bin("routec").unwrap();
    cmd.args(["check", "does_not_exist.csv"]);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("failed to read does_not_exist.csv"));
}

#[test]
fn check_clean_route() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = write_route(&dir, "route.csv", "");
    let mut cmd = Command::cargo_bin("routec").unwrap();
    cmd.arg("check").arg(&path);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("0 error(s)"));
}

#[test]
fn check_fails_on_missing_include() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = write_route(&dir, "route.csv", "$Include(missing.csv)\n");
    let mut cmd = Command::cargo_bin("routec").unwrap();
    cmd.arg("check").arg(&path);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("missing.csv could not be found"));
}

#[test]
fn preprocess_follows_includes() {
    let dir = tempfile::TempDir::new().unwrap();
    write_route(&dir, "part.csv", "Track.Pitch 5\n");
    let path = write_route(&dir, "route.csv", "$Include(part.csv)\n");
    let mut cmd = Command::cargo_bin("routec").unwrap();
    cmd.arg("preprocess").arg(&path);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Track.Pitch 5"));
}

#[test]
fn tokens_are_lowercase() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = write_route(&dir, "route.csv", "Track.Pitch 5\n");
    let mut cmd = Command::cargo_bin("routec").unwrap();
    cmd.arg("tokens").arg(&path);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("track.pitch 5"));
}

#[test]
fn compile_prints_stations() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = write_route(&dir, "route.csv", "0,Track.Sta Alpha\n100,Track.Sta Beta\n");
    let mut cmd = Command::cargo_bin("routec").unwrap();
    cmd.args(["compile", "--preview", "--seed", "1"]).arg(&path);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("stations:    2"))
        .stdout(predicate::str::contains("Alpha"))
        .stdout(predicate::str::contains("Beta"));
}
