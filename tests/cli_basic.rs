//! Integration tests for basic CLI behavior.
//!
//! Tests that the binary exists, accepts standard flags, and each subcommand
//! responds to `--help` with appropriate text.

#![allow(deprecated)] // cargo_bin deprecation — replacement not yet stable

use assert_cmd::Command;
use predicates::prelude::*;

/// Helper: get a Command for the `vega-relay` binary.
fn relay() -> Command {
    Command::cargo_bin("vega-relay").expect("binary 'vega-relay' should be built")
}

// ─── Top-level flags ─────────────────────────────────────────────────────────

#[test]
fn help_flag_shows_usage() {
    relay()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage: vega-relay"))
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("resolve"))
        .stdout(predicate::str::contains("modules"))
        .stdout(predicate::str::contains("probe"));
}

#[test]
fn version_flag_shows_semver() {
    relay()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::is_match(r"^vega-relay \d+\.\d+\.\d+\n$").unwrap());
}

#[test]
fn no_args_shows_error_and_usage() {
    relay()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage: vega-relay"));
}

#[test]
fn invalid_subcommand_fails() {
    relay()
        .arg("this-is-not-a-real-command")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unrecognized subcommand"));
}

// ─── Subcommand help ─────────────────────────────────────────────────────────

#[test]
fn serve_help() {
    relay()
        .args(["serve", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Run the HTTP API"))
        .stdout(predicate::str::contains("--bind"));
}

#[test]
fn resolve_help() {
    relay()
        .args(["resolve", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Resolve playable streams"))
        .stdout(predicate::str::contains("<PROVIDER>"))
        .stdout(predicate::str::contains("<LINK>"))
        .stdout(predicate::str::contains("--type"));
}

#[test]
fn modules_help() {
    relay()
        .args(["modules", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("stream export"))
        .stdout(predicate::str::contains("<PROVIDER>"));
}

// ─── Subcommand argument validation ──────────────────────────────────────────

#[test]
fn resolve_missing_link_fails() {
    relay()
        .args(["resolve", "vega"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("<LINK>"));
}

// ─── Probe ───────────────────────────────────────────────────────────────────

#[test]
fn probe_reports_missing_transcoder() {
    let dir = tempfile::tempdir().unwrap();
    relay()
        .args(["probe", "--config"])
        .arg(dir.path().join("absent.toml"))
        .env("FFMPEG_PATH", dir.path().join("no-such-ffmpeg"))
        .assert()
        .failure()
        .stdout(predicate::str::contains("❌"));
}

#[cfg(unix)]
#[test]
fn probe_reports_version_line() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("ffmpeg");
    std::fs::write(&script, "#!/bin/sh\necho 'ffmpeg version 6.1-test Copyright'\necho 'built with gcc'\n").unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

    relay()
        .args(["probe", "--config"])
        .arg(dir.path().join("absent.toml"))
        .env("FFMPEG_PATH", &script)
        .assert()
        .success()
        .stdout(predicate::str::contains("ffmpeg version 6.1-test Copyright"))
        .stdout(predicate::str::contains("libx264 + aac"))
        .stdout(predicate::str::contains("built with gcc").not());
}
