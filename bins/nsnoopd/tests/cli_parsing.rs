//! CLI argument parsing tests for nsnoopd.
//!
//! These verify argument handling only; nothing here needs root or a
//! network device, so every invocation must fail before setup or be a
//! pure parser check.

use assert_cmd::Command;
use predicates::prelude::*;

fn nsnoopd() -> Command {
    Command::new(env!("CARGO_BIN_EXE_nsnoopd"))
}

#[test]
fn test_help() {
    nsnoopd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("IFNAME_MON"))
        .stdout(predicate::str::contains("deny-filter"));
}

#[test]
fn test_version() {
    nsnoopd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("nsnoopd"));
}

#[test]
fn test_monitor_interface_is_required() {
    nsnoopd()
        .assert()
        .failure()
        .stderr(predicate::str::contains("IFNAME_MON"));
}

#[test]
fn test_families_are_mutually_exclusive() {
    nsnoopd()
        .args(["-4", "-6", "eth0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot be used with"));
}

#[test]
fn test_unknown_interface_rejected() {
    nsnoopd()
        .arg("surely-not-a-device0")
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid network device"));
}

#[test]
fn test_zero_count_rejected() {
    nsnoopd()
        .args(["-c", "0", "lo"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid count"));
}

#[test]
fn test_bad_deny_filter_rejected() {
    nsnoopd()
        .args(["-f", "(", "lo"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid deny filter"));
}
