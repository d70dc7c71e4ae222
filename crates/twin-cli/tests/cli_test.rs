//! Tests for the offline subcommands.

use assert_cmd::Command;
use predicates::prelude::*;

const ROFFSET: &str = r#"{"i":3,"n":"roffset","t":"i","b":0,"c":"3000"}"#;

fn devicetwin() -> Command {
    let mut cmd = Command::cargo_bin("devicetwin").unwrap();
    cmd.env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_encode_prints_hex() {
    devicetwin()
        .args(["encode", "--schema", ROFFSET, "--value", "2500"])
        .assert()
        .success()
        .stdout("000009c4\n");
}

#[test]
fn test_encode_rejects_out_of_range() {
    devicetwin()
        .args(["encode", "--schema", ROFFSET, "--value", "3500"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("above maximum allowed 3000"));
}

#[test]
fn test_decode_fixed_string() {
    devicetwin()
        .args([
            "decode",
            "--schema",
            r#"{"i":1,"n":"dlresmin","t":"4"}"#,
            "--hex",
            "362c3800",
        ])
        .assert()
        .success()
        .stdout("6,8\n");
}

#[test]
fn test_window_prints_wait() {
    devicetwin()
        .args(["window", "--reserved", "1,2,3"])
        .assert()
        .success()
        .stdout(predicate::str::is_match(r"^\d+s\n$").unwrap());
}

#[test]
fn test_bad_schema_is_reported() {
    devicetwin()
        .args(["encode", "--schema", "{}", "--value", "1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid field schema"));
}
