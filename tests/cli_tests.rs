use std::process::Command;

use assert_fs::prelude::*;
use predicates::prelude::*;

fn facegen() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_facegen"));
    cmd.env_remove("FACEGEN_CONFIG")
        .env_remove("FACEGEN_WEIGHTS_DIR")
        .env_remove("FACEGEN_DEVICE");
    cmd
}

#[test]
fn test_cli_help() {
    let output = facegen().arg("--help").output().expect("Failed to execute command");
    assert!(output.status.success());

    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("StyleGAN2 face generator"));
    for command in ["serve", "generate", "style-mix", "weights", "config"] {
        assert!(stdout.contains(command), "missing {command}");
    }
}

#[test]
fn test_cli_version() {
    let output = facegen().arg("--version").output().expect("Failed to execute command");
    assert!(output.status.success());
    assert!(String::from_utf8(output.stdout).unwrap().contains("0.1.0"));
}

#[test]
fn test_config_show_reads_file() {
    let temp = assert_fs::TempDir::new().unwrap();
    let config = temp.child("config.json");
    config.write_str(r#"{"port": 9001, "max_grid_tiles": 16}"#).unwrap();

    let output = facegen()
        .args(["config", "show", "--config"])
        .arg(config.path())
        .output()
        .unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(predicate::str::contains("\"port\": 9001").eval(&stdout));
    assert!(predicate::str::contains("\"max_grid_tiles\": 16").eval(&stdout));
    assert!(predicate::str::contains("\"default_truncation\": 0.5").eval(&stdout));
}

#[test]
fn test_config_rejects_invalid_truncation() {
    let temp = assert_fs::TempDir::new().unwrap();
    let config = temp.child("config.json");
    config.write_str(r#"{"default_truncation": 3.0}"#).unwrap();

    let output = facegen()
        .args(["config", "show", "--config"])
        .arg(config.path())
        .output()
        .unwrap();
    assert!(!output.status.success());
}

#[test]
fn test_config_init() {
    let temp = assert_fs::TempDir::new().unwrap();
    let config = temp.child("nested/config.json");

    let output = facegen()
        .args(["config", "init", "--config"])
        .arg(config.path())
        .output()
        .unwrap();
    assert!(output.status.success());
    config.assert(predicate::path::exists());
    config.assert(predicate::str::contains("\"port\": 8000"));

    let again = facegen()
        .args(["config", "init", "--config"])
        .arg(config.path())
        .output()
        .unwrap();
    assert!(!again.status.success());
}

#[test]
fn test_weights_list_empty() {
    let temp = assert_fs::TempDir::new().unwrap();
    let output = facegen()
        .args(["weights", "list", "--weights-dir"])
        .arg(temp.path())
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8(output.stdout).unwrap().contains("No weights fetched."));
}

#[test]
fn test_generate_without_weights_fails() {
    let temp = assert_fs::TempDir::new().unwrap();
    let output = facegen()
        .current_dir(temp.path())
        .args(["generate", "--seed", "1", "--device", "cpu", "-o", "face.png", "--weights-dir"])
        .arg(temp.path())
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8(output.stderr).unwrap().contains("Weight file not found"));
    temp.child("face.png").assert(predicate::path::missing());
}
