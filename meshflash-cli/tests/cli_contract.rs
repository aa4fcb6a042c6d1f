//! Integration tests for core CLI contract behavior.

use {
    predicates::prelude::*,
    sha2::{Digest, Sha256},
    std::{fs, path::Path},
    tempfile::{TempDir, tempdir},
};

const RELEASE: &str = "meshgrid-heltec_v3-0.0.8.bin";

fn cli_cmd() -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("meshflash");
    for var in [
        "MESHFLASH_PORT",
        "MESHFLASH_BAUD",
        "MESHFLASH_FIRMWARE_DIR",
        "RUST_LOG",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

/// Command running inside `dir`, so no stray meshflash.toml is picked up.
fn cli_in(dir: &Path) -> assert_cmd::Command {
    let mut cmd = cli_cmd();
    cmd.current_dir(dir);
    cmd
}

fn sha256_hex(data: &[u8]) -> String {
    Sha256::digest(data)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Release directory holding `RELEASE` and, optionally, its checksum.
fn release_dir(data: &[u8], checksum_of: Option<&[u8]>) -> TempDir {
    let dir = tempdir().expect("tempdir should be created");
    fs::write(dir.path().join(RELEASE), data).expect("write image");
    if let Some(bytes) = checksum_of {
        fs::write(
            dir.path().join(format!("{RELEASE}.sha256")),
            format!("{}  {RELEASE}\n", sha256_hex(bytes)),
        )
        .expect("write checksum");
    }
    dir
}

#[test]
fn help_exits_zero_and_writes_stdout_only() {
    cli_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("meshflash").and(predicate::str::contains("Usage")))
        .stderr(predicate::str::is_empty());
}

#[test]
fn version_exits_zero_and_writes_stdout_only() {
    cli_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("meshflash"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn colors_disabled_when_not_tty() {
    let output = cli_cmd()
        .arg("--help")
        .assert()
        .success()
        .get_output()
        .clone();
    let stdout = String::from_utf8(output.stdout).expect("stdout should be utf-8");
    assert!(!stdout.contains("\x1b["), "Colors should be disabled in non-TTY mode");
}

// ============================================================================
// Catalog listings
// ============================================================================

#[test]
fn devices_json_lists_catalog() {
    let dir = tempdir().expect("tempdir should be created");
    let output = cli_in(dir.path())
        .args(["devices", "--json"])
        .assert()
        .success()
        .stderr(predicate::str::is_empty())
        .get_output()
        .clone();

    let devices: serde_json::Value = serde_json::from_slice(&output.stdout).expect("valid JSON");
    let devices = devices.as_array().expect("JSON array");
    assert_eq!(devices.len(), 12);

    let v3 = devices
        .iter()
        .find(|d| d["id"] == "heltec_v3")
        .expect("heltec_v3 listed");
    assert_eq!(v3["supports_ble"], true);
    assert_eq!(v3["flash_size"], "8MB");
}

#[test]
fn versions_json_marks_latest() {
    let dir = tempdir().expect("tempdir should be created");
    let output = cli_in(dir.path())
        .args(["versions", "--json"])
        .assert()
        .success()
        .get_output()
        .clone();

    let parsed: serde_json::Value = serde_json::from_slice(&output.stdout).expect("valid JSON");
    assert_eq!(parsed["latest"], "0.0.8");
    assert_eq!(parsed["versions"].as_array().map(Vec::len), Some(4));
    assert_eq!(parsed["protocols"][1]["key"], "v1only");
}

#[test]
fn devices_text_goes_to_stdout() {
    let dir = tempdir().expect("tempdir should be created");
    cli_in(dir.path())
        .arg("devices")
        .assert()
        .success()
        .stdout(predicate::str::contains("rak11200").and(predicate::str::contains("Heltec HT62")));
}

#[test]
fn list_ports_json_returns_array() {
    let dir = tempdir().expect("tempdir should be created");
    let output = cli_in(dir.path())
        .args(["list-ports", "--json"])
        .assert()
        .success()
        .stderr(predicate::str::is_empty())
        .get_output()
        .clone();

    let parsed: serde_json::Value = serde_json::from_slice(&output.stdout).expect("valid JSON");
    assert!(parsed.is_array(), "list-ports --json should return an array");
}

// ============================================================================
// Verify
// ============================================================================

#[test]
fn verify_accepts_matching_checksum() {
    let dir = release_dir(b"release image", Some(b"release image"));
    cli_in(dir.path())
        .args(["verify", RELEASE])
        .assert()
        .success()
        .stdout(predicate::str::contains(sha256_hex(b"release image")))
        .stderr(predicate::str::contains("checksum OK"));
}

#[test]
fn verify_rejects_mismatch() {
    let dir = release_dir(b"corrupted image", Some(b"release image"));
    cli_in(dir.path())
        .args(["verify", RELEASE])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Integrity check failed"));
}

#[test]
fn verify_without_checksum_file_succeeds_with_warning() {
    let dir = release_dir(b"release image", None);
    cli_in(dir.path())
        .args(["verify", RELEASE])
        .assert()
        .success()
        .stderr(predicate::str::contains("No checksum file"));
}

#[test]
fn verify_explicit_missing_checksum_fails() {
    let dir = release_dir(b"release image", None);
    cli_in(dir.path())
        .args(["verify", RELEASE, "--checksum", "missing.sha256"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("missing.sha256"));
}

// ============================================================================
// Flash argument handling (fails before any port is touched)
// ============================================================================

#[test]
fn flash_without_firmware_is_usage_error() {
    let dir = tempdir().expect("tempdir should be created");
    cli_in(dir.path())
        .arg("flash")
        .assert()
        .failure()
        .code(2)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("--device"));
}

#[test]
fn flash_rejects_ble_for_board_without_ble() {
    let dir = tempdir().expect("tempdir should be created");
    cli_in(dir.path())
        .args(["flash", "--device", "rak11200", "--ble"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("BLE"));
}

#[test]
fn flash_rejects_unknown_device() {
    let dir = tempdir().expect("tempdir should be created");
    cli_in(dir.path())
        .args(["flash", "--device", "heltec_v2"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("meshflash devices"));
}

#[test]
fn flash_missing_release_is_not_found() {
    let dir = tempdir().expect("tempdir should be created");
    cli_in(dir.path())
        .args(["flash", "--device", "heltec_v3", "--firmware-dir"])
        .arg(dir.path())
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn flash_corrupted_release_fails_integrity_with_hint() {
    let dir = release_dir(b"corrupted image", Some(b"release image"));
    cli_in(dir.path())
        .args(["flash", "--device", "heltec_v3"])
        .env("MESHFLASH_FIRMWARE_DIR", dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("Integrity check failed").and(predicate::str::contains("Hint:")));
}

#[test]
fn flash_device_and_file_conflict() {
    cli_cmd()
        .args(["flash", "--device", "heltec_v3", "--file", "fw.bin"])
        .assert()
        .failure()
        .code(2);
}

#[test]
fn flash_to_missing_port_fails() {
    let dir = tempdir().expect("tempdir should be created");
    let image = dir.path().join("custom.bin");
    fs::write(&image, [0xE9u8, 0x03, 0x02, 0x20]).expect("write image");

    let output = cli_in(dir.path())
        .args(["--non-interactive", "-p", "INVALID_PORT_NAME_XYZ", "flash", "--file"])
        .arg(&image)
        .output()
        .expect("command should execute");
    assert!(!output.status.success(), "missing port should not succeed");
}

#[test]
fn erase_rejects_unknown_device() {
    let dir = tempdir().expect("tempdir should be created");
    cli_in(dir.path())
        .args(["--non-interactive", "-p", "INVALID_PORT_NAME_XYZ", "erase", "--device", "heltec_v2"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("meshflash devices"));
}

#[test]
fn erase_rejects_malformed_flash_size() {
    cli_cmd()
        .args(["erase", "--flash-size", "lots"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("4MB"));
}

#[test]
fn erase_device_and_flash_size_conflict() {
    cli_cmd()
        .args(["erase", "--device", "heltec_v3", "--flash-size", "8MB"])
        .assert()
        .failure()
        .code(2);
}

// ============================================================================
// Exit codes and usage errors
// ============================================================================

#[test]
fn unknown_command_is_usage_error() {
    cli_cmd()
        .arg("unknown-command-xyz")
        .assert()
        .failure()
        .code(2);
}

#[test]
fn unknown_command_suggests_similar() {
    cli_cmd()
        .arg("falsh")
        .assert()
        .failure()
        .stderr(predicate::str::contains("flash"));
}

#[test]
fn invalid_protocol_is_usage_error() {
    cli_cmd()
        .args(["flash", "--device", "heltec_v3", "--protocol", "v2only"])
        .assert()
        .failure()
        .code(2);
}

#[test]
fn invalid_config_warns_and_continues() {
    let dir = tempdir().expect("tempdir should be created");
    fs::write(dir.path().join("meshflash.toml"), "invalid toml [[[").expect("write config");

    let output = cli_in(dir.path())
        .arg("devices")
        .output()
        .expect("command should execute");
    assert!(output.status.success(), "config errors are warnings, not fatal");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("TOML"), "should warn about invalid TOML");
}

#[test]
fn config_file_supplies_firmware_defaults() {
    let dir = tempdir().expect("tempdir should be created");
    fs::write(
        dir.path().join("meshflash.toml"),
        "[flash]\ndevice = \"rak11200\"\nfirmware_dir = \"releases\"\n",
    )
    .expect("write config");

    cli_in(dir.path())
        .arg("flash")
        .assert()
        .failure()
        .stderr(predicate::str::contains("meshgrid-rak11200-0.0.8.bin"));
}

// ============================================================================
// Completions
// ============================================================================

#[test]
fn completions_command_writes_to_stdout() {
    cli_cmd()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stderr(predicate::str::is_empty())
        .stdout(predicate::str::contains("_meshflash()"));
}

#[test]
fn completions_without_shell_is_usage_error() {
    cli_cmd()
        .arg("completions")
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("completions bash"));
}
