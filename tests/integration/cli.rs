//! Black-box smoke tests against the compiled `rcinit` binary: the `--sys`
//! root requirement, `status` with no recorded state, and a `start`/`status`
//! round trip through the runscript driver.

#[path = "common/mod.rs"]
mod common;

use std::fs;

use assert_cmd::Command;
use common::{write_script, HomeEnvGuard};
use tempfile::tempdir;

#[test]
fn sys_flag_requires_root_privileges() {
    if nix::unistd::Uid::effective().is_root() {
        return;
    }

    let output = Command::new(assert_cmd::cargo::cargo_bin!("rcinit"))
        .arg("--sys")
        .arg("status")
        .output()
        .expect("failed to invoke rcinit");

    assert!(!output.status.success(), "--sys should fail when invoked without root");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("--sys requires root"),
        "stderr should mention the missing root privileges: {stderr}"
    );
}

#[test]
fn status_with_no_recorded_state_prints_friendly_message() {
    let temp = tempdir().expect("tempdir");
    let home = temp.path().join("home");
    fs::create_dir_all(&home).expect("create home dir");
    let _home = HomeEnvGuard::set(&home);

    let state_dir = temp.path().join("state");

    Command::new(assert_cmd::cargo::cargo_bin!("rcinit"))
        .env("RC_STATE_DIR", &state_dir)
        .arg("--config")
        .arg(temp.path().join("nonexistent.yaml"))
        .arg("status")
        .assert()
        .success()
        .stdout(predicates::str::contains("no services with recorded state"));
}

#[test]
fn start_then_status_round_trip_through_the_runscript_driver() {
    let temp = tempdir().expect("tempdir");
    let home = temp.path().join("home");
    fs::create_dir_all(&home).expect("create home dir");
    let _home = HomeEnvGuard::set(&home);

    let state_dir = temp.path().join("state");
    let init_dir = temp.path().join("init.d");
    fs::create_dir_all(&init_dir).expect("create init.d");
    write_script(&init_dir, "web", "start) exit 0 ;;\nstop) exit 0 ;;");

    let config_path = temp.path().join("rcinit.yaml");
    fs::write(
        &config_path,
        format!(
            "base_dir: \"{}\"\nuser_scope: \"{}\"\n",
            state_dir.display(),
            init_dir.display()
        ),
    )
    .expect("write config");

    Command::new(assert_cmd::cargo::cargo_bin!("rcinit"))
        .arg("--config")
        .arg(&config_path)
        .arg("start")
        .arg("web")
        .assert()
        .success();

    Command::new(assert_cmd::cargo::cargo_bin!("rcinit"))
        .arg("--config")
        .arg(&config_path)
        .arg("status")
        .arg("web")
        .assert()
        .success()
        .stdout(predicates::str::contains("started"));
}
