//! Exercises the Daemon Supervisor (C5) against a real forked child: the S6
//! shutdown scenario (control FIFO `stop` -> `SIGTERM` -> daemon dir removed
//! -> clean exit) and the respawn-budget escalation from testable property 9.

#[path = "common/mod.rs"]
mod common;

use std::fs::OpenOptions;
use std::io::Write;
use std::time::{Duration, Instant};

use common::test_store;
use rcinit::store::StateDir;
use rcinit::supervisor;
use tempfile::tempdir;

fn wait_until(mut predicate: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    predicate()
}

#[test]
fn s6_stop_control_message_tears_down_daemon() {
    let temp = tempdir().expect("tempdir");
    let store = test_store(temp.path());
    store.mark("web", StateDir::Started, temp.path()).unwrap();

    store.value_set("web", "exec", Some("/bin/sleep")).unwrap();
    store.value_set("web", "argv_0", Some("30")).unwrap();

    let control_path = store.daemons_dir("web").join("control");

    std::thread::scope(|scope| {
        let handle = scope.spawn(|| supervisor::supervise(&store, "web"));

        let up = wait_until(|| control_path.exists(), Duration::from_secs(5));
        assert!(up, "control fifo should appear once the supervisor starts");
        // Give the child a moment past fork so the first poll iteration is
        // already blocked in `poll` before the stop message lands.
        std::thread::sleep(Duration::from_millis(200));

        let mut control = OpenOptions::new()
            .write(true)
            .open(&control_path)
            .expect("open control fifo for writing");
        control.write_all(b"stop\n").expect("write stop message");
        drop(control);

        let result = handle.join().expect("supervisor thread panicked");
        assert!(result.is_ok(), "supervise() should return Ok(()) after a clean stop: {result:?}");
    });

    assert!(!control_path.exists(), "control fifo should be removed on shutdown");
    assert!(!store.daemons_dir("web").exists(), "daemon record directory should be removed on shutdown");
    assert!(
        !store.state_get("web").contains(&StateDir::Started),
        "started marker should be cleared on shutdown"
    );
}

#[test]
fn respawn_budget_exceeded_reports_error() {
    let temp = tempdir().expect("tempdir");
    let store = test_store(temp.path());

    // A daemon that exits immediately on every spawn, with no delay and a
    // tiny respawn budget, so the loop exhausts it quickly.
    store.value_set("flappy", "exec", Some("/bin/true")).unwrap();
    store.value_set("flappy", "respawn-max", Some("1")).unwrap();
    store.value_set("flappy", "respawn-delay", Some("0")).unwrap();

    let result = supervisor::supervise(&store, "flappy");
    assert!(
        matches!(result, Err(rcinit::error::SupervisorError::RespawnBudgetExceeded { .. })),
        "expected a respawn budget error, got {result:?}"
    );
}
