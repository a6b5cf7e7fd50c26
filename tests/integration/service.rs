//! Exercises the Service State Machine (C3) against a real on-disk `Store`:
//! transition commit/abort, scheduled starts (testable property 6), and
//! crash detection (testable property 7).

#[path = "common/mod.rs"]
mod common;

use common::test_store;
use rcinit::service::{self, DaemonRecord, LockFailurePolicy, PrimaryState, Transition};
use tempfile::tempdir;

#[test]
fn transition_commit_moves_to_terminal_state() {
    let temp = tempdir().expect("tempdir");
    let store = test_store(temp.path());

    let transition = Transition::begin(&store, "web", LockFailurePolicy::Report, true)
        .expect("lock should be free")
        .expect("no contention expected");
    transition.mark(PrimaryState::Starting).unwrap();
    transition.commit(PrimaryState::Started).unwrap();

    assert_eq!(service::read_state(&store, "web").primary, PrimaryState::Started);
}

#[test]
fn dropped_transition_restores_previous_state() {
    let temp = tempdir().expect("tempdir");
    let store = test_store(temp.path());

    {
        let transition = Transition::begin(&store, "web", LockFailurePolicy::Report, true)
            .unwrap()
            .unwrap();
        transition.mark(PrimaryState::Starting).unwrap();
        // Dropped without committing: simulates a verb body crashing
        // mid-transition.
    }

    assert_eq!(service::read_state(&store, "web").primary, PrimaryState::Stopped);
}

#[test]
fn lock_contention_reports_current_state() {
    let temp = tempdir().expect("tempdir");
    let store = test_store(temp.path());

    let held = Transition::begin(&store, "web", LockFailurePolicy::Report, true)
        .unwrap()
        .unwrap();
    held.mark(PrimaryState::Starting).unwrap();

    let second = Transition::begin(&store, "web", LockFailurePolicy::Report, true).unwrap();
    assert!(second.is_err(), "a second driver must observe lock contention");
    assert_eq!(second.unwrap_err().primary, PrimaryState::Starting);
}

#[test]
fn scheduled_start_is_delivered_once() {
    let temp = tempdir().expect("tempdir");
    let store = test_store(temp.path());

    service::schedule_start(&store, "a", "b", &temp.path().join("init.d/b")).unwrap();
    let targets = service::scheduled_targets(&store, "a");
    assert_eq!(targets, vec!["b".to_string()]);

    service::schedule_clear(&store, "a").unwrap();
    assert!(service::scheduled_targets(&store, "a").is_empty());
}

#[test]
fn daemons_crashed_detects_dead_pid() {
    let temp = tempdir().expect("tempdir");
    let store = test_store(temp.path());

    // A pidfile naming a pid that is certainly not alive (pid 1 reused in a
    // container is possible, so pick something absurdly high instead).
    let pidfile = temp.path().join("dead.pid");
    std::fs::write(&pidfile, "999999999").unwrap();

    let record = DaemonRecord {
        exec: "/bin/sleep".to_string(),
        argv: vec!["100".to_string()],
        pidfile: Some(pidfile.to_string_lossy().to_string()),
    };
    service::daemon_set(&store, "web", &record, true).unwrap();

    assert!(service::daemons_crashed(&store, "web"));
}

#[test]
fn daemon_set_round_trips_and_clears() {
    let temp = tempdir().expect("tempdir");
    let store = test_store(temp.path());

    let record = DaemonRecord {
        exec: "/usr/bin/foo".to_string(),
        argv: vec!["--flag".to_string()],
        pidfile: None,
    };
    service::daemon_set(&store, "web", &record, true).unwrap();
    assert_eq!(service::daemon_records(&store, "web"), vec![record.clone()]);

    service::daemon_set(&store, "web", &record, false).unwrap();
    assert!(service::daemon_records(&store, "web").is_empty());
}
