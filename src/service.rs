//! Service State Machine (C3): state transitions under an exclusive lock,
//! scheduled starts, daemon records, and crash detection (§4.3).
//!
//! Grounded directly on distilled §4.3; the in-process daemon-record
//! matching tuple and `start_time`/`start_count` value keys are grounded on
//! `original_source/src/supervise-daemon/supervise.c`'s `spawn_child`. The
//! exclusive-lock wrapper idiom (advisory `flock`, ignore-on-contention
//! flag) follows the teacher's `constants::DaemonLock` ordering discipline
//! in spirit, adapted to a single file-level lock per service.

use crate::error::{LockContention, TransientRuntimeError};
use crate::store::{StateDir, Store, StoreError};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::symlink;
use std::path::PathBuf;
use tracing::{debug, info, trace, warn};

/// The seven primary runtime states, plus the query-time `crashed` state
/// which is never stored (§3, §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimaryState {
    Stopped,
    Starting,
    Started,
    Stopping,
    Inactive,
}

impl PrimaryState {
    fn to_state_dir(self) -> Option<StateDir> {
        match self {
            PrimaryState::Started => Some(StateDir::Started),
            PrimaryState::Starting => Some(StateDir::Starting),
            PrimaryState::Stopping => Some(StateDir::Stopping),
            PrimaryState::Inactive => Some(StateDir::Inactive),
            PrimaryState::Stopped => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            PrimaryState::Stopped => "stopped",
            PrimaryState::Starting => "starting",
            PrimaryState::Started => "started",
            PrimaryState::Stopping => "stopping",
            PrimaryState::Inactive => "inactive",
        }
    }
}

/// Modifier bits that may coexist with a primary state (§3).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModifierBits {
    pub wasinactive: bool,
    pub failed: bool,
    pub hotplugged: bool,
}

/// Full snapshot of a service's queryable state, including the computed
/// `crashed` bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceState {
    pub primary: PrimaryState,
    pub modifiers: ModifierBits,
    pub crashed: bool,
}

/// Caller-set behaviour when the exclusive lock is already held (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockFailurePolicy {
    /// Exit silently successful (cascade restarts).
    Ignore,
    /// Report the current primary state and abort.
    Report,
}

/// Holds the advisory exclusive lock on `exclusive/<svc>` for the lifetime
/// of one transition. Dropping it without calling [`Transition::commit`]
/// restores the pre-transition state (§4.3 "abnormal exit").
pub struct Transition<'a> {
    store: &'a Store,
    service: String,
    _lock_file: File,
    previous: ServiceState,
    runlevel_in_progress: bool,
    committed: bool,
}

impl<'a> Transition<'a> {
    /// Attempts to acquire the exclusive lock and begin a transition.
    pub fn begin(
        store: &'a Store,
        service: &str,
        on_contention: LockFailurePolicy,
        runlevel_in_progress: bool,
    ) -> Result<Result<Transition<'a>, ServiceState>, LockContention> {
        let lock_path = store.exclusive_lock_path(service);
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent).map_err(|e| LockContention::Io {
                service: service.to_string(),
                source: e,
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)
            .map_err(|e| LockContention::Io {
                service: service.to_string(),
                source: e,
            })?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                let previous = read_state(store, service);
                trace!(service, state = previous.primary.label(), "exclusive lock acquired");
                Ok(Ok(Transition {
                    store,
                    service: service.to_string(),
                    _lock_file: file,
                    previous,
                    runlevel_in_progress,
                    committed: false,
                }))
            }
            Err(_) => {
                let current = read_state(store, service);
                match on_contention {
                    LockFailurePolicy::Ignore => {
                        debug!(service, "lock contention ignored by caller policy");
                        Ok(Err(current))
                    }
                    LockFailurePolicy::Report => {
                        warn!(service, state = current.primary.label(), "lock contention");
                        Ok(Err(current))
                    }
                }
            }
        }
    }

    /// Marks the service as entering `state`, clearing the previous primary
    /// bit. Does not release the lock; call [`Self::commit`] on reaching a
    /// terminal state.
    pub fn mark(&self, state: PrimaryState) -> Result<(), StoreError> {
        if let Some(prev_dir) = self.previous.primary.to_state_dir() {
            self.store.unmark(&self.service, prev_dir)?;
        }
        if let Some(dir) = state.to_state_dir() {
            let target = self
                .store
                .value_get(&self.service, "resolved_path")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(&self.service));
            self.store.mark(&self.service, dir, &target)?;
        }
        trace!(service = %self.service, state = state.label(), "marked");
        Ok(())
    }

    pub fn set_wasinactive(&self, value: bool) -> Result<(), StoreError> {
        set_modifier(self.store, &self.service, StateDir::WasInactive, value)
    }

    pub fn set_failed(&self, value: bool) -> Result<(), StoreError> {
        set_modifier(self.store, &self.service, StateDir::Failed, value)
    }

    /// Reaching a terminal state (`started`/`stopped`): releases the lock
    /// and, for `stopped`, clears options/daemons/scheduled-starts (§3
    /// Lifecycle).
    pub fn commit(mut self, terminal: PrimaryState) -> Result<(), StoreError> {
        self.mark(terminal)?;
        if terminal == PrimaryState::Stopped {
            self.store.clear_options(&self.service)?;
            let _ = fs::remove_dir_all(self.store.daemons_dir(&self.service));
            let _ = fs::remove_dir_all(self.store.scheduled_dir(&self.service));
        }
        self.committed = true;
        info!(service = %self.service, state = terminal.label(), "transition committed");
        Ok(())
    }
}

impl Drop for Transition<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        // Abnormal exit (§4.3): restore the prior primary state, or
        // `inactive` if `wasinactive` was set while starting/stopping; mark
        // `failed` too if a runlevel transition is in progress.
        let restore = if self.previous.modifiers.wasinactive {
            PrimaryState::Inactive
        } else {
            self.previous.primary
        };
        if let Some(dir) = restore.to_state_dir() {
            let target = PathBuf::from(&self.service);
            let _ = self.store.mark(&self.service, dir, &target);
        } else {
            for dir in [StateDir::Starting, StateDir::Stopping, StateDir::Inactive] {
                let _ = self.store.unmark(&self.service, dir);
            }
        }
        if self.runlevel_in_progress {
            let _ = set_modifier(self.store, &self.service, StateDir::Failed, true);
        }
        warn!(service = %self.service, restored = restore.label(), "transition aborted, state restored");
    }
}

fn set_modifier(store: &Store, service: &str, dir: StateDir, value: bool) -> Result<(), StoreError> {
    if value {
        let target = PathBuf::from(service);
        store.mark(service, dir, &target)?;
    } else {
        store.unmark(service, dir)?;
    }
    Ok(())
}

/// Reads the current state from disk (§4.1 `state_get`, scanning for
/// directory membership). `crashed` is computed separately via
/// [`daemons_crashed`] since it is query-time only.
pub fn read_state(store: &Store, service: &str) -> ServiceState {
    let present = store.state_get(service);
    let primary = if present.contains(&StateDir::Started) {
        PrimaryState::Started
    } else if present.contains(&StateDir::Starting) {
        PrimaryState::Starting
    } else if present.contains(&StateDir::Stopping) {
        PrimaryState::Stopping
    } else if present.contains(&StateDir::Inactive) {
        PrimaryState::Inactive
    } else {
        PrimaryState::Stopped
    };
    ServiceState {
        primary,
        modifiers: ModifierBits {
            wasinactive: present.contains(&StateDir::WasInactive),
            failed: present.contains(&StateDir::Failed),
            hotplugged: present.contains(&StateDir::Hotplugged),
        },
        crashed: false,
    }
}

// ============================================================================
// Scheduled starts (§4.3)
// ============================================================================

/// `schedule_start(parent, target)`: creates `scheduled/<parent>/<target>`
/// linking to the target's resolved path.
pub fn schedule_start(store: &Store, parent: &str, target: &str, target_path: &PathBuf) -> io::Result<()> {
    let dir = store.scheduled_dir(parent);
    fs::create_dir_all(&dir)?;
    let link = dir.join(target);
    let _ = fs::remove_file(&link);
    symlink(target_path, &link)
}

/// `schedule_clear(parent)`: removes the scheduled-start directory.
pub fn schedule_clear(store: &Store, parent: &str) -> io::Result<()> {
    match fs::remove_dir_all(store.scheduled_dir(parent)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Enumerates the pending scheduled-start targets for `parent`. Callers
/// invoke this strictly after the parent's terminal-state commit (i.e.
/// after the lock in [`Transition`] is dropped), per the ordering guarantee
/// in §5 ("scheduled starts are delivered... strictly after the lock is
/// released").
pub fn scheduled_targets(store: &Store, parent: &str) -> Vec<String> {
    let dir = store.scheduled_dir(parent);
    let Ok(entries) = fs::read_dir(&dir) else {
        return Vec::new();
    };
    entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().into_string().ok())
        .collect()
}

// ============================================================================
// Daemon records (§4.3, §6.1)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonRecord {
    pub exec: String,
    pub argv: Vec<String>,
    pub pidfile: Option<String>,
}

impl DaemonRecord {
    fn serialize(&self) -> String {
        let mut out = format!("exec={}\n", self.exec);
        for (i, arg) in self.argv.iter().enumerate() {
            out.push_str(&format!("argv_{i}={arg}\n"));
        }
        if let Some(pidfile) = &self.pidfile {
            out.push_str(&format!("pidfile={pidfile}\n"));
        }
        out
    }

    fn parse(text: &str) -> Option<DaemonRecord> {
        let mut exec = None;
        let mut pidfile = None;
        let mut argv: Vec<(usize, String)> = Vec::new();
        for line in text.lines() {
            let (key, value) = line.split_once('=')?;
            if key == "exec" {
                exec = Some(value.to_string());
            } else if key == "pidfile" {
                pidfile = Some(value.to_string());
            } else if let Some(idx) = key.strip_prefix("argv_") {
                if let Ok(n) = idx.parse::<usize>() {
                    argv.push((n, value.to_string()));
                }
            }
        }
        argv.sort_by_key(|(n, _)| *n);
        Some(DaemonRecord {
            exec: exec?,
            argv: argv.into_iter().map(|(_, v)| v).collect(),
            pidfile,
        })
    }
}

fn daemon_record_paths(store: &Store, service: &str) -> Vec<PathBuf> {
    let dir = store.daemons_dir(service);
    let Ok(entries) = fs::read_dir(&dir) else {
        return Vec::new();
    };
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    paths.sort();
    paths
}

/// `daemon_set(service, exec, argv, pidfile, started)` (§4.3): maintains
/// numbered files under `daemons/<service>/NNN`. `started=false` removes the
/// entry matching the (exec, argv, pidfile) tuple; `started=true` adds one if
/// not already present.
pub fn daemon_set(
    store: &Store,
    service: &str,
    record: &DaemonRecord,
    started: bool,
) -> io::Result<()> {
    let dir = store.daemons_dir(service);
    let existing = daemon_record_paths(store, service);

    let matching = existing.iter().find(|p| {
        fs::read_to_string(p)
            .ok()
            .and_then(|t| DaemonRecord::parse(&t))
            .as_ref()
            == Some(record)
    });

    if !started {
        if let Some(path) = matching {
            fs::remove_file(path)?;
        }
        return Ok(());
    }

    if matching.is_some() {
        return Ok(());
    }

    fs::create_dir_all(&dir)?;
    let next_id = existing.len();
    let path = dir.join(format!("{next_id:03}"));
    fs::write(path, record.serialize())
}

pub fn daemon_records(store: &Store, service: &str) -> Vec<DaemonRecord> {
    daemon_record_paths(store, service)
        .into_iter()
        .filter_map(|p| fs::read_to_string(p).ok())
        .filter_map(|t| DaemonRecord::parse(&t))
        .collect()
}

// ============================================================================
// Crash detection (§4.3)
// ============================================================================

/// `daemons_crashed(service)`: true if at least one recorded daemon is no
/// longer alive.
pub fn daemons_crashed(store: &Store, service: &str) -> bool {
    daemon_records(store, service)
        .iter()
        .any(daemon_record_crashed)
}

fn daemon_record_crashed(record: &DaemonRecord) -> bool {
    if let Some(pidfile) = &record.pidfile {
        return match read_pidfile(pidfile) {
            Some(pid) => !process_alive(pid),
            None => true,
        };
    }
    !process_with_exec_and_argv_alive(&record.exec, &record.argv)
}

fn read_pidfile(path: &str) -> Option<i32> {
    fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse::<i32>().ok())
}

fn process_alive(pid: i32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid), None).is_ok()
}

/// Scans `/proc` for a live process whose `comm` basename matches `exec` and
/// whose NUL-separated `/proc/<pid>/cmdline` matches `argv` (§4.3, Linux
/// path). UID/PID-namespace/OpenVZ filters are noted as an Open Question in
/// DESIGN.md and not implemented here.
fn process_with_exec_and_argv_alive(exec: &str, argv: &[String]) -> bool {
    let basename = exec.rsplit('/').next().unwrap_or(exec);
    let Ok(entries) = fs::read_dir("/proc") else {
        return false;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        if entry.file_name().to_string_lossy().parse::<i32>().is_err() {
            continue;
        }
        let comm_path = entry.path().join("comm");
        let Ok(comm) = fs::read_to_string(&comm_path) else {
            continue;
        };
        if comm.trim() != basename {
            continue;
        }
        let cmdline_path = entry.path().join("cmdline");
        let Ok(raw) = fs::read(&cmdline_path) else {
            continue;
        };
        let actual: Vec<String> = raw
            .split(|&b| b == 0)
            .filter(|s| !s.is_empty())
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .collect();
        if actual == argv {
            return true;
        }
    }
    false
}

/// Converts a crash-detection result into the §7 error used when a
/// runlevel's caller needs to escalate a crashed service to a hard failure.
pub fn crashed_to_transient_error(service: &str) -> TransientRuntimeError {
    TransientRuntimeError::VerbFailed {
        service: service.to_string(),
        status: -1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SearchRoots;
    use tempfile::tempdir;

    fn test_store() -> (tempfile::TempDir, Store) {
        let temp = tempdir().expect("tempdir");
        let base = temp.path().join("svcdir");
        let roots = SearchRoots {
            user_scope: None,
            system_scope: temp.path().join("init.d"),
            local_override: temp.path().join("local"),
            package_installed: temp.path().join("pkg"),
        };
        fs::create_dir_all(&roots.system_scope).unwrap();
        let store = Store::new(base, roots, false);
        store.ensure_base_layout().unwrap();
        (temp, store)
    }

    #[test]
    fn transition_lifecycle_reaches_started() {
        let (_temp, store) = test_store();
        let t = Transition::begin(&store, "foo", LockFailurePolicy::Report, false)
            .unwrap()
            .unwrap();
        t.mark(PrimaryState::Starting).unwrap();
        assert_eq!(read_state(&store, "foo").primary, PrimaryState::Starting);
        t.commit(PrimaryState::Started).unwrap();
        assert_eq!(read_state(&store, "foo").primary, PrimaryState::Started);
    }

    #[test]
    fn concurrent_transition_observes_lock_contention() {
        let (_temp, store) = test_store();
        let _first = Transition::begin(&store, "foo", LockFailurePolicy::Report, false)
            .unwrap()
            .unwrap();
        let second = Transition::begin(&store, "foo", LockFailurePolicy::Report, false).unwrap();
        assert!(second.is_err());
    }

    #[test]
    fn abnormal_drop_restores_previous_state() {
        let (_temp, store) = test_store();
        {
            let t = Transition::begin(&store, "foo", LockFailurePolicy::Report, false)
                .unwrap()
                .unwrap();
            t.mark(PrimaryState::Starting).unwrap();
            // dropped without commit
        }
        assert_eq!(read_state(&store, "foo").primary, PrimaryState::Stopped);
    }

    #[test]
    fn scheduled_start_delivery_enumerates_target_once() {
        let (_temp, store) = test_store();
        schedule_start(&store, "a", "b", &PathBuf::from("/bin/b")).unwrap();
        let targets = scheduled_targets(&store, "a");
        assert_eq!(targets, vec!["b".to_string()]);
        schedule_clear(&store, "a").unwrap();
        assert!(scheduled_targets(&store, "a").is_empty());
    }

    #[test]
    fn daemon_crashed_detects_stale_pidfile() {
        let (_temp, store) = test_store();
        let record = DaemonRecord {
            exec: "/usr/bin/thing".to_string(),
            argv: vec!["thing".to_string()],
            pidfile: Some("/nonexistent/pid/thing.pid".to_string()),
        };
        daemon_set(&store, "foo", &record, true).unwrap();
        assert!(daemons_crashed(&store, "foo"));
    }

    #[test]
    fn daemon_set_round_trips_record() {
        let (_temp, store) = test_store();
        let record = DaemonRecord {
            exec: "/usr/bin/thing".to_string(),
            argv: vec!["thing".to_string(), "--flag".to_string()],
            pidfile: None,
        };
        daemon_set(&store, "foo", &record, true).unwrap();
        assert_eq!(daemon_records(&store, "foo"), vec![record.clone()]);
        daemon_set(&store, "foo", &record, false).unwrap();
        assert!(daemon_records(&store, "foo").is_empty());
    }
}
