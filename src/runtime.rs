//! Runtime paths and modes (§12 ambient bootstrap): resolves the base service
//! directory and the init-script search roots for the current process.
//!
//! Narrowed from the teacher's `runtime.rs` (`RuntimeMode`/`state_dir`/
//! `config_dirs`, a `OnceLock<RwLock<..>>` global context) to the minimal
//! contract distilled §6/§12 need: one base service directory (C1's `Store`
//! root) plus the `SearchRoots` search order (user-scope, system-scope,
//! local-admin-override, package-installed).

use crate::store::SearchRoots;
use std::{
    env,
    os::fd::RawFd,
    path::PathBuf,
    sync::{OnceLock, RwLock},
};

#[cfg(test)]
use std::path::Path;

/// Runtime mode that determines where state is written and which search
/// roots apply (§1, §12).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeMode {
    /// Per-user manager; state lives under the invoking user's home directory.
    User,
    /// System-wide manager; state is stored in system directories.
    System,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    mode: RuntimeMode,
    state_dir: PathBuf,
    roots: SearchRoots,
    system_tag: String,
    activation_fds: Vec<RawFd>,
}

static CONTEXT: OnceLock<RwLock<RuntimeContext>> = OnceLock::new();

fn context_lock() -> &'static RwLock<RuntimeContext> {
    CONTEXT.get_or_init(|| RwLock::new(RuntimeContext::from_mode(RuntimeMode::User)))
}

fn default_system_tag() -> String {
    env::var("RC_SYS").unwrap_or_default()
}

impl RuntimeContext {
    fn from_mode(mode: RuntimeMode) -> Self {
        match mode {
            RuntimeMode::User => Self::user_context(),
            RuntimeMode::System => Self::system_context(),
        }
    }

    fn user_context() -> Self {
        let home = env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/"));
        Self::from_user_home(home)
    }

    fn from_user_home(home: PathBuf) -> Self {
        let state_dir = home.join(".local/share/rcinit");
        let roots = SearchRoots {
            user_scope: Some(home.join(".config/rcinit/init.d")),
            system_scope: PathBuf::from("/etc/rcinit/init.d"),
            local_override: PathBuf::from("/usr/local/lib/rcinit/init.d"),
            package_installed: PathBuf::from("/usr/lib/rcinit/init.d"),
        };
        Self {
            mode: RuntimeMode::User,
            state_dir,
            roots,
            system_tag: default_system_tag(),
            activation_fds: Vec::new(),
        }
    }

    fn system_context() -> Self {
        let state_dir = PathBuf::from("/run/rcinit");
        let roots = SearchRoots {
            user_scope: None,
            system_scope: PathBuf::from("/etc/rcinit/init.d"),
            local_override: PathBuf::from("/usr/local/lib/rcinit/init.d"),
            package_installed: PathBuf::from("/usr/lib/rcinit/init.d"),
        };
        Self {
            mode: RuntimeMode::System,
            state_dir,
            roots,
            system_tag: default_system_tag(),
            activation_fds: Vec::new(),
        }
    }
}

/// Updates the global runtime context for the provided mode. Subsequent
/// calls overwrite the active configuration, allowing a single process
/// (e.g. a forked driver) to re-derive paths for its own invocation.
pub fn init(mode: RuntimeMode) {
    let mut guard = context_lock().write().expect("runtime context poisoned");
    let activation_fds = guard.activation_fds.clone();
    let mut context = RuntimeContext::from_mode(mode);
    context.activation_fds = activation_fds;
    *guard = context;
}

#[cfg(test)]
pub fn init_with_test_home(home: &Path) {
    let mut guard = context_lock().write().expect("runtime context poisoned");
    let activation_fds = guard.activation_fds.clone();
    let mut context = RuntimeContext::from_user_home(home.to_path_buf());
    context.activation_fds = activation_fds;
    *guard = context;
}

/// Returns the current runtime mode.
pub fn mode() -> RuntimeMode {
    context_lock().read().expect("runtime context poisoned").mode
}

/// Returns the base service directory (C1's `Store` root: `started/`,
/// `exclusive/`, `deptree`, etc.).
pub fn state_dir() -> PathBuf {
    context_lock().read().expect("runtime context poisoned").state_dir.clone()
}

/// Returns the init-script search roots for the current mode, in search
/// order (§4.1 `resolve`, §12).
pub fn search_roots() -> SearchRoots {
    context_lock().read().expect("runtime context poisoned").roots.clone()
}

/// Returns the system-type tag (`RC_SYS`) used by platform pruning (§4.2).
pub fn system_tag() -> String {
    context_lock().read().expect("runtime context poisoned").system_tag.clone()
}

/// Overrides the system-type tag, e.g. when a config file sets it explicitly
/// rather than inheriting `RC_SYS` from the environment.
pub fn set_system_tag(tag: impl Into<String>) {
    let mut guard = context_lock().write().expect("runtime context poisoned");
    guard.system_tag = tag.into();
}

/// Stores file descriptors inherited via socket activation (e.g. systemd
/// `LISTEN_FDS`), kept as ambient process-bootstrap infrastructure.
pub fn set_activation_fds(fds: Vec<RawFd>) {
    let mut guard = context_lock().write().expect("runtime context poisoned");
    guard.activation_fds = fds;
}

/// Returns the list of file descriptors inherited via socket activation.
pub fn activation_fds() -> Vec<RawFd> {
    context_lock().read().expect("runtime context poisoned").activation_fds.clone()
}

/// Clears any recorded activation file descriptors.
pub fn clear_activation_fds() {
    let mut guard = context_lock().write().expect("runtime context poisoned");
    guard.activation_fds.clear();
}

/// Captures socket activation file descriptors if provided by the init
/// system, per the `LISTEN_PID`/`LISTEN_FDS` protocol.
#[cfg(unix)]
pub fn capture_socket_activation() {
    use std::os::unix::io::RawFd as UnixRawFd;

    let listen_pid = match env::var("LISTEN_PID").ok().and_then(|pid| pid.parse::<u32>().ok()) {
        Some(pid) => pid,
        None => {
            clear_activation_fds();
            return;
        }
    };

    let current_pid = unsafe { libc::getpid() as u32 };
    if listen_pid != current_pid {
        clear_activation_fds();
        return;
    }

    let fd_count = match env::var("LISTEN_FDS").ok().and_then(|val| val.parse::<i32>().ok()) {
        Some(n) if n > 0 => n,
        _ => {
            clear_activation_fds();
            return;
        }
    };

    let fds: Vec<UnixRawFd> = (0..fd_count).map(|offset| 3 + offset).collect();
    set_activation_fds(fds);

    unsafe {
        env::remove_var("LISTEN_PID");
        env::remove_var("LISTEN_FDS");
        env::remove_var("LISTEN_FDNAMES");
    }
}

#[cfg(not(unix))]
pub fn capture_socket_activation() {
    clear_activation_fds();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::env_lock;
    use std::env;
    use tempfile::tempdir;

    #[test]
    fn user_mode_uses_home_scoped_paths() {
        let _guard = env_lock();
        let temp = tempdir().expect("tempdir");
        let home = temp.path();
        let original_home = env::var("HOME").ok();
        unsafe {
            env::set_var("HOME", home);
        }

        init(RuntimeMode::User);

        let expected_state = home.join(".local/share/rcinit");
        let expected_user_scope = home.join(".config/rcinit/init.d");

        assert_eq!(state_dir(), expected_state);
        assert_eq!(search_roots().user_scope, Some(expected_user_scope));

        if let Some(previous) = original_home {
            unsafe { env::set_var("HOME", previous) };
        } else {
            unsafe { env::remove_var("HOME") };
        }
    }

    #[test]
    fn system_mode_has_no_user_scope_and_uses_run_state() {
        let _guard = env_lock();
        init(RuntimeMode::System);

        assert_eq!(state_dir(), PathBuf::from("/run/rcinit"));
        assert!(search_roots().user_scope.is_none());
        assert_eq!(search_roots().system_scope, PathBuf::from("/etc/rcinit/init.d"));
    }

    #[test]
    fn activation_fd_setters_round_trip() {
        let _guard = env_lock();
        clear_activation_fds();
        assert!(activation_fds().is_empty());

        set_activation_fds(vec![3, 4, 5]);
        assert_eq!(activation_fds(), vec![3, 4, 5]);

        clear_activation_fds();
        assert!(activation_fds().is_empty());
    }
}
