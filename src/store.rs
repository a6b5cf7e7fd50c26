//! Path & State Store (C1): canonical on-disk layout of runlevels, service
//! state directories, scheduled-start links, and per-service value files
//! (§4.1, §6).
//!
//! No single teacher module matches this one-to-one; the path-resolution and
//! file-per-value idiom is adapted from the teacher's `config.rs` (which
//! stores one hook config value per key) and `runtime.rs` (global, resolved
//! search roots keyed by mode).

use crate::constants::{
    DAEMONS_DIR, DEPCONFIG_FILE, DEPTREE_FILE, EXCLUSIVE_DIR, OPTIONS_DIR, PREFIX_LOCK_FILE,
    SCHEDULED_DIR, SOFTLEVEL_FILE, STATE_DIR_NAMES,
};
use crate::error::SystemError;
use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

/// One of the seven primary runtime states plus the two modifier bits,
/// matching the directory names under the service directory (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateDir {
    Started,
    Starting,
    Stopping,
    Inactive,
    WasInactive,
    Failed,
    Hotplugged,
}

impl StateDir {
    pub const ALL: [StateDir; 7] = [
        Self::Started,
        Self::Starting,
        Self::Stopping,
        Self::Inactive,
        Self::WasInactive,
        Self::Failed,
        Self::Hotplugged,
    ];

    pub const fn dir_name(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Starting => "starting",
            Self::Stopping => "stopping",
            Self::Inactive => "inactive",
            Self::WasInactive => "wasinactive",
            Self::Failed => "failed",
            Self::Hotplugged => "hotplugged",
        }
    }

    /// Whether this is one of the seven primary (mutually exclusive) states,
    /// as opposed to a modifier bit (`wasinactive`, `failed`, `hotplugged`
    /// may coexist with a primary state per §3).
    pub const fn is_primary(&self) -> bool {
        matches!(
            self,
            Self::Started | Self::Starting | Self::Stopping | Self::Inactive
        )
    }
}

/// Where a service's executable command body may be found, in search order
/// (§4.1 `resolve`).
#[derive(Debug, Clone, Default)]
pub struct SearchRoots {
    /// User-scope init directory, only consulted when running as a user
    /// manager.
    pub user_scope: Option<PathBuf>,
    /// System-scope init directory.
    pub system_scope: PathBuf,
    /// Local admin override directory (takes precedence over the
    /// package-installed directory but not over the scoped directories).
    pub local_override: PathBuf,
    /// Package-installed directory, searched last.
    pub package_installed: PathBuf,
}

/// Errors specific to path resolution and the on-disk store, distinct from
/// the generic `SystemError` I/O wrapper so callers can match on them.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("service '{0}' not found in any search root")]
    NotFound(String),

    #[error("'{0}' is a reserved library name (.sh suffix)")]
    ReservedLibraryName(String),

    #[error("refusing to add '{service}' to the boot runlevel: not in the system init directory")]
    BootRunlevelForbidden { service: String },

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    System(#[from] SystemError),
}

/// Owns the base service directory and the search roots, and exposes the
/// small C1 API.
pub struct Store {
    /// Base directory holding `started/`, `exclusive/`, `deptree`, etc.
    base: PathBuf,
    roots: SearchRoots,
    /// True when running as an unprivileged per-user manager (§1).
    user_mode: bool,
}

impl Store {
    pub fn new(base: impl Into<PathBuf>, roots: SearchRoots, user_mode: bool) -> Self {
        Store {
            base: base.into(),
            roots,
            user_mode,
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn state_dir_path(&self, state: StateDir) -> PathBuf {
        self.base.join(state.dir_name())
    }

    fn ensure_dir(&self, path: &Path) -> Result<(), StoreError> {
        fs::create_dir_all(path)?;
        Ok(())
    }

    /// `resolve(name) -> absolute path or error` (§4.1).
    ///
    /// Names containing path separators resolve literally (after checking
    /// they are not `.sh`-suffixed). Otherwise the search order is:
    /// (1) already-recorded running/inactive symlink, (2) user-scope init
    /// directory (user mode only), (3) system-scope, (4) local override,
    /// (5) package-installed.
    pub fn resolve(&self, name: &str) -> Result<PathBuf, StoreError> {
        if name.ends_with(".sh") {
            return Err(StoreError::ReservedLibraryName(name.to_string()));
        }

        if name.contains('/') {
            let path = PathBuf::from(name);
            if path.exists() {
                return Ok(path);
            }
            return Err(StoreError::NotFound(name.to_string()));
        }

        for state in [StateDir::Started, StateDir::Inactive] {
            let link = self.state_dir_path(state).join(name);
            if let Ok(target) = fs::read_link(&link) {
                return Ok(target);
            }
        }

        let mut candidates = Vec::new();
        if self.user_mode {
            if let Some(root) = &self.roots.user_scope {
                candidates.push(root.join(name));
            }
        }
        candidates.push(self.roots.system_scope.join(name));
        candidates.push(self.roots.local_override.join(name));
        candidates.push(self.roots.package_installed.join(name));

        candidates
            .into_iter()
            .find(|p| p.exists())
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    /// `in_runlevel(service, runlevel) -> bool`: filesystem existence test
    /// only (§4.1).
    pub fn in_runlevel(&self, runlevels_root: &Path, service: &str, runlevel: &str) -> bool {
        runlevels_root.join(runlevel).join(service).exists()
    }

    /// `add(service, runlevel)`: create a symlink; refuse to add to `boot`
    /// unless the service lives in the system init directory.
    pub fn add(
        &self,
        runlevels_root: &Path,
        service: &str,
        runlevel: &str,
    ) -> Result<(), StoreError> {
        if runlevel == crate::constants::BOOT_RUNLEVEL {
            let resolved = self.resolve(service)?;
            if !resolved.starts_with(&self.roots.system_scope) {
                return Err(StoreError::BootRunlevelForbidden {
                    service: service.to_string(),
                });
            }
        }

        let dir = runlevels_root.join(runlevel);
        self.ensure_dir(&dir)?;
        let link = dir.join(service);
        if link.exists() || fs::symlink_metadata(&link).is_ok() {
            return Ok(());
        }
        let target = self.resolve(service)?;
        symlink(&target, &link)?;
        Ok(())
    }

    /// `delete(service, runlevel)`: remove the membership symlink.
    pub fn delete(
        &self,
        runlevels_root: &Path,
        service: &str,
        runlevel: &str,
    ) -> Result<(), StoreError> {
        let link = runlevels_root.join(runlevel).join(service);
        match fs::remove_file(&link) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// `state_get(service)`: scan for presence of the state directories.
    /// Returns the set of modifier/primary bits currently set. Callers in
    /// `service.rs` interpret "at most one primary bit" as an invariant, not
    /// something this read enforces.
    pub fn state_get(&self, service: &str) -> Vec<StateDir> {
        StateDir::ALL
            .into_iter()
            .filter(|s| self.state_dir_path(*s).join(service).exists())
            .collect()
    }

    /// `mark(service, state)`: create the membership symlink for `state`,
    /// atomically from the caller's perspective since callers hold the
    /// exclusive lock. Does not clear other state bits; callers clear the
    /// previous primary bit themselves via `unmark`.
    pub fn mark(&self, service: &str, state: StateDir, target: &Path) -> Result<(), StoreError> {
        let dir = self.state_dir_path(state);
        self.ensure_dir(&dir)?;
        let link = dir.join(service);
        let _ = fs::remove_file(&link);
        symlink(target, &link)?;
        Ok(())
    }

    pub fn unmark(&self, service: &str, state: StateDir) -> Result<(), StoreError> {
        let link = self.state_dir_path(state).join(service);
        match fs::remove_file(&link) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn options_dir(&self, service: &str) -> PathBuf {
        self.base.join(OPTIONS_DIR).join(service)
    }

    /// `value_get(service, key)`.
    pub fn value_get(&self, service: &str, key: &str) -> Option<String> {
        fs::read_to_string(self.options_dir(service).join(key))
            .ok()
            .map(|s| s.trim_end_matches('\n').to_string())
    }

    /// `value_set(service, key, value)`: file per key; `None` removes;
    /// creates the parent directory if absent.
    pub fn value_set(
        &self,
        service: &str,
        key: &str,
        value: Option<&str>,
    ) -> Result<(), StoreError> {
        let dir = self.options_dir(service);
        match value {
            Some(v) => {
                self.ensure_dir(&dir)?;
                fs::write(dir.join(key), v)?;
            }
            None => {
                let _ = fs::remove_file(dir.join(key));
            }
        }
        Ok(())
    }

    /// Removes every option value for a service (terminal-state cleanup,
    /// §3 Lifecycle).
    pub fn clear_options(&self, service: &str) -> Result<(), StoreError> {
        let dir = self.options_dir(service);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn exclusive_lock_path(&self, service: &str) -> PathBuf {
        self.base.join(EXCLUSIVE_DIR).join(service)
    }

    pub fn scheduled_dir(&self, parent: &str) -> PathBuf {
        self.base.join(SCHEDULED_DIR).join(parent)
    }

    pub fn daemons_dir(&self, service: &str) -> PathBuf {
        self.base.join(DAEMONS_DIR).join(service)
    }

    pub fn deptree_path(&self) -> PathBuf {
        self.base.join(DEPTREE_FILE)
    }

    pub fn depconfig_path(&self) -> PathBuf {
        self.base.join(DEPCONFIG_FILE)
    }

    pub fn softlevel_path(&self) -> PathBuf {
        self.base.join(SOFTLEVEL_FILE)
    }

    pub fn prefix_lock_path(&self) -> PathBuf {
        self.base.join(PREFIX_LOCK_FILE)
    }

    pub fn ensure_base_layout(&self) -> Result<(), StoreError> {
        self.ensure_dir(&self.base)?;
        for dir in STATE_DIR_NAMES {
            self.ensure_dir(&self.base.join(dir))?;
        }
        self.ensure_dir(&self.base.join(EXCLUSIVE_DIR))?;
        self.ensure_dir(&self.base.join(SCHEDULED_DIR))?;
        self.ensure_dir(&self.base.join(OPTIONS_DIR))?;
        self.ensure_dir(&self.base.join(DAEMONS_DIR))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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
    fn resolve_finds_system_scope_service() {
        let (_temp, store) = test_store();
        fs::write(store.roots.system_scope.join("foo"), "#!/bin/sh\n").unwrap();
        let resolved = store.resolve("foo").unwrap();
        assert_eq!(resolved, store.roots.system_scope.join("foo"));
    }

    #[test]
    fn resolve_rejects_sh_suffixed_names() {
        let (_temp, store) = test_store();
        let err = store.resolve("foo.sh").unwrap_err();
        assert!(matches!(err, StoreError::ReservedLibraryName(_)));
    }

    #[test]
    fn value_set_then_get_round_trips() {
        let (_temp, store) = test_store();
        store.value_set("foo", "pidfile", Some("/run/foo.pid")).unwrap();
        assert_eq!(
            store.value_get("foo", "pidfile"),
            Some("/run/foo.pid".to_string())
        );
        store.value_set("foo", "pidfile", None).unwrap();
        assert_eq!(store.value_get("foo", "pidfile"), None);
    }

    #[test]
    fn mark_and_state_get_round_trip() {
        let (_temp, store) = test_store();
        fs::write(store.roots.system_scope.join("foo"), "#!/bin/sh\n").unwrap();
        let target = store.resolve("foo").unwrap();
        store.mark("foo", StateDir::Starting, &target).unwrap();
        assert_eq!(store.state_get("foo"), vec![StateDir::Starting]);
        store.unmark("foo", StateDir::Starting).unwrap();
        assert!(store.state_get("foo").is_empty());
    }

    #[test]
    fn add_to_boot_runlevel_requires_system_scope() {
        let (temp, store) = test_store();
        let runlevels = temp.path().join("runlevels");
        fs::write(store.roots.local_override.join("bar"), "x").unwrap_or(());
        fs::create_dir_all(&store.roots.local_override).unwrap();
        fs::write(store.roots.local_override.join("bar"), "x").unwrap();
        let err = store.add(&runlevels, "bar", "boot").unwrap_err();
        assert!(matches!(err, StoreError::BootRunlevelForbidden { .. }));
    }
}
