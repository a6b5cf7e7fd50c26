//! Minimal configuration/bootstrap layer (§12 ambient stack): resolves the
//! base service directory, the init-script search roots, and the
//! system-type tag from a small YAML file or `RC_*` environment variables.
//!
//! Narrowed from the teacher's `config.rs` (`Config`/`load_config`) to this
//! subject matter: full shell `key=value` service-file parsing is not
//! reimplemented here (out of scope as a feature; see §12). Deptree
//! cache-freshness (§4.2 cache validity) is decided by mtime comparison
//! rather than content hashing, mirroring the original's `rc_deptree_update`.

use crate::error::ConfigError;
use crate::store::SearchRoots;
use serde::Deserialize;
use std::{
    env, fs, io,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

/// The on-disk bootstrap file (defaults to `rcinit.yaml`). Every field is
/// optional: an absent value falls back first to the matching `RC_*`
/// environment variable, then to the current `runtime::RuntimeMode`'s
/// built-in default.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    /// Base service directory (C1's `Store` root).
    pub base_dir: Option<String>,
    /// User-scope init-script directory, only consulted in user mode.
    pub user_scope: Option<String>,
    /// System-scope init-script directory.
    pub system_scope: Option<String>,
    /// Local admin override directory.
    pub local_override: Option<String>,
    /// Package-installed directory, searched last.
    pub package_installed: Option<String>,
    /// System-type tag consulted by platform pruning (§4.2), e.g. `"Linux"`.
    pub system_tag: Option<String>,
}

impl Config {
    /// Loads `path` if it exists; a missing file is not an error, since the
    /// bootstrap contract is satisfied by environment variables and runtime
    /// defaults alone (§12).
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let mut config = if path.exists() {
            let text = fs::read_to_string(path)?;
            serde_yaml::from_str(&text)?
        } else {
            Config::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if self.base_dir.is_none() {
            self.base_dir = env::var("RC_STATE_DIR").ok();
        }
        if self.user_scope.is_none() {
            self.user_scope = env::var("RC_USER_SERVICES").ok();
        }
        if self.system_scope.is_none() {
            self.system_scope = env::var("RC_LIBEXECDIR").ok();
        }
        if self.system_tag.is_none() {
            self.system_tag = env::var("RC_SYS").ok();
        }
    }

    /// Builds the C1 search roots this config describes, falling back to
    /// `defaults` (the current runtime mode's built-in roots) for any field
    /// left unset.
    pub fn search_roots(&self, defaults: &SearchRoots) -> SearchRoots {
        SearchRoots {
            user_scope: self
                .user_scope
                .clone()
                .map(PathBuf::from)
                .or_else(|| defaults.user_scope.clone()),
            system_scope: self
                .system_scope
                .clone()
                .map(PathBuf::from)
                .unwrap_or_else(|| defaults.system_scope.clone()),
            local_override: self
                .local_override
                .clone()
                .map(PathBuf::from)
                .unwrap_or_else(|| defaults.local_override.clone()),
            package_installed: self
                .package_installed
                .clone()
                .map(PathBuf::from)
                .unwrap_or_else(|| defaults.package_installed.clone()),
        }
    }

    /// Resolves the base service directory, falling back to `default` when
    /// unset.
    pub fn base_dir(&self, default: &Path) -> PathBuf {
        self.base_dir
            .clone()
            .map(PathBuf::from)
            .unwrap_or_else(|| default.to_path_buf())
    }

    /// Resolves the system-type tag, falling back to `default` when unset.
    pub fn system_tag(&self, default: &str) -> String {
        self.system_tag.clone().unwrap_or_else(|| default.to_string())
    }
}

/// Newest modification time among the deptree cache's declared inputs
/// (§4.2 cache validity): the init-script search roots, the main config
/// file, the user-config file (user mode only), and every path listed in
/// `depconfig`. `None` means none of the inputs could be stat'd.
pub fn newest_input_mtime(
    roots: &SearchRoots,
    user_mode: bool,
    config_path: &Path,
    user_config_path: Option<&Path>,
    depconfig_paths: &[PathBuf],
) -> Option<SystemTime> {
    let mut inputs: Vec<PathBuf> = vec![
        roots.system_scope.clone(),
        roots.local_override.clone(),
        roots.package_installed.clone(),
        config_path.to_path_buf(),
    ];
    if user_mode {
        if let Some(scope) = &roots.user_scope {
            inputs.push(scope.clone());
        }
        if let Some(user_config) = user_config_path {
            inputs.push(user_config.to_path_buf());
        }
    }
    inputs.extend(depconfig_paths.iter().cloned());

    inputs.iter().filter_map(|path| newest_mtime(path)).max()
}

/// Modification time of `path`, or the newest modification time of any file
/// found under it when `path` is a directory (recursively). Missing paths
/// contribute nothing, since a `depconfig`/root entry may legitimately no
/// longer exist.
fn newest_mtime(path: &Path) -> Option<SystemTime> {
    let metadata = fs::metadata(path).ok()?;
    if !metadata.is_dir() {
        return metadata.modified().ok();
    }

    let mut newest = metadata.modified().ok();
    for entry in fs::read_dir(path).ok()?.flatten() {
        if let Some(mtime) = newest_mtime(&entry.path()) {
            newest = Some(newest.map_or(mtime, |n| n.max(mtime)));
        }
    }
    newest
}

/// Cache validity (§4.2): the `deptree` cache is stale if it is older than
/// any file under the init-script roots, the main config file, the
/// user-config file (user mode only), or any `depconfig`-listed path. A
/// missing cache file is always stale.
pub fn cache_is_stale(
    cache_path: &Path,
    roots: &SearchRoots,
    user_mode: bool,
    config_path: &Path,
    user_config_path: Option<&Path>,
    depconfig_paths: &[PathBuf],
) -> bool {
    let Ok(cache_modified) = fs::metadata(cache_path).and_then(|m| m.modified()) else {
        return true;
    };
    match newest_input_mtime(roots, user_mode, config_path, user_config_path, depconfig_paths) {
        Some(newest) => newest > cache_modified,
        None => false,
    }
}

/// Clock-skew guard (§4.2): after a rebuild, if the cache's mtime is still
/// behind `newest_input` (a clock running backwards, or a filesystem with
/// coarse mtime resolution), drop a marker file next to the cache and force
/// its mtime one second past `newest_input`. Returns whether skew was
/// detected and corrected.
pub fn force_cache_mtime_forward(cache_path: &Path, newest_input: SystemTime) -> io::Result<bool> {
    let cache_modified = fs::metadata(cache_path)?.modified()?;
    if cache_modified > newest_input {
        return Ok(false);
    }

    let marker = cache_path.with_extension("skew");
    fs::write(&marker, b"")?;
    let forced = newest_input + Duration::from_secs(1);
    fs::File::open(cache_path)?.set_modified(forced)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::env_lock;

    #[test]
    fn load_missing_file_succeeds_with_defaults() {
        let _guard = env_lock();
        unsafe {
            env::remove_var("RC_STATE_DIR");
            env::remove_var("RC_SYS");
        }
        let config = Config::load(Path::new("/nonexistent/rcinit.yaml")).unwrap();
        assert!(config.base_dir.is_none());
    }

    #[test]
    fn search_roots_fills_unset_fields_from_defaults() {
        let defaults = SearchRoots {
            user_scope: Some(PathBuf::from("/home/u/.config/rcinit/init.d")),
            system_scope: PathBuf::from("/etc/rcinit/init.d"),
            local_override: PathBuf::from("/usr/local/lib/rcinit/init.d"),
            package_installed: PathBuf::from("/usr/lib/rcinit/init.d"),
        };
        let config = Config::default();
        let roots = config.search_roots(&defaults);
        assert_eq!(roots.system_scope, defaults.system_scope);
        assert_eq!(roots.user_scope, defaults.user_scope);
    }

    #[test]
    fn base_dir_falls_back_to_default_when_unset() {
        let config = Config::default();
        let default = PathBuf::from("/var/lib/rcinit");
        assert_eq!(config.base_dir(&default), default);
    }

    fn empty_roots() -> SearchRoots {
        SearchRoots {
            user_scope: None,
            system_scope: PathBuf::from("/nonexistent/system.d"),
            local_override: PathBuf::from("/nonexistent/local.d"),
            package_installed: PathBuf::from("/nonexistent/pkg.d"),
        }
    }

    #[test]
    fn cache_is_stale_when_cache_file_is_missing() {
        let temp = tempfile::tempdir().unwrap();
        let cache_path = temp.path().join("deptree");
        let config_path = temp.path().join("rcinit.yaml");
        fs::write(&config_path, "").unwrap();
        assert!(cache_is_stale(&cache_path, &empty_roots(), false, &config_path, None, &[]));
    }

    #[test]
    fn cache_is_stale_when_an_init_root_is_newer() {
        let temp = tempfile::tempdir().unwrap();
        let cache_path = temp.path().join("deptree");
        fs::write(&cache_path, "depinfo_0_service='a'").unwrap();

        let config_path = temp.path().join("rcinit.yaml");
        fs::write(&config_path, "").unwrap();

        std::thread::sleep(Duration::from_millis(20));
        let root = temp.path().join("init.d");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("a"), "").unwrap();

        let mut roots = empty_roots();
        roots.system_scope = root;
        assert!(cache_is_stale(&cache_path, &roots, false, &config_path, None, &[]));
    }

    #[test]
    fn cache_is_not_stale_when_newer_than_every_input() {
        let temp = tempfile::tempdir().unwrap();
        let config_path = temp.path().join("rcinit.yaml");
        fs::write(&config_path, "").unwrap();

        std::thread::sleep(Duration::from_millis(20));
        let cache_path = temp.path().join("deptree");
        fs::write(&cache_path, "depinfo_0_service='a'").unwrap();

        assert!(!cache_is_stale(&cache_path, &empty_roots(), false, &config_path, None, &[]));
    }

    #[test]
    fn force_cache_mtime_forward_writes_marker_and_advances_mtime() {
        let temp = tempfile::tempdir().unwrap();
        let cache_path = temp.path().join("deptree");
        fs::write(&cache_path, "depinfo_0_service='a'").unwrap();
        let stale_mtime = fs::metadata(&cache_path).unwrap().modified().unwrap();
        let newest_input = stale_mtime + Duration::from_secs(5);

        let corrected = force_cache_mtime_forward(&cache_path, newest_input).unwrap();
        assert!(corrected);
        assert!(temp.path().join("deptree.skew").exists());
        let forced = fs::metadata(&cache_path).unwrap().modified().unwrap();
        assert!(forced > newest_input);
    }
}
