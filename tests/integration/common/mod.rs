#![allow(dead_code)]

use std::{
    env, fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use rcinit::runtime::{self, RuntimeMode};
use rcinit::store::{SearchRoots, Store};

/// Points `HOME` at a fresh tempdir and re-derives the runtime context for
/// user mode, mirroring the teacher's `HomeEnvGuard`. Held for the lifetime
/// of a test to serialize access to the shared `HOME`/runtime globals.
pub struct HomeEnvGuard {
    previous: Option<String>,
    _lock: std::sync::MutexGuard<'static, ()>,
}

impl HomeEnvGuard {
    pub fn set(home: &Path) -> Self {
        let lock = rcinit::test_utils::env_lock();
        let previous = env::var("HOME").ok();
        unsafe {
            env::set_var("HOME", home);
        }
        runtime::init(RuntimeMode::User);
        Self { previous, _lock: lock }
    }
}

impl Drop for HomeEnvGuard {
    fn drop(&mut self) {
        match &self.previous {
            Some(value) => unsafe { env::set_var("HOME", value) },
            None => unsafe { env::remove_var("HOME") },
        }
        runtime::init(RuntimeMode::User);
    }
}

/// Builds a `Store` rooted at `base`, with every search root also under
/// `base` so a test can drop init scripts next to the state tree.
pub fn test_store(base: &Path) -> Store {
    let roots = SearchRoots {
        user_scope: Some(base.join("init.d")),
        system_scope: base.join("init.d"),
        local_override: base.join("init.d"),
        package_installed: base.join("init.d"),
    };
    fs::create_dir_all(base.join("init.d")).expect("create init.d");
    let store = Store::new(base.join("state"), roots, true);
    store.ensure_base_layout().expect("ensure base layout");
    store
}

/// Writes an executable init script at `dir/name` whose verb bodies are the
/// `case` arms in `body` (e.g. `"start) exit 0 ;; stop) exit 0 ;;"`).
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    let contents = format!("#!/bin/sh\ncase \"$1\" in\n{body}\n*) exit 0 ;;\nesac\n");
    fs::write(&path, contents).expect("write init script");
    let mut perms = fs::metadata(&path).expect("stat init script").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).expect("chmod init script");
    path
}
