//! Runscript Driver (C4): verb dispatch, environment filtering, the exec
//! protocol for verb bodies, timeout enforcement, signal policy, plug
//! policy, and output prefixing (§4.4).
//!
//! The per-verb control flow and signal-policy ordering is grounded on
//! `original_source/src/openrc-run/openrc-run.c`. The self-pipe/poll idiom
//! for learning a child's exit status while still servicing signals is
//! grounded on the teacher's `supervisor.rs` poll loop over multiple fds,
//! reused here at a smaller scale (one child at a time rather than a
//! long-lived daemon).

use crate::constants::{TIMEOUT_DISABLE_KEYWORDS, WAIT_TIMEOUT, WARN_TIMEOUT};
use crate::depgraph::Graph;
use crate::error::TransientRuntimeError;
use crate::service::{self, LockFailurePolicy, PrimaryState, Transition};
use crate::store::Store;
use fs2::FileExt;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{close, execv, fork, pipe, ForkResult, Pid};
use std::collections::HashMap;
use std::ffi::CString;
use std::fs::OpenOptions;
use std::io::Write as IoWrite;
use std::os::unix::io::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

// ============================================================================
// Environment filtering (§4.4 step 2)
// ============================================================================

const ALLOWED_ENV_BASE: &[&str] = &[
    "EERROR_QUIET",
    "EINFO_QUIET",
    "IN_BACKGROUND",
    "IN_DRYRUN",
    "IN_HOTPLUG",
    "RC_DEBUG",
    "RC_NODEPS",
    "RC_USER_SERVICES",
    "LANG",
    "LC_MESSAGES",
    "TERM",
    "EINFO_COLOR",
    "EINFO_VERBOSE",
];

const ALLOWED_ENV_USER_MODE: &[&str] = &[
    "USER",
    "LOGNAME",
    "HOME",
    "SHELL",
    "XDG_RUNTIME_DIR",
    "XDG_CONFIG_HOME",
    "XDG_STATE_HOME",
    "XDG_CACHE_HOME",
];

/// Flags drawn from the caller's environment that steer verb dispatch
/// (§4.4 entry contract).
#[derive(Debug, Clone, Default)]
pub struct EnvFlags {
    pub in_background: bool,
    pub in_hotplug: bool,
    pub in_dryrun: bool,
    pub rc_nodeps: bool,
    pub rc_runlevel: Option<String>,
    pub rc_svcname: String,
}

/// Builds the filtered environment for a verb body: the allow-list from the
/// current process environment, user overrides, then unset values filled
/// from `profile_env` (§4.4 step 2-3).
pub fn build_environment(
    flags: &EnvFlags,
    user_mode: bool,
    overrides: &HashMap<String, String>,
    profile_env: &HashMap<String, String>,
    service_path: &Path,
    openrc_pid: Pid,
) -> HashMap<String, String> {
    let mut env = HashMap::new();
    let mut keep: Vec<&str> = ALLOWED_ENV_BASE.to_vec();
    if user_mode {
        keep.extend_from_slice(ALLOWED_ENV_USER_MODE);
    }
    for key in keep {
        if let Ok(value) = std::env::var(key) {
            env.insert(key.to_string(), value);
        }
    }
    for (k, v) in overrides {
        env.insert(k.clone(), v.clone());
    }
    for (k, v) in profile_env {
        env.entry(k.clone()).or_insert_with(|| v.clone());
    }
    env.insert("RC_SVCNAME".to_string(), flags.rc_svcname.clone());
    env.insert("RC_OPENRC_PID".to_string(), openrc_pid.to_string());
    if let Some(path) = std::env::var("PATH").ok() {
        env.insert("PATH".to_string(), path);
    }
    let _ = service_path;
    env
}

// ============================================================================
// Verbs
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Start,
    Stop,
    Restart,
    Zap,
    Status,
    Describe,
    Depend,
    INeed,
    IUse,
    IWant,
    NeedsMe,
    UsesMe,
    WantsMe,
    IAfter,
    IBefore,
    IProvide,
}

impl Verb {
    pub fn is_introspection(self) -> bool {
        matches!(
            self,
            Verb::Depend
                | Verb::INeed
                | Verb::IUse
                | Verb::IWant
                | Verb::NeedsMe
                | Verb::UsesMe
                | Verb::WantsMe
                | Verb::IAfter
                | Verb::IBefore
                | Verb::IProvide
        )
    }
}

// ============================================================================
// Plug policy (§4.4 "Plug policy")
// ============================================================================

/// Glob allow/deny list for `IN_HOTPLUG`. `!`-prefixed tokens are denials and
/// win when matched, regardless of position.
#[derive(Debug, Clone, Default)]
pub struct PlugPolicy {
    tokens: Vec<(bool, String)>,
}

impl PlugPolicy {
    pub fn parse(spec: &str) -> PlugPolicy {
        let tokens = spec
            .split_whitespace()
            .map(|tok| {
                if let Some(rest) = tok.strip_prefix('!') {
                    (true, rest.to_string())
                } else {
                    (false, tok.to_string())
                }
            })
            .collect();
        PlugPolicy { tokens }
    }

    pub fn permits(&self, service_name: &str) -> bool {
        let mut allowed = false;
        for (deny, pattern) in &self.tokens {
            if glob_match(pattern, service_name) {
                if *deny {
                    return false;
                }
                allowed = true;
            }
        }
        allowed
    }
}

fn glob_match(pattern: &str, candidate: &str) -> bool {
    let mut regex_str = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => regex_str.push_str(".*"),
            '?' => regex_str.push('.'),
            c if "\\.+()|[]{}^$".contains(c) => {
                regex_str.push('\\');
                regex_str.push(c);
            }
            c => regex_str.push(c),
        }
    }
    regex_str.push('$');
    regex::Regex::new(&regex_str)
        .map(|re| re.is_match(candidate))
        .unwrap_or(false)
}

// ============================================================================
// Exec protocol (§4.4 "Exec protocol")
// ============================================================================

static SIGCHLD_PIPE_WRITE: AtomicI32 = AtomicI32::new(-1);
static RELOAD_REQUESTED: AtomicBool = AtomicBool::new(false);
static TERMINATE_REQUESTED: AtomicBool = AtomicBool::new(false);
static SKIP_FINAL_MARK: AtomicBool = AtomicBool::new(false);
static WINCH_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigchld(_: libc::c_int) {
    let fd = SIGCHLD_PIPE_WRITE.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = [1u8];
        unsafe {
            libc::write(fd, byte.as_ptr() as *const libc::c_void, 1);
        }
    }
}

extern "C" fn on_sighup(_: libc::c_int) {
    RELOAD_REQUESTED.store(true, Ordering::Relaxed);
}

extern "C" fn on_terminate(_: libc::c_int) {
    TERMINATE_REQUESTED.store(true, Ordering::Relaxed);
}

extern "C" fn on_sigusr1(_: libc::c_int) {
    SKIP_FINAL_MARK.store(true, Ordering::Relaxed);
}

extern "C" fn on_sigwinch(_: libc::c_int) {
    WINCH_REQUESTED.store(true, Ordering::Relaxed);
}

/// Outcome of running a verb body, including the signal-derived flags
/// (§4.4 "Signal policy").
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub status: i32,
    pub skip_final_mark: bool,
    pub reload_requested: bool,
}

/// Options controlling how a verb body is exec'd.
pub struct ExecOptions<'a> {
    pub use_pty: bool,
    pub prefix: Option<&'a str>,
    pub prefix_lock_path: PathBuf,
    pub timeout_disabled: bool,
}

/// Runs the verb body as `service_path verb`, per the exec protocol (§4.4).
pub fn exec_verb_body(
    service_path: &Path,
    verb: &str,
    env: &HashMap<String, String>,
    opts: &ExecOptions,
) -> Result<ExecOutcome, TransientRuntimeError> {
    let (pty_master, pty_slave) = if opts.use_pty {
        let result = nix::pty::openpty(None, None).map_err(|_| TransientRuntimeError::VerbFailed {
            service: path_name(service_path),
            status: -1,
        })?;
        (Some(result.master), Some(result.slave))
    } else {
        (None, None)
    };

    let (pipe_read, pipe_write) = pipe().map_err(|_| TransientRuntimeError::VerbFailed {
        service: path_name(service_path),
        status: -1,
    })?;
    SIGCHLD_PIPE_WRITE.store(pipe_write.as_raw_fd(), Ordering::Relaxed);
    RELOAD_REQUESTED.store(false, Ordering::Relaxed);
    TERMINATE_REQUESTED.store(false, Ordering::Relaxed);
    SKIP_FINAL_MARK.store(false, Ordering::Relaxed);
    WINCH_REQUESTED.store(false, Ordering::Relaxed);

    install_signal_handlers();

    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            drop(pipe_read);
            drop(pipe_write);
            if let (Some(master), Some(slave)) = (&pty_master, &pty_slave) {
                let _ = close(master.as_raw_fd());
                let slave_fd = slave.as_raw_fd();
                let _ = nix::unistd::dup2(slave_fd, 0);
                let _ = nix::unistd::dup2(slave_fd, 1);
                let _ = nix::unistd::dup2(slave_fd, 2);
            }
            let (Ok(path), Ok(verb_c)) = (
                CString::new(service_path.as_os_str().as_encoded_bytes()),
                CString::new(verb),
            ) else {
                std::process::exit(127);
            };
            let argv = [path.clone(), verb_c];
            for (k, _) in std::env::vars() {
                std::env::remove_var(k);
            }
            for (k, v) in env {
                std::env::set_var(k, v);
            }
            let _ = execv(&path, &argv);
            std::process::exit(127);
        }
        Ok(ForkResult::Parent { child }) => {
            // `pipe_write` stays open and owned by this function's scope: the
            // SIGCHLD handler writes into its raw fd (stashed in
            // `SIGCHLD_PIPE_WRITE`) until the supervision loop below returns.
            if let Some(slave) = pty_slave {
                drop(slave);
            }
            let outcome = supervise_verb_child(
                child,
                pipe_read,
                pty_master.as_ref(),
                opts,
                &path_name(service_path),
            );
            SIGCHLD_PIPE_WRITE.store(-1, Ordering::Relaxed);
            outcome
        }
        Err(_) => Err(TransientRuntimeError::VerbFailed {
            service: path_name(service_path),
            status: -1,
        }),
    }
}

fn path_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

fn install_signal_handlers() {
    unsafe {
        let _ = signal(Signal::SIGCHLD, SigHandler::Handler(on_sigchld));
        let _ = signal(Signal::SIGHUP, SigHandler::Handler(on_sighup));
        let _ = signal(Signal::SIGINT, SigHandler::Handler(on_terminate));
        let _ = signal(Signal::SIGTERM, SigHandler::Handler(on_terminate));
        let _ = signal(Signal::SIGQUIT, SigHandler::Handler(on_terminate));
        let _ = signal(Signal::SIGUSR1, SigHandler::Handler(on_sigusr1));
        let _ = signal(Signal::SIGWINCH, SigHandler::Handler(on_sigwinch));
    }
}

fn supervise_verb_child(
    child: Pid,
    pipe_read: OwnedFd,
    pty_master: Option<&OwnedFd>,
    opts: &ExecOptions,
    service_name: &str,
) -> Result<ExecOutcome, TransientRuntimeError> {
    let start = Instant::now();
    let mut warned = false;

    loop {
        if TERMINATE_REQUESTED.load(Ordering::Relaxed) {
            let _ = nix::sys::signal::kill(child, Signal::SIGTERM);
            let _ = waitpid(child, None);
            return Err(TransientRuntimeError::VerbFailed {
                service: service_name.to_string(),
                status: -1,
            });
        }

        if WINCH_REQUESTED.swap(false, Ordering::Relaxed) {
            if let Some(master) = pty_master {
                propagate_winsize(master.as_raw_fd());
            }
        }

        match waitpid(child, Some(nix::sys::wait::WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, status)) => {
                return Ok(ExecOutcome {
                    status,
                    skip_final_mark: SKIP_FINAL_MARK.load(Ordering::Relaxed),
                    reload_requested: RELOAD_REQUESTED.load(Ordering::Relaxed),
                });
            }
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                return Ok(ExecOutcome {
                    status: 128 + sig as i32,
                    skip_final_mark: SKIP_FINAL_MARK.load(Ordering::Relaxed),
                    reload_requested: RELOAD_REQUESTED.load(Ordering::Relaxed),
                });
            }
            _ => {}
        }

        if !opts.timeout_disabled && start.elapsed() > WAIT_TIMEOUT {
            let _ = nix::sys::signal::kill(child, Signal::SIGKILL);
            let _ = waitpid(child, None);
            return Err(TransientRuntimeError::HardTimeoutKilled {
                service: service_name.to_string(),
            });
        }

        let poll_timeout: PollTimeout = if opts.timeout_disabled {
            poll_timeout_from_duration(Duration::from_secs(5))
        } else if !warned {
            poll_timeout_from_duration(WARN_TIMEOUT.saturating_sub(start.elapsed()))
        } else {
            poll_timeout_from_duration(Duration::from_millis(500))
        };

        let borrowed: BorrowedFd = unsafe { BorrowedFd::borrow_raw(pipe_read.as_raw_fd()) };
        let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
        let _ = poll(&mut fds, poll_timeout);

        if !opts.timeout_disabled && !warned && start.elapsed() >= WARN_TIMEOUT {
            warn!(service = service_name, "still waiting for verb body");
            warned = true;
        }
    }
}

/// Converts a wait duration into a millisecond poll timeout, clamped to
/// what `PollTimeout` can represent (nix encodes the timeout in a `u16` of
/// milliseconds).
fn poll_timeout_from_duration(d: Duration) -> PollTimeout {
    let ms = d.as_millis().min(u16::MAX as u128) as u16;
    PollTimeout::from(ms)
}

fn propagate_winsize(master_fd: RawFd) {
    let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
    unsafe {
        if libc::ioctl(0, libc::TIOCGWINSZ, &mut ws) == 0 {
            libc::ioctl(master_fd, libc::TIOCSWINSZ, &ws);
        }
    }
}

/// Writes `line` to the prefixed output stream under `prefix.lock` (§4.4
/// "Output prefix"). ANSI cursor-up sequences (`\x1b[`) are passed through
/// unprefixed so `[ok]` in-place updates still align.
pub fn write_prefixed_line(prefix_lock_path: &Path, prefix: &str, line: &str) -> std::io::Result<()> {
    let lock_file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(prefix_lock_path)?;
    lock_file.lock_exclusive()?;
    let mut stdout = std::io::stdout().lock();
    if line.starts_with("\x1b[") {
        stdout.write_all(line.as_bytes())?;
    } else {
        stdout.write_all(format!("{prefix} | {line}\n").as_bytes())?;
    }
    let _ = lock_file.unlock();
    Ok(())
}

// ============================================================================
// Dependency arbitration (§4.4 start/stop/restart/zap)
// ============================================================================

/// Shared context a `start`/`stop` call needs from C1/C2.
pub struct DriverContext<'a> {
    pub store: &'a Store,
    pub graph: &'a Graph,
    pub flags: &'a EnvFlags,
    pub parallel: bool,
}

fn timeout_disabled_for(graph: &Graph, service: &str) -> bool {
    graph
        .find(service)
        .map(|id| {
            let node = graph.node(id);
            TIMEOUT_DISABLE_KEYWORDS
                .iter()
                .any(|kw| node.keyword.contains(*kw))
        })
        .unwrap_or(false)
}

/// Polls `service::read_state` until none of `targets` are in a pending
/// primary state (`starting`/`stopping`) or `timeout` elapses.
fn wait_for_pending(store: &Store, targets: &[String], timeout: Duration) -> Result<(), TransientRuntimeError> {
    let start = Instant::now();
    loop {
        let still_pending: Vec<&String> = targets
            .iter()
            .filter(|t| {
                matches!(
                    service::read_state(store, t).primary,
                    PrimaryState::Starting | PrimaryState::Stopping
                )
            })
            .collect();
        if still_pending.is_empty() {
            return Ok(());
        }
        if start.elapsed() > timeout {
            return Err(TransientRuntimeError::DependencyTimeout {
                service: still_pending[0].clone(),
                dependency: still_pending[0].clone(),
            });
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

/// `start(service)` per §4.4. Recursively starts `need`/`use`/`want`
/// dependencies first; defers (schedules) when a `need` dependency is
/// `inactive`.
pub fn start(ctx: &DriverContext, service: &str) -> Result<(), TransientRuntimeError> {
    if ctx.flags.in_hotplug {
        // Plug policy is evaluated by the caller (it owns the rc_hotplug
        // config value); by the time `start` is reached here the decision
        // has already been made. Nothing further to check in this module.
    }

    let store = ctx.store;
    let lock = Transition::begin(store, service, LockFailurePolicy::Report, true)
        .map_err(|_| TransientRuntimeError::VerbFailed {
            service: service.to_string(),
            status: -1,
        })?;
    let transition = match lock {
        Ok(t) => t,
        Err(state) if state.primary == PrimaryState::Started => return Ok(()),
        Err(_) => {
            return Err(TransientRuntimeError::VerbFailed {
                service: service.to_string(),
                status: -1,
            })
        }
    };
    transition
        .mark(PrimaryState::Starting)
        .map_err(|_| TransientRuntimeError::VerbFailed {
            service: service.to_string(),
            status: -1,
        })?;

    if let Some(node_id) = ctx.graph.find(service) {
        let node = ctx.graph.node(node_id);
        let needs: Vec<String> = node
            .edge_targets(crate::constants::DepType::INeed)
            .iter()
            .map(|id| ctx.graph.name(*id).to_string())
            .collect();
        let soft: Vec<String> = node
            .edge_targets(crate::constants::DepType::IUse)
            .iter()
            .chain(node.edge_targets(crate::constants::DepType::IWant).iter())
            .map(|id| ctx.graph.name(*id).to_string())
            .collect();
        let deps: Vec<String> = needs.iter().cloned().chain(soft.iter().cloned()).collect();

        let inactive_needs: Vec<String> = needs
            .iter()
            .filter(|dep| service::read_state(store, dep).primary == PrimaryState::Inactive)
            .cloned()
            .collect();
        if !inactive_needs.is_empty() {
            for target in &inactive_needs {
                let target_path = store
                    .resolve(target)
                    .unwrap_or_else(|_| PathBuf::from(target));
                let _ = service::schedule_start(store, service, target, &target_path);
            }
            transition
                .commit(PrimaryState::Stopped)
                .map_err(|_| TransientRuntimeError::VerbFailed {
                    service: service.to_string(),
                    status: -1,
                })?;
            warn!(service, "deferred: inactive need dependency");
            return Ok(());
        }

        // `need` is hard: a failed need dependency must abort this start. `use`
        // and `want` are soft: start them when stopped, but proceed regardless
        // of the outcome (§4.4 dependency table).
        for dep in &needs {
            if service::read_state(store, dep).primary == PrimaryState::Stopped {
                let dep_ctx = DriverContext { store, graph: ctx.graph, flags: ctx.flags, parallel: ctx.parallel };
                start(&dep_ctx, dep).map_err(|_| TransientRuntimeError::VerbFailed {
                    service: service.to_string(),
                    status: -1,
                })?;
            }
        }
        for dep in &soft {
            if service::read_state(store, dep).primary == PrimaryState::Stopped {
                let dep_ctx = DriverContext { store, graph: ctx.graph, flags: ctx.flags, parallel: ctx.parallel };
                let _ = start(&dep_ctx, dep);
            }
        }

        wait_for_pending(store, &deps, WAIT_TIMEOUT)?;
    }

    let timeout_disabled = timeout_disabled_for(ctx.graph, service);
    let service_path = store
        .resolve(service)
        .unwrap_or_else(|_| PathBuf::from(service));
    let opts = ExecOptions {
        use_pty: ctx.parallel,
        prefix: if ctx.parallel { Some(service) } else { None },
        prefix_lock_path: store.prefix_lock_path(),
        timeout_disabled,
    };
    let env = build_environment(
        ctx.flags,
        false,
        &HashMap::new(),
        &HashMap::new(),
        &service_path,
        Pid::this(),
    );

    let outcome = exec_verb_body(&service_path, "start", &env, &opts);

    match outcome {
        Ok(o) if o.status == 0 => {
            if !o.skip_final_mark {
                transition
                    .commit(PrimaryState::Started)
                    .map_err(|_| TransientRuntimeError::VerbFailed {
                        service: service.to_string(),
                        status: o.status,
                    })?;
            }
            for target in service::scheduled_targets(store, service) {
                let target_ctx = DriverContext { store, graph: ctx.graph, flags: ctx.flags, parallel: ctx.parallel };
                let _ = start(&target_ctx, &target);
            }
            info!(service, "started");
            Ok(())
        }
        Ok(o) => Err(TransientRuntimeError::VerbFailed {
            service: service.to_string(),
            status: o.status,
        }),
        Err(e) => Err(e),
    }
}

/// `stop(service)` per §4.4.
pub fn stop(ctx: &DriverContext, service: &str) -> Result<(), TransientRuntimeError> {
    let store = ctx.store;
    let lock = Transition::begin(store, service, LockFailurePolicy::Report, true)
        .map_err(|_| TransientRuntimeError::VerbFailed {
            service: service.to_string(),
            status: -1,
        })?;
    let transition = match lock {
        Ok(t) => t,
        Err(state) if state.primary == PrimaryState::Stopped => return Ok(()),
        Err(_) => {
            return Err(TransientRuntimeError::VerbFailed {
                service: service.to_string(),
                status: -1,
            })
        }
    };
    transition
        .mark(PrimaryState::Stopping)
        .map_err(|_| TransientRuntimeError::VerbFailed {
            service: service.to_string(),
            status: -1,
        })?;

    if let Some(node_id) = ctx.graph.find(service) {
        let node = ctx.graph.node(node_id);
        let dependents: Vec<String> = node
            .edge_targets(crate::constants::DepType::NeedsMe)
            .iter()
            .chain(node.edge_targets(crate::constants::DepType::WantsMe).iter())
            .chain(node.edge_targets(crate::constants::DepType::UsesMe).iter())
            .map(|id| ctx.graph.name(*id).to_string())
            .collect();

        // Stop dependents first: a service cannot be stopped while something
        // that needs/wants/uses it is still running (§4.4).
        for dependent in &dependents {
            if service::read_state(store, dependent).primary == PrimaryState::Started {
                let dependent_ctx = DriverContext { store, graph: ctx.graph, flags: ctx.flags, parallel: ctx.parallel };
                let _ = stop(&dependent_ctx, dependent);
            }
        }
        wait_for_pending(store, &dependents, WAIT_TIMEOUT)?;

        let still_up: Vec<&String> = dependents
            .iter()
            .filter(|d| service::read_state(store, d).primary == PrimaryState::Started)
            .collect();
        let shutdown_in_progress = ctx.flags.rc_runlevel.as_deref() == Some("shutdown");
        if !still_up.is_empty() && !shutdown_in_progress {
            transition.set_failed(true).ok();
            return Err(TransientRuntimeError::VerbFailed {
                service: service.to_string(),
                status: -1,
            });
        }
    }

    let service_path = store
        .resolve(service)
        .unwrap_or_else(|_| PathBuf::from(service));
    let timeout_disabled = timeout_disabled_for(ctx.graph, service);
    let opts = ExecOptions {
        use_pty: ctx.parallel,
        prefix: if ctx.parallel { Some(service) } else { None },
        prefix_lock_path: store.prefix_lock_path(),
        timeout_disabled,
    };
    let env = build_environment(
        ctx.flags,
        false,
        &HashMap::new(),
        &HashMap::new(),
        &service_path,
        Pid::this(),
    );

    match exec_verb_body(&service_path, "stop", &env, &opts) {
        Ok(o) if o.status == 0 => {
            let terminal = if ctx.flags.in_background {
                PrimaryState::Inactive
            } else {
                PrimaryState::Stopped
            };
            transition
                .commit(terminal)
                .map_err(|_| TransientRuntimeError::VerbFailed {
                    service: service.to_string(),
                    status: 0,
                })?;
            info!(service, "stopped");
            Ok(())
        }
        Ok(o) => Err(TransientRuntimeError::VerbFailed {
            service: service.to_string(),
            status: o.status,
        }),
        Err(e) => Err(e),
    }
}

/// `restart(service)`: snapshot started+inactive services, stop, start,
/// then re-start each snapshotted service still stopped (§4.4).
pub fn restart(ctx: &DriverContext, service: &str) -> Result<(), TransientRuntimeError> {
    let snapshot: Vec<String> = ctx
        .graph
        .declared_names()
        .filter(|name| {
            matches!(
                service::read_state(ctx.store, name).primary,
                PrimaryState::Started | PrimaryState::Inactive
            )
        })
        .map(|s| s.to_string())
        .collect();

    stop(ctx, service)?;
    start(ctx, service)?;

    for name in snapshot {
        if service::read_state(ctx.store, &name).primary == PrimaryState::Stopped {
            let _ = start(ctx, &name);
        }
    }
    Ok(())
}

/// `zap(service)`: force-reset to `stopped`, clear the hotplugged marker,
/// never invokes a body (§4.4).
pub fn zap(store: &Store, service: &str) -> Result<(), crate::store::StoreError> {
    for dir in crate::store::StateDir::ALL {
        store.unmark(service, dir)?;
    }
    store.clear_options(service)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_match_supports_star_and_negation() {
        let policy = PlugPolicy::parse("eth* !eth1");
        assert!(policy.permits("eth0"));
        assert!(!policy.permits("eth1"));
        assert!(!policy.permits("wlan0"));
    }

    #[test]
    fn allow_list_env_excludes_unlisted_vars() {
        std::env::set_var("RC_DEBUG", "1");
        std::env::set_var("SOME_UNRELATED_SECRET", "shh");
        let flags = EnvFlags {
            rc_svcname: "foo".to_string(),
            ..Default::default()
        };
        let env = build_environment(
            &flags,
            false,
            &HashMap::new(),
            &HashMap::new(),
            Path::new("/etc/init.d/foo"),
            Pid::this(),
        );
        assert_eq!(env.get("RC_DEBUG"), Some(&"1".to_string()));
        assert!(!env.contains_key("SOME_UNRELATED_SECRET"));
        assert_eq!(env.get("RC_SVCNAME"), Some(&"foo".to_string()));
    }
}
