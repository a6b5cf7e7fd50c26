//! Pre-exec privilege and resource adjustments for supervised daemons (§4.5
//! "Spawn phase"). Resolution of the raw option strings into a typed plan is
//! grounded on the teacher's `PrivilegeContext::from_service`/`apply_pre_exec`
//! shape; the individual syscalls (`ionice`, `oom-score-adj`, `scheduler`,
//! `secbits`, `no-new-privs`) are new surface this crate adds per §4.5 and are
//! grounded on `original_source/src/supervise-daemon/supervise-daemon.c`'s
//! pre-exec ordering (`umask` before `chdir` before the user/group switch).

use crate::error::ConfigError;
use libc::{c_int, c_uint, id_t, rlimit, RLIM_INFINITY};
use nix::unistd::{getgid, getuid, Group, User};
use std::collections::HashMap;
use std::ffi::CString;
use std::io;
use std::path::PathBuf;
use tracing::warn;

#[cfg(target_os = "linux")]
use caps::{errors::CapsError, CapSet, Capability};
#[cfg(target_os = "linux")]
use std::str::FromStr;

/// One of the six POSIX/Linux scheduling policies the `scheduler` option
/// accepts, or a raw numeric policy (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheduler {
    Fifo,
    RoundRobin,
    Other,
    Batch,
    Idle,
    Raw(i32),
}

impl Scheduler {
    pub fn parse(spec: &str) -> Result<Scheduler, ConfigError> {
        match spec {
            "fifo" => Ok(Scheduler::Fifo),
            "rr" => Ok(Scheduler::RoundRobin),
            "other" => Ok(Scheduler::Other),
            "batch" => Ok(Scheduler::Batch),
            "idle" => Ok(Scheduler::Idle),
            other => other
                .parse::<i32>()
                .map(Scheduler::Raw)
                .map_err(|_| ConfigError::MalformedOption {
                    service: String::new(),
                    key: "scheduler".to_string(),
                    reason: format!("unrecognised scheduler '{other}'"),
                }),
        }
    }

    #[cfg(target_os = "linux")]
    fn to_raw(self) -> c_int {
        match self {
            Scheduler::Fifo => libc::SCHED_FIFO,
            Scheduler::RoundRobin => libc::SCHED_RR,
            Scheduler::Other => libc::SCHED_OTHER,
            Scheduler::Batch => libc::SCHED_BATCH,
            Scheduler::Idle => libc::SCHED_IDLE,
            Scheduler::Raw(n) => n,
        }
    }
}

/// `"class:data"` ionice specifier (§4.5 setup phase step 1).
#[derive(Debug, Clone, Copy)]
pub struct IoNice {
    pub class: u32,
    pub data: u32,
}

impl IoNice {
    pub fn parse(spec: &str) -> Result<IoNice, ConfigError> {
        let (class, data) = spec.split_once(':').ok_or_else(|| ConfigError::MalformedOption {
            service: String::new(),
            key: "ionice".to_string(),
            reason: format!("expected 'class:data', got '{spec}'"),
        })?;
        let class = class
            .parse()
            .map_err(|_| ConfigError::MalformedOption {
                service: String::new(),
                key: "ionice".to_string(),
                reason: format!("invalid class '{class}'"),
            })?;
        let data = data
            .parse()
            .map_err(|_| ConfigError::MalformedOption {
                service: String::new(),
                key: "ionice".to_string(),
                reason: format!("invalid data '{data}'"),
            })?;
        Ok(IoNice { class, data })
    }
}

/// Target user/group/supplementary-groups metadata resolved from the
/// `"user[:group]"` option, plus environment overrides for the switched
/// account (`HOME`, `USER`, `LOGNAME`, `SHELL`).
#[derive(Debug, Clone, Default)]
pub struct UserContext {
    uid: Option<libc::uid_t>,
    gid: Option<libc::gid_t>,
    supplementary: Vec<libc::gid_t>,
    home: Option<PathBuf>,
    shell: Option<PathBuf>,
    username: Option<String>,
}

impl UserContext {
    /// Parses `"user[:group]"` and resolves both accounts via `getpwnam`/
    /// `getgrnam`, filling in the primary group from the user's passwd
    /// entry when no explicit group is given.
    pub fn resolve(spec: &str) -> io::Result<UserContext> {
        let (user_name, group_name) = match spec.split_once(':') {
            Some((u, g)) => (u, Some(g)),
            None => (spec, None),
        };

        let user = User::from_name(user_name)
            .map_err(|err| io::Error::other(err.to_string()))?
            .ok_or_else(|| io::Error::other(format!("user '{user_name}' not found")))?;

        let mut ctx = UserContext {
            uid: Some(user.uid.as_raw()),
            gid: Some(user.gid.as_raw()),
            home: Some(user.dir),
            shell: Some(user.shell),
            username: Some(user.name),
            supplementary: Vec::new(),
        };

        if let Some(group_name) = group_name {
            let group = Group::from_name(group_name)
                .map_err(|err| io::Error::other(err.to_string()))?
                .ok_or_else(|| io::Error::other(format!("group '{group_name}' not found")))?;
            ctx.gid = Some(group.gid.as_raw());
        }

        Ok(ctx)
    }

    pub fn env_overrides(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();
        if let Some(home) = &self.home {
            env.insert("HOME".to_string(), home.display().to_string());
        }
        if let Some(username) = &self.username {
            env.insert("USER".to_string(), username.clone());
            env.insert("LOGNAME".to_string(), username.clone());
        }
        if let Some(shell) = &self.shell {
            env.insert("SHELL".to_string(), shell.display().to_string());
        }
        env
    }
}

/// Everything `apply_pre_exec` needs, resolved once in the parent before
/// `fork` (§4.5 setup phase).
#[derive(Debug, Clone, Default)]
pub struct PreExecPlan {
    pub user: Option<UserContext>,
    pub chroot: Option<PathBuf>,
    pub chdir: Option<PathBuf>,
    pub umask: Option<u32>,
    pub nicelevel: Option<i32>,
    pub ionice: Option<IoNice>,
    pub oom_score_adj: Option<i32>,
    pub scheduler: Option<Scheduler>,
    pub scheduler_priority: Option<i32>,
    pub capabilities: Vec<String>,
    pub secbits: Option<u32>,
    pub no_new_privs: bool,
}

impl PreExecPlan {
    /// Executes every adjustment in the order §4.5 specifies: umask,
    /// nicelevel, ionice, oom-score-adj, scheduler, capabilities IAB,
    /// secure-bits, no-new-privs; then chroot, chdir; then the group/user
    /// switch.
    ///
    /// # Safety
    /// Call this only between `fork` and `exec` in the child. It mutates
    /// process-wide privilege state and must never run in the supervisor.
    pub unsafe fn apply(&self) -> io::Result<()> {
        if let Some(mask) = self.umask {
            unsafe {
                libc::umask(mask as libc::mode_t);
            }
        }

        if let Some(nice) = self.nicelevel {
            self.apply_nice(nice)?;
        }

        if let Some(ionice) = self.ionice {
            self.apply_ionice(ionice);
        }

        if let Some(adj) = self.oom_score_adj {
            self.apply_oom_score_adj(adj);
        }

        if let Some(scheduler) = self.scheduler {
            self.apply_scheduler(scheduler);
        }

        self.apply_capabilities_pre_user()?;
        self.apply_secbits();
        if self.no_new_privs {
            self.apply_no_new_privs();
        }

        if let Some(root) = &self.chroot {
            let path = CString::new(root.as_os_str().as_encoded_bytes())
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "chroot path contains NUL"))?;
            if unsafe { libc::chroot(path.as_ptr()) } != 0 {
                return Err(io::Error::last_os_error());
            }
            if unsafe { libc::chdir(c"/".as_ptr()) } != 0 {
                return Err(io::Error::last_os_error());
            }
        }

        if let Some(dir) = &self.chdir {
            let path = CString::new(dir.as_os_str().as_encoded_bytes())
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "chdir path contains NUL"))?;
            if unsafe { libc::chdir(path.as_ptr()) } != 0 {
                return Err(io::Error::last_os_error());
            }
        }

        if let Some(user) = &self.user {
            unsafe {
                self.apply_user_switch(user)?;
            }
        }

        self.apply_capabilities_post_user()?;
        Ok(())
    }

    fn apply_nice(&self, nice: i32) -> io::Result<()> {
        let res = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, nice as c_int) };
        if res != 0 {
            return Err(io::Error::last_os_error());
        }
        #[cfg(target_os = "linux")]
        {
            let _ = std::fs::write("/proc/self/autogroup", nice.to_string());
        }
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn apply_ionice(&self, ionice: IoNice) {
        if let Err(err) = ioprio::set(ionice.class, ionice.data) {
            warn!("failed to set ionice: {err}");
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn apply_ionice(&self, _ionice: IoNice) {
        warn!("ionice requested but unsupported on this platform");
    }

    #[cfg(target_os = "linux")]
    fn apply_oom_score_adj(&self, adj: i32) {
        if let Err(err) = std::fs::write("/proc/self/oom_score_adj", adj.to_string()) {
            warn!("failed to set oom_score_adj: {err}");
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn apply_oom_score_adj(&self, _adj: i32) {
        warn!("oom-score-adj requested but unsupported on this platform");
    }

    #[cfg(target_os = "linux")]
    fn apply_scheduler(&self, scheduler: Scheduler) {
        let param = libc::sched_param {
            sched_priority: self.scheduler_priority.unwrap_or(0),
        };
        let res = unsafe { libc::sched_setscheduler(0, scheduler.to_raw(), &param) };
        if res != 0 {
            warn!(
                "failed to set scheduler policy: {}",
                io::Error::last_os_error()
            );
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn apply_scheduler(&self, _scheduler: Scheduler) {
        warn!("scheduler policy requested but unsupported on this platform");
    }

    fn apply_secbits(&self) {
        let Some(bits) = self.secbits else {
            return;
        };
        #[cfg(target_os = "linux")]
        {
            let res = unsafe { libc::prctl(libc::PR_SET_SECUREBITS, bits as libc::c_ulong, 0, 0, 0) };
            if res != 0 {
                warn!("failed to set secure-bits: {}", io::Error::last_os_error());
            }
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = bits;
            warn!("secbits requested but unsupported on this platform");
        }
    }

    fn apply_no_new_privs(&self) {
        #[cfg(target_os = "linux")]
        {
            let res = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
            if res != 0 {
                warn!("failed to set no-new-privs: {}", io::Error::last_os_error());
            }
        }
        #[cfg(not(target_os = "linux"))]
        {
            warn!("no-new-privs requested but unsupported on this platform");
        }
    }

    unsafe fn apply_user_switch(&self, user: &UserContext) -> io::Result<()> {
        if user.uid.is_none() && user.gid.is_none() && user.supplementary.is_empty() {
            return Ok(());
        }

        if !user.supplementary.is_empty() || user.gid.is_some() {
            let mut buf = user.supplementary.clone();
            buf.insert(0, user.gid.unwrap_or_else(|| getgid().as_raw()));
            let group_len: libc::size_t = buf.len();
            if unsafe { libc::setgroups(group_len, buf.as_ptr()) } != 0 {
                return Err(io::Error::last_os_error());
            }
        }

        if let Some(gid) = user.gid
            && unsafe { libc::setgid(gid as id_t) } != 0
        {
            return Err(io::Error::last_os_error());
        }

        if let Some(uid) = user.uid
            && unsafe { libc::setuid(uid as id_t) } != 0
        {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn apply_capabilities_pre_user(&self) -> io::Result<()> {
        if !getuid().is_root() {
            return Ok(());
        }
        if self.capabilities.is_empty() {
            for set in [
                CapSet::Effective,
                CapSet::Permitted,
                CapSet::Inheritable,
                CapSet::Bounding,
                CapSet::Ambient,
            ] {
                caps::clear(None, set).map_err(caps_err)?;
            }
            return Ok(());
        }

        caps::securebits::set_keepcaps(true).map_err(caps_err)?;
        let caps = parse_caps(&self.capabilities)?;
        for set in [
            CapSet::Effective,
            CapSet::Permitted,
            CapSet::Inheritable,
            CapSet::Bounding,
        ] {
            caps::set(None, set, &caps).map_err(caps_err)?;
        }
        caps::clear(None, CapSet::Ambient).map_err(caps_err)?;
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn apply_capabilities_pre_user(&self) -> io::Result<()> {
        if !self.capabilities.is_empty() {
            warn!("capabilities requested but unsupported on this platform");
        }
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn apply_capabilities_post_user(&self) -> io::Result<()> {
        if self.user.is_none() && !getuid().is_root() {
            return Ok(());
        }
        if self.capabilities.is_empty() {
            caps::clear(None, CapSet::Ambient).map_err(caps_err)?;
            return Ok(());
        }
        let caps = parse_caps(&self.capabilities)?;
        caps::set(None, CapSet::Ambient, &caps).map_err(caps_err)?;
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn apply_capabilities_post_user(&self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn parse_caps(names: &[String]) -> io::Result<std::collections::HashSet<Capability>> {
    let mut set = std::collections::HashSet::with_capacity(names.len());
    for name in names {
        let cap = Capability::from_str(name.trim()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("invalid capability '{name}'"))
        })?;
        set.insert(cap);
    }
    Ok(set)
}

#[cfg(target_os = "linux")]
fn caps_err(err: CapsError) -> io::Error {
    io::Error::other(err.to_string())
}

/// Minimal `ioprio_set(2)` binding. The syscall number is not exposed by
/// every `libc` target, so it is hard-coded per architecture rather than
/// relying on a crate constant that may be absent.
#[cfg(target_os = "linux")]
mod ioprio {
    use libc::{c_int, c_long};
    use std::io;

    #[cfg(target_arch = "x86_64")]
    const SYS_IOPRIO_SET: c_long = 251;
    #[cfg(target_arch = "aarch64")]
    const SYS_IOPRIO_SET: c_long = 30;
    #[cfg(target_arch = "x86")]
    const SYS_IOPRIO_SET: c_long = 289;

    const IOPRIO_WHO_PROCESS: c_int = 1;

    #[cfg(any(
        target_arch = "x86_64",
        target_arch = "aarch64",
        target_arch = "x86"
    ))]
    pub fn set(class: u32, data: u32) -> io::Result<()> {
        let ioprio = ((class as c_int) << 13) | (data as c_int);
        let ret = unsafe { libc::syscall(SYS_IOPRIO_SET, IOPRIO_WHO_PROCESS, 0, ioprio) };
        if ret == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    #[cfg(not(any(
        target_arch = "x86_64",
        target_arch = "aarch64",
        target_arch = "x86"
    )))]
    pub fn set(_class: u32, _data: u32) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "ioprio_set syscall number unknown for this architecture",
        ))
    }
}

pub fn set_rlimit(which: c_int, soft: u64, hard: u64) -> io::Result<()> {
    let rlim = rlimit {
        rlim_cur: if soft == u64::MAX { RLIM_INFINITY } else { soft as libc::rlim_t },
        rlim_max: if hard == u64::MAX { RLIM_INFINITY } else { hard as libc::rlim_t },
    };
    #[cfg(target_os = "linux")]
    let res = unsafe { libc::setrlimit(which as c_uint, &rlim as *const rlimit) };
    #[cfg(not(target_os = "linux"))]
    let res = unsafe { libc::setrlimit(which, &rlim as *const rlimit) };
    if res != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_parse_accepts_named_and_numeric() {
        assert_eq!(Scheduler::parse("fifo").unwrap(), Scheduler::Fifo);
        assert_eq!(Scheduler::parse("idle").unwrap(), Scheduler::Idle);
        assert_eq!(Scheduler::parse("7").unwrap(), Scheduler::Raw(7));
        assert!(Scheduler::parse("bogus").is_err());
    }

    #[test]
    fn ionice_parse_splits_class_and_data() {
        let spec = IoNice::parse("2:4").unwrap();
        assert_eq!(spec.class, 2);
        assert_eq!(spec.data, 4);
        assert!(IoNice::parse("nope").is_err());
    }

    #[test]
    fn user_context_resolve_rejects_unknown_user() {
        let err = UserContext::resolve("definitely-not-a-real-user-xyz").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Other);
    }
}
