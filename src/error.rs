//! Error taxonomy (§7). One `thiserror` enum per error kind, composed into a
//! top-level facade, following the teacher's `ProcessManagerError` shape of a
//! facade built from `#[from]`-convertible leaf errors.

use thiserror::Error;

/// Missing/malformed `key=value`, invalid mode string, bad signal name.
/// Fatal to the current operation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("invalid YAML in config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("malformed option '{key}' for service '{service}': {reason}")]
    MalformedOption {
        service: String,
        key: String,
        reason: String,
    },

    #[error("invalid signal name '{0}'")]
    InvalidSignal(String),

    #[error("invalid mode string '{0}'")]
    InvalidMode(String),
}

/// Cycle unsolvable, `need` references a non-existent service, provider has
/// no concrete candidate in strict mode. Fatal at plan time; the plan is not
/// executed.
#[derive(Debug, Error)]
pub enum DependencyError {
    #[error("service '{service}' declares unknown dependency '{dependency}'")]
    UnknownDependency { service: String, dependency: String },

    #[error("unsolvable dependency cycle: {cycle}")]
    UnsolvableCycle { cycle: String },

    #[error("no concrete provider for '{abstract_name}' satisfies service '{service}' in strict mode")]
    NoStrictProvider {
        service: String,
        abstract_name: String,
    },

    #[error("cycle-breaking did not converge after {iterations} iterations")]
    CycleSolverLimitExceeded { iterations: usize },
}

/// Per-service exclusive lock held. Non-fatal if the caller set "ignore lock
/// failure"; otherwise reported with the current state.
#[derive(Debug, Error)]
pub enum LockContention {
    #[error("service '{service}' is already {state}")]
    AlreadyInState { service: String, state: String },

    #[error("failed to acquire exclusive lock for '{service}': {source}")]
    Io {
        service: String,
        #[source]
        source: std::io::Error,
    },
}

/// Timeout waiting on a dependency, body returned non-zero. Service marked
/// `failed` if a runlevel transition is in progress, else reverted.
#[derive(Debug, Error)]
pub enum TransientRuntimeError {
    #[error("timed out waiting for dependency '{dependency}' of service '{service}'")]
    DependencyTimeout { service: String, dependency: String },

    #[error("verb body for service '{service}' exited with status {status}")]
    VerbFailed { service: String, status: i32 },

    #[error("verb body for service '{service}' did not exit within the hard timeout and was killed")]
    HardTimeoutKilled { service: String },
}

/// Respawn budget exceeded, health-check failure persistent. Marks service
/// `crashed`; the supervisor exits 0 without further respawning.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("service '{service}' exceeded respawn-max ({max}) within the respawn window")]
    RespawnBudgetExceeded { service: String, max: u32 },

    #[error("healthcheck for service '{service}' failed persistently")]
    HealthCheckFailed { service: String },

    #[error("notify protocol error for service '{service}': {reason}")]
    NotifyProtocol { service: String, reason: String },

    #[error(transparent)]
    System(#[from] SystemError),
}

/// Syscall failure on `fork`/`exec`/`open`/`fstat`. Propagate with `errno`
/// text; fatal.
#[derive(Debug, Error)]
pub enum SystemError {
    #[error("syscall failed: {0}")]
    Errno(#[from] nix::errno::Errno),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("mutex poisoned: {0}")]
    MutexPoisoned(String),
}

impl<T> From<std::sync::PoisonError<T>> for SystemError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        SystemError::MutexPoisoned(err.to_string())
    }
}

/// Top-level facade composing every error kind in §7, following the
/// teacher's pattern of a facade error type transparently wrapping
/// leaf errors from each subsystem.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Dependency(#[from] DependencyError),

    #[error(transparent)]
    Lock(#[from] LockContention),

    #[error(transparent)]
    Transient(#[from] TransientRuntimeError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    System(#[from] SystemError),
}

impl From<nix::errno::Errno> for CoreError {
    fn from(err: nix::errno::Errno) -> Self {
        CoreError::System(SystemError::Errno(err))
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::System(SystemError::Io(err))
    }
}
