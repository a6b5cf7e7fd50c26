//! Shared constants: the closed dependency-kind enumeration, reserved
//! runlevel names, and the timing constants used throughout the core.

use std::time::Duration;
use strum_macros::{EnumIter, EnumString};

// ============================================================================
// Dependency kinds
// ============================================================================

/// The fourteen dependency-kind names used by the deptree cache and by the
/// in-memory graph. Kept as a closed enumeration with a bijective name table
/// rather than loose strings (see the "duck typing" design note).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum DepType {
    #[strum(serialize = "ineed")]
    INeed,
    #[strum(serialize = "needsme")]
    NeedsMe,
    #[strum(serialize = "iuse")]
    IUse,
    #[strum(serialize = "usesme")]
    UsesMe,
    #[strum(serialize = "iwant")]
    IWant,
    #[strum(serialize = "wantsme")]
    WantsMe,
    #[strum(serialize = "iafter")]
    IAfter,
    #[strum(serialize = "afterme")]
    AfterMe,
    #[strum(serialize = "ibefore")]
    IBefore,
    #[strum(serialize = "beforeme")]
    BeforeMe,
    #[strum(serialize = "iprovide")]
    IProvide,
    #[strum(serialize = "providedby")]
    ProvidedBy,
    #[strum(serialize = "broken")]
    Broken,
    #[strum(serialize = "keyword")]
    Keyword,
}

impl DepType {
    /// Returns the deptree cache name for this dependency kind, e.g. `"ineed"`.
    pub const fn cache_name(&self) -> &'static str {
        match self {
            Self::INeed => "ineed",
            Self::NeedsMe => "needsme",
            Self::IUse => "iuse",
            Self::UsesMe => "usesme",
            Self::IWant => "iwant",
            Self::WantsMe => "wantsme",
            Self::IAfter => "iafter",
            Self::AfterMe => "afterme",
            Self::IBefore => "ibefore",
            Self::BeforeMe => "beforeme",
            Self::IProvide => "iprovide",
            Self::ProvidedBy => "providedby",
            Self::Broken => "broken",
            Self::Keyword => "keyword",
        }
    }

    /// The forward dependency kinds that participate in the graph proper
    /// (`broken` and `keyword` are per-node attribute sets, not edges).
    pub const FORWARD_EDGE_KINDS: [DepType; 6] = [
        Self::INeed,
        Self::IUse,
        Self::IWant,
        Self::IAfter,
        Self::IBefore,
        Self::IProvide,
    ];

    /// Returns the reverse kind for a forward kind, if this is one of the six
    /// forward kinds that has a defined reverse (§3 edge table).
    pub const fn reverse(&self) -> Option<DepType> {
        match self {
            Self::INeed => Some(Self::NeedsMe),
            Self::NeedsMe => Some(Self::INeed),
            Self::IUse => Some(Self::UsesMe),
            Self::UsesMe => Some(Self::IUse),
            Self::IWant => Some(Self::WantsMe),
            Self::WantsMe => Some(Self::IWant),
            Self::IAfter => Some(Self::BeforeMe),
            Self::BeforeMe => Some(Self::IAfter),
            Self::IBefore => Some(Self::AfterMe),
            Self::AfterMe => Some(Self::IBefore),
            Self::IProvide => Some(Self::ProvidedBy),
            Self::ProvidedBy => Some(Self::IProvide),
            Self::Broken | Self::Keyword => None,
        }
    }
}

/// Cost ordering used by cycle-breaking (§4.2): `use < after < need < providedby`.
/// Lower is "cheaper to drop".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LoopCost {
    Use = 0,
    After = 1,
    Need = 2,
    ProvidedBy = 3,
}

impl LoopCost {
    /// Maps an aggregate adjacency-matrix kind to its cost tier.
    pub const fn of(kind: AggregateKind) -> Self {
        match kind {
            AggregateKind::Use => Self::Use,
            AggregateKind::After => Self::After,
            AggregateKind::Need => Self::Need,
            AggregateKind::ProvidedBy => Self::ProvidedBy,
        }
    }

    /// Whether an edge of this cost is droppable by cycle-breaking (`use` or
    /// `after`, i.e. cost <= `After`).
    pub const fn droppable(&self) -> bool {
        matches!(self, Self::Use | Self::After)
    }
}

/// The four aggregate adjacency kinds the cycle-breaking bit matrices track
/// (§9 Design Note).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateKind {
    Use,
    After,
    Need,
    ProvidedBy,
}

pub const AGGREGATE_KINDS: [AggregateKind; 4] = [
    AggregateKind::Use,
    AggregateKind::After,
    AggregateKind::Need,
    AggregateKind::ProvidedBy,
];

/// Reserved runlevel names (§3).
pub const RESERVED_RUNLEVELS: [&str; 6] =
    ["sysinit", "boot", "single", "shutdown", "default", "reboot"];

pub const BOOT_RUNLEVEL: &str = "boot";

// ============================================================================
// Cycle breaking
// ============================================================================

/// Maximum number of cycle-breaking iterations before `tryfix` gives up
/// (§4.2, §7 "retries").
pub const LOOPSOLVER_LIMIT: usize = 128;

// ============================================================================
// Runscript driver timeouts (§4.4, §5)
// ============================================================================

/// Soft timeout: re-emit a "still waiting" line.
pub const WARN_TIMEOUT: Duration = Duration::from_secs(10);

/// Hard timeout: SIGKILL the verb body.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Keywords that disable both runscript timeouts (fsck-like bodies).
pub const TIMEOUT_DISABLE_KEYWORDS: [&str; 2] = ["-timeout", "notimeout"];

// ============================================================================
// Daemon supervisor (§4.5)
// ============================================================================

/// Default respawn-max when not configured.
pub const DEFAULT_RESPAWN_MAX: u32 = 10;

/// Grace period between SIGTERM and SIGKILL, both for verb timeouts and for
/// supervisor shutdown.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// ============================================================================
// On-disk layout (§6)
// ============================================================================

pub const STATE_DIR_NAMES: [&str; 7] = [
    "started",
    "starting",
    "stopping",
    "inactive",
    "wasinactive",
    "failed",
    "hotplugged",
];

pub const EXCLUSIVE_DIR: &str = "exclusive";
pub const SCHEDULED_DIR: &str = "scheduled";
pub const OPTIONS_DIR: &str = "options";
pub const DAEMONS_DIR: &str = "daemons";
pub const DEPTREE_FILE: &str = "deptree";
pub const DEPCONFIG_FILE: &str = "depconfig";
pub const SOFTLEVEL_FILE: &str = "softlevel";
pub const PREFIX_LOCK_FILE: &str = "prefix.lock";

/// Daemon option-value keys persisted under `options/<svc>/` (§6.1,
/// grounded on `supervise.c`'s `spawn_child`).
pub const VALUE_START_TIME: &str = "start_time";
pub const VALUE_START_COUNT: &str = "start_count";
pub const VALUE_RESPAWN_COUNT: &str = "respawn_count";

// ============================================================================
// In-process lock ordering
// ============================================================================

/// Ordering discipline for the in-process maps a single driver or supervisor
/// process holds alongside the file-level `exclusive/<svc>` flock (§6.1).
/// Adapted from the teacher's `DaemonLock` enum: locks must be acquired in
/// ascending priority order to avoid deadlocks between, e.g., the pid table
/// and the restart-count table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum InProcessLock {
    PidTable = 1,
    RestartCounts = 2,
    ScheduledIntents = 3,
}

impl InProcessLock {
    pub const fn priority(&self) -> u8 {
        *self as u8
    }
}
