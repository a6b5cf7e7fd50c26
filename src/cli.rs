//! Command-line interface: argument definitions only. Dispatch into C2-C5
//! lives in `bin/main.rs`, mirroring the teacher's split between `cli.rs`
//! (clap surface) and `main.rs` (bootstrap + dispatch).

use clap::{Parser, Subcommand};
use std::str::FromStr;
use tracing::level_filters::LevelFilter;

/// Wrapper around `LevelFilter` so clap can parse log levels from either
/// string names ("info", "debug", etc.) or numeric shorthands (0-5).
#[derive(Clone, Copy, Debug)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// String representation suitable for `RUST_LOG`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }

        if let Ok(number) = trimmed.parse::<u8>() {
            let level = match number {
                0 => LevelFilter::OFF,
                1 => LevelFilter::ERROR,
                2 => LevelFilter::WARN,
                3 => LevelFilter::INFO,
                4 => LevelFilter::DEBUG,
                5 => LevelFilter::TRACE,
                _ => return Err(format!("unsupported log level number '{number}' (expected 0-5)")),
            };
            return Ok(LogLevelArg(level));
        }

        let lowercase = trimmed.to_ascii_lowercase();
        let level = match lowercase.as_str() {
            "off" => Some(LevelFilter::OFF),
            "error" | "err" => Some(LevelFilter::ERROR),
            "warn" | "warning" => Some(LevelFilter::WARN),
            "info" | "information" => Some(LevelFilter::INFO),
            "debug" => Some(LevelFilter::DEBUG),
            "trace" => Some(LevelFilter::TRACE),
            _ => None,
        }
        .ok_or_else(|| format!("invalid log level '{trimmed}'"))?;

        Ok(LogLevelArg(level))
    }
}

/// Command-line interface for the service manager core.
#[derive(Parser)]
#[command(name = "rcinit", version, author)]
#[command(about = "Dependency-aware service manager and daemon supervisor core", long_about = None)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// Opt into system-wide mode (the default is per-user).
    #[arg(long = "sys", global = true)]
    pub sys: bool,

    /// Path to the bootstrap config file.
    #[arg(long = "config", global = true, default_value = "rcinit.yaml")]
    pub config: String,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands, each a thin entry point into the runscript driver
/// (C4), the service state machine (C3), or the daemon supervisor (C5).
#[derive(Subcommand)]
pub enum Commands {
    /// Start a service, recursively starting its `need`/`use`/`want`
    /// dependencies first (§4.4).
    Start { service: String },

    /// Stop a service, per the stop-side dependency arbitration (§4.4).
    Stop { service: String },

    /// Restart a service (stop then start).
    Restart { service: String },

    /// Reset a crashed/stuck service back to `stopped` without running its
    /// `stop` verb (§4.4 `zap`).
    Zap { service: String },

    /// Show a service's primary state, modifier bits, and computed `crashed`
    /// bit (§4.3).
    Status {
        /// Service to query; when absent, lists every service with any
        /// recorded state.
        service: Option<String>,

        /// Emit machine-readable JSON output instead of a line per service.
        #[arg(long)]
        json: bool,
    },

    /// Run the daemon supervisor (C5) for a service in the foreground: fork,
    /// exec, supervise, respawn, until a `stop` control message. Intended to
    /// be invoked as the supervising sibling process, not interactively.
    Supervise { service: String },
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
