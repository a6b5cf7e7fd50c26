//! Core of a dependency-aware init and service-management system.
//!
//! Five components compose the core, in dependency order (leaves first):
//! path & state store ([`store`]), dependency engine ([`depgraph`]), the
//! per-service state machine ([`service`]), the runscript driver
//! ([`runscript`]), and the daemon supervisor ([`supervisor`]).

#![warn(unused_crate_dependencies)]
#[cfg(test)]
use assert_cmd as _;
use ctrlc as _;
#[cfg(test)]
use predicates as _;
use strum as _;
#[cfg(test)]
use tempfile as _;
use tracing_subscriber as _;

/// CLI parsing, out of core scope beyond thin dispatch.
pub mod cli;

/// Minimal configuration/bootstrap layer.
pub mod config;

/// Shared constants, closed enumerations, and timeouts.
pub mod constants;

/// Dependency engine (C2): parsing, graph, cycle breaking, ordering.
pub mod depgraph;

/// Error taxonomy.
pub mod error;

/// Privilege dropping and pre-exec setup for spawned daemons.
pub mod privilege;

/// Runscript driver (C4): verb dispatch, exec protocol, timeouts.
pub mod runscript;

/// Runtime paths and modes.
pub mod runtime;

/// Per-service state machine (C3): transitions, locks, crash detection.
pub mod service;

/// Path & state store (C1): on-disk layout and the small store API.
pub mod store;

/// Daemon supervisor (C5): spawn, supervise, respawn, shutdown.
pub mod supervisor;

/// Test utils.
#[doc(hidden)]
pub mod test_utils;
