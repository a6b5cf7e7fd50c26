use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use nix::unistd::Uid;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

use rcinit::cli::{Cli, Commands, parse_args};
use rcinit::config::{self, Config};
use rcinit::depgraph::Graph;
use rcinit::runscript::{self, DriverContext, EnvFlags};
use rcinit::runtime::{self, RuntimeMode};
use rcinit::service::{self, PrimaryState};
use rcinit::store::{SearchRoots, StateDir, Store};
use rcinit::supervisor;

fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args();
    init_logging(&args);

    let euid = Uid::effective();
    let mode = if args.sys {
        if !euid.is_root() {
            return Err(io_permission_denied("--sys requires root privileges").into());
        }
        RuntimeMode::System
    } else {
        RuntimeMode::User
    };

    runtime::init(mode);
    runtime::capture_socket_activation();

    if euid.is_root() && mode == RuntimeMode::User {
        warn!("running as root without --sys; state will be stored in userspace paths");
    }

    let config_path = PathBuf::from(&args.config);
    let config = Config::load(&config_path)?;
    let base_dir = config.base_dir(&runtime::state_dir());
    let roots: SearchRoots = config.search_roots(&runtime::search_roots());
    let system_tag = config.system_tag(&runtime::system_tag());
    runtime::set_system_tag(system_tag.clone());
    let user_mode = mode == RuntimeMode::User;

    let store = Store::new(base_dir, roots.clone(), user_mode);
    store.ensure_base_layout()?;

    let exit_code = dispatch(&args, &store, &system_tag, &roots, user_mode, &config_path)?;
    process::exit(exit_code);
}

#[allow(clippy::too_many_arguments)]
fn dispatch(
    args: &Cli,
    store: &Store,
    system_tag: &str,
    roots: &SearchRoots,
    user_mode: bool,
    config_path: &Path,
) -> Result<i32, Box<dyn Error>> {
    match &args.command {
        Commands::Start { service } => {
            let graph = load_graph(store, system_tag, roots, user_mode, config_path)?;
            let flags = env_flags(service);
            let ctx = DriverContext {
                store,
                graph: &graph,
                flags: &flags,
                parallel: false,
            };
            runscript::start(&ctx, service)?;
            Ok(0)
        }
        Commands::Stop { service } => {
            let graph = load_graph(store, system_tag, roots, user_mode, config_path)?;
            let flags = env_flags(service);
            let ctx = DriverContext {
                store,
                graph: &graph,
                flags: &flags,
                parallel: false,
            };
            runscript::stop(&ctx, service)?;
            Ok(0)
        }
        Commands::Restart { service } => {
            let graph = load_graph(store, system_tag, roots, user_mode, config_path)?;
            let flags = env_flags(service);
            let ctx = DriverContext {
                store,
                graph: &graph,
                flags: &flags,
                parallel: false,
            };
            runscript::restart(&ctx, service)?;
            Ok(0)
        }
        Commands::Zap { service } => {
            runscript::zap(store, service)?;
            Ok(0)
        }
        Commands::Status { service, json } => Ok(print_status(store, service.as_deref(), *json)),
        Commands::Supervise { service } => {
            supervisor::supervise(store, service)?;
            Ok(0)
        }
    }
}

/// Builds the dependency graph from the cached `deptree` file, pruning
/// entries for a different platform and resolving provider selections
/// before handing it to the runscript driver (§4.2, §4.4).
///
/// The `deptree` file is the `depinfo_`-format cache written by a
/// regenerator (§6), not the `SERVICE TYPE TOKEN` harness build format that
/// [`Graph::parse`] reads; that parser stays reserved for build input. When
/// the cache is stale or missing, this is the one place in the binary that
/// regenerates it: the just-resolved graph (platform-pruned, backlinked,
/// cycle-fixed) is written back out so the next invocation sees a fresh
/// cache, with the clock-skew guard from §4.2 applied immediately after.
fn load_graph(
    store: &Store,
    system_tag: &str,
    roots: &SearchRoots,
    user_mode: bool,
    config_path: &Path,
) -> Result<Graph, Box<dyn Error>> {
    let cache_path = store.deptree_path();
    let depconfig_paths = read_depconfig(store);
    let stale = config::cache_is_stale(&cache_path, roots, user_mode, config_path, None, &depconfig_paths);

    let text = match fs::read_to_string(&cache_path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(err) => return Err(err.into()),
    };

    let mut graph = Graph::from_cache(text.lines());
    graph.prune_platform(system_tag);
    graph.backlink();
    graph.tryfix()?;

    if stale {
        warn!(path = %cache_path.display(), "deptree cache stale or missing; regenerating from the resolved graph");
        graph.write_cache(&cache_path, &store.depconfig_path())?;

        if let Some(newest) = config::newest_input_mtime(roots, user_mode, config_path, None, &depconfig_paths)
            && config::force_cache_mtime_forward(&cache_path, newest)?
        {
            warn!("corrected clock skew on deptree cache mtime");
        }
    }

    Ok(graph)
}

/// Reads the `depconfig` file's list of external paths that invalidate the
/// `deptree` cache (§4.2, §6). A missing file means no extra paths.
fn read_depconfig(store: &Store) -> Vec<PathBuf> {
    fs::read_to_string(store.depconfig_path())
        .map(|text| text.lines().map(PathBuf::from).collect())
        .unwrap_or_default()
}

fn env_flags(service: &str) -> EnvFlags {
    EnvFlags {
        rc_svcname: service.to_string(),
        rc_runlevel: std::env::var("RC_RUNLEVEL").ok(),
        rc_nodeps: std::env::var_os("RC_NODEPS").is_some(),
        in_background: std::env::var_os("IN_BACKGROUND").is_some(),
        in_hotplug: std::env::var_os("IN_HOTPLUG").is_some(),
        in_dryrun: std::env::var_os("IN_DRYRUN").is_some(),
    }
}

fn print_status(store: &Store, service: Option<&str>, json: bool) -> i32 {
    let names: Vec<String> = match service {
        Some(name) => vec![name.to_string()],
        None => list_known_services(store),
    };

    if names.is_empty() {
        println!("no services with recorded state");
        return 0;
    }

    let mut worst = 0;
    if json {
        let mut entries = Vec::with_capacity(names.len());
        for name in &names {
            let state = service::read_state(store, name);
            entries.push(serde_json::json!({
                "service": name,
                "state": state.primary.label(),
                "wasinactive": state.modifiers.wasinactive,
                "failed": state.modifiers.failed,
                "hotplugged": state.modifiers.hotplugged,
                "crashed": state.crashed,
            }));
        }
        println!("{}", serde_json::to_string_pretty(&entries).unwrap_or_default());
    } else {
        for name in &names {
            let state = service::read_state(store, name);
            let mut modifiers = Vec::new();
            if state.modifiers.wasinactive {
                modifiers.push("wasinactive");
            }
            if state.modifiers.failed {
                modifiers.push("failed");
            }
            if state.modifiers.hotplugged {
                modifiers.push("hotplugged");
            }
            if state.crashed {
                modifiers.push("crashed");
            }
            if state.crashed || state.modifiers.failed {
                worst = worst.max(2);
            } else if matches!(state.primary, PrimaryState::Starting | PrimaryState::Stopping) {
                worst = worst.max(1);
            }
            if modifiers.is_empty() {
                println!("{:<24} {}", name, state.primary.label());
            } else {
                println!("{:<24} {} [{}]", name, state.primary.label(), modifiers.join(", "));
            }
        }
    }

    worst
}

/// Ad-hoc directory scan of the `started` state directory, since C1's
/// `Store` has no generic "list every service" operation (it is keyed by
/// single-service lookups throughout).
fn list_known_services(store: &Store) -> Vec<String> {
    let dir = store.base().join(StateDir::Started.dir_name());
    let Ok(entries) = fs::read_dir(&dir) else {
        return Vec::new();
    };

    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect();
    names.sort();
    names
}

fn init_logging(args: &Cli) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else if std::env::var_os("RC_DEBUG").is_some() {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    if tracing_subscriber::fmt().with_env_filter(filter).try_init().is_err() {
        error!("tracing subscriber already initialized");
    }
}

fn io_permission_denied(message: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::PermissionDenied, message)
}
