//! Table Census Core - live cardinality for kernel BPF tables
//!
//! The main entry point for tc-core, handling:
//! - The long-running census controller (`run`)
//! - One-shot census polls and snapshots for inspection
//! - Configuration checks

use clap::{Args, Parser, Subcommand};
use serde_json::json;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use tc_common::format_error_human;
use tc_core::census::CensusPoller;
use tc_core::config::{load_config, ConfigOptions, ResolvedConfig};
use tc_core::daemon::{Daemon, DaemonSources};
use tc_core::exit_codes::ExitCode;
use tc_core::kernel::{self, PinnedIterator};
use tc_core::log_event;
use tc_core::logging::{
    event_names, generate_run_id, get_host_id, init_logging, LogConfig, LogContext, LogFormat,
    LogLevel, Stage,
};
use tc_core::publish::{MemorySink, Publisher, Strategy};
use tc_core::replica::{ReplicaOptions, ShadowReplicaStore};
use tc_core::shutdown::{install_signal_handlers, Shutdown};
use tc_core::snapshot::{SnapshotLoader, SnapshotReport};

/// Table Census - live cardinality and pressure for kernel BPF tables
#[derive(Parser)]
#[command(name = "tc-core")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    global: GlobalOpts,
}

/// Global options available to all commands
#[derive(Args, Debug)]
struct GlobalOpts {
    /// Config file (overrides TABLE_CENSUS_CONFIG and the XDG location)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Decrease verbosity (quiet mode)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Log format on stderr (human, jsonl)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the census controller until interrupted (default)
    Run,

    /// Read the table iterator once and print the census
    PollOnce(PollOnceArgs),

    /// Load pinned tables and print their baseline cardinality
    Snapshot(SnapshotArgs),

    /// Validate configuration and print its provenance
    Check,

    /// Print version information
    Version,
}

#[derive(Args, Debug)]
struct PollOnceArgs {
    /// Pinned iterator to read (defaults to poller.iterator_path)
    #[arg(long)]
    iterator: Option<PathBuf>,

    /// Only report these tables (name or id)
    #[arg(long = "table")]
    tables: Vec<String>,
}

#[derive(Args, Debug)]
struct SnapshotArgs {
    /// Namespace root to walk (defaults to replica.pinned_root)
    #[arg(long)]
    root: Option<PathBuf>,

    /// Additional pinned table paths
    #[arg(long = "pin")]
    pins: Vec<PathBuf>,

    /// Include sorted member keys in the output
    #[arg(long)]
    members: bool,
}

// ============================================================================
// Main entry point
// ============================================================================

fn main() {
    let cli = Cli::parse();

    let cli_level = if cli.global.verbose > 0 || cli.global.quiet {
        Some(LogLevel::from_verbosity(cli.global.verbose, cli.global.quiet))
    } else {
        None
    };
    init_logging(&LogConfig::from_env(cli_level, cli.global.log_format));

    let result = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_daemon(&cli.global),
        Commands::PollOnce(args) => run_poll_once(&cli.global, &args),
        Commands::Snapshot(args) => run_snapshot(&cli.global, &args),
        Commands::Check => run_check(&cli.global),
        Commands::Version => {
            print_version();
            Ok(ExitCode::Clean)
        }
    };

    let exit_code = match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{}", format_error_human(&err, std::io::stderr().is_terminal()));
            ExitCode::from_error(&err)
        }
    };

    std::process::exit(exit_code.as_i32());
}

fn load(global: &GlobalOpts, ctx: &LogContext) -> tc_common::Result<ResolvedConfig> {
    let resolved = load_config(&ConfigOptions {
        config_path: global.config.clone(),
    })?;
    match (&resolved.path, &resolved.hash) {
        (Some(path), Some(hash)) => log_event!(
            ctx,
            INFO,
            event_names::CONFIG_LOADED,
            Stage::Init,
            "configuration loaded",
            path = %path.display(),
            hash = %hash
        ),
        _ => log_event!(
            ctx,
            INFO,
            event_names::CONFIG_DEFAULT_USED,
            Stage::Init,
            "no config file found, using defaults"
        ),
    }
    Ok(resolved)
}

fn context() -> LogContext {
    LogContext::new(generate_run_id(), get_host_id())
}

fn print_json(value: &impl serde::Serialize) -> tc_common::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ============================================================================
// Command implementations
// ============================================================================

fn run_daemon(global: &GlobalOpts) -> tc_common::Result<ExitCode> {
    let ctx = context();
    let resolved = load(global, &ctx)?;
    let sources = DaemonSources::system(&resolved.config)?;

    install_signal_handlers();
    let mut daemon = Daemon::new(resolved.config, ctx)?;
    let summary = daemon.run(sources, &Shutdown::new())?;
    print_json(&summary)?;

    Ok(if summary.interrupted {
        ExitCode::Interrupted
    } else {
        ExitCode::Clean
    })
}

fn run_poll_once(global: &GlobalOpts, args: &PollOnceArgs) -> tc_common::Result<ExitCode> {
    let ctx = context();
    let config = load(global, &ctx)?.config;
    let path = args
        .iterator
        .clone()
        .unwrap_or_else(|| config.poller.iterator_path.clone());

    let publisher = Publisher::sole(Arc::new(MemorySink::new()), config.label_mode, Strategy::Poller);
    let mut tables = config.poller.tables.clone();
    tables.extend(args.tables.iter().cloned());

    let mut poller = CensusPoller::new(PinnedIterator::new(&path), publisher)
        .with_tables(tables);
    let cycle = poller.poll_once()?;

    print_json(&json!({
        "iterator": path,
        "published": cycle.published,
        "duration_ms": cycle.duration_ms,
        "tables": cycle.lines.iter().map(|line| json!({
            "id": line.id,
            "name": line.name,
            "capacity": line.capacity,
            "cardinality": line.cardinality,
            "pressure": line.pressure(),
        })).collect::<Vec<_>>(),
    }))?;
    Ok(ExitCode::Clean)
}

fn run_snapshot(global: &GlobalOpts, args: &SnapshotArgs) -> tc_common::Result<ExitCode> {
    let ctx = context();
    let config = load(global, &ctx)?.config;
    let opener = kernel::system_opener()?;

    let store = ShadowReplicaStore::new(
        Publisher::sole(Arc::new(MemorySink::new()), config.label_mode, Strategy::Replica),
        ReplicaOptions {
            track_members: args.members || config.replica.track_members,
        },
    );
    let loader = SnapshotLoader::new(opener).with_max_depth(config.replica.max_depth);
    let mut report = SnapshotReport::default();

    if let Some(root) = args.root.as_ref().or(config.replica.pinned_root.as_ref()) {
        loader.load_namespace(root, &store, &mut report);
    }
    let mut pins = config.replica.pinned_paths.clone();
    pins.extend(args.pins.iter().cloned());
    loader.load_paths(&pins, &store, &mut report);

    log_event!(
        ctx,
        INFO,
        event_names::SNAPSHOT_FINISHED,
        Stage::Snapshot,
        "snapshot loaded",
        tables = report.tables_seeded(),
        skipped = report.skipped.len()
    );

    print_json(&json!({
        "report": report,
        "tables": store.censuses(),
    }))?;
    Ok(ExitCode::Clean)
}

fn run_check(global: &GlobalOpts) -> tc_common::Result<ExitCode> {
    let ctx = context();
    let resolved = load(global, &ctx)?;
    let config = &resolved.config;

    print_json(&json!({
        "status": "ok",
        "path": resolved.path,
        "hash": resolved.hash,
        "schema_version": config.schema_version,
        "strategies": config.strategies(),
        "authority": config.authority(),
        "label_mode": config.label_mode,
        "metrics": config.metrics,
    }))?;
    Ok(ExitCode::Clean)
}

fn print_version() {
    println!("tc-core {}", env!("CARGO_PKG_VERSION"));
}
