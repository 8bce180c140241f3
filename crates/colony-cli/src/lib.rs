#![forbid(unsafe_code)]

//! Operator command surface for a colony base directory.
//!
//! Every command returns one JSON document; [`run_cli`] is also the embedding
//! entrypoint for hosts that want the same behavior without a subprocess.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use colony_conductor::{load_workflow_from_path, Conductor, EchoExecutor, ReplayManager};
use colony_domain::{
    ColonyConfig, ColonyError, Event, LocationType, NewTrail, RunId, Scent, TrailQuery,
};
use colony_eventlog::EventLog;
use colony_guard::ConsistencyGuard;
use colony_store_core::{ConductorStore, LegacyStore, TrailStore};
use colony_store_sqlite::{SqliteColonyStore, SqliteLegacyStore};
use serde_json::{json, Value};

const DEFAULT_BASE_DIR: &str = ".colony";

#[derive(Debug, Parser)]
#[command(name = "colony")]
#[command(about = "Multi-agent coordination: event log, trails, workflows and replay")]
pub struct Cli {
    /// YAML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Overrides the base directory and the paths derived from it.
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Events {
        #[command(subcommand)]
        command: EventsCommand,
    },
    Guard {
        #[command(subcommand)]
        command: GuardCommand,
    },
    Trails {
        #[command(subcommand)]
        command: TrailsCommand,
    },
    Workflow {
        #[command(subcommand)]
        command: WorkflowCommand,
    },
    Run {
        #[command(subcommand)]
        command: RunCommand,
    },
    Replay {
        #[command(subcommand)]
        command: ReplayCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum EventsCommand {
    /// Projected state of the whole log.
    State,
    Stats,
    /// Checksum and sequence audit; never modifies the file.
    Verify,
    /// Findings recorded after a cursor.
    Since {
        #[arg(long, default_value_t = 0)]
        cursor: u64,
    },
}

#[derive(Debug, Subcommand)]
pub enum GuardCommand {
    /// Dual-write one event, given as `{"type": ..., "payload": ...}`.
    Apply {
        #[arg(long)]
        event_json: String,
    },
    /// Legacy store view of the current state.
    State,
    Validate,
}

#[derive(Debug, Subcommand)]
pub enum TrailsCommand {
    Lay(LayArgs),
    List(ListArgs),
    Hotspots {
        #[arg(long)]
        run_id: Option<String>,
    },
    /// Apply one decay step; meant to be driven by an external scheduler.
    Decay {
        #[arg(long)]
        rate: Option<f64>,
    },
}

#[derive(Debug, Args)]
pub struct LayArgs {
    #[arg(long)]
    location: String,
    #[arg(long)]
    scent: ScentArg,
    #[arg(long)]
    agent_id: String,
    #[arg(long)]
    message: String,
    #[arg(long, default_value_t = 1.0)]
    strength: f64,
    #[arg(long)]
    run_id: Option<String>,
    #[arg(long, default_value = "file")]
    location_type: LocationTypeArg,
    #[arg(long = "tag")]
    tags: Vec<String>,
    #[arg(long)]
    ttl_seconds: Option<i64>,
}

#[derive(Debug, Args)]
pub struct ListArgs {
    #[arg(long)]
    scent: Option<ScentArg>,
    #[arg(long)]
    location: Option<String>,
    #[arg(long)]
    run_id: Option<String>,
    #[arg(long, default_value_t = 50)]
    limit: usize,
    #[arg(long)]
    min_strength: Option<f64>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ScentArg {
    Discovery,
    Warning,
    Blocker,
    Hot,
    Cold,
    Success,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LocationTypeArg {
    File,
    Directory,
    Symbol,
    Task,
}

#[derive(Debug, Subcommand)]
pub enum WorkflowCommand {
    /// Register a workflow from a YAML document.
    Create {
        #[arg(long)]
        file: PathBuf,
    },
    Show {
        #[arg(long)]
        name: String,
    },
    List,
    /// Drive a run to completion with the built-in echo executor.
    Run {
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "{}")]
        input_json: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum RunCommand {
    Show {
        #[arg(long)]
        run_id: String,
    },
    List,
}

#[derive(Debug, Subcommand)]
pub enum ReplayCommand {
    Plan {
        #[arg(long)]
        run_id: String,
        #[arg(long)]
        from_node: String,
    },
    Retry {
        #[arg(long)]
        run_id: String,
        #[arg(long)]
        dry_run: bool,
    },
}

/// # Errors
/// Returns an error when configuration cannot be resolved or the command fails.
pub fn run_cli(cli: Cli) -> Result<Value> {
    let config = resolve_config(cli.config.as_deref(), cli.base_dir.as_deref())?;
    run_command(&config, cli.command)
}

/// Config file first, then `--base-dir`, then the default base directory.
///
/// # Errors
/// Returns an error when the config file cannot be loaded.
pub fn resolve_config(
    config_path: Option<&Path>,
    base_dir: Option<&Path>,
) -> Result<ColonyConfig> {
    let mut config = match config_path {
        Some(path) => ColonyConfig::load(path)?,
        None => ColonyConfig::for_base_dir(DEFAULT_BASE_DIR),
    };
    if let Some(base_dir) = base_dir {
        let derived = ColonyConfig::for_base_dir(base_dir);
        config.base_dir = derived.base_dir;
        config.event_log_path = derived.event_log_path;
        config.database_path = derived.database_path;
    }
    Ok(config)
}

/// # Errors
/// Returns an error when the command fails.
pub fn run_command(config: &ColonyConfig, command: Command) -> Result<Value> {
    match command {
        Command::Events { command } => run_events(config, command),
        Command::Guard { command } => run_guard(config, command),
        Command::Trails { command } => run_trails(config, command),
        Command::Workflow { command } => run_workflow(config, command),
        Command::Run { command } => run_runs(config, command),
        Command::Replay { command } => run_replay(config, command),
    }
}

fn run_events(config: &ColonyConfig, command: EventsCommand) -> Result<Value> {
    let mut log = EventLog::from_config(config);
    let value = match command {
        EventsCommand::State => serde_json::to_value(log.get_current_state()?)?,
        EventsCommand::Stats => serde_json::to_value(log.get_stats()?)?,
        EventsCommand::Verify => serde_json::to_value(log.verify()?)?,
        EventsCommand::Since { cursor } => json!({
            "cursor": cursor,
            "findings": log.get_findings_since(cursor)?,
        }),
    };
    Ok(value)
}

fn run_guard(config: &ColonyConfig, command: GuardCommand) -> Result<Value> {
    let mut guard = open_guard(config)?;
    let value = match command {
        GuardCommand::Apply { event_json } => {
            let event: Event = serde_json::from_str(&event_json).map_err(|err| {
                ColonyError::Validation(format!("event_json is not a valid event: {err}"))
            })?;
            guard.apply(event)?
        }
        GuardCommand::State => serde_json::to_value(guard.get_state()?)?,
        GuardCommand::Validate => serde_json::to_value(guard.validate_state_consistency()?)?,
    };
    Ok(value)
}

fn run_trails(config: &ColonyConfig, command: TrailsCommand) -> Result<Value> {
    let store = open_store(config)?;
    let value = match command {
        TrailsCommand::Lay(args) => {
            let mut trail = NewTrail::new(
                args.location,
                map_scent(args.scent),
                args.agent_id,
                args.message,
            )
            .with_strength(args.strength)
            .with_location_type(map_location_type(args.location_type))
            .with_tags(args.tags);
            if let Some(run_id) = parse_optional_run_id(args.run_id.as_deref())? {
                trail = trail.with_run(run_id);
            }
            if let Some(ttl) = args.ttl_seconds {
                trail = trail.with_ttl_seconds(ttl);
            }
            serde_json::to_value(store.lay_trail(&trail)?)?
        }
        TrailsCommand::List(args) => {
            let query = TrailQuery {
                scent: args.scent.map(map_scent),
                location: args.location,
                run_id: parse_optional_run_id(args.run_id.as_deref())?,
                limit: args.limit,
                min_strength: args.min_strength,
            };
            serde_json::to_value(store.get_trails(&query)?)?
        }
        TrailsCommand::Hotspots { run_id } => {
            let run_id = parse_optional_run_id(run_id.as_deref())?;
            serde_json::to_value(store.get_hot_spots(run_id)?)?
        }
        TrailsCommand::Decay { rate } => {
            let decay_rate = rate.unwrap_or(config.default_decay_rate);
            let updated = store.decay_trails(decay_rate)?;
            json!({ "decay_rate": decay_rate, "trails_updated": updated })
        }
    };
    Ok(value)
}

fn run_workflow(config: &ColonyConfig, command: WorkflowCommand) -> Result<Value> {
    let store = open_store(config)?;
    let executor = EchoExecutor::new();
    let conductor = Conductor::new(&store, &executor);
    let value = match command {
        WorkflowCommand::Create { file } => {
            let document = load_workflow_from_path(&file)?;
            let workflow_id = conductor.create_workflow_from_document(&document)?;
            json!({ "workflow_id": workflow_id, "name": document.name })
        }
        WorkflowCommand::Show { name } => {
            let workflow = conductor
                .get_workflow(&name)?
                .ok_or_else(|| ColonyError::NotFound(format!("workflow {name}")))?;
            serde_json::to_value(workflow)?
        }
        WorkflowCommand::List => serde_json::to_value(store.list_workflows()?)?,
        WorkflowCommand::Run { name, input_json } => {
            let input: Value = serde_json::from_str(&input_json).map_err(|err| {
                ColonyError::Validation(format!("input_json is not valid JSON: {err}"))
            })?;
            serde_json::to_value(conductor.run_workflow(&name, input)?)?
        }
    };
    Ok(value)
}

fn run_runs(config: &ColonyConfig, command: RunCommand) -> Result<Value> {
    let store = open_store(config)?;
    let executor = EchoExecutor::new();
    let conductor = Conductor::new(&store, &executor);
    let value = match command {
        RunCommand::Show { run_id } => {
            let run_id = RunId::parse(&run_id)?;
            let run = conductor
                .get_run(run_id)?
                .ok_or_else(|| ColonyError::NotFound(format!("run {run_id}")))?;
            json!({
                "run": run,
                "node_executions": conductor.get_node_executions(run_id)?,
                "decisions": conductor.get_decisions(run_id)?,
            })
        }
        RunCommand::List => serde_json::to_value(store.list_runs()?)?,
    };
    Ok(value)
}

fn run_replay(config: &ColonyConfig, command: ReplayCommand) -> Result<Value> {
    let store = open_store(config)?;
    let executor = EchoExecutor::new();
    let conductor = Conductor::new(&store, &executor);
    let manager = ReplayManager::new(&store).with_resubmitter(&conductor);
    let value = match command {
        ReplayCommand::Plan { run_id, from_node } => {
            serde_json::to_value(manager.get_replay_plan(RunId::parse(&run_id)?, &from_node)?)?
        }
        ReplayCommand::Retry { run_id, dry_run } => {
            serde_json::to_value(manager.retry_failed_nodes(RunId::parse(&run_id)?, dry_run)?)?
        }
    };
    Ok(value)
}

fn ensure_base_dir(config: &ColonyConfig) -> Result<()> {
    fs::create_dir_all(&config.base_dir)
        .with_context(|| format!("failed to create {}", config.base_dir.display()))
}

fn open_store(config: &ColonyConfig) -> Result<SqliteColonyStore> {
    ensure_base_dir(config)?;
    let store = SqliteColonyStore::from_config(config)?;
    store.migrate()?;
    Ok(store)
}

fn open_guard(config: &ColonyConfig) -> Result<ConsistencyGuard<SqliteLegacyStore>> {
    ensure_base_dir(config)?;
    let legacy = SqliteLegacyStore::from_config(config)?;
    legacy.migrate()?;
    Ok(ConsistencyGuard::new(
        EventLog::from_config(config),
        legacy,
        config,
    ))
}

fn parse_optional_run_id(raw: Option<&str>) -> Result<Option<RunId>> {
    Ok(raw.map(RunId::parse).transpose()?)
}

fn map_scent(value: ScentArg) -> Scent {
    match value {
        ScentArg::Discovery => Scent::Discovery,
        ScentArg::Warning => Scent::Warning,
        ScentArg::Blocker => Scent::Blocker,
        ScentArg::Hot => Scent::Hot,
        ScentArg::Cold => Scent::Cold,
        ScentArg::Success => Scent::Success,
    }
}

fn map_location_type(value: LocationTypeArg) -> LocationType {
    match value {
        LocationTypeArg::File => LocationType::File,
        LocationTypeArg::Directory => LocationType::Directory,
        LocationTypeArg::Symbol => LocationType::Symbol,
        LocationTypeArg::Task => LocationType::Task,
    }
}
