//! taskctx CLI Binary
//!
//! Drives task contexts on an in-process cluster: `simulate` runs a task
//! tree through window admission, completion and commit and reports context
//! and message statistics; `config` prints the resolved configuration.

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use comfy_table::presets::UTF8_BORDERS_ONLY;
use comfy_table::Table;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use taskctx::config::{ConfigLoader, RuntimeConfig};
use taskctx::context::{ContextStats, TaskOwner};
use taskctx::error::{abort_on_fatal, ContextError};
use taskctx::event::UserEvent;
use taskctx::forest::InMemoryForest;
use taskctx::logging::{init_logging, LoggingConfig};
use taskctx::mapper::{DefaultMapper, MapperManager};
use taskctx::runtime::Runtime;
use taskctx::scheduler::TracingScheduler;
use taskctx::transport::{InProcessNetwork, MessageKind};
use taskctx::types::{
    Coherence, ContextUid, FieldId, FieldSpace, IndexSpace, LogicalRegion, OpId, PrivilegeMode,
    RegionRequirement, RegionTreeId, RegionTreeNode, TaskInfo,
};
use tracing::{error, info};

/// taskctx - task execution contexts for a distributed task-parallel runtime
#[derive(Parser)]
#[command(name = "taskctx")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Workspace root directory
    #[arg(long, default_value = ".")]
    workspace: PathBuf,

    /// Configuration file path (overrides default config loading)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long, default_value = "false")]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long)]
    log_level: Option<String>,

    /// Log format (json, text)
    #[arg(long)]
    log_format: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a task tree on an in-process cluster
    Simulate {
        /// Number of address spaces (defaults to node.address_spaces)
        #[arg(long)]
        nodes: Option<u32>,
        /// Child operations launched by the top-level task
        #[arg(long, default_value = "64")]
        children: u64,
        /// Override context.max_window_size
        #[arg(long)]
        window: Option<usize>,
        /// Override context.hysteresis_percentage
        #[arg(long)]
        hysteresis: Option<usize>,
    },
    /// Print the resolved configuration as JSON
    Config,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {:#}", e);
            process::exit(1);
        }
    };

    let logging_config = build_logging_config(&cli, &config);
    if let Err(e) = init_logging(Some(&logging_config)) {
        eprintln!("Failed to initialize logging: {}", e);
        process::exit(1);
    }

    let result = match cli.command {
        Commands::Simulate {
            nodes,
            children,
            window,
            hysteresis,
        } => {
            let mut config = config;
            if let Some(nodes) = nodes {
                config.node.address_spaces = nodes;
            }
            if let Some(window) = window {
                config.context.max_window_size = window;
            }
            if let Some(hysteresis) = hysteresis {
                config.context.hysteresis_percentage = hysteresis;
            }
            simulate(config, children).await
        }
        Commands::Config => serde_json::to_string_pretty(&config).map_err(Into::into),
    };

    match result {
        Ok(output) => println!("{}", output),
        Err(e) => {
            if let Some(err) = e.downcast_ref::<ContextError>() {
                if err.is_fatal() {
                    abort_on_fatal(err);
                }
            }
            error!("Command failed: {:#}", e);
            eprintln!("Error: {:#}", e);
            process::exit(1);
        }
    }
}

fn load_config(cli: &Cli) -> Result<RuntimeConfig> {
    let config = match &cli.config {
        Some(path) => ConfigLoader::load_from_file(path)
            .with_context(|| format!("reading {}", path.display()))?,
        None => ConfigLoader::load(&cli.workspace)?,
    };
    Ok(config)
}

/// CLI flags override the config file.
fn build_logging_config(cli: &Cli, config: &RuntimeConfig) -> LoggingConfig {
    let mut logging = config.logging.clone();
    if cli.verbose {
        logging.level = "debug".to_string();
    }
    if let Some(level) = &cli.log_level {
        logging.level = level.clone();
    }
    if let Some(format) = &cli.log_format {
        logging.format = format.clone();
    }
    logging
}

/// Owner of the simulated top-level task.
#[derive(Default)]
struct SimulationOwner {
    complete: UserEvent,
    committed: UserEvent,
}

impl TaskOwner for SimulationOwner {
    fn children_complete(&self, ctx: ContextUid) {
        info!(context = %ctx, "Simulation children complete");
        self.complete.trigger();
    }

    fn children_committed(&self, ctx: ContextUid) {
        info!(context = %ctx, "Simulation children committed");
        self.committed.trigger();
    }
}

async fn simulate(config: RuntimeConfig, children: u64) -> Result<String> {
    config
        .validate()
        .map_err(|errors| anyhow::anyhow!("{}", join_errors(&errors)))?;

    let root = LogicalRegion::new(IndexSpace(1), FieldSpace(1), RegionTreeId(1));
    let forest = Arc::new(InMemoryForest::new());
    forest.add_tree(root, 0);

    let network = InProcessNetwork::new();
    let runtimes: Vec<Arc<Runtime>> = (0..config.node.address_spaces)
        .map(|space| {
            let runtime = Runtime::new(
                space,
                forest.clone(),
                network.endpoint(space),
                Arc::new(TracingScheduler),
                MapperManager::new(Arc::new(DefaultMapper), config.context),
            );
            network.attach(space, &runtime);
            runtime
        })
        .collect();
    let home = runtimes
        .first()
        .context("simulation needs at least one address space")?;

    let task = TaskInfo::new("simulation", 1, 0).with_region(RegionRequirement::region(
        root,
        PrivilegeMode::READ_WRITE,
        Coherence::Exclusive,
        [FieldId(1)],
    ));
    let owner = Arc::new(SimulationOwner::default());
    let top = home.create_top_level_context(task, Some(owner.clone()))?;

    let mut launched = Vec::new();
    for id in 0..children {
        let op = OpId(id);
        top.register_child(op).await?;
        let ctx = top.clone();
        launched.push(tokio::spawn(async move {
            tokio::task::yield_now().await;
            ctx.mark_executed(op)?;
            ctx.mark_complete(op)
        }));
    }
    for handle in launched {
        handle.await??;
    }

    // Every other space mirrors the context and resolves the root's owner.
    for runtime in runtimes.iter().skip(1) {
        let mirror = runtime.find_context(top.uid()).await?;
        let owner_space = mirror
            .get_version_owner(RegionTreeNode::Region(root), runtime.local_space())
            .await?;
        info!(space = runtime.local_space(), owner = owner_space, "Mirror resolved version owner");
    }

    top.end_task(Vec::new())?.wait().await;
    owner.complete.event().wait().await;
    let stats = top.stats();
    for id in 0..children {
        top.mark_committed(OpId(id))?;
    }
    owner.committed.event().wait().await;
    top.commit().await?;

    Ok(format!(
        "{}\n\n{}",
        stats_table(&stats),
        message_table(&network)
    ))
}

fn join_errors(errors: &[taskctx::config::ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

fn stats_table(stats: &ContextStats) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Context", "Value"]);
    let rows: [(&str, String); 11] = [
        ("uid", stats.uid.clone()),
        ("variant", stats.variant.to_string()),
        ("total children", stats.total_children.to_string()),
        ("outstanding children", stats.outstanding_children.to_string()),
        ("executing", stats.executing.to_string()),
        ("executed", stats.executed.to_string()),
        ("complete", stats.complete.to_string()),
        ("pending frames", stats.pending_frames.to_string()),
        ("ownership records", stats.ownership_records.to_string()),
        ("remote instances", stats.remote_instances.to_string()),
        ("active", stats.active.to_string()),
    ];
    for (name, value) in rows {
        table.add_row(vec![name.to_string(), value]);
    }
    table
}

fn message_table(network: &InProcessNetwork) -> Table {
    const KINDS: [MessageKind; 8] = [
        MessageKind::VersionOwnerRequest,
        MessageKind::VersionOwnerResponse,
        MessageKind::TopViewRequest,
        MessageKind::TopViewResponse,
        MessageKind::RemoteContextRequest,
        MessageKind::RemoteContextResponse,
        MessageKind::ReturnResources,
        MessageKind::FreeRemoteContext,
    ];
    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Message", "Sent"]);
    for kind in KINDS {
        table.add_row(vec![format!("{:?}", kind), network.sent_count(kind).to_string()]);
    }
    table.add_row(vec!["total".to_string(), network.total_sent().to_string()]);
    table
}
