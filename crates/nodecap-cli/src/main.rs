//! nodecap: resource plugin command line.
//!
//! Every command operates on one resource kind and prints its result as a
//! single JSON object on stdout. Logs go to stderr.
//!
//! # Usage
//!
//! ```text
//! nodecap --config nodecap.toml cpumem add-node node-1 --opts '{"cpu": "4", "memory": "8G"}'
//! nodecap cpumem get-capacity node-1 node-2 --opts '{"cpu-bind": null, "cpu": 1.5}'
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use nodecap_core::NodecapConfig;
use nodecap_plugin::OpContext;
use nodecap_store::RedbStore;
use tokio::sync::watch;
use tracing::{debug, info, warn};

mod dispatch;

#[derive(Parser)]
#[command(
    name = "nodecap",
    about = "Node resource accounting and scheduling plugins",
    version
)]
pub struct Cli {
    /// Path to nodecap.toml. Defaults apply when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Resource kind to operate on.
    #[arg(value_enum)]
    kind: Kind,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Kind {
    Cpumem,
    Storage,
    Volume,
}

/// Where an update takes its amount from. The first one given wins, in
/// this order.
#[derive(Debug, Clone, clap::Args)]
pub struct UpdateSource {
    /// Node options, e.g. '{"cpu": "2", "memory": "1G"}'.
    #[arg(long)]
    opts: Option<String>,

    /// Resource args as JSON.
    #[arg(long)]
    args: Option<String>,

    /// JSON array of workload args whose usage is summed.
    #[arg(long)]
    workloads: Option<String>,

    /// Add to (or subtract from) the current value instead of replacing it.
    #[arg(long)]
    delta: bool,

    /// Subtract instead of add.
    #[arg(long)]
    decr: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Register a node with the capacity described by its options.
    AddNode {
        node: String,
        #[arg(long, default_value = "{}")]
        opts: String,
    },
    /// Forget a node.
    RemoveNode { node: String },
    /// Show a node's capacity and usage, audited against its workloads.
    GetNode {
        node: String,
        /// JSON array of the workload args placed on the node.
        #[arg(long, default_value = "[]")]
        workloads: String,
        /// Replace the recorded usage with the workloads' sum.
        #[arg(long)]
        fix: bool,
    },
    /// Overwrite capacity and usage.
    SetNode {
        node: String,
        #[arg(long)]
        capacity: String,
        #[arg(long)]
        usage: String,
    },
    /// Update a node's usage.
    SetUsage {
        node: String,
        #[command(flatten)]
        source: UpdateSource,
    },
    /// Update a node's capacity.
    SetCapacity {
        node: String,
        #[command(flatten)]
        source: UpdateSource,
    },
    /// How many replicas each node could take.
    GetCapacity {
        #[arg(required = true)]
        nodes: Vec<String>,
        #[arg(long, default_value = "{}")]
        opts: String,
    },
    /// Engine and workload args for new replicas.
    GetDeployArgs {
        node: String,
        #[arg(long, default_value_t = 1)]
        count: usize,
        #[arg(long, default_value = "{}")]
        opts: String,
    },
    /// Resize a running workload by the given delta options.
    GetReallocArgs {
        node: String,
        /// The workload's current args as JSON.
        #[arg(long)]
        origin: String,
        #[arg(long, default_value = "{}")]
        opts: String,
    },
    /// Engine args for floating workloads after node changes.
    GetRemapArgs {
        node: String,
        /// JSON object of workload id to workload args.
        #[arg(long, default_value = "{}")]
        workloads: String,
    },
    /// The least used node.
    GetIdle {
        #[arg(required = true)]
        nodes: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,nodecap=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => NodecapConfig::from_file(path)?,
        None => NodecapConfig::default(),
    };
    debug!(?config, "configuration loaded");

    let store = match &config.store.path {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let store = RedbStore::open(path)?;
            info!(path = ?path, "resource store opened");
            store
        }
        None => RedbStore::open_in_memory()?,
    };

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling");
            let _ = cancel_tx.send(true);
        }
    });

    let mut ctx = OpContext::new().with_cancel(cancel_rx);
    if let Some(timeout) = config.store.timeout() {
        ctx = ctx.with_timeout(timeout);
    }

    let output = dispatch::dispatch(cli.kind, cli.command, &config, store, &ctx).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
