//! batchscaled: the batchscale daemon.
//!
//! Assembles the scheduler, provisioner, and configuration backends
//! from one config file and runs the autoscale loop, or a single
//! operator command against the same backends.
//!
//! # Usage
//!
//! ```text
//! batchscaled --config /etc/batchscale.toml run
//! batchscaled check --dry-run
//! batchscaled nodes --idle
//! batchscaled remove-node worker3 --keep-instances
//! ```

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "batchscaled", about = "Batch cluster autoscaler", version)]
struct Cli {
    /// Config file. Defaults to ~/.batchscale.toml, then /etc/batchscale.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the autoscale loop until interrupted.
    Run {
        /// Seconds between cycles. Overrides autoscale.poll_interval_secs.
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Run a single autoscale cycle.
    Check {
        /// Print the decision without acting on it.
        #[arg(long)]
        dry_run: bool,
    },
    /// List scheduler nodes.
    Nodes {
        /// Only nodes that are idle.
        #[arg(long)]
        idle: bool,
    },
    /// List scheduler jobs.
    Jobs {
        /// Restrict to these states (e.g. PENDING, RUNNING). Repeatable.
        #[arg(long = "state")]
        states: Vec<String>,
    },
    /// List scheduler partitions.
    Partitions,
    /// Provision, configure, and join one new worker.
    AddNode,
    /// Drain and remove workers from the cluster.
    RemoveNode {
        /// Node names to remove.
        #[arg(required = true)]
        names: Vec<String>,

        /// Leave the cloud instances running after removal.
        #[arg(long)]
        keep_instances: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = batchscale_core::Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Run { interval } => commands::run(config, interval).await,
        Command::Check { dry_run } => commands::check(config, dry_run).await,
        Command::Nodes { idle } => commands::nodes(&config, idle).await,
        Command::Jobs { states } => commands::jobs(&config, &states).await,
        Command::Partitions => commands::partitions(&config).await,
        Command::AddNode => commands::add_node(config).await,
        Command::RemoveNode {
            names,
            keep_instances,
        } => commands::remove_node(config, &names, !keep_instances).await,
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,batchscale=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}
