//! A thin binary wiring a [`shardval_validator::ValidatorManager`] to the
//! in-memory storage backend and a configured collator list (SPEC_FULL.md
//! §0's `shardval-cli`), following teacher's `cli/src/node` boot sequence
//! shape (config load -> storage/collaborator wiring -> run). Configuration
//! loading, the CLI surface and logging setup are ambient concerns (spec.md
//! §1's Non-goals), carried here with the teacher's own crates (`clap`,
//! `tracing-subscriber`) per SPEC_FULL.md §1.

mod config;
mod node;

use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::config::NodeConfig;
use crate::node::Node;

#[derive(Parser)]
#[command(name = "shardval-node", about = "Per-shard block production and acceptance core (dev node)")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a template config file and exit.
    InitConfig {
        path: PathBuf,
        #[arg(short, long)]
        force: bool,
    },
    /// Boot the validator core against the in-memory storage backend.
    Run {
        #[arg(long)]
        config: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::InitConfig { path, force } => init_config(path, force),
        Command::Run { config } => tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?
            .block_on(run(config)),
    }
}

fn init_config(path: PathBuf, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists; pass --force to overwrite", path.display());
    }
    NodeConfig::default().save_to_file(&path).with_context(|| format!("writing {}", path.display()))?;
    println!("wrote template config to {}", path.display());
    Ok(())
}

async fn run(config_path: PathBuf) -> anyhow::Result<()> {
    init_logger();

    let config = NodeConfig::from_file(&config_path).context("failed to load node config")?;
    let node = Node::bootstrap(config).context("failed to wire validator core")?;

    let zerostate_id = node.apply_zerostate().await.context("failed to apply masterchain zerostate")?;
    tracing::info!(%zerostate_id, "node initialized");

    run_until_shutdown(node).await
}

async fn run_until_shutdown(node: Node) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(node.stats_interval.max(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => node.log_status(),
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown requested");
                return Ok(());
            }
        }
    }
}

fn init_logger() {
    let filter = EnvFilter::builder().with_default_directive(tracing::Level::INFO.into()).from_env_lossy();
    let logger = tracing_subscriber::fmt().with_env_filter(filter);
    if std::io::stdout().is_terminal() {
        logger.init();
    } else {
        logger.without_time().init();
    }
}
