//! Mech Agent
//!
//! Runs a group of agents in one process over the in-process substrate and
//! ledger. Each agent persists checkpoints under its own directory and
//! serves health and status over HTTP. Checkpoints survive restarts, so a
//! relaunch resumes after the last finalized round.

use agent_runtime::{
    AgentBuilder, CheckpointStore, FlakyProvider, HashingProvider, LocalBus, MemoryCheckpointStore,
    SharedStatus, SledCheckpointStore, TaskResultProvider, TaskSender,
};
use anyhow::Result;
use clap::Parser;
use keeper_settlement::InMemoryLedger;
use mech_consensus::{ParticipantId, TaskId};
use status_server::{StatusServer, StatusServerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;

use config::{AgentConfig, DEFAULT_DEVNET_SIZE};

/// Round-based agreement and settlement agents
#[derive(Parser, Debug)]
#[command(name = "mech-agent")]
#[command(about = "Run a local group of agreement and settlement agents", long_about = None)]
struct Args {
    /// JSON config file (devnet defaults when absent)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Group size when running without a config file
    #[arg(long, default_value_t = DEFAULT_DEVNET_SIZE)]
    agents: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Data directory for checkpoints
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// Keep checkpoints in memory only
    #[arg(long)]
    in_memory: bool,

    /// Stop after this many finalized rounds (0 = run until Ctrl+C)
    #[arg(long, default_value = "0")]
    rounds: u64,

    /// Interval between generated task requests in milliseconds
    #[arg(long, default_value = "1000")]
    task_interval_ms: u64,

    /// Probability that a provider call fails
    #[arg(long, default_value = "0.0")]
    failure_rate: f64,

    /// Status polls before the ledger confirms a transaction
    #[arg(long, default_value = "1")]
    confirmation_polls: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match &args.config {
        Some(path) => AgentConfig::load(path)?,
        None => AgentConfig::devnet(args.agents),
    };
    config.validate()?;
    if !(0.0..=1.0).contains(&args.failure_rate) {
        anyhow::bail!("failure_rate must be within [0, 1]");
    }

    run_group(args, config).await
}

/// Start every configured participant and feed them tasks
async fn run_group(args: Args, config: AgentConfig) -> Result<()> {
    let participants = config.protocol.participants.len();
    tracing::info!("Starting agent group");
    tracing::info!("  Participants: {}", participants);
    tracing::info!(
        "  Quorum: {}",
        config.protocol.quorum.threshold(participants)
    );
    tracing::info!(
        "  Round timeout: {}ms, keeper timeout: {}ms",
        config.protocol.round_timeout_ms,
        config.protocol.keeper_timeout_ms
    );
    if args.in_memory {
        tracing::info!("  Checkpoints: in memory");
    } else {
        tracing::info!("  Data directory: {:?}", args.data_dir);
        std::fs::create_dir_all(&args.data_dir)?;
    }

    let bus = Arc::new(LocalBus::default());
    let ledger = Arc::new(InMemoryLedger::new().with_confirmation_polls(args.confirmation_polls));
    let (shutdown, shutdown_rx) = watch::channel(false);

    let mut statuses: Vec<SharedStatus> = Vec::new();
    let mut feeders: Vec<TaskSender> = Vec::new();
    let mut sled_stores: Vec<Arc<SledCheckpointStore>> = Vec::new();
    let mut agent_handles = Vec::new();
    let mut server_handles = Vec::new();

    for (index, participant) in config.protocol.participants.iter().enumerate() {
        let local = ParticipantId::new(participant.address.clone());

        let store: Arc<dyn CheckpointStore> = if args.in_memory {
            Arc::new(MemoryCheckpointStore::new())
        } else {
            let sled_store = Arc::new(SledCheckpointStore::open(args.data_dir.join(&participant.address))?);
            sled_stores.push(sled_store.clone());
            sled_store
        };

        let hashing: Arc<dyn TaskResultProvider> = Arc::new(HashingProvider::new("mech-devnet"));
        let provider: Arc<dyn TaskResultProvider> = if args.failure_rate > 0.0 {
            Arc::new(FlakyProvider::new(hashing, args.failure_rate))
        } else {
            hashing
        };

        let agent = AgentBuilder::new(config.protocol.clone(), local.clone())
            .runner_config(config.runner.clone())
            .provider(provider)
            .settlement_target(ledger.clone())
            .replication(bus.clone())
            .checkpoints(store)
            .build()?;

        statuses.push(agent.status());
        feeders.push(agent.task_sender());

        let server = StatusServer::new(
            agent.status(),
            StatusServerConfig {
                http_addr: config.status_addr(index),
                health_threshold_secs: config.health_threshold_secs,
            },
        );
        server_handles.push(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                tracing::error!("Status server for {} failed: {}", local, e);
            }
        }));

        let mut stop = shutdown_rx.clone();
        agent_handles.push(tokio::spawn(agent.run_until(async move {
            let _ = stop.changed().await;
        })));
    }

    // Requests enter through one agent at a time, round robin
    let task_interval = Duration::from_millis(args.task_interval_ms.max(1));
    let feeder = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(task_interval);
        let mut next = 0u64;
        loop {
            ticker.tick().await;
            let sender = &feeders[(next as usize) % feeders.len()];
            if let Err(e) = sender.send(TaskId::new(format!("task-{}", next))) {
                tracing::warn!("Dropping generated task: {}", e);
            }
            next += 1;
        }
    });

    tracing::info!("Agent group running. Status on {} onwards.", config.status_addr(0));
    tracing::info!("Press Ctrl+C to stop.");

    let target_rounds = args.rounds;
    let watched = statuses.clone();
    let finished = async move {
        if target_rounds == 0 {
            return std::future::pending::<()>().await;
        }
        loop {
            if watched.iter().all(|s| s.read().finalized_rounds >= target_rounds) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    };

    tokio::select! {
        _ = finished => tracing::info!("Reached {} finalized rounds", target_rounds),
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("Shutting down...");
        }
    }

    feeder.abort();
    let _ = shutdown.send(true);
    for result in futures::future::join_all(agent_handles).await {
        if let Err(e) = result? {
            tracing::error!("Agent stopped with error: {}", e);
        }
    }
    for handle in server_handles {
        handle.abort();
    }

    for store in &sled_stores {
        if let Err(e) = store.flush() {
            tracing::error!("Failed to flush checkpoints: {}", e);
        }
    }

    for status in &statuses {
        let status = status.read();
        tracing::info!(
            "{}: {} finalized, {} resubmissions skipped, {} abandoned, last checkpoint {:?}",
            status.participant,
            status.finalized_rounds,
            status.skipped_resubmissions,
            status.abandoned_rounds,
            status.last_checkpoint.as_ref().map(|c| c.round_id)
        );
    }
    tracing::info!(
        "Ledger holds {} settlement writes from {} submissions",
        ledger.writes().len(),
        ledger.submission_count()
    );

    tracing::info!("Agent group stopped");
    Ok(())
}
