//! The `switchboard` binary: runs an orchestrator instance from `switchboard.toml`.

mod config;

use clap::{Parser, Subcommand};
use config::SwitchboardConfig;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use switchboard_agent::Agent;
use switchboard_channels::MemoryChannel;
use switchboard_core::{Priority, TaskSubmission};
use switchboard_orchestrator::{HealthStatus, Orchestrator};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "switchboard", about = "Switchboard — multi-agent task orchestrator")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "switchboard.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator until interrupted
    Serve,
    /// Submit one task, wait for it to settle and print it
    Submit {
        /// Capability the task needs
        capability: String,
        /// JSON payload
        #[arg(short, long, default_value = "null")]
        payload: String,
        /// Use the high priority queue
        #[arg(long)]
        urgent: bool,
        /// Give up waiting after this many seconds
        #[arg(long, default_value_t = 30)]
        wait_secs: u64,
    },
    /// Replay the degraded-mode journals into the state store
    Replay,
    /// Print per-agent attempt counts, success rate and mean duration
    Velocity,
    /// Parse and validate the config file
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let config = SwitchboardConfig::load(&cli.config).await?;

    match cli.command {
        Commands::Serve => {
            let orchestrator = start(&config).await?;
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let runner = tokio::spawn(orchestrator.clone().run(shutdown_rx));

            tokio::signal::ctrl_c().await?;
            info!("Shutdown requested");
            shutdown_tx.send(true)?;
            runner.await??;
        }
        Commands::Submit {
            capability,
            payload,
            urgent,
            wait_secs,
        } => {
            let payload: serde_json::Value = serde_json::from_str(&payload)
                .map_err(|e| anyhow::anyhow!("Payload is not valid JSON: {}", e))?;
            let mut submission = TaskSubmission::new(capability, payload);
            if urgent {
                submission = submission.with_priority(Priority::High);
            }

            let orchestrator = start(&config).await?;
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let runner = tokio::spawn(orchestrator.clone().run(shutdown_rx));

            let task_id = orchestrator.submit(submission).await?;
            let deadline = tokio::time::Instant::now() + Duration::from_secs(wait_secs);
            let task = loop {
                match orchestrator.status(task_id).await {
                    Ok(task) if task.is_settled() => break Some(task),
                    _ if tokio::time::Instant::now() >= deadline => break None,
                    _ => tokio::time::sleep(Duration::from_millis(50)).await,
                }
            };

            shutdown_tx.send(true)?;
            runner.await??;

            match task {
                Some(task) => {
                    println!("{}", serde_json::to_string_pretty(&task)?);
                    for entry in orchestrator.decisions(task_id).await? {
                        println!(
                            "decision: {:?} ({}){}",
                            entry.decision_kind,
                            entry.rationale,
                            if entry.fallback { " [fallback]" } else { "" }
                        );
                    }
                }
                None => anyhow::bail!("task {} did not settle within {}s", task_id, wait_secs),
            }
        }
        Commands::Replay => {
            let orchestrator = build(&config, Arc::new(MemoryChannel::new("memory")))?;
            let report = orchestrator.recover_from_journal().await?;
            println!(
                "tasks: {} applied, {} skipped, {} malformed",
                report.tasks.applied, report.tasks.skipped, report.tasks.malformed
            );
            println!(
                "decisions: {} applied, {} skipped, {} malformed",
                report.decisions.applied, report.decisions.skipped, report.decisions.malformed
            );
            for archive in [&report.tasks.archived_to, &report.decisions.archived_to]
                .into_iter()
                .flatten()
            {
                println!("archived: {}", archive.display());
            }
        }
        Commands::Velocity => {
            let orchestrator = build(&config, Arc::new(MemoryChannel::new("memory")))?;
            let summary = orchestrator.velocity().summary().await?;
            if summary.is_empty() {
                println!("No velocity records");
            }
            for (agent_id, velocity) in &summary {
                println!(
                    "{agent_id}: {} attempts, {:.0}% succeeded, mean {}ms",
                    velocity.attempts,
                    velocity.success_rate() * 100.0,
                    velocity.mean_duration_ms()
                );
            }
        }
        Commands::CheckConfig => {
            let orchestrator = &config.orchestrator;
            println!("Config OK: {}", cli.config.display());
            println!("  instance:   {}", orchestrator.instance_id);
            println!("  store:      {:?}", config.store.backend);
            println!("  data dir:   {}", config.data_dir.display());
            println!(
                "  retries:    {} (backoff {}ms..{}ms)",
                orchestrator.retry.max_retries,
                orchestrator.retry.backoff_base_ms,
                orchestrator.retry.backoff_max_ms
            );
            println!(
                "  heartbeat:  every {}s, unhealthy after {} missed",
                orchestrator.heartbeat_interval_secs, orchestrator.missed_heartbeats
            );
            if !orchestrator.capability_catalog.is_empty() {
                println!("  catalog:    {}", orchestrator.capability_catalog.join(", "));
            }
            for agent in &config.agents {
                println!("  agent {}: {}", agent.id, agent.capabilities.join(", "));
            }
        }
    }

    Ok(())
}

fn build(config: &SwitchboardConfig, channel: Arc<MemoryChannel>) -> anyhow::Result<Orchestrator> {
    let orchestrator = Orchestrator::builder(config.orchestrator.clone())
        .store(config.open_store()?)
        .channel(channel)
        .secrets(Arc::new(config.secret_store()))
        .journal_dir(config.journal_dir())
        .build()?;
    Ok(orchestrator)
}

/// Build the orchestrator, start the configured agents and replay anything
/// journaled by a previous run.
async fn start(config: &SwitchboardConfig) -> anyhow::Result<Arc<Orchestrator>> {
    let channel = Arc::new(MemoryChannel::new("memory"));
    let orchestrator = Arc::new(build(config, channel.clone())?);

    for agent_config in &config.agents {
        let agent = Arc::new(agent_config.build(channel.clone()));
        info!(
            agent_id = %agent.id(),
            capabilities = ?agent.capabilities(),
            "Starting loopback agent"
        );
        orchestrator.register_agent(agent).await?;
    }

    let recovery = orchestrator.recover_from_journal().await?;
    if recovery.tasks.applied > 0 {
        info!(tasks = recovery.tasks.applied, "Resumed journaled tasks");
    }

    let health = orchestrator.health().await;
    if health.status != HealthStatus::Healthy {
        warn!(status = %health.status, "Orchestrator starting with failing dependencies");
    }
    info!(
        instance_id = %health.instance_id,
        agents = health.agents.total,
        "Switchboard ready"
    );
    Ok(orchestrator)
}
