use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use tokio::sync::watch;
use tracing::{info, warn};

use batchscale_autoscale::{Autoscaler, CycleOutcome, ScaleDecision};
use batchscale_configure::AnsibleApplier;
use batchscale_core::{Config, JobState};
use batchscale_nodes::{AddOutcome, NodeManager};
use batchscale_provision::OpenStackCli;
use batchscale_scheduler::{Scheduler, SlurmCli};

fn scheduler(config: &Config) -> Scheduler {
    Scheduler::new(Arc::new(SlurmCli::new(&config.scheduler)))
}

fn node_manager(config: &Config) -> anyhow::Result<NodeManager> {
    config.validate().context("invalid configuration")?;
    Ok(NodeManager::from_config(
        config,
        scheduler(config),
        Arc::new(OpenStackCli::new(config.provision.clone())),
        Arc::new(AnsibleApplier::new(config.configure.clone())),
    ))
}

fn autoscaler(config: &Config) -> anyhow::Result<Autoscaler> {
    Ok(Autoscaler::new(node_manager(config)?)
        .with_grace_period(Duration::from_secs(config.autoscale.grace_period_secs)))
}

pub async fn run(config: Config, interval: Option<u64>) -> anyhow::Result<()> {
    let interval = interval.unwrap_or(config.autoscale.poll_interval_secs);
    if interval == 0 {
        bail!("--interval must be positive");
    }
    let autoscaler = autoscaler(&config)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received, finishing current cycle");
        let _ = shutdown_tx.send(true);
    });

    autoscaler
        .run(Duration::from_secs(interval), shutdown_rx)
        .await;

    info!("batchscale daemon stopped");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => warn!(error = %e, "cannot install SIGTERM handler"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot install Ctrl-C handler");
        std::future::pending::<()>().await;
    }
}

pub async fn check(config: Config, dry_run: bool) -> anyhow::Result<()> {
    let autoscaler = autoscaler(&config)?;
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    let decision = autoscaler.evaluate(now).await?;
    match &decision {
        ScaleDecision::ScaleDown(idle) => {
            let names: Vec<&str> = idle.iter().map(|n| n.name.as_str()).collect();
            println!("scale down: {}", names.join(", "));
        }
        ScaleDecision::ScaleUp { waiting_jobs } => {
            println!("scale up: {waiting_jobs} waiting job(s)");
        }
        ScaleDecision::NoChange => println!("no change"),
    }
    if dry_run {
        return Ok(());
    }

    match autoscaler.execute(decision).await? {
        CycleOutcome::Removed { nodes, completed } if !completed => {
            bail!("reconfiguration failed; {} left down", nodes.join(", "))
        }
        CycleOutcome::Added(outcome) => report_add(outcome),
        _ => Ok(()),
    }
}

pub async fn nodes(config: &Config, idle: bool) -> anyhow::Result<()> {
    let nodes = scheduler(config).list_nodes(idle).await?;
    println!("{:<24} {:<40} STATE", "NAME", "ADDRESS");
    for node in nodes {
        println!("{:<24} {:<40} {}", node.name, node.ip, node.state);
    }
    Ok(())
}

pub async fn jobs(config: &Config, states: &[String]) -> anyhow::Result<()> {
    let filter: Vec<JobState> = states.iter().map(|s| JobState::parse(s)).collect();
    let filter = (!filter.is_empty()).then_some(filter.as_slice());

    let jobs = scheduler(config).list_jobs(filter).await?;
    println!("{:>10} {:<14} {:<20} {:>12} {:>10}", "JOBID", "STATE", "REASON", "ELIGIBLE", "RUNTIME");
    for job in jobs {
        println!(
            "{:>10} {:<14} {:<20} {:>12} {:>10}",
            job.id,
            job.state,
            job.state_reason.as_deref().unwrap_or("-"),
            job.eligible_time,
            job.run_time
        );
    }
    Ok(())
}

pub async fn partitions(config: &Config) -> anyhow::Result<()> {
    let partitions = scheduler(config).list_partitions().await?;
    println!("{:<24} STATE", "PARTITION");
    for partition in partitions {
        println!("{:<24} {}", partition.name, partition.state);
    }
    Ok(())
}

pub async fn add_node(config: Config) -> anyhow::Result<()> {
    let outcome = node_manager(&config)?.add_node().await?;
    report_add(outcome)
}

fn report_add(outcome: AddOutcome) -> anyhow::Result<()> {
    match outcome {
        AddOutcome::Joined(node) => {
            println!("added {} ({})", node.name, node.ip);
            Ok(())
        }
        AddOutcome::NodeNotFound { name } => {
            bail!("instance {name} was created but never joined the scheduler")
        }
    }
}

pub async fn remove_node(config: Config, names: &[String], delete: bool) -> anyhow::Result<()> {
    let manager = node_manager(&config)?;

    let mut targets = Vec::with_capacity(names.len());
    for name in names {
        match manager.scheduler().find_node(name).await? {
            Some(node) => targets.push(node),
            None => bail!("no scheduler node named {name}"),
        }
    }

    if !manager.remove_nodes(&targets, delete).await? {
        bail!("reconfiguration failed; nodes left down, instances kept");
    }
    for node in &targets {
        println!("removed {}", node.name);
    }
    Ok(())
}
