//! Slurm backend driven through the `squeue` and `scontrol` CLIs.
//!
//! Uses the `--json` output of Slurm 21.08+. Field encodings differ
//! between data parser versions: numbers may be plain or wrapped as
//! `{"set": true, "number": N}`, and states may be a string or a list
//! of flags. Both shapes are accepted.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use batchscale_core::config::SchedulerConfig;
use batchscale_core::{AdminState, BoxFuture, Job, JobState, Node, NodeState, Partition, exec};

use crate::error::{SchedulerError, SchedulerResult};
use crate::scheduler::SchedulerBackend;

/// Scheduler backend that shells out to the Slurm CLI.
#[derive(Debug, Clone)]
pub struct SlurmCli {
    squeue: String,
    scontrol: String,
    timeout: Duration,
}

impl SlurmCli {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            squeue: config.squeue_bin.clone(),
            scontrol: config.scontrol_bin.clone(),
            timeout: Duration::from_secs(config.command_timeout_secs),
        }
    }

    async fn query(&self, program: &str, args: &[&str]) -> SchedulerResult<String> {
        let mut cmd = Command::new(program);
        cmd.args(args);
        let out = exec::run(cmd, self.timeout).await?;
        if !out.success() {
            return Err(SchedulerError::Transport(format!(
                "{program} exited with {}: {}",
                out.status,
                out.stderr.trim()
            )));
        }
        Ok(out.stdout)
    }
}

impl SchedulerBackend for SlurmCli {
    fn jobs(&self) -> BoxFuture<'_, SchedulerResult<Vec<Job>>> {
        Box::pin(async move {
            let raw = self.query(&self.squeue, &["--all", "--json"]).await?;
            parse_jobs(&raw, epoch_secs())
        })
    }

    fn nodes(&self) -> BoxFuture<'_, SchedulerResult<Vec<Node>>> {
        Box::pin(async move {
            let raw = self.query(&self.scontrol, &["--json", "show", "nodes"]).await?;
            parse_nodes(&raw)
        })
    }

    fn partitions(&self) -> BoxFuture<'_, SchedulerResult<Vec<Partition>>> {
        Box::pin(async move {
            let raw = self
                .query(&self.scontrol, &["--json", "show", "partitions"])
                .await?;
            parse_partitions(&raw)
        })
    }

    fn update_node<'a>(
        &'a self,
        node: &'a str,
        state: AdminState,
        reason: Option<&'a str>,
    ) -> BoxFuture<'a, SchedulerResult<bool>> {
        Box::pin(async move {
            let mut cmd = Command::new(&self.scontrol);
            cmd.arg("update")
                .arg(format!("NodeName={node}"))
                .arg(format!("State={}", state.as_str()));
            // Slurm refuses DOWN/DRAIN without a reason.
            let reason = match (reason, state) {
                (Some(r), _) => Some(r),
                (None, AdminState::Resume) => None,
                (None, _) => Some("batchscale"),
            };
            if let Some(reason) = reason {
                cmd.arg(format!("Reason={reason}"));
            }

            let out = exec::run(cmd, self.timeout).await?;
            if !out.success() {
                debug!(%node, %state, stderr = %out.stderr.trim(), "scontrol update rejected");
            }
            Ok(out.success())
        })
    }
}

// ── JSON shapes ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SlurmNumber {
    Plain(i64),
    Wrapped {
        #[serde(default)]
        set: bool,
        #[serde(default)]
        infinite: bool,
        #[serde(default)]
        number: i64,
    },
}

impl SlurmNumber {
    fn value(&self) -> Option<u64> {
        match *self {
            Self::Plain(n) => u64::try_from(n).ok(),
            Self::Wrapped {
                set: true,
                infinite: false,
                number,
            } => u64::try_from(number).ok(),
            Self::Wrapped { .. } => None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SlurmState {
    One(String),
    Many(Vec<String>),
}

impl SlurmState {
    fn parts(&self) -> Vec<String> {
        match self {
            Self::One(s) => vec![s.clone()],
            Self::Many(v) => v.clone(),
        }
    }

    fn joined(&self) -> String {
        self.parts().join("+")
    }
}

#[derive(Debug, Deserialize)]
struct JobsResponse {
    #[serde(default)]
    jobs: Vec<RawJob>,
}

#[derive(Debug, Deserialize)]
struct RawJob {
    job_id: u64,
    job_state: SlurmState,
    #[serde(default)]
    state_reason: Option<String>,
    #[serde(default)]
    eligible_time: Option<SlurmNumber>,
    #[serde(default)]
    start_time: Option<SlurmNumber>,
}

#[derive(Debug, Deserialize)]
struct NodesResponse {
    #[serde(default)]
    nodes: Vec<RawNode>,
}

#[derive(Debug, Deserialize)]
struct RawNode {
    name: String,
    #[serde(default)]
    address: Option<String>,
    state: SlurmState,
}

#[derive(Debug, Deserialize)]
struct PartitionsResponse {
    #[serde(default)]
    partitions: Vec<RawPartition>,
}

#[derive(Debug, Deserialize)]
struct RawPartition {
    name: String,
    #[serde(default)]
    state: Option<SlurmState>,
    #[serde(default)]
    partition: Option<RawPartitionInner>,
}

#[derive(Debug, Deserialize)]
struct RawPartitionInner {
    #[serde(default)]
    state: Option<SlurmState>,
}

fn parse_jobs(raw: &str, now: u64) -> SchedulerResult<Vec<Job>> {
    let resp: JobsResponse =
        serde_json::from_str(raw).map_err(|e| SchedulerError::Parse(format!("jobs: {e}")))?;

    Ok(resp
        .jobs
        .into_iter()
        .map(|j| {
            let state = j
                .job_state
                .parts()
                .first()
                .map(|s| JobState::parse(s))
                .unwrap_or_else(|| JobState::Other(String::new()));
            let start = j.start_time.as_ref().and_then(SlurmNumber::value).unwrap_or(0);
            let run_time = if state == JobState::Running && start > 0 {
                now.saturating_sub(start)
            } else {
                0
            };
            Job {
                id: j.job_id,
                state,
                state_reason: j.state_reason.filter(|r| !r.is_empty() && r != "None"),
                eligible_time: j.eligible_time.as_ref().and_then(SlurmNumber::value).unwrap_or(0),
                run_time,
            }
        })
        .collect())
}

fn parse_nodes(raw: &str) -> SchedulerResult<Vec<Node>> {
    let resp: NodesResponse =
        serde_json::from_str(raw).map_err(|e| SchedulerError::Parse(format!("nodes: {e}")))?;

    Ok(resp
        .nodes
        .into_iter()
        .map(|n| {
            let ip = n.address.unwrap_or_else(|| n.name.clone());
            Node::new(n.name, ip, NodeState::from_parts(&n.state.parts()))
        })
        .collect())
}

fn parse_partitions(raw: &str) -> SchedulerResult<Vec<Partition>> {
    let resp: PartitionsResponse = serde_json::from_str(raw)
        .map_err(|e| SchedulerError::Parse(format!("partitions: {e}")))?;

    Ok(resp
        .partitions
        .into_iter()
        .map(|p| {
            let state = p
                .state
                .or_else(|| p.partition.and_then(|inner| inner.state))
                .map(|s| s.joined())
                .unwrap_or_default();
            Partition {
                name: p.name,
                state,
            }
        })
        .collect())
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
