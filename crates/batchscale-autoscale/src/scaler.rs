//! Queue-driven node scaling.
//!
//! Reads idle nodes and pending jobs from the scheduler, decides
//! whether to shrink or grow, and hands the decision to the node
//! lifecycle manager.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, error, info};

use batchscale_core::{Job, JobState, Node};
use batchscale_nodes::{AddOutcome, NodeManager};
use batchscale_scheduler::Scheduler;

/// What one cycle decided to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScaleDecision {
    /// Remove every currently idle node.
    ScaleDown(Vec<Node>),
    /// Add one node.
    ScaleUp { waiting_jobs: usize },
    /// No change needed.
    NoChange,
}

/// What one cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Idle nodes were taken out. `completed` is false when the
    /// reconfiguration failed and the nodes were left down but alive.
    Removed { nodes: Vec<String>, completed: bool },
    Added(AddOutcome),
    NoChange,
}

/// Number of jobs that have been eligible-but-blocked for longer than
/// `grace_secs` at time `now`.
pub fn count_waiting(jobs: &[Job], now: u64, grace_secs: u64) -> usize {
    jobs.iter().filter(|j| j.is_waiting(now, grace_secs)).count()
}

/// The autoscaler evaluates the queue and decides whether to scale the
/// worker fleet up or down.
pub struct Autoscaler {
    scheduler: Scheduler,
    nodes: NodeManager,
    /// Seconds a job must be eligible before it counts as waiting.
    grace_secs: u64,
}

impl Autoscaler {
    /// Create a new autoscaler with the default 300s grace period.
    pub fn new(nodes: NodeManager) -> Self {
        Self {
            scheduler: nodes.scheduler().clone(),
            nodes,
            grace_secs: 300,
        }
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_secs = grace.as_secs();
        self
    }

    pub fn nodes(&self) -> &NodeManager {
        &self.nodes
    }

    /// Count pending jobs that are genuinely starved at time `now`.
    pub async fn waiting_jobs(&self, now: u64) -> anyhow::Result<usize> {
        let pending = self.scheduler.list_jobs(Some(&[JobState::Pending])).await?;
        let waiting = count_waiting(&pending, now, self.grace_secs);
        debug!(pending = pending.len(), waiting, grace_secs = self.grace_secs, "evaluated queue");
        Ok(waiting)
    }

    /// Decide what this cycle should do, given the time `now`.
    pub async fn evaluate(&self, now: u64) -> anyhow::Result<ScaleDecision> {
        let idle = self.scheduler.list_nodes(true).await?;
        if !idle.is_empty() {
            return Ok(ScaleDecision::ScaleDown(idle));
        }

        let waiting_jobs = self.waiting_jobs(now).await?;
        if waiting_jobs > 0 {
            return Ok(ScaleDecision::ScaleUp { waiting_jobs });
        }

        Ok(ScaleDecision::NoChange)
    }

    /// Carry out a decision.
    pub async fn execute(&self, decision: ScaleDecision) -> anyhow::Result<CycleOutcome> {
        match decision {
            ScaleDecision::ScaleDown(idle) => {
                let names: Vec<String> = idle.iter().map(|n| n.name.clone()).collect();
                info!(nodes = ?names, "scaling down");
                let completed = self.nodes.remove_nodes(&idle, true).await?;
                Ok(CycleOutcome::Removed {
                    nodes: names,
                    completed,
                })
            }
            ScaleDecision::ScaleUp { waiting_jobs } => {
                info!(waiting_jobs, "scaling up");
                let outcome = self.nodes.add_node().await?;
                Ok(CycleOutcome::Added(outcome))
            }
            ScaleDecision::NoChange => {
                debug!("no scaling needed");
                Ok(CycleOutcome::NoChange)
            }
        }
    }

    /// Evaluate at `now` and act on the result.
    pub async fn run_cycle_at(&self, now: u64) -> anyhow::Result<CycleOutcome> {
        let decision = self.evaluate(now).await?;
        self.execute(decision).await
    }

    /// One full cycle against the current wall clock.
    pub async fn run_cycle(&self) -> anyhow::Result<CycleOutcome> {
        self.run_cycle_at(epoch_secs()).await
    }

    /// Run the autoscaler loop.
    ///
    /// Runs a cycle immediately, then one every `interval`. Cycle
    /// failures are logged and the loop waits for the next interval.
    pub async fn run(
        &self,
        interval: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        info!(
            interval_secs = interval.as_secs(),
            grace_secs = self.grace_secs,
            prefix = %self.nodes.prefix(),
            "autoscaler started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.run_cycle().await {
                Ok(outcome) => debug!(?outcome, "autoscale cycle finished"),
                Err(e) => error!(error = format!("{e:#}"), "autoscale cycle failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => break,
            }
        }

        info!("autoscaler shutting down");
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use batchscale_core::NodeState;
    use batchscale_nodes::testing::{Call, FakeCluster};

    const NOW: u64 = 1_700_000_000;

    fn scaler(cluster: &Arc<FakeCluster>) -> Autoscaler {
        Autoscaler::new(cluster.node_manager("worker"))
    }

    fn pending(id: u64, reason: Option<&str>, eligible_time: u64) -> Job {
        Job {
            id,
            state: JobState::Pending,
            state_reason: reason.map(str::to_string),
            eligible_time,
            run_time: 0,
        }
    }

    #[test]
    fn count_waiting_applies_grace_and_reason() {
        let jobs = vec![
            pending(1, Some("Resources"), NOW - 400),
            pending(2, Some("Resources"), NOW - 100),
            pending(3, Some("Priority"), NOW - 1000),
            pending(4, Some("Dependency"), NOW - 1000),
            pending(5, None, NOW - 1000),
        ];
        assert_eq!(count_waiting(&jobs, NOW, 300), 2);
        assert_eq!(count_waiting(&jobs, NOW, 0), 3);
    }

    #[tokio::test]
    async fn quiet_cluster_makes_no_mutations() {
        let cluster = FakeCluster::new();
        cluster.add_member("worker0", "10.0.0.1", NodeState::Allocated);
        cluster.add_pending_job(1, "Resources", NOW - 100);
        cluster.add_pending_job(2, "Dependency", NOW - 1000);

        let outcome = scaler(&cluster).run_cycle_at(NOW).await.unwrap();

        assert_eq!(outcome, CycleOutcome::NoChange);
        assert!(cluster.mutations().is_empty());
    }

    #[tokio::test]
    async fn idle_nodes_take_priority_over_waiting_jobs() {
        let cluster = FakeCluster::new();
        cluster.add_member("worker0", "10.0.0.1", NodeState::Idle);
        cluster.add_pending_job(1, "Resources", NOW - 4000);

        let outcome = scaler(&cluster).run_cycle_at(NOW).await.unwrap();

        assert!(matches!(outcome, CycleOutcome::Removed { completed: true, .. }));
        assert!(!cluster.calls().iter().any(|c| matches!(c, Call::Create(_))));
        assert!(!cluster.calls().contains(&Call::ListJobs));
    }

    #[tokio::test]
    async fn grace_period_filters_recent_jobs() {
        let cluster = FakeCluster::new();
        cluster.add_pending_job(1, "Resources", NOW - 100);
        let s = scaler(&cluster);
        assert_eq!(s.evaluate(NOW).await.unwrap(), ScaleDecision::NoChange);

        cluster.add_pending_job(2, "Resources", NOW - 400);
        assert_eq!(
            s.evaluate(NOW).await.unwrap(),
            ScaleDecision::ScaleUp { waiting_jobs: 1 }
        );
    }

    #[tokio::test]
    async fn custom_grace_period() {
        let cluster = FakeCluster::new();
        cluster.add_pending_job(1, "Priority", NOW - 100);
        let s = scaler(&cluster).with_grace_period(Duration::from_secs(60));
        assert_eq!(
            s.evaluate(NOW).await.unwrap(),
            ScaleDecision::ScaleUp { waiting_jobs: 1 }
        );
    }

    #[tokio::test]
    async fn removes_idle_node_and_keeps_busy_one() {
        let cluster = FakeCluster::new();
        cluster.add_member("nodeA", "10.0.0.1", NodeState::Idle);
        cluster.add_member("nodeB", "10.0.0.2", NodeState::Allocated);
        cluster.add_pending_job(1, "Priority", NOW - 600);

        let outcome = scaler(&cluster).run_cycle_at(NOW).await.unwrap();

        assert_eq!(
            outcome,
            CycleOutcome::Removed {
                nodes: vec!["nodeA".to_string()],
                completed: true
            }
        );
        assert_eq!(cluster.node_names(), vec!["nodeB"]);
        assert_eq!(cluster.instance_names(), vec!["nodeB"]);
        assert!(!cluster.calls().iter().any(|c| matches!(c, Call::Create(_))));
    }

    #[tokio::test]
    async fn adds_exactly_one_node_with_next_free_suffix() {
        let cluster = FakeCluster::new();
        cluster.add_member("worker0", "10.0.0.1", NodeState::Allocated);
        cluster.add_member("worker3", "10.0.0.4", NodeState::Mixed);
        cluster.add_pending_job(1, "Resources", NOW - 400);
        cluster.add_pending_job(2, "Resources", NOW - 100);
        cluster.add_pending_job(3, "Dependency", NOW - 1000);

        let outcome = scaler(&cluster).run_cycle_at(NOW).await.unwrap();

        let creates: Vec<Call> = cluster
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Create(_)))
            .collect();
        assert_eq!(creates, vec![Call::Create("worker4".to_string())]);
        let CycleOutcome::Added(AddOutcome::Joined(node)) = outcome else {
            panic!("expected a joined node, got {outcome:?}");
        };
        assert_eq!(node.name, "worker4");
    }

    #[tokio::test]
    async fn failed_removal_reports_incomplete() {
        let cluster = FakeCluster::new();
        cluster.add_member("worker0", "10.0.0.1", NodeState::Idle);
        cluster.fail_apply(true);

        let outcome = scaler(&cluster).run_cycle_at(NOW).await.unwrap();

        assert_eq!(
            outcome,
            CycleOutcome::Removed {
                nodes: vec!["worker0".to_string()],
                completed: false
            }
        );
        assert_eq!(cluster.instance_names(), vec!["worker0"]);
    }

    #[tokio::test]
    async fn provision_failure_fails_the_cycle() {
        let cluster = FakeCluster::new();
        cluster.add_pending_job(1, "Resources", NOW - 400);
        cluster.fail_create(true);

        let err = scaler(&cluster).run_cycle_at(NOW).await.unwrap_err();
        assert!(err.to_string().contains("provisioning error"));
    }

    #[tokio::test]
    async fn run_stops_immediately_when_already_shut_down() {
        let cluster = FakeCluster::new();
        let (_tx, rx) = tokio::sync::watch::channel(true);

        scaler(&cluster).run(Duration::from_secs(3600), rx).await;
        assert!(cluster.calls().is_empty());
    }

    #[tokio::test]
    async fn run_finishes_cycle_then_honours_shutdown() {
        let cluster = FakeCluster::new();
        cluster.add_member("worker0", "10.0.0.1", NodeState::Allocated);
        let (tx, rx) = tokio::sync::watch::channel(false);
        let s = scaler(&cluster);

        tokio::join!(s.run(Duration::from_secs(3600), rx), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = tx.send(true);
        });

        // Exactly one cycle: idle-node query then the pending-job query.
        assert_eq!(cluster.calls(), vec![Call::ListNodes, Call::ListJobs]);
    }
}
