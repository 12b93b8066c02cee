//! Node lifecycle manager.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use batchscale_configure::{ApplyOutcome, ConfigurationApplier};
use batchscale_core::{AdminState, Config, Node, Server};
use batchscale_provision::{InstanceProvisioner, ProvisionError};
use batchscale_scheduler::Scheduler;

use crate::error::{NodeError, NodeResult};
use crate::lifecycle::{NodeLifecycle, transition};
use crate::naming::next_name;

/// Result of [`NodeManager::add_node`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    /// The new node is a scheduler member.
    Joined(Node),
    /// The instance exists but the scheduler never reported the node,
    /// either because configuration failed or it did not join in time.
    /// The instance is left running for a later cycle to reconcile.
    NodeNotFound { name: String },
}

/// Adds, removes, and reconfigures worker nodes.
///
/// Holds no membership state: every operation starts from a fresh
/// scheduler snapshot.
pub struct NodeManager {
    scheduler: Scheduler,
    provisioner: Arc<dyn InstanceProvisioner>,
    applier: Arc<dyn ConfigurationApplier>,
    prefix: String,
    down_reason: String,
    join_attempts: u32,
    join_delay: Duration,
}

impl NodeManager {
    pub fn new(
        scheduler: Scheduler,
        provisioner: Arc<dyn InstanceProvisioner>,
        applier: Arc<dyn ConfigurationApplier>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            scheduler,
            provisioner,
            applier,
            prefix: prefix.into(),
            down_reason: "batchscale scale-down".to_string(),
            join_attempts: 6,
            join_delay: Duration::from_secs(10),
        }
    }

    /// Build a manager with the prefix, reason, and join policy from `config`.
    pub fn from_config(
        config: &Config,
        scheduler: Scheduler,
        provisioner: Arc<dyn InstanceProvisioner>,
        applier: Arc<dyn ConfigurationApplier>,
    ) -> Self {
        Self::new(scheduler, provisioner, applier, &config.autoscale.node_prefix)
            .with_down_reason(&config.scheduler.down_reason)
            .with_join_policy(config.nodes.join_attempts, config.nodes.join_delay())
    }

    /// Reason recorded on nodes taken down for removal.
    pub fn with_down_reason(mut self, reason: impl Into<String>) -> Self {
        self.down_reason = reason.into();
        self
    }

    /// How many times, and how far apart, to look for a new node in the
    /// scheduler after a successful configuration run.
    pub fn with_join_policy(mut self, attempts: u32, delay: Duration) -> Self {
        self.join_attempts = attempts.max(1);
        self.join_delay = delay;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Current cluster members, as the scheduler reports them.
    pub async fn members(&self) -> NodeResult<Vec<Node>> {
        Ok(self.scheduler.list_nodes(false).await?)
    }

    /// Next unused name for `prefix`, computed from a fresh member list.
    pub async fn next_node_name(&self, prefix: &str) -> NodeResult<String> {
        let members = self.members().await?;
        Ok(next_name(prefix, members.iter().map(|n| n.name.as_str())))
    }

    /// Reconfigure the cluster to exactly `servers`.
    pub async fn configure(&self, servers: &[Server]) -> NodeResult<ApplyOutcome> {
        Ok(self.applier.apply(servers).await?)
    }

    /// Provision one node and configure it into the cluster.
    pub async fn add_node(&self) -> NodeResult<AddOutcome> {
        let name = self.next_node_name(&self.prefix).await?;
        let mut stage = transition(&name, NodeLifecycle::Unmanaged, NodeLifecycle::Provisioning);

        let instance = self.provisioner.create(&name).await.inspect_err(|e| {
            error!(node = %name, error = %e, "failed to provision node");
        })?;
        let new_server = instance
            .to_server()
            .ok_or_else(|| ProvisionError::NoAddress(name.clone()))?;
        stage = transition(&name, stage, NodeLifecycle::Configuring);

        let members = self.members().await?;
        if members.iter().any(|n| n.name == name) {
            error!(node = %name, "allocated name already in the cluster");
            return Err(NodeError::NameCollision(name));
        }
        let mut desired: Vec<Server> = members.iter().map(Server::from).collect();
        desired.push(new_server.clone());

        let outcome = self.configure(&desired).await?;
        if !outcome.success() {
            warn!(
                node = %name,
                instance = %new_server,
                exit_code = outcome.exit_code,
                "configuration failed; instance left running unconfigured"
            );
            transition(&name, stage, NodeLifecycle::Unmanaged);
            return Ok(AddOutcome::NodeNotFound { name });
        }

        for attempt in 1..=self.join_attempts {
            if let Some(node) = self.scheduler.find_node(&name).await? {
                transition(&name, stage, NodeLifecycle::Member);
                info!(node = %node.name, ip = %node.ip, "node added");
                return Ok(AddOutcome::Joined(node));
            }
            if attempt < self.join_attempts {
                debug!(node = %name, attempt, "waiting for scheduler to report node");
                tokio::time::sleep(self.join_delay).await;
            }
        }

        warn!(node = %name, attempts = self.join_attempts, "node configured but not reported by scheduler");
        Ok(AddOutcome::NodeNotFound { name })
    }

    /// Take `nodes` out of the cluster.
    ///
    /// Only entries that match a current member by (name, ip) are
    /// removed; anything else is skipped with a warning. Leaving nodes
    /// are marked down first, then the remaining members are applied,
    /// and only if that succeeds (and `delete` is set) are the backing
    /// instances terminated. Returns `false` when the apply fails.
    pub async fn remove_nodes(&self, nodes: &[Node], delete: bool) -> NodeResult<bool> {
        if nodes.is_empty() {
            debug!("no nodes to remove");
            return Ok(true);
        }

        let members = self.members().await?;
        let requested: HashSet<&Node> = nodes.iter().collect();
        let (leaving, staying): (Vec<&Node>, Vec<&Node>) =
            members.iter().partition(|m| requested.contains(m));

        for node in nodes {
            if !leaving.contains(&node) {
                warn!(node = %node.name, ip = %node.ip, "not a current cluster member; skipping");
            }
        }
        if leaving.is_empty() {
            return Ok(true);
        }

        let keep: Vec<Server> = staying.into_iter().map(Server::from).collect();
        let names: Vec<&str> = leaving.iter().map(|n| n.name.as_str()).collect();
        info!(nodes = ?names, remaining = keep.len(), "removing nodes");

        let mut stages = Vec::with_capacity(leaving.len());
        for node in &leaving {
            let mut stage = NodeLifecycle::observed(&node.state);
            if stage == NodeLifecycle::Member {
                stage = transition(&node.name, stage, NodeLifecycle::Draining);
            }
            let accepted = self
                .scheduler
                .set_node_state(node, AdminState::Down, Some(&self.down_reason))
                .await?;
            if !accepted {
                warn!(node = %node.name, "could not mark node down; removing anyway");
            } else if stage != NodeLifecycle::Down {
                stage = transition(&node.name, stage, NodeLifecycle::Down);
            }
            stages.push(stage);
        }

        let outcome = self.configure(&keep).await?;
        if !outcome.success() {
            warn!(
                nodes = ?names,
                exit_code = outcome.exit_code,
                "configuration failed; nodes left down but not deleted"
            );
            return Ok(false);
        }

        let last = if delete {
            let leaving_servers: Vec<Server> = leaving.iter().map(|n| n.to_server()).collect();
            let terminated = self.provisioner.delete(&leaving_servers).await.inspect_err(|e| {
                error!(nodes = ?names, error = %e, "failed to delete instances");
            })?;
            info!(nodes = ?names, terminated, "nodes removed");
            NodeLifecycle::Terminated
        } else {
            info!(nodes = ?names, "nodes removed from cluster; instances kept");
            NodeLifecycle::Unmanaged
        };
        for (node, stage) in leaving.iter().zip(stages) {
            transition(&node.name, stage, last);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchscale_core::NodeState;
    use batchscale_provision::ProvisionError;
    use batchscale_scheduler::SchedulerError;

    use crate::testing::{Call, FakeCluster};

    fn cluster_with(members: &[(&str, &str, NodeState)]) -> Arc<FakeCluster> {
        let cluster = FakeCluster::new();
        for (name, ip, state) in members {
            cluster.add_member(name, ip, state.clone());
        }
        cluster
    }

    #[tokio::test]
    async fn next_node_name_continues_past_gaps() {
        let cluster = cluster_with(&[
            ("worker0", "10.0.0.1", NodeState::Idle),
            ("worker2", "10.0.0.2", NodeState::Down),
            ("worker5", "10.0.0.3", NodeState::Drain),
            ("workerFoo", "10.0.0.4", NodeState::Idle),
        ]);
        let mgr = cluster.node_manager("worker");
        assert_eq!(mgr.next_node_name("worker").await.unwrap(), "worker6");
    }

    #[tokio::test]
    async fn next_node_name_starts_at_zero() {
        let cluster = cluster_with(&[("head", "10.0.0.1", NodeState::Idle)]);
        let mgr = cluster.node_manager("worker");
        assert_eq!(mgr.next_node_name("worker").await.unwrap(), "worker0");
    }

    #[tokio::test]
    async fn add_node_configures_full_member_list() {
        let cluster = cluster_with(&[("worker0", "10.0.0.1", NodeState::Allocated)]);
        let mgr = cluster.node_manager("worker");

        let outcome = mgr.add_node().await.unwrap();
        let AddOutcome::Joined(node) = outcome else {
            panic!("expected node to join, got {outcome:?}");
        };
        assert_eq!(node.name, "worker1");
        assert_eq!(node.state, NodeState::Idle);

        assert_eq!(
            cluster.mutations(),
            vec![
                Call::Create("worker1".to_string()),
                Call::Apply(vec!["worker0".to_string(), "worker1".to_string()]),
            ]
        );
        assert_eq!(cluster.node_names(), vec!["worker0", "worker1"]);
    }

    #[tokio::test]
    async fn add_node_failed_configuration_leaves_instance_unconfigured() {
        let cluster = cluster_with(&[("worker0", "10.0.0.1", NodeState::Allocated)]);
        cluster.fail_apply(true);
        let mgr = cluster.node_manager("worker");

        let outcome = mgr.add_node().await.unwrap();
        assert_eq!(
            outcome,
            AddOutcome::NodeNotFound {
                name: "worker1".to_string()
            }
        );
        assert_eq!(cluster.node_names(), vec!["worker0"]);
        assert!(cluster.instance_names().contains(&"worker1".to_string()));
        assert!(!cluster.calls().iter().any(|c| matches!(c, Call::Delete(_))));
    }

    #[tokio::test]
    async fn add_node_provision_failure_is_surfaced() {
        let cluster = cluster_with(&[]);
        cluster.fail_create(true);
        let mgr = cluster.node_manager("worker");

        let err = mgr.add_node().await.unwrap_err();
        assert!(matches!(
            err,
            NodeError::Provision(ProvisionError::Rejected { .. })
        ));
        assert!(!cluster.calls().iter().any(|c| matches!(c, Call::Apply(_))));
    }

    #[tokio::test]
    async fn add_node_not_reported_by_scheduler() {
        let cluster = cluster_with(&[]);
        cluster.hide_new_nodes(true);
        let mgr = cluster.node_manager("worker");

        let outcome = mgr.add_node().await.unwrap();
        assert!(matches!(outcome, AddOutcome::NodeNotFound { .. }));
    }

    #[tokio::test]
    async fn remove_nodes_marks_down_then_configures_then_deletes() {
        let cluster = cluster_with(&[
            ("worker0", "10.0.0.1", NodeState::Idle),
            ("worker1", "10.0.0.2", NodeState::Allocated),
        ]);
        let mgr = cluster.node_manager("worker");
        let idle = Node::new("worker0", "10.0.0.1", NodeState::Idle);

        assert!(mgr.remove_nodes(&[idle], true).await.unwrap());

        assert_eq!(
            cluster.mutations(),
            vec![
                Call::SetNodeState {
                    node: "worker0".to_string(),
                    state: AdminState::Down
                },
                Call::Apply(vec!["worker1".to_string()]),
                Call::Delete(vec!["worker0".to_string()]),
            ]
        );
        assert_eq!(cluster.node_names(), vec!["worker1"]);
        assert_eq!(cluster.instance_names(), vec!["worker1"]);
    }

    #[tokio::test]
    async fn remove_nodes_failed_configuration_never_deletes() {
        let cluster = cluster_with(&[
            ("worker0", "10.0.0.1", NodeState::Idle),
            ("worker1", "10.0.0.2", NodeState::Allocated),
        ]);
        cluster.fail_apply(true);
        let mgr = cluster.node_manager("worker");
        let idle = Node::new("worker0", "10.0.0.1", NodeState::Idle);

        assert!(!mgr.remove_nodes(&[idle], true).await.unwrap());

        assert!(!cluster.calls().iter().any(|c| matches!(c, Call::Delete(_))));
        let node = cluster
            .nodes()
            .into_iter()
            .find(|n| n.name == "worker0")
            .unwrap();
        assert_eq!(node.state, NodeState::Down);
        assert!(cluster.instance_names().contains(&"worker0".to_string()));
    }

    #[tokio::test]
    async fn remove_nodes_without_delete_keeps_instances() {
        let cluster = cluster_with(&[("worker0", "10.0.0.1", NodeState::Idle)]);
        let mgr = cluster.node_manager("worker");
        let idle = Node::new("worker0", "10.0.0.1", NodeState::Idle);

        assert!(mgr.remove_nodes(&[idle], false).await.unwrap());
        assert!(cluster.node_names().is_empty());
        assert_eq!(cluster.instance_names(), vec!["worker0"]);
    }

    #[tokio::test]
    async fn remove_nodes_proceeds_when_scheduler_rejects_down() {
        let cluster = cluster_with(&[
            ("worker0", "10.0.0.1", NodeState::Idle),
            ("worker1", "10.0.0.2", NodeState::Idle),
        ]);
        cluster.reject_state_changes(true);
        let mgr = cluster.node_manager("worker");
        let nodes = cluster.nodes();

        assert!(mgr.remove_nodes(&nodes, true).await.unwrap());
        assert_eq!(
            cluster.position(|c| matches!(c, Call::Apply(names) if names.is_empty())),
            Some(3)
        );
        assert!(cluster.instance_names().is_empty());
    }

    #[tokio::test]
    async fn remove_nodes_matches_on_name_and_ip() {
        let cluster = cluster_with(&[("worker0", "10.0.0.1", NodeState::Idle)]);
        let mgr = cluster.node_manager("worker");
        // Same name, stale address: not the current member.
        let stale = Node::new("worker0", "10.9.9.9", NodeState::Idle);

        assert!(mgr.remove_nodes(&[stale], true).await.unwrap());

        assert!(cluster.mutations().is_empty());
        assert_eq!(
            cluster.nodes(),
            vec![Node::new("worker0", "10.0.0.1", NodeState::Idle)]
        );
        assert_eq!(cluster.nodes()[0].state, NodeState::Idle);
        assert_eq!(cluster.instance_names(), vec!["worker0"]);
    }

    #[tokio::test]
    async fn remove_nodes_skips_stale_entries_and_removes_the_rest() {
        let cluster = cluster_with(&[
            ("worker0", "10.0.0.1", NodeState::Idle),
            ("worker1", "10.0.0.2", NodeState::Idle),
        ]);
        let mgr = cluster.node_manager("worker");
        let request = [
            Node::new("worker0", "10.9.9.9", NodeState::Idle),
            Node::new("worker1", "10.0.0.2", NodeState::Idle),
        ];

        assert!(mgr.remove_nodes(&request, true).await.unwrap());

        assert_eq!(
            cluster.mutations(),
            vec![
                Call::SetNodeState {
                    node: "worker1".to_string(),
                    state: AdminState::Down
                },
                Call::Apply(vec!["worker0".to_string()]),
                Call::Delete(vec!["worker1".to_string()]),
            ]
        );
        assert_eq!(cluster.nodes()[0].state, NodeState::Idle);
        assert_eq!(cluster.instance_names(), vec!["worker0"]);
    }

    #[tokio::test]
    async fn remove_nodes_aborts_on_scheduler_transport_error() {
        let cluster = cluster_with(&[
            ("worker0", "10.0.0.1", NodeState::Idle),
            ("worker1", "10.0.0.2", NodeState::Allocated),
        ]);
        cluster.fail_state_transport(true);
        let mgr = cluster.node_manager("worker");
        let idle = Node::new("worker0", "10.0.0.1", NodeState::Idle);

        let err = mgr.remove_nodes(&[idle], true).await.unwrap_err();

        assert!(matches!(
            err,
            NodeError::Scheduler(SchedulerError::Transport(_))
        ));
        assert!(!cluster
            .calls()
            .iter()
            .any(|c| matches!(c, Call::Apply(_) | Call::Delete(_))));
        assert_eq!(cluster.node_names(), vec!["worker0", "worker1"]);
        assert_eq!(cluster.instance_names(), vec!["worker0", "worker1"]);
    }

    #[tokio::test]
    async fn remove_nodes_refused_down_without_delete_keeps_instances() {
        let cluster = cluster_with(&[("worker0", "10.0.0.1", NodeState::Idle)]);
        cluster.reject_state_changes(true);
        let mgr = cluster.node_manager("worker");
        let idle = Node::new("worker0", "10.0.0.1", NodeState::Idle);

        assert!(mgr.remove_nodes(&[idle], false).await.unwrap());
        assert!(cluster.node_names().is_empty());
        assert_eq!(cluster.instance_names(), vec!["worker0"]);
    }

    #[tokio::test]
    async fn add_node_detects_name_taken_before_configuration() {
        let cluster = cluster_with(&[("worker0", "10.0.0.1", NodeState::Allocated)]);
        cluster.claim_created_names(true);
        let mgr = cluster.node_manager("worker");

        let err = mgr.add_node().await.unwrap_err();

        assert!(matches!(err, NodeError::NameCollision(ref name) if name == "worker1"));
        assert!(!cluster.calls().iter().any(|c| matches!(c, Call::Apply(_))));
    }

    #[tokio::test]
    async fn remove_nothing_is_a_no_op() {
        let cluster = cluster_with(&[("worker0", "10.0.0.1", NodeState::Idle)]);
        let mgr = cluster.node_manager("worker");

        assert!(mgr.remove_nodes(&[], true).await.unwrap());
        assert!(cluster.calls().is_empty());
    }

    #[tokio::test]
    async fn configure_twice_converges_to_same_membership() {
        let cluster = cluster_with(&[
            ("worker0", "10.0.0.1", NodeState::Idle),
            ("worker1", "10.0.0.2", NodeState::Allocated),
        ]);
        let mgr = cluster.node_manager("worker");
        let servers = vec![
            Server::new("worker1", "10.0.0.2"),
            Server::new("worker3", "10.0.0.4"),
        ];

        assert!(mgr.configure(&servers).await.unwrap().success());
        let first = cluster.nodes();
        assert!(mgr.configure(&servers).await.unwrap().success());
        let second = cluster.nodes();

        assert_eq!(first, second);
        assert_eq!(cluster.node_names(), vec!["worker1", "worker3"]);
    }
}
