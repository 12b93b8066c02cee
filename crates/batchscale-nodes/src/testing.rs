//! In-memory cluster for tests.
//!
//! `FakeCluster` plays scheduler, cloud backend, and configuration
//! executor at once. A successful apply makes the scheduler's node list
//! exactly the applied server set, so membership follows the inventory
//! the way it does on a real cluster. Every call is recorded in order.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use batchscale_configure::{ApplyOutcome, ConfigurationApplier, ConfigureResult};
use batchscale_core::{
    AdminState, BoxFuture, Instance, Job, JobState, Node, NodeState, Partition, Server,
};
use batchscale_provision::{InstanceProvisioner, ProvisionError, ProvisionResult};
use batchscale_scheduler::{Scheduler, SchedulerBackend, SchedulerError, SchedulerResult};

use crate::NodeManager;

/// A recorded call against the fake cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    ListJobs,
    ListNodes,
    SetNodeState { node: String, state: AdminState },
    Create(String),
    Delete(Vec<String>),
    Apply(Vec<String>),
}

impl Call {
    /// Whether the call changes cluster state.
    pub fn is_mutation(&self) -> bool {
        !matches!(self, Self::ListJobs | Self::ListNodes)
    }
}

#[derive(Default)]
struct Inner {
    nodes: Vec<Node>,
    jobs: Vec<Job>,
    instances: Vec<Instance>,
    launched: u32,
    fail_apply: bool,
    fail_create: bool,
    reject_state: bool,
    state_transport_down: bool,
    hide_new_nodes: bool,
    claim_created_names: bool,
    calls: Vec<Call>,
}

#[derive(Default)]
pub struct FakeCluster {
    inner: Mutex<Inner>,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a scheduler member with a matching live instance.
    pub fn add_member(&self, name: &str, ip: &str, state: NodeState) {
        let mut inner = self.lock();
        inner.nodes.push(Node::new(name, ip, state));
        inner.instances.push(Instance {
            id: Some(format!("id-{name}")),
            name: name.to_string(),
            private_ips: vec![ip.to_string()],
        });
    }

    pub fn add_job(&self, job: Job) {
        self.lock().jobs.push(job);
    }

    /// Add a pending job blocked for `reason`, eligible since `eligible_time`.
    pub fn add_pending_job(&self, id: u64, reason: &str, eligible_time: u64) {
        self.add_job(Job {
            id,
            state: JobState::Pending,
            state_reason: Some(reason.to_string()),
            eligible_time,
            run_time: 0,
        });
    }

    /// Make every configuration run exit nonzero.
    pub fn fail_apply(&self, fail: bool) {
        self.lock().fail_apply = fail;
    }

    /// Make the cloud backend reject instance creation.
    pub fn fail_create(&self, fail: bool) {
        self.lock().fail_create = fail;
    }

    /// Make the scheduler reject node state changes.
    pub fn reject_state_changes(&self, reject: bool) {
        self.lock().reject_state = reject;
    }

    /// Make node state updates fail as if the scheduler were unreachable.
    pub fn fail_state_transport(&self, fail: bool) {
        self.lock().state_transport_down = fail;
    }

    /// Have another process register each newly created name with the
    /// scheduler, under a different address, before it is configured.
    pub fn claim_created_names(&self, claim: bool) {
        self.lock().claim_created_names = claim;
    }

    /// Apply successfully but never report newly configured nodes.
    pub fn hide_new_nodes(&self, hide: bool) {
        self.lock().hide_new_nodes = hide;
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.lock().nodes.clone()
    }

    pub fn node_names(&self) -> Vec<String> {
        self.lock().nodes.iter().map(|n| n.name.clone()).collect()
    }

    pub fn instance_names(&self) -> Vec<String> {
        self.lock().instances.iter().map(|i| i.name.clone()).collect()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn mutations(&self) -> Vec<Call> {
        self.calls().into_iter().filter(Call::is_mutation).collect()
    }

    /// Position of the first call matching `pred`.
    pub fn position(&self, pred: impl Fn(&Call) -> bool) -> Option<usize> {
        self.calls().iter().position(pred)
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn scheduler(self: &Arc<Self>) -> Scheduler {
        Scheduler::new(self.clone())
    }

    /// A manager wired entirely to this cluster, with no join delay.
    pub fn node_manager(self: &Arc<Self>, prefix: &str) -> NodeManager {
        NodeManager::new(self.scheduler(), self.clone(), self.clone(), prefix)
            .with_join_policy(2, Duration::ZERO)
    }
}

impl SchedulerBackend for FakeCluster {
    fn jobs(&self) -> BoxFuture<'_, SchedulerResult<Vec<Job>>> {
        Box::pin(async move {
            let mut inner = self.lock();
            inner.calls.push(Call::ListJobs);
            Ok(inner.jobs.clone())
        })
    }

    fn nodes(&self) -> BoxFuture<'_, SchedulerResult<Vec<Node>>> {
        Box::pin(async move {
            let mut inner = self.lock();
            inner.calls.push(Call::ListNodes);
            Ok(inner.nodes.clone())
        })
    }

    fn partitions(&self) -> BoxFuture<'_, SchedulerResult<Vec<Partition>>> {
        Box::pin(async move {
            Ok(vec![Partition {
                name: "batch".to_string(),
                state: "UP".to_string(),
            }])
        })
    }

    fn update_node<'a>(
        &'a self,
        node: &'a str,
        state: AdminState,
        _reason: Option<&'a str>,
    ) -> BoxFuture<'a, SchedulerResult<bool>> {
        Box::pin(async move {
            let mut inner = self.lock();
            inner.calls.push(Call::SetNodeState {
                node: node.to_string(),
                state,
            });
            if inner.state_transport_down {
                return Err(SchedulerError::Transport("scontrol: connection refused".into()));
            }
            if inner.reject_state {
                return Ok(false);
            }
            let Some(n) = inner.nodes.iter_mut().find(|n| n.name == node) else {
                return Ok(false);
            };
            n.state = match state {
                AdminState::Down => NodeState::Down,
                AdminState::Drain => NodeState::Drain,
                AdminState::Resume => NodeState::Idle,
            };
            Ok(true)
        })
    }
}

impl InstanceProvisioner for FakeCluster {
    fn create<'a>(&'a self, name: &'a str) -> BoxFuture<'a, ProvisionResult<Instance>> {
        Box::pin(async move {
            let mut inner = self.lock();
            inner.calls.push(Call::Create(name.to_string()));
            if inner.fail_create {
                return Err(ProvisionError::Rejected {
                    name: name.to_string(),
                    reason: "quota exceeded".to_string(),
                });
            }
            inner.launched += 1;
            let instance = Instance {
                id: Some(format!("id-{name}")),
                name: name.to_string(),
                private_ips: vec![format!("10.0.1.{}", inner.launched)],
            };
            inner.instances.push(instance.clone());
            if inner.claim_created_names {
                inner.nodes.push(Node::new(name, "10.0.9.9", NodeState::Idle));
            }
            Ok(instance)
        })
    }

    fn delete<'a>(&'a self, servers: &'a [Server]) -> BoxFuture<'a, ProvisionResult<usize>> {
        Box::pin(async move {
            let mut inner = self.lock();
            inner
                .calls
                .push(Call::Delete(servers.iter().map(|s| s.name.clone()).collect()));
            let before = inner.instances.len();
            inner
                .instances
                .retain(|inst| !servers.iter().any(|s| inst.matches(s)));
            Ok(before - inner.instances.len())
        })
    }
}

impl ConfigurationApplier for FakeCluster {
    fn apply<'a>(&'a self, servers: &'a [Server]) -> BoxFuture<'a, ConfigureResult<ApplyOutcome>> {
        Box::pin(async move {
            let mut inner = self.lock();
            let mut names: Vec<String> = servers.iter().map(|s| s.name.clone()).collect();
            names.sort();
            inner.calls.push(Call::Apply(names));

            if inner.fail_apply {
                return Ok(ApplyOutcome {
                    exit_code: 2,
                    output: "fatal: [worker]: UNREACHABLE!".to_string(),
                });
            }

            let previous = std::mem::take(&mut inner.nodes);
            let hide = inner.hide_new_nodes;
            let mut seen = std::collections::HashSet::new();
            for server in servers {
                if !seen.insert(server) {
                    continue;
                }
                let existing = previous
                    .iter()
                    .find(|n| n.name == server.name && n.ip == server.ip);
                match existing {
                    Some(node) => inner.nodes.push(node.clone()),
                    None if hide => {}
                    None => inner
                        .nodes
                        .push(Node::new(&server.name, &server.ip, NodeState::Idle)),
                }
            }
            Ok(ApplyOutcome {
                exit_code: 0,
                output: format!("PLAY RECAP: {} hosts ok", servers.len()),
            })
        })
    }
}
