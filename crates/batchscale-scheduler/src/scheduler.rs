//! Scheduler facade.
//!
//! Wraps the raw backend with the filtering the rest of batchscale
//! relies on: job state filters, idle-only node listings, and
//! rejection-as-`false` node mutation.

use std::sync::Arc;

use tracing::{debug, warn};

use batchscale_core::{AdminState, BoxFuture, Job, JobState, Node, Partition};

use crate::error::SchedulerResult;

/// Raw access to a batch scheduler.
///
/// Implementations return fresh, unfiltered snapshots.
pub trait SchedulerBackend: Send + Sync {
    fn jobs(&self) -> BoxFuture<'_, SchedulerResult<Vec<Job>>>;

    fn nodes(&self) -> BoxFuture<'_, SchedulerResult<Vec<Node>>>;

    fn partitions(&self) -> BoxFuture<'_, SchedulerResult<Vec<Partition>>>;

    /// Request an administrative state change. `Ok(false)` means the
    /// scheduler rejected the request.
    fn update_node<'a>(
        &'a self,
        node: &'a str,
        state: AdminState,
        reason: Option<&'a str>,
    ) -> BoxFuture<'a, SchedulerResult<bool>>;
}

/// Uncached view of the scheduler's jobs, nodes, and partitions.
#[derive(Clone)]
pub struct Scheduler {
    backend: Arc<dyn SchedulerBackend>,
}

impl Scheduler {
    pub fn new(backend: Arc<dyn SchedulerBackend>) -> Self {
        Self { backend }
    }

    /// List jobs, restricted to `states` when given.
    pub async fn list_jobs(&self, states: Option<&[JobState]>) -> SchedulerResult<Vec<Job>> {
        let jobs = self.backend.jobs().await?;
        let jobs: Vec<Job> = match states {
            Some(states) => jobs
                .into_iter()
                .filter(|j| states.contains(&j.state))
                .collect(),
            None => jobs,
        };
        debug!(count = jobs.len(), ?states, "listed jobs");
        Ok(jobs)
    }

    /// List nodes; with `only_idle`, exactly the nodes whose state is idle.
    pub async fn list_nodes(&self, only_idle: bool) -> SchedulerResult<Vec<Node>> {
        let nodes = self.backend.nodes().await?;
        let nodes: Vec<Node> = if only_idle {
            nodes.into_iter().filter(Node::is_idle).collect()
        } else {
            nodes
        };
        debug!(count = nodes.len(), only_idle, "listed nodes");
        Ok(nodes)
    }

    pub async fn list_partitions(&self) -> SchedulerResult<Vec<Partition>> {
        self.backend.partitions().await
    }

    /// Look up a single node by name.
    pub async fn find_node(&self, name: &str) -> SchedulerResult<Option<Node>> {
        let nodes = self.backend.nodes().await?;
        Ok(nodes.into_iter().find(|n| n.name == name))
    }

    /// Set a node's administrative state.
    ///
    /// Returns `Ok(false)` when the scheduler rejects the change; only
    /// transport failures are errors.
    pub async fn set_node_state(
        &self,
        node: &Node,
        state: AdminState,
        reason: Option<&str>,
    ) -> SchedulerResult<bool> {
        let accepted = self.backend.update_node(&node.name, state, reason).await?;
        if accepted {
            debug!(node = %node.name, %state, "node state updated");
        } else {
            warn!(node = %node.name, %state, "scheduler rejected node state change");
        }
        Ok(accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use batchscale_core::NodeState;

    use crate::SchedulerError;

    #[derive(Default)]
    struct StaticBackend {
        jobs: Vec<Job>,
        nodes: Vec<Node>,
        reject: bool,
        unreachable: bool,
        updates: Mutex<Vec<(String, AdminState, Option<String>)>>,
    }

    impl SchedulerBackend for StaticBackend {
        fn jobs(&self) -> BoxFuture<'_, SchedulerResult<Vec<Job>>> {
            Box::pin(async move { Ok(self.jobs.clone()) })
        }

        fn nodes(&self) -> BoxFuture<'_, SchedulerResult<Vec<Node>>> {
            Box::pin(async move {
                if self.unreachable {
                    return Err(SchedulerError::Transport("connection refused".into()));
                }
                Ok(self.nodes.clone())
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
            reason: Option<&'a str>,
        ) -> BoxFuture<'a, SchedulerResult<bool>> {
            Box::pin(async move {
                self.updates.lock().unwrap().push((
                    node.to_string(),
                    state,
                    reason.map(str::to_string),
                ));
                Ok(!self.reject)
            })
        }
    }

    fn job(id: u64, state: JobState) -> Job {
        Job {
            id,
            state,
            state_reason: None,
            eligible_time: 0,
            run_time: 0,
        }
    }

    fn backend() -> StaticBackend {
        StaticBackend {
            jobs: vec![
                job(1, JobState::Pending),
                job(2, JobState::Running),
                job(3, JobState::Pending),
                job(4, JobState::Completed),
            ],
            nodes: vec![
                Node::new("worker0", "10.0.0.1", NodeState::Idle),
                Node::new("worker1", "10.0.0.2", NodeState::Allocated),
                Node::new("worker2", "10.0.0.3", NodeState::Drain),
            ],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn list_jobs_unfiltered_returns_everything() {
        let scheduler = Scheduler::new(Arc::new(backend()));
        assert_eq!(scheduler.list_jobs(None).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn list_jobs_filters_by_state() {
        let scheduler = Scheduler::new(Arc::new(backend()));
        let pending = scheduler
            .list_jobs(Some(&[JobState::Pending]))
            .await
            .unwrap();
        assert_eq!(pending.iter().map(|j| j.id).collect::<Vec<_>>(), vec![1, 3]);

        let done = scheduler
            .list_jobs(Some(&[JobState::Running, JobState::Completed]))
            .await
            .unwrap();
        assert_eq!(done.len(), 2);
    }

    #[tokio::test]
    async fn list_nodes_only_idle() {
        let scheduler = Scheduler::new(Arc::new(backend()));
        let idle = scheduler.list_nodes(true).await.unwrap();
        assert_eq!(idle.len(), 1);
        assert_eq!(idle[0].name, "worker0");
        assert_eq!(scheduler.list_nodes(false).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn find_node_by_name() {
        let scheduler = Scheduler::new(Arc::new(backend()));
        let node = scheduler.find_node("worker1").await.unwrap().unwrap();
        assert_eq!(node.ip, "10.0.0.2");
        assert!(scheduler.find_node("worker9").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn set_node_state_passes_reason_through() {
        let backend = Arc::new(backend());
        let scheduler = Scheduler::new(backend.clone());
        let node = Node::new("worker0", "10.0.0.1", NodeState::Idle);

        let ok = scheduler
            .set_node_state(&node, AdminState::Down, Some("scale-down"))
            .await
            .unwrap();
        assert!(ok);

        let updates = backend.updates.lock().unwrap();
        assert_eq!(
            updates[0],
            ("worker0".to_string(), AdminState::Down, Some("scale-down".to_string()))
        );
    }

    #[tokio::test]
    async fn rejection_is_false_not_error() {
        let mut b = backend();
        b.reject = true;
        let scheduler = Scheduler::new(Arc::new(b));
        let node = Node::new("worker0", "10.0.0.1", NodeState::Idle);
        let ok = scheduler
            .set_node_state(&node, AdminState::Drain, None)
            .await
            .unwrap();
        assert!(!ok);
    }

    #[tokio::test]
    async fn transport_failure_is_error() {
        let mut b = backend();
        b.unreachable = true;
        let scheduler = Scheduler::new(Arc::new(b));
        let err = scheduler.list_nodes(true).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Transport(_)));
    }
}
