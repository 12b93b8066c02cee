//! Domain types shared by every batchscale subsystem.
//!
//! Jobs and nodes are immutable snapshots as reported by the batch
//! scheduler. `Server` is the single (name, ip) value that flows between
//! the scheduler, the provisioning backend, and the configuration
//! executor; `Node` and `Instance` convert into it explicitly.

use std::fmt;
use std::hash::{Hash, Hasher};

// ── Jobs ──────────────────────────────────────────────────────────

/// Scheduler job state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JobState {
    Pending,
    Running,
    Cancelled,
    Configuring,
    Completing,
    Completed,
    Failed,
    Timeout,
    Preempted,
    NodeFail,
    SpecialExit,
    /// A state this crate does not model (e.g. `SUSPENDED`).
    Other(String),
}

impl JobState {
    /// Parse a scheduler state string such as `PENDING` or `NODE_FAIL`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" | "PD" => Self::Pending,
            "RUNNING" | "R" => Self::Running,
            "CANCELLED" | "CA" => Self::Cancelled,
            "CONFIGURING" | "CF" => Self::Configuring,
            "COMPLETING" | "CG" => Self::Completing,
            "COMPLETED" | "CD" => Self::Completed,
            "FAILED" | "F" => Self::Failed,
            "TIMEOUT" | "TO" => Self::Timeout,
            "PREEMPTED" | "PR" => Self::Preempted,
            "NODE_FAIL" | "NF" => Self::NodeFail,
            "SPECIAL_EXIT" | "SE" => Self::SpecialExit,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Cancelled => "CANCELLED",
            Self::Configuring => "CONFIGURING",
            Self::Completing => "COMPLETING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Timeout => "TIMEOUT",
            Self::Preempted => "PREEMPTED",
            Self::NodeFail => "NODE_FAIL",
            Self::SpecialExit => "SPECIAL_EXIT",
            Self::Other(s) => s,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a single scheduler job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: u64,
    pub state: JobState,
    /// Why the job is in its current state (`Resources`, `Priority`, ...).
    pub state_reason: Option<String>,
    /// Unix timestamp (seconds) after which the job may be scheduled.
    /// Zero when the scheduler does not report one.
    pub eligible_time: u64,
    /// Seconds the job has been running.
    pub run_time: u64,
}

impl Job {
    /// Whether the job has been eligible-but-blocked on resources or
    /// priority for longer than `grace_secs` at time `now`.
    pub fn is_waiting(&self, now: u64, grace_secs: u64) -> bool {
        let blocked = matches!(
            self.state_reason.as_deref(),
            Some("Resources") | Some("Priority")
        );
        blocked && now.saturating_sub(grace_secs) > self.eligible_time
    }
}

// ── Nodes ─────────────────────────────────────────────────────────

/// Scheduler-reported node state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeState {
    Idle,
    Allocated,
    Mixed,
    Completing,
    Down,
    Drain,
    Other(String),
}

impl NodeState {
    /// Parse a base state plus its flags (`IDLE`, `["IDLE", "DRAIN"]`,
    /// `IDLE+DRAIN`, ...). Drain and down flags dominate the base state.
    pub fn from_parts<S: AsRef<str>>(parts: &[S]) -> Self {
        let parts: Vec<String> = parts
            .iter()
            .flat_map(|p| p.as_ref().split('+').map(str::to_string).collect::<Vec<_>>())
            .map(|p| p.trim().trim_end_matches(['*', '~', '#', '%', '$', '@']).to_ascii_uppercase())
            .filter(|p| !p.is_empty())
            .collect();

        if parts.iter().any(|p| p.starts_with("DRAIN")) {
            return Self::Drain;
        }
        if parts.iter().any(|p| p == "DOWN") {
            return Self::Down;
        }
        match parts.first().map(String::as_str) {
            Some("IDLE") => Self::Idle,
            Some("ALLOCATED") | Some("ALLOC") => Self::Allocated,
            Some("MIXED") | Some("MIX") => Self::Mixed,
            Some("COMPLETING") | Some("COMP") => Self::Completing,
            Some(other) => Self::Other(other.to_string()),
            None => Self::Other(String::new()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Idle => "IDLE",
            Self::Allocated => "ALLOCATED",
            Self::Mixed => "MIXED",
            Self::Completing => "COMPLETING",
            Self::Down => "DOWN",
            Self::Drain => "DRAIN",
            Self::Other(s) => s,
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Administrative state a node can be moved into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminState {
    Drain,
    Down,
    Resume,
}

impl AdminState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Drain => "DRAIN",
            Self::Down => "DOWN",
            Self::Resume => "RESUME",
        }
    }
}

impl fmt::Display for AdminState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scheduler-visible cluster node.
///
/// Identity is the (name, ip) pair: two nodes compare equal when both
/// match, regardless of their current state.
#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub ip: String,
    pub state: NodeState,
}

impl Node {
    pub fn new(name: impl Into<String>, ip: impl Into<String>, state: NodeState) -> Self {
        Self {
            name: name.into(),
            ip: ip.into(),
            state,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.state == NodeState::Idle
    }

    /// The (name, ip) identity used for inventory and instance matching.
    pub fn to_server(&self) -> Server {
        Server::new(&self.name, &self.ip)
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.ip == other.ip
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.ip.hash(state);
    }
}

impl From<&Node> for Server {
    fn from(node: &Node) -> Self {
        node.to_server()
    }
}

/// A scheduler partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub name: String,
    pub state: String,
}

// ── Servers and instances ─────────────────────────────────────────

/// The (name, ip) pair that identifies a machine across the scheduler,
/// the cloud backend, and the configuration inventory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Server {
    pub name: String,
    pub ip: String,
}

impl Server {
    pub fn new(name: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ip: ip.into(),
        }
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.ip)
    }
}

/// A virtual machine returned by the provisioning backend.
///
/// Not scheduler-visible until it has been configured into the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    /// Backend identifier, when known.
    pub id: Option<String>,
    pub name: String,
    /// Private addresses, primary first. Never empty for a created instance.
    pub private_ips: Vec<String>,
}

impl Instance {
    pub fn primary_ip(&self) -> Option<&str> {
        self.private_ips.first().map(String::as_str)
    }

    /// The inventory identity of this instance, if it has an address.
    pub fn to_server(&self) -> Option<Server> {
        self.primary_ip().map(|ip| Server::new(&self.name, ip))
    }

    /// Whether this instance backs the given server identity.
    pub fn matches(&self, server: &Server) -> bool {
        self.name == server.name && self.private_ips.iter().any(|ip| *ip == server.ip)
    }
}
