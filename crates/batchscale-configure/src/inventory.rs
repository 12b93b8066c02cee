//! Static inventory rendering.
//!
//! The group skeleton comes from config; only the worker group's host
//! lines change between applies. Hosts are sorted and deduplicated so the
//! same server set always renders the same file.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::Path;

use batchscale_core::Server;

use crate::error::{ConfigureError, ConfigureResult};

#[derive(Debug, Clone)]
pub struct Inventory {
    controller: String,
    worker_group: String,
    controller_groups: Vec<String>,
    worker_parent_groups: Vec<String>,
}

impl Inventory {
    /// Inventory with the default Slurm group layout.
    pub fn new(controller: impl Into<String>, worker_group: impl Into<String>) -> Self {
        Self {
            controller: controller.into(),
            worker_group: worker_group.into(),
            controller_groups: ["controllers", "slurmservers", "slurmclients"]
                .map(str::to_string)
                .to_vec(),
            worker_parent_groups: ["slurmclients", "slurmexechosts"].map(str::to_string).to_vec(),
        }
    }

    /// Replace the groups listing the controller and the groups the
    /// worker group is a child of.
    pub fn with_groups(mut self, controller_groups: Vec<String>, worker_parent_groups: Vec<String>) -> Self {
        self.controller_groups = controller_groups;
        self.worker_parent_groups = worker_parent_groups;
        self
    }

    pub fn render(&self, servers: &[Server]) -> String {
        let controller = &self.controller;
        let workers = &self.worker_group;
        let hosts: BTreeSet<&Server> = servers.iter().collect();

        let mut out = String::new();
        let _ = writeln!(out, "{controller} ansible_connection=local");
        for group in &self.controller_groups {
            let _ = writeln!(out, "\n[{group}]\n{controller}");
        }
        for group in &self.worker_parent_groups {
            let _ = writeln!(out, "\n[{group}:children]\n{workers}");
        }
        let _ = writeln!(out, "\n[{workers}]");
        for host in hosts {
            let _ = writeln!(out, "{} ansible_host={}", host.name, host.ip);
        }
        out
    }

    /// Render and replace the file at `path`.
    pub fn write(&self, path: &Path, servers: &[Server]) -> ConfigureResult<()> {
        let tmp = path.with_extension("tmp");
        let wrap = |source| ConfigureError::Inventory {
            path: path.to_path_buf(),
            source,
        };
        std::fs::write(&tmp, self.render(servers)).map_err(wrap)?;
        std::fs::rename(&tmp, path).map_err(wrap)
    }
}
