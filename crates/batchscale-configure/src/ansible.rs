//! ansible-playbook runner.

use std::ffi::OsString;

use tokio::process::Command;
use tracing::{debug, info, warn};

use batchscale_core::config::ConfigureConfig;
use batchscale_core::{BoxFuture, Server, exec};

use crate::error::ConfigureResult;
use crate::inventory::Inventory;
use crate::{ApplyOutcome, ConfigurationApplier};

/// Applies the worker set by rewriting the inventory and running the
/// site playbook.
pub struct AnsibleApplier {
    config: ConfigureConfig,
    inventory: Inventory,
}

impl AnsibleApplier {
    pub fn new(config: ConfigureConfig) -> Self {
        let inventory = Inventory::new(&config.controller, &config.worker_group).with_groups(
            config.controller_groups.clone(),
            config.worker_parent_groups.clone(),
        );
        Self { config, inventory }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.config.ansible_playbook_bin);
        cmd.arg("-i")
            .arg(&self.config.inventory_path)
            .arg(&self.config.playbook)
            .current_dir(&self.config.playbook_root);

        if let Some(venv) = &self.config.venv_path {
            let mut path = OsString::from(venv.join("bin"));
            if let Some(current) = std::env::var_os("PATH") {
                path.push(":");
                path.push(current);
            }
            cmd.env("PATH", path).env("VIRTUAL_ENV", venv);
        }
        cmd
    }
}

impl ConfigurationApplier for AnsibleApplier {
    fn apply<'a>(&'a self, servers: &'a [Server]) -> BoxFuture<'a, ConfigureResult<ApplyOutcome>> {
        Box::pin(async move {
            debug!(servers = ?servers, "configuring servers");
            self.inventory.write(&self.config.inventory_path, servers)?;

            info!(
                workers = servers.len(),
                playbook = %self.config.playbook.display(),
                "starting playbook run"
            );
            let out = exec::run(self.command(), self.config.timeout()).await?;
            let outcome = ApplyOutcome {
                exit_code: out.status,
                output: out.combined(),
            };

            if outcome.success() {
                info!("playbook run succeeded");
            } else {
                warn!(exit_code = outcome.exit_code, tail = %outcome.tail(20), "playbook run failed");
            }
            Ok(outcome)
        })
    }
}
