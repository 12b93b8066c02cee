//! OpenStack provisioner driven through the `openstack` CLI.
//!
//! Credentials come from the usual `OS_*` environment or `clouds.yaml`;
//! the launch profile (image, flavor, network, key pair, security
//! groups) comes from `[provision]` in the batchscale config.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio::process::Command;
use tracing::{error, info, warn};

use batchscale_core::config::ProvisionConfig;
use batchscale_core::{BoxFuture, Instance, Server, exec};

use crate::error::{ProvisionError, ProvisionResult};
use crate::probe::{ReachabilityProbe, forget_host_key};
use crate::InstanceProvisioner;

/// Per-call limit for list/delete requests.
const API_TIMEOUT: Duration = Duration::from_secs(120);

pub struct OpenStackCli {
    config: ProvisionConfig,
    probe: ReachabilityProbe,
}

impl OpenStackCli {
    pub fn new(config: ProvisionConfig) -> Self {
        let probe = ReachabilityProbe::new(
            config.ssh_port,
            config.probe_timeout(),
            config.retry_delay(),
            config.max_attempts,
        );
        Self { config, probe }
    }

    fn command(&self) -> Command {
        Command::new(&self.config.openstack_bin)
    }

    fn create_args(&self, name: &str) -> Vec<String> {
        let mut args = vec![
            "server".to_string(),
            "create".to_string(),
            "--image".to_string(),
            self.config.image_id.clone(),
            "--flavor".to_string(),
            self.config.instance_type.clone(),
            "--network".to_string(),
            self.config.network_id.clone(),
        ];
        if !self.config.key_pair.is_empty() {
            args.push("--key-name".to_string());
            args.push(self.config.key_pair.clone());
        }
        for group in &self.config.security_groups {
            args.push("--security-group".to_string());
            args.push(group.clone());
        }
        args.extend(["--wait", "-f", "json"].map(str::to_string));
        args.push(name.to_string());
        args
    }

    async fn launch(&self, name: &str) -> ProvisionResult<Instance> {
        let mut cmd = self.command();
        cmd.args(self.create_args(name));
        let out = exec::run(cmd, self.config.create_timeout()).await?;
        if !out.success() {
            return Err(ProvisionError::Rejected {
                name: name.to_string(),
                reason: out.stderr.trim().to_string(),
            });
        }

        let created: CreatedServer = serde_json::from_str(&out.stdout)
            .map_err(|e| ProvisionError::Parse(format!("server create: {e}")))?;
        let instance = Instance {
            id: Some(created.id),
            name: created.name,
            private_ips: parse_addresses(&created.addresses),
        };
        if instance.private_ips.is_empty() {
            return Err(ProvisionError::NoAddress(instance.name));
        }
        Ok(instance)
    }

    async fn list(&self) -> ProvisionResult<Vec<Instance>> {
        let mut cmd = self.command();
        cmd.args(["server", "list", "-f", "json"]);
        let out = exec::run(cmd, API_TIMEOUT).await?;
        if !out.success() {
            return Err(ProvisionError::Transport(format!(
                "server list exited with {}: {}",
                out.status,
                out.stderr.trim()
            )));
        }
        parse_server_list(&out.stdout)
    }

    async fn terminate(&self, instance: &Instance) -> ProvisionResult<()> {
        let id = instance.id.as_deref().unwrap_or(&instance.name);
        let mut cmd = self.command();
        cmd.args(["server", "delete", id]);
        let out = exec::run(cmd, API_TIMEOUT).await?;
        if !out.success() {
            return Err(ProvisionError::Rejected {
                name: instance.name.clone(),
                reason: out.stderr.trim().to_string(),
            });
        }
        Ok(())
    }
}

impl InstanceProvisioner for OpenStackCli {
    fn create<'a>(&'a self, name: &'a str) -> BoxFuture<'a, ProvisionResult<Instance>> {
        Box::pin(async move {
            info!(instance = %name, image = %self.config.image_id, flavor = %self.config.instance_type, "starting instance");
            let instance = self.launch(name).await.inspect_err(|e| {
                error!(instance = %name, error = %e, "instance create failed");
            })?;

            let ip = instance
                .primary_ip()
                .ok_or_else(|| ProvisionError::NoAddress(instance.name.clone()))?;
            let reachable = self.probe.wait(&instance.name, ip).await;
            if !self.config.ssh_keygen_bin.is_empty() {
                forget_host_key(&self.config.ssh_keygen_bin, ip).await;
            }
            reachable?;

            info!(instance = %instance.name, %ip, "instance started");
            Ok(instance)
        })
    }

    fn delete<'a>(&'a self, servers: &'a [Server]) -> BoxFuture<'a, ProvisionResult<usize>> {
        Box::pin(async move {
            let live = self.list().await?;
            let doomed: Vec<&Instance> = live
                .iter()
                .filter(|inst| servers.iter().any(|s| inst.matches(s)))
                .collect();

            for server in servers {
                if !live.iter().any(|inst| inst.matches(server)) {
                    warn!(%server, "no live instance found, skipping");
                }
            }

            for instance in &doomed {
                info!(instance = %instance.name, id = ?instance.id, "terminating instance");
                self.terminate(instance).await?;
            }
            Ok(doomed.len())
        })
    }
}

// ── Output parsing ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CreatedServer {
    id: String,
    name: String,
    #[serde(default)]
    addresses: Value,
}

#[derive(Debug, Deserialize)]
struct ListedServer {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Networks", default)]
    networks: Value,
}

fn parse_server_list(raw: &str) -> ProvisionResult<Vec<Instance>> {
    let listed: Vec<ListedServer> = serde_json::from_str(raw)
        .map_err(|e| ProvisionError::Parse(format!("server list: {e}")))?;
    Ok(listed
        .into_iter()
        .map(|s| Instance {
            id: Some(s.id),
            name: s.name,
            private_ips: parse_addresses(&s.networks),
        })
        .collect())
}

/// Extract addresses from either `"net=10.0.0.5, fd00::5; other=..."`
/// or `{"net": ["10.0.0.5", "fd00::5"]}`.
fn parse_addresses(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => s
            .split(';')
            .filter_map(|net| net.split_once('=').map(|(_, ips)| ips))
            .flat_map(|ips| ips.split(','))
            .map(|ip| ip.trim().to_string())
            .filter(|ip| !ip.is_empty())
            .collect(),
        Value::Object(map) => map
            .values()
            .filter_map(Value::as_array)
            .flatten()
            .filter_map(|ip| match ip {
                Value::String(s) => Some(s.clone()),
                Value::Object(o) => o.get("addr").and_then(Value::as_str).map(str::to_string),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ProvisionConfig {
        ProvisionConfig {
            image_id: "img-1".to_string(),
            network_id: "net-1".to_string(),
            security_groups: vec!["sg-a".to_string(), "sg-b".to_string()],
            ..ProvisionConfig::default()
        }
    }

    #[test]
    fn create_args_carry_launch_profile() {
        let cli = OpenStackCli::new(config());
        let args = cli.create_args("worker4");
        let joined = args.join(" ");
        assert!(joined.starts_with("server create --image img-1 --flavor m1.large --network net-1"));
        assert!(joined.contains("--security-group sg-a --security-group sg-b"));
        assert!(joined.contains("--key-name batchscale"));
        assert_eq!(args.last().map(String::as_str), Some("worker4"));
    }

    #[test]
    fn parses_string_addresses() {
        let v = Value::String("private=10.0.0.5, fd00::5; public=203.0.113.9".to_string());
        assert_eq!(parse_addresses(&v), vec!["10.0.0.5", "fd00::5", "203.0.113.9"]);
    }

    #[test]
    fn parses_map_addresses() {
        let v: Value = serde_json::from_str(r#"{"private": ["10.0.0.7"], "other": [{"addr": "10.1.0.7"}]}"#).unwrap();
        let mut ips = parse_addresses(&v);
        ips.sort();
        assert_eq!(ips, vec!["10.0.0.7", "10.1.0.7"]);
    }

    #[test]
    fn parses_server_list() {
        let raw = r#"[
            {"ID": "a1", "Name": "worker0", "Status": "ACTIVE", "Networks": "private=10.0.0.10"},
            {"ID": "a2", "Name": "worker1", "Status": "ACTIVE", "Networks": {"private": ["10.0.0.11"]}}
        ]"#;
        let servers = parse_server_list(raw).unwrap();
        assert_eq!(servers.len(), 2);
        assert!(servers[0].matches(&Server::new("worker0", "10.0.0.10")));
        assert!(servers[1].matches(&Server::new("worker1", "10.0.0.11")));
        assert_eq!(servers[1].id.as_deref(), Some("a2"));
    }

    #[tokio::test]
    async fn missing_cli_is_transport_error() {
        let mut cfg = config();
        cfg.openstack_bin = "/nonexistent/openstack".to_string();
        let cli = OpenStackCli::new(cfg);
        let err = cli.create("worker0").await.unwrap_err();
        assert!(matches!(err, ProvisionError::Transport(_)));

        let err = cli.delete(&[Server::new("worker0", "10.0.0.1")]).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Transport(_)));
    }
}
