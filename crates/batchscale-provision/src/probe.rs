//! Reachability probing for freshly created instances.

use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info, warn};

use batchscale_core::exec;

use crate::error::{ProvisionError, ProvisionResult};

const KEYGEN_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of a single connectivity attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    Reachable,
    Unreachable,
}

/// Bounded TCP reachability check.
#[derive(Debug, Clone)]
pub struct ReachabilityProbe {
    port: u16,
    attempt_timeout: Duration,
    retry_delay: Duration,
    max_attempts: u32,
}

impl ReachabilityProbe {
    pub fn new(port: u16, attempt_timeout: Duration, retry_delay: Duration, max_attempts: u32) -> Self {
        Self {
            port,
            attempt_timeout,
            retry_delay,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Single connection attempt against `ip`.
    pub async fn probe(&self, ip: &str) -> ProbeResult {
        let address = format_address(ip, self.port);
        match tokio::time::timeout(self.attempt_timeout, tokio::net::TcpStream::connect(&address)).await {
            Ok(Ok(_)) => ProbeResult::Reachable,
            Ok(Err(e)) => {
                debug!(error = %e, %address, "probe connection failed");
                ProbeResult::Unreachable
            }
            Err(_) => {
                debug!(%address, "probe timed out");
                ProbeResult::Unreachable
            }
        }
    }

    /// Probe until reachable or out of attempts.
    pub async fn wait(&self, name: &str, ip: &str) -> ProvisionResult<()> {
        for attempt in 1..=self.max_attempts {
            if self.probe(ip).await == ProbeResult::Reachable {
                info!(instance = %name, %ip, attempt, "instance reachable");
                return Ok(());
            }
            if attempt < self.max_attempts {
                debug!(instance = %name, %ip, attempt, "waiting for instance to become reachable");
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        warn!(instance = %name, %ip, attempts = self.max_attempts, "instance never became reachable");
        Err(ProvisionError::ReachabilityTimeout {
            name: name.to_string(),
            attempts: self.max_attempts,
        })
    }
}

/// Remove `host` from the user's `known_hosts` with `ssh-keygen -R`.
///
/// Private addresses are recycled between instances, so a stale key
/// would fail host key checking in the configuration run. Returns
/// whether the entry was removed; failures are only logged.
pub async fn forget_host_key(ssh_keygen: &str, host: &str) -> bool {
    let mut cmd = Command::new(ssh_keygen);
    cmd.arg("-R").arg(host);
    match exec::run(cmd, KEYGEN_TIMEOUT).await {
        Ok(out) if out.success() => {
            debug!(%host, "cleared known_hosts entry");
            true
        }
        Ok(out) => {
            debug!(%host, status = out.status, stderr = %out.stderr.trim(), "no known_hosts entry cleared");
            false
        }
        Err(e) => {
            warn!(%host, error = %e, "could not clear known_hosts entry");
            false
        }
    }
}

fn format_address(ip: &str, port: u16) -> String {
    if ip.contains(':') {
        format!("[{ip}]:{port}")
    } else {
        format!("{ip}:{port}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv6_addresses_are_bracketed() {
        assert_eq!(format_address("10.0.0.1", 22), "10.0.0.1:22");
        assert_eq!(format_address("fd00::1", 22), "[fd00::1]:22");
    }

    #[tokio::test]
    async fn listening_port_is_reachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let probe = ReachabilityProbe::new(port, Duration::from_secs(1), Duration::from_millis(10), 3);

        assert_eq!(probe.probe("127.0.0.1").await, ProbeResult::Reachable);
        probe.wait("worker0", "127.0.0.1").await.unwrap();
    }

    #[tokio::test]
    async fn closed_port_times_out_after_bounded_attempts() {
        // Bind then drop to find a port nobody listens on.
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let probe = ReachabilityProbe::new(port, Duration::from_millis(200), Duration::from_millis(10), 3);

        let err = probe.wait("worker0", "127.0.0.1").await.unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::ReachabilityTimeout { attempts: 3, .. }
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn forget_host_key_reports_keygen_result() {
        assert!(forget_host_key("true", "10.0.0.1").await);
        assert!(!forget_host_key("false", "10.0.0.1").await);
        assert!(!forget_host_key("/nonexistent/ssh-keygen", "10.0.0.1").await);
    }

    #[test]
    fn zero_attempts_is_clamped_to_one() {
        let probe = ReachabilityProbe::new(22, Duration::from_secs(1), Duration::from_secs(1), 0);
        assert_eq!(probe.max_attempts, 1);
    }
}
