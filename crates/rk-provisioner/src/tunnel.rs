//! SSH tunnel management
//!
//! Spawns one `ssh -L` child process per forwarded kernel channel and owns
//! the child handles for their whole lifetime. Tunnels substitute for direct
//! network reachability when the kernel runs on a host the orchestrating
//! node cannot reach directly.

use std::collections::HashMap;
use std::process::Stdio;

use tokio::process::{Child, Command};

use rk_core::{ConfigError, KernelChannel, ProvisionerConfig, TunnelError};

use crate::ports::PortAllocator;
use crate::response::ConnectionInfo;

/// How long the passwordless-SSH probe may take before the host is
/// considered unreachable.
const SSH_PROBE_TIMEOUT_SECS: u64 = 10;

/// Owns the SSH tunnel child processes for one kernel
///
/// The tunnel map is owned exclusively by its provisioner instance; every
/// exit path releases the children it tracks.
pub struct TunnelManager {
    ssh_executable: String,
    ssh_port: u16,
    keep_alive_interval: u64,
    allocator: PortAllocator,
    tunnels: HashMap<KernelChannel, Child>,
}

impl TunnelManager {
    /// Create a tunnel manager, validating the configured port range
    pub fn new(config: &ProvisionerConfig) -> Result<Self, ConfigError> {
        Self::with_ssh_executable(config, "ssh")
    }

    /// Create a tunnel manager using a specific tunnel executable in place
    /// of `ssh(1)`
    pub(crate) fn with_ssh_executable(
        config: &ProvisionerConfig,
        ssh_executable: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let allocator = PortAllocator::new(&config.port_range, config.max_port_retries)?;
        Ok(Self {
            ssh_executable: ssh_executable.into(),
            ssh_port: config.ssh_port,
            keep_alive_interval: config.keep_alive_interval,
            allocator,
            tunnels: HashMap::new(),
        })
    }

    /// The port allocator backing this manager
    pub fn allocator(&self) -> &PortAllocator {
        &self.allocator
    }

    /// Number of tracked tunnel processes
    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    /// Whether any tunnel processes are tracked
    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }

    /// Whether a tunnel is tracked for the given channel
    pub fn contains(&self, channel: KernelChannel) -> bool {
        self.tunnels.contains_key(&channel)
    }

    /// Open tunnels for the five standard kernel channels
    ///
    /// Verifies passwordless SSH to `server` once, then forwards one local
    /// port per channel to the remote ports in `info`. Returns the local
    /// ports in channel order.
    pub async fn tunnel_to_kernel(
        &mut self,
        info: &ConnectionInfo,
        server: &str,
    ) -> Result<[u16; 5], TunnelError> {
        self.verify_passwordless_ssh(server).await?;

        let local_ports = self.allocator.select_ports(5)?;
        let remote_ports = info.channel_ports();
        let remote_ip = info.ip.as_str();

        for (i, channel) in KernelChannel::STANDARD.into_iter().enumerate() {
            self.create_tunnel(channel, local_ports[i], remote_ports[i], remote_ip, server)?;
        }

        Ok([
            local_ports[0],
            local_ports[1],
            local_ports[2],
            local_ports[3],
            local_ports[4],
        ])
    }

    /// Open a tunnel for a single one-off port
    ///
    /// Assumes passwordless SSH has already been verified for `server`.
    pub fn tunnel_to_port(
        &mut self,
        channel: KernelChannel,
        remote_ip: &str,
        remote_port: u16,
        server: &str,
    ) -> Result<u16, TunnelError> {
        let local_port = self.allocator.select_ports(1)?[0];
        self.create_tunnel(channel, local_port, remote_port, remote_ip, server)?;
        Ok(local_port)
    }

    /// Terminate the tunnel for one channel, if tracked
    ///
    /// Idempotent: terminating an absent channel is a no-op. Returns whether
    /// a tunnel was actually terminated.
    pub async fn terminate_one(&mut self, channel: KernelChannel) -> bool {
        match self.tunnels.remove(&channel) {
            Some(mut child) => {
                tracing::debug!("Terminating {} tunnel process", channel);
                let _ = child.start_kill();
                let _ = child.wait().await;
                true
            }
            None => false,
        }
    }

    /// Terminate every tracked tunnel
    pub async fn terminate_all(&mut self) {
        for (channel, mut child) in self.tunnels.drain() {
            tracing::debug!("Terminating {} tunnel process", channel);
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }

    /// Check that key-based, passwordless SSH to `server` works
    async fn verify_passwordless_ssh(&self, server: &str) -> Result<(), TunnelError> {
        let status = Command::new(&self.ssh_executable)
            .arg("-p")
            .arg(self.ssh_port.to_string())
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", SSH_PROBE_TIMEOUT_SECS))
            .arg(server)
            .arg("true")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        match status {
            Ok(status) if status.success() => Ok(()),
            _ => Err(TunnelError::PasswordlessSshRequired {
                host: server.to_string(),
            }),
        }
    }

    /// Spawn the tunnel child for one channel and record it
    ///
    /// The child runs in the foreground (no `-f`) so it stays owned by this
    /// process and can be terminated deterministically during cleanup.
    fn create_tunnel(
        &mut self,
        channel: KernelChannel,
        local_port: u16,
        remote_port: u16,
        remote_ip: &str,
        server: &str,
    ) -> Result<(), TunnelError> {
        tracing::debug!(
            "Creating SSH tunnel for '{}': 127.0.0.1:{} to {}:{}",
            channel,
            local_port,
            remote_ip,
            remote_port
        );

        let child = Command::new(&self.ssh_executable)
            .arg("-p")
            .arg(self.ssh_port.to_string())
            .arg("-o")
            .arg(format!("ServerAliveInterval={}", self.keep_alive_interval))
            .arg("-S")
            .arg("none")
            .arg("-N")
            .arg("-L")
            .arg(format!(
                "127.0.0.1:{}:{}:{}",
                local_port, remote_ip, remote_port
            ))
            .arg(server)
            .env_remove("SSH_ASKPASS")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TunnelError::Spawn {
                channel: channel.as_str().to_string(),
                source: e,
            })?;

        self.tunnels.insert(channel, child);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> TunnelManager {
        TunnelManager::new(&ProvisionerConfig::default()).unwrap()
    }

    // Stand-in tunnel child for tests that exercise tracking/termination
    // without requiring a reachable SSH host.
    fn fake_tunnel() -> Child {
        Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap()
    }

    #[test]
    fn test_new_rejects_invalid_port_range() {
        let config = ProvisionerConfig {
            port_range: "40000..40100".to_string(),
            ..Default::default()
        };
        assert!(TunnelManager::new(&config).is_err());
    }

    #[tokio::test]
    async fn test_terminate_one_idempotent() {
        let mut tunnels = manager();
        tunnels
            .tunnels
            .insert(KernelChannel::Communication, fake_tunnel());

        assert!(tunnels.terminate_one(KernelChannel::Communication).await);
        assert!(!tunnels.terminate_one(KernelChannel::Communication).await);
        assert!(!tunnels.terminate_one(KernelChannel::Shell).await);
        assert!(tunnels.is_empty());
    }

    #[tokio::test]
    async fn test_terminate_all_drains_tracking() {
        let mut tunnels = manager();
        for channel in KernelChannel::STANDARD {
            tunnels.tunnels.insert(channel, fake_tunnel());
        }
        assert_eq!(tunnels.len(), 5);

        tunnels.terminate_all().await;
        assert!(tunnels.is_empty());

        // Second pass is a no-op
        tunnels.terminate_all().await;
        assert!(tunnels.is_empty());
    }

    #[tokio::test]
    async fn test_verify_passwordless_ssh_unreachable_host() {
        let tunnels = manager();
        let result = tunnels
            .verify_passwordless_ssh("nonexistent-host.invalid")
            .await;
        assert!(matches!(
            result,
            Err(TunnelError::PasswordlessSshRequired { .. })
        ));
    }
}
