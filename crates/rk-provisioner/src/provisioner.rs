//! Kernel provisioner contract and shared lifecycle core
//!
//! A provisioner is the per-kernel controller implementing
//! launch/poll/signal/kill/cleanup. The variant-independent machinery
//! (authorization, env finalization, confirmation, tunnel setup, signal
//! dispatch, persistence) lives in [`ProvisionerCore`]; the process and
//! container variants compose it and supply their own process model.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Child;

use rk_core::{ConfigError, KernelChannel, KernelId, ProvisionerConfig, ProvisionerError};

use crate::confirm::ConfirmationEngine;
use crate::response::{ConnectionInfo, ResponseChannel};
use crate::signal::{SignalDispatcher, SignalOutcome};
use crate::tunnel::TunnelManager;

/// Env keys scrubbed before launch; they are sensitive or just noise
const ENV_POP_LIST: [&str; 2] = ["RP_REMOTE_PWD", "LS_COLORS"];

/// The per-kernel lifecycle contract
///
/// `pre_launch` validates authorization and configuration, `launch_kernel`
/// starts the underlying process/container and drives confirmation, and the
/// remaining operations route through the signal dispatcher and the
/// variant's own process introspection.
#[async_trait]
pub trait KernelProvisioner: Send {
    /// Identifier of the kernel this provisioner controls
    fn kernel_id(&self) -> &KernelId;

    /// Whether the provisioner is currently managing a kernel process
    fn has_process(&self) -> bool;

    /// The merged connection info downstream consumers use to reach the
    /// kernel; mutated only by the confirmation step
    fn connection_info(&self) -> &serde_json::Map<String, serde_json::Value>;

    /// Prepare for launch: reset state, resolve the kernel user, enforce
    /// authorization, finalize the launch env
    async fn pre_launch(
        &mut self,
        env: &mut HashMap<String, String>,
    ) -> Result<(), ProvisionerError>;

    /// Start the kernel and confirm it has become reachable
    async fn launch_kernel(
        &mut self,
        cmd: &[String],
        env: &HashMap<String, String>,
    ) -> Result<(), ProvisionerError>;

    /// Confirm the launched kernel has started and returned its connection
    /// information
    async fn confirm_remote_startup(&mut self) -> Result<(), ProvisionerError>;

    /// Check liveness: `None` while the kernel is (or may still be coming)
    /// alive, `Some(code)` once it is known to be gone
    async fn poll(&mut self) -> Option<i32>;

    /// Wait for the kernel process to terminate, bounded by the configured
    /// poll budget when no local handle exists
    async fn wait(&mut self) -> Option<i32>;

    /// Deliver a signal. `signum == 0` is a liveness probe (equivalent to
    /// `poll`); the forced-kill signal is routed to `kill`.
    async fn send_signal(&mut self, signum: i32) -> Result<(), ProvisionerError>;

    /// Forcefully kill the kernel (non-catchable)
    async fn kill(&mut self, restart: bool) -> Result<(), ProvisionerError>;

    /// Terminate the kernel (catchable where the variant distinguishes)
    async fn terminate(&mut self, restart: bool) -> Result<(), ProvisionerError>;

    /// Release every resource held on behalf of the kernel
    async fn cleanup(&mut self, restart: bool) -> Result<(), ProvisionerError>;

    /// Hook invoked after a graceful shutdown has been requested of the
    /// kernel itself; instructs the launcher listener to stand down
    async fn shutdown_requested(&mut self) -> Result<(), ProvisionerError>;

    /// Capture state needed to recover this provisioner in a new session
    fn get_provisioner_info(&self) -> serde_json::Map<String, serde_json::Value>;

    /// Restore state captured by [`Self::get_provisioner_info`]
    fn load_provisioner_info(&mut self, info: &serde_json::Map<String, serde_json::Value>);
}

/// Mutable per-kernel state, owned exclusively by its provisioner
///
/// Fully reset at the start of every `pre_launch` so a retried launch
/// starts from a clean slate.
#[derive(Debug, Default)]
pub struct ProvisionerState {
    /// Host the kernel actually started on; tunnel/port logic may run only
    /// once this is non-empty
    pub assigned_host: String,
    /// IP of the assigned host
    pub assigned_ip: Option<String>,
    /// IP used to reach the kernel (local until confirmation says otherwise)
    pub ip: Option<String>,
    /// Resolved kernel user name
    pub kernel_username: String,
    /// Local process id; 0 when no locally-observable process exists
    pub pid: i32,
    /// Local process-group id; 0 when unknown
    pub pgid: i32,
    /// Address of the kernel's in-band listener, if one was established
    pub comm_ip: Option<String>,
    /// Port of the in-band listener; 0 means "not established"
    pub comm_port: u16,
    /// Merged transport parameters for downstream consumers
    pub connection_info: serde_json::Map<String, serde_json::Value>,
    /// Pre-tunnel connection info, kept when tunneling rewrites the ports
    pub tunneled_connection_info: Option<serde_json::Map<String, serde_json::Value>>,
}

impl ProvisionerState {
    fn reset(&mut self) {
        *self = ProvisionerState::default();
    }
}

/// Variant-independent lifecycle machinery for one kernel
pub struct ProvisionerCore {
    pub kernel_id: KernelId,
    pub config: ProvisionerConfig,
    pub state: ProvisionerState,
    pub tunnels: TunnelManager,
    pub responses: Arc<dyn ResponseChannel>,
    /// The locally-spawned launch process, if any. Often short-lived: for
    /// remote kernels it exists only until the launcher has handed off.
    pub local_proc: Option<Child>,
}

impl ProvisionerCore {
    /// Create the core, validating configuration
    ///
    /// Port-range violations surface here, before any launch is attempted.
    pub fn new(
        kernel_id: KernelId,
        config: ProvisionerConfig,
        responses: Arc<dyn ResponseChannel>,
    ) -> Result<Self, ProvisionerError> {
        let tunnels = TunnelManager::new(&config)?;
        Ok(Self {
            kernel_id,
            config,
            state: ProvisionerState::default(),
            tunnels,
            responses,
            local_proc: None,
        })
    }

    /// Shared `pre_launch` work: reset, register with the response channel,
    /// resolve the kernel user, enforce authorization, finalize env
    pub fn pre_launch(&mut self, env: &mut HashMap<String, String>) -> Result<(), ProvisionerError> {
        self.state.reset();
        self.local_proc = None;
        self.responses.register_event(&self.kernel_id);

        let username = env
            .get("KERNEL_USERNAME")
            .cloned()
            .unwrap_or_else(whoami::username);
        env.insert("KERNEL_USERNAME".to_string(), username.clone());
        self.state.kernel_username = username;

        self.enforce_authorization()?;

        env.insert("KERNEL_ID".to_string(), self.kernel_id.to_string());
        for key in ENV_POP_LIST {
            env.remove(key);
        }

        Ok(())
    }

    /// Compare the kernel user against the configured allow/deny sets
    fn enforce_authorization(&self) -> Result<(), ProvisionerError> {
        let user = &self.state.kernel_username;

        if self.config.unauthorized_users.contains(user) {
            return Err(self.log_error(ProvisionerError::NotAuthorized {
                user: user.clone(),
                reason: "not authorized".to_string(),
            }));
        }

        if !self.config.authorized_users.is_empty() && !self.config.authorized_users.contains(user)
        {
            return Err(self.log_error(ProvisionerError::NotAuthorized {
                user: user.clone(),
                reason: "not in the set of users authorized".to_string(),
            }));
        }

        Ok(())
    }

    /// Spawn the launch command in its own process group and record its
    /// identity
    pub fn launch_process(
        &mut self,
        cmd: &[String],
        env: &HashMap<String, String>,
    ) -> Result<(), ProvisionerError> {
        let (program, args) = cmd.split_first().ok_or_else(|| {
            ProvisionerError::Config(ConfigError::Invalid("empty launch command".to_string()))
        })?;

        let mut command = std::process::Command::new(program);
        command.args(args).envs(env);
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // New process group so group signals reach the whole launcher tree.
            command.process_group(0);
        }

        let child = tokio::process::Command::from(command).spawn()?;
        let pid = child.id().map(|id| id as i32).unwrap_or(0);
        self.state.pid = pid;
        self.state.pgid = pid; // group leader
        self.state.ip = Some("127.0.0.1".to_string());
        self.local_proc = Some(child);

        Ok(())
    }

    /// Check whether the locally-spawned launch process has already
    /// faulted, returning the failure message if so
    ///
    /// Turns local launch failures into fast, diagnosable errors instead of
    /// a full timeout wait. Only applies while a local handle is tracked.
    pub fn detect_launch_failure(&mut self) -> Option<String> {
        let child = self.local_proc.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) if !status.success() => {
                self.local_proc = None;
                Some(format!(
                    "launch process exited prematurely ({}); check the server log for more information",
                    status
                ))
            }
            _ => None,
        }
    }

    /// A fresh confirmation engine for this kernel's deadline/poll settings
    pub fn confirmation_engine(&self) -> ConfirmationEngine {
        ConfirmationEngine::new(
            self.kernel_id.clone(),
            self.config.launch_timeout,
            self.config.poll_interval,
        )
    }

    /// Record a received connection payload: tunnel or register the ports,
    /// extract process identity, and merge into `connection_info`
    pub async fn setup_connection_info(
        &mut self,
        mut info: ConnectionInfo,
    ) -> Result<(), ProvisionerError> {
        let assigned_ip = self.state.assigned_ip.clone().unwrap_or_default();
        tracing::debug!(
            kernel_id = %self.kernel_id,
            "Host assigned to the kernel is: '{}' '{}'",
            self.state.assigned_host,
            assigned_ip
        );

        // Connection targets the host the kernel actually started on.
        info.ip = assigned_ip.clone();

        if self.config.tunneling_enabled {
            // Keep the remote-side ports before tunnels rewrite them.
            self.state.tunneled_connection_info = Some(to_map(&info));

            let local_ports = self.tunnels.tunnel_to_kernel(&info, &assigned_ip).await?;
            tracing::debug!(
                kernel_id = %self.kernel_id,
                "Local ports used to create SSH tunnels: {:?}",
                local_ports
            );
            info.ip = "127.0.0.1".to_string();
            info.set_channel_ports(local_ports);

            if let Some(remote_comm_port) = info.comm_port {
                let local_comm_port = self.tunnels.tunnel_to_port(
                    KernelChannel::Communication,
                    &assigned_ip,
                    remote_comm_port,
                    &assigned_ip,
                )?;
                self.state.comm_ip = Some(info.ip.clone());
                self.state.comm_port = local_comm_port;
                info.comm_port = Some(local_comm_port);
                tracing::debug!(
                    kernel_id = %self.kernel_id,
                    "Established communication to {}:{} via tunneled port 127.0.0.1:{}",
                    assigned_ip,
                    remote_comm_port,
                    local_comm_port
                );
            }
        } else if let Some(comm_port) = info.comm_port {
            self.state.comm_ip = Some(info.ip.clone());
            self.state.comm_port = comm_port;
            tracing::debug!(
                kernel_id = %self.kernel_id,
                "Established communication to {}:{}",
                assigned_ip,
                comm_port
            );
        }

        if info.comm_port.is_none() {
            tracing::debug!(
                kernel_id = %self.kernel_id,
                "Communication port has NOT been established (optional)"
            );
        }

        self.update_connection(info);
        Ok(())
    }

    /// Merge the payload into `connection_info`, pulling out pid/pgid for
    /// lifecycle management
    fn update_connection(&mut self, mut info: ConnectionInfo) {
        let (pid, pgid) = info.take_pid_info(&self.kernel_id);
        if let Some(pid) = pid {
            self.state.pid = pid;
        }
        if let Some(pgid) = pgid {
            self.state.pgid = pgid;
        }
        if pid.is_some() || pgid.is_some() {
            // The payload reveals the true process identity; point at the
            // assigned host and stop using the local handle if it's remote.
            self.state.ip = self.state.assigned_ip.clone();
            let remote = self
                .state
                .assigned_ip
                .as_deref()
                .map(|ip| !ip_is_local(ip))
                .unwrap_or(false);
            if remote {
                self.local_proc = None;
            }
        }

        tracing::debug!(
            kernel_id = %self.kernel_id,
            "Received connection info from host '{}'",
            self.state.assigned_host
        );
        self.state.connection_info.append(&mut to_map(&info));
    }

    /// Build a signal dispatcher reflecting the current delivery paths
    pub fn dispatcher(&self) -> SignalDispatcher {
        SignalDispatcher::new(
            self.kernel_id.clone(),
            self.state.comm_ip.clone(),
            self.state.comm_port,
            self.state.pid,
            self.state.pgid,
            self.local_proc.is_some(),
            self.config.socket_timeout,
        )
    }

    /// Tiered signal delivery (listener, group, direct)
    pub async fn send_signal(&self, signum: i32) -> SignalOutcome {
        self.dispatcher().send_signal(signum).await
    }

    /// Instruct the launcher listener to shut down, then drop its tunnel
    ///
    /// The tunnel is terminated even when the shutdown request fails:
    /// leaving it alive keeps the launcher looking alive after the kernel
    /// has stopped, which defeats graceful-termination detection.
    pub async fn shutdown_listener(&mut self) {
        if self.state.comm_port > 0 {
            self.dispatcher().send_shutdown().await;
        }
        self.tunnels.terminate_one(KernelChannel::Communication).await;
    }

    /// Release tunnels and clear connection state
    pub async fn cleanup(&mut self) {
        self.state.assigned_ip = None;
        self.tunnels.terminate_all().await;
        self.state.comm_ip = None;
        self.state.comm_port = 0;
        self.local_proc = None;
    }

    /// Wait on the local handle if one exists; `None` means "no handle,
    /// caller should fall back to polling"
    ///
    /// A signal-terminated child reports a negative exit code carrying the
    /// signal number.
    pub async fn wait_local(&mut self) -> Option<Option<i32>> {
        let child = self.local_proc.as_mut()?;
        let code = child.wait().await.ok().and_then(exit_code);
        self.local_proc = None;
        Some(code)
    }

    /// Base persisted state; variants extend the returned map
    pub fn provisioner_info(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut info = serde_json::Map::new();
        info.insert(
            "assigned_ip".to_string(),
            serde_json::Value::from(self.state.assigned_ip.clone()),
        );
        info.insert(
            "assigned_host".to_string(),
            serde_json::Value::from(self.state.assigned_host.clone()),
        );
        info.insert(
            "comm_ip".to_string(),
            serde_json::Value::from(self.state.comm_ip.clone()),
        );
        info.insert(
            "comm_port".to_string(),
            serde_json::Value::from(self.state.comm_port),
        );
        info
    }

    /// Restore base persisted state
    pub fn load_provisioner_info(&mut self, info: &serde_json::Map<String, serde_json::Value>) {
        if let Some(ip) = info.get("assigned_ip").and_then(|v| v.as_str()) {
            self.state.assigned_ip = Some(ip.to_string());
        }
        if let Some(host) = info.get("assigned_host").and_then(|v| v.as_str()) {
            self.state.assigned_host = host.to_string();
        }
        if let Some(ip) = info.get("comm_ip").and_then(|v| v.as_str()) {
            self.state.comm_ip = Some(ip.to_string());
        }
        if let Some(port) = info.get("comm_port").and_then(|v| v.as_u64()) {
            self.state.comm_port = port as u16;
        }
    }

    /// Log a fatal error with kernel context before surfacing it
    pub fn log_error(&self, error: ProvisionerError) -> ProvisionerError {
        tracing::error!(kernel_id = %self.kernel_id, "{}", error);
        error
    }
}

/// Whether `ip` refers to this host
pub fn ip_is_local(ip: &str) -> bool {
    if ip == "127.0.0.1" || ip == "::1" || ip.eq_ignore_ascii_case("localhost") {
        return true;
    }
    gethostname::gethostname()
        .to_string_lossy()
        .eq_ignore_ascii_case(ip)
}

fn exit_code(status: std::process::ExitStatus) -> Option<i32> {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status.code().or_else(|| status.signal().map(|sig| -sig))
    }
    #[cfg(not(unix))]
    {
        status.code()
    }
}

fn to_map(info: &ConnectionInfo) -> serde_json::Map<String, serde_json::Value> {
    match serde_json::to_value(info) {
        Ok(serde_json::Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::ResponseError;

    struct NullResponses;

    #[async_trait]
    impl ResponseChannel for NullResponses {
        fn register_event(&self, _kernel_id: &KernelId) {}

        async fn get_connection_info(
            &self,
            _kernel_id: &KernelId,
        ) -> Result<ConnectionInfo, ResponseError> {
            Err(ResponseError::Timeout)
        }
    }

    fn core_with(config: ProvisionerConfig) -> ProvisionerCore {
        ProvisionerCore::new(KernelId::new("test-kernel"), config, Arc::new(NullResponses))
            .unwrap()
    }

    #[test]
    fn test_construction_rejects_bad_port_range() {
        let config = ProvisionerConfig {
            port_range: "2000..2500".to_string(),
            ..Default::default()
        };
        let result = ProvisionerCore::new(
            KernelId::new("test-kernel"),
            config,
            Arc::new(NullResponses),
        );
        assert!(matches!(result, Err(ProvisionerError::Config(_))));
    }

    #[test]
    fn test_pre_launch_denies_unauthorized_user() {
        let mut core = core_with(ProvisionerConfig::default());
        let mut env = HashMap::from([("KERNEL_USERNAME".to_string(), "root".to_string())]);

        let result = core.pre_launch(&mut env);
        assert!(matches!(result, Err(ProvisionerError::NotAuthorized { .. })));
    }

    #[test]
    fn test_pre_launch_enforces_authorized_set() {
        let config = ProvisionerConfig {
            authorized_users: ["alice".to_string()].into_iter().collect(),
            ..Default::default()
        };
        let mut core = core_with(config);

        let mut env = HashMap::from([("KERNEL_USERNAME".to_string(), "mallory".to_string())]);
        assert!(matches!(
            core.pre_launch(&mut env),
            Err(ProvisionerError::NotAuthorized { .. })
        ));

        let mut env = HashMap::from([("KERNEL_USERNAME".to_string(), "alice".to_string())]);
        assert!(core.pre_launch(&mut env).is_ok());
    }

    #[test]
    fn test_pre_launch_finalizes_env() {
        let mut core = core_with(ProvisionerConfig {
            unauthorized_users: Default::default(),
            ..Default::default()
        });
        let mut env = HashMap::from([
            ("RP_REMOTE_PWD".to_string(), "hunter2".to_string()),
            ("LS_COLORS".to_string(), "di=34".to_string()),
        ]);

        core.pre_launch(&mut env).unwrap();

        assert_eq!(env.get("KERNEL_ID").unwrap(), "test-kernel");
        assert!(env.contains_key("KERNEL_USERNAME"));
        assert!(!env.contains_key("RP_REMOTE_PWD"));
        assert!(!env.contains_key("LS_COLORS"));
    }

    #[tokio::test]
    async fn test_setup_connection_info_without_tunneling() {
        let mut core = core_with(ProvisionerConfig::default());
        core.state.assigned_host = "node-1".to_string();
        core.state.assigned_ip = Some("10.0.0.5".to_string());

        let info = ConnectionInfo {
            ip: "0.0.0.0".to_string(),
            shell_port: 4001,
            iopub_port: 4002,
            stdin_port: 4003,
            hb_port: 4004,
            control_port: 4005,
            comm_port: Some(4006),
            ..Default::default()
        };
        core.setup_connection_info(info).await.unwrap();

        assert_eq!(core.state.connection_info["ip"], "10.0.0.5");
        assert_eq!(core.state.connection_info["shell_port"], 4001);
        assert_eq!(core.state.comm_port, 4006);
        assert_eq!(core.state.comm_ip.as_deref(), Some("10.0.0.5"));
    }

    #[tokio::test]
    async fn test_remote_pid_releases_local_handle() {
        let mut core = core_with(ProvisionerConfig::default());
        core.state.assigned_host = "node-1".to_string();
        core.state.assigned_ip = Some("10.0.0.5".to_string());
        core.local_proc = Some(
            tokio::process::Command::new("sleep")
                .arg("30")
                .kill_on_drop(true)
                .spawn()
                .unwrap(),
        );

        let info = ConnectionInfo {
            ip: "0.0.0.0".to_string(),
            pid: Some(serde_json::json!("7777")),
            pgid: Some(serde_json::json!(7777)),
            ..Default::default()
        };
        core.setup_connection_info(info).await.unwrap();

        assert_eq!(core.state.pid, 7777);
        assert_eq!(core.state.pgid, 7777);
        assert!(core.local_proc.is_none());
        // pid/pgid do not leak into the merged connection info
        assert!(!core.state.connection_info.contains_key("pid"));
        assert!(!core.state.connection_info.contains_key("pgid"));
    }

    #[test]
    fn test_provisioner_info_roundtrip() {
        let mut core = core_with(ProvisionerConfig::default());
        core.state.assigned_ip = Some("10.0.0.5".to_string());
        core.state.assigned_host = "node-1".to_string();
        core.state.comm_port = 6007;
        core.state.comm_ip = Some("10.0.0.5".to_string());

        let info = core.provisioner_info();

        let mut restored = core_with(ProvisionerConfig::default());
        restored.load_provisioner_info(&info);
        assert_eq!(restored.state.assigned_ip.as_deref(), Some("10.0.0.5"));
        assert_eq!(restored.state.assigned_host, "node-1");
        assert_eq!(restored.state.comm_port, 6007);
    }

    #[test]
    fn test_ip_is_local() {
        assert!(ip_is_local("127.0.0.1"));
        assert!(ip_is_local("localhost"));
        assert!(!ip_is_local("10.0.0.5"));
    }

    /// A core whose tunnel children are `echo` processes instead of real
    /// SSH clients, so tunnel bookkeeping can run without a reachable host
    fn tunneling_core() -> ProvisionerCore {
        let config = ProvisionerConfig {
            tunneling_enabled: true,
            ..Default::default()
        };
        let mut core = core_with(config.clone());
        core.tunnels = TunnelManager::with_ssh_executable(&config, "echo").unwrap();
        core.state.assigned_host = "node-1".to_string();
        core.state.assigned_ip = Some("10.0.0.5".to_string());
        core
    }

    fn remote_info(comm_port: Option<u16>) -> ConnectionInfo {
        ConnectionInfo {
            ip: "0.0.0.0".to_string(),
            shell_port: 4001,
            iopub_port: 4002,
            stdin_port: 4003,
            hb_port: 4004,
            control_port: 4005,
            comm_port,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_tunneling_rewrites_ip_and_ports() {
        let mut core = tunneling_core();
        core.setup_connection_info(remote_info(None)).await.unwrap();

        assert_eq!(core.state.connection_info["ip"], "127.0.0.1");

        // Five distinct locally-bound ports, one tracked tunnel per channel.
        let ports: std::collections::HashSet<u64> =
            ["shell_port", "iopub_port", "stdin_port", "hb_port", "control_port"]
                .iter()
                .map(|key| core.state.connection_info[*key].as_u64().unwrap())
                .collect();
        assert_eq!(ports.len(), 5);
        assert!(ports.iter().all(|port| *port > 0));
        assert_eq!(core.tunnels.len(), 5);
        for channel in KernelChannel::STANDARD {
            assert!(core.tunnels.contains(channel));
        }

        // The remote-side ports survive in the pre-tunnel capture.
        let remote = core.state.tunneled_connection_info.as_ref().unwrap();
        assert_eq!(remote["shell_port"], 4001);
        assert_eq!(remote["ip"], "10.0.0.5");
    }

    #[tokio::test]
    async fn test_tunneling_re_tunnels_comm_port() {
        let mut core = tunneling_core();
        core.setup_connection_info(remote_info(Some(4006)))
            .await
            .unwrap();

        assert_eq!(core.tunnels.len(), 6);
        assert!(core.tunnels.contains(KernelChannel::Communication));
        assert_eq!(core.state.comm_ip.as_deref(), Some("127.0.0.1"));
        assert!(core.state.comm_port > 0);
        assert_eq!(
            core.state.connection_info["comm_port"].as_u64().unwrap(),
            u64::from(core.state.comm_port)
        );
    }

    #[tokio::test]
    async fn test_shutdown_listener_drops_comm_tunnel_when_refused() {
        let mut core = tunneling_core();
        core.tunnels
            .tunnel_to_port(KernelChannel::Communication, "10.0.0.5", 4006, "10.0.0.5")
            .unwrap();
        assert!(core.tunnels.contains(KernelChannel::Communication));

        // Point the listener address at a freshly-closed port so the
        // shutdown request is refused.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        core.state.comm_ip = Some("127.0.0.1".to_string());
        core.state.comm_port = port;

        core.shutdown_listener().await;
        assert!(!core.tunnels.contains(KernelChannel::Communication));
        assert!(core.tunnels.is_empty());
    }
}
