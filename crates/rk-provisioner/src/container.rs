//! Container-backed kernel provisioner
//!
//! The kernel runs inside a container managed by an external runtime
//! (injected behind [`ContainerRuntime`]). The launch command only submits
//! the container; liveness and teardown go through the runtime, and signals
//! go through the in-band listener since there is no OS process to target.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;

use rk_core::{KernelId, ProvisionerConfig, ProvisionerError};

use crate::confirm::{ConfirmOutcome, KernelStatus, StartupProbe};
use crate::provisioner::{KernelProvisioner, ProvisionerCore};
use crate::response::ResponseChannel;
use crate::signal::SIGKILL;

/// jovyan user, the conventional notebook default
const DEFAULT_KERNEL_UID: &str = "1000";
/// users group
const DEFAULT_KERNEL_GID: &str = "100";

/// A point-in-time view of the kernel's container
#[derive(Debug, Clone)]
pub struct ContainerStatus {
    /// Runtime-assigned container (or pod) name
    pub name: String,
    /// Runtime-specific phase string, compared against
    /// [`ContainerRuntime::initial_states`]
    pub phase: String,
    /// Container IP, present once the container is reachable
    pub pod_ip: Option<String>,
    /// IP of the node hosting the container
    pub host_ip: Option<String>,
}

/// Seam to the container manager (Kubernetes, Docker, ...)
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Phases indicating the container is starting or running
    fn initial_states(&self) -> HashSet<String>;

    /// Locate the kernel's container, `None` when it cannot be found
    ///
    /// `iteration` is set during startup confirmation so implementations can
    /// keep their logging readable across repeated queries.
    async fn container_status(
        &self,
        kernel_id: &KernelId,
        iteration: Option<u32>,
    ) -> Option<ContainerStatus>;

    /// Tear down every artifact created for the container's lifetime,
    /// returning whether the teardown succeeded
    async fn terminate_container_resources(&self, kernel_id: &KernelId, restart: bool) -> bool;
}

/// Kernel provisioner backed by a managed container
pub struct ContainerProvisioner {
    core: ProvisionerCore,
    runtime: Arc<dyn ContainerRuntime>,
    container_name: Option<String>,
    assigned_node_ip: Option<String>,
}

impl ContainerProvisioner {
    pub fn new(
        kernel_id: KernelId,
        config: ProvisionerConfig,
        responses: Arc<dyn ResponseChannel>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Result<Self, ProvisionerError> {
        Ok(Self {
            core: ProvisionerCore::new(kernel_id, config, responses)?,
            runtime,
            container_name: None,
            assigned_node_ip: None,
        })
    }

    /// Runtime-assigned container name, once observed
    pub fn container_name(&self) -> Option<&str> {
        self.container_name.as_deref()
    }

    /// Determine the container uid/gid and refuse prohibited values
    ///
    /// The resolved values are written back to the env so launchers see them
    /// even when they came from defaults.
    fn enforce_prohibited_ids(
        &self,
        env: &mut HashMap<String, String>,
    ) -> Result<(), ProvisionerError> {
        let kernel_uid = env
            .get("KERNEL_UID")
            .cloned()
            .unwrap_or_else(|| DEFAULT_KERNEL_UID.to_string());
        let kernel_gid = env
            .get("KERNEL_GID")
            .cloned()
            .unwrap_or_else(|| DEFAULT_KERNEL_GID.to_string());

        if self.core.config.prohibited_uids.contains(&kernel_uid) {
            return Err(self.core.log_error(ProvisionerError::NotAuthorized {
                user: self.core.state.kernel_username.clone(),
                reason: format!("using the prohibited kernel UID '{}' and is not permitted", kernel_uid),
            }));
        }
        if self.core.config.prohibited_gids.contains(&kernel_gid) {
            return Err(self.core.log_error(ProvisionerError::NotAuthorized {
                user: self.core.state.kernel_username.clone(),
                reason: format!("using the prohibited kernel GID '{}' and is not permitted", kernel_gid),
            }));
        }

        env.insert("KERNEL_UID".to_string(), kernel_uid);
        env.insert("KERNEL_GID".to_string(), kernel_gid);
        Ok(())
    }
}

#[async_trait]
impl KernelProvisioner for ContainerProvisioner {
    fn kernel_id(&self) -> &KernelId {
        &self.core.kernel_id
    }

    fn has_process(&self) -> bool {
        self.container_name.is_some()
    }

    fn connection_info(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.core.state.connection_info
    }

    async fn pre_launch(
        &mut self,
        env: &mut HashMap<String, String>,
    ) -> Result<(), ProvisionerError> {
        self.core.pre_launch(env)?;
        self.container_name = None;
        self.assigned_node_ip = None;

        if let Some(image) = &self.core.config.image_name {
            env.insert("KERNEL_IMAGE".to_string(), image.clone());
        }

        self.enforce_prohibited_ids(env)
    }

    async fn launch_kernel(
        &mut self,
        cmd: &[String],
        env: &HashMap<String, String>,
    ) -> Result<(), ProvisionerError> {
        // The launch process only submits the container to the runtime.
        self.core.launch_process(cmd, env)?;
        tracing::info!(
            kernel_id = %self.core.kernel_id,
            "Kernel container launched. Kernel image: {:?}, cmd: {:?}",
            self.core.config.image_name,
            cmd
        );

        self.confirm_remote_startup().await
    }

    async fn confirm_remote_startup(&mut self) -> Result<(), ProvisionerError> {
        let mut engine = self.core.confirmation_engine();
        let responses = Arc::clone(&self.core.responses);

        let outcome = {
            let mut probe = ContainerProbe {
                core: &mut self.core,
                runtime: Arc::clone(&self.runtime),
                container_name: &mut self.container_name,
                assigned_node_ip: &mut self.assigned_node_ip,
            };
            engine.run(&mut probe, responses.as_ref()).await
        };

        match outcome {
            ConfirmOutcome::Confirmed(info) => {
                self.core.setup_connection_info(*info).await?;
                // Signals never target an OS process from here; they go
                // through the listener or the runtime.
                self.core.state.pid = 0;
                self.core.state.pgid = 0;
                self.core.local_proc = None;
                Ok(())
            }
            ConfirmOutcome::TimedOut { waited } => {
                tracing::warn!(
                    kernel_id = %self.core.kernel_id,
                    "Startup was not confirmed within {:.1}s - terminating container",
                    waited.as_secs_f64()
                );
                self.kill(false).await?;
                Err(self.core.log_error(ProvisionerError::LaunchTimeout {
                    kernel_id: self.core.kernel_id.clone(),
                    timeout_secs: self.core.config.launch_timeout.as_secs(),
                }))
            }
            ConfirmOutcome::Faulted { message } => {
                Err(self.core.log_error(ProvisionerError::LaunchFault {
                    kernel_id: self.core.kernel_id.clone(),
                    message,
                }))
            }
            ConfirmOutcome::ResponseFailure { message } => {
                Err(self.core.log_error(ProvisionerError::Response {
                    kernel_id: self.core.kernel_id.clone(),
                    host: self.core.state.assigned_host.clone(),
                    message,
                }))
            }
        }
    }

    /// Containers take a while to be scheduled, so an absent status or an
    /// initial phase is treated as "still alive".
    async fn poll(&mut self) -> Option<i32> {
        let status = self
            .runtime
            .container_status(&self.core.kernel_id, None)
            .await;
        match status {
            None => None,
            Some(status) if self.runtime.initial_states().contains(&status.phase) => None,
            Some(_) => Some(0),
        }
    }

    async fn wait(&mut self) -> Option<i32> {
        if let Some(code) = self.core.wait_local().await {
            return code;
        }

        for _ in 0..self.core.config.max_poll_attempts {
            if let Some(code) = self.poll().await {
                return Some(code);
            }
            tokio::time::sleep(self.core.config.poll_interval).await;
        }
        tracing::warn!(
            kernel_id = %self.core.kernel_id,
            "Wait timeout of {} polls exceeded - continuing",
            self.core.config.max_poll_attempts
        );
        None
    }

    async fn send_signal(&mut self, signum: i32) -> Result<(), ProvisionerError> {
        match signum {
            0 => {
                self.poll().await;
                Ok(())
            }
            SIGKILL => self.kill(false).await,
            _ => {
                // Most likely an interrupt; delivered via the listener.
                self.core.send_signal(signum).await;
                Ok(())
            }
        }
    }

    async fn kill(&mut self, restart: bool) -> Result<(), ProvisionerError> {
        if self.container_name.is_some() {
            self.runtime
                .terminate_container_resources(&self.core.kernel_id, restart)
                .await;
        }
        Ok(())
    }

    /// No catchable/forced distinction exists for containers; defers to
    /// `kill`.
    async fn terminate(&mut self, restart: bool) -> Result<(), ProvisionerError> {
        self.kill(restart).await
    }

    async fn cleanup(&mut self, restart: bool) -> Result<(), ProvisionerError> {
        // Container artifacts don't necessarily go away on their own, so
        // cleanup performs the same teardown as a forced kill.
        self.kill(restart).await?;
        self.core.cleanup().await;
        Ok(())
    }

    async fn shutdown_requested(&mut self) -> Result<(), ProvisionerError> {
        self.core.shutdown_listener().await;
        Ok(())
    }

    fn get_provisioner_info(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut info = self.core.provisioner_info();
        info.insert(
            "assigned_node_ip".to_string(),
            serde_json::Value::from(self.assigned_node_ip.clone()),
        );
        info
    }

    fn load_provisioner_info(&mut self, info: &serde_json::Map<String, serde_json::Value>) {
        self.core.load_provisioner_info(info);
        if let Some(ip) = info.get("assigned_node_ip").and_then(|v| v.as_str()) {
            self.assigned_node_ip = Some(ip.to_string());
        }
    }
}

/// Startup probe backed by the container runtime
///
/// Records the container name and host assignment as they become known. An
/// absent container falls back to checking the local launch process for a
/// premature exit.
struct ContainerProbe<'a> {
    core: &'a mut ProvisionerCore,
    runtime: Arc<dyn ContainerRuntime>,
    container_name: &'a mut Option<String>,
    assigned_node_ip: &'a mut Option<String>,
}

#[async_trait]
impl StartupProbe for ContainerProbe<'_> {
    async fn query_status(&mut self, iteration: u32) -> KernelStatus {
        let status = self
            .runtime
            .container_status(&self.core.kernel_id, Some(iteration))
            .await;

        let Some(status) = status else {
            if let Some(message) = self.core.detect_launch_failure() {
                return KernelStatus::Faulted(message);
            }
            return KernelStatus::Starting;
        };

        *self.container_name = Some(status.name.clone());
        if self.core.state.assigned_host.is_empty() {
            if let Some(pod_ip) = status.pod_ip {
                self.core.state.assigned_ip = Some(pod_ip);
                self.core.state.assigned_host = status.name;
                *self.assigned_node_ip = status.host_ip;
            }
        }

        let host = &self.core.state.assigned_host;
        KernelStatus::Active {
            assigned_host: (!host.is_empty()).then(|| host.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use crate::response::{ConnectionInfo, ResponseError};

    struct ImmediateResponses;

    #[async_trait]
    impl ResponseChannel for ImmediateResponses {
        fn register_event(&self, _kernel_id: &KernelId) {}

        async fn get_connection_info(
            &self,
            _kernel_id: &KernelId,
        ) -> Result<ConnectionInfo, ResponseError> {
            Ok(ConnectionInfo {
                ip: "0.0.0.0".to_string(),
                shell_port: 5001,
                iopub_port: 5002,
                stdin_port: 5003,
                hb_port: 5004,
                control_port: 5005,
                pid: Some(serde_json::json!(4242)),
                pgid: Some(serde_json::json!(4242)),
                ..Default::default()
            })
        }
    }

    struct SilentResponses;

    #[async_trait]
    impl ResponseChannel for SilentResponses {
        fn register_event(&self, _kernel_id: &KernelId) {}

        async fn get_connection_info(
            &self,
            _kernel_id: &KernelId,
        ) -> Result<ConnectionInfo, ResponseError> {
            Err(ResponseError::Timeout)
        }
    }

    /// Runtime whose container is always running at a fixed pod IP
    struct RunningRuntime {
        terminations: AtomicU32,
    }

    impl RunningRuntime {
        fn new() -> Self {
            Self {
                terminations: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ContainerRuntime for RunningRuntime {
        fn initial_states(&self) -> HashSet<String> {
            ["pending".to_string(), "running".to_string()].into()
        }

        async fn container_status(
            &self,
            kernel_id: &KernelId,
            _iteration: Option<u32>,
        ) -> Option<ContainerStatus> {
            Some(ContainerStatus {
                name: format!("kernel-{}", kernel_id),
                phase: "running".to_string(),
                pod_ip: Some("10.1.2.3".to_string()),
                host_ip: Some("192.168.1.10".to_string()),
            })
        }

        async fn terminate_container_resources(
            &self,
            _kernel_id: &KernelId,
            _restart: bool,
        ) -> bool {
            self.terminations.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    /// Runtime that never finds a container
    struct AbsentRuntime;

    #[async_trait]
    impl ContainerRuntime for AbsentRuntime {
        fn initial_states(&self) -> HashSet<String> {
            ["pending".to_string(), "running".to_string()].into()
        }

        async fn container_status(
            &self,
            _kernel_id: &KernelId,
            _iteration: Option<u32>,
        ) -> Option<ContainerStatus> {
            None
        }

        async fn terminate_container_resources(
            &self,
            _kernel_id: &KernelId,
            _restart: bool,
        ) -> bool {
            false
        }
    }

    fn fast_config() -> ProvisionerConfig {
        ProvisionerConfig {
            poll_interval: Duration::from_millis(10),
            launch_timeout: Duration::from_secs(5),
            unauthorized_users: Default::default(),
            ..Default::default()
        }
    }

    fn provisioner(
        config: ProvisionerConfig,
        responses: Arc<dyn ResponseChannel>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> ContainerProvisioner {
        ContainerProvisioner::new(KernelId::new("test-kernel"), config, responses, runtime)
            .unwrap()
    }

    #[tokio::test]
    async fn test_prohibited_uid_denied() {
        let mut p = provisioner(
            fast_config(),
            Arc::new(SilentResponses),
            Arc::new(AbsentRuntime),
        );
        let mut env = HashMap::from([("KERNEL_UID".to_string(), "0".to_string())]);
        assert!(matches!(
            p.pre_launch(&mut env).await,
            Err(ProvisionerError::NotAuthorized { .. })
        ));
    }

    #[tokio::test]
    async fn test_prohibited_gid_denied() {
        let mut p = provisioner(
            fast_config(),
            Arc::new(SilentResponses),
            Arc::new(AbsentRuntime),
        );
        let mut env = HashMap::from([("KERNEL_GID".to_string(), "0".to_string())]);
        assert!(matches!(
            p.pre_launch(&mut env).await,
            Err(ProvisionerError::NotAuthorized { .. })
        ));
    }

    #[tokio::test]
    async fn test_uid_gid_defaults_written_back() {
        let config = ProvisionerConfig {
            image_name: Some("example/kernel:latest".to_string()),
            ..fast_config()
        };
        let mut p = provisioner(config, Arc::new(SilentResponses), Arc::new(AbsentRuntime));
        let mut env = HashMap::new();
        p.pre_launch(&mut env).await.unwrap();

        assert_eq!(env.get("KERNEL_UID").unwrap(), "1000");
        assert_eq!(env.get("KERNEL_GID").unwrap(), "100");
        assert_eq!(env.get("KERNEL_IMAGE").unwrap(), "example/kernel:latest");
    }

    #[tokio::test]
    async fn test_confirm_records_assignment_and_zeroes_pid() {
        let mut p = provisioner(
            fast_config(),
            Arc::new(ImmediateResponses),
            Arc::new(RunningRuntime::new()),
        );
        let mut env = HashMap::new();
        p.pre_launch(&mut env).await.unwrap();

        let cmd = vec!["sleep".to_string(), "30".to_string()];
        p.launch_kernel(&cmd, &env).await.unwrap();

        assert_eq!(p.container_name(), Some("kernel-test-kernel"));
        assert_eq!(p.connection_info()["ip"], "10.1.2.3");
        // Despite the payload reporting pid info, containers are never
        // signaled as OS processes from here.
        assert_eq!(p.core.state.pid, 0);
        assert_eq!(p.core.state.pgid, 0);
        assert!(p.core.local_proc.is_none());

        let info = p.get_provisioner_info();
        assert_eq!(info["assigned_node_ip"], "192.168.1.10");

        p.cleanup(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_terminates_exactly_once() {
        let runtime = Arc::new(RunningRuntime::new());
        let config = ProvisionerConfig {
            launch_timeout: Duration::from_millis(300),
            ..fast_config()
        };
        let mut p = provisioner(config, Arc::new(SilentResponses), Arc::clone(&runtime) as _);
        let mut env = HashMap::new();
        p.pre_launch(&mut env).await.unwrap();

        let cmd = vec!["sleep".to_string(), "30".to_string()];
        let result = p.launch_kernel(&cmd, &env).await;

        assert!(matches!(result, Err(ProvisionerError::LaunchTimeout { .. })));
        assert_eq!(runtime.terminations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_poll_and_terminate_semantics() {
        let runtime = Arc::new(RunningRuntime::new());
        let mut p = provisioner(
            fast_config(),
            Arc::new(SilentResponses),
            Arc::clone(&runtime) as _,
        );

        // Running phase means alive.
        assert_eq!(p.poll().await, None);

        // terminate defers to kill, which only acts once a container is
        // known.
        p.terminate(false).await.unwrap();
        assert_eq!(runtime.terminations.load(Ordering::SeqCst), 0);

        p.container_name = Some("kernel-test-kernel".to_string());
        p.terminate(false).await.unwrap();
        p.kill(false).await.unwrap();
        assert_eq!(runtime.terminations.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_absent_container_is_alive_while_launching() {
        let mut p = provisioner(
            fast_config(),
            Arc::new(SilentResponses),
            Arc::new(AbsentRuntime),
        );
        assert_eq!(p.poll().await, None);
    }
}
