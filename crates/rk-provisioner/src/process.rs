//! Process-backed kernel provisioner
//!
//! Launches the kernel via a local launch process (which may itself hand off
//! to a remote host) and manages its lifecycle through the shared core. The
//! launch process is spawned in its own process group so group signals reach
//! the whole launcher tree.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use rk_core::{KernelId, ProvisionerConfig, ProvisionerError};

use crate::confirm::{ConfirmOutcome, KernelStatus, StartupProbe};
use crate::listener::{send_listener_request, ListenerRequest, ListenerSendResult};
use crate::provisioner::{KernelProvisioner, ProvisionerCore};
use crate::response::ResponseChannel;
use crate::signal::{SIGKILL, SIGTERM};

/// Kernel provisioner backed by an OS process
pub struct ProcessProvisioner {
    core: ProvisionerCore,
    /// Target host for the kernel; `None` means this host
    remote_host: Option<String>,
}

impl ProcessProvisioner {
    pub fn new(
        kernel_id: KernelId,
        config: ProvisionerConfig,
        responses: Arc<dyn ResponseChannel>,
        remote_host: Option<String>,
    ) -> Result<Self, ProvisionerError> {
        Ok(Self {
            core: ProvisionerCore::new(kernel_id, config, responses)?,
            remote_host,
        })
    }

    /// Liveness check via the in-band listener, when one is established
    ///
    /// `Some(None)` means alive, `Some(Some(code))` means gone, `None` means
    /// the listener could not answer and the caller should try other means.
    async fn probe_listener(&self) -> Option<Option<i32>> {
        let port = self.core.state.comm_port;
        if port == 0 {
            return None;
        }
        let ip = self.core.state.comm_ip.as_deref()?;

        let request = ListenerRequest::Signal { signum: 0 };
        match send_listener_request(ip, port, &request, self.core.config.socket_timeout, false)
            .await
        {
            ListenerSendResult::Sent => Some(None),
            ListenerSendResult::Refused => Some(Some(0)),
            ListenerSendResult::Failed(_) => None,
        }
    }

    /// Kill the underlying process and reap the local handle if one exists
    async fn kill_process(&mut self) {
        self.core.dispatcher().signal_process(SIGKILL);
        if let Some(child) = self.core.local_proc.as_mut() {
            let _ = child.start_kill();
            let _ = child.wait().await;
            self.core.local_proc = None;
        }
    }
}

#[async_trait]
impl KernelProvisioner for ProcessProvisioner {
    fn kernel_id(&self) -> &KernelId {
        &self.core.kernel_id
    }

    fn has_process(&self) -> bool {
        self.core.local_proc.is_some()
            || self.core.state.pid > 0
            || self.core.state.comm_port > 0
    }

    fn connection_info(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.core.state.connection_info
    }

    async fn pre_launch(
        &mut self,
        env: &mut HashMap<String, String>,
    ) -> Result<(), ProvisionerError> {
        self.core.pre_launch(env)
    }

    async fn launch_kernel(
        &mut self,
        cmd: &[String],
        env: &HashMap<String, String>,
    ) -> Result<(), ProvisionerError> {
        match &self.remote_host {
            Some(host) => {
                self.core.state.assigned_host = host.clone();
                self.core.state.assigned_ip = Some(host.clone());
            }
            None => {
                self.core.state.assigned_host =
                    gethostname::gethostname().to_string_lossy().into_owned();
                self.core.state.assigned_ip = Some("127.0.0.1".to_string());
            }
        }

        self.core.launch_process(cmd, env)?;
        tracing::info!(
            kernel_id = %self.core.kernel_id,
            "Launched kernel on '{}', pid: {}",
            self.core.state.assigned_host,
            self.core.state.pid
        );

        self.confirm_remote_startup().await
    }

    async fn confirm_remote_startup(&mut self) -> Result<(), ProvisionerError> {
        let mut engine = self.core.confirmation_engine();
        let responses = Arc::clone(&self.core.responses);

        let outcome = {
            let mut probe = LaunchProcessProbe {
                core: &mut self.core,
            };
            engine.run(&mut probe, responses.as_ref()).await
        };

        match outcome {
            ConfirmOutcome::Confirmed(info) => self.core.setup_connection_info(*info).await,
            ConfirmOutcome::TimedOut { waited } => {
                tracing::warn!(
                    kernel_id = %self.core.kernel_id,
                    "Startup was not confirmed within {:.1}s - killing kernel",
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

    async fn poll(&mut self) -> Option<i32> {
        if let Some(child) = self.core.local_proc.as_mut() {
            return match child.try_wait() {
                Ok(Some(status)) => Some(status.code().unwrap_or(0)),
                Ok(None) => None,
                Err(_) => Some(0),
            };
        }

        if let Some(result) = self.probe_listener().await {
            return result;
        }

        #[cfg(unix)]
        if self.core.state.pid > 0 {
            // SAFETY: signal 0 performs an existence check only.
            let rc = unsafe { libc::kill(self.core.state.pid, 0) };
            return if rc == 0 { None } else { Some(0) };
        }

        Some(0)
    }

    async fn wait(&mut self) -> Option<i32> {
        if let Some(code) = self.core.wait_local().await {
            return code;
        }

        // No local handle; poll until the kernel is observed gone or the
        // attempt budget runs out.
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
                self.core.send_signal(signum).await;
                Ok(())
            }
        }
    }

    async fn kill(&mut self, _restart: bool) -> Result<(), ProvisionerError> {
        if self.has_process() {
            self.kill_process().await;
        }
        Ok(())
    }

    async fn terminate(&mut self, _restart: bool) -> Result<(), ProvisionerError> {
        if self.has_process() {
            self.core.dispatcher().signal_process(SIGTERM);
        }
        Ok(())
    }

    async fn cleanup(&mut self, _restart: bool) -> Result<(), ProvisionerError> {
        self.core.cleanup().await;
        Ok(())
    }

    async fn shutdown_requested(&mut self) -> Result<(), ProvisionerError> {
        self.core.shutdown_listener().await;
        Ok(())
    }

    fn get_provisioner_info(&self) -> serde_json::Map<String, serde_json::Value> {
        self.core.provisioner_info()
    }

    fn load_provisioner_info(&mut self, info: &serde_json::Map<String, serde_json::Value>) {
        self.core.load_provisioner_info(info);
    }
}

/// Startup probe backed by the local launch process
///
/// A premature, non-zero exit of the launch process fails the confirmation
/// immediately instead of waiting out the full deadline.
struct LaunchProcessProbe<'a> {
    core: &'a mut ProvisionerCore,
}

#[async_trait]
impl StartupProbe for LaunchProcessProbe<'_> {
    async fn query_status(&mut self, _iteration: u32) -> KernelStatus {
        if let Some(message) = self.core.detect_launch_failure() {
            return KernelStatus::Faulted(message);
        }
        let host = &self.core.state.assigned_host;
        KernelStatus::Active {
            assigned_host: (!host.is_empty()).then(|| host.clone()),
        }
    }
}
