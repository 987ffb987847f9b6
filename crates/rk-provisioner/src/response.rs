//! Response channel seam and connection payload
//!
//! The secure response channel is an external collaborator: it is the
//! out-of-band, per-kernel-id path over which a launched kernel reports its
//! own connection parameters. Only the trait lives here; implementations
//! are injected (tests use mocks).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use rk_core::KernelId;

/// Errors produced while awaiting a kernel's connection payload
#[derive(Debug, Error)]
pub enum ResponseError {
    /// The bounded per-attempt wait elapsed; the confirmation loop treats
    /// this as "retry", never as fatal.
    #[error("Timed out waiting for connection info")]
    Timeout,

    /// Any other channel failure; fatal to the confirmation run
    #[error("Response channel failure: {0}")]
    Other(String),
}

/// Out-of-band channel over which a kernel reports its connection payload
#[async_trait]
pub trait ResponseChannel: Send + Sync {
    /// Register interest in a kernel's response. Must be called before the
    /// kernel is launched so no payload is dropped.
    fn register_event(&self, kernel_id: &KernelId);

    /// Await the kernel's connection payload with a bounded per-attempt
    /// wait, returning [`ResponseError::Timeout`] when it elapses.
    async fn get_connection_info(
        &self,
        kernel_id: &KernelId,
    ) -> Result<ConnectionInfo, ResponseError>;
}

/// Connection parameters reported by a launched kernel
///
/// `pid`/`pgid` arrive as free-form values (some launchers send strings) and
/// are parsed tolerantly. Any additional payload keys are preserved in
/// `extra` and flow into the merged connection info unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub ip: String,
    pub shell_port: u16,
    pub iopub_port: u16,
    pub stdin_port: u16,
    pub hb_port: u16,
    pub control_port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub comm_port: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pgid: Option<serde_json::Value>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ConnectionInfo {
    /// The five standard channel ports, in channel order
    pub fn channel_ports(&self) -> [u16; 5] {
        [
            self.shell_port,
            self.iopub_port,
            self.stdin_port,
            self.hb_port,
            self.control_port,
        ]
    }

    /// Replace the five standard channel ports, in channel order
    pub fn set_channel_ports(&mut self, ports: [u16; 5]) {
        self.shell_port = ports[0];
        self.iopub_port = ports[1];
        self.stdin_port = ports[2];
        self.hb_port = ports[3];
        self.control_port = ports[4];
    }

    /// Extract pid/pgid from the payload, removing them from it
    ///
    /// Non-integer values are logged and ignored rather than failing the
    /// confirmation.
    pub fn take_pid_info(&mut self, kernel_id: &KernelId) -> (Option<i32>, Option<i32>) {
        let pid = Self::parse_id(self.pid.take(), "pid", kernel_id);
        let pgid = Self::parse_id(self.pgid.take(), "pgid", kernel_id);
        (pid, pgid)
    }

    fn parse_id(
        value: Option<serde_json::Value>,
        field: &str,
        kernel_id: &KernelId,
    ) -> Option<i32> {
        let value = value?;
        let parsed = match &value {
            serde_json::Value::Number(n) => n.as_i64().map(|v| v as i32),
            serde_json::Value::String(s) => s.parse::<i32>().ok(),
            _ => None,
        };
        if parsed.is_none() {
            tracing::warn!(
                kernel_id = %kernel_id,
                "{} returned from kernel launcher is not an integer: {} - ignoring",
                field,
                value
            );
        }
        parsed
    }
}
